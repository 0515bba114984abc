use super::tile::TileId;

/// Query handles per tile.
pub const QUERY_RING_SIZE: usize = 5;
/// Consecutive "nothing visible" results before a tile counts as occluded.
pub const OCCLUSION_THRESHOLD: u32 = 5;

/// Identifies one query handle of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId {
    pub tile: TileId,
    pub slot: usize,
}

impl QueryId {
    /// Flat index into a query set holding `QUERY_RING_SIZE` handles per tile.
    pub fn index(&self) -> u32 {
        (self.tile * QUERY_RING_SIZE + self.slot) as u32
    }
}

/// Fixed ring of query handles with an in-flight bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryRing {
    in_flight: u8,
}

impl QueryRing {
    /// Claims the first free handle, or `None` when all are in flight.
    pub fn acquire(&mut self) -> Option<usize> {
        let slot = (0..QUERY_RING_SIZE).find(|s| self.in_flight & (1 << s) == 0)?;
        self.in_flight |= 1 << slot;
        Some(slot)
    }

    pub fn release(&mut self, slot: usize) {
        self.in_flight &= !(1 << slot);
    }

    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight & (1 << slot) != 0
    }

    pub fn in_flight(&self) -> impl Iterator<Item = usize> + '_ {
        (0..QUERY_RING_SIZE).filter(|s| self.is_in_flight(*s))
    }

    pub fn clear(&mut self) {
        self.in_flight = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OcclusionState {
    pub ring: QueryRing,
    occluded_frames: u32,
}

impl OcclusionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one query result. Any visible sample resets the counter.
    pub fn record(&mut self, visible: bool) {
        if visible {
            self.occluded_frames = 0;
        } else {
            self.occluded_frames = self.occluded_frames.saturating_add(1);
        }
    }

    pub fn occluded_frames(&self) -> u32 {
        self.occluded_frames
    }

    pub fn is_occluded(&self) -> bool {
        self.occluded_frames >= OCCLUSION_THRESHOLD
    }

    pub fn reset(&mut self) {
        self.occluded_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_exhausts_and_recycles() {
        let mut ring = QueryRing::default();
        let slots: Vec<_> = (0..QUERY_RING_SIZE).map(|_| ring.acquire().unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.acquire(), None);
        ring.release(2);
        assert_eq!(ring.acquire(), Some(2));
    }

    #[test]
    fn one_visible_result_resets_the_counter() {
        let mut state = OcclusionState::new();
        for _ in 0..OCCLUSION_THRESHOLD - 1 {
            state.record(false);
        }
        assert!(!state.is_occluded());
        state.record(true);
        assert_eq!(state.occluded_frames(), 0);
        for _ in 0..OCCLUSION_THRESHOLD {
            state.record(false);
        }
        assert!(state.is_occluded());
    }

    #[test]
    fn query_indices_are_disjoint_per_tile() {
        let a = QueryId { tile: 0, slot: 4 };
        let b = QueryId { tile: 1, slot: 0 };
        assert_eq!(a.index() + 1, b.index());
    }
}
