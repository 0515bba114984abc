/// Index of the live generation plus the blend factor from the previous
/// one. Every double-buffered resource (heightmaps, 3D road splines, tile
/// bounds) is indexed through the same epoch, so one flip swaps them all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationEpoch {
    current: usize,
    progression: f32,
}

impl Default for GenerationEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationEpoch {
    pub fn new() -> Self {
        Self { current: 0, progression: 1.0 }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn previous(&self) -> usize {
        self.current ^ 1
    }

    /// Blend factor in `[0, 1]`; 1 means the current generation is fully in.
    pub fn progression(&self) -> f32 {
        self.progression
    }

    pub fn set_progression(&mut self, progression: f32) {
        self.progression = progression.clamp(0.0, 1.0);
    }

    /// Makes the previous slot current and restarts the blend.
    pub fn flip(&mut self) {
        self.current ^= 1;
        self.progression = 0.0;
    }
}

/// Two slots addressed by a generation index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
}

impl<T> DoubleBuffer<T> {
    pub fn new(first: T, second: T) -> Self {
        Self { slots: [first, second] }
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.slots[slot & 1]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot & 1]
    }

    pub fn set(&mut self, slot: usize, value: T) {
        self.slots[slot & 1] = value;
    }

    pub fn current(&self, epoch: &GenerationEpoch) -> &T {
        self.get(epoch.current())
    }

    pub fn previous(&self, epoch: &GenerationEpoch) -> &T {
        self.get(epoch.previous())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_flips_restore_roles() {
        let buffers = DoubleBuffer::new("a", "b");
        let mut epoch = GenerationEpoch::new();
        let (cur, prev) = (*buffers.current(&epoch), *buffers.previous(&epoch));

        epoch.flip();
        assert_eq!(*buffers.current(&epoch), prev);
        assert_eq!(*buffers.previous(&epoch), cur);
        assert_eq!(epoch.progression(), 0.0);

        epoch.flip();
        assert_eq!(*buffers.current(&epoch), cur);
        assert_eq!(*buffers.previous(&epoch), prev);
    }

    #[test]
    fn progression_is_clamped() {
        let mut epoch = GenerationEpoch::new();
        epoch.set_progression(3.0);
        assert_eq!(epoch.progression(), 1.0);
        epoch.set_progression(-1.0);
        assert_eq!(epoch.progression(), 0.0);
    }
}
