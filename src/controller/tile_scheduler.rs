use crate::model::tile::{build_tile_geometry, TileGeometry, TileInputs};

use super::workers::BatchScheduler;

/// Sleep factor between tiles when staggering is on.
const TILE_STAGGER: u64 = 2;

/// Triangulates every tile of the grid on a pool of worker threads.
///
/// Finished geometry waits in a bounded queue of `n` entries until the
/// main thread drains it; GPU batches are created from the drained
/// geometry on the main thread only.
pub struct TileScheduler {
    batches: BatchScheduler<TileGeometry>,
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TileScheduler {
    pub fn new() -> Self {
        Self { batches: BatchScheduler::new("tile-worker") }
    }

    pub fn is_building(&self) -> bool {
        self.batches.is_running()
    }

    pub fn start(&mut self, inputs: TileInputs, threads: usize, stagger: bool) {
        let count = inputs.grid.num_tiles();
        let stagger = stagger.then_some(TILE_STAGGER);
        self.batches.start(count, threads, stagger, move |id| build_tile_geometry(id, &inputs));
    }

    pub fn drain(&mut self) -> Vec<TileGeometry> {
        let tiles = self.batches.drain();
        for tile in &tiles {
            tracing::debug!(id = tile.id, triangles = tile.mesh.triangle_count(), "tile ready");
        }
        tiles
    }

    pub fn all_delivered(&self) -> bool {
        self.batches.all_delivered()
    }

    pub fn delivered(&self) -> usize {
        self.batches.delivered()
    }

    pub fn lost(&self) -> usize {
        self.batches.lost()
    }

    pub fn starts(&self) -> usize {
        self.batches.starts()
    }

    pub fn finish(&mut self) {
        self.batches.finish();
    }

    pub fn shutdown(&mut self) {
        self.batches.shutdown();
    }
}
