use crate::model::population::{scatter, PopulationData, PopulationInputs};

use super::workers::BatchScheduler;

const POPULATION_STAGGER: u64 = 10;

/// Scatters vegetation per tile on its own worker pool and queue.
pub struct PopulationScheduler {
    batches: BatchScheduler<PopulationData>,
}

impl Default for PopulationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PopulationScheduler {
    pub fn new() -> Self {
        Self { batches: BatchScheduler::new("population-worker") }
    }

    pub fn is_populating(&self) -> bool {
        self.batches.is_running()
    }

    pub fn start(&mut self, inputs: PopulationInputs, threads: usize, stagger: bool) {
        let count = inputs.grid.num_tiles();
        let stagger = stagger.then_some(POPULATION_STAGGER);
        self.batches.start(count, threads, stagger, move |id| scatter(id, &inputs));
    }

    pub fn drain(&mut self) -> Vec<PopulationData> {
        let batches = self.batches.drain();
        for data in &batches {
            tracing::debug!(tile = data.tile_id, instances = data.instances.len(), "population ready");
        }
        batches
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::model::{Prototypes, TileGrid};

    #[test]
    fn populates_every_tile() {
        let inputs = PopulationInputs {
            grid: TileGrid::new(64, 2),
            flora: None,
            seed: 1.0,
            balance: 0.0,
            prototypes: Arc::new(Prototypes::build()),
        };
        let mut scheduler = PopulationScheduler::new();
        scheduler.start(inputs, 3, false);
        let mut tiles = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        while !scheduler.all_delivered() && Instant::now() < deadline {
            tiles.extend(scheduler.drain().into_iter().map(|d| d.tile_id));
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.finish();
        tiles.sort_unstable();
        assert_eq!(tiles, vec![0, 1, 2, 3]);
        assert_eq!(scheduler.delivered(), 4);
    }
}
