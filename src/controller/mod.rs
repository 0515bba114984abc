// CONTROLLER: worker threads, generation pipeline and per-frame update
pub mod culling;
pub mod handoff;
pub mod population_scheduler;
pub mod synthesizer;
pub mod terrain;
pub mod tile_scheduler;
pub mod timeline;
pub mod workers;

pub use culling::{CullResult, TileCullingEngine};
pub use handoff::{Cancelled, HandoffQueue};
pub use population_scheduler::PopulationScheduler;
pub use synthesizer::{synthesize, SynthesisOutput, SynthesisParams};
pub use terrain::{FrameStats, Layers, Terrain};
pub use tile_scheduler::TileScheduler;
pub use timeline::{Ease, Timeline, TweenTarget};
