//! Procedural terrain: a heightfield synthesized by image passes, a road
//! spline, Delaunay tiles built on worker threads, scattered vegetation and
//! frustum/occlusion culled drawing through a pluggable backend.

pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

// MVC Architecture
pub mod controller;
pub mod model;
pub mod view;

pub use config::{Appearance, TerrainFormat};
pub use controller::{FrameStats, Layers, Terrain};
pub use error::{Result, TerrainError};
pub use view::{PassBackend, SoftwareBackend, TerrainBackend, WgpuBackend};
