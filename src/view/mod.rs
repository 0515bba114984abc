// VIEW: pass backends, GPU setup and drawing
pub mod backend;
pub mod gpu_backend;
pub mod gpu_init;
pub mod software;

pub use backend::{PassBackend, PassKind, TerrainBackend};
pub use gpu_backend::{GpuBatch, GpuFrameTarget, GpuTarget, WgpuBackend};
pub use gpu_init::GpuContext;
pub use software::{SoftwareBackend, SoftwareBatch, SoftwareFrame};
