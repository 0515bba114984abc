use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("failed to read terrain format {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid terrain format: {0}")]
    Format(#[from] toml::de::Error),

    #[error("no suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),

    #[error("failed to request GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("buffer readback failed: {0}")]
    Readback(String),

    #[error("channel data has {actual} texels, expected {expected}")]
    ChannelSize { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, TerrainError>;
