use std::sync::Arc;

use wgpu::Device;

use crate::error::Result;

/// Headless GPU context: the terrain renders into offscreen targets, so no
/// surface is involved.
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: wgpu::AdapterInfo,
}

/// Shared device request. Occlusion queries and R32Float render targets are
/// core features, so nothing optional is asked for.
async fn init_device_and_queue(adapter: &wgpu::Adapter) -> Result<(Arc<Device>, Arc<wgpu::Queue>)> {
    let adapter_limits = adapter.limits();
    let limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter_limits);

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("grove_device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::default(),
        })
        .await?;

    Ok((Arc::new(device), Arc::new(queue)))
}

impl GpuContext {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;

        let adapter_info = adapter.get_info();
        tracing::info!(name = %adapter_info.name, backend = ?adapter_info.backend, "GPU adapter selected");

        let (device, queue) = init_device_and_queue(&adapter).await?;
        Ok(GpuContext { device, queue, adapter_info })
    }

    /// Blocking wrapper for callers without an executor.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }
}
