use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::backend::{FrameDraw, FrameUniforms, Pass, PassBackend, PassKind, TerrainBackend};
use super::gpu_init::GpuContext;
use crate::error::{Result, TerrainError};
use crate::model::occlusion::QUERY_RING_SIZE;
use crate::model::{Channel, QueryId};
use crate::utils::{create_box_mesh, Aabb, Mesh, MeshBuffer, Vertex};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
/// Per-draw uniforms live at dynamic offsets with this alignment.
const DRAW_STRIDE: u64 = 256;
const READBACK_TIMEOUT: Duration = Duration::from_secs(10);
const PASS_INPUTS: usize = 5;

/// Byte offset of the `i`th resolved occlusion result.
fn query_offset(i: usize) -> u64 {
    i as u64 * wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PassUniforms {
    size: f32,
    seed: f32,
    octaves: u32,
    scale: f32,
    iteration: u32,
    density: f32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniformsRaw {
    view_proj: [[f32; 4]; 4],
    eye: [f32; 4],
    params: [f32; 4],
    fog_color: [f32; 4],
    sun_color: [f32; 4],
    sun_scattering: [f32; 4],
    sun_direction: [f32; 4],
    tile_explosion: [f32; 4],
    population_explosion: [f32; 4],
}

impl From<&FrameUniforms> for FrameUniformsRaw {
    fn from(u: &FrameUniforms) -> Self {
        let a = &u.appearance;
        let e = &u.explosions;
        let v4 = |c: [f32; 3], w: f32| [c[0], c[1], c[2], w];
        Self {
            view_proj: u.view_proj.to_cols_array_2d(),
            eye: v4(u.eye.to_array(), u.elevation),
            params: [u.progression, u.size, a.fog_density, a.sun_intensity],
            fog_color: v4(a.fog_color, a.sun_dispersion),
            sun_color: v4(a.sun_color, 0.0),
            sun_scattering: v4(a.sun_scattering, 0.0),
            sun_direction: v4(a.sun_direction, 0.0),
            tile_explosion: v4(e.tile_center.to_array(), e.tile_size),
            population_explosion: v4(e.population_center.to_array(), e.population_size),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct DrawUniforms {
    params: [f32; 4],
    box_center: [f32; 4],
    box_size: [f32; 4],
}

/// Single-channel `R32Float` render target.
pub struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl GpuTarget {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 }
    }
}

/// Mesh uploaded to vertex and index buffers.
pub struct GpuBatch {
    mesh: MeshBuffer,
}

/// Offscreen color and depth attachments a frame is drawn into.
pub struct GpuFrameTarget {
    pub color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

impl GpuFrameTarget {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d { width, height, depth_or_array_layers: 1 };
        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame_color"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame_depth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        Self { color, color_view, depth_view }
    }
}

struct DrawPipelines {
    tile: Option<wgpu::RenderPipeline>,
    population: Option<wgpu::RenderPipeline>,
    occluder: Option<wgpu::RenderPipeline>,
    bounds: Option<wgpu::RenderPipeline>,
}

/// Resolved occlusion results of one frame, waiting to be mapped.
struct OcclusionReadback {
    queries: Vec<QueryId>,
    staging: wgpu::Buffer,
    // Some(true) once mapped, Some(false) if mapping failed
    state: Arc<Mutex<Option<bool>>>,
}

/// GPU implementation of the passes and of frame drawing.
///
/// Pipelines that fail validation are logged and left out; the matching
/// `PassKind` then reports unsupported and the stage is skipped.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,

    pass_layout: wgpu::BindGroupLayout,
    pass_uniforms: wgpu::Buffer,
    pass_pipelines: HashMap<PassKind, wgpu::RenderPipeline>,
    blank: GpuTarget,

    frame_layout: wgpu::BindGroupLayout,
    draw_layout: wgpu::BindGroupLayout,
    frame_uniforms: wgpu::Buffer,
    draw_uniforms: wgpu::Buffer,
    draw_bind_group: wgpu::BindGroup,
    draw_capacity: u64,
    pipelines: DrawPipelines,
    box_mesh: MeshBuffer,

    queries: Option<wgpu::QuerySet>,
    query_capacity: u32,
    readbacks: Vec<OcclusionReadback>,
    results: HashMap<QueryId, bool>,
    polled: bool,
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Runs `build` inside a validation error scope.
fn checked<T>(device: &wgpu::Device, label: &str, build: impl FnOnce() -> T) -> Option<T> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = build();
    match pollster::block_on(device.pop_error_scope()) {
        None => Some(value),
        Some(e) => {
            tracing::error!("{label} unavailable: {e}");
            None
        }
    }
}

fn shader(device: &wgpu::Device, label: &str, source: &'static str) -> Option<wgpu::ShaderModule> {
    checked(device, label, || {
        device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        })
    })
}

const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 4] = [
    wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
    wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x3 },
    wgpu::VertexAttribute { offset: 24, shader_location: 2, format: wgpu::VertexFormat::Float32x2 },
    wgpu::VertexAttribute { offset: 32, shader_location: 3, format: wgpu::VertexFormat::Float32x2 },
];
const POINT2_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    [wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x2 }];
const POINT3_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    [wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 }];

fn mesh_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &MESH_ATTRIBUTES,
    }
}

fn point_layout(attributes: &'static [wgpu::VertexAttribute], stride: u64) -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout { array_stride: stride, step_mode: wgpu::VertexStepMode::Vertex, attributes }
}

struct PassProgram<'a> {
    module: &'a wgpu::ShaderModule,
    vertex: &'a str,
    fragment: &'a str,
    topology: wgpu::PrimitiveTopology,
    buffers: &'a [wgpu::VertexBufferLayout<'a>],
}

fn pass_pipeline(device: &wgpu::Device, layout: &wgpu::PipelineLayout, program: &PassProgram) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(program.fragment),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: program.module,
            entry_point: Some(program.vertex),
            buffers: program.buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: program.module,
            entry_point: Some(program.fragment),
            targets: &[Some(wgpu::ColorTargetState {
                format: TARGET_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: program.topology,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

struct DrawProgram<'a> {
    label: &'a str,
    vertex: &'a str,
    fragment: &'a str,
    topology: wgpu::PrimitiveTopology,
    buffer: wgpu::VertexBufferLayout<'a>,
    blend: Option<wgpu::BlendState>,
    write_mask: wgpu::ColorWrites,
    depth_write: bool,
    depth_compare: wgpu::CompareFunction,
}

fn draw_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    program: DrawProgram,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(program.label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(program.vertex),
            buffers: &[program.buffer],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(program.fragment),
            targets: &[Some(wgpu::ColorTargetState {
                format: COLOR_FORMAT,
                blend: program.blend,
                write_mask: program.write_mask,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: program.topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: program.depth_write,
            depth_compare: program.depth_compare,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState { count: 1, mask: !0, alpha_to_coverage_enabled: false },
        multiview: None,
        cache: None,
    })
}

fn create_r32_texture(device: &wgpu::Device, width: u32, height: u32) -> GpuTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("pass_target"),
        size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTarget { texture, view, width, height }
}

fn create_draw_uniforms(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    capacity: u64,
) -> (wgpu::Buffer, wgpu::BindGroup) {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("draw_uniforms"),
        size: capacity * DRAW_STRIDE,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("draw_bind_group"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &buffer,
                offset: 0,
                size: NonZeroU64::new(std::mem::size_of::<DrawUniforms>() as u64),
            }),
        }],
    });
    (buffer, bind_group)
}

fn view_or<'a>(target: Option<&'a GpuTarget>, blank: &'a GpuTarget) -> &'a wgpu::TextureView {
    &target.unwrap_or(blank).view
}

fn draw_mesh(rpass: &mut wgpu::RenderPass<'_>, draw_bind_group: &wgpu::BindGroup, mesh: &MeshBuffer, slot: u64) {
    if mesh.index_count == 0 {
        return;
    }
    rpass.set_bind_group(1, draw_bind_group, &[(slot * DRAW_STRIDE) as u32]);
    rpass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
    rpass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
    rpass.draw_indexed(0..mesh.index_count, 0, 0..1);
}

/// Line list of the twelve edges of every box.
fn bounds_lines(bounds: &[Aabb]) -> Vec<[f32; 3]> {
    const EDGES: [(usize, usize); 12] = [
        (0, 1), (2, 3), (4, 5), (6, 7),
        (0, 2), (1, 3), (4, 6), (5, 7),
        (0, 4), (1, 5), (2, 6), (3, 7),
    ];
    bounds
        .iter()
        .flat_map(|b| {
            let c = b.corners();
            EDGES.iter().flat_map(move |(i, j)| [c[*i].to_array(), c[*j].to_array()])
        })
        .collect()
}

impl WgpuBackend {
    pub fn new(context: &GpuContext) -> Self {
        let device = context.device.clone();
        let queue = context.queue.clone();

        let mut pass_entries = vec![uniform_entry(0, false)];
        pass_entries.extend((1..=PASS_INPUTS as u32).map(texture_entry));
        let pass_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pass_bind_group_layout"),
            entries: &pass_entries,
        });
        let pass_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pass_uniforms"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let pass_pipelines = Self::build_pass_pipelines(&device, &pass_layout);

        let blank = create_r32_texture(&device, 1, 1);
        queue.write_texture(
            blank.texture.as_image_copy(),
            bytemuck::bytes_of(&0.0f32),
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(4), rows_per_image: Some(1) },
            blank.extent(),
        );

        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame_bind_group_layout"),
            entries: &[uniform_entry(0, false), texture_entry(1), texture_entry(2), texture_entry(3), texture_entry(4)],
        });
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("draw_bind_group_layout"),
            entries: &[uniform_entry(0, true)],
        });
        let frame_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame_uniforms"),
            size: std::mem::size_of::<FrameUniformsRaw>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let draw_capacity = 64;
        let (draw_uniforms, draw_bind_group) = create_draw_uniforms(&device, &draw_layout, draw_capacity);
        let pipelines = Self::build_draw_pipelines(&device, &frame_layout, &draw_layout);

        tracing::info!(passes = pass_pipelines.len(), "wgpu backend ready");

        Self {
            box_mesh: create_box_mesh().upload(&device),
            device,
            queue,
            pass_layout,
            pass_uniforms,
            pass_pipelines,
            blank,
            frame_layout,
            draw_layout,
            frame_uniforms,
            draw_uniforms,
            draw_bind_group,
            draw_capacity,
            pipelines,
            queries: None,
            query_capacity: 0,
            readbacks: Vec::new(),
            results: HashMap::new(),
            polled: false,
        }
    }

    fn build_pass_pipelines(
        device: &wgpu::Device,
        bind_group_layout: &wgpu::BindGroupLayout,
    ) -> HashMap<PassKind, wgpu::RenderPipeline> {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pass_pipeline_layout"),
            bind_group_layouts: &[bind_group_layout],
            push_constant_ranges: &[],
        });
        let mut pipelines = HashMap::new();

        if let Some(module) = shader(device, "synthesis_shader", include_str!("shaders/synthesis.wgsl")) {
            let fullscreen = [
                (PassKind::Heightmap, "fs_heightmap"),
                (PassKind::Sobel, "fs_sobel"),
                (PassKind::Blur, "fs_blur"),
                (PassKind::Compose, "fs_compose"),
                (PassKind::Flora, "fs_flora"),
                (PassKind::MeshDensity, "fs_mesh_density"),
            ];
            for (kind, fragment) in fullscreen {
                let program = PassProgram {
                    module: &module,
                    vertex: "vs_fullscreen",
                    fragment,
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    buffers: &[],
                };
                if let Some(p) = checked(device, fragment, || pass_pipeline(device, &layout, &program)) {
                    pipelines.insert(kind, p);
                }
            }
        }

        if let Some(module) = shader(device, "rasterize_shader", include_str!("shaders/rasterize.wgsl")) {
            let points = [point_layout(&POINT2_ATTRIBUTES, 8)];
            let geometry = [
                (PassKind::Road, "vs_road", wgpu::PrimitiveTopology::TriangleStrip),
                (PassKind::TriangleHeight, "vs_triangle", wgpu::PrimitiveTopology::TriangleList),
            ];
            for (kind, vertex, topology) in geometry {
                let program = PassProgram { module: &module, vertex, fragment: "fs_main", topology, buffers: &points };
                if let Some(p) = checked(device, vertex, || pass_pipeline(device, &layout, &program)) {
                    pipelines.insert(kind, p);
                }
            }
        }

        pipelines
    }

    fn build_draw_pipelines(
        device: &wgpu::Device,
        frame_layout: &wgpu::BindGroupLayout,
        draw_layout: &wgpu::BindGroupLayout,
    ) -> DrawPipelines {
        let Some(module) = shader(device, "terrain_shader", include_str!("shaders/terrain.wgsl")) else {
            return DrawPipelines { tile: None, population: None, occluder: None, bounds: None };
        };
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("terrain_pipeline_layout"),
            bind_group_layouts: &[frame_layout, draw_layout],
            push_constant_ranges: &[],
        });
        let lit = |label, vertex| DrawProgram {
            label,
            vertex,
            fragment: "fs_lit",
            topology: wgpu::PrimitiveTopology::TriangleList,
            buffer: mesh_layout(),
            blend: Some(wgpu::BlendState::ALPHA_BLENDING),
            write_mask: wgpu::ColorWrites::ALL,
            depth_write: true,
            depth_compare: wgpu::CompareFunction::Less,
        };
        let build = |program: DrawProgram| {
            let label = program.label;
            checked(device, label, || draw_pipeline(device, &layout, &module, program))
        };

        DrawPipelines {
            tile: build(lit("tile_pipeline", "vs_tile")),
            population: build(lit("population_pipeline", "vs_population")),
            occluder: build(DrawProgram {
                label: "occluder_pipeline",
                vertex: "vs_occluder",
                fragment: "fs_occluder",
                topology: wgpu::PrimitiveTopology::TriangleList,
                buffer: mesh_layout(),
                blend: None,
                write_mask: wgpu::ColorWrites::empty(),
                depth_write: false,
                depth_compare: wgpu::CompareFunction::LessEqual,
            }),
            bounds: build(DrawProgram {
                label: "bounds_pipeline",
                vertex: "vs_bounds",
                fragment: "fs_bounds",
                topology: wgpu::PrimitiveTopology::LineList,
                buffer: point_layout(&POINT3_ATTRIBUTES, 12),
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
                depth_write: false,
                depth_compare: wgpu::CompareFunction::Less,
            }),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn create_frame_target(&self, width: u32, height: u32) -> GpuFrameTarget {
        GpuFrameTarget::new(&self.device, width, height)
    }

    /// Drives the device until `done` holds.
    fn wait_until(&self, done: impl Fn() -> bool) -> Result<()> {
        let deadline = Instant::now() + READBACK_TIMEOUT;
        while !done() {
            self.device
                .poll(wgpu::PollType::Poll)
                .map_err(|e| TerrainError::Readback(e.to_string()))?;
            if Instant::now() > deadline {
                return Err(TerrainError::Readback("timed out waiting for the GPU".into()));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    fn ensure_draw_capacity(&mut self, draws: u64) {
        if draws <= self.draw_capacity {
            return;
        }
        let capacity = draws.next_power_of_two();
        let (buffer, bind_group) = create_draw_uniforms(&self.device, &self.draw_layout, capacity);
        self.draw_uniforms = buffer;
        self.draw_bind_group = bind_group;
        self.draw_capacity = capacity;
    }

    /// Collects every mapped occlusion readback into `results`.
    fn collect_occlusion(&mut self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!("device poll failed: {e}");
        }
        let results = &mut self.results;
        self.readbacks.retain(|readback| {
            let state = *readback.state.lock();
            match state {
                None => true,
                Some(false) => {
                    // count as visible so the tile cannot get stuck hidden
                    for query in &readback.queries {
                        results.insert(*query, true);
                    }
                    false
                }
                Some(true) => {
                    {
                        let slice = readback.staging.slice(..);
                        let data = slice.get_mapped_range();
                        for (i, query) in readback.queries.iter().enumerate() {
                            let at = query_offset(i) as usize;
                            let mut bytes = [0u8; 8];
                            bytes.copy_from_slice(&data[at..at + 8]);
                            results.insert(*query, u64::from_le_bytes(bytes) > 0);
                        }
                    }
                    readback.staging.unmap();
                    false
                }
            }
        });
    }

    /// Resolves this frame's queries into a mappable buffer.
    fn resolve_occlusion(&self, encoder: &mut wgpu::CommandEncoder, issued: &[QueryId]) -> Option<wgpu::Buffer> {
        let queries = self.queries.as_ref()?;
        let size = query_offset(issued.len());
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("occlusion_resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("occlusion_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        for (i, query) in issued.iter().enumerate() {
            let index = query.index();
            encoder.resolve_query_set(
                queries,
                index..index + 1,
                &resolve,
                query_offset(i),
            );
        }
        encoder.copy_buffer_to_buffer(&resolve, 0, &staging, 0, size);
        Some(staging)
    }
}

impl PassBackend for WgpuBackend {
    type Target = GpuTarget;

    fn supports(&self, kind: PassKind) -> bool {
        self.pass_pipelines.contains_key(&kind)
    }

    fn create_target(&mut self, size: u32) -> GpuTarget {
        create_r32_texture(&self.device, size, size)
    }

    fn run_pass(&mut self, pass: &Pass<'_, GpuTarget>, output: &mut GpuTarget) {
        let Some(pipeline) = self.pass_pipelines.get(&pass.kind()) else {
            tracing::error!("{:?} pass unavailable", pass.kind());
            return;
        };

        let mut uniforms = PassUniforms { size: output.width as f32, ..Zeroable::zeroed() };
        let mut inputs: [Option<&GpuTarget>; PASS_INPUTS] = [None; PASS_INPUTS];
        let mut points: Option<&[Vec2]> = None;
        match *pass {
            Pass::Heightmap { seed, octaves, scale } => {
                uniforms.seed = seed;
                uniforms.octaves = octaves;
                uniforms.scale = scale;
            }
            Pass::Sobel { source } => inputs[0] = Some(source),
            Pass::Blur { source, iteration } => {
                inputs[0] = Some(source);
                uniforms.iteration = iteration;
            }
            Pass::Road { strip } => points = Some(strip),
            Pass::Compose { height, blurred_height, road, blurred_road, slope } => {
                inputs = [height, blurred_height, road, blurred_road, slope];
            }
            Pass::Flora { road, blurred_road, slope, height, density } => {
                inputs = [road, blurred_road, slope, height, None];
                uniforms.density = density;
            }
            Pass::MeshDensity { road, blurred_road, slope } => {
                inputs = [road, blurred_road, slope, None, None];
            }
            Pass::TriangleHeight { triangles, heights } => {
                let whole = triangles.len() - triangles.len() % 3;
                points = Some(&triangles[..whole]);
                inputs[0] = heights;
            }
        }
        self.queue.write_buffer(&self.pass_uniforms, 0, bytemuck::bytes_of(&uniforms));

        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: self.pass_uniforms.as_entire_binding() }];
        for (i, input) in inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: wgpu::BindingResource::TextureView(&input.unwrap_or(&self.blank).view),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pass_bind_group"),
            layout: &self.pass_layout,
            entries: &entries,
        });

        let vertices = points.filter(|p| p.len() >= 3).map(|p| {
            let data: Vec<[f32; 2]> = p.iter().map(|v| v.to_array()).collect();
            let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("pass_vertices"),
                contents: bytemuck::cast_slice(&data),
                usage: wgpu::BufferUsages::VERTEX,
            });
            (buffer, data.len() as u32)
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("pass_encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            match (points, &vertices) {
                (None, _) => rpass.draw(0..3, 0..1),
                (Some(_), Some((buffer, count))) => {
                    rpass.set_vertex_buffer(0, buffer.slice(..));
                    rpass.draw(0..*count, 0..1);
                }
                // fewer than three points: the cleared target is the result
                (Some(_), None) => {}
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn copy(&mut self, source: &GpuTarget, destination: &mut GpuTarget) {
        if source.extent() != destination.extent() {
            tracing::error!("copy between targets of different sizes skipped");
            return;
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("copy_encoder"),
        });
        encoder.copy_texture_to_texture(
            source.texture.as_image_copy(),
            destination.texture.as_image_copy(),
            source.extent(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn snapshot(&mut self, source: &GpuTarget) -> GpuTarget {
        let mut target = create_r32_texture(&self.device, source.width, source.height);
        self.copy(source, &mut target);
        target
    }

    fn read_channel(&mut self, target: &GpuTarget) -> Result<Channel> {
        let unpadded = target.width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: padded as u64 * target.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            target.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(target.height),
                },
            },
            target.extent(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let outcome = Arc::new(Mutex::new(None));
        let sender = outcome.clone();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            *sender.lock() = Some(result);
        });
        self.wait_until(|| outcome.lock().is_some())?;
        if let Some(Err(e)) = outcome.lock().take() {
            return Err(TerrainError::Readback(e.to_string()));
        }

        let mut values = Vec::with_capacity(target.width as usize * target.height as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks_exact(padded as usize) {
                values.extend(
                    row[..unpadded as usize]
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                );
            }
        }
        staging.unmap();
        Channel::from_data(target.width, target.height, values)
    }

    fn upload_channel(&mut self, channel: &Channel) -> GpuTarget {
        let target = create_r32_texture(&self.device, channel.width(), channel.height());
        self.queue.write_texture(
            target.texture.as_image_copy(),
            bytemuck::cast_slice(channel.data()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(channel.width() * 4),
                rows_per_image: Some(channel.height()),
            },
            target.extent(),
        );
        target
    }
}

impl TerrainBackend for WgpuBackend {
    type Batch = GpuBatch;
    type FrameTarget = GpuFrameTarget;

    fn upload_mesh(&mut self, mesh: &Mesh) -> GpuBatch {
        GpuBatch { mesh: mesh.upload(&self.device) }
    }

    fn reserve_tiles(&mut self, count: usize) {
        self.query_capacity = (count * QUERY_RING_SIZE) as u32;
        self.queries = (self.query_capacity > 0).then(|| {
            self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("occlusion_queries"),
                ty: wgpu::QueryType::Occlusion,
                count: self.query_capacity,
            })
        });
        self.readbacks.clear();
        self.results.clear();
    }

    fn draw_frame(&mut self, frame: &FrameDraw<'_, GpuTarget, GpuBatch>, target: &mut GpuFrameTarget) {
        self.polled = false;
        self.queue.write_buffer(&self.frame_uniforms, 0, bytemuck::bytes_of(&FrameUniformsRaw::from(&frame.uniforms)));

        let occluders: Vec<_> = frame
            .occluders
            .iter()
            .filter(|o| self.queries.is_some() && o.query.index() < self.query_capacity)
            .collect();

        let mut draws: Vec<DrawUniforms> = Vec::new();
        draws.extend(frame.tiles.iter().map(|t| DrawUniforms { params: [t.completion, 0.0, 0.0, 0.0], ..Default::default() }));
        draws.extend(frame.population.iter().map(|p| DrawUniforms {
            params: [p.completion, p.slot as f32, 0.0, 0.0],
            ..Default::default()
        }));
        draws.extend(occluders.iter().map(|o| {
            let (c, s) = (o.bounds.center(), o.bounds.size());
            DrawUniforms { box_center: [c.x, c.y, c.z, 0.0], box_size: [s.x, s.y, s.z, 0.0], ..Default::default() }
        }));
        self.ensure_draw_capacity(draws.len() as u64);
        let mut bytes = vec![0u8; draws.len() * DRAW_STRIDE as usize];
        for (i, draw) in draws.iter().enumerate() {
            let at = i * DRAW_STRIDE as usize;
            bytes[at..at + std::mem::size_of::<DrawUniforms>()].copy_from_slice(bytemuck::bytes_of(draw));
        }
        if !bytes.is_empty() {
            self.queue.write_buffer(&self.draw_uniforms, 0, &bytes);
        }

        let blank = &self.blank;
        let frame_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame_bind_group"),
            layout: &self.frame_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.frame_uniforms.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(view_or(frame.previous_heightmap, blank)) },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(view_or(frame.current_heightmap, blank)) },
                wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::TextureView(view_or(frame.triangle_heightmap, blank)) },
                wgpu::BindGroupEntry { binding: 4, resource: wgpu::BindingResource::TextureView(view_or(frame.noise, blank)) },
            ],
        });

        let lines = bounds_lines(&frame.bounds);
        let line_buffer = (!lines.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("bounds_lines"),
                contents: bytemuck::cast_slice(&lines),
                usage: wgpu::BufferUsages::VERTEX,
            })
        });

        let fog = frame.uniforms.appearance.fog_color;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame_encoder"),
        });
        let mut issued = Vec::with_capacity(occluders.len());
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("terrain_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: fog[0] as f64,
                            g: fog[1] as f64,
                            b: fog[2] as f64,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: if occluders.is_empty() { None } else { self.queries.as_ref() },
            });
            rpass.set_bind_group(0, &frame_bind_group, &[]);

            let draws = &self.draw_bind_group;
            let mut slot = 0u64;

            if let Some(pipeline) = &self.pipelines.tile {
                rpass.set_pipeline(pipeline);
                for (i, tile) in frame.tiles.iter().enumerate() {
                    draw_mesh(&mut rpass, draws, &tile.batch.mesh, slot + i as u64);
                }
            }
            slot += frame.tiles.len() as u64;

            if let Some(pipeline) = &self.pipelines.population {
                rpass.set_pipeline(pipeline);
                for (i, population) in frame.population.iter().enumerate() {
                    draw_mesh(&mut rpass, draws, &population.batch.mesh, slot + i as u64);
                }
            }
            slot += frame.population.len() as u64;

            if let Some(pipeline) = &self.pipelines.occluder {
                rpass.set_pipeline(pipeline);
                for (i, occluder) in occluders.iter().enumerate() {
                    rpass.begin_occlusion_query(occluder.query.index());
                    draw_mesh(&mut rpass, draws, &self.box_mesh, slot + i as u64);
                    rpass.end_occlusion_query();
                    issued.push(occluder.query);
                }
            }

            if let (Some(pipeline), Some(buffer)) = (&self.pipelines.bounds, &line_buffer) {
                rpass.set_pipeline(pipeline);
                rpass.set_vertex_buffer(0, buffer.slice(..));
                rpass.draw(0..lines.len() as u32, 0..1);
            }
        }

        // occluders that never reached the query set read as visible, so
        // their ring slots come back on the next poll
        for occluder in &frame.occluders {
            if !issued.contains(&occluder.query) {
                self.results.insert(occluder.query, true);
            }
        }

        let staging = if issued.is_empty() { None } else { self.resolve_occlusion(&mut encoder, &issued) };
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(staging) = staging {
            let state = Arc::new(Mutex::new(None));
            let sender = state.clone();
            staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                *sender.lock() = Some(result.is_ok());
            });
            self.readbacks.push(OcclusionReadback { queries: issued, staging, state });
        }
    }

    fn issues_occlusion_queries(&self) -> bool {
        self.queries.is_some() && self.pipelines.occluder.is_some()
    }

    fn poll_occlusion(&mut self, query: QueryId) -> Option<bool> {
        if !self.polled {
            self.polled = true;
            self.collect_occlusion();
        }
        self.results.remove(&query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_queries_sit_on_resolve_alignment() {
        assert_eq!(query_offset(0), 0);
        assert_eq!(query_offset(3), 3 * wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT);
        // every result's eight bytes fit before the next one
        assert!(query_offset(1) >= 8);
    }
}
