use glam::{Mat4, Vec2, Vec3};

use crate::config::Appearance;
use crate::error::Result;
use crate::model::{Channel, QueryId, TileId};
use crate::utils::{Aabb, Mesh};

/// Image passes a backend may provide. A backend that cannot build the
/// program for a kind reports it unsupported and the stage is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Heightmap,
    Sobel,
    Blur,
    Road,
    Compose,
    Flora,
    MeshDensity,
    TriangleHeight,
}

impl PassKind {
    pub const ALL: [PassKind; 8] = [
        PassKind::Heightmap,
        PassKind::Sobel,
        PassKind::Blur,
        PassKind::Road,
        PassKind::Compose,
        PassKind::Flora,
        PassKind::MeshDensity,
        PassKind::TriangleHeight,
    ];
}

/// One full-target image pass. Optional inputs come from earlier stages
/// that may have been skipped; a missing input reads as zero.
#[derive(Debug)]
pub enum Pass<'a, T> {
    /// Normalized fBm heights.
    Heightmap { seed: f32, octaves: u32, scale: f32 },
    /// Gradient magnitude of `source`.
    Sobel { source: &'a T },
    /// One dual-filter Kawase iteration.
    Blur { source: &'a T, iteration: u32 },
    /// Road mask rasterized from a triangle strip in pixel space.
    Road { strip: &'a [Vec2] },
    Compose {
        height: Option<&'a T>,
        blurred_height: Option<&'a T>,
        road: Option<&'a T>,
        blurred_road: Option<&'a T>,
        slope: Option<&'a T>,
    },
    Flora {
        road: Option<&'a T>,
        blurred_road: Option<&'a T>,
        slope: Option<&'a T>,
        height: Option<&'a T>,
        density: f32,
    },
    MeshDensity {
        road: Option<&'a T>,
        blurred_road: Option<&'a T>,
        slope: Option<&'a T>,
    },
    /// Flat triangles (three points each) shaded with the heights found
    /// under their corners.
    TriangleHeight { triangles: &'a [Vec2], heights: Option<&'a T> },
}

impl<T> Pass<'_, T> {
    pub fn kind(&self) -> PassKind {
        match self {
            Pass::Heightmap { .. } => PassKind::Heightmap,
            Pass::Sobel { .. } => PassKind::Sobel,
            Pass::Blur { .. } => PassKind::Blur,
            Pass::Road { .. } => PassKind::Road,
            Pass::Compose { .. } => PassKind::Compose,
            Pass::Flora { .. } => PassKind::Flora,
            Pass::MeshDensity { .. } => PassKind::MeshDensity,
            Pass::TriangleHeight { .. } => PassKind::TriangleHeight,
        }
    }
}

/// Runs the heightfield image passes on square single-channel targets.
pub trait PassBackend {
    type Target;

    fn supports(&self, kind: PassKind) -> bool;

    fn create_target(&mut self, size: u32) -> Self::Target;

    /// Overwrites `output` with the result of `pass`.
    fn run_pass(&mut self, pass: &Pass<'_, Self::Target>, output: &mut Self::Target);

    fn copy(&mut self, source: &Self::Target, destination: &mut Self::Target);

    fn snapshot(&mut self, source: &Self::Target) -> Self::Target;

    fn read_channel(&mut self, target: &Self::Target) -> Result<Channel>;

    fn upload_channel(&mut self, channel: &Channel) -> Self::Target;
}

/// Center and radius of the touch explosions pushing tiles and
/// vegetation apart.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Explosions {
    pub tile_center: Vec3,
    pub tile_size: f32,
    pub population_center: Vec3,
    pub population_size: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameUniforms {
    pub view_proj: Mat4,
    pub eye: Vec3,
    /// Effective elevation applied to normalized heights.
    pub elevation: f32,
    pub progression: f32,
    pub size: f32,
    pub appearance: Appearance,
    pub explosions: Explosions,
}

#[derive(Debug)]
pub struct TileDraw<'a, B> {
    pub id: TileId,
    pub batch: &'a B,
    pub completion: f32,
}

#[derive(Debug)]
pub struct PopulationDraw<'a, B> {
    pub tile: TileId,
    pub slot: usize,
    pub batch: &'a B,
    pub completion: f32,
    pub instances: usize,
}

/// Bounding box proxy drawn under an occlusion query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccluderDraw {
    pub query: QueryId,
    pub bounds: Aabb,
}

/// Everything a backend needs to draw one frame, in draw order.
#[derive(Debug)]
pub struct FrameDraw<'a, T, B> {
    pub uniforms: FrameUniforms,
    pub previous_heightmap: Option<&'a T>,
    pub current_heightmap: Option<&'a T>,
    pub triangle_heightmap: Option<&'a T>,
    pub noise: Option<&'a T>,
    pub tiles: Vec<TileDraw<'a, B>>,
    pub population: Vec<PopulationDraw<'a, B>>,
    pub occluders: Vec<OccluderDraw>,
    pub bounds: Vec<Aabb>,
}

impl<T, B> FrameDraw<'_, T, B> {
    pub fn new(uniforms: FrameUniforms) -> Self {
        Self {
            uniforms,
            previous_heightmap: None,
            current_heightmap: None,
            triangle_heightmap: None,
            noise: None,
            tiles: Vec::new(),
            population: Vec::new(),
            occluders: Vec::new(),
            bounds: Vec::new(),
        }
    }
}

/// A pass backend that can also draw tiles and answer occlusion queries.
pub trait TerrainBackend: PassBackend {
    type Batch;
    type FrameTarget;

    fn upload_mesh(&mut self, mesh: &Mesh) -> Self::Batch;

    /// Sizes per-tile resources such as the occlusion query set.
    fn reserve_tiles(&mut self, count: usize);

    fn draw_frame(
        &mut self,
        frame: &FrameDraw<'_, Self::Target, Self::Batch>,
        target: &mut Self::FrameTarget,
    );

    /// Whether occluders handed to `draw_frame` will be issued as queries.
    /// Culling takes no ring slots while this is false.
    fn issues_occlusion_queries(&self) -> bool {
        true
    }

    /// Result of an issued query if it is available yet: `Some(true)` when
    /// any sample passed. Never blocks.
    fn poll_occlusion(&mut self, query: QueryId) -> Option<bool>;
}
