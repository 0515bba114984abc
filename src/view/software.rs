use std::collections::{HashMap, HashSet};

use glam::Vec2;

use super::backend::{FrameDraw, Pass, PassBackend, PassKind, TerrainBackend};
use crate::error::Result;
use crate::model::noise::{fbm, seed_offset};
use crate::model::{Channel, QueryId, TileId};
use crate::utils::{mix, smoothstep, Mesh};

/// CPU implementation of every pass and a recording "renderer".
///
/// Runs headless and deterministically, so it backs the driver binary when
/// no GPU is around and every test in the crate. Occlusion answers are
/// decided by `set_tile_occluded` and become readable one frame after the
/// query was issued.
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    disabled: HashSet<PassKind>,
    occluded: HashSet<TileId>,
    pending: HashMap<QueryId, bool>,
    reserved_tiles: usize,
    uploads: usize,
    declines_queries: bool,
}

/// Uploaded mesh. Keeps the counts the frame statistics need.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareBatch {
    pub vertices: usize,
    pub triangles: usize,
}

/// What the last frames drew.
#[derive(Debug, Default)]
pub struct SoftwareFrame {
    pub frames: usize,
    pub tiles: Vec<TileId>,
    pub population: Vec<(TileId, usize)>,
    pub occluders: Vec<QueryId>,
    pub bounds: usize,
    pub triangles: usize,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend without the given passes, as if their programs failed to
    /// build.
    pub fn without(kinds: &[PassKind]) -> Self {
        Self { disabled: kinds.iter().copied().collect(), ..Self::default() }
    }

    /// Controls what later occlusion queries of `tile` report.
    pub fn set_tile_occluded(&mut self, tile: TileId, occluded: bool) {
        if occluded {
            self.occluded.insert(tile);
        } else {
            self.occluded.remove(&tile);
        }
    }

    /// Stops (or resumes) issuing occlusion queries, like a GPU backend
    /// whose occluder pipeline failed to build.
    pub fn set_declines_queries(&mut self, declines: bool) {
        self.declines_queries = declines;
    }

    pub fn reserved_tiles(&self) -> usize {
        self.reserved_tiles
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }
}

fn sample(channel: Option<&Channel>, x: u32, y: u32) -> f32 {
    channel.map_or(0.0, |c| c.get_clamped(x as i32, y as i32))
}

fn heightmap(output: &mut Channel, seed: f32, octaves: u32, scale: f32) {
    let size = Vec2::new(output.width() as f32, output.height() as f32);
    let (ox, oz) = seed_offset(seed);
    *output = Channel::from_fn(output.width(), output.height(), |x, y| {
        let uv = (Vec2::new(x as f32, y as f32) + 0.5) / size;
        fbm(uv.x * scale + ox, uv.y * scale + oz, 1.0, 0.5, octaves) * 0.5 + 0.5
    });
}

fn sobel(source: &Channel, output: &mut Channel) {
    let gain = source.width() as f32 / 64.0;
    *output = Channel::from_fn(source.width(), source.height(), |x, y| {
        let (x, y) = (x as i32, y as i32);
        let s = |dx: i32, dy: i32| source.get_clamped(x + dx, y + dy);
        let gx = (s(1, -1) + 2.0 * s(1, 0) + s(1, 1)) - (s(-1, -1) + 2.0 * s(-1, 0) + s(-1, 1));
        let gy = (s(-1, 1) + 2.0 * s(0, 1) + s(1, 1)) - (s(-1, -1) + 2.0 * s(0, -1) + s(1, -1));
        (Vec2::new(gx, gy).length() * gain).clamp(0.0, 1.0)
    });
}

fn kawase(source: &Channel, output: &mut Channel, iteration: u32) {
    let o = iteration as i32 + 1;
    *output = Channel::from_fn(source.width(), source.height(), |x, y| {
        let (x, y) = (x as i32, y as i32);
        (source.get_clamped(x - o, y - o)
            + source.get_clamped(x + o, y - o)
            + source.get_clamped(x - o, y + o)
            + source.get_clamped(x + o, y + o))
            * 0.25
    });
}

fn compose(
    output: &mut Channel,
    height: Option<&Channel>,
    blurred_height: Option<&Channel>,
    road: Option<&Channel>,
    blurred_road: Option<&Channel>,
    slope: Option<&Channel>,
) {
    *output = Channel::from_fn(output.width(), output.height(), |x, y| {
        let h = sample(height, x, y);
        let hb = sample(blurred_height, x, y);
        let r = sample(road, x, y);
        let rb = sample(blurred_road, x, y);
        let s = sample(slope, x, y);
        // flatten the terrain under the road and on gentle slopes
        let t = (rb * 1.5 + (1.0 - smoothstep(0.1, 0.6, s)) * 0.35).clamp(0.0, 1.0);
        (mix(h, hb, t) - r * 0.01).clamp(0.0, 1.0)
    });
}

fn flora(
    output: &mut Channel,
    road: Option<&Channel>,
    blurred_road: Option<&Channel>,
    slope: Option<&Channel>,
    height: Option<&Channel>,
    density: f32,
) {
    *output = Channel::from_fn(output.width(), output.height(), |x, y| {
        let (px, py) = (x as f32 * 0.05, y as f32 * 0.05);
        let coverage = fbm(px, py, 1.0, 0.5, 3) * 0.5 + 0.5;
        let r = sample(road, x, y);
        let rb = sample(blurred_road, x, y);
        let s = sample(slope, x, y);
        let h = sample(height, x, y);
        let exclusion = r.max(rb * 0.8)
            + smoothstep(0.2, 0.7, s)
            + smoothstep(0.75, 0.95, h)
            + (1.0 - coverage * density) * 0.5;
        exclusion.clamp(0.0, 1.0)
    });
}

fn mesh_density(
    output: &mut Channel,
    road: Option<&Channel>,
    blurred_road: Option<&Channel>,
    slope: Option<&Channel>,
) {
    *output = Channel::from_fn(output.width(), output.height(), |x, y| {
        let r = sample(road, x, y);
        let rb = sample(blurred_road, x, y);
        let s = sample(slope, x, y);
        (r + rb * 0.5 + s).clamp(0.0, 1.0)
    });
}

fn triangle_heights(output: &mut Channel, triangles: &[Vec2], heights: Option<&Channel>) {
    output.fill(0.0);
    let lookup = |p: Vec2| heights.map_or(0.0, |c| c.get_value(p));
    for tri in triangles.chunks_exact(3) {
        let values = [lookup(tri[0]), lookup(tri[1]), lookup(tri[2])];
        output.fill_triangle(tri[0], tri[1], tri[2], values);
    }
}

impl PassBackend for SoftwareBackend {
    type Target = Channel;

    fn supports(&self, kind: PassKind) -> bool {
        !self.disabled.contains(&kind)
    }

    fn create_target(&mut self, size: u32) -> Channel {
        Channel::new(size, size)
    }

    fn run_pass(&mut self, pass: &Pass<'_, Channel>, output: &mut Channel) {
        match *pass {
            Pass::Heightmap { seed, octaves, scale } => heightmap(output, seed, octaves, scale),
            Pass::Sobel { source } => sobel(source, output),
            Pass::Blur { source, iteration } => kawase(source, output, iteration),
            Pass::Road { strip } => {
                output.fill(0.0);
                output.fill_strip(strip, 1.0);
            }
            Pass::Compose { height, blurred_height, road, blurred_road, slope } => {
                compose(output, height, blurred_height, road, blurred_road, slope)
            }
            Pass::Flora { road, blurred_road, slope, height, density } => {
                flora(output, road, blurred_road, slope, height, density)
            }
            Pass::MeshDensity { road, blurred_road, slope } => {
                mesh_density(output, road, blurred_road, slope)
            }
            Pass::TriangleHeight { triangles, heights } => triangle_heights(output, triangles, heights),
        }
    }

    fn copy(&mut self, source: &Channel, destination: &mut Channel) {
        destination.clone_from(source);
    }

    fn snapshot(&mut self, source: &Channel) -> Channel {
        source.clone()
    }

    fn read_channel(&mut self, target: &Channel) -> Result<Channel> {
        Ok(target.clone())
    }

    fn upload_channel(&mut self, channel: &Channel) -> Channel {
        channel.clone()
    }
}

impl TerrainBackend for SoftwareBackend {
    type Batch = SoftwareBatch;
    type FrameTarget = SoftwareFrame;

    fn upload_mesh(&mut self, mesh: &Mesh) -> SoftwareBatch {
        self.uploads += 1;
        SoftwareBatch { vertices: mesh.vertices.len(), triangles: mesh.triangle_count() }
    }

    fn reserve_tiles(&mut self, count: usize) {
        self.reserved_tiles = count;
        self.pending.clear();
    }

    fn draw_frame(&mut self, frame: &FrameDraw<'_, Channel, SoftwareBatch>, target: &mut SoftwareFrame) {
        target.frames += 1;
        target.tiles = frame.tiles.iter().map(|t| t.id).collect();
        target.population = frame.population.iter().map(|p| (p.tile, p.slot)).collect();
        target.occluders = frame.occluders.iter().map(|o| o.query).collect();
        target.bounds = frame.bounds.len();
        target.triangles = frame.tiles.iter().map(|t| t.batch.triangles).sum::<usize>()
            + frame.population.iter().map(|p| p.batch.triangles).sum::<usize>();

        if self.declines_queries {
            return;
        }
        for occluder in &frame.occluders {
            let visible = !self.occluded.contains(&occluder.query.tile);
            self.pending.insert(occluder.query, visible);
        }
    }

    fn issues_occlusion_queries(&self) -> bool {
        !self.declines_queries
    }

    fn poll_occlusion(&mut self, query: QueryId) -> Option<bool> {
        self.pending.remove(&query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Aabb;
    use crate::view::backend::{FrameUniforms, OccluderDraw};

    fn run(backend: &mut SoftwareBackend, pass: Pass<'_, Channel>, size: u32) -> Channel {
        let mut out = backend.create_target(size);
        backend.run_pass(&pass, &mut out);
        out
    }

    #[test]
    fn heightmap_is_normalized_and_seeded() {
        let mut backend = SoftwareBackend::new();
        let a = run(&mut backend, Pass::Heightmap { seed: 0.0, octaves: 6, scale: 5.0 }, 64);
        let b = run(&mut backend, Pass::Heightmap { seed: 3.0, octaves: 6, scale: 5.0 }, 64);
        let (lo, hi) = a.min_max().unwrap();
        assert!(lo >= 0.0 && hi <= 1.0 && hi > lo);
        assert_ne!(a, b);
    }

    #[test]
    fn sobel_of_a_flat_image_is_zero() {
        let mut backend = SoftwareBackend::new();
        let mut flat = Channel::new(16, 16);
        flat.fill(0.4);
        let slope = run(&mut backend, Pass::Sobel { source: &flat }, 16);
        assert!(slope.data().iter().all(|v| *v == 0.0));

        let ramp = Channel::from_fn(16, 16, |x, _| x as f32 / 16.0);
        let slope = run(&mut backend, Pass::Sobel { source: &ramp }, 16);
        assert!(slope.get(8, 8) > 0.0);
    }

    #[test]
    fn blur_spreads_a_spike() {
        let mut backend = SoftwareBackend::new();
        let mut spike = Channel::new(9, 9);
        spike.set(4, 4, 1.0);
        let blurred = run(&mut backend, Pass::Blur { source: &spike, iteration: 0 }, 9);
        assert_eq!(blurred.get(4, 4), 0.0);
        assert_eq!(blurred.get(3, 3), 0.25);
    }

    #[test]
    fn missing_inputs_read_as_zero() {
        let mut backend = SoftwareBackend::new();
        let density = run(
            &mut backend,
            Pass::MeshDensity { road: None, blurred_road: None, slope: None },
            8,
        );
        assert!(density.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn occlusion_answers_arrive_after_a_draw() {
        let mut backend = SoftwareBackend::new();
        backend.set_tile_occluded(1, true);
        let query = QueryId { tile: 1, slot: 0 };
        assert_eq!(backend.poll_occlusion(query), None);
        let mut frame = FrameDraw::<Channel, SoftwareBatch>::new(FrameUniforms::default());
        frame.occluders.push(OccluderDraw {
            query,
            bounds: Aabb::new(glam::Vec3::ZERO, glam::Vec3::ONE),
        });
        let mut target = SoftwareFrame::default();
        backend.draw_frame(&frame, &mut target);
        assert_eq!(target.occluders, vec![query]);
        assert_eq!(backend.poll_occlusion(query), Some(false));
        assert_eq!(backend.poll_occlusion(query), None);
    }
}
