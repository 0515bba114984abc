use std::sync::Arc;

use glam::{Vec2, Vec3};

use super::channel::Channel;
use super::delaunay;
use super::generation::GenerationEpoch;
use super::occlusion::OcclusionState;
use super::poisson::PoissonDisk;
use super::road::RoadPathPlanner;
use crate::utils::{Aabb, Mesh, Rect, Vertex};

pub type TileId = usize;

/// Extra room sampled around each tile so the triangulation near the edges
/// sees its neighbours' points.
pub const TILE_MARGIN: f32 = 20.0;
pub const MIN_SAMPLE_SPACING: f32 = 0.75;
pub const MAX_SAMPLE_SPACING: f32 = 45.0;
pub const SAMPLE_ATTEMPTS: u32 = 80;
pub const BORDER_SUBDIVISIONS: u32 = 75;
/// Padding applied to the sampled height range of a tile.
pub const HEIGHT_RANGE_PADDING: Vec2 = Vec2::new(-0.15, 0.2);
// interior samples stay this far from the tile edges so only border-ring
// vertices sit on a seam
const EDGE_EPSILON: f32 = 0.25;

/// Square grid of `tiles_per_row^2` tiles over a `size x size` terrain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub size: f32,
    pub tiles_per_row: u32,
}

impl TileGrid {
    pub fn new(size: u32, tiles_per_row: u32) -> Self {
        Self { size: size as f32, tiles_per_row: tiles_per_row.max(1) }
    }

    pub fn num_tiles(&self) -> usize {
        (self.tiles_per_row as usize).pow(2)
    }

    pub fn tile_size(&self) -> f32 {
        self.size / self.tiles_per_row as f32
    }

    pub fn full_area(&self) -> Rect {
        Rect::new(Vec2::ZERO, Vec2::splat(self.size))
    }

    /// Pixel-space area of tile `id`. Corners land on whole pixels and the
    /// last row and column are clipped to the terrain.
    pub fn area(&self, id: TileId) -> Rect {
        let n = self.tiles_per_row as usize;
        let pos = Vec2::new((id % n) as f32, (id / n) as f32);
        let step = self.tile_size().ceil();
        let ul = (pos * step).min(Vec2::splat(self.size));
        let lr = (ul + Vec2::splat(step)).min(Vec2::splat(self.size));
        Rect::new(ul, lr)
    }

    /// Tile whose area contains `p` (x/z in pixel space).
    pub fn tile_at(&self, p: Vec2) -> Option<TileId> {
        if !self.full_area().contains(p) {
            return None;
        }
        let step = self.tile_size().ceil();
        let n = self.tiles_per_row as usize;
        let x = ((p.x / step) as usize).min(n - 1);
        let y = ((p.y / step) as usize).min(n - 1);
        Some(y * n + x)
    }
}

/// Bounds of a tile for one generation. `aabb` is flat in y apart from the
/// population it carries; the terrain height is applied through
/// `height_range` and the elevation at lookup time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub aabb: Aabb,
    pub height_range: Vec2,
}

impl TileBounds {
    pub fn flat(area: &Rect) -> Self {
        Self {
            aabb: Aabb::new(
                Vec3::new(area.min.x, 0.0, area.min.y),
                Vec3::new(area.max.x, 0.0, area.max.y),
            ),
            height_range: Vec2::ZERO,
        }
    }

    pub fn from_heights(area: &Rect, heights: impl IntoIterator<Item = f32>) -> Self {
        let (lo, hi) = heights
            .into_iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), h| (lo.min(h), hi.max(h)));
        let mut bounds = Self::flat(area);
        if lo <= hi {
            bounds.height_range = Vec2::new(lo, hi) + HEIGHT_RANGE_PADDING;
        }
        bounds
    }

    pub fn scaled(&self, elevation: f32) -> Aabb {
        let mut aabb = self.aabb;
        aabb.min.y += self.height_range.x * elevation;
        aabb.max.y += self.height_range.y * elevation;
        aabb
    }
}

/// Geometry produced by a tile worker. Never touches the GPU.
#[derive(Debug, Clone)]
pub struct TileGeometry {
    pub id: TileId,
    pub area: Rect,
    pub mesh: Mesh,
    pub bounds: TileBounds,
}

/// Read-only inputs shared by every tile worker of a generation.
#[derive(Debug, Clone)]
pub struct TileInputs {
    pub grid: TileGrid,
    pub heights: Option<Arc<Channel>>,
    pub density: Option<Arc<Channel>>,
    pub road: Arc<RoadPathPlanner>,
}

/// Samples, triangulates and bounds a single tile.
pub fn build_tile_geometry(id: TileId, inputs: &TileInputs) -> TileGeometry {
    let grid = inputs.grid;
    let area = grid.area(id);
    let sample_area = area.expanded(TILE_MARGIN).clipped(&grid.full_area());

    let density = |p: Vec2| inputs.density.as_ref().map_or(0.0, |c| c.get_value(p));
    let spacing = |p: Vec2| {
        (MAX_SAMPLE_SPACING - density(p) * MAX_SAMPLE_SPACING)
            .clamp(MIN_SAMPLE_SPACING, MAX_SAMPLE_SPACING)
    };

    let initial = inputs.road.samples_in(&sample_area);
    let samples = PoissonDisk::new(sample_area, MIN_SAMPLE_SPACING, MAX_SAMPLE_SPACING)
        .with_attempts(SAMPLE_ATTEMPTS)
        .with_seed(id as u64)
        .sample(&initial, spacing, |_| true);

    let mut points: Vec<Vec2> = samples
        .into_iter()
        .filter(|p| area.contains_inset(*p, EDGE_EPSILON))
        .collect();
    points.extend(border_ring(&area));

    let triangulation = delaunay::triangulate(&points);

    let full = Vec2::splat(grid.size);
    let vertices: Vec<Vertex> = points.iter().map(|p| Vertex::flat(p.x, p.y, *p / full)).collect();
    let mut indices = Vec::with_capacity(triangulation.triangles.len());
    for tri in triangulation.triangles.chunks(3) {
        let (a, b, c) = (points[tri[0]], points[tri[1]], points[tri[2]]);
        // (x, 0, z) triangles face +y when counter-clockwise seen from above
        if (b - a).perp_dot(c - a) < 0.0 {
            indices.extend([tri[0] as u32, tri[1] as u32, tri[2] as u32]);
        } else {
            indices.extend([tri[0] as u32, tri[2] as u32, tri[1] as u32]);
        }
    }

    let bounds = match &inputs.heights {
        Some(heights) => TileBounds::from_heights(&area, points.iter().map(|p| heights.get_value(*p))),
        None => TileBounds::from_heights(&area, [0.0]),
    };

    TileGeometry { id, area, mesh: Mesh { vertices, indices }, bounds }
}

/// Evenly subdivided tile outline. Points on a shared edge are computed
/// from the same row/column values on both sides, so seams coincide.
pub fn border_ring(area: &Rect) -> Vec<Vec2> {
    let size = area.size();
    let n = BORDER_SUBDIVISIONS;
    let mut ring = Vec::with_capacity(4 * n as usize);
    for i in 0..=n {
        let t = i as f32 / n as f32;
        let x = area.min.x + t * size.x;
        ring.push(Vec2::new(x, area.min.y));
        ring.push(Vec2::new(x, area.max.y));
    }
    for i in 1..n {
        let t = i as f32 / n as f32;
        let y = area.min.y + t * size.y;
        ring.push(Vec2::new(area.min.x, y));
        ring.push(Vec2::new(area.max.x, y));
    }
    ring
}

/// Recomputes a tile's bounds from a heightmap using a shared sample
/// pattern expressed relative to the tile's upper-left corner.
pub fn resample_bounds(area: &Rect, pattern: &[Vec2], heights: &Channel) -> TileBounds {
    TileBounds::from_heights(
        area,
        pattern
            .iter()
            .map(|p| area.min + *p)
            .filter(|p| area.contains(*p))
            .map(|p| heights.get_value(p)),
    )
}

/// Main-thread tile record. `B` is the backend's GPU batch type.
#[derive(Debug)]
pub struct Tile<B> {
    pub id: TileId,
    pub area: Rect,
    pub geometry: TileGeometry,
    /// Indexed by generation slot.
    pub bounds: [TileBounds; 2],
    pub batch: Option<B>,
    /// Build animation progress in `[0, 1]`.
    pub completion: f32,
    pub population: [Option<B>; 2],
    pub population_completion: [f32; 2],
    pub population_instances: [usize; 2],
    /// Extents of each population slot, kept so new bounds can cover them.
    pub population_bounds: [Option<Aabb>; 2],
    pub current_population: usize,
    pub occlusion: OcclusionState,
}

impl<B> Tile<B> {
    pub fn new(geometry: TileGeometry) -> Self {
        Self {
            id: geometry.id,
            area: geometry.area,
            bounds: [geometry.bounds; 2],
            geometry,
            batch: None,
            completion: 0.0,
            population: [None, None],
            population_completion: [0.0; 2],
            population_instances: [0; 2],
            population_bounds: [None; 2],
            current_population: 0,
            occlusion: OcclusionState::new(),
        }
    }

    /// Bounds blended from the previous to the current generation and
    /// scaled by `elevation`.
    pub fn bounds_at(&self, epoch: &GenerationEpoch, elevation: f32) -> Aabb {
        let prev = self.bounds[epoch.previous()].scaled(elevation);
        let cur = self.bounds[epoch.current()].scaled(elevation);
        prev.lerp(&cur, epoch.progression())
    }

    /// Records the extents of population slot `slot` and grows the
    /// current bounds to cover them.
    pub fn include_population(&mut self, epoch: &GenerationEpoch, slot: usize, population: &Aabb) {
        self.population_bounds[slot] = Some(*population);
        let bounds = &mut self.bounds[epoch.current()];
        bounds.aabb = bounds.aabb.union(population);
    }

    /// Replaces the bounds of one generation, keeping every live
    /// population inside.
    pub fn set_bounds(&mut self, generation: usize, mut bounds: TileBounds) {
        for population in self.population_bounds.iter().flatten() {
            bounds.aabb = bounds.aabb.union(population);
        }
        self.bounds[generation] = bounds;
    }

    pub fn release_population(&mut self, slot: usize) {
        self.population[slot] = None;
        self.population_instances[slot] = 0;
        self.population_bounds[slot] = None;
    }

    pub fn population_slots(&self) -> impl Iterator<Item = (usize, &B, f32)> {
        self.population
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i, b, self.population_completion[i])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn inputs(size: u32, tiles_per_row: u32) -> TileInputs {
        let mut road = RoadPathPlanner::new();
        road.ensure_spline(size as f32, 0.0);
        TileInputs {
            grid: TileGrid::new(size, tiles_per_row),
            heights: Some(Arc::new(Channel::from_fn(size, size, |x, y| (x + y) as f32 / (2 * size) as f32))),
            density: None,
            road: Arc::new(road),
        }
    }

    #[test]
    fn grid_covers_the_terrain() {
        let grid = TileGrid::new(256, 3);
        assert_eq!(grid.num_tiles(), 9);
        assert_eq!(grid.area(0).min, Vec2::ZERO);
        assert_eq!(grid.area(8).max, Vec2::splat(256.0));
        assert_eq!(grid.area(1).min.x, grid.area(0).max.x);
        assert_eq!(grid.tile_at(Vec2::new(200.0, 10.0)), Some(2));
        assert_eq!(grid.tile_at(Vec2::new(-1.0, 10.0)), None);
    }

    #[test]
    fn geometry_is_flat_and_faces_up() {
        let inputs = inputs(128, 2);
        let geometry = build_tile_geometry(3, &inputs);
        assert!(geometry.mesh.triangle_count() > 0);
        assert!(geometry.mesh.vertices.iter().all(|v| v.pos[1] == 0.0));
        for tri in geometry.mesh.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|k| geometry.mesh.vertices[tri[k] as usize].position());
            assert!((b - a).cross(c - a).y >= 0.0);
        }
        let area = geometry.area;
        assert!(geometry.mesh.vertices.iter().all(|v| area.contains(Vec2::new(v.pos[0], v.pos[2]))));
        assert!(geometry.bounds.height_range.y > geometry.bounds.height_range.x);
    }

    #[test]
    fn neighbouring_tiles_share_seam_vertices() {
        let inputs = inputs(128, 2);
        let left = build_tile_geometry(0, &inputs);
        let right = build_tile_geometry(1, &inputs);
        let below = build_tile_geometry(2, &inputs);
        let seam_x = left.area.max.x;
        let seam_z = left.area.max.y;

        let on = |g: &TileGeometry, f: &dyn Fn(&Vertex) -> bool| -> HashSet<(u32, u32)> {
            g.mesh
                .vertices
                .iter()
                .filter(|v| f(v))
                .map(|v| (v.pos[0].to_bits(), v.pos[2].to_bits()))
                .collect()
        };
        let a = on(&left, &|v| v.pos[0] == seam_x);
        let b = on(&right, &|v| v.pos[0] == seam_x);
        assert!(!a.is_empty());
        assert_eq!(a, b);

        let c = on(&left, &|v| v.pos[2] == seam_z);
        let d = on(&below, &|v| v.pos[2] == seam_z);
        assert!(!c.is_empty());
        assert_eq!(c, d);
    }

    #[test]
    fn bounds_blend_between_generations() {
        let inputs = inputs(64, 1);
        let mut tile: Tile<()> = Tile::new(build_tile_geometry(0, &inputs));
        let mut epoch = GenerationEpoch::new();
        epoch.flip();
        tile.bounds[epoch.current()].height_range = Vec2::new(0.0, 1.0);
        tile.bounds[epoch.previous()].height_range = Vec2::new(0.0, 0.0);
        epoch.set_progression(0.5);
        let b = tile.bounds_at(&epoch, 10.0);
        assert!((b.max.y - 5.0).abs() < 1e-4);
    }
}
