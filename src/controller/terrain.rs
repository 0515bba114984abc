use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Vec2, Vec3};

use crate::config::{Appearance, TerrainFormat};
use crate::model::noise::{noise_table, NOISE_TABLE_SIZE};
use crate::model::poisson::PoissonDisk;
use crate::model::population::PopulationInputs;
use crate::model::road::snap_to_heights;
use crate::model::tile::{resample_bounds, TileInputs};
use crate::model::{
    BSpline, Camera, Channel, DoubleBuffer, GenerationEpoch, Prototypes, RoadPathPlanner, Tile,
    TileBounds, TileGrid, TileId,
};
use crate::utils::Rect;
use crate::view::backend::{
    Explosions, FrameDraw, FrameUniforms, PopulationDraw, TerrainBackend, TileDraw,
};

use super::culling::TileCullingEngine;
use super::population_scheduler::PopulationScheduler;
use super::synthesizer::{rasterize_triangles, synthesize, SynthesisParams};
use super::tile_scheduler::TileScheduler;
use super::timeline::{Ease, FinishAction, Timeline, TweenTarget};

const HEIGHTMAP_TRANSITION: f32 = 2.0;
const TILE_BUILD_DURATION: f32 = 3.5;
const POPULATION_FADE_DURATION: f32 = 3.5;
/// Spacing of the shared bounds sample pattern, relative to the terrain size.
const BOUNDS_SAMPLE_SPACING: f32 = 8.0 / 1024.0;
const DEFAULT_EXPLOSION_SIZE: f32 = 0.001;

/// What gets drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layers {
    pub terrain: bool,
    pub population: bool,
    pub bounds: bool,
}

impl Default for Layers {
    fn default() -> Self {
        Self { terrain: true, population: true, bounds: false }
    }
}

/// CPU side timings and counts of the last rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub culling: Duration,
    pub terrain: Duration,
    pub occlusion: Duration,
    pub tiles_in_frustum: usize,
    pub visible_tiles: usize,
    pub rendered_instances: usize,
    pub queries_issued: usize,
    pub query_results: usize,
}

/// Image products of the last synthesis that later stages read.
struct Maps<T> {
    road: Option<T>,
    blurred_road: Option<T>,
    slope: Option<T>,
    mesh_density: Option<T>,
    flora: Option<T>,
}

impl<T> Default for Maps<T> {
    fn default() -> Self {
        Self { road: None, blurred_road: None, slope: None, mesh_density: None, flora: None }
    }
}

/// The generative landscape: heightfield, road, tiles and vegetation.
///
/// All methods run on the thread that owns the backend. Tile and
/// population work happens on worker threads started here and is
/// collected by `update`, which the host calls once per frame before
/// `render`.
pub struct Terrain<B: TerrainBackend> {
    format: TerrainFormat,
    backend: B,
    grid: TileGrid,

    epoch: GenerationEpoch,
    heightmaps: DoubleBuffer<Option<B::Target>>,
    height_channel: Option<Arc<Channel>>,
    road: Arc<RoadPathPlanner>,
    road_splines: DoubleBuffer<Option<BSpline<Vec3>>>,
    road_length: f32,
    triangle_heightmaps: DoubleBuffer<Option<B::Target>>,
    triangle_slot: usize,
    triangle_channel: Option<Arc<Channel>>,
    maps: Maps<B::Target>,
    mesh_density_channel: Option<Arc<Channel>>,
    flora_channel: Option<Arc<Channel>>,
    noise_table: Option<B::Target>,
    prototypes: Arc<Prototypes>,

    tiles: Vec<Tile<B::Batch>>,
    tile_scheduler: TileScheduler,
    population_scheduler: PopulationScheduler,
    timeline: Timeline,
    culling: TileCullingEngine,

    layers: Layers,
    explosions: Explosions,
    stats: FrameStats,
}

impl<B: TerrainBackend> Terrain<B> {
    /// Builds the noise lookup table and the vegetation prototypes. Nothing
    /// is generated until `start`.
    pub fn new(format: TerrainFormat, mut backend: B) -> Self {
        let noise = backend.upload_channel(&noise_table(NOISE_TABLE_SIZE, format.seed));
        let prototypes = Arc::new(Prototypes::build());
        tracing::info!(
            size = format.size,
            tiles_per_row = format.tiles_per_row,
            threads = format.num_working_threads,
            "terrain created"
        );
        Self {
            grid: TileGrid::new(format.size, format.tiles_per_row),
            culling: TileCullingEngine::new(format.occlusion_culling),
            format,
            backend,
            epoch: GenerationEpoch::new(),
            heightmaps: DoubleBuffer::new(None, None),
            height_channel: None,
            road: Arc::new(RoadPathPlanner::new()),
            road_splines: DoubleBuffer::new(None, None),
            road_length: 0.0,
            triangle_heightmaps: DoubleBuffer::new(None, None),
            triangle_slot: 0,
            triangle_channel: None,
            maps: Maps::default(),
            mesh_density_channel: None,
            flora_channel: None,
            noise_table: Some(noise),
            prototypes,
            tiles: Vec::new(),
            tile_scheduler: TileScheduler::new(),
            population_scheduler: PopulationScheduler::new(),
            timeline: Timeline::new(),
            layers: Layers::default(),
            explosions: Explosions {
                tile_size: DEFAULT_EXPLOSION_SIZE,
                population_size: DEFAULT_EXPLOSION_SIZE,
                ..Explosions::default()
            },
            stats: FrameStats::default(),
        }
    }

    /// Generates the heightfield and starts building tiles; population
    /// follows once every tile is in.
    pub fn start(&mut self) {
        self.generate_height_map();
        self.create_tiles();
    }

    /// Rebuilds every tile from the current maps. Ignored while tiles are
    /// being built or populated.
    pub fn create_tiles(&mut self) {
        if self.is_building() || self.is_populating() {
            tracing::debug!("create_tiles ignored, terrain is busy");
            return;
        }
        self.tile_scheduler.shutdown();
        self.population_scheduler.shutdown();
        self.tiles.clear();
        // tweens of the old registry would land on new tiles with the same ids
        self.timeline.cancel(|target| target != TweenTarget::Progression);

        self.backend.reserve_tiles(self.grid.num_tiles());
        let inputs = TileInputs {
            grid: self.grid,
            heights: self.height_channel.clone(),
            density: self.mesh_density_channel.clone(),
            road: self.road.clone(),
        };
        self.tile_scheduler.start(inputs, self.threads(), self.format.stagger_workers);
    }

    /// Flips the generation, runs the synthesis passes into the new
    /// current slot and starts blending over from the previous one.
    pub fn generate_height_map(&mut self) {
        let started = Instant::now();
        self.epoch.flip();
        self.timeline.apply(
            TweenTarget::Progression,
            0.0,
            1.0,
            HEIGHTMAP_TRANSITION,
            Ease::InCubic,
            FinishAction::None,
        );

        let size = self.format.size as f32;
        let seed = self.format.seed;
        Arc::make_mut(&mut self.road).ensure_spline(size, seed);
        let strip = self.road.strip(size, seed);

        let output = synthesize(&mut self.backend, &SynthesisParams::from(&self.format), &strip);
        let current = self.epoch.current();
        self.heightmaps.set(current, output.heightmap);
        self.height_channel = output.height_channel.map(Arc::new);
        self.mesh_density_channel = output.mesh_density_channel.map(Arc::new);
        self.flora_channel = output.flora_channel.map(Arc::new);
        self.maps = Maps {
            road: output.road,
            blurred_road: output.blurred_road,
            slope: output.slope,
            mesh_density: output.mesh_density,
            flora: output.flora,
        };

        let spline = self.road.spline().map(|road| snap_to_heights(road, self.height_channel.as_deref()));
        self.road_length = spline.as_ref().map_or(0.0, |s| s.length());
        self.road_splines.set(current, spline);

        self.update_tiles_bounds();
        tracing::info!(slot = current, elapsed = ?started.elapsed(), "heightmap generated");
    }

    /// Rasterizes the triangles of every tile, with the heights of the
    /// current heightmap under their corners, into a fresh texture.
    pub fn generate_triangle_height_map(&mut self) {
        self.triangle_slot ^= 1;
        let triangles: Vec<Vec2> = self
            .tiles
            .iter()
            .flat_map(|tile| {
                let mesh = &tile.geometry.mesh;
                mesh.indices.iter().map(move |i| {
                    let p = mesh.vertices[*i as usize].pos;
                    Vec2::new(p[0], p[2])
                })
            })
            .collect();

        let heightmap = self.heightmaps.current(&self.epoch).as_ref();
        let target = rasterize_triangles(&mut self.backend, self.format.size, &triangles, heightmap);
        self.triangle_channel = match &target {
            Some(target) => match self.backend.read_channel(target) {
                Ok(channel) => Some(Arc::new(channel)),
                Err(e) => {
                    tracing::error!("triangle heightmap readback failed: {e}");
                    None
                }
            },
            None => None,
        };
        self.triangle_heightmaps.set(self.triangle_slot, target);
        tracing::debug!(triangles = triangles.len() / 3, "triangle heightmap generated");
    }

    pub fn generate_tiles_population(&mut self) {
        self.populate_tiles();
    }

    /// Populates again without clearing first: the running population
    /// fades out while the new one fades in.
    pub fn regenerate_tiles_population(&mut self) {
        self.populate_tiles();
    }

    /// Fades the current population of every tile out and releases it.
    pub fn remove_tiles_population(&mut self) {
        self.fade_out_population();
    }

    /// Fraction of the tile grid present in the registry, in `[0, 1]`.
    pub fn tiles_threads_completion(&self) -> f32 {
        let n = self.grid.num_tiles().max(1);
        (self.tiles.len() as f32 / n as f32).min(1.0)
    }

    /// Collects finished worker output and advances the animations.
    pub fn update(&mut self, dt: f32) {
        self.update_tiles();
        self.update_population();
        self.advance_timeline(dt);
    }

    /// Culls and draws one frame from `camera`.
    pub fn render(&mut self, camera: &Camera, target: &mut B::FrameTarget) {
        let elevation = self.elevation();
        let started = Instant::now();
        let culled = self.culling.cull(
            &mut self.backend,
            &mut self.tiles,
            camera,
            &self.epoch,
            elevation,
            &self.grid,
        );
        let culling = started.elapsed();

        let uniforms = FrameUniforms {
            view_proj: camera.view_proj(),
            eye: camera.eye,
            elevation,
            progression: self.epoch.progression(),
            size: self.format.size as f32,
            appearance: self.format.appearance,
            explosions: self.explosions,
        };
        let mut frame = FrameDraw::new(uniforms);
        frame.current_heightmap = self.heightmaps.current(&self.epoch).as_ref();
        frame.previous_heightmap =
            self.heightmaps.previous(&self.epoch).as_ref().or(frame.current_heightmap);
        frame.triangle_heightmap = self.triangle_heightmaps.get(self.triangle_slot).as_ref();
        frame.noise = self.noise_table.as_ref();

        let mut rendered_instances = 0;
        for &i in &culled.visible {
            let tile = &self.tiles[i];
            if self.layers.terrain {
                if let Some(batch) = &tile.batch {
                    frame.tiles.push(TileDraw { id: tile.id, batch, completion: tile.completion });
                }
            }
            if self.layers.population {
                for (slot, batch, completion) in tile.population_slots() {
                    rendered_instances += tile.population_instances[slot];
                    frame.population.push(PopulationDraw {
                        tile: tile.id,
                        slot,
                        batch,
                        completion,
                        instances: tile.population_instances[slot],
                    });
                }
            }
        }
        if self.layers.bounds {
            frame.bounds = self.tiles.iter().map(|t| t.bounds_at(&self.epoch, elevation)).collect();
        }
        let queries_issued = culled.occluders.len();
        frame.occluders = culled.occluders;

        let draw_started = Instant::now();
        self.backend.draw_frame(&frame, target);
        let terrain = draw_started.elapsed();

        self.stats = FrameStats {
            culling,
            terrain,
            occlusion: culled.occlusion_time,
            tiles_in_frustum: culled.in_frustum,
            visible_tiles: frame.tiles.len(),
            rendered_instances,
            queries_issued,
            query_results: culled.results_read,
        };
    }

    /// Point on the camera path: the road blended from the previous to
    /// the current generation, heights scaled by the elevation.
    pub fn road_point(&self, t: f32) -> Option<Vec3> {
        let current = self.road_splines.current(&self.epoch).as_ref()?;
        let previous = self.road_splines.previous(&self.epoch).as_ref().unwrap_or(current);
        let p = previous.position(t).lerp(current.position(t), self.epoch.progression());
        Some(Vec3::new(p.x, p.y * self.elevation(), p.z))
    }

    fn threads(&self) -> usize {
        self.format.num_working_threads.max(1) as usize
    }

    fn tile_mut(&mut self, id: TileId) -> Option<&mut Tile<B::Batch>> {
        self.tiles.iter_mut().find(|t| t.id == id)
    }

    /// Recomputes the current bounds of every tile from the new heightmap
    /// with one sample pattern shared by all tiles.
    fn update_tiles_bounds(&mut self) {
        let current = self.epoch.current();
        let Some(heights) = self.height_channel.clone() else {
            for tile in &mut self.tiles {
                tile.set_bounds(current, TileBounds::from_heights(&tile.area, [0.0]));
            }
            return;
        };
        let spacing = BOUNDS_SAMPLE_SPACING * self.format.size as f32;
        let tile_area = Rect::new(Vec2::ZERO, Vec2::splat(self.grid.tile_size()));
        let pattern = PoissonDisk::new(tile_area, spacing, spacing)
            .with_seed(self.format.seed.to_bits() as u64)
            .sample(&[], |_| spacing, |_| true);
        for tile in &mut self.tiles {
            let bounds = resample_bounds(&tile.area, &pattern, &heights);
            tile.set_bounds(current, bounds);
        }
    }

    fn update_tiles(&mut self) {
        if !self.tile_scheduler.is_building() {
            return;
        }
        for geometry in self.tile_scheduler.drain() {
            let id = geometry.id;
            self.tiles.retain(|t| t.id != id);
            let mut tile = Tile::new(geometry);
            tile.batch = Some(self.backend.upload_mesh(&tile.geometry.mesh));
            self.tiles.push(tile);
            self.timeline.apply(
                TweenTarget::TileBuild(id),
                0.0,
                1.0,
                TILE_BUILD_DURATION,
                Ease::OutQuad,
                FinishAction::None,
            );
        }

        if self.tiles.len() >= self.grid.num_tiles() || self.tile_scheduler.all_delivered() {
            if self.tile_scheduler.lost() > 0 {
                tracing::error!(lost = self.tile_scheduler.lost(), "some tiles were never built");
            }
            self.tile_scheduler.finish();
            self.generate_triangle_height_map();
            self.snap_road_to_triangles();
            tracing::info!(tiles = self.tiles.len(), "tiles built");
            self.populate_tiles();
        }
    }

    /// Lifts the current 3D road onto the triangle heightmap, which is
    /// what the rendered mesh actually looks like.
    fn snap_road_to_triangles(&mut self) {
        let Some(channel) = self.triangle_channel.clone() else {
            return;
        };
        if let Some(road) = self.road.spline() {
            let spline = snap_to_heights(road, Some(&channel));
            self.road_length = spline.length();
            self.road_splines.set(self.epoch.current(), Some(spline));
        }
    }

    fn fade_out_population(&mut self) {
        for tile in &self.tiles {
            let slot = tile.current_population;
            self.timeline.apply(
                TweenTarget::PopulationFade { tile: tile.id, slot },
                tile.population_completion[slot],
                0.0,
                POPULATION_FADE_DURATION,
                Ease::OutQuad,
                FinishAction::ReleasePopulation { tile: tile.id, slot },
            );
        }
    }

    fn populate_tiles(&mut self) {
        if self.is_populating() {
            tracing::debug!("population already running");
            return;
        }
        self.fade_out_population();
        let inputs = PopulationInputs {
            grid: self.grid,
            flora: self.flora_channel.clone(),
            seed: self.format.seed,
            balance: self.format.population_balance,
            prototypes: self.prototypes.clone(),
        };
        self.population_scheduler.start(inputs, self.threads(), self.format.stagger_workers);
    }

    fn update_population(&mut self) {
        if !self.population_scheduler.is_populating() {
            return;
        }
        for data in self.population_scheduler.drain() {
            let epoch = self.epoch;
            let batch = (!data.mesh.is_empty()).then(|| self.backend.upload_mesh(&data.mesh));
            let Some(tile) = self.tile_mut(data.tile_id) else {
                tracing::debug!(tile = data.tile_id, "population for a missing tile");
                continue;
            };
            tile.current_population ^= 1;
            let slot = tile.current_population;
            tile.population_instances[slot] = if batch.is_some() { data.instances.len() } else { 0 };
            tile.population[slot] = batch;
            tile.population_bounds[slot] = None;
            if let Some(bounds) = data.bounds {
                tile.include_population(&epoch, slot, &bounds);
            }
            let id = tile.id;
            self.timeline.apply(
                TweenTarget::PopulationFade { tile: id, slot },
                0.0,
                1.0,
                POPULATION_FADE_DURATION,
                Ease::OutQuad,
                FinishAction::None,
            );
        }

        if self.population_scheduler.all_delivered() {
            self.population_scheduler.finish();
        }
    }

    fn advance_timeline(&mut self, dt: f32) {
        let step = self.timeline.update(dt);
        for (target, value) in step.values {
            match target {
                TweenTarget::Progression => self.epoch.set_progression(value),
                TweenTarget::TileBuild(id) => {
                    if let Some(tile) = self.tile_mut(id) {
                        tile.completion = value;
                    }
                }
                TweenTarget::PopulationFade { tile, slot } => {
                    if let Some(tile) = self.tile_mut(tile) {
                        tile.population_completion[slot] = value;
                    }
                }
            }
        }
        for action in step.finished {
            if let FinishAction::ReleasePopulation { tile, slot } = action {
                if let Some(tile) = self.tile_mut(tile) {
                    tile.release_population(slot);
                }
            }
        }
    }

    pub fn is_building(&self) -> bool {
        self.tile_scheduler.is_building()
    }

    pub fn is_populating(&self) -> bool {
        self.population_scheduler.is_populating()
    }

    pub fn format(&self) -> &TerrainFormat {
        &self.format
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn tiles(&self) -> &[Tile<B::Batch>] {
        &self.tiles
    }

    pub fn seed(&self) -> f32 {
        self.format.seed
    }

    pub fn set_seed(&mut self, seed: f32) {
        self.format.seed = seed;
    }

    pub fn octaves(&self) -> u32 {
        self.format.octaves
    }

    pub fn set_octaves(&mut self, octaves: u32) {
        self.format.octaves = octaves;
    }

    pub fn noise_scale(&self) -> f32 {
        self.format.noise_scale
    }

    pub fn set_noise_scale(&mut self, scale: f32) {
        self.format.noise_scale = scale;
    }

    pub fn road_blur_iterations(&self) -> u32 {
        self.format.road_blur_iterations
    }

    pub fn set_road_blur_iterations(&mut self, iterations: u32) {
        self.format.road_blur_iterations = iterations;
    }

    pub fn blur_iterations(&self) -> u32 {
        self.format.blur_iterations
    }

    pub fn set_blur_iterations(&mut self, iterations: u32) {
        self.format.blur_iterations = iterations;
    }

    pub fn sobel_blur_iterations(&self) -> u32 {
        self.format.sobel_blur_iterations
    }

    pub fn set_sobel_blur_iterations(&mut self, iterations: u32) {
        self.format.sobel_blur_iterations = iterations;
    }

    /// Elevation as applied to normalized heights.
    pub fn elevation(&self) -> f32 {
        self.format.effective_elevation()
    }

    pub fn set_elevation(&mut self, elevation: f32) {
        self.format.elevation = elevation;
    }

    pub fn appearance(&self) -> &Appearance {
        &self.format.appearance
    }

    /// Fog and sun parameters, picked up by the next `render`.
    pub fn appearance_mut(&mut self) -> &mut Appearance {
        &mut self.format.appearance
    }

    pub fn population_balance(&self) -> f32 {
        self.format.population_balance
    }

    pub fn set_population_balance(&mut self, balance: f32) {
        self.format.population_balance = balance;
    }

    pub fn explosions(&self) -> &Explosions {
        &self.explosions
    }

    pub fn explosions_mut(&mut self) -> &mut Explosions {
        &mut self.explosions
    }

    pub fn is_occlusion_culling_enabled(&self) -> bool {
        self.culling.is_occlusion_enabled()
    }

    pub fn set_occlusion_culling_enabled(&mut self, enabled: bool) {
        self.culling.set_occlusion_enabled(enabled, &mut self.tiles);
    }

    pub fn layers(&self) -> Layers {
        self.layers
    }

    pub fn set_layers(&mut self, layers: Layers) {
        self.layers = layers;
    }

    pub fn road_spline_2d(&self) -> Option<&BSpline<Vec2>> {
        self.road.spline()
    }

    pub fn road_spline_3d(&self) -> Option<&BSpline<Vec3>> {
        self.road_splines.current(&self.epoch).as_ref()
    }

    pub fn previous_road_spline_3d(&self) -> Option<&BSpline<Vec3>> {
        self.road_splines.previous(&self.epoch).as_ref()
    }

    pub fn road_length(&self) -> f32 {
        self.road_length
    }

    pub fn progression(&self) -> f32 {
        self.epoch.progression()
    }

    pub fn epoch(&self) -> &GenerationEpoch {
        &self.epoch
    }

    pub fn heightmap(&self) -> Option<&B::Target> {
        self.heightmaps.current(&self.epoch).as_ref()
    }

    pub fn previous_heightmap(&self) -> Option<&B::Target> {
        self.heightmaps.previous(&self.epoch).as_ref()
    }

    pub fn road_map(&self) -> Option<&B::Target> {
        self.maps.road.as_ref()
    }

    pub fn blurred_road_map(&self) -> Option<&B::Target> {
        self.maps.blurred_road.as_ref()
    }

    pub fn slope_map(&self) -> Option<&B::Target> {
        self.maps.slope.as_ref()
    }

    pub fn mesh_density_map(&self) -> Option<&B::Target> {
        self.maps.mesh_density.as_ref()
    }

    pub fn flora_map(&self) -> Option<&B::Target> {
        self.maps.flora.as_ref()
    }

    pub fn height_channel(&self) -> Option<&Arc<Channel>> {
        self.height_channel.as_ref()
    }

    pub fn mesh_density_channel(&self) -> Option<&Arc<Channel>> {
        self.mesh_density_channel.as_ref()
    }

    pub fn flora_channel(&self) -> Option<&Arc<Channel>> {
        self.flora_channel.as_ref()
    }

    pub fn triangle_height_channel(&self) -> Option<&Arc<Channel>> {
        self.triangle_channel.as_ref()
    }

    pub fn num_rendered_instances(&self) -> usize {
        self.stats.rendered_instances
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }
}

impl<B: TerrainBackend> Drop for Terrain<B> {
    fn drop(&mut self) {
        self.tile_scheduler.shutdown();
        self.population_scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::view::backend::PassKind;
    use crate::view::{SoftwareBackend, SoftwareFrame};

    fn format(size: u32, tiles_per_row: u32, threads: u32) -> TerrainFormat {
        TerrainFormat::default()
            .with_size(size)
            .with_seed(0.0)
            .with_tiles_per_row(tiles_per_row)
            .with_num_working_threads(threads)
            .with_stagger_workers(false)
    }

    fn run_to_completion(terrain: &mut Terrain<SoftwareBackend>) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while (terrain.is_building() || terrain.is_populating()) && Instant::now() < deadline {
            terrain.update(0.016);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!terrain.is_building());
        assert!(!terrain.is_populating());
    }

    fn overhead_camera(size: f32) -> Camera {
        let mut camera = Camera::new(800, 600);
        camera.eye = Vec3::new(size * 0.5, size * 3.0, size * 0.5);
        camera.set_look_at(Vec3::new(size * 0.5, 0.0, size * 0.5 + 1.0));
        camera
    }

    #[test]
    fn single_tile_scenario() {
        let mut terrain = Terrain::new(format(256, 1, 1), SoftwareBackend::new());
        terrain.start();
        run_to_completion(&mut terrain);
        assert_eq!(terrain.tiles().len(), 1);
        assert_eq!(terrain.tiles()[0].id, 0);
        assert_eq!(terrain.tiles_threads_completion(), 1.0);
        assert!(terrain.road_spline_2d().unwrap().num_control_points() >= 4);
        assert!(terrain.road_length() > 0.0);
        assert!(terrain.triangle_height_channel().is_some());
    }

    #[test]
    fn completion_is_monotonic_and_ids_unique() {
        let mut terrain = Terrain::new(format(96, 3, 2), SoftwareBackend::new());
        terrain.start();
        let mut last = 0.0;
        let deadline = Instant::now() + Duration::from_secs(60);
        while terrain.is_building() && Instant::now() < deadline {
            terrain.update(0.016);
            let completion = terrain.tiles_threads_completion();
            assert!(completion >= last);
            last = completion;
        }
        assert_eq!(last, 1.0);
        let mut ids: Vec<TileId> = terrain.tiles().iter().map(|t| t.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..9).collect::<Vec<_>>());
        assert_eq!(terrain.backend().reserved_tiles(), 9);
    }

    #[test]
    fn create_tiles_while_building_is_ignored() {
        let format = format(96, 3, 1).with_stagger_workers(true);
        let mut terrain = Terrain::new(format, SoftwareBackend::new());
        terrain.start();
        let deadline = Instant::now() + Duration::from_secs(30);
        while terrain.tiles().is_empty() && Instant::now() < deadline {
            terrain.update(0.016);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(terrain.is_building());
        let before: Vec<TileId> = terrain.tiles().iter().map(|t| t.id).collect();
        let starts = terrain.tile_scheduler.starts();
        terrain.create_tiles();
        assert!(terrain.is_building());
        assert_eq!(terrain.tile_scheduler.starts(), starts);
        let after: Vec<TileId> = terrain.tiles().iter().map(|t| t.id).collect();
        assert_eq!(after, before);

        // the original run carries on to the full grid
        run_to_completion(&mut terrain);
        assert_eq!(terrain.tiles().len(), 9);
        assert_eq!(terrain.tile_scheduler.starts(), starts);
    }

    #[test]
    fn dropping_mid_build_joins_promptly() {
        let format = format(128, 4, 4).with_stagger_workers(true);
        let mut terrain = Terrain::new(format, SoftwareBackend::new());
        terrain.start();
        terrain.update(0.016);
        let started = Instant::now();
        drop(terrain);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn heightmap_generations_cross_fade() {
        let mut terrain = Terrain::new(format(64, 1, 1), SoftwareBackend::new());
        terrain.generate_height_map();
        assert_eq!(terrain.progression(), 0.0);
        assert!(terrain.previous_heightmap().is_none());
        let first = terrain.heightmap().unwrap().clone();

        terrain.update(HEIGHTMAP_TRANSITION);
        assert_eq!(terrain.progression(), 1.0);

        terrain.set_seed(7.0);
        terrain.generate_height_map();
        assert_eq!(terrain.progression(), 0.0);
        assert_eq!(terrain.previous_heightmap(), Some(&first));
        assert_ne!(terrain.heightmap(), Some(&first));

        // halfway through the blend the camera path sits between both roads
        terrain.update(HEIGHTMAP_TRANSITION * 0.5);
        let p = terrain.road_point(0.3).unwrap();
        let a = terrain.previous_road_spline_3d().unwrap().position(0.3);
        let b = terrain.road_spline_3d().unwrap().position(0.3);
        let (lo, hi) = (a.y.min(b.y), a.y.max(b.y));
        let y = p.y / terrain.elevation();
        assert!(y >= lo - 1e-4 && y <= hi + 1e-4);
    }

    #[test]
    fn regenerating_population_keeps_tiles_and_swaps_slots() {
        // without a flora map nothing is excluded, so every tile gets trees
        let backend = SoftwareBackend::without(&[PassKind::Flora]);
        let mut terrain = Terrain::new(format(128, 2, 2), backend);
        terrain.start();
        run_to_completion(&mut terrain);
        terrain.update(POPULATION_FADE_DURATION + 0.1);

        let slots: Vec<usize> = terrain.tiles().iter().map(|t| t.current_population).collect();
        for tile in terrain.tiles() {
            assert!(tile.population[tile.current_population].is_some());
            assert_eq!(tile.population_completion[tile.current_population], 1.0);
        }

        terrain.regenerate_tiles_population();
        assert!(terrain.is_populating());
        assert_eq!(terrain.tiles().len(), 4);
        run_to_completion(&mut terrain);
        for (tile, old) in terrain.tiles().iter().zip(&slots) {
            assert_eq!(tile.current_population, old ^ 1);
            assert!(tile.population[tile.current_population].is_some());
        }

        terrain.update(POPULATION_FADE_DURATION + 0.1);
        for (tile, old) in terrain.tiles().iter().zip(&slots) {
            assert!(tile.population[*old].is_none());
        }
    }

    #[test]
    fn removing_population_releases_every_slot() {
        let backend = SoftwareBackend::without(&[PassKind::Flora]);
        let mut terrain = Terrain::new(format(64, 2, 1), backend);
        terrain.start();
        run_to_completion(&mut terrain);
        terrain.remove_tiles_population();
        terrain.update(POPULATION_FADE_DURATION + 0.1);
        assert!(terrain.tiles().iter().all(|t| t.population_slots().next().is_none()));
    }

    #[test]
    fn new_heightmap_bounds_still_cover_population() {
        let backend = SoftwareBackend::without(&[PassKind::Flora]);
        let mut terrain = Terrain::new(format(64, 2, 2), backend);
        terrain.start();
        run_to_completion(&mut terrain);

        terrain.set_seed(3.0);
        terrain.generate_height_map();
        let current = terrain.epoch().current();
        let mut covered = 0;
        for tile in terrain.tiles() {
            let Some(population) = tile.population_bounds[tile.current_population] else {
                continue;
            };
            let bounds = tile.bounds[current].aabb;
            assert!(bounds.min.cmple(population.min).all());
            assert!(bounds.max.cmpge(population.max).all());
            covered += 1;
        }
        assert!(covered > 0);
    }

    #[test]
    fn rebuilding_tiles_drops_pending_population_releases() {
        let backend = SoftwareBackend::without(&[PassKind::Flora]);
        let mut terrain = Terrain::new(format(64, 2, 1), backend);
        terrain.start();
        run_to_completion(&mut terrain);

        terrain.remove_tiles_population();
        let fades: Vec<TweenTarget> = terrain
            .tiles()
            .iter()
            .map(|t| TweenTarget::PopulationFade { tile: t.id, slot: t.current_population })
            .collect();
        assert!(fades.iter().all(|f| terrain.timeline.is_running(*f)));

        terrain.create_tiles();
        assert!(fades.iter().all(|f| !terrain.timeline.is_running(*f)));
        run_to_completion(&mut terrain);
        terrain.update(POPULATION_FADE_DURATION + 0.1);
        for tile in terrain.tiles() {
            assert!(tile.population[tile.current_population].is_some());
        }
    }

    #[test]
    fn occlusion_time_is_its_own_stat() {
        let mut terrain = Terrain::new(format(64, 2, 2), SoftwareBackend::new());
        terrain.start();
        run_to_completion(&mut terrain);
        let camera = overhead_camera(64.0);
        let mut frame = SoftwareFrame::default();

        terrain.render(&camera, &mut frame);
        assert!(terrain.stats().occlusion <= terrain.stats().culling);

        terrain.set_occlusion_culling_enabled(false);
        terrain.render(&camera, &mut frame);
        assert_eq!(terrain.stats().occlusion, Duration::ZERO);
        assert_eq!(terrain.stats().queries_issued, 0);
    }

    #[test]
    fn missing_passes_still_build_a_terrain() {
        let mut terrain = Terrain::new(format(64, 2, 2), SoftwareBackend::without(&PassKind::ALL));
        terrain.start();
        run_to_completion(&mut terrain);
        assert_eq!(terrain.tiles().len(), 4);
        assert!(terrain.heightmap().is_none());
        assert!(terrain.triangle_height_channel().is_none());
        for tile in terrain.tiles() {
            let bounds = tile.bounds[terrain.epoch().current()];
            assert_eq!(bounds.aabb.min.x, tile.area.min.x);
        }
    }

    #[test]
    fn render_draws_built_tiles_and_population() {
        let backend = SoftwareBackend::without(&[PassKind::Flora]);
        let mut terrain = Terrain::new(format(64, 2, 2), backend);
        terrain.start();
        run_to_completion(&mut terrain);

        let camera = overhead_camera(64.0);
        let mut frame = SoftwareFrame::default();
        terrain.render(&camera, &mut frame);
        assert_eq!(frame.tiles.len(), 4);
        assert_eq!(terrain.stats().visible_tiles, 4);
        assert_eq!(terrain.stats().queries_issued, 4);
        assert!(!frame.population.is_empty());
        assert!(terrain.num_rendered_instances() > 0);

        terrain.set_layers(Layers { terrain: false, population: false, bounds: true });
        terrain.render(&camera, &mut frame);
        assert!(frame.tiles.is_empty());
        assert!(frame.population.is_empty());
        assert_eq!(frame.bounds, 4);
    }

    #[test]
    fn elevation_is_scaled_on_read() {
        let mut terrain = Terrain::new(format(32, 1, 1), SoftwareBackend::new());
        terrain.set_elevation(3.0);
        assert!((terrain.elevation() - 3.0 * crate::config::ELEVATION_SCALE).abs() < 1e-5);
    }
}
