use std::time::{Duration, Instant};

use glam::Vec2;

use crate::model::{Camera, GenerationEpoch, QueryId, Tile, TileGrid};
use crate::view::backend::{OccluderDraw, TerrainBackend};

/// Extra vertical field of view used for culling so tiles entering from
/// the edges do not pop.
pub const FRUSTUM_WIDENING_DEGREES: f32 = 2.0;
pub const CULLING_NEAR_PLANE: f32 = 0.1;

/// Outcome of culling one frame.
#[derive(Debug, Default)]
pub struct CullResult {
    /// Indices into the tile registry, nearest first.
    pub visible: Vec<usize>,
    /// Queries to issue while drawing this frame.
    pub occluders: Vec<OccluderDraw>,
    pub in_frustum: usize,
    pub results_read: usize,
    /// Time spent reading query results and picking occluders.
    pub occlusion_time: Duration,
}

/// Frustum and occlusion culling over the tile registry.
///
/// Query results come back asynchronously: each frame reads at most one
/// finished query per tile and issues at most one new query per tile in
/// the frustum. A tile is hidden after `OCCLUSION_THRESHOLD` consecutive
/// empty results, and the tile under the camera is never hidden.
#[derive(Debug)]
pub struct TileCullingEngine {
    occlusion_enabled: bool,
}

impl TileCullingEngine {
    pub fn new(occlusion_enabled: bool) -> Self {
        Self { occlusion_enabled }
    }

    pub fn is_occlusion_enabled(&self) -> bool {
        self.occlusion_enabled
    }

    pub fn set_occlusion_enabled<B>(&mut self, enabled: bool, tiles: &mut [Tile<B>]) {
        if self.occlusion_enabled != enabled {
            tracing::info!(enabled, "occlusion culling toggled");
        }
        self.occlusion_enabled = enabled;
        if !enabled {
            for tile in tiles {
                tile.occlusion.reset();
            }
        }
    }

    pub fn cull<B: TerrainBackend>(
        &mut self,
        backend: &mut B,
        tiles: &mut [Tile<B::Batch>],
        camera: &Camera,
        epoch: &GenerationEpoch,
        elevation: f32,
        grid: &TileGrid,
    ) -> CullResult {
        let mut cull_camera = camera.widened(FRUSTUM_WIDENING_DEGREES);
        cull_camera.z_near = CULLING_NEAR_PLANE;
        let frustum = cull_camera.frustum();

        let mut survivors: Vec<(usize, f32)> = tiles
            .iter()
            .enumerate()
            .filter(|(_, tile)| tile.batch.is_some())
            .filter_map(|(i, tile)| {
                let bounds = tile.bounds_at(epoch, elevation);
                frustum
                    .intersects_aabb(&bounds)
                    .then(|| (i, camera.eye_depth(bounds.center())))
            })
            .collect();
        survivors.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut result = CullResult { in_frustum: survivors.len(), ..Default::default() };

        if !self.occlusion_enabled {
            result.visible = survivors.into_iter().map(|(i, _)| i).collect();
            return result;
        }

        let started = Instant::now();
        result.results_read = poll_results(backend, tiles);
        let camera_tile = grid.tile_at(Vec2::new(camera.eye.x, camera.eye.z));
        if let Some(tile) = tiles.iter_mut().find(|t| Some(t.id) == camera_tile) {
            tile.occlusion.reset();
        }

        let issue = backend.issues_occlusion_queries();
        for &(i, _) in &survivors {
            let tile = &mut tiles[i];
            if !tile.occlusion.is_occluded() {
                result.visible.push(i);
            }
            if !issue {
                continue;
            }
            // hidden tiles keep being queried, otherwise they could never
            // come back
            if let Some(slot) = tile.occlusion.ring.acquire() {
                result.occluders.push(OccluderDraw {
                    query: QueryId { tile: tile.id, slot },
                    bounds: tile.bounds_at(epoch, elevation),
                });
            }
        }
        result.occlusion_time = started.elapsed();

        result
    }
}

/// Reads the first finished query of every tile.
fn poll_results<B: TerrainBackend>(backend: &mut B, tiles: &mut [Tile<B::Batch>]) -> usize {
    let mut read = 0;
    for tile in tiles.iter_mut() {
        let slots: Vec<usize> = tile.occlusion.ring.in_flight().collect();
        for slot in slots {
            if let Some(visible) = backend.poll_occlusion(QueryId { tile: tile.id, slot }) {
                tile.occlusion.record(visible);
                tile.occlusion.ring.release(slot);
                read += 1;
                break;
            }
        }
    }
    read
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use std::sync::Arc;

    use crate::model::tile::{build_tile_geometry, TileInputs};
    use crate::model::{Channel, RoadPathPlanner};
    use crate::view::backend::{FrameDraw, FrameUniforms};
    use crate::view::{SoftwareBackend, SoftwareBatch};

    struct Fixture {
        backend: SoftwareBackend,
        tiles: Vec<Tile<SoftwareBatch>>,
        grid: TileGrid,
        camera: Camera,
        epoch: GenerationEpoch,
        culling: TileCullingEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let grid = TileGrid::new(128, 2);
            let inputs = TileInputs { grid, heights: None, density: None, road: Arc::new(RoadPathPlanner::new()) };
            let mut backend = SoftwareBackend::new();
            let tiles = (0..grid.num_tiles())
                .map(|id| {
                    let mut tile = Tile::new(build_tile_geometry(id, &inputs));
                    tile.batch = Some(backend.upload_mesh(&tile.geometry.mesh));
                    tile
                })
                .collect();
            // high above the center of tile 3, looking down over the terrain
            let mut camera = Camera::new(800, 600);
            camera.eye = Vec3::new(70.0, 300.0, 70.0);
            camera.set_look_at(Vec3::new(70.0, 0.0, 71.0));
            Self {
                backend,
                tiles,
                grid,
                camera,
                epoch: GenerationEpoch::new(),
                culling: TileCullingEngine::new(true),
            }
        }

        /// Culls and "draws" one frame, returning the visible tile ids.
        fn frame(&mut self) -> Vec<usize> {
            let result = self.culling.cull(
                &mut self.backend,
                &mut self.tiles,
                &self.camera,
                &self.epoch,
                100.0,
                &self.grid,
            );
            let mut frame = FrameDraw::<Channel, SoftwareBatch>::new(FrameUniforms::default());
            frame.occluders = result.occluders;
            self.backend.draw_frame(&frame, &mut Default::default());
            result.visible.iter().map(|i| self.tiles[*i].id).collect()
        }
    }

    #[test]
    fn everything_in_view_is_drawn_nearest_first() {
        let mut fixture = Fixture::new();
        let visible = fixture.frame();
        assert_eq!(visible.len(), 4);
        let depths: Vec<f32> = visible
            .iter()
            .map(|id| fixture.camera.eye_depth(fixture.tiles[*id].bounds_at(&fixture.epoch, 100.0).center()))
            .collect();
        assert!(depths.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn tiles_behind_the_camera_are_culled() {
        let mut fixture = Fixture::new();
        fixture.camera.eye = Vec3::new(-50.0, 10.0, 64.0);
        fixture.camera.set_look_at(Vec3::new(-100.0, 10.0, 64.0));
        assert!(fixture.frame().is_empty());
    }

    #[test]
    fn occluded_tiles_hide_after_threshold_and_return_on_one_visible_result() {
        let mut fixture = Fixture::new();
        fixture.backend.set_tile_occluded(0, true);
        // the camera tile never hides
        fixture.backend.set_tile_occluded(3, true);

        let mut visible = Vec::new();
        for _ in 0..8 {
            visible = fixture.frame();
        }
        assert!(!visible.contains(&0));
        assert!(visible.contains(&3));
        assert!(fixture.tiles[0].occlusion.is_occluded());
        assert_eq!(fixture.tiles[3].occlusion.occluded_frames(), 0);

        fixture.backend.set_tile_occluded(0, false);
        // one frame drains the query issued while hidden, the next reads
        // a visible result
        fixture.frame();
        let visible = fixture.frame();
        assert!(visible.contains(&0));
        assert_eq!(fixture.tiles[0].occlusion.occluded_frames(), 0);
    }

    #[test]
    fn backend_without_queries_leaves_rings_free() {
        let mut fixture = Fixture::new();
        fixture.backend.set_declines_queries(true);
        fixture.backend.set_tile_occluded(0, true);
        for _ in 0..8 {
            assert!(fixture.frame().contains(&0));
        }
        assert_eq!(fixture.tiles[0].occlusion.ring.in_flight().count(), 0);
        assert_eq!(fixture.tiles[0].occlusion.occluded_frames(), 0);

        // once queries flow again the counter moves
        fixture.backend.set_declines_queries(false);
        let mut visible = Vec::new();
        for _ in 0..8 {
            visible = fixture.frame();
        }
        assert!(!visible.contains(&0));
        assert!(fixture.tiles[0].occlusion.is_occluded());
    }

    #[test]
    fn disabling_occlusion_draws_hidden_tiles() {
        let mut fixture = Fixture::new();
        fixture.backend.set_tile_occluded(1, true);
        for _ in 0..8 {
            fixture.frame();
        }
        assert!(!fixture.frame().contains(&1));
        fixture.culling.set_occlusion_enabled(false, &mut fixture.tiles);
        assert!(fixture.frame().contains(&1));
    }
}
