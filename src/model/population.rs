use std::f32::consts::TAU;
use std::sync::Arc;

use glam::{EulerRot, Quat, Vec2, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::channel::Channel;
use super::noise::{fbm, seed_offset};
use super::poisson::PoissonDisk;
use super::tile::{TileGrid, TileId};
use crate::utils::{Aabb, Mesh, Rect, Vertex};

const INITIAL_SEEDS: usize = 5;
const SEED_RETRY_BUDGET: usize = 100;
const SEED_FLORA_LIMIT: f32 = 0.3;
const FLORA_LIMIT: f32 = 0.5;
const FAMILY_NOISE_FREQUENCY: f32 = 0.004;

/// Vegetation family. Which one grows at a sample is decided by seeded
/// noise compared against the population balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Conifers, chosen where the noise is at or below the balance.
    Conifer,
    /// Broadleaf trees, with occasional boulders.
    Broadleaf,
}

/// Prototype meshes, indexed by prototype id. Broadleaf ids come first.
pub const BROADLEAF_COMMON: [u8; 2] = [0, 1];
pub const BROADLEAF_RARE: u8 = 2;
pub const CONIFER_COMMON: [u8; 2] = [3, 4];
pub const CONIFER_RARE: u8 = 5;

pub fn family_of(prototype: u8) -> Family {
    if prototype < CONIFER_COMMON[0] { Family::Broadleaf } else { Family::Conifer }
}

#[derive(Debug, Clone)]
pub struct Prototypes {
    meshes: Vec<Mesh>,
}

impl Prototypes {
    /// Builds the six low-poly prototypes, unit height at scale 1.
    pub fn build() -> Self {
        let meshes = vec![
            broadleaf(0.45, 6),
            broadleaf(0.6, 5),
            boulder(),
            conifer(3, 0.35),
            conifer(2, 0.4),
            snag(),
        ];
        Self { meshes }
    }

    pub fn mesh(&self, prototype: u8) -> &Mesh {
        &self.meshes[prototype as usize]
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

fn push_ring(mesh: &mut Mesh, y: f32, radius: f32, segments: u32) -> u32 {
    let base = mesh.vertices.len() as u32;
    for i in 0..segments {
        let a = i as f32 / segments as f32 * TAU;
        let dir = Vec3::new(a.cos(), 0.0, a.sin());
        mesh.vertices.push(Vertex {
            pos: (dir * radius + Vec3::Y * y).to_array(),
            normal: (dir + Vec3::Y * 0.3).normalize().to_array(),
            uv: [0.0, 0.0],
            params: [0.0, 0.0],
        });
    }
    base
}

fn push_apex(mesh: &mut Mesh, y: f32, normal: Vec3) -> u32 {
    mesh.vertices.push(Vertex {
        pos: [0.0, y, 0.0],
        normal: normal.to_array(),
        uv: [0.0, 0.0],
        params: [0.0, 0.0],
    });
    mesh.vertices.len() as u32 - 1
}

fn connect_rings(mesh: &mut Mesh, lower: u32, upper: u32, segments: u32) {
    for i in 0..segments {
        let j = (i + 1) % segments;
        mesh.indices.extend([lower + i, upper + i, lower + j, lower + j, upper + i, upper + j]);
    }
}

fn cap(mesh: &mut Mesh, ring: u32, apex: u32, segments: u32) {
    for i in 0..segments {
        let j = (i + 1) % segments;
        mesh.indices.extend([ring + i, apex, ring + j]);
    }
}

fn trunk(mesh: &mut Mesh, height: f32, radius: f32) {
    let bottom = push_ring(mesh, 0.0, radius, 4);
    let top = push_ring(mesh, height, radius * 0.7, 4);
    connect_rings(mesh, bottom, top, 4);
}

fn conifer(tiers: u32, trunk_height: f32) -> Mesh {
    let mut mesh = Mesh::empty();
    trunk(&mut mesh, trunk_height, 0.04);
    let tier_height = (1.0 - trunk_height * 0.5) / tiers as f32;
    for t in 0..tiers {
        let y = trunk_height * 0.5 + t as f32 * tier_height * 0.8;
        let radius = 0.3 * (1.0 - t as f32 / (tiers as f32 + 1.0));
        let ring = push_ring(&mut mesh, y, radius, 7);
        let apex = push_apex(&mut mesh, (y + tier_height * 1.3).min(1.0), Vec3::Y);
        cap(&mut mesh, ring, apex, 7);
    }
    mesh
}

fn broadleaf(canopy: f32, segments: u32) -> Mesh {
    let mut mesh = Mesh::empty();
    let trunk_height = 1.0 - canopy;
    trunk(&mut mesh, trunk_height + canopy * 0.3, 0.05);
    let radius = canopy * 0.6;
    let bottom = push_apex(&mut mesh, trunk_height, -Vec3::Y);
    let lower = push_ring(&mut mesh, trunk_height + canopy * 0.3, radius, segments);
    let upper = push_ring(&mut mesh, trunk_height + canopy * 0.7, radius * 0.8, segments);
    let top = push_apex(&mut mesh, 1.0, Vec3::Y);
    for i in 0..segments {
        let j = (i + 1) % segments;
        mesh.indices.extend([lower + j, bottom, lower + i]);
    }
    connect_rings(&mut mesh, lower, upper, segments);
    cap(&mut mesh, upper, top, segments);
    mesh
}

fn boulder() -> Mesh {
    let mut mesh = Mesh::empty();
    let ring = push_ring(&mut mesh, 0.25, 0.5, 5);
    let top = push_apex(&mut mesh, 0.6, Vec3::Y);
    let bottom = push_apex(&mut mesh, -0.1, -Vec3::Y);
    cap(&mut mesh, ring, top, 5);
    for i in 0..5 {
        let j = (i + 1) % 5;
        mesh.indices.extend([ring + j, bottom, ring + i]);
    }
    mesh
}

fn snag() -> Mesh {
    let mut mesh = Mesh::empty();
    let bottom = push_ring(&mut mesh, 0.0, 0.05, 4);
    let top = push_apex(&mut mesh, 1.0, Vec3::Y);
    cap(&mut mesh, bottom, top, 4);
    let branch = push_ring(&mut mesh, 0.55, 0.02, 3);
    let tip = push_apex(&mut mesh, 0.75, Vec3::Y);
    for v in &mut mesh.vertices[branch as usize..] {
        v.pos[0] += 0.15;
    }
    cap(&mut mesh, branch, tip, 3);
    mesh
}

/// One placed instance, kept for statistics and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    pub prototype: u8,
    pub family: Family,
    pub position: Vec2,
    pub scale: f32,
}

/// Vegetation of a single tile, produced on a worker.
#[derive(Debug, Clone)]
pub struct PopulationData {
    pub tile_id: TileId,
    pub mesh: Mesh,
    pub bounds: Option<Aabb>,
    pub instances: Vec<InstanceRecord>,
}

/// Read-only inputs shared by every population worker of a pass.
#[derive(Debug, Clone)]
pub struct PopulationInputs {
    pub grid: TileGrid,
    pub flora: Option<Arc<Channel>>,
    pub seed: f32,
    pub balance: f32,
    pub prototypes: Arc<Prototypes>,
}

impl PopulationInputs {
    fn flora(&self, p: Vec2) -> f32 {
        self.flora.as_ref().map_or(0.0, |c| c.get_value(p))
    }

    /// Family noise in `[-1, 1]`.
    fn family_noise(&self, p: Vec2) -> f32 {
        let (ox, oz) = seed_offset(self.seed);
        fbm(p.x * FAMILY_NOISE_FREQUENCY + ox, p.y * FAMILY_NOISE_FREQUENCY + oz, 1.0, 0.5, 4)
    }
}

/// Scatters vegetation over one tile.
pub fn scatter(tile_id: TileId, inputs: &PopulationInputs) -> PopulationData {
    let area = inputs.grid.area(tile_id);
    let mut rng = StdRng::seed_from_u64(inputs.seed.to_bits() as u64 ^ ((tile_id as u64) << 32));

    let initial = initial_seeds(&area, inputs, &mut rng);
    let samples = PoissonDisk::new(area, 2.5, 12.5)
        .with_seed(rng.gen())
        .sample(&initial, |p| 2.5 + inputs.flora(p) * 10.0, |p| inputs.flora(p) < FLORA_LIMIT);

    let scale_broadleaf: f32 = if rng.gen_bool(0.07) {
        rng.gen_range(2.8..3.3)
    } else {
        rng.gen_range(0.9..1.25)
    };
    let scale_conifer: f32 = rng.gen_range(0.7..0.8);

    let accepted: Vec<Vec2> = samples
        .into_iter()
        .skip(1)
        .filter(|p| area.contains(*p) && inputs.flora(*p) < FLORA_LIMIT)
        .collect();

    let full = Vec2::splat(inputs.grid.size);
    let count = accepted.len().max(1) as f32;
    let mut mesh = Mesh::empty();
    let mut bounds: Option<Aabb> = None;
    let mut instances = Vec::with_capacity(accepted.len());

    for (j, p) in accepted.iter().enumerate() {
        let flora_density = (1.0 - inputs.flora(*p).clamp(0.0, 1.0) + 0.5).clamp(0.0, 1.0);
        let (prototype, rotation, scale) = if inputs.family_noise(*p) > inputs.balance {
            let rotation = Quat::from_euler(
                EulerRot::YXZ,
                rng.gen_range(0.1..4.0),
                rng.gen_range(0.01..0.1),
                rng.gen_range(0.01..0.1),
            );
            if rng.gen_bool(0.005) {
                (BROADLEAF_RARE, rotation, 0.5 * flora_density * rng.gen_range(5.0f32..20.0))
            } else {
                let index = BROADLEAF_COMMON[rng.gen_range(0..2)];
                (index, rotation, flora_density * scale_broadleaf * rng.gen_range(5.0f32..20.0))
            }
        } else {
            let rotation = Quat::from_euler(
                EulerRot::YXZ,
                rng.gen_range(0.1..4.0),
                rng.gen_range(0.01..0.075),
                rng.gen_range(0.01..0.075),
            );
            let index = if rng.gen_bool(0.025) {
                CONIFER_RARE
            } else {
                CONIFER_COMMON[rng.gen_range(0..2)]
            };
            (index, rotation, flora_density * scale_conifer * rng.gen_range(8.0f32..15.0))
        };

        let uv = *p / full;
        let translation = Vec3::new(p.x, 0.0, p.y);
        let base = mesh.vertices.len() as u32;
        for v in &inputs.prototypes.mesh(prototype).vertices {
            let pos = rotation * (Vec3::from_array(v.pos) * scale) + translation;
            let normal = rotation * Vec3::from_array(v.normal);
            bounds = Some(match bounds {
                Some(b) => b.include_point(pos),
                None => Aabb::new(pos, pos),
            });
            mesh.vertices.push(Vertex {
                pos: pos.to_array(),
                normal: normal.to_array(),
                uv: uv.to_array(),
                params: [prototype as f32, j as f32 / count],
            });
        }
        mesh.indices.extend(inputs.prototypes.mesh(prototype).indices.iter().map(|i| i + base));

        instances.push(InstanceRecord { prototype, family: family_of(prototype), position: *p, scale });
    }

    PopulationData { tile_id, mesh, bounds, instances }
}

fn initial_seeds(area: &Rect, inputs: &PopulationInputs, rng: &mut StdRng) -> Vec<Vec2> {
    let mut seeds = Vec::with_capacity(INITIAL_SEEDS);
    let mut budget = SEED_RETRY_BUDGET;
    for _ in 0..INITIAL_SEEDS {
        loop {
            let p = Vec2::new(
                rng.gen_range(area.min.x..area.max.x.max(area.min.x + 1e-3)),
                rng.gen_range(area.min.y..area.max.y.max(area.min.y + 1e-3)),
            );
            if inputs.flora(p) <= SEED_FLORA_LIMIT || budget == 0 {
                seeds.push(p);
                break;
            }
            budget -= 1;
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(balance: f32, flora: Option<Channel>) -> PopulationInputs {
        PopulationInputs {
            grid: TileGrid::new(128, 2),
            flora: flora.map(Arc::new),
            seed: 0.0,
            balance,
            prototypes: Arc::new(Prototypes::build()),
        }
    }

    #[test]
    fn prototypes_are_well_formed() {
        let prototypes = Prototypes::build();
        assert_eq!(prototypes.len(), 6);
        for i in 0..6 {
            let mesh = prototypes.mesh(i);
            assert!(!mesh.is_empty());
            assert_eq!(mesh.indices.len() % 3, 0);
            assert!(mesh.indices.iter().all(|&k| (k as usize) < mesh.vertices.len()));
        }
    }

    #[test]
    fn full_balance_grows_only_conifers() {
        let data = scatter(0, &inputs(1.0, None));
        assert!(!data.instances.is_empty());
        assert!(data.instances.iter().all(|i| i.family == Family::Conifer));
    }

    #[test]
    fn low_balance_grows_only_broadleaf() {
        let data = scatter(1, &inputs(-1.0, None));
        assert!(!data.instances.is_empty());
        assert!(data.instances.iter().all(|i| i.family == Family::Broadleaf));
    }

    #[test]
    fn instances_stay_in_tile_and_avoid_exclusion() {
        let flora = Channel::from_fn(128, 128, |x, _| if x < 32 { 1.0 } else { 0.0 });
        let inputs = inputs(0.0, Some(flora));
        let data = scatter(0, &inputs);
        let area = inputs.grid.area(0);
        assert!(!data.instances.is_empty());
        for instance in &data.instances {
            assert!(area.contains(instance.position));
            assert!(instance.position.x >= 32.0);
        }
        let bounds = data.bounds.unwrap();
        assert!(bounds.max.y > 0.0);
    }

    #[test]
    fn scatter_is_deterministic() {
        let inputs = inputs(0.0, None);
        let a = scatter(2, &inputs);
        let b = scatter(2, &inputs);
        assert_eq!(a.instances, b.instances);
    }
}
