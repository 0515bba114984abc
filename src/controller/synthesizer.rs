use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TerrainFormat;
use crate::model::Channel;
use crate::view::backend::{Pass, PassBackend, PassKind};

/// Kawase iterations applied to the first slope estimate.
pub const SLOPE_BLUR_ITERATIONS: u32 = 8;

/// Two render targets whose read/write roles swap after every pass.
#[derive(Debug)]
pub struct PingPong<T> {
    slots: [T; 2],
    read: usize,
}

impl<T> PingPong<T> {
    pub fn new(a: T, b: T) -> Self {
        Self { slots: [a, b], read: 0 }
    }

    pub fn read(&self) -> &T {
        &self.slots[self.read]
    }

    pub fn write_mut(&mut self) -> &mut T {
        &mut self.slots[self.read ^ 1]
    }

    pub fn read_write(&mut self) -> (&T, &mut T) {
        let (a, b) = self.slots.split_at_mut(1);
        if self.read == 0 { (&a[0], &mut b[0]) } else { (&b[0], &mut a[0]) }
    }

    pub fn swap(&mut self) {
        self.read ^= 1;
    }
}

/// Inputs of one synthesis run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    pub size: u32,
    pub seed: f32,
    pub octaves: u32,
    pub noise_scale: f32,
    pub road_blur_iterations: u32,
    pub blur_iterations: u32,
    pub sobel_blur_iterations: u32,
}

impl From<&TerrainFormat> for SynthesisParams {
    fn from(format: &TerrainFormat) -> Self {
        Self {
            size: format.size,
            seed: format.seed,
            octaves: format.octaves,
            noise_scale: format.noise_scale,
            road_blur_iterations: format.road_blur_iterations,
            blur_iterations: format.blur_iterations,
            sobel_blur_iterations: format.sobel_blur_iterations,
        }
    }
}

impl SynthesisParams {
    /// Flora density scalar for this seed, in `[0.05, 1.5)`.
    pub fn flora_density(&self) -> f32 {
        let mut rng = StdRng::seed_from_u64(self.seed.to_bits() as u64);
        rng.gen_range(0.05f32..1.5)
    }
}

/// Results of a run. A stage whose pass was unavailable, or whose input
/// was, is `None`.
#[derive(Debug)]
pub struct SynthesisOutput<T> {
    pub heightmap: Option<T>,
    pub road: Option<T>,
    pub blurred_road: Option<T>,
    pub slope: Option<T>,
    pub mesh_density: Option<T>,
    pub flora: Option<T>,
    pub height_channel: Option<Channel>,
    pub mesh_density_channel: Option<Channel>,
    pub flora_channel: Option<Channel>,
}

/// Ping-pong pair plus whether the read slot holds a real result.
struct Chain<'b, B: PassBackend> {
    backend: &'b mut B,
    targets: PingPong<B::Target>,
    valid: bool,
}

impl<B: PassBackend> Chain<'_, B> {
    fn available(&self, kind: PassKind) -> bool {
        if self.backend.supports(kind) {
            return true;
        }
        tracing::error!("{kind:?} pass unavailable, stage skipped");
        false
    }

    /// Runs a pass that reads nothing from the chain.
    fn generate(&mut self, pass: Pass<'_, B::Target>) -> bool {
        if !self.available(pass.kind()) {
            self.valid = false;
            return false;
        }
        self.backend.run_pass(&pass, self.targets.write_mut());
        self.targets.swap();
        self.valid = true;
        true
    }

    fn sobel(&mut self) {
        if !self.valid || !self.available(PassKind::Sobel) {
            self.valid = false;
            return;
        }
        let (read, write) = self.targets.read_write();
        self.backend.run_pass(&Pass::Sobel { source: read }, write);
        self.targets.swap();
    }

    fn blur(&mut self, iterations: u32) {
        if !self.valid || iterations == 0 {
            return;
        }
        if !self.available(PassKind::Blur) {
            // leave the unblurred result in place
            return;
        }
        for iteration in 0..iterations {
            let (read, write) = self.targets.read_write();
            self.backend.run_pass(&Pass::Blur { source: read, iteration }, write);
            self.targets.swap();
        }
    }

    fn snapshot(&mut self) -> Option<B::Target> {
        self.valid.then(|| self.backend.snapshot(self.targets.read()))
    }

    fn load(&mut self, source: Option<&B::Target>) {
        match source {
            Some(source) => {
                self.backend.copy(source, self.targets.write_mut());
                self.targets.swap();
                self.valid = true;
            }
            None => self.valid = false,
        }
    }

    fn read_back(&mut self, target: Option<&B::Target>, what: &str) -> Option<Channel> {
        match self.backend.read_channel(target?) {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::error!("{what} readback failed: {e}");
                None
            }
        }
    }
}

/// Runs the full heightfield pass sequence.
pub fn synthesize<B: PassBackend>(
    backend: &mut B,
    params: &SynthesisParams,
    road_strip: &[Vec2],
) -> SynthesisOutput<B::Target> {
    let a = backend.create_target(params.size);
    let b = backend.create_target(params.size);
    let mut chain = Chain { backend, targets: PingPong::new(a, b), valid: false };

    chain.generate(Pass::Heightmap {
        seed: params.seed,
        octaves: params.octaves,
        scale: params.noise_scale,
    });
    let base_height = chain.snapshot();

    chain.sobel();
    chain.blur(SLOPE_BLUR_ITERATIONS);
    let temp_slope = chain.snapshot();

    chain.generate(Pass::Road { strip: road_strip });
    let road = chain.snapshot();
    chain.blur(params.road_blur_iterations);
    let blurred_road = chain.snapshot();

    chain.load(base_height.as_ref());
    chain.blur(params.blur_iterations);
    let blurred_height = chain.snapshot();

    chain.generate(Pass::Compose {
        height: base_height.as_ref(),
        blurred_height: blurred_height.as_ref(),
        road: road.as_ref(),
        blurred_road: blurred_road.as_ref(),
        slope: temp_slope.as_ref(),
    });
    let heightmap = chain.snapshot();
    let height_channel = chain.read_back(heightmap.as_ref(), "heightmap");

    chain.sobel();
    chain.blur(params.sobel_blur_iterations);
    let slope = chain.snapshot();

    chain.generate(Pass::Flora {
        road: road.as_ref(),
        blurred_road: blurred_road.as_ref(),
        slope: temp_slope.as_ref(),
        height: heightmap.as_ref(),
        density: params.flora_density(),
    });
    let flora = chain.snapshot();

    chain.generate(Pass::MeshDensity {
        road: road.as_ref(),
        blurred_road: blurred_road.as_ref(),
        slope: slope.as_ref(),
    });
    let mesh_density = chain.snapshot();

    let mesh_density_channel = chain.read_back(mesh_density.as_ref(), "mesh density");
    let flora_channel = chain.read_back(flora.as_ref(), "flora");

    tracing::info!(
        size = params.size,
        seed = params.seed,
        heightmap = heightmap.is_some(),
        flora = flora.is_some(),
        mesh_density = mesh_density.is_some(),
        "heightfield synthesized"
    );

    SynthesisOutput {
        heightmap,
        road,
        blurred_road,
        slope,
        mesh_density,
        flora,
        height_channel,
        mesh_density_channel,
        flora_channel,
    }
}

/// Rasterizes flat triangles with the heights under their corners.
pub fn rasterize_triangles<B: PassBackend>(
    backend: &mut B,
    size: u32,
    triangles: &[Vec2],
    heightmap: Option<&B::Target>,
) -> Option<B::Target> {
    if !backend.supports(PassKind::TriangleHeight) {
        tracing::error!("TriangleHeight pass unavailable, stage skipped");
        return None;
    }
    let mut target = backend.create_target(size);
    backend.run_pass(&Pass::TriangleHeight { triangles, heights: heightmap }, &mut target);
    Some(target)
}
