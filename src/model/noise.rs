// Hashed value noise and fBm. The WGSL passes in view/shaders/synthesis.wgsl
// mirror these functions so both backends produce the same landscape.

use super::channel::Channel;

/// Side of the shared noise lookup table.
pub const NOISE_TABLE_SIZE: u32 = 512;

fn hash(x: i32, z: i32) -> f32 {
    let mut n = x.wrapping_mul(374761393).wrapping_add(z.wrapping_mul(668265263));
    n = (n ^ (n >> 13)).wrapping_mul(1274126177);
    ((n ^ (n >> 16)) as u32 as f32 / 4294967296.0) * 2.0 - 1.0
}

/// 2D value noise in `[-1, 1]`.
pub fn noise2d(x: f32, z: f32) -> f32 {
    let ix = x.floor() as i32;
    let iz = z.floor() as i32;
    let fx = x - ix as f32;
    let fz = z - iz as f32;

    let fade = |t: f32| t * t * (3.0 - 2.0 * t);
    let u = fade(fx);
    let v = fade(fz);

    let a = hash(ix, iz);
    let b = hash(ix + 1, iz);
    let c = hash(ix, iz + 1);
    let d = hash(ix + 1, iz + 1);

    let x1 = a * (1.0 - u) + b * u;
    let x2 = c * (1.0 - u) + d * u;
    x1 * (1.0 - v) + x2 * v
}

pub fn noise1d(x: f32) -> f32 {
    noise2d(x, 0.5)
}

/// Fractional Brownian motion normalized by the summed amplitude, so the
/// result never leaves `[-1, 1]`.
pub fn fbm(x: f32, z: f32, base_freq: f32, gain: f32, octaves: u32) -> f32 {
    let mut result = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = base_freq;
    let mut max_amplitude = 0.0;

    for _ in 0..octaves {
        result += noise2d(x * frequency, z * frequency) * amplitude;
        max_amplitude += amplitude;
        amplitude *= gain;
        frequency *= 2.0;
    }

    if max_amplitude > 0.0 { result / max_amplitude } else { 0.0 }
}

pub fn fbm1d(x: f32, octaves: u32) -> f32 {
    fbm(x, 0.5, 1.0, 0.5, octaves)
}

/// Lattice offset derived from the seed, shared by all seeded lookups.
pub fn seed_offset(seed: f32) -> (f32, f32) {
    (seed * 13.37, seed * 7.91)
}

/// Precomputed `fbm * 0.5 + 0.5` table sampled by the sky and fog shaders.
pub fn noise_table(size: u32, seed: f32) -> Channel {
    let (ox, oz) = seed_offset(seed);
    Channel::from_fn(size, size, |x, y| {
        fbm(x as f32 * 0.1 + ox, y as f32 * 0.1 + oz, 1.0, 0.5, 6) * 0.5 + 0.5
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fbm_stays_normalized() {
        for i in 0..500 {
            let x = i as f32 * 0.37 - 40.0;
            let v = fbm(x, x * 1.7 + 3.0, 0.8, 0.5, 8);
            assert!((-1.0..=1.0).contains(&v), "fbm out of range: {v}");
        }
    }

    #[test]
    fn noise_is_continuous_across_cells() {
        let left = noise2d(2.0 - 1e-4, 0.3);
        let right = noise2d(2.0 + 1e-4, 0.3);
        assert!((left - right).abs() < 1e-2);
    }

    #[test]
    fn noise_table_is_in_unit_range() {
        let table = noise_table(32, 1.0);
        assert!(table.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
