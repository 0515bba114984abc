use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TerrainError};

/// Multiplier applied to the stored elevation when it is read back.
pub const ELEVATION_SCALE: f32 = 1.3333;

/// Terrain generation parameters.
///
/// Usage:
/// ```ignore
/// let format = TerrainFormat::default()
///     .with_size(512)
///     .with_seed(42.0)
///     .with_tiles_per_row(4);
/// let terrain = Terrain::new(format, SoftwareBackend::new());
/// ```
///
/// The same fields can be loaded from TOML; missing keys keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TerrainFormat {
    /// Side of the square terrain in heightmap pixels.
    pub size: u32,
    pub elevation: f32,
    pub octaves: u32,
    pub noise_scale: f32,
    pub seed: f32,
    pub road_blur_iterations: u32,
    pub blur_iterations: u32,
    pub sobel_blur_iterations: u32,
    pub tiles_per_row: u32,
    pub num_working_threads: u32,
    pub population_balance: f32,
    pub occlusion_culling: bool,
    /// Sleep between tiles on worker threads so the main thread never
    /// receives a burst of uploads in a single frame.
    pub stagger_workers: bool,
    pub appearance: Appearance,
}

impl Default for TerrainFormat {
    fn default() -> Self {
        Self {
            size: 850,
            elevation: 120.0,
            octaves: 8,
            noise_scale: 5.0,
            seed: 1.0,
            road_blur_iterations: 4,
            blur_iterations: 15,
            sobel_blur_iterations: 5,
            tiles_per_row: 5,
            num_working_threads: 8,
            population_balance: -0.05,
            occlusion_culling: true,
            stagger_workers: true,
            appearance: Appearance::default(),
        }
    }
}

impl TerrainFormat {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| TerrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn num_tiles(&self) -> usize {
        (self.tiles_per_row as usize).pow(2)
    }

    pub fn effective_elevation(&self) -> f32 {
        self.elevation * ELEVATION_SCALE
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_elevation(mut self, elevation: f32) -> Self {
        self.elevation = elevation;
        self
    }

    pub fn with_octaves(mut self, octaves: u32) -> Self {
        self.octaves = octaves;
        self
    }

    pub fn with_noise_scale(mut self, scale: f32) -> Self {
        self.noise_scale = scale;
        self
    }

    pub fn with_seed(mut self, seed: f32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_road_blur_iterations(mut self, iterations: u32) -> Self {
        self.road_blur_iterations = iterations;
        self
    }

    pub fn with_blur_iterations(mut self, iterations: u32) -> Self {
        self.blur_iterations = iterations;
        self
    }

    pub fn with_sobel_blur_iterations(mut self, iterations: u32) -> Self {
        self.sobel_blur_iterations = iterations;
        self
    }

    pub fn with_tiles_per_row(mut self, tiles: u32) -> Self {
        self.tiles_per_row = tiles.max(1);
        self
    }

    pub fn with_num_working_threads(mut self, threads: u32) -> Self {
        self.num_working_threads = threads.max(1);
        self
    }

    pub fn with_population_balance(mut self, balance: f32) -> Self {
        self.population_balance = balance;
        self
    }

    pub fn with_occlusion_culling(mut self, enabled: bool) -> Self {
        self.occlusion_culling = enabled;
        self
    }

    pub fn with_stagger_workers(mut self, stagger: bool) -> Self {
        self.stagger_workers = stagger;
        self
    }
}

/// Fog and sun parameters forwarded to the terrain and population shaders.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Appearance {
    pub fog_density: f32,
    pub fog_color: [f32; 3],
    pub sun_color: [f32; 3],
    pub sun_scattering: [f32; 3],
    pub sun_dispersion: f32,
    pub sun_intensity: f32,
    pub sun_direction: [f32; 3],
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            fog_density: 0.129,
            fog_color: [0.25, 0.29, 0.47],
            sun_color: [1.0, 0.77, 0.60],
            sun_scattering: [0.35, 0.18, 0.29],
            sun_dispersion: 0.3,
            sun_intensity: 0.166,
            sun_direction: [0.0, 0.3, -1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let format = TerrainFormat::from_toml_str(
            r#"
            size = 256
            seed = 3.5
            tiles_per_row = 2

            [appearance]
            fog_density = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(format.size, 256);
        assert_eq!(format.seed, 3.5);
        assert_eq!(format.tiles_per_row, 2);
        assert_eq!(format.octaves, 8);
        assert_eq!(format.appearance.fog_density, 0.5);
        assert_eq!(format.appearance.sun_intensity, 0.166);
    }

    #[test]
    fn invalid_toml_is_a_format_error() {
        let err = TerrainFormat::from_toml_str("size = \"big\"").unwrap_err();
        assert!(matches!(err, TerrainError::Format(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "num_working_threads = 2").unwrap();
        let format = TerrainFormat::load(file.path()).unwrap();
        assert_eq!(format.num_working_threads, 2);

        let missing = TerrainFormat::load("/nonexistent/grove.toml").unwrap_err();
        assert!(matches!(missing, TerrainError::Io { .. }));
    }

    #[test]
    fn builder_clamps_counts() {
        let format = TerrainFormat::default().with_tiles_per_row(0).with_num_working_threads(0);
        assert_eq!(format.num_tiles(), 1);
        assert_eq!(format.num_working_threads, 1);
        assert!((format.effective_elevation() - 120.0 * ELEVATION_SCALE).abs() < 1e-4);
    }
}
