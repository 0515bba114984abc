use std::process::ExitCode;
use std::time::{Duration, Instant};

use grove::model::Camera;
use grove::view::{GpuContext, GpuFrameTarget};
use grove::{logging, SoftwareBackend, Terrain, TerrainBackend, TerrainFormat, WgpuBackend};

const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;
const FLYTHROUGH_FRAMES: u32 = 240;
const BUILD_TIMEOUT: Duration = Duration::from_secs(300);

struct Options {
    format_path: Option<String>,
    gpu: bool,
}

fn parse_args() -> Options {
    let mut options = Options { format_path: None, gpu: false };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--gpu" => options.gpu = true,
            _ => options.format_path = Some(arg),
        }
    }
    options
}

/// Builds the terrain, then flies the camera along the road and logs what
/// each phase cost.
fn run<B: TerrainBackend>(mut terrain: Terrain<B>, mut target: B::FrameTarget) {
    let started = Instant::now();
    terrain.start();

    let mut camera = Camera::new(FRAME_WIDTH, FRAME_HEIGHT);
    let mut last = Instant::now();
    let mut logged_completion = 0.0;
    while terrain.is_building() || terrain.is_populating() {
        let now = Instant::now();
        terrain.update((now - last).as_secs_f32());
        last = now;

        let completion = terrain.tiles_threads_completion();
        if completion - logged_completion >= 0.25 {
            logged_completion = completion;
            tracing::info!(completion, "building tiles");
        }
        if started.elapsed() > BUILD_TIMEOUT {
            tracing::error!("terrain did not finish building in {:?}", BUILD_TIMEOUT);
            return;
        }
        std::thread::sleep(Duration::from_millis(16));
    }
    tracing::info!(tiles = terrain.tiles().len(), elapsed = ?started.elapsed(), "terrain ready");

    let road_length = terrain.road_length();
    for frame in 0..FLYTHROUGH_FRAMES {
        let t = frame as f32 / FLYTHROUGH_FRAMES as f32;
        let (Some(eye), Some(ahead)) = (terrain.road_point(t), terrain.road_point((t + 0.01).min(1.0))) else {
            tracing::warn!("no road to follow");
            break;
        };
        camera.eye = eye + glam::Vec3::Y * 4.0;
        camera.set_look_at(ahead + glam::Vec3::Y * 4.0);

        terrain.update(1.0 / 60.0);
        terrain.render(&camera, &mut target);

        if frame % 60 == 0 {
            let stats = terrain.stats();
            tracing::info!(
                frame,
                visible = stats.visible_tiles,
                in_frustum = stats.tiles_in_frustum,
                instances = stats.rendered_instances,
                queries = stats.queries_issued,
                culling = ?stats.culling,
                draw = ?stats.terrain,
                "flythrough"
            );
        }
    }
    tracing::info!(road_length, "done");
}

fn main() -> ExitCode {
    logging::init();
    let options = parse_args();

    let format = match &options.format_path {
        Some(path) => match TerrainFormat::load(path) {
            Ok(format) => format,
            Err(e) => {
                tracing::error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => TerrainFormat::default(),
    };

    if options.gpu {
        match GpuContext::new_blocking() {
            Ok(context) => {
                let backend = WgpuBackend::new(&context);
                let target = GpuFrameTarget::new(backend.device(), FRAME_WIDTH, FRAME_HEIGHT);
                run(Terrain::new(format, backend), target);
                return ExitCode::SUCCESS;
            }
            Err(e) => tracing::warn!("GPU unavailable ({e}), using the software backend"),
        }
    }

    run(Terrain::new(format, SoftwareBackend::new()), Default::default());
    ExitCode::SUCCESS
}
