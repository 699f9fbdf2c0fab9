//! Headless terrain simulation - streams, meshes and digs without a renderer.
//!
//! Usage: cargo run --release --bin terrain_sim -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>    Terrain config JSON (default: built-in defaults)
//!   --ticks <N>        Number of ticks to simulate (default: 600)
//!   --speed <U/S>      Viewer speed in world units per second (default: 20)
//!   --dig-every <N>    Dig below the viewer every N ticks, 0 = never (default: 60)
//!   --log <PATH>       Write diagnostics as JSON lines
//!   --mode <MODE>      Override processing mode: cpu, gpu or hybrid
//!
//! The viewer flies a circle at a fixed height above the surface. With `gpu`
//! or `hybrid` the host compute backend stands in for a real device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;

use deepfield::config::{ProcessingMode, TerrainConfig};
use deepfield::core::logging;
use deepfield::core::time::FrameTimer;
use deepfield::streaming::{ComputeBackend, HostComputeBackend};
use deepfield::world::{TerrainEvent, TerrainSystem, Viewer};
use deepfield_diagnostics::{DiagnosticsSink, JsonLinesSink, NullSink};

/// Simulated frame time
const DT: f32 = 1.0 / 60.0;

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_str_arg(&args, "--config").map(PathBuf::from);
    let ticks = parse_usize_arg(&args, "--ticks").unwrap_or(600);
    let speed = parse_f32_arg(&args, "--speed").unwrap_or(20.0);
    let dig_every = parse_usize_arg(&args, "--dig-every").unwrap_or(60);
    let log_path = parse_str_arg(&args, "--log").map(PathBuf::from);

    let mut config = match &config_path {
        Some(path) => match TerrainConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => TerrainConfig::default(),
    };
    if let Some(mode) = parse_str_arg(&args, "--mode") {
        config.processing_mode = match mode.as_str() {
            "cpu" => ProcessingMode::Cpu,
            "gpu" => ProcessingMode::Gpu,
            "hybrid" => ProcessingMode::Hybrid,
            other => {
                log::error!("Unknown processing mode '{}'", other);
                std::process::exit(2);
            }
        };
    }

    let sink: Box<dyn DiagnosticsSink> = match &log_path {
        Some(path) => match JsonLinesSink::create(path) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                log::warn!("{}, diagnostics disabled", e);
                Box::new(NullSink)
            }
        },
        None => Box::new(NullSink),
    };

    println!("=== Deepfield Terrain Simulation ===");
    println!("Config: {}", config_path.as_ref().map_or("defaults".to_string(), |p| p.display().to_string()));
    println!("Mode:   {:?}", config.processing_mode);
    println!("Ticks:  {} at {:.0} fps, viewer speed {} u/s", ticks, 1.0 / DT, speed);
    println!();

    let mut builder = match TerrainSystem::builder(config.clone()).worker_pool() {
        Ok(builder) => builder.diagnostics(sink),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    if config.processing_mode != ProcessingMode::Cpu {
        match HostComputeBackend::new(config.worker_threads) {
            Ok(backend) => builder = builder.compute_backend(Arc::new(backend) as Arc<dyn ComputeBackend>),
            Err(e) => log::warn!("No compute backend: {}", e),
        }
    }
    let mut terrain = match builder.build() {
        Ok(terrain) => terrain,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut timer = FrameTimer::new();
    let mut summary = Summary::default();
    let start = Instant::now();
    let path_radius = config.load_distance * 0.5;

    for tick in 0..ticks {
        let frame_start = Instant::now();

        let t = tick as f32 * DT;
        let angle = t * speed / path_radius.max(1.0);
        let ground = terrain.field().surface_height(angle.cos() * path_radius, angle.sin() * path_radius);
        let position = Vec3::new(angle.cos() * path_radius, ground + 8.0, angle.sin() * path_radius);

        if dig_every > 0 && tick > 0 && tick % dig_every == 0 {
            let outcome = terrain.request_terrain_modification(Vec3::new(position.x, ground, position.z), 3.0, -1.0);
            summary.digs += 1;
            summary.dig_chunks += outcome.visited;
        }

        let stats = terrain.tick(DT, &Viewer::at(position));
        summary.loaded += stats.loaded;
        summary.unloaded += stats.unloaded;
        summary.recreated += stats.recreated;

        for event in terrain.drain_events() {
            match event {
                TerrainEvent::MeshReady { mesh, .. } => {
                    summary.meshes += 1;
                    summary.triangles += mesh.surface.triangle_count();
                }
                TerrainEvent::MeshRemoved { .. } => summary.removed += 1,
                TerrainEvent::TransitionReady { .. } => summary.seams += 1,
                TerrainEvent::TransitionRemoved { .. } => {}
            }
        }

        timer.record(Instant::now(), frame_start.elapsed().max(Duration::from_micros(1)));
        if (tick + 1) % 120 == 0 {
            log::info!(
                "Tick {}: {} resident, {} queued, {} in flight, budget {}",
                tick + 1,
                terrain.store().len(),
                terrain.scheduler().queued(),
                terrain.scheduler().in_flight(),
                terrain.scheduler().budget().chunks_this_tick()
            );
        }
    }

    terrain.shutdown();
    let elapsed = start.elapsed();
    let fps = timer.fps_window();
    let buffers = terrain.buffer_stats();
    let pool = terrain.store().pool_stats();

    println!();
    println!("Simulated {} ticks in {:.2}s", ticks, elapsed.as_secs_f64());
    println!("Tick cost: avg {:.0} / min {:.0} / max {:.0} ticks per second", fps.avg, fps.min, fps.max);
    println!("Chunks:    {} loaded, {} unloaded, {} recreated, {} resident",
        summary.loaded, summary.unloaded, summary.recreated, terrain.store().len());
    println!("Pool:      {} created, {} reused", pool.created, pool.reused);
    println!("Meshes:    {} published ({} triangles), {} removed, {} seams",
        summary.meshes, summary.triangles, summary.removed, summary.seams);
    println!("Edits:     {} digs touching {} chunks, {} journaled",
        summary.digs, summary.dig_chunks, terrain.journal().len());
    println!("Buffers:   {} requests, {} reused, {} outstanding",
        buffers.requests, buffers.reused, buffers.outstanding);
    if terrain.resources().backend_disabled() {
        println!("Compute backend was disabled after a failure");
    }
    if let Some(path) = &log_path {
        println!("Diagnostics: {}", path.display());
    }
}

#[derive(Default)]
struct Summary {
    loaded: usize,
    unloaded: usize,
    recreated: usize,
    meshes: usize,
    triangles: usize,
    removed: usize,
    seams: usize,
    digs: usize,
    dig_chunks: usize,
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
