//! Structure Physics Testbed
//!
//! Builds a flat voxel world with a cube on top, lifts the cube into a
//! physics structure through a selection and lets it settle.
//!
//! Use `--config <path>` to load physics settings from a TOML file and
//! `--dry-run` to replace the rapier engine with the recording bridge.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use structure_physics::glam::IVec3;
use structure_physics::{
    ChunkPos, DimensionId, GridWorld, OwnerId, PhysicsBridge, PhysicsConfig, PhysicsContext,
    RapierBridge, RecordingBridge, Selection, VoxelState,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OWNER: OwnerId = OwnerId(1);
const GROUND: u32 = 1;
const CUBE: u32 = 2;
/// Half extent of the generated floor, in voxels
const FLOOR_HALF: i32 = 24;
const FLOOR_TOP: i32 = 3;

/// Structure Physics Testbed
#[derive(Parser)]
#[command(name = "structure-testbed")]
#[command(about = "Lift a voxel cube into a rigid body and watch it settle", long_about = None)]
struct Args {
    /// Physics config file (TOML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulation ticks to run
    #[arg(short, long, default_value_t = 600)]
    ticks: u32,

    /// Edge length of the lifted cube
    #[arg(short, long, default_value_t = 3)]
    size: i32,

    /// Use the recording bridge instead of rapier
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.size > 0, "--size must be positive");

    let config = match &args.config {
        Some(path) => PhysicsConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PhysicsConfig::default(),
    };
    let dt = config.fixed_dt;

    let bridge: Box<dyn PhysicsBridge> = if args.dry_run {
        Box::new(RecordingBridge::new())
    } else {
        Box::new(RapierBridge::new(config.gravity()))
    };
    let mut ctx = PhysicsContext::with_bridge(config, bridge)?;

    let mut world = build_world(args.size);
    let mut shadow = GridWorld::new(DimensionId::SHIPYARD, 0, 255);
    for chunk in floor_chunks() {
        ctx.on_chunk_load(&world, chunk);
    }

    let cube_min = IVec3::new(0, FLOOR_TOP + 1, 0);
    let cube_max = cube_min + IVec3::splat(args.size - 1);
    ctx.request_selection(OWNER, DimensionId::OVERWORLD, Selection::new(cube_min, cube_max))?;

    for tick in 0..args.ticks {
        for outcome in ctx.tick_dimension(&mut world, &mut shadow) {
            if let Err(err) = outcome.result {
                warn!("Build {} failed: {}", outcome.job, err);
            }
        }
        ctx.tick_shipyard(&mut shadow);
        ctx.step(dt);
        world.advance(1);
        shadow.advance(1);

        for notice in ctx.drain_notices(OWNER) {
            info!("[tick {}] {}", tick, notice);
        }
    }

    report(&ctx);
    ctx.shutdown();
    Ok(())
}

fn build_world(size: i32) -> GridWorld {
    let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 127);
    world.fill(
        IVec3::new(-FLOOR_HALF, 0, -FLOOR_HALF),
        IVec3::new(FLOOR_HALF - 1, FLOOR_TOP, FLOOR_HALF - 1),
        &VoxelState::solid(GROUND),
    );
    world.fill(
        IVec3::new(0, FLOOR_TOP + 1, 0),
        IVec3::new(size - 1, FLOOR_TOP + size, size - 1),
        &VoxelState::solid(CUBE),
    );
    world
}

fn floor_chunks() -> impl Iterator<Item = ChunkPos> {
    let lo = ChunkPos::containing(IVec3::new(-FLOOR_HALF, 0, -FLOOR_HALF));
    let hi = ChunkPos::containing(IVec3::new(FLOOR_HALF - 1, 0, FLOOR_HALF - 1));
    (lo.x..=hi.x).flat_map(move |x| (lo.z..=hi.z).map(move |z| ChunkPos::new(x, z)))
}

fn report(ctx: &PhysicsContext) {
    let structures = ctx.structures();
    if structures.is_empty() {
        warn!("No structure was created");
        return;
    }
    let colliders = ctx.colliders();
    for body in structures.bodies() {
        let boxes = colliders.local_boxes(body).map_or(0, |b| b.len());
        match ctx.bridge().and_then(|b| b.get_body_state(body)) {
            Some(state) => info!(
                "{}: {} boxes, position {:?}, rotation {:?}, velocity {:?}",
                body,
                boxes,
                state.transform.position,
                state.transform.rotation,
                state.linear_velocity
            ),
            None => warn!("{}: {} boxes, no state in the engine", body, boxes),
        }
    }
}
