//! Structure lifecycle scenarios
//!
//! Drives a whole context against the recording bridge:
//! 1. A selected 3×3×3 cube becomes one body with one box at its centroid
//! 2. Breaking the last collidable voxel tears the structure down
//! 3. Lifted world voxels become a structure asynchronously
//! 4. A persisted shadow region restores a structure after restart

use std::time::{Duration, Instant};
use structure_physics::bridge::BridgeCall;
use structure_physics::shipyard::FileRegionStore;
use structure_physics::structure::BuildReport;
use structure_physics::{
    Aabb, BodyId, DimensionId, GridWorld, MaterialKind, OwnerId, PhysicsConfig, PhysicsContext,
    RecordingBridge, Selection, VoxelState, VoxelWorld,
};
use structure_physics::glam::{IVec3, Vec3};

const OWNER: OwnerId = OwnerId(42);
const STONE: u32 = 3;

struct Scene {
    ctx: PhysicsContext,
    bridge: RecordingBridge,
    world: GridWorld,
    shadow: GridWorld,
}

impl Scene {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: PhysicsConfig) -> Self {
        let bridge = RecordingBridge::new();
        let ctx = PhysicsContext::with_bridge(config, Box::new(bridge.clone()))
            .expect("context with recording bridge");
        Self {
            ctx,
            bridge,
            world: GridWorld::new(DimensionId::OVERWORLD, 0, 63),
            shadow: GridWorld::new(DimensionId::SHIPYARD, 0, 255),
        }
    }

    fn tick(&mut self) -> Vec<BuildReport> {
        let reports = self.ctx.tick_dimension(&mut self.world, &mut self.shadow);
        self.ctx.tick_shipyard(&mut self.shadow);
        self.ctx.step(1.0 / 60.0);
        self.world.advance(1);
        self.shadow.advance(1);
        reports
    }

    fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> Vec<BuildReport> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut reports = Vec::new();
        while !done(self) {
            assert!(Instant::now() < deadline, "scene did not settle");
            reports.extend(self.tick());
            std::thread::sleep(Duration::from_millis(1));
        }
        reports
    }

    fn rigid_bodies(&self) -> Vec<BridgeCall> {
        self.bridge
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BridgeCall::CreateRigid { .. }))
            .collect()
    }

    fn build_selection(&mut self, min: IVec3, max: IVec3) -> BodyId {
        self.ctx
            .request_selection(OWNER, DimensionId::OVERWORLD, Selection::new(min, max))
            .expect("selection accepted");
        self.run_until(|s| !s.ctx.selections().is_building(OWNER));
        let notices = self.ctx.drain_notices(OWNER);
        assert!(
            notices.iter().any(|n| n.starts_with("Structure physics created!")),
            "notices: {:?}",
            notices
        );
        *self
            .ctx
            .structures()
            .bodies()
            .last()
            .expect("one structure")
    }
}

fn config() -> PhysicsConfig {
    let mut config = PhysicsConfig::default();
    config
        .materials
        .insert(STONE.to_string(), MaterialKind::Stone);
    config
}

#[test]
fn test_selected_cube_becomes_one_box_at_centroid() {
    let mut scene = Scene::new();
    scene.world.fill(
        IVec3::new(0, 10, 0),
        IVec3::new(2, 12, 2),
        &VoxelState::solid(STONE),
    );

    let body = scene.build_selection(IVec3::new(0, 10, 0), IVec3::new(2, 12, 2));

    let density = MaterialKind::Stone.profile().density;
    let local = Aabb::new(Vec3::splat(-1.5), Vec3::splat(1.5));
    assert_eq!(
        scene.rigid_bodies(),
        vec![BridgeCall::CreateRigid {
            body,
            position: Vec3::new(1.5, 11.5, 1.5),
            boxes: vec![local],
            mass: 27.0 * density,
        }]
    );
    assert_eq!(scene.ctx.colliders().local_boxes(body), Some(&[local][..]));

    // The world copy is gone and mirrored into the shadow region
    assert_eq!(
        scene
            .world
            .count_in(IVec3::new(0, 10, 0), IVec3::new(2, 12, 2)),
        0
    );
    let region = scene
        .ctx
        .shipyard()
        .region_for_body(body)
        .cloned()
        .expect("shadow region");
    assert_eq!(region.size, IVec3::splat(3));
    assert_eq!(
        scene.shadow.get_voxel(region.to_world(IVec3::ONE)),
        Some(VoxelState::solid(STONE))
    );
}

#[test]
fn test_last_voxel_removal_tears_structure_down() {
    let mut scene = Scene::new();
    scene
        .world
        .fill(IVec3::new(5, 20, 5), IVec3::new(5, 20, 5), &VoxelState::solid(STONE));
    let body = scene.build_selection(IVec3::new(5, 20, 5), IVec3::new(5, 20, 5));
    assert!(scene.ctx.colliders().contains(body));

    let broken = scene
        .ctx
        .break_voxel(&mut scene.shadow, body, IVec3::ZERO)
        .unwrap()
        .expect("voxel removed");
    assert_eq!(broken.data.appearance, STONE);
    assert!(scene.ctx.structures().get(body).unwrap().is_dirty());

    scene.run_until(|s| !s.ctx.structures().contains(body));
    assert!(!scene.ctx.colliders().contains(body));
    assert!(scene.ctx.shipyard().is_empty());
    assert!(scene.bridge.calls().contains(&BridgeCall::Remove(body)));
    assert!(!scene.bridge.live_bodies().contains(&body));
}

#[test]
fn test_spawn_from_world_reports_outcome() {
    let mut scene = Scene::new();
    let positions = [IVec3::new(8, 30, 8), IVec3::new(9, 30, 8)];
    for p in positions {
        scene.world.set_voxel(
            p,
            VoxelState::solid(STONE),
            structure_physics::WriteFlags::SILENT,
        );
    }

    let job = scene
        .ctx
        .spawn_from_world(&mut scene.world, OWNER, &positions)
        .unwrap();
    let reports = scene.run_until(|s| s.ctx.structures().pending_builds() == 0);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job, job);
    let outcome = reports[0].result.as_ref().expect("spawned");
    assert_eq!(outcome.block_count, 2);
    assert_eq!(outcome.box_count, 1);
    assert_eq!(scene.world.voxel_count(), 0);
}

#[test]
fn test_restore_from_persisted_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shipyard.bin");

    let mut scene = Scene::new();
    scene.ctx = PhysicsContext::with_bridge(config(), Box::new(scene.bridge.clone()))
        .unwrap()
        .with_region_store(Box::new(FileRegionStore::new(&path)))
        .unwrap();
    scene.world.fill(
        IVec3::new(0, 10, 0),
        IVec3::new(1, 10, 1),
        &VoxelState::solid(STONE),
    );
    scene.build_selection(IVec3::new(0, 10, 0), IVec3::new(1, 10, 1));
    scene.ctx.shutdown();

    // Restart with the same store and shadow world
    scene.ctx = PhysicsContext::with_bridge(config(), Box::new(scene.bridge.clone()))
        .unwrap()
        .with_region_store(Box::new(FileRegionStore::new(&path)))
        .unwrap();
    assert!(scene.ctx.shipyard().region_for_owner(OWNER).is_some());

    let at = Vec3::new(20.0, 40.0, 20.0);
    scene
        .ctx
        .restore_from_shadow(&scene.shadow, OWNER, DimensionId::OVERWORLD, at)
        .unwrap();
    let reports = scene.run_until(|s| s.ctx.structures().pending_builds() == 0);
    let restored = reports[0].result.as_ref().expect("restored").body;
    assert_eq!(scene.ctx.structures().get(restored).unwrap().len(), 4);
    assert_eq!(
        scene.ctx.shipyard().region_for_body(restored).map(|r| r.owner),
        Some(OWNER)
    );
}
