//! Static terrain colliders, one per loaded chunk column
//!
//! Every dimension keeps its own task list, static bodies, dirty chunks and
//! priority set. A shared per-tick voxel budget is spent on priority chunks
//! first and on the remaining tasks afterwards.

use super::{BuildState, ScanCursor};
use crate::bridge::{BodyId, PhysicsBridge};
use crate::collider_cache::ColliderCache;
use crate::collision::{Aabb, VoxelBox};
use crate::config::PhysicsConfig;
use crate::error::Result;
use crate::voxel::{ChunkPos, DimensionId, SECTION_HEIGHT};
use crate::worker::{JobHandle, OptimizerWorker};
use crate::world::VoxelWorld;
use glam::{IVec3, Vec3};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

struct ChunkTask {
    chunk: ChunkPos,
    cursor: ScanCursor,
    section: Option<i32>,
    section_empty: bool,
    solid: Vec<IVec3>,
    job: Option<JobHandle>,
    state: BuildState,
}

impl ChunkTask {
    fn new(chunk: ChunkPos, min_y: i32, max_y: i32) -> Self {
        Self {
            chunk,
            cursor: ScanCursor::new(
                IVec3::new(chunk.min_block_x(), min_y, chunk.min_block_z()),
                IVec3::new(chunk.max_block_x(), max_y, chunk.max_block_z()),
            ),
            section: None,
            section_empty: false,
            solid: Vec::new(),
            job: None,
            state: BuildState::Scanning,
        }
    }

    /// Visit up to `budget` voxels; empty sections are skipped for free
    ///
    /// # Returns
    /// Number of voxels visited
    fn scan(&mut self, world: &dyn VoxelWorld, budget: u32) -> u32 {
        if self.state != BuildState::Scanning || budget == 0 {
            return 0;
        }
        if !world.is_chunk_loaded(self.chunk) {
            self.fail();
            return 0;
        }

        let mut processed = 0;
        while processed < budget {
            let Some(pos) = self.cursor.current() else {
                break;
            };
            let section = pos.y.div_euclid(SECTION_HEIGHT);
            if self.section != Some(section) {
                self.section = Some(section);
                self.section_empty = world.is_section_empty(self.chunk, section * SECTION_HEIGHT);
            }
            if self.section_empty {
                self.cursor.skip_to_layer((section + 1) * SECTION_HEIGHT);
                continue;
            }
            if world.get_voxel(pos).is_some_and(|v| v.collidable) {
                self.solid.push(pos);
            }
            processed += 1;
            self.cursor.advance();
        }
        processed
    }

    fn fail(&mut self) {
        self.state = BuildState::Failed;
        self.solid.clear();
        if let Some(job) = self.job.take() {
            job.cancel();
        }
    }
}

#[derive(Default)]
struct DimensionState {
    bodies: BTreeMap<ChunkPos, BodyId>,
    tasks: BTreeMap<ChunkPos, ChunkTask>,
    /// Chunk → game tick at which it becomes due for a rebuild
    dirty: BTreeMap<ChunkPos, u64>,
    priority: BTreeSet<ChunkPos>,
}

impl DimensionState {
    fn insert_task(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos, priority: bool) {
        self.tasks
            .insert(chunk, ChunkTask::new(chunk, world.min_y(), world.max_y()));
        if priority {
            self.priority.insert(chunk);
        }
    }
}

/// Ambient chunk collider scheduler
pub struct AmbientScheduler {
    dimensions: HashMap<DimensionId, DimensionState>,
    worker: OptimizerWorker,
    accepting: bool,
    voxels_per_tick: u32,
    dirty_per_tick: u32,
    rebuild_delay: u64,
}

impl AmbientScheduler {
    pub fn new(config: &PhysicsConfig) -> Result<Self> {
        Ok(Self {
            dimensions: HashMap::new(),
            worker: OptimizerWorker::spawn("chunk-optimizer")?,
            accepting: true,
            voxels_per_tick: config.ambient_voxels_per_tick,
            dirty_per_tick: config.ambient_dirty_per_tick,
            rebuild_delay: config.ambient_rebuild_delay_ticks,
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Start a build for a freshly loaded chunk unless it already has a collider
    pub fn on_chunk_load(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        self.schedule(world, chunk, false, false);
    }

    /// Request a collider for `chunk` ahead of ordinary work
    pub fn ensure_chunk_collider(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        self.schedule(world, chunk, false, true);
    }

    fn schedule(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos, force: bool, priority: bool) {
        if !self.accepting {
            return;
        }
        let state = self.dimensions.entry(world.dimension()).or_default();
        if state.tasks.contains_key(&chunk) {
            if priority {
                state.priority.insert(chunk);
            }
            return;
        }
        if !force && state.bodies.contains_key(&chunk) {
            return;
        }
        state.insert_task(world, chunk, priority);
        debug!("Scheduled chunk collider build for {:?}", chunk);
    }

    /// Rebuild `chunk` after the configured delay
    pub fn mark_chunk_dirty(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        let due = world.game_time() + self.rebuild_delay;
        self.mark_dirty(world.dimension(), chunk, due, false);
    }

    /// Rebuild `chunk` on the next tick, ahead of ordinary work
    pub fn mark_chunk_dirty_now(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        self.mark_dirty(world.dimension(), chunk, world.game_time(), true);
    }

    fn mark_dirty(&mut self, dimension: DimensionId, chunk: ChunkPos, due: u64, priority: bool) {
        if !self.accepting {
            return;
        }
        let state = self.dimensions.entry(dimension).or_default();
        state.dirty.insert(chunk, due);
        if priority {
            state.priority.insert(chunk);
        }
    }

    /// Cancel any build for `chunk` and drop its static body
    pub fn on_chunk_unload(
        &mut self,
        dimension: DimensionId,
        chunk: ChunkPos,
        bridge: &mut dyn PhysicsBridge,
    ) {
        let Some(state) = self.dimensions.get_mut(&dimension) else {
            return;
        };
        if let Some(mut task) = state.tasks.remove(&chunk) {
            task.fail();
        }
        state.dirty.remove(&chunk);
        state.priority.remove(&chunk);
        if let Some(body) = state.bodies.remove(&chunk) {
            bridge.remove_body(body);
            debug!("Removed chunk collider {} for {:?}", body, chunk);
        }
    }

    /// Advance every chunk build of `world`'s dimension by one tick
    pub fn tick(
        &mut self,
        world: &dyn VoxelWorld,
        bridge: &mut dyn PhysicsBridge,
        colliders: &ColliderCache,
    ) {
        if !self.accepting {
            return;
        }
        let dimension = world.dimension();
        let now = world.game_time();
        let dirty_limit = self.dirty_per_tick;
        let state = self.dimensions.entry(dimension).or_default();

        // Promote due dirty chunks
        let due: Vec<ChunkPos> = state
            .dirty
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(chunk, _)| *chunk)
            .collect();
        let mut promoted = 0;
        for chunk in due {
            if state.tasks.contains_key(&chunk) {
                state.priority.insert(chunk);
                continue;
            }
            state.dirty.remove(&chunk);
            if !world.is_chunk_loaded(chunk) {
                continue;
            }
            state.insert_task(world, chunk, true);
            promoted += 1;
            if promoted >= dirty_limit {
                break;
            }
        }

        // Priority chunks first, then everything else, from one budget
        let mut budget = self.voxels_per_tick;
        let order: Vec<ChunkPos> = state
            .priority
            .iter()
            .copied()
            .chain(
                state
                    .tasks
                    .keys()
                    .filter(|c| !state.priority.contains(*c))
                    .copied(),
            )
            .collect();
        for chunk in order {
            if budget == 0 {
                break;
            }
            let Some(task) = state.tasks.get_mut(&chunk) else {
                state.priority.remove(&chunk);
                continue;
            };
            budget -= task.scan(world, budget);
            if task.state == BuildState::Scanning && task.cursor.is_finished() {
                task.state = BuildState::Optimizing;
                match self.worker.submit(std::mem::take(&mut task.solid)) {
                    Ok(job) => task.job = Some(job),
                    Err(err) => {
                        debug!("Chunk {:?} optimization not queued: {}", chunk, err);
                        task.fail();
                    }
                }
            }
        }

        // Finish builds whose optimizer pass has come back
        for task in state.tasks.values_mut() {
            if task.state != BuildState::Optimizing {
                continue;
            }
            let Some(result) = task.job.as_mut().and_then(JobHandle::try_result) else {
                continue;
            };
            task.job = None;
            match result {
                Ok(boxes) => finish_build(
                    task,
                    &boxes,
                    world,
                    bridge,
                    colliders,
                    &mut state.bodies,
                ),
                Err(err) => {
                    warn!("Chunk {:?} optimization failed: {}", task.chunk, err);
                    task.fail();
                }
            }
        }

        let finished: Vec<ChunkPos> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.state.is_finished())
            .map(|(c, _)| *c)
            .collect();
        for chunk in finished {
            state.tasks.remove(&chunk);
            state.priority.remove(&chunk);
        }
    }

    pub fn is_chunk_dirty(&self, dimension: DimensionId, chunk: ChunkPos) -> bool {
        self.dimensions
            .get(&dimension)
            .is_some_and(|s| s.dirty.contains_key(&chunk))
    }

    pub fn is_chunk_collider_ready(&self, dimension: DimensionId, chunk: ChunkPos) -> bool {
        self.dimensions
            .get(&dimension)
            .is_some_and(|s| s.bodies.contains_key(&chunk))
    }

    /// `true` while `chunk` is dirty or has a build in flight
    pub fn is_rebuilding(&self, dimension: DimensionId, chunk: ChunkPos) -> bool {
        self.dimensions
            .get(&dimension)
            .is_some_and(|s| s.tasks.contains_key(&chunk) || s.dirty.contains_key(&chunk))
    }

    pub fn chunk_body(&self, dimension: DimensionId, chunk: ChunkPos) -> Option<BodyId> {
        self.dimensions.get(&dimension)?.bodies.get(&chunk).copied()
    }

    pub fn task_state(&self, dimension: DimensionId, chunk: ChunkPos) -> Option<BuildState> {
        self.dimensions
            .get(&dimension)?
            .tasks
            .get(&chunk)
            .map(|t| t.state)
    }

    pub fn task_count(&self, dimension: DimensionId) -> usize {
        self.dimensions.get(&dimension).map_or(0, |s| s.tasks.len())
    }

    pub fn static_body_count(&self, dimension: DimensionId) -> usize {
        self.dimensions.get(&dimension).map_or(0, |s| s.bodies.len())
    }

    /// Refuse further work, cancel running builds and stop the worker
    pub fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for state in self.dimensions.values_mut() {
            for task in state.tasks.values_mut() {
                task.fail();
            }
        }
        self.worker.shutdown();
        self.dimensions.clear();
        info!("Ambient collider scheduler shut down");
    }
}

fn finish_build(
    task: &mut ChunkTask,
    boxes: &[VoxelBox],
    world: &dyn VoxelWorld,
    bridge: &mut dyn PhysicsBridge,
    colliders: &ColliderCache,
    bodies: &mut BTreeMap<ChunkPos, BodyId>,
) {
    let chunk = task.chunk;
    if !world.is_chunk_loaded(chunk) {
        task.fail();
        return;
    }

    if boxes.is_empty() {
        if let Some(old) = bodies.remove(&chunk) {
            bridge.remove_body(old);
        }
    } else {
        let world_boxes: Vec<Aabb> = boxes.iter().map(VoxelBox::to_aabb).collect();
        let body = bridge.create_static_body(&world_boxes);
        if !body.is_valid() {
            warn!("Bridge rejected static body for chunk {:?}", chunk);
            task.fail();
            return;
        }
        if let Some(old) = bodies.insert(chunk, body) {
            bridge.remove_body(old);
        }
        debug!(
            "Chunk {:?} collider {} built from {} boxes",
            chunk,
            body,
            boxes.len()
        );
    }

    let region = chunk_region(world, chunk);
    for id in colliders.bodies_in_region(world.dimension(), &region) {
        bridge.activate_body(id);
    }
    task.state = BuildState::Done;
}

fn chunk_region(world: &dyn VoxelWorld, chunk: ChunkPos) -> Aabb {
    Aabb::new(
        Vec3::new(
            chunk.min_block_x() as f32,
            world.min_y() as f32,
            chunk.min_block_z() as f32,
        ),
        Vec3::new(
            (chunk.max_block_x() + 1) as f32,
            (world.max_y() + 1) as f32,
            (chunk.max_block_z() + 1) as f32,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeCall, RecordingBridge};
    use crate::world::{GridWorld, VoxelState, WriteFlags};
    use std::time::{Duration, Instant};

    fn scheduler() -> AmbientScheduler {
        AmbientScheduler::new(&PhysicsConfig::default()).unwrap()
    }

    fn run_until(
        ambient: &mut AmbientScheduler,
        world: &mut GridWorld,
        bridge: &mut RecordingBridge,
        colliders: &ColliderCache,
        mut done: impl FnMut(&AmbientScheduler) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(ambient) {
            assert!(Instant::now() < deadline, "ambient build did not finish");
            ambient.tick(world, bridge, colliders);
            world.advance(1);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_chunk_load_builds_static_body() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 63);
        world.fill(IVec3::ZERO, IVec3::ONE, &VoxelState::solid(1));
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        let chunk = ChunkPos::new(0, 0);

        ambient.on_chunk_load(&world, chunk);
        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            a.is_chunk_collider_ready(DimensionId::OVERWORLD, chunk)
        });

        let body = ambient.chunk_body(DimensionId::OVERWORLD, chunk).unwrap();
        assert_eq!(
            bridge.boxes(body).unwrap(),
            vec![Aabb::new(Vec3::ZERO, Vec3::splat(2.0))]
        );
        assert_eq!(ambient.task_count(DimensionId::OVERWORLD), 0);

        // A second load of the same chunk keeps the existing collider
        ambient.on_chunk_load(&world, chunk);
        assert_eq!(ambient.task_count(DimensionId::OVERWORLD), 0);
    }

    #[test]
    fn test_empty_sections_are_free() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, -64, 319);
        world.set_voxel(IVec3::new(3, 100, 3), VoxelState::solid(1), WriteFlags::SILENT);
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        let chunk = ChunkPos::new(0, 0);

        ambient.on_chunk_load(&world, chunk);
        ambient.tick(&world, &mut bridge, &colliders);
        // Only the 16-high section holding the voxel costs budget
        assert_ne!(
            ambient.task_state(DimensionId::OVERWORLD, chunk),
            Some(BuildState::Scanning)
        );
    }

    #[test]
    fn test_budget_spreads_scan_over_ticks() {
        let config = PhysicsConfig {
            ambient_voxels_per_tick: 256,
            ..PhysicsConfig::default()
        };
        let mut ambient = AmbientScheduler::new(&config).unwrap();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 15);
        world.fill(IVec3::ZERO, IVec3::new(15, 3, 15), &VoxelState::solid(1));
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        let chunk = ChunkPos::new(0, 0);

        ambient.on_chunk_load(&world, chunk);
        for _ in 0..15 {
            ambient.tick(&world, &mut bridge, &colliders);
            assert_eq!(
                ambient.task_state(DimensionId::OVERWORLD, chunk),
                Some(BuildState::Scanning)
            );
        }
        ambient.tick(&world, &mut bridge, &colliders);
        assert_ne!(
            ambient.task_state(DimensionId::OVERWORLD, chunk),
            Some(BuildState::Scanning)
        );
    }

    #[test]
    fn test_dirty_chunk_waits_for_delay() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 31);
        world.fill(IVec3::ZERO, IVec3::ZERO, &VoxelState::solid(1));
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        let chunk = ChunkPos::new(0, 0);
        let dim = DimensionId::OVERWORLD;

        ambient.mark_chunk_dirty(&world, chunk);
        assert!(ambient.is_chunk_dirty(dim, chunk));
        assert!(ambient.is_rebuilding(dim, chunk));
        for _ in 0..20 {
            ambient.tick(&world, &mut bridge, &colliders);
            assert_eq!(ambient.task_count(dim), 0);
            world.advance(1);
        }
        ambient.tick(&world, &mut bridge, &colliders);
        assert!(!ambient.is_chunk_dirty(dim, chunk));

        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            a.is_chunk_collider_ready(dim, chunk)
        });
        assert!(!ambient.is_rebuilding(dim, chunk));
    }

    #[test]
    fn test_dirty_promotion_is_limited_per_tick() {
        let mut ambient = scheduler();
        let world = GridWorld::new(DimensionId::OVERWORLD, 0, 15);
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        for x in 0..6 {
            ambient.mark_chunk_dirty_now(&world, ChunkPos::new(x, 0));
        }
        ambient.tick(&world, &mut bridge, &colliders);
        let still_dirty = (0..6)
            .filter(|x| ambient.is_chunk_dirty(DimensionId::OVERWORLD, ChunkPos::new(*x, 0)))
            .count();
        assert_eq!(still_dirty, 2);
    }

    #[test]
    fn test_empty_rebuild_removes_body_and_unload_cleans_up() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 15);
        world.fill(IVec3::ZERO, IVec3::ZERO, &VoxelState::solid(1));
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();
        let chunk = ChunkPos::new(0, 0);
        let dim = DimensionId::OVERWORLD;

        ambient.on_chunk_load(&world, chunk);
        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            a.is_chunk_collider_ready(dim, chunk)
        });
        let first = ambient.chunk_body(dim, chunk).unwrap();

        world.clear_voxel(IVec3::ZERO, WriteFlags::SILENT);
        ambient.mark_chunk_dirty_now(&world, chunk);
        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            !a.is_rebuilding(dim, chunk)
        });
        assert!(!ambient.is_chunk_collider_ready(dim, chunk));
        assert!(bridge.calls().contains(&BridgeCall::Remove(first)));

        world.set_voxel(IVec3::ZERO, VoxelState::solid(1), WriteFlags::SILENT);
        ambient.ensure_chunk_collider(&world, chunk);
        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            a.is_chunk_collider_ready(dim, chunk)
        });
        let second = ambient.chunk_body(dim, chunk).unwrap();
        ambient.on_chunk_unload(dim, chunk, &mut bridge);
        assert!(!ambient.is_chunk_collider_ready(dim, chunk));
        assert!(!bridge.live_bodies().contains(&second));
    }

    #[test]
    fn test_finished_build_wakes_bodies_in_chunk() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 15);
        world.fill(IVec3::ZERO, IVec3::ZERO, &VoxelState::solid(1));
        let mut bridge = RecordingBridge::new();
        let mut colliders = ColliderCache::new();
        let resting = BodyId(77);
        let far = BodyId(78);
        colliders.register_body(
            DimensionId::OVERWORLD,
            resting,
            &[Aabb::new(Vec3::new(4.0, 1.0, 4.0), Vec3::new(5.0, 2.0, 5.0))],
            Vec3::new(4.5, 1.5, 4.5),
        );
        colliders.register_body(
            DimensionId::OVERWORLD,
            far,
            &[Aabb::new(Vec3::new(40.0, 1.0, 4.0), Vec3::new(41.0, 2.0, 5.0))],
            Vec3::new(40.5, 1.5, 4.5),
        );
        let chunk = ChunkPos::new(0, 0);

        ambient.on_chunk_load(&world, chunk);
        run_until(&mut ambient, &mut world, &mut bridge, &colliders, |a| {
            a.is_chunk_collider_ready(DimensionId::OVERWORLD, chunk)
        });
        let calls = bridge.calls();
        assert!(calls.contains(&BridgeCall::Activate(resting)));
        assert!(!calls.contains(&BridgeCall::Activate(far)));
    }

    #[test]
    fn test_unloaded_chunk_fails_scan() {
        let mut ambient = scheduler();
        let mut world = GridWorld::new(DimensionId::OVERWORLD, 0, 15).with_explicit_loading();
        let chunk = ChunkPos::new(0, 0);
        world.load_chunk(chunk);
        let mut bridge = RecordingBridge::new();
        let colliders = ColliderCache::new();

        ambient.on_chunk_load(&world, chunk);
        world.unload_chunk(chunk);
        ambient.tick(&world, &mut bridge, &colliders);
        assert_eq!(ambient.task_count(DimensionId::OVERWORLD), 0);
        assert!(bridge.calls().is_empty());
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let mut ambient = scheduler();
        let world = GridWorld::new(DimensionId::OVERWORLD, 0, 15);
        ambient.shutdown();
        ambient.on_chunk_load(&world, ChunkPos::new(0, 0));
        ambient.mark_chunk_dirty_now(&world, ChunkPos::new(0, 0));
        assert!(!ambient.is_accepting());
        assert_eq!(ambient.task_count(DimensionId::OVERWORLD), 0);
        assert!(!ambient.is_chunk_dirty(DimensionId::OVERWORLD, ChunkPos::new(0, 0)));
    }
}
