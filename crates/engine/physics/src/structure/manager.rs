//! Structure lifecycle: construction, incremental rebuilds and interaction

use super::{box_centroid, to_body_space, traverse, PhysicsStructure, StructureBlockData};
use crate::bridge::{BodyId, BodyTransform, PhysicsBridge};
use crate::collider_cache::ColliderCache;
use crate::collision::VoxelBox;
use crate::config::PhysicsConfig;
use crate::error::{PhysicsError, Result};
use crate::material::{MaterialAggregator, MaterialTable};
use crate::scheduler::{AmbientScheduler, CapturedSelection};
use crate::shipyard::Shipyard;
use crate::voxel::{ChunkPos, DimensionId, Face, OwnerId, VoxelKey};
use crate::worker::{JobHandle, JobId, OptimizerWorker};
use crate::world::{VoxelState, VoxelWorld, WriteFlags};
use glam::{IVec3, Vec3};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Collaborators a structure operation touches, borrowed for one call
pub struct StructureEnv<'a> {
    pub bridge: &'a mut dyn PhysicsBridge,
    pub colliders: &'a mut ColliderCache,
    pub shipyard: &'a mut Shipyard,
    /// Shadow world hosting the mirrored content
    pub shadow: &'a mut dyn VoxelWorld,
    pub materials: &'a MaterialTable,
}

/// Where a new body goes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// Local `(0, 0, 0)` sits at this world voxel; the body spawns at the centroid
    Origin(IVec3),
    /// The body's center of mass is placed here
    Position(Vec3),
}

/// What happens to the shadow region of a new structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowMode {
    /// Allocate a region and mirror the content into it
    Place,
    /// Attach to the owner's existing region, which already holds the content
    Bind,
}

/// Input of [`StructureManager::construct`]
#[derive(Debug, Clone)]
pub struct StructureSeed {
    pub dimension: DimensionId,
    pub owner: OwnerId,
    pub voxels: HashMap<IVec3, StructureBlockData>,
    pub placement: Placement,
    pub shadow: ShadowMode,
}

impl From<CapturedSelection> for StructureSeed {
    fn from(captured: CapturedSelection) -> Self {
        Self {
            dimension: captured.dimension,
            owner: captured.owner,
            voxels: captured.voxels,
            placement: Placement::Origin(captured.origin),
            shadow: ShadowMode::Place,
        }
    }
}

/// A structure that now exists
#[derive(Debug)]
pub struct BuildOutcome {
    pub body: BodyId,
    pub block_count: usize,
    pub box_count: usize,
    /// Set when the body exists but its shadow mirror could not be placed
    pub shadow_error: Option<PhysicsError>,
}

/// Result of an asynchronous spawn or restore
#[derive(Debug)]
pub struct BuildReport {
    pub owner: OwnerId,
    pub job: JobId,
    pub result: Result<BuildOutcome>,
}

/// Voxel under a ray
#[derive(Debug, Clone, PartialEq)]
pub struct StructureHit {
    pub body: BodyId,
    pub local: IVec3,
    pub face: Option<Face>,
    pub distance: f32,
    pub world_center: Vec3,
    pub data: StructureBlockData,
}

/// Voxel removed from a structure, for drops and side effects
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenVoxel {
    pub body: BodyId,
    pub local: IVec3,
    pub world_center: Vec3,
    pub data: StructureBlockData,
}

/// Outcome of one mining hit
#[derive(Debug, Clone, PartialEq)]
pub enum MiningProgress {
    Missed,
    InProgress(f32),
    Broken(BrokenVoxel),
}

#[derive(Debug, Clone, Copy)]
struct MiningState {
    body: BodyId,
    local: IVec3,
    progress: f32,
    last_hit: u64,
}

struct RebuildJob {
    handle: JobHandle,
    /// Offset at dispatch; the result is in the local frame of that moment
    origin_offset: Vec3,
}

struct PendingBuild {
    seed: StructureSeed,
    handle: JobHandle,
}

/// Owner of every dynamic structure
pub struct StructureManager {
    structures: HashMap<BodyId, PhysicsStructure>,
    rebuilds: HashMap<BodyId, RebuildJob>,
    pending: Vec<PendingBuild>,
    mining: HashMap<OwnerId, MiningState>,
    worker: OptimizerWorker,
    accepting: bool,
    reach: f32,
    mining_timeout: u64,
    collider_budget: u32,
}

impl StructureManager {
    pub fn new(config: &PhysicsConfig) -> Result<Self> {
        Ok(Self {
            structures: HashMap::new(),
            rebuilds: HashMap::new(),
            pending: Vec::new(),
            mining: HashMap::new(),
            worker: OptimizerWorker::spawn("structure-rebuild")?,
            accepting: true,
            reach: config.interaction_reach,
            mining_timeout: config.mining_timeout_ticks,
            collider_budget: config.world_collider_budget,
        })
    }

    /// Create a body for `seed` from already optimized local `boxes`
    ///
    /// Either the structure is fully registered (body, collider cache entry,
    /// structure map) or nothing is left behind. A shadow failure does not
    /// fail the build; it is returned in [`BuildOutcome::shadow_error`].
    pub fn construct(
        &mut self,
        env: &mut StructureEnv<'_>,
        seed: StructureSeed,
        boxes: &[VoxelBox],
    ) -> Result<BuildOutcome> {
        if !self.accepting {
            return Err(PhysicsError::ShuttingDown);
        }
        if boxes.is_empty() {
            return Err(PhysicsError::EmptyGeometry);
        }
        if let Some(p) = seed.voxels.keys().find(|p| !VoxelKey::in_range(**p)) {
            return Err(PhysicsError::OutOfRange(*p));
        }

        let centroid = box_centroid(boxes);
        let origin_offset = -centroid;
        let (origin, position) = match seed.placement {
            Placement::Origin(origin) => (origin, origin.as_vec3() + centroid),
            Placement::Position(position) => ((position - centroid).floor().as_ivec3(), position),
        };

        let summary = MaterialAggregator::from_profiles(
            seed.voxels
                .values()
                .map(|d| env.materials.profile_for(d.appearance)),
        )
        .snapshot();
        let local_boxes = to_body_space(boxes, origin_offset);

        let body = env.bridge.create_rigid_body(position, &local_boxes, &summary);
        if !body.is_valid() {
            warn!("Bridge refused a body for {} ({} boxes)", seed.owner, boxes.len());
            return Err(PhysicsError::BodyCreationFailed);
        }
        env.colliders.register_local(
            seed.dimension,
            body,
            local_boxes,
            BodyTransform::from_position(position),
        );
        if !env.colliders.contains(body) {
            env.bridge.remove_body(body);
            return Err(PhysicsError::BodyCreationFailed);
        }

        let structure = match PhysicsStructure::new(
            seed.dimension,
            seed.owner,
            body,
            origin,
            origin_offset,
            seed.voxels,
            env.materials,
        ) {
            Ok(structure) => structure,
            Err(err) => {
                env.colliders.unregister(body);
                env.bridge.remove_body(body);
                return Err(err);
            }
        };

        let shadow_result = match seed.shadow {
            ShadowMode::Place => mirror_into_shadow(env, &structure),
            ShadowMode::Bind => env.shipyard.bind_body(env.shadow, seed.owner, body),
        };
        let shadow_error = shadow_result.err();
        if let Some(err) = &shadow_error {
            warn!("Structure {} has no shadow mirror: {}", body, err);
        }

        let outcome = BuildOutcome {
            body,
            block_count: structure.len(),
            box_count: boxes.len(),
            shadow_error,
        };
        info!(
            "Created structure {} for {}: {} blocks, {} boxes, mass {:.1}",
            body,
            seed.owner,
            outcome.block_count,
            outcome.box_count,
            summary.body_mass()
        );
        self.structures.insert(body, structure);
        Ok(outcome)
    }

    /// Turn a finished selection into a structure
    pub fn finalize_selection(
        &mut self,
        env: &mut StructureEnv<'_>,
        mut captured: CapturedSelection,
    ) -> Result<BuildOutcome> {
        let boxes = std::mem::take(&mut captured.boxes);
        self.construct(env, StructureSeed::from(captured), &boxes)
    }

    /// Lift world voxels into a new structure; finished by [`StructureManager::tick`]
    ///
    /// The local frame starts at the minimum corner of the lifted voxels.
    pub fn spawn_from_world(
        &mut self,
        world: &mut dyn VoxelWorld,
        ambient: &mut AmbientScheduler,
        owner: OwnerId,
        positions: &[IVec3],
    ) -> Result<JobId> {
        if !self.accepting {
            return Err(PhysicsError::ShuttingDown);
        }
        let lifted: Vec<(IVec3, VoxelState)> = positions
            .iter()
            .filter_map(|p| world.get_voxel(*p).map(|s| (*p, s)))
            .collect();
        if !lifted.iter().any(|(_, s)| s.collidable) {
            return Err(PhysicsError::EmptyGeometry);
        }
        let origin = lifted
            .iter()
            .map(|(p, _)| *p)
            .fold(IVec3::MAX, IVec3::min);

        let mut chunks = BTreeSet::new();
        let mut voxels = HashMap::with_capacity(lifted.len());
        let mut solid = Vec::new();
        for (pos, state) in lifted {
            world.clear_voxel(pos, WriteFlags::SILENT);
            chunks.insert(ChunkPos::containing(pos));
            if state.collidable {
                solid.push(pos - origin);
            }
            voxels.insert(pos - origin, StructureBlockData::from(state));
        }
        for chunk in chunks {
            ambient.mark_chunk_dirty_now(&*world, chunk);
        }

        let handle = self.worker.submit(solid)?;
        let job = handle.id;
        debug!("Spawn of {} voxels for {} queued as {}", voxels.len(), owner, job);
        self.pending.push(PendingBuild {
            seed: StructureSeed {
                dimension: world.dimension(),
                owner,
                voxels,
                placement: Placement::Origin(origin),
                shadow: ShadowMode::Place,
            },
            handle,
        });
        Ok(job)
    }

    /// Recreate `owner`'s structure from its persisted shadow region
    pub fn restore_from_shadow(
        &mut self,
        shadow: &dyn VoxelWorld,
        shipyard: &Shipyard,
        owner: OwnerId,
        dimension: DimensionId,
        position: Vec3,
    ) -> Result<JobId> {
        if !self.accepting {
            return Err(PhysicsError::ShuttingDown);
        }
        let content = shipyard.read_region(shadow, owner)?;
        let solid: Vec<IVec3> = content
            .iter()
            .filter(|(_, s)| s.collidable)
            .map(|(p, _)| *p)
            .collect();
        if solid.is_empty() {
            return Err(PhysicsError::EmptyGeometry);
        }
        let handle = self.worker.submit(solid)?;
        let job = handle.id;
        debug!("Restore of {} from shadow queued as {}", owner, job);
        self.pending.push(PendingBuild {
            seed: StructureSeed {
                dimension,
                owner,
                voxels: content
                    .into_iter()
                    .map(|(p, s)| (p, StructureBlockData::from(s)))
                    .collect(),
                placement: Placement::Position(position),
                shadow: ShadowMode::Bind,
            },
            handle,
        });
        Ok(job)
    }

    /// One simulation tick for the structures of `world`'s dimension
    pub fn tick(
        &mut self,
        env: &mut StructureEnv<'_>,
        world: &dyn VoxelWorld,
        ambient: &mut AmbientScheduler,
    ) -> Vec<BuildReport> {
        let dimension = world.dimension();
        let reports = self.poll_pending(env, dimension);
        self.apply_levitation(env.bridge, dimension);
        self.poll_rebuilds(env);
        self.dispatch_rebuilds(dimension);
        self.expire_mining(world.game_time());
        self.ensure_world_colliders(env.colliders, world, ambient);
        reports
    }

    fn poll_pending(&mut self, env: &mut StructureEnv<'_>, dimension: DimensionId) -> Vec<BuildReport> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].seed.dimension != dimension {
                i += 1;
                continue;
            }
            match self.pending[i].handle.try_result() {
                Some(result) => ready.push((self.pending.swap_remove(i), result)),
                None => i += 1,
            }
        }

        ready
            .into_iter()
            .map(|(build, result)| {
                let owner = build.seed.owner;
                let result = result.and_then(|boxes| self.construct(env, build.seed, &boxes));
                if let Err(err) = &result {
                    warn!("Build {} for {} failed: {}", build.handle.id, owner, err);
                }
                BuildReport {
                    owner,
                    job: build.handle.id,
                    result,
                }
            })
            .collect()
    }

    fn apply_levitation(&self, bridge: &mut dyn PhysicsBridge, dimension: DimensionId) {
        for (body, structure) in &self.structures {
            if structure.dimension() != dimension {
                continue;
            }
            let summary = structure.material_summary();
            if summary.levitation_accel > 0.0 {
                let lift = summary.body_mass() * summary.levitation_accel;
                bridge.apply_force(*body, Vec3::new(0.0, lift, 0.0));
                bridge.activate_body(*body);
            }
        }
    }

    fn poll_rebuilds(&mut self, env: &mut StructureEnv<'_>) {
        let mut finished = Vec::new();
        for (body, job) in self.rebuilds.iter_mut() {
            if let Some(result) = job.handle.try_result() {
                finished.push((*body, job.origin_offset, result));
            }
        }

        for (body, offset, result) in finished {
            self.rebuilds.remove(&body);
            let Some(structure) = self.structures.get_mut(&body) else {
                continue;
            };
            structure.finish_rebuild();
            let summary = structure.material_summary();
            match result {
                Ok(boxes) if boxes.is_empty() => {
                    info!("Structure {} has no collidable blocks left", body);
                    if let Err(err) = self.remove_structure(env, body) {
                        warn!("Teardown of {} failed: {}", body, err);
                    }
                }
                Ok(boxes) => {
                    let local = to_body_space(&boxes, offset);
                    env.bridge.update_body_shape(body, &local);
                    env.colliders.update_shape(body, local);
                    env.bridge.set_body_material(body, &summary);
                    env.bridge.activate_body(body);
                    debug!("Rebuilt {} with {} boxes", body, boxes.len());
                }
                Err(err) => warn!("Rebuild of {} failed: {}", body, err),
            }
        }
    }

    fn dispatch_rebuilds(&mut self, dimension: DimensionId) {
        for (body, structure) in self.structures.iter_mut() {
            if structure.dimension() != dimension {
                continue;
            }
            let Some(snapshot) = structure.begin_rebuild() else {
                continue;
            };
            match self.worker.submit(snapshot) {
                Ok(handle) => {
                    self.rebuilds.insert(
                        *body,
                        RebuildJob {
                            handle,
                            origin_offset: structure.origin_offset(),
                        },
                    );
                }
                Err(err) => {
                    structure.finish_rebuild();
                    structure.mark_dirty();
                    debug!("Rebuild of {} not dispatched: {}", body, err);
                }
            }
        }
    }

    fn expire_mining(&mut self, now: u64) {
        let timeout = self.mining_timeout;
        self.mining
            .retain(|_, m| now.saturating_sub(m.last_hit) <= timeout);
    }

    /// Request terrain colliders under every structure, within budget
    fn ensure_world_colliders(
        &self,
        colliders: &ColliderCache,
        world: &dyn VoxelWorld,
        ambient: &mut AmbientScheduler,
    ) {
        let dimension = world.dimension();
        let mut budget = self.collider_budget;
        let mut bodies: Vec<BodyId> = self
            .structures
            .iter()
            .filter(|(_, s)| s.dimension() == dimension)
            .map(|(b, _)| *b)
            .collect();
        bodies.sort();

        for body in bodies {
            let Some(bounds) = colliders.body_bounds(body) else {
                continue;
            };
            let bounds = bounds.inflated(1.0);
            let lo = ChunkPos::containing_point(bounds.min.x, bounds.min.z);
            let hi = ChunkPos::containing_point(bounds.max.x, bounds.max.z);
            for x in lo.x..=hi.x {
                for z in lo.z..=hi.z {
                    if budget == 0 {
                        return;
                    }
                    let chunk = ChunkPos::new(x, z);
                    if !world.is_chunk_loaded(chunk)
                        || ambient.is_chunk_collider_ready(dimension, chunk)
                        || ambient.is_rebuilding(dimension, chunk)
                    {
                        continue;
                    }
                    ambient.ensure_chunk_collider(world, chunk);
                    budget -= 1;
                }
            }
        }
    }

    /// First structure voxel along a world-space ray
    pub fn raycast(
        &self,
        bridge: &dyn PhysicsBridge,
        body: BodyId,
        eye: Vec3,
        look: Vec3,
        reach: f32,
    ) -> Option<StructureHit> {
        let structure = self.structures.get(&body)?;
        let transform = bridge.get_body_state(body)?.transform;
        let (origin, dir) = structure.world_ray_to_local(&transform, eye, look);
        let hit = traverse(origin, dir, reach, |p| structure.contains(p))?;
        let data = structure.get(hit.voxel)?.clone();
        Some(StructureHit {
            body,
            local: hit.voxel,
            face: hit.face,
            distance: hit.distance,
            world_center: structure.voxel_center_world(&transform, hit.voxel),
            data,
        })
    }

    /// Remove one voxel and clear its shadow mirror
    ///
    /// # Returns
    /// The removed content, delivered before anything else sees the removal
    pub fn break_voxel(
        &mut self,
        env: &mut StructureEnv<'_>,
        body: BodyId,
        local: IVec3,
    ) -> Result<Option<BrokenVoxel>> {
        let structure = self
            .structures
            .get_mut(&body)
            .ok_or(PhysicsError::UnknownBody(body))?;
        let transform = env
            .bridge
            .get_body_state(body)
            .map(|s| s.transform)
            .unwrap_or_default();
        let world_center = structure.voxel_center_world(&transform, local);
        let Some(data) = structure.remove(local, env.materials) else {
            return Ok(None);
        };

        if let Some(region) = env.shipyard.region_for_body(body) {
            let flags = WriteFlags {
                notify_neighbors: true,
                record_change: false,
            };
            env.shadow.clear_voxel(region.to_world(local), flags);
        }
        env.bridge
            .set_body_material(body, &structure.material_summary());
        self.mining
            .retain(|_, m| !(m.body == body && m.local == local));
        debug!("Broke {:?} of {}", local, body);
        Ok(Some(BrokenVoxel {
            body,
            local,
            world_center,
            data,
        }))
    }

    /// Timed mining
    ///
    /// Progress accumulates per actor while it keeps hitting the same voxel;
    /// aiming elsewhere restarts it and a pause longer than the timeout drops it.
    #[allow(clippy::too_many_arguments)]
    pub fn attack(
        &mut self,
        env: &mut StructureEnv<'_>,
        actor: OwnerId,
        body: BodyId,
        eye: Vec3,
        look: Vec3,
        progress_delta: f32,
        now: u64,
    ) -> Result<MiningProgress> {
        if !self.structures.contains_key(&body) {
            return Err(PhysicsError::UnknownBody(body));
        }
        let Some(hit) = self.raycast(&*env.bridge, body, eye, look, self.reach) else {
            self.mining.remove(&actor);
            return Ok(MiningProgress::Missed);
        };

        let timeout = self.mining_timeout;
        let state = self.mining.entry(actor).or_insert(MiningState {
            body,
            local: hit.local,
            progress: 0.0,
            last_hit: now,
        });
        if state.body != body
            || state.local != hit.local
            || now.saturating_sub(state.last_hit) > timeout
        {
            *state = MiningState {
                body,
                local: hit.local,
                progress: 0.0,
                last_hit: now,
            };
        }
        state.progress += progress_delta;
        state.last_hit = now;
        let progress = state.progress;

        if progress < 1.0 {
            return Ok(MiningProgress::InProgress(progress));
        }
        self.mining.remove(&actor);
        match self.break_voxel(env, body, hit.local)? {
            Some(broken) => Ok(MiningProgress::Broken(broken)),
            None => Ok(MiningProgress::Missed),
        }
    }

    /// Place a voxel against `face` of the voxel at `target`
    ///
    /// The shadow region grows first; when it grows toward negative
    /// coordinates the structure's local frame shifts with it.
    ///
    /// # Returns
    /// Final local position of the new voxel, or `None` if that cell is taken
    pub fn place_on_face(
        &mut self,
        env: &mut StructureEnv<'_>,
        body: BodyId,
        target: IVec3,
        face: Face,
        data: StructureBlockData,
    ) -> Result<Option<IVec3>> {
        let structure = self
            .structures
            .get_mut(&body)
            .ok_or(PhysicsError::UnknownBody(body))?;
        let mut local = face.relative(target);
        if !VoxelKey::in_range(local) {
            return Err(PhysicsError::OutOfRange(local));
        }
        if structure.contains(local) {
            return Ok(None);
        }

        let owner = structure.owner();
        let mut mirrored = env.shipyard.region_for_body(body).is_some();
        if mirrored {
            match env.shipyard.expand_region(env.shadow, owner, local) {
                Ok(Some(expansion)) if expansion.shift != IVec3::ZERO => {
                    structure.shift_local(expansion.shift)?;
                    for m in self.mining.values_mut().filter(|m| m.body == body) {
                        m.local += expansion.shift;
                    }
                    local += expansion.shift;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("Shadow region of {} not expanded: {}", owner, err);
                    mirrored = false;
                }
            }
        }

        let state = data.to_state();
        structure.put(local, data, env.materials)?;
        if mirrored {
            if let Some(region) = env.shipyard.region_for_body(body) {
                env.shadow
                    .set_voxel(region.to_world(local), state, WriteFlags::SILENT);
            }
            env.shipyard.queue_neighbor_updates(owner, vec![local]);
        }
        env.bridge
            .set_body_material(body, &structure.material_summary());
        Ok(Some(local))
    }

    /// Apply an externally caused shadow write to the owning structure
    ///
    /// A write that leaves the stored block unchanged is ignored.
    ///
    /// # Returns
    /// `true` if the structure's collision geometry became stale
    pub fn apply_shadow_update(
        &mut self,
        bridge: &mut dyn PhysicsBridge,
        materials: &MaterialTable,
        body: BodyId,
        local: IVec3,
        state: Option<VoxelState>,
    ) -> Result<bool> {
        let structure = self
            .structures
            .get_mut(&body)
            .ok_or(PhysicsError::UnknownBody(body))?;
        let was_dirty = structure.is_dirty();
        let changed = match state {
            Some(state) => {
                let data = StructureBlockData::from(state);
                if structure.get(local) == Some(&data) {
                    false
                } else {
                    structure.put(local, data, materials)?;
                    true
                }
            }
            None => structure.remove(local, materials).is_some(),
        };
        if changed {
            bridge.set_body_material(body, &structure.material_summary());
        }
        Ok(structure.is_dirty() && !was_dirty)
    }

    /// Tear down a structure: body, collider cache entry and shadow region
    pub fn remove_structure(
        &mut self,
        env: &mut StructureEnv<'_>,
        body: BodyId,
    ) -> Result<PhysicsStructure> {
        let structure = self
            .structures
            .remove(&body)
            .ok_or(PhysicsError::UnknownBody(body))?;
        if let Some(job) = self.rebuilds.remove(&body) {
            job.handle.cancel();
        }
        self.mining.retain(|_, m| m.body != body);
        env.bridge.remove_body(body);
        env.colliders.unregister(body);
        env.shipyard.remove_region_for_body(env.shadow, body);
        info!("Removed structure {} of {}", body, structure.owner());
        Ok(structure)
    }

    pub fn get(&self, body: BodyId) -> Option<&PhysicsStructure> {
        self.structures.get(&body)
    }

    /// Direct mutation; callers are responsible for material sync
    pub fn get_mut(&mut self, body: BodyId) -> Option<&mut PhysicsStructure> {
        self.structures.get_mut(&body)
    }

    pub fn contains(&self, body: BodyId) -> bool {
        self.structures.contains_key(&body)
    }

    /// Body ids in ascending order
    pub fn bodies(&self) -> Vec<BodyId> {
        let mut ids: Vec<BodyId> = self.structures.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    pub fn is_rebuilding(&self, body: BodyId) -> bool {
        self.rebuilds.contains_key(&body)
    }

    /// Spawns and restores still waiting for the optimizer
    pub fn pending_builds(&self) -> usize {
        self.pending.len()
    }

    pub fn mining_progress(&self, actor: OwnerId) -> Option<f32> {
        self.mining.get(&actor).map(|m| m.progress)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Stop the worker and forget every structure; shadow regions stay persisted
    pub fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for job in self.rebuilds.values() {
            job.handle.cancel();
        }
        for build in &self.pending {
            build.handle.cancel();
        }
        self.worker.shutdown();
        self.rebuilds.clear();
        self.pending.clear();
        self.mining.clear();
        self.structures.clear();
        info!("Structure manager shut down");
    }
}

fn mirror_into_shadow(env: &mut StructureEnv<'_>, structure: &PhysicsStructure) -> Result<()> {
    let Some((_, max)) = structure.local_bounds() else {
        return Ok(());
    };
    let size = max.max(IVec3::ZERO) + IVec3::ONE;
    env.shipyard
        .ensure_region(env.shadow, structure.owner(), Some(structure.body()), size)?;
    let blocks: Vec<(IVec3, VoxelState)> = structure
        .voxels()
        .map(|(p, d)| (p, d.to_state()))
        .collect();
    let locals = blocks.iter().map(|(p, _)| *p).collect();
    env.shipyard
        .place_blocks(env.shadow, structure.owner(), blocks)?;
    env.shipyard
        .queue_neighbor_updates(structure.owner(), locals);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BodySnapshot, BridgeCall, RecordingBridge};
    use crate::collision::Aabb;
    use crate::material::MaterialKind;
    use crate::world::GridWorld;
    use std::time::{Duration, Instant};

    const OWNER: OwnerId = OwnerId(7);

    struct Rig {
        manager: StructureManager,
        bridge: RecordingBridge,
        colliders: ColliderCache,
        shipyard: Shipyard,
        shadow: GridWorld,
        world: GridWorld,
        ambient: AmbientScheduler,
        materials: MaterialTable,
    }

    impl Rig {
        fn new() -> Self {
            let config = PhysicsConfig::default();
            let mut materials = MaterialTable::default();
            materials.assign(2, MaterialKind::Stone);
            materials.assign(5, MaterialKind::Levitating);
            Self {
                manager: StructureManager::new(&config).unwrap(),
                bridge: RecordingBridge::new(),
                colliders: ColliderCache::new(),
                shipyard: Shipyard::new(config.shipyard),
                shadow: GridWorld::new(DimensionId::SHIPYARD, 0, 255),
                world: GridWorld::new(DimensionId::OVERWORLD, 0, 63),
                ambient: AmbientScheduler::new(&config).unwrap(),
                materials,
            }
        }

        fn construct(&mut self, voxels: &[(IVec3, VoxelState)], origin: IVec3) -> Result<BuildOutcome> {
            let data: HashMap<IVec3, StructureBlockData> = voxels
                .iter()
                .map(|(p, s)| (*p, StructureBlockData::from(s.clone())))
                .collect();
            let boxes = crate::optimizer::optimize(
                voxels.iter().filter(|(_, s)| s.collidable).map(|(p, _)| *p),
            );
            let seed = StructureSeed {
                dimension: DimensionId::OVERWORLD,
                owner: OWNER,
                voxels: data,
                placement: Placement::Origin(origin),
                shadow: ShadowMode::Place,
            };
            let (manager, mut env) = self.split();
            manager.construct(&mut env, seed, &boxes)
        }

        fn split(&mut self) -> (&mut StructureManager, StructureEnv<'_>) {
            (
                &mut self.manager,
                StructureEnv {
                    bridge: &mut self.bridge,
                    colliders: &mut self.colliders,
                    shipyard: &mut self.shipyard,
                    shadow: &mut self.shadow,
                    materials: &self.materials,
                },
            )
        }

        fn tick(&mut self) -> Vec<BuildReport> {
            let mut env = StructureEnv {
                bridge: &mut self.bridge,
                colliders: &mut self.colliders,
                shipyard: &mut self.shipyard,
                shadow: &mut self.shadow,
                materials: &self.materials,
            };
            let reports = self.manager.tick(&mut env, &self.world, &mut self.ambient);
            self.world.advance(1);
            reports
        }

        fn tick_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> Vec<BuildReport> {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut reports = Vec::new();
            while !done(self) {
                assert!(Instant::now() < deadline, "condition not reached");
                reports.extend(self.tick());
                std::thread::sleep(Duration::from_millis(1));
            }
            reports
        }
    }

    fn cube(n: i32, appearance: u32) -> Vec<(IVec3, VoxelState)> {
        let mut out = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    out.push((IVec3::new(x, y, z), VoxelState::solid(appearance)));
                }
            }
        }
        out
    }

    #[test]
    fn test_construct_cube_at_centroid() {
        let mut rig = Rig::new();
        let outcome = rig.construct(&cube(3, 2), IVec3::new(10, 0, 0)).unwrap();
        assert_eq!(outcome.block_count, 27);
        assert_eq!(outcome.box_count, 1);
        assert!(outcome.shadow_error.is_none());

        let calls = rig.bridge.calls();
        let BridgeCall::CreateRigid {
            position,
            boxes,
            mass,
            ..
        } = &calls[0]
        else {
            panic!("expected rigid body creation, got {:?}", calls[0]);
        };
        assert_eq!(*position, Vec3::new(11.5, 1.5, 1.5));
        assert_eq!(*boxes, vec![Aabb::new(Vec3::splat(-1.5), Vec3::splat(1.5))]);
        assert_eq!(*mass, 27.0 * 2.0);

        assert_eq!(
            rig.colliders.local_boxes(outcome.body).unwrap(),
            &[Aabb::new(Vec3::splat(-1.5), Vec3::splat(1.5))]
        );
        let region = rig.shipyard.region_for_body(outcome.body).unwrap().clone();
        assert_eq!(region.size, IVec3::splat(3));
        assert_eq!(rig.shadow.voxel_count(), 27);
        assert!(rig.shadow.drain_changes().is_empty());
    }

    #[test]
    fn test_failed_creation_leaves_nothing() {
        let mut rig = Rig::new();
        rig.bridge.fail_creation(true);
        let err = rig.construct(&cube(2, 2), IVec3::ZERO).unwrap_err();
        assert!(matches!(err, PhysicsError::BodyCreationFailed));
        assert!(rig.manager.is_empty());
        assert!(rig.colliders.is_empty());
        assert!(rig.shipyard.is_empty());

        let err = rig.construct(&[(IVec3::ZERO, VoxelState::decorative(1))], IVec3::ZERO);
        assert!(matches!(err, Err(PhysicsError::EmptyGeometry)));
    }

    #[test]
    fn test_shadow_failure_keeps_body() {
        let mut rig = Rig::new();
        rig.shadow = GridWorld::new(DimensionId::SHIPYARD, 0, 255).with_explicit_loading();
        rig.shadow.refuse_forcing(true);
        let outcome = rig.construct(&cube(1, 2), IVec3::ZERO).unwrap();
        assert!(matches!(
            outcome.shadow_error,
            Some(PhysicsError::ShadowPlacementFailure(_))
        ));
        assert!(rig.manager.contains(outcome.body));
        assert!(rig.colliders.contains(outcome.body));
    }

    #[test]
    fn test_dirty_during_rebuild_triggers_one_more() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(2, 2), IVec3::ZERO).unwrap().body;

        {
            let (manager, mut env) = rig.split();
            let data = StructureBlockData::from(VoxelState::solid(2));
            manager
                .place_on_face(&mut env, body, IVec3::new(1, 1, 1), Face::Up, data)
                .unwrap();
        }
        rig.tick();
        assert!(rig.manager.is_rebuilding(body));
        assert!(!rig.manager.get(body).unwrap().is_dirty());

        // Mutation while the first rebuild is in flight
        {
            let (manager, mut env) = rig.split();
            manager.break_voxel(&mut env, body, IVec3::ZERO).unwrap().unwrap();
        }
        assert!(rig.manager.get(body).unwrap().is_dirty());

        rig.tick_until(|r| !r.manager.is_rebuilding(body) && !r.manager.get(body).unwrap().is_dirty());
        let updates = rig
            .bridge
            .count(|c| matches!(c, BridgeCall::UpdateShape { body: b, .. } if *b == body));
        assert_eq!(updates, 2);
        assert_eq!(
            rig.colliders
                .local_boxes(body)
                .unwrap()
                .iter()
                .map(|b| b.volume())
                .sum::<f32>(),
            8.0
        );
    }

    #[test]
    fn test_empty_rebuild_tears_down() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(1, 2), IVec3::ZERO).unwrap().body;
        {
            let (manager, mut env) = rig.split();
            let broken = manager.break_voxel(&mut env, body, IVec3::ZERO).unwrap().unwrap();
            assert_eq!(broken.data.appearance, 2);
        }
        assert!(rig.manager.get(body).unwrap().is_dirty());
        rig.tick_until(|r| !r.manager.contains(body));

        assert!(!rig.colliders.contains(body));
        assert!(rig.shipyard.region_for_body(body).is_none());
        assert!(rig.bridge.calls().contains(&BridgeCall::Remove(body)));
    }

    #[test]
    fn test_raycast_and_mining() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(3, 2), IVec3::ZERO).unwrap().body;
        let eye = Vec3::new(1.5, 1.5, -3.0);

        let hit = rig.manager.raycast(&rig.bridge, body, eye, Vec3::Z, 5.0).unwrap();
        assert_eq!(hit.local, IVec3::new(1, 1, 0));
        assert_eq!(hit.face, Some(Face::North));
        assert!((hit.world_center - Vec3::new(1.5, 1.5, 0.5)).length() < 1e-5);

        let (manager, mut env) = rig.split();
        assert_eq!(
            manager.attack(&mut env, OwnerId(1), body, eye, Vec3::Z, 0.4, 0).unwrap(),
            MiningProgress::InProgress(0.4)
        );
        // Too long without a hit: progress restarts
        assert_eq!(
            manager.attack(&mut env, OwnerId(1), body, eye, Vec3::Z, 0.4, 100).unwrap(),
            MiningProgress::InProgress(0.4)
        );
        manager.attack(&mut env, OwnerId(1), body, eye, Vec3::Z, 0.4, 101).unwrap();
        match manager.attack(&mut env, OwnerId(1), body, eye, Vec3::Z, 0.4, 102).unwrap() {
            MiningProgress::Broken(b) => assert_eq!(b.local, IVec3::new(1, 1, 0)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            manager.attack(&mut env, OwnerId(1), body, eye, Vec3::NEG_Z, 0.4, 103).unwrap(),
            MiningProgress::Missed
        );
        assert_eq!(manager.get(body).unwrap().len(), 26);
    }

    #[test]
    fn test_raycast_follows_rotation() {
        let mut rig = Rig::new();
        let body = rig.construct(&[(IVec3::ZERO, VoxelState::solid(2)), (IVec3::X, VoxelState::solid(2))], IVec3::ZERO).unwrap().body;
        // Quarter turn about +Y maps local +X onto world -Z
        rig.bridge.set_state(
            body,
            BodySnapshot::at_rest(BodyTransform::new(
                Vec3::new(1.0, 0.5, 0.5),
                glam::Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            )),
        );
        let hit = rig
            .manager
            .raycast(&rig.bridge, body, Vec3::new(1.0, 0.5, -3.0), Vec3::Z, 5.0)
            .unwrap();
        assert_eq!(hit.local, IVec3::X);
    }

    #[test]
    fn test_place_toward_negative_shifts_frame() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(1, 2), IVec3::ZERO).unwrap().body;
        let before = rig.manager.get(body).unwrap().origin_offset();

        let (manager, mut env) = rig.split();
        let placed = manager
            .place_on_face(&mut env, body, IVec3::ZERO, Face::West, StructureBlockData::from(VoxelState::solid(2)))
            .unwrap();
        assert_eq!(placed, Some(IVec3::ZERO));
        let s = manager.get(body).unwrap();
        assert!(s.contains(IVec3::X));
        assert_eq!(s.origin_offset(), before - Vec3::X);
        let region = rig.shipyard.region_for_body(body).unwrap();
        assert_eq!(region.size, IVec3::new(2, 1, 1));
        assert_eq!(rig.shadow.get_voxel(region.to_world(IVec3::ZERO)), Some(VoxelState::solid(2)));
        assert_eq!(rig.shadow.get_voxel(region.to_world(IVec3::X)), Some(VoxelState::solid(2)));

        let (manager, mut env) = rig.split();
        assert_eq!(
            manager
                .place_on_face(&mut env, body, IVec3::X, Face::West, StructureBlockData::from(VoxelState::solid(2)))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_shadow_update_marks_dirty_only_on_collidability_change() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(2, 2), IVec3::ZERO).unwrap().body;
        let manager = &mut rig.manager;

        assert!(!manager
            .apply_shadow_update(&mut rig.bridge, &rig.materials, body, IVec3::ZERO, Some(VoxelState::solid(5)))
            .unwrap());
        assert!(manager.get(body).unwrap().material_summary().levitation_accel > 0.0);
        assert!(manager
            .apply_shadow_update(&mut rig.bridge, &rig.materials, body, IVec3::ONE, Some(VoxelState::decorative(2)))
            .unwrap());
        assert!(matches!(
            manager.apply_shadow_update(&mut rig.bridge, &rig.materials, BodyId(999), IVec3::ZERO, None),
            Err(PhysicsError::UnknownBody(_))
        ));
    }

    #[test]
    fn test_identical_shadow_write_is_ignored() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(2, 2), IVec3::ZERO).unwrap().body;
        let material_calls = |rig: &Rig| {
            rig.bridge
                .count(|c| matches!(c, BridgeCall::SetMaterial { body: b, .. } if *b == body))
        };
        let before = material_calls(&rig);

        let same = Some(VoxelState::solid(2));
        let stale = rig
            .manager
            .apply_shadow_update(&mut rig.bridge, &rig.materials, body, IVec3::ZERO, same)
            .unwrap();
        assert!(!stale);
        assert!(!rig.manager.get(body).unwrap().is_dirty());
        assert_eq!(material_calls(&rig), before);

        rig.tick();
        assert!(!rig.manager.is_rebuilding(body));
    }

    #[test]
    fn test_raycast_ignores_positions_beyond_key_range() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(1, 2), IVec3::ZERO).unwrap().body;
        let structure = rig.manager.get(body).unwrap();
        let aliased = IVec3::new(1 << 21, 0, 0);
        assert!(!structure.contains(aliased));

        let mut seen = 0u32;
        let hit = traverse(Vec3::new(0.5, 0.5, 2.5), Vec3::X, f32::INFINITY, |p| {
            seen += 1;
            structure.contains(p)
        });
        assert!(hit.is_none());
        assert_eq!(seen, 0);

        let (manager, mut env) = rig.split();
        let err = manager.place_on_face(
            &mut env,
            body,
            IVec3::new(VoxelKey::MAX_COORD, 0, 0),
            Face::East,
            StructureBlockData::from(VoxelState::solid(2)),
        );
        assert!(matches!(err, Err(PhysicsError::OutOfRange(_))));
        assert_eq!(manager.get(body).unwrap().len(), 1);
    }

    #[test]
    fn test_levitation_force() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(1, 5), IVec3::ZERO).unwrap().body;
        rig.tick();
        let lift = MaterialKind::Levitating.profile();
        assert!(rig.bridge.calls().contains(&BridgeCall::ApplyForce {
            body,
            force: Vec3::new(0.0, lift.density * lift.levitation_accel, 0.0),
        }));
        assert!(rig.bridge.calls().contains(&BridgeCall::Activate(body)));
    }

    #[test]
    fn test_spawn_from_world_is_async() {
        let mut rig = Rig::new();
        rig.world
            .fill(IVec3::new(4, 10, 4), IVec3::new(5, 11, 5), &VoxelState::solid(2));
        let positions: Vec<IVec3> = VoxelBox::new(IVec3::new(4, 10, 4), IVec3::new(6, 12, 6))
            .cells()
            .collect();
        let job = rig
            .manager
            .spawn_from_world(&mut rig.world, &mut rig.ambient, OWNER, &positions)
            .unwrap();
        assert_eq!(rig.world.voxel_count(), 0);
        assert_eq!(rig.manager.pending_builds(), 1);

        let reports = rig.tick_until(|r| r.manager.pending_builds() == 0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job, job);
        let outcome = reports[0].result.as_ref().unwrap();
        assert_eq!(outcome.block_count, 8);
        assert_eq!(rig.manager.get(outcome.body).unwrap().origin(), IVec3::new(4, 10, 4));

        assert!(matches!(
            rig.manager
                .spawn_from_world(&mut rig.world, &mut rig.ambient, OWNER, &positions),
            Err(PhysicsError::EmptyGeometry)
        ));
    }

    #[test]
    fn test_restore_binds_existing_region() {
        let mut rig = Rig::new();
        let body = rig.construct(&cube(2, 2), IVec3::ZERO).unwrap().body;
        rig.manager.shutdown();
        rig.shipyard.unbind_all();
        assert!(rig.shipyard.region_for_owner(OWNER).is_some());

        rig.manager = StructureManager::new(&PhysicsConfig::default()).unwrap();
        let at = Vec3::new(0.0, 20.0, 0.0);
        rig.manager
            .restore_from_shadow(&rig.shadow, &rig.shipyard, OWNER, DimensionId::OVERWORLD, at)
            .unwrap();
        let reports = rig.tick_until(|r| r.manager.pending_builds() == 0);
        let restored = reports[0].result.as_ref().unwrap().body;
        assert_ne!(restored, body);
        assert_eq!(rig.manager.get(restored).unwrap().len(), 8);
        assert_eq!(rig.shipyard.region_for_body(restored).unwrap().owner, OWNER);
        assert!(rig.bridge.calls().iter().any(|c| matches!(
            c,
            BridgeCall::CreateRigid { body, position, .. } if *body == restored && *position == at
        )));
    }

    #[test]
    fn test_shutdown_refuses_construction() {
        let mut rig = Rig::new();
        rig.manager.shutdown();
        assert!(matches!(
            rig.construct(&cube(1, 2), IVec3::ZERO),
            Err(PhysicsError::ShuttingDown)
        ));
    }
}
