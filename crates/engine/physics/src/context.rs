//! Physics context
//!
//! [`PhysicsContext`] owns every piece of state of one simulation: the bridge,
//! the collider cache, the structures, both schedulers and the shipyard.
//! Independent contexts share nothing, so several simulations can run side by
//! side in one process.

use crate::bridge::{verify_layout, BodyId, BodySnapshot, BodyState, PhysicsBridge};
use crate::collider_cache::ColliderCache;
use crate::config::PhysicsConfig;
use crate::error::{PhysicsError, Result};
use crate::material::MaterialTable;
use crate::scheduler::{AmbientScheduler, Selection, SelectionScheduler};
use crate::shipyard::{RegionStore, Shipyard};
use crate::structure::{
    BrokenVoxel, BuildReport, MiningProgress, PhysicsStructure, StructureBlockData, StructureEnv,
    StructureManager,
};
use crate::voxel::{ChunkPos, DimensionId, Face, OwnerId};
use crate::worker::JobId;
use crate::world::VoxelWorld;
use glam::{IVec3, Vec3};
use std::collections::HashMap;
use std::sync::{LockResult, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Anything bound to a physics body
pub trait HasBodyId {
    fn body_id(&self) -> BodyId;
}

/// Entity whose transform follows a physics body
pub trait UpdatableFromPhysics: HasBodyId + Send {
    /// Dead entities are dropped on the next step
    fn is_alive(&self) -> bool;

    fn update_from_physics(&mut self, snapshot: &BodySnapshot);
}

pub struct PhysicsContext {
    config: PhysicsConfig,
    materials: MaterialTable,
    bridge: Option<Box<dyn PhysicsBridge>>,
    colliders: Mutex<ColliderCache>,
    structures: Mutex<StructureManager>,
    ambient: AmbientScheduler,
    selections: SelectionScheduler,
    shipyard: Shipyard,
    trackers: Vec<Box<dyn UpdatableFromPhysics>>,
    states: Vec<BodyState>,
    accepting: bool,
}

fn unpoison<T>(result: LockResult<T>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl PhysicsContext {
    /// Context without a native engine; every request is refused up front
    pub fn new(config: PhysicsConfig) -> Result<Self> {
        config.validate()?;
        let materials = config.material_table()?;
        Ok(Self {
            colliders: Mutex::new(ColliderCache::new()),
            structures: Mutex::new(StructureManager::new(&config)?),
            ambient: AmbientScheduler::new(&config)?,
            selections: SelectionScheduler::new(&config)?,
            shipyard: Shipyard::new(config.shipyard),
            materials,
            bridge: None,
            trackers: Vec::new(),
            states: Vec::new(),
            accepting: true,
            config,
        })
    }

    /// Context driving `bridge`
    ///
    /// # Errors
    /// `LayoutMismatch` if the bridge writes body records in another layout
    pub fn with_bridge(config: PhysicsConfig, mut bridge: Box<dyn PhysicsBridge>) -> Result<Self> {
        verify_layout(bridge.native_layout())?;
        bridge.set_gravity(config.gravity());
        let mut ctx = Self::new(config)?;
        ctx.bridge = Some(bridge);
        info!("Physics context ready");
        Ok(ctx)
    }

    /// Replace the shipyard with one persisted in `store`
    pub fn with_region_store(mut self, store: Box<dyn RegionStore>) -> Result<Self> {
        self.shipyard = Shipyard::with_store(self.config.shipyard, store)?;
        Ok(self)
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn materials(&self) -> &MaterialTable {
        &self.materials
    }

    pub fn is_bridge_available(&self) -> bool {
        self.bridge.is_some()
    }

    pub fn bridge(&self) -> Option<&dyn PhysicsBridge> {
        self.bridge.as_deref()
    }

    pub fn colliders(&self) -> MutexGuard<'_, ColliderCache> {
        unpoison(self.colliders.lock())
    }

    pub fn structures(&self) -> MutexGuard<'_, StructureManager> {
        unpoison(self.structures.lock())
    }

    pub fn ambient(&self) -> &AmbientScheduler {
        &self.ambient
    }

    pub fn selections(&self) -> &SelectionScheduler {
        &self.selections
    }

    pub fn shipyard(&self) -> &Shipyard {
        &self.shipyard
    }

    /// Advance the native simulation and push body state to tracked entities
    pub fn step(&mut self, dt: f32) {
        let Some(bridge) = self.bridge.as_deref_mut() else {
            return;
        };
        bridge.step(dt);

        self.trackers.retain(|t| t.is_alive());
        if self.trackers.is_empty() {
            return;
        }
        self.states.clear();
        bridge.sync_all_bodies(&mut self.states);
        let by_body: HashMap<BodyId, &BodyState> =
            self.states.iter().map(|s| (s.body(), s)).collect();
        for tracker in &mut self.trackers {
            if let Some(state) = by_body.get(&tracker.body_id()) {
                tracker.update_from_physics(&state.snapshot());
            }
        }
    }

    /// One simulation tick for `world`'s dimension
    ///
    /// Refreshes the collider cache, advances the ambient and selection scans
    /// and the structures, in that order.
    pub fn tick_dimension(
        &mut self,
        world: &mut dyn VoxelWorld,
        shadow: &mut dyn VoxelWorld,
    ) -> Vec<BuildReport> {
        let Some(bridge) = self.bridge.as_deref_mut() else {
            return Vec::new();
        };
        let colliders = unpoison(self.colliders.get_mut());
        let structures = unpoison(self.structures.get_mut());
        let dimension = world.dimension();

        colliders.refresh_from_bridge(dimension, world.game_time(), &*bridge);
        self.ambient.tick(&*world, &mut *bridge, colliders);

        let materials = &self.materials;
        let shipyard = &mut self.shipyard;
        self.selections
            .tick(&mut *world, &mut self.ambient, |captured| {
                let mut env = StructureEnv {
                    bridge: &mut *bridge,
                    colliders: &mut *colliders,
                    shipyard: &mut *shipyard,
                    shadow: &mut *shadow,
                    materials,
                };
                structures.finalize_selection(&mut env, captured)
            });

        let mut env = StructureEnv {
            bridge,
            colliders,
            shipyard,
            shadow,
            materials,
        };
        structures.tick(&mut env, &*world, &mut self.ambient)
    }

    /// Drain queued shadow neighbor updates and feed external shadow writes
    /// back to their structures
    ///
    /// # Returns
    /// Number of structures whose collision geometry became stale
    pub fn tick_shipyard(&mut self, shadow: &mut dyn VoxelWorld) -> usize {
        let feedback = self.shipyard.tick(shadow);
        let Some(bridge) = self.bridge.as_deref_mut() else {
            return 0;
        };
        let structures = unpoison(self.structures.get_mut());
        let mut stale = 0;
        for record in feedback {
            let Some(body) = record.body else {
                continue;
            };
            match structures.apply_shadow_update(
                &mut *bridge,
                &self.materials,
                body,
                record.local,
                record.state,
            ) {
                Ok(true) => stale += 1,
                Ok(false) => {}
                Err(err) => debug!("Shadow feedback for {} dropped: {}", body, err),
            }
        }
        stale
    }

    /// Queue a selection build; the reason for a refusal is also queued as a notice
    pub fn request_selection(
        &mut self,
        owner: OwnerId,
        dimension: DimensionId,
        selection: Selection,
    ) -> Result<()> {
        let available = self.bridge.is_some();
        self.selections
            .request(owner, dimension, selection, available)
    }

    pub fn cancel_selection(&mut self, owner: OwnerId) -> bool {
        self.selections.cancel(owner)
    }

    /// Messages queued for `owner`
    pub fn drain_notices(&mut self, owner: OwnerId) -> Vec<String> {
        self.selections.drain_notices(owner)
    }

    pub fn on_chunk_load(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        if self.bridge.is_some() {
            self.ambient.on_chunk_load(world, chunk);
        }
    }

    pub fn on_chunk_unload(&mut self, dimension: DimensionId, chunk: ChunkPos) {
        if let Some(bridge) = self.bridge.as_deref_mut() {
            self.ambient.on_chunk_unload(dimension, chunk, bridge);
        }
    }

    /// Schedule a delayed ambient rebuild of `chunk`
    pub fn mark_chunk_dirty(&mut self, world: &dyn VoxelWorld, chunk: ChunkPos) {
        if self.bridge.is_some() {
            self.ambient.mark_chunk_dirty(world, chunk);
        }
    }

    /// Lift world voxels into a new structure; the outcome arrives in a later
    /// [`PhysicsContext::tick_dimension`] report
    pub fn spawn_from_world(
        &mut self,
        world: &mut dyn VoxelWorld,
        owner: OwnerId,
        positions: &[IVec3],
    ) -> Result<JobId> {
        self.ensure_available()?;
        unpoison(self.structures.get_mut()).spawn_from_world(
            world,
            &mut self.ambient,
            owner,
            positions,
        )
    }

    /// Recreate `owner`'s structure from its persisted shadow region
    pub fn restore_from_shadow(
        &mut self,
        shadow: &dyn VoxelWorld,
        owner: OwnerId,
        dimension: DimensionId,
        position: Vec3,
    ) -> Result<JobId> {
        self.ensure_available()?;
        unpoison(self.structures.get_mut()).restore_from_shadow(
            shadow,
            &self.shipyard,
            owner,
            dimension,
            position,
        )
    }

    pub fn break_voxel(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        body: BodyId,
        local: IVec3,
    ) -> Result<Option<BrokenVoxel>> {
        self.with_env(shadow, |structures, env| {
            structures.break_voxel(env, body, local)
        })
    }

    /// One mining hit by `actor` at game time `now`
    #[allow(clippy::too_many_arguments)]
    pub fn attack(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        actor: OwnerId,
        body: BodyId,
        eye: Vec3,
        look: Vec3,
        progress_delta: f32,
        now: u64,
    ) -> Result<MiningProgress> {
        self.with_env(shadow, |structures, env| {
            structures.attack(env, actor, body, eye, look, progress_delta, now)
        })
    }

    pub fn place_on_face(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        body: BodyId,
        target: IVec3,
        face: Face,
        data: StructureBlockData,
    ) -> Result<Option<IVec3>> {
        self.with_env(shadow, |structures, env| {
            structures.place_on_face(env, body, target, face, data)
        })
    }

    pub fn remove_structure(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        body: BodyId,
    ) -> Result<PhysicsStructure> {
        self.with_env(shadow, |structures, env| {
            structures.remove_structure(env, body)
        })
    }

    /// Follow `tracker`'s body from the next step on
    pub fn track(&mut self, tracker: Box<dyn UpdatableFromPhysics>) {
        self.trackers.push(tracker);
    }

    pub fn tracked_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Refuse new work, cancel in-flight jobs and stop every worker
    ///
    /// Shadow regions stay persisted so structures can be restored later.
    pub fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.selections.shutdown();
        self.ambient.shutdown();
        unpoison(self.structures.get_mut()).shutdown();
        self.shipyard.unbind_all();
        self.trackers.clear();
        info!("Physics context shut down");
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.accepting {
            return Err(PhysicsError::ShuttingDown);
        }
        if self.bridge.is_none() {
            return Err(PhysicsError::BridgeUnavailable);
        }
        Ok(())
    }

    fn with_env<R>(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        f: impl FnOnce(&mut StructureManager, &mut StructureEnv<'_>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_available()?;
        let bridge = self
            .bridge
            .as_deref_mut()
            .ok_or(PhysicsError::BridgeUnavailable)?;
        let mut env = StructureEnv {
            bridge,
            colliders: unpoison(self.colliders.get_mut()),
            shipyard: &mut self.shipyard,
            shadow,
            materials: &self.materials,
        };
        f(unpoison(self.structures.get_mut()), &mut env)
    }
}

impl Drop for PhysicsContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
