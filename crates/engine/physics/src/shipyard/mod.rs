//! Shadow space for structure content
//!
//! Every structure owner gets one axis-aligned region in a separate,
//! non-simulated world. Regions are packed left to right in rows at a fixed
//! elevation, separated by padding, and their chunks stay force-loaded so
//! voxel logic keeps running while the structure moves around as a body.
//!
//! Mirroring writes are silent. Anything the shadow world records afterwards
//! was caused by something else and comes back from [`Shipyard::tick`] as
//! feedback for the owning structure.

mod storage;

pub use storage::{FileRegionStore, MemoryRegionStore, RegionRecord, RegionStore};

use crate::bridge::BodyId;
use crate::collision::VoxelBox;
use crate::config::ShipyardConfig;
use crate::error::{PhysicsError, Result};
use crate::voxel::{ChunkPos, OwnerId};
use crate::world::{VoxelState, VoxelWorld, WriteFlags};
use glam::IVec3;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Region owned by one structure owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipyardRegion {
    pub owner: OwnerId,
    /// Body currently mirrored here, if any
    pub body: Option<BodyId>,
    /// World position of local `(0, 0, 0)`
    pub origin: IVec3,
    pub size: IVec3,
}

impl ShipyardRegion {
    /// Inclusive maximum corner
    pub fn max(&self) -> IVec3 {
        self.origin + self.size - IVec3::ONE
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        pos.cmpge(self.origin).all() && pos.cmple(self.max()).all()
    }

    pub fn contains_local(&self, local: IVec3) -> bool {
        local.cmpge(IVec3::ZERO).all() && local.cmplt(self.size).all()
    }

    pub fn to_local(&self, pos: IVec3) -> IVec3 {
        pos - self.origin
    }

    pub fn to_world(&self, local: IVec3) -> IVec3 {
        self.origin + local
    }

    /// Chunk columns the region touches
    pub fn chunks(&self) -> Vec<ChunkPos> {
        let (lo, hi) = self.chunk_span();
        (lo.x..=hi.x)
            .flat_map(|x| (lo.z..=hi.z).map(move |z| ChunkPos::new(x, z)))
            .collect()
    }

    pub fn covers_chunk(&self, chunk: ChunkPos) -> bool {
        let (lo, hi) = self.chunk_span();
        (lo.x..=hi.x).contains(&chunk.x) && (lo.z..=hi.z).contains(&chunk.z)
    }

    fn chunk_span(&self) -> (ChunkPos, ChunkPos) {
        (
            ChunkPos::containing(self.origin),
            ChunkPos::containing(self.max()),
        )
    }

    fn local_box(&self) -> VoxelBox {
        VoxelBox::new(IVec3::ZERO, self.size)
    }

    pub fn record(&self) -> RegionRecord {
        RegionRecord {
            owner: self.owner,
            origin: self.origin,
            size: self.size,
        }
    }
}

/// Region grown by [`Shipyard::expand_region`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionResult {
    /// Added to every local key already placed
    pub shift: IVec3,
    pub region: ShipyardRegion,
}

/// Externally caused change inside a region
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowFeedback {
    pub owner: OwnerId,
    pub body: Option<BodyId>,
    pub local: IVec3,
    pub state: Option<VoxelState>,
}

#[derive(Debug)]
struct NeighborJob {
    owner: OwnerId,
    locals: Vec<IVec3>,
    cursor: usize,
}

/// Region allocator and mirror
pub struct Shipyard {
    config: ShipyardConfig,
    regions: HashMap<OwnerId, ShipyardRegion>,
    by_body: HashMap<BodyId, OwnerId>,
    pending: VecDeque<NeighborJob>,
    next_x: i32,
    next_z: i32,
    row_depth: i32,
    store: Option<Box<dyn RegionStore>>,
}

impl Shipyard {
    /// Empty shipyard without persistence
    pub fn new(config: ShipyardConfig) -> Self {
        Self {
            config,
            regions: HashMap::new(),
            by_body: HashMap::new(),
            pending: VecDeque::new(),
            next_x: 0,
            next_z: 0,
            row_depth: 0,
            store: None,
        }
    }

    /// Load persisted regions and continue packing past them
    pub fn with_store(config: ShipyardConfig, store: Box<dyn RegionStore>) -> Result<Self> {
        let records = store.load()?;
        let mut shipyard = Self::new(config);
        for record in &records {
            shipyard.next_z = shipyard
                .next_z
                .max(record.origin.z + record.size.z + config.padding);
            shipyard.regions.insert(
                record.owner,
                ShipyardRegion {
                    owner: record.owner,
                    body: None,
                    origin: record.origin,
                    size: record.size,
                },
            );
        }
        shipyard.store = Some(store);
        info!("Loaded {} shadow regions", records.len());
        Ok(shipyard)
    }

    fn allocate(&mut self, size: IVec3) -> IVec3 {
        let pad = self.config.padding;
        let padded_x = size.x + 2 * pad;
        let padded_z = size.z + 2 * pad;
        if self.next_x > 0 && self.next_x + padded_x > self.config.max_row_width {
            self.next_x = 0;
            self.next_z += self.row_depth;
            self.row_depth = 0;
        }
        let origin = IVec3::new(self.next_x + pad, self.config.base_y, self.next_z + pad);
        self.next_x += padded_x;
        self.row_depth = self.row_depth.max(padded_z);
        origin
    }

    fn force(&self, shadow: &mut dyn VoxelWorld, region: &ShipyardRegion) -> Result<()> {
        let chunks = region.chunks();
        for (i, chunk) in chunks.iter().enumerate() {
            if !shadow.set_chunk_forced(*chunk, true) {
                self.release_chunks(shadow, &chunks[..i]);
                return Err(PhysicsError::ShadowPlacementFailure(format!(
                    "could not force-load chunk {:?}",
                    chunk
                )));
            }
        }
        Ok(())
    }

    /// Unforce chunks no remaining region covers
    fn release_chunks(&self, shadow: &mut dyn VoxelWorld, chunks: &[ChunkPos]) {
        for chunk in chunks {
            if !self.regions.values().any(|r| r.covers_chunk(*chunk)) {
                shadow.set_chunk_forced(*chunk, false);
            }
        }
    }

    fn attach(&mut self, owner: OwnerId, body: BodyId) {
        let Some(region) = self.regions.get_mut(&owner) else {
            return;
        };
        if let Some(previous) = region.body.replace(body) {
            self.by_body.remove(&previous);
        }
        self.by_body.insert(body, owner);
    }

    /// Region of `size` for `owner`
    ///
    /// An existing region of the same size is reused; one of a different size
    /// is torn down first.
    pub fn ensure_region(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        owner: OwnerId,
        body: Option<BodyId>,
        size: IVec3,
    ) -> Result<ShipyardRegion> {
        let size = size.max(IVec3::ONE);
        if let Some(existing) = self.regions.get(&owner).cloned() {
            if existing.size == size {
                self.force(shadow, &existing)?;
                if let Some(body) = body {
                    self.attach(owner, body);
                }
                return self.region_for_owner(owner).cloned().ok_or_else(|| {
                    PhysicsError::ShadowPlacementFailure(format!("region of {} vanished", owner))
                });
            }
            self.remove_region_for_owner(shadow, owner);
        }

        let cursor = (self.next_x, self.next_z, self.row_depth);
        let origin = self.allocate(size);
        let region = ShipyardRegion {
            owner,
            body,
            origin,
            size,
        };
        if let Err(err) = self.force(shadow, &region) {
            (self.next_x, self.next_z, self.row_depth) = cursor;
            warn!("Shadow region for {} not placed: {}", owner, err);
            return Err(err);
        }
        if let Some(body) = body {
            self.by_body.insert(body, owner);
        }
        self.regions.insert(owner, region.clone());
        self.persist();
        debug!(
            "Allocated shadow region for {} at {:?} size {:?}",
            owner, origin, size
        );
        Ok(region)
    }

    /// Grow `owner`'s region until it covers the local position `local`
    ///
    /// The grown region is placed in a fresh slot and existing content is
    /// moved with it. Returns `None` when `local` is already inside.
    pub fn expand_region(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        owner: OwnerId,
        local: IVec3,
    ) -> Result<Option<ExpansionResult>> {
        let Some(old) = self.regions.get(&owner).cloned() else {
            return Err(PhysicsError::ShadowPlacementFailure(format!(
                "no shadow region for {}",
                owner
            )));
        };
        if old.contains_local(local) {
            return Ok(None);
        }

        let low = local.min(IVec3::ZERO);
        let high = (old.size - IVec3::ONE).max(local);
        let shift = -low;
        let size = high - low + IVec3::ONE;

        let cursor = (self.next_x, self.next_z, self.row_depth);
        let region = ShipyardRegion {
            owner,
            body: old.body,
            origin: self.allocate(size),
            size,
        };
        if let Err(err) = self.force(shadow, &region) {
            (self.next_x, self.next_z, self.row_depth) = cursor;
            return Err(err);
        }

        for cell in old.local_box().cells() {
            let from = old.to_world(cell);
            if let Some(state) = shadow.get_voxel(from) {
                shadow.clear_voxel(from, WriteFlags::SILENT);
                shadow.set_voxel(region.to_world(cell + shift), state, WriteFlags::SILENT);
            }
        }
        for job in self.pending.iter_mut().filter(|j| j.owner == owner) {
            for l in &mut job.locals {
                *l += shift;
            }
        }

        self.regions.insert(owner, region.clone());
        self.release_chunks(shadow, &old.chunks());
        self.persist();
        info!(
            "Expanded shadow region of {} to {:?} at {:?} (shift {:?})",
            owner, size, region.origin, shift
        );
        Ok(Some(ExpansionResult { shift, region }))
    }

    /// Write content into `owner`'s region without side effects
    ///
    /// # Returns
    /// Number of voxels written; positions outside the region are skipped
    pub fn place_blocks<I>(&mut self, shadow: &mut dyn VoxelWorld, owner: OwnerId, blocks: I) -> Result<usize>
    where
        I: IntoIterator<Item = (IVec3, VoxelState)>,
    {
        let region = self.regions.get(&owner).ok_or_else(|| {
            PhysicsError::ShadowPlacementFailure(format!("no shadow region for {}", owner))
        })?;
        let mut written = 0;
        for (local, state) in blocks {
            if !region.contains_local(local) {
                debug!("Skipping {:?} outside region of {}", local, owner);
                continue;
            }
            shadow.set_voxel(region.to_world(local), state, WriteFlags::SILENT);
            written += 1;
        }
        Ok(written)
    }

    /// Queue neighbor updates for local positions, drained by [`Shipyard::tick`]
    pub fn queue_neighbor_updates(&mut self, owner: OwnerId, locals: Vec<IVec3>) {
        if locals.is_empty() {
            return;
        }
        if let Some(job) = self.pending.iter_mut().find(|j| j.owner == owner) {
            job.locals.extend(locals);
        } else {
            self.pending.push_back(NeighborJob {
                owner,
                locals,
                cursor: 0,
            });
        }
    }

    /// Collect external changes, then drain queued neighbor updates within budget
    pub fn tick(&mut self, shadow: &mut dyn VoxelWorld) -> Vec<ShadowFeedback> {
        let mut feedback = Vec::new();
        for change in shadow.drain_changes() {
            if let Some(region) = self.find_region(change.pos) {
                feedback.push(ShadowFeedback {
                    owner: region.owner,
                    body: region.body,
                    local: region.to_local(change.pos),
                    state: change.state,
                });
            }
        }

        let mut budget = self.config.updates_per_tick;
        while budget > 0 {
            let Some(job) = self.pending.front_mut() else {
                break;
            };
            let Some(region) = self.regions.get(&job.owner) else {
                self.pending.pop_front();
                continue;
            };
            while budget > 0 && job.cursor < job.locals.len() {
                shadow.update_neighbors(region.to_world(job.locals[job.cursor]));
                job.cursor += 1;
                budget -= 1;
            }
            let done = job.cursor >= job.locals.len();
            if done {
                self.pending.pop_front();
            }
        }
        feedback
    }

    /// Attach `body` to an existing region and force its chunks again
    pub fn bind_body(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        owner: OwnerId,
        body: BodyId,
    ) -> Result<()> {
        let region = self.regions.get(&owner).cloned().ok_or_else(|| {
            PhysicsError::ShadowPlacementFailure(format!("no shadow region for {}", owner))
        })?;
        self.force(shadow, &region)?;
        self.attach(owner, body);
        Ok(())
    }

    /// Content of `owner`'s region keyed by local position
    pub fn read_region(
        &self,
        shadow: &dyn VoxelWorld,
        owner: OwnerId,
    ) -> Result<HashMap<IVec3, VoxelState>> {
        let region = self.regions.get(&owner).ok_or_else(|| {
            PhysicsError::ShadowPlacementFailure(format!("no shadow region for {}", owner))
        })?;
        if let Some(chunk) = region.chunks().into_iter().find(|c| !shadow.is_chunk_loaded(*c)) {
            return Err(PhysicsError::RegionNotLoaded(chunk));
        }
        Ok(region
            .local_box()
            .cells()
            .filter_map(|l| shadow.get_voxel(region.to_world(l)).map(|s| (l, s)))
            .collect())
    }

    /// Tear down `owner`'s region: clear its content, release chunks and forget it
    pub fn remove_region_for_owner(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        owner: OwnerId,
    ) -> Option<ShipyardRegion> {
        let region = self.regions.remove(&owner)?;
        if let Some(body) = region.body {
            self.by_body.remove(&body);
        }
        for cell in region.local_box().cells() {
            shadow.clear_voxel(region.to_world(cell), WriteFlags::SILENT);
        }
        self.pending.retain(|j| j.owner != owner);
        self.release_chunks(shadow, &region.chunks());
        self.persist();
        debug!("Removed shadow region of {}", owner);
        Some(region)
    }

    pub fn remove_region_for_body(
        &mut self,
        shadow: &mut dyn VoxelWorld,
        body: BodyId,
    ) -> Option<ShipyardRegion> {
        let owner = *self.by_body.get(&body)?;
        self.remove_region_for_owner(shadow, owner)
    }

    pub fn region_for_owner(&self, owner: OwnerId) -> Option<&ShipyardRegion> {
        self.regions.get(&owner)
    }

    pub fn region_for_body(&self, body: BodyId) -> Option<&ShipyardRegion> {
        self.by_body.get(&body).and_then(|o| self.regions.get(o))
    }

    /// Region containing a shadow-world position
    pub fn find_region(&self, pos: IVec3) -> Option<&ShipyardRegion> {
        self.regions.values().find(|r| r.contains(pos))
    }

    pub fn regions(&self) -> impl Iterator<Item = &ShipyardRegion> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Neighbor updates still queued
    pub fn pending_updates(&self) -> usize {
        self.pending
            .iter()
            .map(|j| j.locals.len() - j.cursor)
            .sum()
    }

    /// Forget body bindings; regions stay allocated and persisted
    pub fn unbind_all(&mut self) {
        for region in self.regions.values_mut() {
            region.body = None;
        }
        self.by_body.clear();
        self.pending.clear();
    }

    fn persist(&mut self) {
        let mut records: Vec<RegionRecord> = self.regions.values().map(|r| r.record()).collect();
        records.sort_by_key(|r| r.owner);
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.save(&records) {
                warn!("Failed to persist shadow regions: {}", err);
            }
        }
    }
}
