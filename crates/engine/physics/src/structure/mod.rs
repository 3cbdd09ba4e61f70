//! Dynamic voxel structures
//!
//! A [`PhysicsStructure`] keeps its voxels in an integer local frame. The body
//! frame differs from it by `origin_offset`: a local point `p` sits at
//! `p + origin_offset` in body space, and therefore at
//! `rotation * (p + origin_offset) + position` in the world.

mod manager;
mod raycast;

pub use manager::{
    BrokenVoxel, BuildOutcome, BuildReport, MiningProgress, Placement, ShadowMode, StructureEnv,
    StructureHit, StructureManager, StructureSeed,
};
pub use raycast::{traverse, GridHit};

use crate::bridge::{BodyId, BodyTransform};
use crate::collision::{Aabb, VoxelBox};
use crate::error::{PhysicsError, Result};
use crate::material::{AppearanceId, MaterialAggregator, MaterialSummary, MaterialTable};
use crate::voxel::{DimensionId, OwnerId, VoxelKey};
use crate::world::VoxelState;
use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Content of one structure voxel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureBlockData {
    pub appearance: AppearanceId,
    pub attached: Option<Vec<u8>>,
    pub collidable: bool,
}

impl StructureBlockData {
    pub fn to_state(&self) -> VoxelState {
        VoxelState {
            appearance: self.appearance,
            attached: self.attached.clone(),
            collidable: self.collidable,
        }
    }
}

impl From<VoxelState> for StructureBlockData {
    fn from(state: VoxelState) -> Self {
        Self {
            appearance: state.appearance,
            attached: state.attached,
            collidable: state.collidable,
        }
    }
}

/// Volume-weighted centroid of a box set
pub fn box_centroid(boxes: &[VoxelBox]) -> Vec3 {
    let (weighted, total) = boxes.iter().fold((Vec3::ZERO, 0.0_f32), |(acc, vol), b| {
        let v = b.volume() as f32;
        (acc + b.to_aabb().center() * v, vol + v)
    });
    if total > 0.0 {
        weighted / total
    } else {
        Vec3::ZERO
    }
}

/// One physically simulated voxel structure
#[derive(Debug, Clone)]
pub struct PhysicsStructure {
    dimension: DimensionId,
    owner: OwnerId,
    body: BodyId,
    origin: IVec3,
    origin_offset: Vec3,
    voxels: HashMap<VoxelKey, StructureBlockData>,
    collidable_keys: HashSet<VoxelKey>,
    material: MaterialAggregator,
    dirty: bool,
    rebuild_running: bool,
}

fn local_key(local: IVec3) -> Result<VoxelKey> {
    VoxelKey::try_pack(local).ok_or(PhysicsError::OutOfRange(local))
}

impl PhysicsStructure {
    /// Fails with [`PhysicsError::OutOfRange`] if a local position does not fit a key
    pub fn new(
        dimension: DimensionId,
        owner: OwnerId,
        body: BodyId,
        origin: IVec3,
        origin_offset: Vec3,
        voxels: HashMap<IVec3, StructureBlockData>,
        materials: &MaterialTable,
    ) -> Result<Self> {
        let voxels = voxels
            .into_iter()
            .map(|(p, d)| Ok((local_key(p)?, d)))
            .collect::<Result<HashMap<_, _>>>()?;
        let material = MaterialAggregator::from_profiles(
            voxels.values().map(|d| materials.profile_for(d.appearance)),
        );
        let collidable_keys = voxels
            .iter()
            .filter(|(_, d)| d.collidable)
            .map(|(k, _)| *k)
            .collect();
        Ok(Self {
            dimension,
            owner,
            body,
            origin,
            origin_offset,
            voxels,
            collidable_keys,
            material,
            dirty: false,
            rebuild_running: false,
        })
    }

    pub fn dimension(&self) -> DimensionId {
        self.dimension
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn body(&self) -> BodyId {
        self.body
    }

    /// World position of local `(0, 0, 0)` when the structure was created
    pub fn origin(&self) -> IVec3 {
        self.origin
    }

    pub fn origin_offset(&self) -> Vec3 {
        self.origin_offset
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn collidable_count(&self) -> usize {
        self.collidable_keys.len()
    }

    pub fn get(&self, local: IVec3) -> Option<&StructureBlockData> {
        self.voxels.get(&VoxelKey::try_pack(local)?)
    }

    pub fn contains(&self, local: IVec3) -> bool {
        self.get(local).is_some()
    }

    /// Every voxel with its local position
    pub fn voxels(&self) -> impl Iterator<Item = (IVec3, &StructureBlockData)> {
        self.voxels.iter().map(|(k, d)| (k.unpack(), d))
    }

    /// Collidable positions, sorted, for a rebuild pass
    pub fn collidable_snapshot(&self) -> Vec<IVec3> {
        let mut keys: Vec<VoxelKey> = self.collidable_keys.iter().copied().collect();
        keys.sort_unstable();
        keys.into_iter().map(VoxelKey::unpack).collect()
    }

    /// Insert or replace a voxel
    ///
    /// Marks the structure dirty when the collidable set changes.
    pub fn put(
        &mut self,
        local: IVec3,
        data: StructureBlockData,
        materials: &MaterialTable,
    ) -> Result<Option<StructureBlockData>> {
        let key = local_key(local)?;
        self.material.add(&materials.profile_for(data.appearance));
        let collidable = data.collidable;
        let old = self.voxels.insert(key, data);
        if let Some(old) = &old {
            self.material.remove(&materials.profile_for(old.appearance));
        }
        let changed = if collidable {
            self.collidable_keys.insert(key)
        } else {
            self.collidable_keys.remove(&key)
        };
        if changed {
            self.dirty = true;
        }
        Ok(old)
    }

    pub fn remove(&mut self, local: IVec3, materials: &MaterialTable) -> Option<StructureBlockData> {
        let key = VoxelKey::try_pack(local)?;
        let old = self.voxels.remove(&key)?;
        self.material.remove(&materials.profile_for(old.appearance));
        if self.collidable_keys.remove(&key) {
            self.dirty = true;
        }
        Some(old)
    }

    /// Re-key every voxel by `shift`, keeping world geometry unchanged
    ///
    /// Leaves the structure untouched if any shifted position would not fit a key.
    pub fn shift_local(&mut self, shift: IVec3) -> Result<()> {
        if shift == IVec3::ZERO {
            return Ok(());
        }
        if let Some((lo, hi)) = self.local_bounds() {
            for corner in [lo + shift, hi + shift] {
                local_key(corner)?;
            }
        }
        self.voxels = self
            .voxels
            .drain()
            .map(|(k, d)| (VoxelKey::pack(k.unpack() + shift), d))
            .collect();
        self.collidable_keys = self
            .collidable_keys
            .drain()
            .map(|k| VoxelKey::pack(k.unpack() + shift))
            .collect();
        self.origin -= shift;
        self.origin_offset -= shift.as_vec3();
        Ok(())
    }

    /// Inclusive local bounds of all voxels
    pub fn local_bounds(&self) -> Option<(IVec3, IVec3)> {
        let mut it = self.voxels.keys().map(|k| k.unpack());
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p))))
    }

    /// Local point to world space
    pub fn local_to_world(&self, transform: &BodyTransform, local: Vec3) -> Vec3 {
        transform.rotation * (local + self.origin_offset) + transform.position
    }

    /// World-space center of a local voxel
    pub fn voxel_center_world(&self, transform: &BodyTransform, local: IVec3) -> Vec3 {
        self.local_to_world(transform, local.as_vec3() + Vec3::splat(0.5))
    }

    /// World ray to the local, unrotated voxel frame
    pub fn world_ray_to_local(&self, transform: &BodyTransform, origin: Vec3, dir: Vec3) -> (Vec3, Vec3) {
        let inverse = transform.rotation.inverse();
        (
            inverse * (origin - transform.position) - self.origin_offset,
            inverse * dir,
        )
    }

    /// Optimizer boxes in body space
    pub fn body_local_boxes(&self, boxes: &[VoxelBox]) -> Vec<Aabb> {
        to_body_space(boxes, self.origin_offset)
    }

    pub fn material_summary(&self) -> MaterialSummary {
        self.material.snapshot()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_rebuild_running(&self) -> bool {
        self.rebuild_running
    }

    /// Claim a rebuild: clears `dirty` and sets `rebuild_running`
    ///
    /// # Returns
    /// The collidable snapshot, or `None` if no rebuild is due
    pub(crate) fn begin_rebuild(&mut self) -> Option<Vec<IVec3>> {
        if !self.dirty || self.rebuild_running {
            return None;
        }
        self.dirty = false;
        self.rebuild_running = true;
        Some(self.collidable_snapshot())
    }

    pub(crate) fn finish_rebuild(&mut self) {
        self.rebuild_running = false;
    }
}

/// Offset local boxes into body space
pub(crate) fn to_body_space(boxes: &[VoxelBox], origin_offset: Vec3) -> Vec<Aabb> {
    boxes
        .iter()
        .map(|b| b.to_aabb().translated(origin_offset))
        .collect()
}
