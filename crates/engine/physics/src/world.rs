//! Voxel world collaborator
//!
//! The schedulers, structure manager and shipyard only see the world through
//! [`VoxelWorld`]. [`GridWorld`] is the in-memory implementation used by the
//! tests and the testbed.

use crate::material::AppearanceId;
use crate::voxel::{ChunkPos, DimensionId, SECTION_HEIGHT};
use glam::IVec3;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// Content of one occupied voxel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelState {
    pub appearance: AppearanceId,
    /// Opaque state of attached voxel logic
    pub attached: Option<Vec<u8>>,
    /// `false` for content that occupies space but has no collision geometry
    pub collidable: bool,
}

impl VoxelState {
    /// Solid voxel without attached state
    pub fn solid(appearance: AppearanceId) -> Self {
        Self {
            appearance,
            attached: None,
            collidable: true,
        }
    }

    /// Non-collidable content
    pub fn decorative(appearance: AppearanceId) -> Self {
        Self {
            appearance,
            attached: None,
            collidable: false,
        }
    }

    pub fn with_attached(mut self, blob: Vec<u8>) -> Self {
        self.attached = Some(blob);
        self
    }
}

/// Side effects of a world write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFlags {
    /// Propagate a neighbor update from the written voxel
    pub notify_neighbors: bool,
    /// Report the write through [`VoxelWorld::drain_changes`]
    pub record_change: bool,
}

impl WriteFlags {
    /// Ordinary gameplay write
    pub const DEFAULT: WriteFlags = WriteFlags {
        notify_neighbors: true,
        record_change: true,
    };

    /// Write made by this subsystem; produces no feedback
    pub const SILENT: WriteFlags = WriteFlags {
        notify_neighbors: false,
        record_change: false,
    };
}

impl Default for WriteFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A recorded external write; `state == None` means the voxel was cleared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelChange {
    pub pos: IVec3,
    pub state: Option<VoxelState>,
}

/// World/terrain collaborator
pub trait VoxelWorld {
    fn dimension(&self) -> DimensionId;

    /// Monotonic tick counter
    fn game_time(&self) -> u64;

    fn is_chunk_loaded(&self, chunk: ChunkPos) -> bool;

    /// Lowest buildable y
    fn min_y(&self) -> i32;

    /// Highest buildable y, inclusive
    fn max_y(&self) -> i32;

    /// `true` if the 16-high section starting at `section_min_y` holds nothing
    fn is_section_empty(&self, _chunk: ChunkPos, _section_min_y: i32) -> bool {
        false
    }

    /// Content at `pos`, or `None` for empty space
    fn get_voxel(&self, pos: IVec3) -> Option<VoxelState>;

    fn set_voxel(&mut self, pos: IVec3, state: VoxelState, flags: WriteFlags);

    fn clear_voxel(&mut self, pos: IVec3, flags: WriteFlags);

    /// Keep a chunk loaded regardless of player presence
    ///
    /// # Returns
    /// `false` if the chunk could not be forced
    fn set_chunk_forced(&mut self, chunk: ChunkPos, forced: bool) -> bool;

    /// Deliver a neighbor update originating at `pos`
    fn update_neighbors(&mut self, pos: IVec3);

    /// Take every change recorded since the last call
    fn drain_changes(&mut self) -> Vec<VoxelChange>;
}

/// In-memory voxel world
#[derive(Debug, Clone)]
pub struct GridWorld {
    dimension: DimensionId,
    min_y: i32,
    max_y: i32,
    game_time: u64,
    voxels: HashMap<IVec3, VoxelState>,
    section_counts: HashMap<(ChunkPos, i32), u32>,
    loaded: HashSet<ChunkPos>,
    forced: HashSet<ChunkPos>,
    all_loaded: bool,
    refuse_forcing: bool,
    changes: Vec<VoxelChange>,
    neighbor_updates: Vec<IVec3>,
}

impl GridWorld {
    /// Create an empty world spanning `min_y..=max_y` with every chunk loaded
    pub fn new(dimension: DimensionId, min_y: i32, max_y: i32) -> Self {
        Self {
            dimension,
            min_y,
            max_y,
            game_time: 0,
            voxels: HashMap::new(),
            section_counts: HashMap::new(),
            loaded: HashSet::new(),
            forced: HashSet::new(),
            all_loaded: true,
            refuse_forcing: false,
            changes: Vec::new(),
            neighbor_updates: Vec::new(),
        }
    }

    /// Only explicitly loaded (or forced) chunks count as loaded from now on
    pub fn with_explicit_loading(mut self) -> Self {
        self.all_loaded = false;
        self
    }

    pub fn load_chunk(&mut self, chunk: ChunkPos) {
        self.loaded.insert(chunk);
    }

    pub fn unload_chunk(&mut self, chunk: ChunkPos) {
        self.loaded.remove(&chunk);
    }

    /// Make every following `set_chunk_forced(_, true)` fail
    pub fn refuse_forcing(&mut self, refuse: bool) {
        self.refuse_forcing = refuse;
    }

    pub fn advance(&mut self, ticks: u64) {
        self.game_time += ticks;
    }

    /// Fill the inclusive box `min..=max` without recording changes
    pub fn fill(&mut self, min: IVec3, max: IVec3, state: &VoxelState) {
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    self.put(IVec3::new(x, y, z), Some(state.clone()));
                }
            }
        }
    }

    pub fn voxel_count(&self) -> usize {
        self.voxels.len()
    }

    /// Occupied positions inside the inclusive box `min..=max`
    pub fn count_in(&self, min: IVec3, max: IVec3) -> usize {
        self.voxels
            .keys()
            .filter(|p| p.cmpge(min).all() && p.cmple(max).all())
            .count()
    }

    pub fn forced_chunks(&self) -> &HashSet<ChunkPos> {
        &self.forced
    }

    /// Neighbor updates delivered so far
    pub fn neighbor_updates(&self) -> &[IVec3] {
        &self.neighbor_updates
    }

    fn section_key(pos: IVec3) -> (ChunkPos, i32) {
        (ChunkPos::containing(pos), pos.y.div_euclid(SECTION_HEIGHT))
    }

    fn put(&mut self, pos: IVec3, state: Option<VoxelState>) {
        let key = Self::section_key(pos);
        match state {
            Some(s) => {
                if self.voxels.insert(pos, s).is_none() {
                    *self.section_counts.entry(key).or_default() += 1;
                }
            }
            None => {
                if self.voxels.remove(&pos).is_none() {
                    return;
                }
                if let Entry::Occupied(mut e) = self.section_counts.entry(key) {
                    *e.get_mut() -= 1;
                    if *e.get() == 0 {
                        e.remove();
                    }
                }
            }
        }
    }

    fn write(&mut self, pos: IVec3, state: Option<VoxelState>, flags: WriteFlags) {
        if flags.record_change {
            self.changes.push(VoxelChange {
                pos,
                state: state.clone(),
            });
        }
        self.put(pos, state);
        if flags.notify_neighbors {
            self.update_neighbors(pos);
        }
    }
}

impl VoxelWorld for GridWorld {
    fn dimension(&self) -> DimensionId {
        self.dimension
    }

    fn game_time(&self) -> u64 {
        self.game_time
    }

    fn is_chunk_loaded(&self, chunk: ChunkPos) -> bool {
        self.all_loaded || self.loaded.contains(&chunk) || self.forced.contains(&chunk)
    }

    fn min_y(&self) -> i32 {
        self.min_y
    }

    fn max_y(&self) -> i32 {
        self.max_y
    }

    fn is_section_empty(&self, chunk: ChunkPos, section_min_y: i32) -> bool {
        let key = (chunk, section_min_y.div_euclid(SECTION_HEIGHT));
        !self.section_counts.contains_key(&key)
    }

    fn get_voxel(&self, pos: IVec3) -> Option<VoxelState> {
        self.voxels.get(&pos).cloned()
    }

    fn set_voxel(&mut self, pos: IVec3, state: VoxelState, flags: WriteFlags) {
        self.write(pos, Some(state), flags);
    }

    fn clear_voxel(&mut self, pos: IVec3, flags: WriteFlags) {
        if self.voxels.contains_key(&pos) {
            self.write(pos, None, flags);
        }
    }

    fn set_chunk_forced(&mut self, chunk: ChunkPos, forced: bool) -> bool {
        if forced {
            if self.refuse_forcing {
                return false;
            }
            self.forced.insert(chunk);
        } else {
            self.forced.remove(&chunk);
        }
        true
    }

    fn update_neighbors(&mut self, pos: IVec3) {
        self.neighbor_updates.push(pos);
    }

    fn drain_changes(&mut self) -> Vec<VoxelChange> {
        std::mem::take(&mut self.changes)
    }
}
