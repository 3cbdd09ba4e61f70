//! Voxel coordinates, packed keys and chunk columns
//!
//! Voxel positions are plain `IVec3`s. Hash-map keys pack the three signed
//! components into a single `u64` (21 bits per axis, two's complement), which
//! covers every coordinate in `-2^20..2^20`.

use glam::IVec3;
use serde::{Deserialize, Serialize};

const AXIS_BITS: u32 = 21;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const SIGN_SHIFT: u32 = 64 - AXIS_BITS;

/// Edge length of a chunk column in voxels
pub const CHUNK_SIZE: i32 = 16;

/// Height of a chunk section in voxels
pub const SECTION_HEIGHT: i32 = 16;

/// Packed integer triple used as a hash-map key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelKey(pub u64);

impl VoxelKey {
    /// Smallest packable coordinate on any axis
    pub const MIN_COORD: i32 = -(1 << (AXIS_BITS - 1));
    /// Largest packable coordinate on any axis
    pub const MAX_COORD: i32 = (1 << (AXIS_BITS - 1)) - 1;

    /// Whether every component of `pos` fits in a key
    pub fn in_range(pos: IVec3) -> bool {
        pos.cmpge(IVec3::splat(Self::MIN_COORD)).all()
            && pos.cmple(IVec3::splat(Self::MAX_COORD)).all()
    }

    /// Pack a voxel position, or `None` if it would alias another key
    pub fn try_pack(pos: IVec3) -> Option<Self> {
        Self::in_range(pos).then(|| Self::pack(pos))
    }

    /// Pack a voxel position
    ///
    /// Components outside `MIN_COORD..=MAX_COORD` wrap; use
    /// [`VoxelKey::try_pack`] for positions that are not known to fit.
    pub fn pack(pos: IVec3) -> Self {
        let x = (pos.x as i64 as u64) & AXIS_MASK;
        let y = (pos.y as i64 as u64) & AXIS_MASK;
        let z = (pos.z as i64 as u64) & AXIS_MASK;
        Self((x << (2 * AXIS_BITS)) | (y << AXIS_BITS) | z)
    }

    /// Unpack back into a voxel position
    pub fn unpack(self) -> IVec3 {
        IVec3::new(
            sign_extend(self.0 >> (2 * AXIS_BITS)),
            sign_extend(self.0 >> AXIS_BITS),
            sign_extend(self.0),
        )
    }
}

impl From<IVec3> for VoxelKey {
    fn from(pos: IVec3) -> Self {
        Self::pack(pos)
    }
}

fn sign_extend(bits: u64) -> i32 {
    (((bits & AXIS_MASK) << SIGN_SHIFT) as i64 >> SIGN_SHIFT) as i32
}

/// Logical world / region identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionId(pub u32);

impl DimensionId {
    pub const OVERWORLD: DimensionId = DimensionId(0);
    pub const SHIPYARD: DimensionId = DimensionId(u32::MAX);
}

/// Identity of the actor (player, command source) that owns a build or shadow region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// A 16-wide column of voxels spanning the whole world height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk column containing a voxel
    pub fn containing(pos: IVec3) -> Self {
        Self {
            x: pos.x >> 4,
            z: pos.z >> 4,
        }
    }

    /// Chunk column containing a world-space coordinate
    pub fn containing_point(x: f32, z: f32) -> Self {
        Self {
            x: (x.floor() as i32) >> 4,
            z: (z.floor() as i32) >> 4,
        }
    }

    pub fn min_block_x(&self) -> i32 {
        self.x * CHUNK_SIZE
    }

    pub fn min_block_z(&self) -> i32 {
        self.z * CHUNK_SIZE
    }

    pub fn max_block_x(&self) -> i32 {
        self.min_block_x() + CHUNK_SIZE - 1
    }

    pub fn max_block_z(&self) -> i32 {
        self.min_block_z() + CHUNK_SIZE - 1
    }
}

/// One of the six axis directions of a voxel face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    Down,
    Up,
    North,
    South,
    West,
    East,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::Down,
        Face::Up,
        Face::North,
        Face::South,
        Face::West,
        Face::East,
    ];

    /// Unit step pointing out of the face
    pub fn offset(self) -> IVec3 {
        match self {
            Face::Down => IVec3::NEG_Y,
            Face::Up => IVec3::Y,
            Face::North => IVec3::NEG_Z,
            Face::South => IVec3::Z,
            Face::West => IVec3::NEG_X,
            Face::East => IVec3::X,
        }
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::Down => Face::Up,
            Face::Up => Face::Down,
            Face::North => Face::South,
            Face::South => Face::North,
            Face::West => Face::East,
            Face::East => Face::West,
        }
    }

    /// Neighbor of `pos` across this face
    pub fn relative(self, pos: IVec3) -> IVec3 {
        pos + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip_signed() {
        let samples = [
            IVec3::ZERO,
            IVec3::new(-1, -1, -1),
            IVec3::new(1_048_575, -1_048_576, 12),
            IVec3::new(-30, 64, 4100),
        ];
        for pos in samples {
            assert_eq!(VoxelKey::pack(pos).unpack(), pos, "roundtrip for {:?}", pos);
        }
    }

    #[test]
    fn test_try_pack_rejects_aliasing_positions() {
        let limit = IVec3::new(VoxelKey::MAX_COORD, VoxelKey::MIN_COORD, 0);
        assert_eq!(VoxelKey::try_pack(limit).map(VoxelKey::unpack), Some(limit));
        assert_eq!(VoxelKey::try_pack(IVec3::new(1 << 21, 0, 0)), None);
        assert_eq!(VoxelKey::try_pack(IVec3::new(0, VoxelKey::MAX_COORD + 1, 0)), None);
        assert_eq!(VoxelKey::try_pack(IVec3::new(0, 0, VoxelKey::MIN_COORD - 1)), None);
        assert_eq!(VoxelKey::try_pack(IVec3::ZERO), Some(VoxelKey(0)));
    }

    #[test]
    fn test_keys_distinct_for_neighbors() {
        let base = IVec3::new(3, -2, 7);
        let keys: std::collections::HashSet<_> = Face::ALL
            .iter()
            .map(|f| VoxelKey::pack(f.relative(base)))
            .collect();
        assert_eq!(keys.len(), 6);
        assert!(!keys.contains(&VoxelKey::pack(base)));
    }

    #[test]
    fn test_chunk_containing_negative() {
        assert_eq!(ChunkPos::containing(IVec3::new(-1, 0, 15)), ChunkPos::new(-1, 0));
        assert_eq!(ChunkPos::containing(IVec3::new(16, 0, -17)), ChunkPos::new(1, -2));
        assert_eq!(ChunkPos::new(-1, 2).min_block_x(), -16);
        assert_eq!(ChunkPos::new(-1, 2).max_block_z(), 47);
    }

    #[test]
    fn test_face_opposites() {
        for face in Face::ALL {
            assert_eq!(face.opposite().opposite(), face);
            assert_eq!(face.offset() + face.opposite().offset(), IVec3::ZERO);
        }
    }
}
