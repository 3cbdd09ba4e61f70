//! Greedy voxel box merging
//!
//! Compresses a set of unit voxels into axis-aligned boxes. Seeds are visited
//! in lexicographic `(x, y, z)` order; from each uncovered seed the box grows
//! along X, then Y over the whole X span, then Z over the whole X×Y face,
//! claiming only cells that are set and not yet covered.

use crate::collision::VoxelBox;
use glam::IVec3;
use std::collections::HashSet;

/// Merge a voxel set into non-overlapping boxes whose union is exactly the input
///
/// Empty input yields an empty list. The result is deterministic for a given set
/// regardless of the order the voxels are supplied in.
pub fn optimize<I>(voxels: I) -> Vec<VoxelBox>
where
    I: IntoIterator<Item = IVec3>,
{
    let mut seeds: Vec<IVec3> = voxels.into_iter().collect();
    if seeds.is_empty() {
        return Vec::new();
    }
    seeds.sort_unstable_by_key(|v| (v.x, v.y, v.z));
    seeds.dedup();

    let mut open: HashSet<IVec3> = seeds.iter().copied().collect();
    let mut boxes = Vec::new();

    for seed in seeds {
        if !open.contains(&seed) {
            continue;
        }
        let b = grow(seed, &open);
        for cell in b.cells() {
            open.remove(&cell);
        }
        boxes.push(b);
    }

    boxes
}

fn grow(seed: IVec3, open: &HashSet<IVec3>) -> VoxelBox {
    let mut max = seed + IVec3::ONE;

    while open.contains(&IVec3::new(max.x, seed.y, seed.z)) {
        max.x += 1;
    }

    while (seed.x..max.x).all(|x| open.contains(&IVec3::new(x, max.y, seed.z))) {
        max.y += 1;
    }

    while (seed.x..max.x)
        .all(|x| (seed.y..max.y).all(|y| open.contains(&IVec3::new(x, y, max.z))))
    {
        max.z += 1;
    }

    VoxelBox::new(seed, max)
}

/// Number of unit voxels covered by a box list
pub fn covered_volume(boxes: &[VoxelBox]) -> i64 {
    boxes.iter().map(VoxelBox::volume).sum()
}
