//! Collision primitives
//!
//! Axis-aligned boxes in glam types, the integer voxel boxes produced by the
//! optimizer, and the OBB → AABB envelope used by the collider cache.

use glam::{IVec3, Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-Aligned Bounding Box using glam types
///
/// Represents a box aligned to the world coordinate axes. All corners are axis-aligned,
/// making intersection tests simple min/max comparisons.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner of the bounding box
    pub min: Vec3,
    /// Maximum corner of the bounding box
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max corners
    ///
    /// # Arguments
    /// * `min` - Minimum corner (smallest x, y, z values)
    /// * `max` - Maximum corner (largest x, y, z values)
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from a center point and half-extents
    pub fn from_center(center: Vec3, half: Vec3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// The unit cell of the voxel at `pos`
    pub fn voxel(pos: IVec3) -> Self {
        let min = pos.as_vec3();
        Self {
            min,
            max: min + Vec3::ONE,
        }
    }

    /// Degenerate box substituted when a body would otherwise have no geometry
    pub fn epsilon() -> Self {
        Self::from_center(Vec3::ZERO, Vec3::splat(0.01))
    }

    /// Envelope of this box after rotating it about the origin and translating it
    ///
    /// The center is rotated and translated; the half-extents are projected onto
    /// the world axes through the absolute rotation matrix. For rotations that
    /// are multiples of 90° the result is the exact rotated box.
    ///
    /// # Arguments
    /// * `position` - World translation applied after rotation
    /// * `rotation` - Orientation of the local frame
    pub fn to_world(&self, position: Vec3, rotation: Quat) -> Self {
        let center = position + rotation * self.center();
        let m = Mat3::from_quat(rotation);
        let abs = Mat3::from_cols(m.x_axis.abs(), m.y_axis.abs(), m.z_axis.abs());
        let half = abs * self.half_size();
        Self::from_center(center, half)
    }

    /// Shift the box by `offset`
    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Grow the box by `amount` on every side
    pub fn inflated(&self, amount: f32) -> Self {
        Self {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    /// Test intersection with another AABB
    ///
    /// # Returns
    /// `true` if the AABBs overlap (including touching at edges/faces)
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Compute intersection volume (returns None if no overlap)
    pub fn intersection(&self, other: &Aabb) -> Option<Aabb> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);

        if min.x < max.x && min.y < max.y && min.z < max.z {
            Some(Aabb { min, max })
        } else {
            None
        }
    }

    /// Calculate the center point of the AABB
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Calculate the size (extents) of the AABB
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Calculate the half-size (half-extents) of the AABB
    pub fn half_size(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn volume(&self) -> f32 {
        let size = self.size();
        size.x * size.y * size.z
    }

    /// Check if a point is inside the AABB
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Expand the AABB to include a point
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Create an AABB that encompasses both AABBs
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Slab test against a ray
    ///
    /// # Returns
    /// Entry distance along `dir` if the ray hits within `max_dist`. A ray
    /// starting inside the box reports 0.
    pub fn ray_hit(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<f32> {
        let mut t_min = 0.0f32;
        let mut t_max = max_dist;
        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            let lo = self.min[axis];
            let hi = self.max[axis];
            if d.abs() < 1e-8 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (lo - o) * inv;
            let mut t1 = (hi - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }
        Some(t_min)
    }

    /// Flat `[min.x, min.y, min.z, max.x, max.y, max.z]` form used at the bridge boundary
    pub fn to_array(&self) -> [f32; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    pub fn from_array(v: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(v[0], v[1], v[2]),
            max: Vec3::new(v[3], v[4], v[5]),
        }
    }
}

/// Integer box produced by the optimizer; `max` is exclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelBox {
    pub min: IVec3,
    pub max: IVec3,
}

impl VoxelBox {
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Box covering exactly one voxel
    pub fn single(pos: IVec3) -> Self {
        Self {
            min: pos,
            max: pos + IVec3::ONE,
        }
    }

    pub fn size(&self) -> IVec3 {
        self.max - self.min
    }

    pub fn volume(&self) -> i64 {
        let s = self.size();
        s.x as i64 * s.y as i64 * s.z as i64
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        pos.cmpge(self.min).all() && pos.cmplt(self.max).all()
    }

    pub fn overlaps(&self, other: &VoxelBox) -> bool {
        self.min.cmplt(other.max).all() && other.min.cmplt(self.max).all()
    }

    /// Every voxel covered by this box
    pub fn cells(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (min, max) = (self.min, self.max);
        (min.x..max.x).flat_map(move |x| {
            (min.y..max.y).flat_map(move |y| (min.z..max.z).map(move |z| IVec3::new(x, y, z)))
        })
    }

    /// Float box in the same frame
    pub fn to_aabb(&self) -> Aabb {
        Aabb::new(self.min.as_vec3(), self.max.as_vec3())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn assert_vec_close(a: Vec3, b: Vec3) {
        assert!((a - b).abs().max_element() < 1e-4, "{:?} != {:?}", a, b);
    }

    #[test]
    fn test_to_world_identity() {
        let local = Aabb::new(Vec3::new(-1.0, -2.0, -3.0), Vec3::new(1.0, 2.0, 3.0));
        let world = local.to_world(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY);
        assert_vec_close(world.min, Vec3::new(9.0, -2.0, -3.0));
        assert_vec_close(world.max, Vec3::new(11.0, 2.0, 3.0));
    }

    #[test]
    fn test_to_world_quarter_turn_swaps_axes() {
        let local = Aabb::new(Vec3::new(-1.0, -2.0, -3.0), Vec3::new(1.0, 2.0, 3.0));
        let world = local.to_world(Vec3::ZERO, Quat::from_rotation_y(FRAC_PI_2));
        // 2 x 4 x 6 becomes 6 x 4 x 2
        assert_vec_close(world.size(), Vec3::new(6.0, 4.0, 2.0));
        assert!((world.volume() - local.volume()).abs() < 1e-3);
    }

    #[test]
    fn test_to_world_off_center_box_rotates_center() {
        let local = Aabb::new(Vec3::new(2.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0));
        let world = local.to_world(Vec3::ZERO, Quat::from_rotation_z(FRAC_PI_2));
        assert_vec_close(world.center(), Vec3::new(-0.5, 3.0, 0.5));
        assert_vec_close(world.size(), Vec3::new(1.0, 2.0, 1.0));
    }

    #[test]
    fn test_to_world_diagonal_grows() {
        let local = Aabb::from_center(Vec3::ZERO, Vec3::splat(0.5));
        let world = local.to_world(Vec3::ZERO, Quat::from_rotation_y(FRAC_PI_2 / 2.0));
        assert!(world.size().x > 1.4);
        assert!((world.size().y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_aabb_intersects() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let c = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_ray_hit() {
        let b = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let t = b.ray_hit(Vec3::new(-2.0, 0.5, 0.5), Vec3::X, 10.0);
        assert_eq!(t, Some(2.0));
        assert!(b.ray_hit(Vec3::new(-2.0, 0.5, 0.5), Vec3::NEG_X, 10.0).is_none());
        assert!(b.ray_hit(Vec3::new(-2.0, 0.5, 0.5), Vec3::X, 1.5).is_none());
        assert_eq!(b.ray_hit(Vec3::splat(0.5), Vec3::Y, 1.0), Some(0.0));
    }

    #[test]
    fn test_voxel_box_cells() {
        let b = VoxelBox::new(IVec3::new(0, 0, 0), IVec3::new(2, 1, 3));
        assert_eq!(b.volume(), 6);
        assert_eq!(b.cells().count(), 6);
        assert!(b.cells().all(|c| b.contains(c)));
        assert!(!b.contains(IVec3::new(2, 0, 0)));
    }

    #[test]
    fn test_voxel_box_overlap_is_exclusive() {
        let a = VoxelBox::new(IVec3::ZERO, IVec3::splat(2));
        let touching = VoxelBox::new(IVec3::new(2, 0, 0), IVec3::new(3, 2, 2));
        let inside = VoxelBox::single(IVec3::ONE);
        assert!(!a.overlaps(&touching));
        assert!(a.overlaps(&inside));
    }
}
