//! Voxel grid traversal
//!
//! Steps from voxel to voxel along a ray, always crossing the nearest voxel
//! boundary next, until a solid voxel is found or the reach runs out.

use crate::voxel::Face;
use glam::{IVec3, Vec3};

/// Longest ray the traversal walks; also bounds the origin's distance from zero
pub const MAX_REACH: f32 = (1 << 22) as f32;

/// First solid voxel along a ray
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridHit {
    pub voxel: IVec3,
    /// Face the ray entered through; `None` when the ray starts inside the voxel
    pub face: Option<Face>,
    /// Distance along the normalized direction at which the voxel was entered
    pub distance: f32,
}

/// Walk the grid from `origin` along `dir` up to `reach`
///
/// Ties between axes are broken x first, then y, then z. A non-finite
/// `reach` misses; a finite one is cut at [`MAX_REACH`].
pub fn traverse<F>(origin: Vec3, dir: Vec3, reach: f32, mut is_solid: F) -> Option<GridHit>
where
    F: FnMut(IVec3) -> bool,
{
    let dir = dir.try_normalize()?;
    if !(reach >= 0.0) || !reach.is_finite() || !origin.is_finite() {
        return None;
    }
    if origin.abs().max_element() > MAX_REACH {
        return None;
    }
    let reach = reach.min(MAX_REACH);

    let mut voxel = origin.floor().as_ivec3();
    if is_solid(voxel) {
        return Some(GridHit {
            voxel,
            face: None,
            distance: 0.0,
        });
    }

    let step = IVec3::new(axis_step(dir.x), axis_step(dir.y), axis_step(dir.z));
    let mut t_max = Vec3::new(
        first_crossing(origin.x, dir.x, voxel.x),
        first_crossing(origin.y, dir.y, voxel.y),
        first_crossing(origin.z, dir.z, voxel.z),
    );
    let t_delta = Vec3::new(
        crossing_interval(dir.x),
        crossing_interval(dir.y),
        crossing_interval(dir.z),
    );

    loop {
        let (axis, t) = if t_max.x <= t_max.y && t_max.x <= t_max.z {
            (0, t_max.x)
        } else if t_max.y <= t_max.z {
            (1, t_max.y)
        } else {
            (2, t_max.z)
        };
        if !t.is_finite() || t > reach {
            return None;
        }

        voxel[axis] += step[axis];
        t_max[axis] += t_delta[axis];

        if is_solid(voxel) {
            return Some(GridHit {
                voxel,
                face: Some(entry_face(axis, step[axis])),
                distance: t,
            });
        }
    }
}

fn axis_step(d: f32) -> i32 {
    if d > 0.0 {
        1
    } else if d < 0.0 {
        -1
    } else {
        0
    }
}

fn first_crossing(o: f32, d: f32, cell: i32) -> f32 {
    if d > 0.0 {
        (cell as f32 + 1.0 - o) / d
    } else if d < 0.0 {
        (o - cell as f32) / -d
    } else {
        f32::INFINITY
    }
}

fn crossing_interval(d: f32) -> f32 {
    if d == 0.0 {
        f32::INFINITY
    } else {
        1.0 / d.abs()
    }
}

fn entry_face(axis: usize, step: i32) -> Face {
    match (axis, step > 0) {
        (0, true) => Face::West,
        (0, false) => Face::East,
        (1, true) => Face::Down,
        (1, false) => Face::Up,
        (_, true) => Face::North,
        (_, false) => Face::South,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn solid(cells: &[IVec3]) -> impl FnMut(IVec3) -> bool {
        let set: HashSet<IVec3> = cells.iter().copied().collect();
        move |p| set.contains(&p)
    }

    #[test]
    fn test_hit_along_z() {
        let hit = traverse(
            Vec3::new(0.5, 0.5, -2.0),
            Vec3::Z,
            5.0,
            solid(&[IVec3::ZERO]),
        )
        .unwrap();
        assert_eq!(hit.voxel, IVec3::ZERO);
        assert_eq!(hit.face, Some(Face::North));
        assert!((hit.distance - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_negative_direction_faces() {
        let hit = traverse(
            Vec3::new(3.5, 0.5, 0.5),
            Vec3::NEG_X,
            5.0,
            solid(&[IVec3::ZERO]),
        )
        .unwrap();
        assert_eq!(hit.face, Some(Face::East));

        let hit = traverse(
            Vec3::new(0.5, 4.5, 0.5),
            Vec3::NEG_Y,
            5.0,
            solid(&[IVec3::ZERO]),
        )
        .unwrap();
        assert_eq!(hit.face, Some(Face::Up));
        assert!((hit.distance - 3.5).abs() < 1e-5);
    }

    #[test]
    fn test_reach_limits_search() {
        let origin = Vec3::new(0.5, 0.5, -6.0);
        assert!(traverse(origin, Vec3::Z, 5.0, solid(&[IVec3::ZERO])).is_none());
        assert!(traverse(origin, Vec3::Z, 6.0, solid(&[IVec3::ZERO])).is_some());
    }

    #[test]
    fn test_start_inside_voxel() {
        let hit = traverse(Vec3::splat(0.5), Vec3::X, 5.0, solid(&[IVec3::ZERO])).unwrap();
        assert_eq!(hit.face, None);
        assert_eq!(hit.distance, 0.0);
    }

    #[test]
    fn test_diagonal_visits_first_solid() {
        let cells = [IVec3::new(2, 2, 0), IVec3::new(3, 3, 0)];
        let hit = traverse(
            Vec3::new(0.2, 0.5, 0.5),
            Vec3::new(1.0, 1.0, 0.0),
            10.0,
            solid(&cells),
        )
        .unwrap();
        assert_eq!(hit.voxel, IVec3::new(2, 2, 0));
    }

    #[test]
    fn test_unbounded_reach_misses() {
        assert!(traverse(Vec3::splat(0.5), Vec3::X, f32::INFINITY, |_| false).is_none());
        assert!(traverse(Vec3::splat(0.5), Vec3::X, f32::NAN, |_| false).is_none());
        let far = IVec3::new(100, 0, 0);
        assert!(traverse(Vec3::splat(0.5), Vec3::X, f32::INFINITY, solid(&[far])).is_none());
    }

    #[test]
    fn test_huge_reach_is_cut() {
        let hit = traverse(Vec3::new(-3.5, 0.5, 0.5), Vec3::X, f32::MAX, solid(&[IVec3::ZERO]));
        assert_eq!(hit.map(|h| h.voxel), Some(IVec3::ZERO));

        let beyond = IVec3::new(MAX_REACH as i32 + 8, 0, 0);
        assert!(traverse(Vec3::splat(0.5), Vec3::X, f32::MAX, |p| p == beyond).is_none());
        assert!(traverse(Vec3::splat(MAX_REACH * 2.0), Vec3::X, 5.0, |_| true).is_none());
    }

    #[test]
    fn test_zero_direction_misses() {
        assert!(traverse(Vec3::splat(0.5), Vec3::ZERO, 5.0, |_| true).is_none());
    }
}
