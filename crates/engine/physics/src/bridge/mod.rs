//! Contract to the native rigid-body engine
//!
//! Every call is synchronous and issued from the simulation thread. The bridge
//! performs no coordinate transforms: callers hand it body-local boxes and a
//! spawn position, and read back world-frame state.

#[cfg(feature = "rapier")]
pub mod rapier;
pub mod recording;

use crate::collision::Aabb;
use crate::error::{PhysicsError, Result};
use crate::material::MaterialSummary;
use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};
use std::mem::{align_of, offset_of, size_of};

#[cfg(feature = "rapier")]
pub use self::rapier::RapierBridge;
pub use recording::{BridgeCall, RecordingBridge};

/// Handle of a body inside the native engine; `0` is never a live body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BodyId(pub u64);

impl BodyId {
    pub const INVALID: BodyId = BodyId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for BodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "body#{}", self.0)
    }
}

/// Rigid transform of a body's center of mass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTransform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl BodyTransform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Default for BodyTransform {
    fn default() -> Self {
        Self::from_position(Vec3::ZERO)
    }
}

/// Full kinematic state read back from the engine
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodySnapshot {
    pub transform: BodyTransform,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl BodySnapshot {
    pub fn at_rest(transform: BodyTransform) -> Self {
        Self {
            transform,
            ..Default::default()
        }
    }

    /// World velocity of a point rigidly attached to the body
    pub fn velocity_at(&self, point: Vec3) -> Vec3 {
        self.linear_velocity + self.angular_velocity.cross(point - self.transform.position)
    }
}

/// Body is awake in the solver
pub const BODY_FLAG_ACTIVE: u32 = 1;
/// Body never moves
pub const BODY_FLAG_STATIC: u32 = 1 << 1;

/// Boundary record exchanged with the native engine, one per body
///
/// Layout is fixed: `u64` id followed by thirteen `f32` state values
/// (position, rotation xyzw, linear velocity, angular velocity) and a `u32`
/// flag word, 64 bytes with no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BodyState {
    pub id: u64,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub linear_velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub flags: u32,
}

const _: () = assert!(size_of::<BodyState>() == 64);
const _: () = assert!(align_of::<BodyState>() == 8);
const _: () = assert!(offset_of!(BodyState, position) == 8);
const _: () = assert!(offset_of!(BodyState, rotation) == 20);
const _: () = assert!(offset_of!(BodyState, linear_velocity) == 36);
const _: () = assert!(offset_of!(BodyState, angular_velocity) == 48);
const _: () = assert!(offset_of!(BodyState, flags) == 60);

impl BodyState {
    pub const LAYOUT: NativeLayout = NativeLayout {
        size: size_of::<BodyState>(),
        align: align_of::<BodyState>(),
        position_offset: offset_of!(BodyState, position),
        rotation_offset: offset_of!(BodyState, rotation),
        linear_velocity_offset: offset_of!(BodyState, linear_velocity),
        angular_velocity_offset: offset_of!(BodyState, angular_velocity),
        flags_offset: offset_of!(BodyState, flags),
    };

    pub fn from_snapshot(body: BodyId, snapshot: &BodySnapshot, flags: u32) -> Self {
        let t = &snapshot.transform;
        Self {
            id: body.0,
            position: t.position.to_array(),
            rotation: t.rotation.to_array(),
            linear_velocity: snapshot.linear_velocity.to_array(),
            angular_velocity: snapshot.angular_velocity.to_array(),
            flags,
        }
    }

    pub fn body(&self) -> BodyId {
        BodyId(self.id)
    }

    pub fn snapshot(&self) -> BodySnapshot {
        BodySnapshot {
            transform: BodyTransform {
                position: Vec3::from_array(self.position),
                rotation: Quat::from_array(self.rotation).normalize(),
            },
            linear_velocity: Vec3::from_array(self.linear_velocity),
            angular_velocity: Vec3::from_array(self.angular_velocity),
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags & BODY_FLAG_ACTIVE != 0
    }
}

/// Record layout as reported by the native side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeLayout {
    pub size: usize,
    pub align: usize,
    pub position_offset: usize,
    pub rotation_offset: usize,
    pub linear_velocity_offset: usize,
    pub angular_velocity_offset: usize,
    pub flags_offset: usize,
}

/// Refuse a native side whose record layout differs from [`BodyState`]
pub fn verify_layout(native: NativeLayout) -> Result<()> {
    let expected = BodyState::LAYOUT;
    if native != expected {
        return Err(PhysicsError::LayoutMismatch(format!(
            "expected {:?}, native reports {:?}",
            expected, native
        )));
    }
    Ok(())
}

/// Native rigid-body engine
///
/// Creation calls return [`BodyId::INVALID`] on failure. Calls naming an
/// unknown body are ignored.
pub trait PhysicsBridge: Send {
    /// Create a dynamic body at `position` from body-local boxes
    fn create_rigid_body(
        &mut self,
        position: Vec3,
        boxes: &[Aabb],
        material: &MaterialSummary,
    ) -> BodyId;

    /// Create a fixed body from world-space boxes
    fn create_static_body(&mut self, boxes: &[Aabb]) -> BodyId;

    fn remove_body(&mut self, body: BodyId);

    fn get_body_state(&self, body: BodyId) -> Option<BodySnapshot>;

    /// Replace every collider of a body with the given body-local boxes
    fn update_body_shape(&mut self, body: BodyId, boxes: &[Aabb]);

    /// World-frame force acting for the next step only
    fn apply_force(&mut self, body: BodyId, force: Vec3);

    /// Wake a sleeping body
    fn activate_body(&mut self, body: BodyId);

    fn set_body_material(&mut self, body: BodyId, material: &MaterialSummary);

    fn set_gravity(&mut self, gravity: Vec3);

    fn step(&mut self, dt: f32);

    /// Append one record per live body to `out`
    fn sync_all_bodies(&self, out: &mut Vec<BodyState>);

    /// Layout of the records this engine writes
    fn native_layout(&self) -> NativeLayout {
        BodyState::LAYOUT
    }
}
