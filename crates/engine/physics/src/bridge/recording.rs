//! Bridge double that records every call
//!
//! Bodies keep whatever state the test sets; `step` integrates nothing. Used
//! by the unit and integration tests and by the testbed's dry-run mode.

use super::{
    BodyId, BodySnapshot, BodyState, BodyTransform, PhysicsBridge, BODY_FLAG_ACTIVE,
    BODY_FLAG_STATIC,
};
use crate::collision::Aabb;
use crate::material::MaterialSummary;
use glam::Vec3;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded bridge call
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    CreateRigid {
        body: BodyId,
        position: Vec3,
        boxes: Vec<Aabb>,
        mass: f32,
    },
    CreateStatic {
        body: BodyId,
        boxes: Vec<Aabb>,
    },
    Remove(BodyId),
    UpdateShape {
        body: BodyId,
        boxes: Vec<Aabb>,
    },
    ApplyForce {
        body: BodyId,
        force: Vec3,
    },
    Activate(BodyId),
    SetMaterial {
        body: BodyId,
        mass: f32,
    },
    SetGravity(Vec3),
    Step(f32),
}

#[derive(Debug, Clone)]
struct FakeBody {
    snapshot: BodySnapshot,
    boxes: Vec<Aabb>,
    fixed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<BridgeCall>,
    bodies: BTreeMap<BodyId, FakeBody>,
    next_id: u64,
    fail_creation: bool,
}

/// Recording bridge; clones share the same log and bodies
#[derive(Debug, Clone, Default)]
pub struct RecordingBridge {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following creation call return the invalid handle
    pub fn fail_creation(&self, fail: bool) {
        self.lock().fail_creation = fail;
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Calls matching a predicate
    pub fn count(&self, pred: impl Fn(&BridgeCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn live_bodies(&self) -> Vec<BodyId> {
        self.lock().bodies.keys().copied().collect()
    }

    /// Current boxes of a body
    pub fn boxes(&self, body: BodyId) -> Option<Vec<Aabb>> {
        self.lock().bodies.get(&body).map(|b| b.boxes.clone())
    }

    /// Overwrite the simulated state of a body
    pub fn set_state(&self, body: BodyId, snapshot: BodySnapshot) {
        if let Some(b) = self.lock().bodies.get_mut(&body) {
            b.snapshot = snapshot;
        }
    }

    fn create(&self, position: Vec3, boxes: &[Aabb], fixed: bool) -> BodyId {
        let mut inner = self.lock();
        if inner.fail_creation || boxes.is_empty() {
            return BodyId::INVALID;
        }
        inner.next_id += 1;
        let id = BodyId(inner.next_id);
        inner.bodies.insert(
            id,
            FakeBody {
                snapshot: BodySnapshot::at_rest(BodyTransform::from_position(position)),
                boxes: boxes.to_vec(),
                fixed,
            },
        );
        id
    }
}

impl PhysicsBridge for RecordingBridge {
    fn create_rigid_body(
        &mut self,
        position: Vec3,
        boxes: &[Aabb],
        material: &MaterialSummary,
    ) -> BodyId {
        let body = self.create(position, boxes, false);
        self.lock().calls.push(BridgeCall::CreateRigid {
            body,
            position,
            boxes: boxes.to_vec(),
            mass: material.body_mass(),
        });
        body
    }

    fn create_static_body(&mut self, boxes: &[Aabb]) -> BodyId {
        let body = self.create(Vec3::ZERO, boxes, true);
        self.lock().calls.push(BridgeCall::CreateStatic {
            body,
            boxes: boxes.to_vec(),
        });
        body
    }

    fn remove_body(&mut self, body: BodyId) {
        let mut inner = self.lock();
        inner.bodies.remove(&body);
        inner.calls.push(BridgeCall::Remove(body));
    }

    fn get_body_state(&self, body: BodyId) -> Option<BodySnapshot> {
        self.lock().bodies.get(&body).map(|b| b.snapshot)
    }

    fn update_body_shape(&mut self, body: BodyId, boxes: &[Aabb]) {
        let mut inner = self.lock();
        if let Some(b) = inner.bodies.get_mut(&body) {
            b.boxes = boxes.to_vec();
        }
        inner.calls.push(BridgeCall::UpdateShape {
            body,
            boxes: boxes.to_vec(),
        });
    }

    fn apply_force(&mut self, body: BodyId, force: Vec3) {
        self.lock().calls.push(BridgeCall::ApplyForce { body, force });
    }

    fn activate_body(&mut self, body: BodyId) {
        self.lock().calls.push(BridgeCall::Activate(body));
    }

    fn set_body_material(&mut self, body: BodyId, material: &MaterialSummary) {
        self.lock().calls.push(BridgeCall::SetMaterial {
            body,
            mass: material.body_mass(),
        });
    }

    fn set_gravity(&mut self, gravity: Vec3) {
        self.lock().calls.push(BridgeCall::SetGravity(gravity));
    }

    fn step(&mut self, dt: f32) {
        self.lock().calls.push(BridgeCall::Step(dt));
    }

    fn sync_all_bodies(&self, out: &mut Vec<BodyState>) {
        let inner = self.lock();
        for (id, b) in &inner.bodies {
            let flags = if b.fixed {
                BODY_FLAG_STATIC
            } else {
                BODY_FLAG_ACTIVE
            };
            out.push(BodyState::from_snapshot(*id, &b.snapshot, flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_shares_state() {
        let probe = RecordingBridge::new();
        let mut bridge = probe.clone();
        let id = bridge.create_rigid_body(
            Vec3::ONE,
            &[Aabb::epsilon()],
            &MaterialSummary::default(),
        );
        assert!(id.is_valid());
        assert_eq!(probe.live_bodies(), vec![id]);

        bridge.apply_force(id, Vec3::Y);
        assert_eq!(
            probe.count(|c| matches!(c, BridgeCall::ApplyForce { .. })),
            1
        );
        assert_eq!(
            probe.get_body_state(id).unwrap().transform.position,
            Vec3::ONE
        );
    }

    #[test]
    fn test_fail_creation() {
        let mut bridge = RecordingBridge::new();
        bridge.fail_creation(true);
        let id = bridge.create_static_body(&[Aabb::epsilon()]);
        assert_eq!(id, BodyId::INVALID);
        assert!(bridge.live_bodies().is_empty());
    }
}
