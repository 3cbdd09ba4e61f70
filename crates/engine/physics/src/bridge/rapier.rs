use super::{
    BodyId, BodySnapshot, BodyState, BodyTransform, PhysicsBridge, BODY_FLAG_ACTIVE,
    BODY_FLAG_STATIC,
};
use crate::collision::Aabb;
use crate::material::MaterialSummary;
use glam::{Quat, Vec3};
use rapier3d::prelude::*;
use std::collections::HashMap;

/// Smallest half-extent handed to rapier for a box collider
const MIN_HALF_EXTENT: f32 = 1e-3;

#[derive(Debug, Clone, Copy)]
struct BodyEntry {
    handle: RigidBodyHandle,
    material: MaterialSummary,
    fixed: bool,
}

/// Bridge backed by an in-process rapier pipeline
///
/// Manages all rigid bodies, colliders and simulation state. Each body carries
/// one compound collider made of cuboids, one per box.
pub struct RapierBridge {
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    integration_parameters: IntegrationParameters,
    physics_pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    ccd_solver: CCDSolver,
    gravity: Vector<Real>,
    bodies: HashMap<BodyId, BodyEntry>,
    next_id: u64,
}

impl RapierBridge {
    /// Create a new physics world with specified gravity
    ///
    /// # Arguments
    /// * `gravity` - Gravity vector (e.g., Vec3::new(0.0, -9.81, 0.0))
    pub fn new(gravity: Vec3) -> Self {
        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            integration_parameters: IntegrationParameters::default(),
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            ccd_solver: CCDSolver::new(),
            gravity: vector![gravity.x, gravity.y, gravity.z],
            bodies: HashMap::new(),
            next_id: 1,
        }
    }

    /// Get the current gravity vector
    pub fn gravity(&self) -> Vec3 {
        Vec3::new(self.gravity.x, self.gravity.y, self.gravity.z)
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Number of cuboids attached to a body
    pub fn shape_count(&self, body: BodyId) -> usize {
        let Some(entry) = self.bodies.get(&body) else {
            return 0;
        };
        let Some(rb) = self.rigid_body_set.get(entry.handle) else {
            return 0;
        };
        rb.colliders()
            .iter()
            .filter_map(|h| self.collider_set.get(*h))
            .map(|c| {
                c.shape()
                    .as_compound()
                    .map(|compound| compound.shapes().len())
                    .unwrap_or(1)
            })
            .sum()
    }

    fn allocate_id(&mut self) -> BodyId {
        let id = BodyId(self.next_id);
        self.next_id += 1;
        id
    }

    fn compound_collider(boxes: &[Aabb], material: &MaterialSummary, mass: Option<f32>) -> Collider {
        let shapes: Vec<(Isometry<Real>, SharedShape)> = boxes
            .iter()
            .map(|b| {
                let c = b.center();
                let h = b.half_size().max(Vec3::splat(MIN_HALF_EXTENT));
                (
                    Isometry::translation(c.x, c.y, c.z),
                    SharedShape::cuboid(h.x, h.y, h.z),
                )
            })
            .collect();

        let mut builder = ColliderBuilder::compound(shapes)
            .friction(material.friction)
            .restitution(material.restitution);
        if let Some(mass) = mass {
            builder = builder.mass(mass);
        }
        builder.build()
    }

    fn attach_shape(&mut self, entry: &BodyEntry, boxes: &[Aabb]) {
        let mass = (!entry.fixed).then(|| entry.material.body_mass());
        let collider = Self::compound_collider(boxes, &entry.material, mass);
        self.collider_set
            .insert_with_parent(collider, entry.handle, &mut self.rigid_body_set);
    }

    fn detach_shapes(&mut self, handle: RigidBodyHandle) {
        let handles: Vec<ColliderHandle> = match self.rigid_body_set.get(handle) {
            Some(rb) => rb.colliders().to_vec(),
            None => return,
        };
        for h in handles {
            self.collider_set
                .remove(h, &mut self.island_manager, &mut self.rigid_body_set, true);
        }
    }

    fn snapshot_of(rb: &RigidBody) -> BodySnapshot {
        let pos = rb.translation();
        let rot = rb.rotation();
        let lin = rb.linvel();
        let ang = rb.angvel();
        BodySnapshot {
            transform: BodyTransform {
                position: Vec3::new(pos.x, pos.y, pos.z),
                rotation: Quat::from_xyzw(rot.i, rot.j, rot.k, rot.w),
            },
            linear_velocity: Vec3::new(lin.x, lin.y, lin.z),
            angular_velocity: Vec3::new(ang.x, ang.y, ang.z),
        }
    }
}

impl Default for RapierBridge {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, -9.81, 0.0))
    }
}

impl PhysicsBridge for RapierBridge {
    fn create_rigid_body(
        &mut self,
        position: Vec3,
        boxes: &[Aabb],
        material: &MaterialSummary,
    ) -> BodyId {
        if boxes.is_empty() {
            return BodyId::INVALID;
        }
        let body = RigidBodyBuilder::dynamic()
            .translation(vector![position.x, position.y, position.z])
            .linear_damping(material.linear_damping)
            .angular_damping(material.angular_damping)
            .build();
        let handle = self.rigid_body_set.insert(body);
        let entry = BodyEntry {
            handle,
            material: *material,
            fixed: false,
        };
        self.attach_shape(&entry, boxes);

        let id = self.allocate_id();
        self.bodies.insert(id, entry);
        id
    }

    fn create_static_body(&mut self, boxes: &[Aabb]) -> BodyId {
        if boxes.is_empty() {
            return BodyId::INVALID;
        }
        let handle = self.rigid_body_set.insert(RigidBodyBuilder::fixed().build());
        let entry = BodyEntry {
            handle,
            material: MaterialSummary::default(),
            fixed: true,
        };
        self.attach_shape(&entry, boxes);

        let id = self.allocate_id();
        self.bodies.insert(id, entry);
        id
    }

    fn remove_body(&mut self, body: BodyId) {
        let Some(entry) = self.bodies.remove(&body) else {
            return;
        };
        // Also removes all attached colliders
        self.rigid_body_set.remove(
            entry.handle,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
    }

    fn get_body_state(&self, body: BodyId) -> Option<BodySnapshot> {
        let entry = self.bodies.get(&body)?;
        self.rigid_body_set.get(entry.handle).map(Self::snapshot_of)
    }

    fn update_body_shape(&mut self, body: BodyId, boxes: &[Aabb]) {
        let Some(entry) = self.bodies.get(&body).copied() else {
            return;
        };
        if boxes.is_empty() {
            return;
        }
        self.detach_shapes(entry.handle);
        self.attach_shape(&entry, boxes);
        if let Some(rb) = self.rigid_body_set.get_mut(entry.handle) {
            rb.wake_up(true);
        }
    }

    fn apply_force(&mut self, body: BodyId, force: Vec3) {
        let Some(entry) = self.bodies.get(&body) else {
            return;
        };
        if let Some(rb) = self.rigid_body_set.get_mut(entry.handle) {
            rb.add_force(vector![force.x, force.y, force.z], true);
        }
    }

    fn activate_body(&mut self, body: BodyId) {
        let Some(entry) = self.bodies.get(&body) else {
            return;
        };
        if let Some(rb) = self.rigid_body_set.get_mut(entry.handle) {
            rb.wake_up(true);
        }
    }

    fn set_body_material(&mut self, body: BodyId, material: &MaterialSummary) {
        let Some(entry) = self.bodies.get_mut(&body) else {
            return;
        };
        entry.material = *material;
        let entry = *entry;

        let colliders: Vec<ColliderHandle> = match self.rigid_body_set.get_mut(entry.handle) {
            Some(rb) => {
                rb.set_linear_damping(material.linear_damping);
                rb.set_angular_damping(material.angular_damping);
                rb.colliders().to_vec()
            }
            None => return,
        };
        for h in colliders {
            if let Some(c) = self.collider_set.get_mut(h) {
                c.set_friction(material.friction);
                c.set_restitution(material.restitution);
                if !entry.fixed {
                    c.set_mass(material.body_mass());
                }
            }
        }
    }

    fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = vector![gravity.x, gravity.y, gravity.z];
    }

    fn step(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;

        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            &(),
            &(),
        );

        // Forces act for one step only
        for entry in self.bodies.values() {
            if let Some(rb) = self.rigid_body_set.get_mut(entry.handle) {
                rb.reset_forces(false);
            }
        }
    }

    fn sync_all_bodies(&self, out: &mut Vec<BodyState>) {
        let mut ids: Vec<&BodyId> = self.bodies.keys().collect();
        ids.sort();
        for id in ids {
            let entry = &self.bodies[id];
            let Some(rb) = self.rigid_body_set.get(entry.handle) else {
                continue;
            };
            let mut flags = 0;
            if !rb.is_sleeping() {
                flags |= BODY_FLAG_ACTIVE;
            }
            if entry.fixed {
                flags |= BODY_FLAG_STATIC;
            }
            out.push(BodyState::from_snapshot(*id, &Self::snapshot_of(rb), flags));
        }
    }
}
