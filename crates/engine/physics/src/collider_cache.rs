//! Collider synchronization cache
//!
//! Keeps the body-local boxes of every dynamic body together with its last
//! known transform, and derives world-space AABBs from them for broad-phase
//! queries. Two update paths feed the same recompute routine: pulling state
//! from the bridge on the authoritative side, and applying a received
//! transform on an observer.

use crate::bridge::{BodyId, BodySnapshot, BodyTransform, PhysicsBridge};
use crate::collision::Aabb;
use crate::voxel::{ChunkPos, DimensionId};
use glam::{IVec3, Vec3};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// How far below the feet a support surface is searched for
pub const PLATFORM_PROBE_DEPTH: f32 = 0.35;
/// Largest gap between feet and surface still counted as standing on it
pub const PLATFORM_MAX_GAP: f32 = 0.25;
/// Edge length of the local candidate grid
pub const LOCAL_GRID_CELL_SIZE: f32 = 4.0;

/// Receives replication events in the order the cache produces them
pub trait ColliderObserver: Send {
    fn on_body_created(
        &mut self,
        dimension: DimensionId,
        body: BodyId,
        local_boxes: &[Aabb],
        transform: &BodyTransform,
    );

    fn on_body_transform_updated(&mut self, body: BodyId, transform: &BodyTransform);

    fn on_body_shape_updated(&mut self, body: BodyId, local_boxes: &[Aabb]);

    fn on_body_removed(&mut self, body: BodyId);
}

/// Replication event as captured by [`EventLog`]
#[derive(Debug, Clone, PartialEq)]
pub enum ColliderEvent {
    Created {
        dimension: DimensionId,
        body: BodyId,
        local_boxes: Vec<Aabb>,
        transform: BodyTransform,
    },
    TransformUpdated {
        body: BodyId,
        transform: BodyTransform,
    },
    ShapeUpdated {
        body: BodyId,
        local_boxes: Vec<Aabb>,
    },
    Removed(BodyId),
}

/// Observer that appends every event to a shared list
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ColliderEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ColliderEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    /// Take every event recorded so far
    pub fn drain(&self) -> Vec<ColliderEvent> {
        match self.events.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ColliderObserver for EventLog {
    fn on_body_created(
        &mut self,
        dimension: DimensionId,
        body: BodyId,
        local_boxes: &[Aabb],
        transform: &BodyTransform,
    ) {
        self.push(ColliderEvent::Created {
            dimension,
            body,
            local_boxes: local_boxes.to_vec(),
            transform: *transform,
        });
    }

    fn on_body_transform_updated(&mut self, body: BodyId, transform: &BodyTransform) {
        self.push(ColliderEvent::TransformUpdated {
            body,
            transform: *transform,
        });
    }

    fn on_body_shape_updated(&mut self, body: BodyId, local_boxes: &[Aabb]) {
        self.push(ColliderEvent::ShapeUpdated {
            body,
            local_boxes: local_boxes.to_vec(),
        });
    }

    fn on_body_removed(&mut self, body: BodyId) {
        self.push(ColliderEvent::Removed(body));
    }
}

/// Surface a player is standing on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformSupport {
    pub body: BodyId,
    /// World height of the supporting surface
    pub top_y: f32,
    /// Velocity of the contact point, including the spin of the body
    pub velocity: Vec3,
}

/// Uniform grid over local boxes, mapping cells to box indices
#[derive(Debug, Clone, Default)]
struct LocalGrid {
    cells: HashMap<IVec3, Vec<usize>>,
}

impl LocalGrid {
    fn build(boxes: &[Aabb]) -> Self {
        let mut cells: HashMap<IVec3, Vec<usize>> = HashMap::new();
        for (i, b) in boxes.iter().enumerate() {
            let (lo, hi) = Self::cell_range(b);
            for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    for z in lo.z..=hi.z {
                        cells.entry(IVec3::new(x, y, z)).or_default().push(i);
                    }
                }
            }
        }
        Self { cells }
    }

    fn cell_range(b: &Aabb) -> (IVec3, IVec3) {
        let inv = 1.0 / LOCAL_GRID_CELL_SIZE;
        (
            (b.min * inv).floor().as_ivec3(),
            (b.max * inv).floor().as_ivec3(),
        )
    }

    fn candidates(&self, query: &Aabb) -> Vec<usize> {
        if self.cells.is_empty() {
            return Vec::new();
        }
        let (lo, hi) = Self::cell_range(query);
        let mut seen = HashSet::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    if let Some(list) = self.cells.get(&IVec3::new(x, y, z)) {
                        seen.extend(list.iter().copied());
                    }
                }
            }
        }
        let mut out: Vec<usize> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }
}

/// Cached geometry and motion of one body
#[derive(Debug, Clone)]
struct DynamicCollider {
    dimension: DimensionId,
    local_boxes: Vec<Aabb>,
    local_bounds: Option<Aabb>,
    grid: LocalGrid,
    transform: BodyTransform,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
    bounds: Option<Aabb>,
    chunk_range: Option<(ChunkPos, ChunkPos)>,
}

impl DynamicCollider {
    fn new(dimension: DimensionId, local_boxes: Vec<Aabb>, transform: BodyTransform) -> Self {
        let mut collider = Self {
            dimension,
            local_boxes: Vec::new(),
            local_bounds: None,
            grid: LocalGrid::default(),
            transform,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            bounds: None,
            chunk_range: None,
        };
        collider.set_local_boxes(local_boxes);
        collider
    }

    fn set_local_boxes(&mut self, boxes: Vec<Aabb>) {
        self.local_bounds = boxes.iter().copied().reduce(|a, b| a.union(&b));
        self.grid = LocalGrid::build(&boxes);
        self.local_boxes = boxes;
    }

    /// Recompute world bounds from the current transform
    fn recompute(&mut self) {
        self.bounds = self
            .local_bounds
            .map(|b| b.to_world(self.transform.position, self.transform.rotation));
    }

    fn world_box(&self, local: &Aabb) -> Aabb {
        local.to_world(self.transform.position, self.transform.rotation)
    }

    fn world_boxes(&self) -> Vec<Aabb> {
        self.local_boxes.iter().map(|b| self.world_box(b)).collect()
    }

    /// Envelope of a world box in the body's local frame
    fn to_local(&self, world: &Aabb) -> Aabb {
        let inverse = self.transform.rotation.inverse();
        let mut out = Aabb::new(Vec3::splat(f32::MAX), Vec3::splat(f32::MIN));
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { world.min.x } else { world.max.x },
                if i & 2 == 0 { world.min.y } else { world.max.y },
                if i & 4 == 0 { world.min.z } else { world.max.z },
            );
            out.expand_to_include(inverse * (corner - self.transform.position));
        }
        out
    }

    /// World boxes overlapping `query`, narrowed through the local grid
    fn shapes_in(&self, query: &Aabb) -> impl Iterator<Item = Aabb> + '_ {
        let local_query = self.to_local(query);
        let query = *query;
        self.grid
            .candidates(&local_query)
            .into_iter()
            .filter_map(move |i| self.local_boxes.get(i))
            .filter(move |b| b.intersects(&local_query))
            .map(|b| self.world_box(b))
            .filter(move |w| w.intersects(&query))
    }

    fn raycast(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<f32> {
        let inverse = self.transform.rotation.inverse();
        let o = inverse * (origin - self.transform.position);
        let d = inverse * dir;
        if d.length_squared() < 1e-9 {
            return None;
        }
        let mut segment = Aabb::new(o, o);
        segment.expand_to_include(o + d * max_dist);

        self.grid
            .candidates(&segment)
            .into_iter()
            .filter_map(|i| self.local_boxes.get(i))
            .filter(|b| b.intersects(&segment))
            .filter_map(|b| b.ray_hit(o, d, max_dist))
            .min_by(|a, b| a.total_cmp(b))
    }

    fn chunk_range_of(bounds: &Aabb) -> (ChunkPos, ChunkPos) {
        (
            ChunkPos::containing_point(bounds.min.x, bounds.min.z),
            ChunkPos::containing_point(bounds.max.x, bounds.max.z),
        )
    }
}

/// Per-body cache of local boxes and live transforms
#[derive(Default)]
pub struct ColliderCache {
    bodies: HashMap<BodyId, DynamicCollider>,
    chunk_index: HashMap<DimensionId, HashMap<ChunkPos, HashSet<BodyId>>>,
    last_refresh: HashMap<DimensionId, u64>,
    observers: Vec<Box<dyn ColliderObserver>>,
}

impl ColliderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Box<dyn ColliderObserver>) {
        self.observers.push(observer);
    }

    /// Register a body from world boxes captured while it sat at `center` unrotated
    ///
    /// # Returns
    /// The body-local boxes that were stored
    pub fn register_body(
        &mut self,
        dimension: DimensionId,
        body: BodyId,
        world_boxes: &[Aabb],
        center: Vec3,
    ) -> Vec<Aabb> {
        let local: Vec<Aabb> = world_boxes.iter().map(|b| b.translated(-center)).collect();
        self.register_local(dimension, body, local.clone(), BodyTransform::from_position(center));
        local
    }

    /// Register a body from body-local boxes and an initial transform
    pub fn register_local(
        &mut self,
        dimension: DimensionId,
        body: BodyId,
        local_boxes: Vec<Aabb>,
        transform: BodyTransform,
    ) {
        if !body.is_valid() || local_boxes.is_empty() {
            return;
        }
        self.unregister_silently(body);
        let collider = DynamicCollider::new(dimension, local_boxes, transform);
        for obs in &mut self.observers {
            obs.on_body_created(dimension, body, &collider.local_boxes, &transform);
        }
        self.bodies.insert(body, collider);
        self.recompute(body);
    }

    /// Replace a body's local boxes, keeping its transform
    pub fn update_shape(&mut self, body: BodyId, local_boxes: Vec<Aabb>) {
        let Some(collider) = self.bodies.get_mut(&body) else {
            return;
        };
        collider.set_local_boxes(local_boxes);
        for obs in &mut self.observers {
            obs.on_body_shape_updated(body, &collider.local_boxes);
        }
        self.recompute(body);
    }

    pub fn unregister(&mut self, body: BodyId) {
        if self.unregister_silently(body) {
            for obs in &mut self.observers {
                obs.on_body_removed(body);
            }
        }
    }

    fn unregister_silently(&mut self, body: BodyId) -> bool {
        let Some(collider) = self.bodies.remove(&body) else {
            return false;
        };
        if let Some(range) = collider.chunk_range {
            self.remove_chunk_range(collider.dimension, body, range);
        }
        true
    }

    /// Apply a transform received from the authoritative side
    pub fn apply_transform(
        &mut self,
        body: BodyId,
        transform: BodyTransform,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) {
        let Some(collider) = self.bodies.get_mut(&body) else {
            return;
        };
        collider.transform = transform;
        collider.linear_velocity = linear_velocity;
        collider.angular_velocity = angular_velocity;
        self.recompute(body);
    }

    /// Pull every body of a dimension from the bridge, at most once per game tick
    ///
    /// # Returns
    /// `true` if a refresh happened
    pub fn refresh_from_bridge(
        &mut self,
        dimension: DimensionId,
        game_time: u64,
        bridge: &dyn PhysicsBridge,
    ) -> bool {
        if self.last_refresh.get(&dimension) == Some(&game_time) {
            return false;
        }
        self.last_refresh.insert(dimension, game_time);

        let mut ids: Vec<BodyId> = self
            .bodies
            .iter()
            .filter(|(_, c)| c.dimension == dimension)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        for id in ids {
            let Some(state) = bridge.get_body_state(id) else {
                continue;
            };
            self.apply_transform(
                id,
                state.transform,
                state.linear_velocity,
                state.angular_velocity,
            );
            for obs in &mut self.observers {
                obs.on_body_transform_updated(id, &state.transform);
            }
        }
        true
    }

    fn recompute(&mut self, body: BodyId) {
        let Some(collider) = self.bodies.get_mut(&body) else {
            return;
        };
        collider.recompute();
        let dimension = collider.dimension;
        let old = collider.chunk_range;
        let new = collider.bounds.as_ref().map(DynamicCollider::chunk_range_of);
        if old == new {
            return;
        }
        collider.chunk_range = new;
        if let Some(range) = old {
            self.remove_chunk_range(dimension, body, range);
        }
        if let Some((lo, hi)) = new {
            let index = self.chunk_index.entry(dimension).or_default();
            for cx in lo.x..=hi.x {
                for cz in lo.z..=hi.z {
                    index.entry(ChunkPos::new(cx, cz)).or_default().insert(body);
                }
            }
        }
    }

    fn remove_chunk_range(
        &mut self,
        dimension: DimensionId,
        body: BodyId,
        (lo, hi): (ChunkPos, ChunkPos),
    ) {
        let Some(index) = self.chunk_index.get_mut(&dimension) else {
            return;
        };
        for cx in lo.x..=hi.x {
            for cz in lo.z..=hi.z {
                let key = ChunkPos::new(cx, cz);
                if let Some(set) = index.get_mut(&key) {
                    set.remove(&body);
                    if set.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    /// Bodies whose chunk range overlaps the query, sorted by id
    fn candidates(&self, dimension: DimensionId, query: &Aabb) -> Vec<BodyId> {
        let Some(index) = self.chunk_index.get(&dimension) else {
            return Vec::new();
        };
        let lo = ChunkPos::containing_point(query.min.x, query.min.z);
        let hi = ChunkPos::containing_point(query.max.x, query.max.z);
        let mut found = HashSet::new();
        for cx in lo.x..=hi.x {
            for cz in lo.z..=hi.z {
                if let Some(set) = index.get(&ChunkPos::new(cx, cz)) {
                    found.extend(set.iter().copied());
                }
            }
        }
        let mut out: Vec<BodyId> = found.into_iter().collect();
        out.sort();
        out
    }

    /// Bodies in `dimension` whose world bounds overlap `region`
    pub fn bodies_in_region(&self, dimension: DimensionId, region: &Aabb) -> Vec<BodyId> {
        self.candidates(dimension, region)
            .into_iter()
            .filter(|id| {
                self.bodies
                    .get(id)
                    .and_then(|c| c.bounds)
                    .is_some_and(|b| b.intersects(region))
            })
            .collect()
    }

    /// World boxes of every body that overlap `query`
    pub fn collect_shapes(&self, dimension: DimensionId, query: &Aabb) -> Vec<Aabb> {
        let mut shapes = Vec::new();
        for id in self.bodies_in_region(dimension, query) {
            if let Some(c) = self.bodies.get(&id) {
                shapes.extend(c.shapes_in(query));
            }
        }
        shapes
    }

    /// Distance along `dir` to the first box of `body`, if within `max_dist`
    pub fn raycast_body(&self, body: BodyId, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<f32> {
        self.bodies.get(&body)?.raycast(origin, dir, max_dist)
    }

    /// Highest body surface under `feet_box` within the probe window
    pub fn platform_support(&self, dimension: DimensionId, feet_box: &Aabb) -> Option<PlatformSupport> {
        let mut probe = *feet_box;
        probe.min.y -= PLATFORM_PROBE_DEPTH;
        let feet_y = feet_box.min.y;

        let mut best: Option<PlatformSupport> = None;
        for id in self.bodies_in_region(dimension, &probe) {
            let Some(c) = self.bodies.get(&id) else {
                continue;
            };
            for w in c.shapes_in(&probe) {
                let gap = feet_y - w.max.y;
                if gap < -PLATFORM_PROBE_DEPTH || gap > PLATFORM_MAX_GAP {
                    continue;
                }
                if best.is_some_and(|b| b.top_y >= w.max.y) {
                    continue;
                }
                let contact = Vec3::new(feet_box.center().x, feet_y, feet_box.center().z);
                let snapshot = BodySnapshot {
                    transform: c.transform,
                    linear_velocity: c.linear_velocity,
                    angular_velocity: c.angular_velocity,
                };
                best = Some(PlatformSupport {
                    body: id,
                    top_y: w.max.y,
                    velocity: snapshot.velocity_at(contact),
                });
            }
        }
        best
    }

    pub fn world_boxes(&self, body: BodyId) -> Vec<Aabb> {
        self.bodies.get(&body).map(|c| c.world_boxes()).unwrap_or_default()
    }

    pub fn local_boxes(&self, body: BodyId) -> Option<&[Aabb]> {
        self.bodies.get(&body).map(|c| c.local_boxes.as_slice())
    }

    pub fn body_bounds(&self, body: BodyId) -> Option<Aabb> {
        self.bodies.get(&body).and_then(|c| c.bounds)
    }

    pub fn body_transform(&self, body: BodyId) -> Option<BodyTransform> {
        self.bodies.get(&body).map(|c| c.transform)
    }

    pub fn contains(&self, body: BodyId) -> bool {
        self.bodies.contains_key(&body)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Drop every body without notifying observers
    pub fn clear(&mut self) {
        self.bodies.clear();
        self.chunk_index.clear();
        self.last_refresh.clear();
    }
}
