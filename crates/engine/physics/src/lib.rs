//! Voxel structure physics
//!
//! Turns sets of voxels into rigid bodies of a native physics engine and
//! keeps both sides in step while the voxels change.
//!
//! # Modules
//!
//! - `optimizer`: greedy merge of voxel sets into axis-aligned boxes
//! - `material`: per-appearance physical profiles and their incremental aggregate
//! - `bridge`: contract to the native engine, with rapier and recording implementations
//! - `collider_cache`: body-local boxes, world bounds and broad-phase queries
//! - `scheduler`: incremental ambient and selection scans feeding the optimizer
//! - `structure`: dynamic structures, rebuilds and interaction
//! - `shipyard`: shadow regions mirroring structure content in a fixed frame
//! - `context`: owner of all state of one simulation

pub mod bridge;
pub mod collider_cache;
pub mod collision;
pub mod config;
pub mod context;
pub mod error;
pub mod material;
pub mod optimizer;
pub mod scheduler;
pub mod shipyard;
pub mod structure;
pub mod voxel;
pub mod worker;
pub mod world;

pub use bridge::{BodyId, BodySnapshot, BodyState, BodyTransform, PhysicsBridge, RecordingBridge};
pub use collider_cache::{ColliderCache, ColliderObserver};
pub use collision::{Aabb, VoxelBox};
pub use config::{PhysicsConfig, ShipyardConfig};
pub use context::{HasBodyId, PhysicsContext, UpdatableFromPhysics};
pub use error::{PhysicsError, Result};
pub use material::{MaterialAggregator, MaterialKind, MaterialProfile, MaterialSummary, MaterialTable};
pub use optimizer::optimize;
pub use scheduler::{AmbientScheduler, BuildState, Selection, SelectionScheduler};
pub use shipyard::{Shipyard, ShipyardRegion};
pub use structure::{PhysicsStructure, StructureBlockData, StructureManager};
pub use voxel::{ChunkPos, DimensionId, Face, OwnerId, VoxelKey};
pub use world::{GridWorld, VoxelState, VoxelWorld, WriteFlags};

#[cfg(feature = "rapier")]
pub use bridge::RapierBridge;

// Re-export for convenience
pub use glam;
#[cfg(feature = "rapier")]
pub use rapier3d;
