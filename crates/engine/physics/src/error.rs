//! Error types for the structure physics crate

use crate::bridge::BodyId;
use crate::voxel::ChunkPos;
use glam::IVec3;

/// Errors raised while building, mutating or persisting physics structures
#[derive(Debug, thiserror::Error)]
pub enum PhysicsError {
    /// The native engine never came up; the subsystem runs in no-op mode
    #[error("Native physics engine is not available")]
    BridgeUnavailable,

    /// The bridge handed back an invalid body handle
    #[error("Failed to create physics body")]
    BodyCreationFailed,

    /// A scan touched a chunk that is not loaded yet
    #[error("Chunk {0:?} is not loaded")]
    RegionNotLoaded(ChunkPos),

    /// The optimizer produced no boxes
    #[error("Selection contains no collidable voxels")]
    EmptyGeometry,

    /// Shadow region allocation or chunk forcing failed
    #[error("Shadow placement failed: {0}")]
    ShadowPlacementFailure(String),

    /// The background optimizer died or was cancelled mid-job
    #[error("Optimization failed: {0}")]
    BuildFailed(String),

    /// New work is refused once shutdown has begun
    #[error("Physics system is shutting down")]
    ShuttingDown,

    /// The owner already has a selection build running
    #[error("A structure build is already in progress")]
    BuildInProgress,

    /// Selection volume exceeds the configured maximum
    #[error("Selection volume too large: {volume} (max {max})")]
    SelectionTooLarge { volume: u64, max: u64 },

    /// No structure is registered under this body
    #[error("Unknown body {0:?}")]
    UnknownBody(BodyId),

    /// A local voxel position does not fit in a packed key
    #[error("Local position {0} is outside the structure key range")]
    OutOfRange(IVec3),

    /// The native side disagrees about the boundary record layout
    #[error("Body state layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for structure physics operations
pub type Result<T> = std::result::Result<T, PhysicsError>;

impl PhysicsError {
    /// Returns true if the condition clears on its own and the caller should retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, PhysicsError::RegionNotLoaded(_))
    }

    /// Returns true for errors that end a build without creating a body
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            PhysicsError::BodyCreationFailed
                | PhysicsError::EmptyGeometry
                | PhysicsError::BuildFailed(_)
                | PhysicsError::BridgeUnavailable
                | PhysicsError::OutOfRange(_)
        )
    }
}

impl From<toml::de::Error> for PhysicsError {
    fn from(err: toml::de::Error) -> Self {
        PhysicsError::Config(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PhysicsError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        PhysicsError::BuildFailed(format!("worker dropped result: {}", err))
    }
}
