//! Budgeted incremental scans
//!
//! Both schedulers walk an integer box a bounded number of voxels per tick,
//! hand the collected voxels to their optimizer worker and finish the build
//! back on the tick thread once the worker answers.

mod ambient;
mod selection;

pub use ambient::AmbientScheduler;
pub use selection::{CapturedSelection, Selection, SelectionScheduler};

use glam::IVec3;

/// Build task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Scanning,
    Optimizing,
    /// Optimized, waiting for chunk colliders touched by the scan to rebuild
    WaitingDependencies,
    Done,
    Failed,
}

impl BuildState {
    pub fn is_finished(self) -> bool {
        matches!(self, BuildState::Done | BuildState::Failed)
    }
}

/// Cursor over the inclusive box `min..=max`; x advances fastest, then z, then y
#[derive(Debug, Clone)]
pub(crate) struct ScanCursor {
    min: IVec3,
    max: IVec3,
    pos: IVec3,
    visited: u64,
}

impl ScanCursor {
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self {
            min,
            max,
            pos: min,
            visited: 0,
        }
    }

    /// Voxel under the cursor, `None` once the box is exhausted
    pub fn current(&self) -> Option<IVec3> {
        (self.pos.y <= self.max.y).then_some(self.pos)
    }

    pub fn advance(&mut self) {
        self.visited += 1;
        self.pos.x += 1;
        if self.pos.x > self.max.x {
            self.pos.x = self.min.x;
            self.pos.z += 1;
            if self.pos.z > self.max.z {
                self.pos.z = self.min.z;
                self.pos.y += 1;
            }
        }
    }

    /// Jump to the start of layer `y` without counting the skipped voxels
    pub fn skip_to_layer(&mut self, y: i32) {
        self.pos = IVec3::new(self.min.x, y.max(self.pos.y + 1), self.min.z);
    }

    pub fn is_finished(&self) -> bool {
        self.pos.y > self.max.y
    }

    pub fn visited(&self) -> u64 {
        self.visited
    }
}
