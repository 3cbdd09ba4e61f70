//! Player-initiated selections that lift voxels into a new structure
//!
//! A selection scan consumes the voxels it visits: their content is captured,
//! the world cell is cleared silently and the chunk is marked dirty for the
//! ambient scheduler. Once the optimizer answers, the task waits until every
//! chunk it dirtied has a fresh terrain collider before handing the captured
//! content to the finalizer.

use super::{AmbientScheduler, BuildState, ScanCursor};
use crate::collision::VoxelBox;
use crate::config::PhysicsConfig;
use crate::error::{PhysicsError, Result};
use crate::structure::{BuildOutcome, StructureBlockData};
use crate::voxel::{ChunkPos, DimensionId, OwnerId};
use crate::worker::{JobHandle, OptimizerWorker};
use crate::world::{VoxelWorld, WriteFlags};
use glam::IVec3;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Inclusive box spanned by two corners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub first: IVec3,
    pub second: IVec3,
}

impl Selection {
    pub fn new(first: IVec3, second: IVec3) -> Self {
        Self { first, second }
    }

    pub fn min(&self) -> IVec3 {
        self.first.min(self.second)
    }

    pub fn max(&self) -> IVec3 {
        self.first.max(self.second)
    }

    /// Number of voxels covered
    pub fn volume(&self) -> u64 {
        let size = (self.max() - self.min() + IVec3::ONE).as_i64vec3();
        (size.x * size.y * size.z) as u64
    }
}

/// Content lifted by a finished selection scan
#[derive(Debug, Clone)]
pub struct CapturedSelection {
    pub owner: OwnerId,
    pub dimension: DimensionId,
    /// World position of local `(0, 0, 0)`
    pub origin: IVec3,
    /// Captured voxels keyed by local position
    pub voxels: HashMap<IVec3, StructureBlockData>,
    /// Optimized boxes in local coordinates
    pub boxes: Vec<VoxelBox>,
}

struct SelectionTask {
    owner: OwnerId,
    dimension: DimensionId,
    min: IVec3,
    volume: u64,
    cursor: ScanCursor,
    captured: HashMap<IVec3, StructureBlockData>,
    solid: Vec<IVec3>,
    dirty_chunks: BTreeSet<ChunkPos>,
    last_percent: u64,
    warned_missing: bool,
    state: BuildState,
    job: Option<JobHandle>,
    boxes: Vec<VoxelBox>,
}

impl SelectionTask {
    fn new(owner: OwnerId, dimension: DimensionId, selection: &Selection) -> Self {
        Self {
            owner,
            dimension,
            min: selection.min(),
            volume: selection.volume(),
            cursor: ScanCursor::new(selection.min(), selection.max()),
            captured: HashMap::new(),
            solid: Vec::new(),
            dirty_chunks: BTreeSet::new(),
            last_percent: 0,
            warned_missing: false,
            state: BuildState::Scanning,
            job: None,
            boxes: Vec::new(),
        }
    }

    fn scan(
        &mut self,
        world: &mut dyn VoxelWorld,
        ambient: &mut AmbientScheduler,
        budget: u32,
        notices: &mut HashMap<OwnerId, Vec<String>>,
    ) {
        let mut processed = 0;
        while processed < budget {
            let Some(pos) = self.cursor.current() else {
                break;
            };
            let chunk = ChunkPos::containing(pos);
            if !world.is_chunk_loaded(chunk) {
                if !self.warned_missing {
                    self.warned_missing = true;
                    warn!("Selection of {} waiting for chunk {:?}", self.owner, chunk);
                    notify(notices, self.owner, "Waiting for chunks to load...".to_string());
                }
                return;
            }

            if let Some(state) = world.get_voxel(pos) {
                let local = pos - self.min;
                if state.collidable {
                    self.solid.push(local);
                }
                self.captured.insert(local, StructureBlockData::from(state));
                world.clear_voxel(pos, WriteFlags::SILENT);
                if self.dirty_chunks.insert(chunk) {
                    ambient.mark_chunk_dirty(&*world, chunk);
                }
            }

            processed += 1;
            self.cursor.advance();
        }

        if self.volume > 0 {
            let percent = (self.cursor.visited() * 100 / self.volume).min(100);
            if percent >= self.last_percent + 10 {
                self.last_percent = percent;
                notify(notices, self.owner, format!("Selection scan: {}%", percent));
            }
        }
    }

    fn fail(&mut self, reason: &PhysicsError, notices: &mut HashMap<OwnerId, Vec<String>>) {
        debug!("Selection of {} failed: {}", self.owner, reason);
        self.state = BuildState::Failed;
        self.captured.clear();
        self.solid.clear();
        self.boxes.clear();
        if let Some(job) = self.job.take() {
            job.cancel();
        }
        notify(notices, self.owner, reason.to_string());
    }
}

fn notify(notices: &mut HashMap<OwnerId, Vec<String>>, owner: OwnerId, message: String) {
    notices.entry(owner).or_default().push(message);
}

/// Selection build scheduler
pub struct SelectionScheduler {
    tasks: Vec<SelectionTask>,
    worker: OptimizerWorker,
    notices: HashMap<OwnerId, Vec<String>>,
    accepting: bool,
    voxels_per_tick: u32,
    max_volume: u64,
}

impl SelectionScheduler {
    pub fn new(config: &PhysicsConfig) -> Result<Self> {
        Ok(Self {
            tasks: Vec::new(),
            worker: OptimizerWorker::spawn("structure-optimizer")?,
            notices: HashMap::new(),
            accepting: true,
            voxels_per_tick: config.selection_voxels_per_tick,
            max_volume: config.max_selection_volume,
        })
    }

    /// Queue a selection build for `owner`
    ///
    /// # Arguments
    /// * `bridge_available` - whether a native engine is present to receive the body
    ///
    /// # Returns
    /// The rejection reason, which is also queued as a notice for `owner`
    pub fn request(
        &mut self,
        owner: OwnerId,
        dimension: DimensionId,
        selection: Selection,
        bridge_available: bool,
    ) -> Result<()> {
        let volume = selection.volume();
        let rejection = if !self.accepting {
            Some(PhysicsError::ShuttingDown)
        } else if !bridge_available {
            Some(PhysicsError::BridgeUnavailable)
        } else if self.is_building(owner) {
            Some(PhysicsError::BuildInProgress)
        } else if volume > self.max_volume {
            Some(PhysicsError::SelectionTooLarge {
                volume,
                max: self.max_volume,
            })
        } else {
            None
        };
        if let Some(err) = rejection {
            notify(&mut self.notices, owner, err.to_string());
            return Err(err);
        }

        self.tasks
            .push(SelectionTask::new(owner, dimension, &selection));
        notify(
            &mut self.notices,
            owner,
            format!("Structure build started. Volume: {}", volume),
        );
        info!(
            "Selection build for {} started: {:?}..{:?} ({} voxels)",
            owner,
            selection.min(),
            selection.max(),
            volume
        );
        Ok(())
    }

    /// Abandon `owner`'s build, discarding everything captured so far
    pub fn cancel(&mut self, owner: OwnerId) -> bool {
        let Some(index) = self.tasks.iter().position(|t| t.owner == owner) else {
            return false;
        };
        let mut task = self.tasks.remove(index);
        task.fail(
            &PhysicsError::BuildFailed("cancelled".to_string()),
            &mut self.notices,
        );
        true
    }

    /// Advance every selection in `world`'s dimension
    ///
    /// `finalize` runs on this thread for each task whose content is ready;
    /// it must create the structure or fail without leaving anything behind.
    pub fn tick<F>(&mut self, world: &mut dyn VoxelWorld, ambient: &mut AmbientScheduler, mut finalize: F)
    where
        F: FnMut(CapturedSelection) -> Result<BuildOutcome>,
    {
        if !self.accepting {
            return;
        }
        let dimension = world.dimension();
        let budget = self.voxels_per_tick;

        for task in self.tasks.iter_mut() {
            if task.dimension != dimension {
                continue;
            }

            if task.state == BuildState::Scanning {
                task.scan(world, ambient, budget, &mut self.notices);
                if task.cursor.is_finished() {
                    if task.solid.is_empty() {
                        task.fail(&PhysicsError::EmptyGeometry, &mut self.notices);
                        continue;
                    }
                    notify(
                        &mut self.notices,
                        task.owner,
                        format!("Optimizing {} blocks...", task.solid.len()),
                    );
                    task.state = BuildState::Optimizing;
                    match self.worker.submit(std::mem::take(&mut task.solid)) {
                        Ok(job) => task.job = Some(job),
                        Err(err) => {
                            task.fail(&err, &mut self.notices);
                            continue;
                        }
                    }
                }
            }

            if task.state == BuildState::Optimizing {
                let Some(result) = task.job.as_mut().and_then(JobHandle::try_result) else {
                    continue;
                };
                task.job = None;
                match result {
                    Ok(boxes) if boxes.is_empty() => {
                        task.fail(&PhysicsError::EmptyGeometry, &mut self.notices);
                        continue;
                    }
                    Ok(boxes) => {
                        task.boxes = boxes;
                        task.state = BuildState::WaitingDependencies;
                    }
                    Err(err) => {
                        task.fail(&err, &mut self.notices);
                        continue;
                    }
                }
            }

            if task.state == BuildState::WaitingDependencies {
                if task
                    .dirty_chunks
                    .iter()
                    .any(|chunk| ambient.is_rebuilding(dimension, *chunk))
                {
                    continue;
                }
                let captured = CapturedSelection {
                    owner: task.owner,
                    dimension,
                    origin: task.min,
                    voxels: std::mem::take(&mut task.captured),
                    boxes: std::mem::take(&mut task.boxes),
                };
                match finalize(captured) {
                    Ok(outcome) => {
                        task.state = BuildState::Done;
                        notify(
                            &mut self.notices,
                            task.owner,
                            format!(
                                "Structure physics created! Body ID: {}, blocks: {}",
                                outcome.body.0, outcome.block_count
                            ),
                        );
                        if let Some(err) = outcome.shadow_error {
                            notify(&mut self.notices, task.owner, format!("Warning: {}", err));
                        }
                    }
                    Err(err) => task.fail(&err, &mut self.notices),
                }
            }
        }

        self.tasks.retain(|t| !t.state.is_finished());
    }

    pub fn is_building(&self, owner: OwnerId) -> bool {
        self.tasks.iter().any(|t| t.owner == owner)
    }

    pub fn task_state(&self, owner: OwnerId) -> Option<BuildState> {
        self.tasks.iter().find(|t| t.owner == owner).map(|t| t.state)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Take the messages queued for `owner`
    pub fn drain_notices(&mut self, owner: OwnerId) -> Vec<String> {
        self.notices.remove(&owner).unwrap_or_default()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Refuse new selections, cancel in-flight work and stop the worker
    pub fn shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for task in &mut self.tasks {
            if let Some(job) = task.job.take() {
                job.cancel();
            }
        }
        self.worker.shutdown();
        self.tasks.clear();
        self.notices.clear();
        info!("Selection scheduler shut down");
    }
}
