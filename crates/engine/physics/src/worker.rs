//! Background optimizer worker
//!
//! One dedicated thread per scheduler runs box merging off the simulation
//! thread. Results come back through a one-shot channel that the tick loop
//! polls with [`JobHandle::try_result`]; nothing on the worker touches
//! structure or collider state.

use crate::collision::VoxelBox;
use crate::error::{PhysicsError, Result};
use crate::optimizer;
use glam::IVec3;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Unique identifier for an optimizer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

type Work = Box<dyn FnOnce() -> Vec<VoxelBox> + Send + 'static>;

struct Job {
    id: JobId,
    cancel_flag: Arc<AtomicBool>,
    work: Work,
    result_tx: oneshot::Sender<Result<Vec<VoxelBox>>>,
}

/// Handle for polling and cancelling a submitted job
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    cancel_flag: Arc<AtomicBool>,
    result_rx: Option<oneshot::Receiver<Result<Vec<VoxelBox>>>>,
}

impl JobHandle {
    /// Ask the worker to skip this job if it has not started yet
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Non-blocking poll
    ///
    /// # Returns
    /// `None` while the job is still queued or running; the result exactly once
    /// afterwards. A worker that went away reports `BuildFailed`.
    pub fn try_result(&mut self) -> Option<Result<Vec<VoxelBox>>> {
        let rx = self.result_rx.as_mut()?;
        let out = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(PhysicsError::BuildFailed(format!(
                "{} dropped by worker",
                self.id
            ))),
        };
        self.result_rx = None;
        Some(out)
    }
}

/// Single-threaded optimizer executor
pub struct OptimizerWorker {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl OptimizerWorker {
    /// Start the worker thread
    pub fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let stopping = Arc::new(AtomicBool::new(false));
        let stop = stopping.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver, stop))?;
        debug!("Started optimizer worker {}", name);
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            thread: Some(thread),
            stopping,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a box-merging pass over `voxels`
    pub fn submit(&self, voxels: Vec<IVec3>) -> Result<JobHandle> {
        self.submit_with(move || optimizer::optimize(voxels))
    }

    /// Queue arbitrary work producing boxes
    pub fn submit_with<F>(&self, work: F) -> Result<JobHandle>
    where
        F: FnOnce() -> Vec<VoxelBox> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PhysicsError::ShuttingDown)?;
        let id = JobId::new();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = oneshot::channel();
        sender
            .send(Job {
                id,
                cancel_flag: cancel_flag.clone(),
                work: Box::new(work),
                result_tx,
            })
            .map_err(|_| PhysicsError::ShuttingDown)?;
        Ok(JobHandle {
            id,
            cancel_flag,
            result_rx: Some(result_rx),
        })
    }

    /// Refuse new work, discard queued jobs and join the thread
    pub fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.sender = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Optimizer worker {} exited abnormally", self.name);
            } else {
                info!("Optimizer worker {} stopped", self.name);
            }
        }
    }
}

impl Drop for OptimizerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(receiver: mpsc::Receiver<Job>, stopping: Arc<AtomicBool>) {
    while let Ok(job) = receiver.recv() {
        if stopping.load(Ordering::Relaxed) || job.cancel_flag.load(Ordering::Relaxed) {
            let _ = job
                .result_tx
                .send(Err(PhysicsError::BuildFailed(format!("{} cancelled", job.id))));
            continue;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(job.work))
            .map_err(|payload| PhysicsError::BuildFailed(panic_message(payload.as_ref())));
        let _ = job.result_tx.send(result);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "optimizer panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) fn wait_for(handle: &mut JobHandle) -> Result<Vec<VoxelBox>> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Some(result) = handle.try_result() {
            return result;
        }
        assert!(std::time::Instant::now() < deadline, "job {} timed out", handle.id);
        thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("job-"));
    }

    #[test]
    fn test_submit_and_poll() {
        let worker = OptimizerWorker::spawn("test-optimizer").unwrap();
        let voxels: Vec<IVec3> = (0..4).map(|x| IVec3::new(x, 0, 0)).collect();
        let mut handle = worker.submit(voxels).unwrap();
        let boxes = wait_for(&mut handle).unwrap();
        assert_eq!(boxes, vec![VoxelBox::new(IVec3::ZERO, IVec3::new(4, 1, 1))]);
        // Result is delivered once
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_panic_becomes_build_failed() {
        let worker = OptimizerWorker::spawn("test-panic").unwrap();
        let mut handle = worker.submit_with(|| panic!("boom")).unwrap();
        match wait_for(&mut handle) {
            Err(PhysicsError::BuildFailed(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
        // Worker survives the panic
        let mut next = worker.submit(vec![IVec3::ZERO]).unwrap();
        assert_eq!(wait_for(&mut next).unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let worker = OptimizerWorker::spawn("test-cancel").unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let mut blocker = worker
            .submit_with(move || {
                let _ = gate_rx.recv();
                Vec::new()
            })
            .unwrap();
        let mut queued = worker.submit(vec![IVec3::ZERO]).unwrap();
        queued.cancel();
        gate_tx.send(()).unwrap();

        assert!(wait_for(&mut blocker).unwrap().is_empty());
        assert!(matches!(wait_for(&mut queued), Err(PhysicsError::BuildFailed(_))));
    }

    #[test]
    fn test_shutdown_refuses_work() {
        let mut worker = OptimizerWorker::spawn("test-shutdown").unwrap();
        worker.shutdown();
        assert!(!worker.is_accepting());
        assert!(matches!(
            worker.submit(vec![IVec3::ZERO]),
            Err(PhysicsError::ShuttingDown)
        ));
    }
}
