//! Live per-job machinery: scheduling state, worker bookkeeping and the
//! in-process event bus.

pub mod event_bus;
pub(crate) mod job_state;

pub use event_bus::InProcEventBus;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::job_state::JobState;
use crate::orchestration::extractor::Extractor;
use crate::orchestration::job::JobStatus;
use crate::orchestration::search::SearchSpec;
use crate::types::{JobId, TaskId};

/// Progress of one job as reported by [`crate::orchestration::Orchestrator::rehydrate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePlan {
    pub job_id: JobId,
    pub status: JobStatus,
    pub completed: Vec<TaskId>,
    /// Tasks that will be dispatched again, in decomposition order.
    pub pending: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub checkpoint_sequence: u64,
}

pub(crate) struct JobRuntime {
    pub job_id: JobId,
    /// Immutable after submission.
    pub spec: SearchSpec,
    pub extractor: Arc<dyn Extractor>,
    pub state: Mutex<JobState>,
    /// Signalled whenever a task is released, requeued or resolved.
    pub wake: Notify,
    /// Lead commits hold the read side; cancellation takes the write side.
    pub commit_gate: RwLock<()>,
    /// Highest checkpoint sequence handed to the store.
    pub last_checkpoint: Mutex<u64>,
    /// Highest job snapshot revision handed to the store.
    pub last_job_revision: Mutex<u64>,
    /// Bounds concurrent workers across pause/resume cycles.
    pub slots: Arc<Semaphore>,
    /// Fires on cancel and shutdown; aborts in-flight extraction.
    pub abort: CancellationToken,
    run: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRuntime")
            .field("job_id", &self.job_id)
            .field("strategy", &self.extractor.capabilities().label())
            .field("free_slots", &self.slots.available_permits())
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

impl JobRuntime {
    pub fn new(
        state: JobState,
        extractor: Arc<dyn Extractor>,
        pool_size: usize,
        parent: &CancellationToken,
    ) -> Self {
        let abort = parent.child_token();
        let run = abort.child_token();
        Self {
            job_id: state.job.id,
            spec: state.job.spec.clone(),
            extractor,
            last_checkpoint: Mutex::new(state.checkpoint_sequence()),
            state: Mutex::new(state),
            wake: Notify::new(),
            commit_gate: RwLock::new(()),
            last_job_revision: Mutex::new(0),
            slots: Arc::new(Semaphore::new(pool_size.max(1))),
            abort,
            run: Mutex::new(run),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts a new run generation and returns its stop token. Pausing
    /// cancels the token; resuming starts a fresh one.
    pub async fn start_run(&self) -> CancellationToken {
        let token = self.abort.child_token();
        let mut run = self.run.lock().await;
        run.cancel();
        *run = token.clone();
        token
    }

    pub async fn stop_run(&self) {
        self.run.lock().await.cancel();
        self.wake.notify_waiters();
    }

    pub async fn track(&self, spawned: Vec<JoinHandle<()>>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|handle| !handle.is_finished());
        handles.extend(spawned);
    }

    pub async fn has_live_workers(&self) -> bool {
        self.handles
            .lock()
            .await
            .iter()
            .any(|handle| !handle.is_finished())
    }

    pub async fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().await)
    }

    pub async fn plan(&self) -> ResumePlan {
        let state = self.state.lock().await;
        ResumePlan {
            job_id: self.job_id,
            status: state.job.status,
            completed: state.completed().iter().copied().collect(),
            pending: state.pending(),
            failed: state.failed().iter().copied().collect(),
            checkpoint_sequence: state.checkpoint_sequence(),
        }
    }
}
