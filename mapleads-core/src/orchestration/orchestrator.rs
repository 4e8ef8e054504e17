//! Job lifecycle: submission, control, resume and shutdown.
//!
//! The orchestrator owns one [`JobRuntime`] per loaded job. Workers run as
//! tokio tasks bounded by the job's semaphore; see `worker.rs` for the
//! dispatch loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventSink, JobUpdate};
use super::extractor::{ExtractionRequirements, ExtractorRegistry};
use super::job::{JobCondition, JobCounts, JobStatus, ScrapeJob};
use super::retry::RetryPolicy;
use super::runtime::job_state::{JobSnapshot, JobState};
use super::runtime::{JobRuntime, ResumePlan};
use super::search::SearchSpec;
use super::task::{SearchTask, TaskStatus, decompose};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::EngineConfig;
use crate::dedup::DedupEngine;
use crate::error::{EngineError, Result};
use crate::pacing::PacingController;
use crate::persistence::{JobStore, LeadStore};
use crate::proxy::ProxyHealthManager;
use crate::types::{JobId, ProxyId};

/// Collaborators handed to [`Orchestrator::new`].
pub struct OrchestratorParts<J, L, C, E> {
    pub job_store: Arc<J>,
    pub lead_store: Arc<L>,
    pub checkpoints: Arc<C>,
    pub events: Arc<E>,
    pub extractors: ExtractorRegistry,
    /// Egress endpoints. Empty means direct egress when the proxy config
    /// allows it, otherwise every job pauses with `NoHealthyProxy`.
    pub proxies: Vec<ProxyId>,
}

pub(crate) struct Shared<J, L, C, E> {
    pub config: EngineConfig,
    pub retry: RetryPolicy,
    pub job_store: Arc<J>,
    pub checkpoints: Arc<C>,
    pub events: Arc<E>,
    pub dedup: Arc<DedupEngine<L>>,
    pub pacing: Arc<PacingController>,
    pub proxies: Arc<ProxyHealthManager>,
    pub extractors: ExtractorRegistry,
    pub jobs: DashMap<JobId, Arc<JobRuntime>>,
    pub shutdown: CancellationToken,
}

pub struct Orchestrator<J, L, C, E> {
    shared: Arc<Shared<J, L, C, E>>,
}

impl<J, L, C, E> Clone for Orchestrator<J, L, C, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J, L, C, E> fmt::Debug for Orchestrator<J, L, C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("jobs_loaded", &self.shared.jobs.len())
            .field("pool_size", &self.shared.config.workers.pool_size)
            .field("shutdown", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

impl<J, L, C, E> Orchestrator<J, L, C, E>
where
    J: JobStore + 'static,
    L: LeadStore + 'static,
    C: CheckpointStore + 'static,
    E: EventSink + 'static,
{
    /// Builds the engine and loads the dedup index from the lead store.
    pub async fn new(config: EngineConfig, parts: OrchestratorParts<J, L, C, E>) -> Result<Self> {
        let dedup = Arc::new(DedupEngine::new(config.dedup.clone(), parts.lead_store));
        let indexed = dedup.hydrate().await?;
        let proxies = Arc::new(ProxyHealthManager::new(config.proxy, parts.proxies));
        let pacing = Arc::new(PacingController::new(config.pacing.clone()));
        info!(
            target: "mapleads::orchestrator",
            leads_indexed = indexed,
            proxies = proxies.len(),
            pool_size = config.workers.pool_size,
            "orchestrator ready"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                retry: RetryPolicy::new(config.retry),
                config,
                job_store: parts.job_store,
                checkpoints: parts.checkpoints,
                events: parts.events,
                dedup,
                pacing,
                proxies,
                extractors: parts.extractors,
                jobs: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn pacing(&self) -> &Arc<PacingController> {
        &self.shared.pacing
    }

    pub fn proxies(&self) -> &Arc<ProxyHealthManager> {
        &self.shared.proxies
    }

    pub fn dedup(&self) -> &Arc<DedupEngine<L>> {
        &self.shared.dedup
    }

    pub fn events(&self) -> &Arc<E> {
        &self.shared.events
    }

    /// Validates and decomposes `spec`, persists the job with its tasks and
    /// starts the worker pool.
    pub async fn submit(&self, spec: SearchSpec) -> Result<JobId> {
        spec.validate()?;
        if self.shared.shutdown.is_cancelled() {
            return Err(EngineError::Cancelled("orchestrator is shut down".into()));
        }
        let requirements = ExtractionRequirements {
            needs_grid: spec.grid.is_some(),
            fields: spec.fields,
            min_version: None,
        };
        let extractor = self.shared.extractors.negotiate(&requirements).ok_or_else(|| {
            EngineError::InvalidSpec("no registered extractor satisfies the search".into())
        })?;

        let mut job = ScrapeJob::new(spec);
        job.strategy = Some(extractor.capabilities().label());
        let tasks = decompose(job.id, &job.spec);
        job.counts.tasks_total = tasks.len() as u64;

        let shared = &self.shared;
        shared
            .persist("insert job", || shared.job_store.upsert_job(&job))
            .await?;
        shared
            .persist("insert tasks", || shared.job_store.insert_tasks(job.id, &tasks))
            .await?;

        let job_id = job.id;
        let mut state = JobState::new(job, tasks, 0);
        state.transition(JobStatus::Running)?;
        let snapshot = state.snapshot();
        let runtime = Arc::new(JobRuntime::new(
            state,
            extractor,
            shared.config.workers.pool_size,
            &shared.shutdown,
        ));
        shared.jobs.insert(job_id, Arc::clone(&runtime));

        shared.persist_job(&runtime, &snapshot).await?;
        info!(
            target: "mapleads::orchestrator",
            %job_id,
            tasks = snapshot.job.counts.tasks_total,
            strategy = snapshot.job.strategy.as_deref().unwrap_or_default(),
            "job submitted"
        );
        shared.publish_update(&snapshot.job).await;
        self.spawn_workers(&runtime).await;
        Ok(job_id)
    }

    /// Current job record, from memory when loaded, otherwise from the store.
    pub async fn status(&self, job_id: JobId) -> Result<ScrapeJob> {
        if let Some(runtime) = self.loaded(job_id) {
            return Ok(runtime.state.lock().await.job.clone());
        }
        self.load_job(job_id).await
    }

    pub async fn tasks(&self, job_id: JobId) -> Result<Vec<SearchTask>> {
        if let Some(runtime) = self.loaded(job_id) {
            return Ok(runtime.state.lock().await.tasks());
        }
        self.shared.job_store.list_tasks(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<ScrapeJob>> {
        let mut jobs = self.shared.job_store.list_jobs().await?;
        for job in &mut jobs {
            if let Some(runtime) = self.loaded(job.id) {
                *job = runtime.state.lock().await.job.clone();
            }
        }
        Ok(jobs)
    }

    /// Status changes of a job. Loads the job if needed.
    pub async fn watch(&self, job_id: JobId) -> Result<watch::Receiver<JobStatus>> {
        let runtime = self.runtime(job_id).await?;
        let state = runtime.state.lock().await;
        Ok(state.subscribe())
    }

    /// Stops dispatching new tasks. In-flight tasks finish and are recorded.
    pub async fn pause(&self, job_id: JobId) -> Result<ScrapeJob> {
        let runtime = self.runtime(job_id).await?;
        let snapshot = {
            let mut state = runtime.state.lock().await;
            state.pause(JobCondition::Manual)?;
            state.snapshot()
        };
        runtime.stop_run().await;
        self.shared.persist_job(&runtime, &snapshot).await?;
        info!(target: "mapleads::orchestrator", %job_id, "job paused");
        self.shared.publish_update(&snapshot.job).await;
        Ok(snapshot.job)
    }

    pub async fn resume(&self, job_id: JobId) -> Result<ScrapeJob> {
        let runtime = self.runtime(job_id).await?;
        let snapshot = {
            let mut state = runtime.state.lock().await;
            if state.job.status != JobStatus::Paused {
                return Err(EngineError::InvalidTransition(format!(
                    "job {job_id} is {:?}, only paused jobs can be resumed",
                    state.job.status
                )));
            }
            state.transition(JobStatus::Running)?;
            state.snapshot()
        };
        self.shared.persist_job(&runtime, &snapshot).await?;
        info!(target: "mapleads::orchestrator", %job_id, "job resumed");
        self.shared.publish_update(&snapshot.job).await;
        self.spawn_workers(&runtime).await;
        Ok(snapshot.job)
    }

    /// Terminal. Waits for lead commits already underway, then aborts
    /// in-flight extraction; nothing is committed or checkpointed afterwards.
    pub async fn cancel(&self, job_id: JobId) -> Result<ScrapeJob> {
        let Some(runtime) = self.loaded(job_id) else {
            let mut job = self.load_job(job_id).await?;
            job.transition(JobStatus::Cancelled)?;
            let shared = &self.shared;
            shared
                .persist("cancel job", || shared.job_store.upsert_job(&job))
                .await?;
            shared.publish_update(&job).await;
            return Ok(job);
        };

        let snapshot = {
            let _gate = runtime.commit_gate.write().await;
            let mut state = runtime.state.lock().await;
            state.transition(JobStatus::Cancelled)?;
            state.snapshot()
        };
        runtime.abort.cancel();
        runtime.wake.notify_waiters();
        self.shared.persist_job(&runtime, &snapshot).await?;
        info!(target: "mapleads::orchestrator", %job_id, "job cancelled");
        self.shared.publish_update(&snapshot.job).await;
        Ok(snapshot.job)
    }

    /// Removes a terminal job, its tasks and its checkpoint. Leads stay.
    pub async fn delete(&self, job_id: JobId) -> Result<()> {
        let job = self.status(job_id).await?;
        if !job.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "job {job_id} is {:?}; cancel it before deleting",
                job.status
            )));
        }
        if let Some((_, runtime)) = self.shared.jobs.remove(&job_id) {
            runtime.abort.cancel();
            for handle in runtime.take_handles().await {
                let _ = handle.await;
            }
        }
        self.shared.checkpoints.delete(job_id).await?;
        self.shared.job_store.delete_job(job_id).await?;
        info!(target: "mapleads::orchestrator", %job_id, "job deleted");
        Ok(())
    }

    /// Loads a job from the stores (if not loaded) and reports which tasks
    /// are done and which will run again. Does not start workers.
    pub async fn rehydrate(&self, job_id: JobId) -> Result<ResumePlan> {
        let runtime = self.runtime(job_id).await?;
        Ok(runtime.plan().await)
    }

    /// Startup recovery: loads every non-terminal job and restarts the ones
    /// that were pending or running without live workers. Paused jobs stay
    /// paused.
    pub async fn recover(&self) -> Result<Vec<ResumePlan>> {
        let mut plans = Vec::new();
        for job in self.shared.job_store.list_jobs().await? {
            if job.status.is_terminal() {
                continue;
            }
            if let Some(runtime) = self.loaded(job.id)
                && runtime.has_live_workers().await
            {
                continue;
            }
            let runtime = self.runtime(job.id).await?;
            let restart = {
                let mut state = runtime.state.lock().await;
                match state.job.status {
                    JobStatus::Pending => {
                        state.transition(JobStatus::Running)?;
                        Some(state.snapshot())
                    }
                    JobStatus::Running => Some(state.snapshot()),
                    _ => None,
                }
            };
            if let Some(snapshot) = restart {
                self.shared.persist_job(&runtime, &snapshot).await?;
                self.spawn_workers(&runtime).await;
            }
            let plan = runtime.plan().await;
            info!(
                target: "mapleads::orchestrator",
                job_id = %plan.job_id,
                status = ?plan.status,
                completed = plan.completed.len(),
                pending = plan.pending.len(),
                "job recovered"
            );
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Stops every worker and aborts in-flight extraction without touching
    /// stored state. The orchestrator accepts no work afterwards.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let runtimes: Vec<Arc<JobRuntime>> = self
            .shared
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for runtime in runtimes {
            runtime.wake.notify_waiters();
            for handle in runtime.take_handles().await {
                let _ = handle.await;
            }
        }
        info!(target: "mapleads::orchestrator", "orchestrator shut down");
    }

    fn loaded(&self, job_id: JobId) -> Option<Arc<JobRuntime>> {
        self.shared
            .jobs
            .get(&job_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn load_job(&self, job_id: JobId) -> Result<ScrapeJob> {
        self.shared
            .job_store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))
    }

    async fn runtime(&self, job_id: JobId) -> Result<Arc<JobRuntime>> {
        if let Some(runtime) = self.loaded(job_id) {
            return Ok(runtime);
        }
        let runtime = Arc::new(self.restore(job_id).await?);
        let entry = self.shared.jobs.entry(job_id).or_insert(runtime);
        Ok(Arc::clone(entry.value()))
    }

    /// Rebuilds a job's runtime from the job store and its latest checkpoint.
    /// The checkpoint wins over task records: tasks it lists as completed or
    /// failed keep that status, every other task is dispatched again.
    async fn restore(&self, job_id: JobId) -> Result<JobRuntime> {
        let shared = &self.shared;
        let mut job = self.load_job(job_id).await?;
        let mut tasks = shared.job_store.list_tasks(job_id).await?;
        if tasks.is_empty() {
            tasks = decompose(job.id, &job.spec);
            shared.job_store.insert_tasks(job_id, &tasks).await?;
        }
        let checkpoint = shared.checkpoints.load(job_id).await?;

        let mut changed = Vec::new();
        for task in &mut tasks {
            let restored = restored_status(task, checkpoint.as_ref());
            if task.status == restored {
                continue;
            }
            if task.status == TaskStatus::Done {
                warn!(
                    target: "mapleads::orchestrator",
                    %job_id,
                    task_id = %task.id,
                    "task stored as done but missing from checkpoint; running it again"
                );
            }
            task.status = restored;
            task.assigned_proxy = None;
            changed.push(task.clone());
        }
        for task in &changed {
            shared.job_store.upsert_task(task).await?;
        }

        job.counts = checkpoint
            .as_ref()
            .map(|checkpoint| checkpoint.counts)
            .unwrap_or_default();
        let sequence = checkpoint.as_ref().map_or(0, |c| c.sequence);

        let requirements = ExtractionRequirements {
            needs_grid: job.spec.grid.is_some(),
            fields: job.spec.fields,
            min_version: None,
        };
        let extractor = shared.extractors.negotiate(&requirements).ok_or_else(|| {
            EngineError::InvalidSpec(format!("no registered extractor can resume job {job_id}"))
        })?;
        job.strategy = Some(extractor.capabilities().label());

        let state = JobState::new(job, tasks, sequence);
        debug!(
            target: "mapleads::orchestrator",
            %job_id,
            checkpoint_sequence = sequence,
            requeued = changed.len(),
            "job state restored"
        );
        Ok(JobRuntime::new(
            state,
            extractor,
            shared.config.workers.pool_size,
            &shared.shutdown,
        ))
    }

    async fn spawn_workers(&self, runtime: &Arc<JobRuntime>) {
        let stop = runtime.start_run().await;
        let handles = (0..self.shared.config.workers.pool_size.max(1))
            .map(|slot| {
                let shared = Arc::clone(&self.shared);
                let runtime = Arc::clone(runtime);
                let stop = stop.clone();
                tokio::spawn(async move { shared.run_worker(runtime, slot, stop).await })
            })
            .collect();
        runtime.track(handles).await;
    }
}

fn restored_status(task: &SearchTask, checkpoint: Option<&Checkpoint>) -> TaskStatus {
    match checkpoint {
        Some(cp) if cp.completed.contains(&task.id) => TaskStatus::Done,
        Some(cp) if cp.failed.contains(&task.id) => TaskStatus::Failed,
        _ if task.dispatches > 0 => TaskStatus::Requeued,
        _ => TaskStatus::Queued,
    }
}

impl<J, L, C, E> Shared<J, L, C, E>
where
    J: JobStore + 'static,
    L: LeadStore + 'static,
    C: CheckpointStore + 'static,
    E: EventSink + 'static,
{
    /// Retries store writes that fail with a persistence error, with
    /// doubling backoff, up to the configured attempt count.
    pub(crate) async fn persist<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.retry.persistence_attempts.max(1);
        let mut delay = self.config.retry.persistence_backoff();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_persistence() && attempt < attempts => {
                    warn!(
                        target: "mapleads::orchestrator",
                        what,
                        attempt,
                        error = %err,
                        "store write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the job record unless a newer snapshot already went out.
    pub(crate) async fn persist_job(&self, runtime: &JobRuntime, snapshot: &JobSnapshot) -> Result<()> {
        let mut last = runtime.last_job_revision.lock().await;
        if snapshot.revision <= *last {
            return Ok(());
        }
        self.persist("job", || self.job_store.upsert_job(&snapshot.job))
            .await?;
        *last = snapshot.revision;
        Ok(())
    }

    /// Saves a checkpoint in sequence order. Older snapshots are dropped.
    pub(crate) async fn write_checkpoint(&self, runtime: &JobRuntime, checkpoint: &Checkpoint) -> Result<()> {
        let mut last = runtime.last_checkpoint.lock().await;
        if checkpoint.sequence <= *last {
            return Ok(());
        }
        let stored = self
            .persist("checkpoint", || self.checkpoints.save(checkpoint))
            .await?;
        if !stored {
            debug!(
                target: "mapleads::orchestrator",
                job_id = %checkpoint.job_id,
                sequence = checkpoint.sequence,
                "store already holds a newer checkpoint"
            );
        }
        *last = checkpoint.sequence;
        Ok(())
    }

    /// Best-effort: sink errors are logged, never propagated.
    pub(crate) async fn publish(&self, event: EngineEvent) {
        let job_id = event.job_id();
        if let Err(err) = self.events.publish(event).await {
            warn!(target: "mapleads::events", %job_id, error = %err, "event publish failed");
        }
    }

    pub(crate) async fn publish_update(&self, job: &ScrapeJob) {
        self.publish(EngineEvent::JobUpdate(JobUpdate {
            job_id: job.id,
            status: job.status,
            counts: job.counts,
            at: Utc::now(),
        }))
        .await;
    }

    pub(crate) fn counts_summary(counts: &JobCounts) -> String {
        format!(
            "{} leads, {} duplicates, {} flagged, {}/{} tasks done, {} failed",
            counts.scraped,
            counts.duplicates,
            counts.flagged,
            counts.tasks_done,
            counts.tasks_total,
            counts.tasks_failed
        )
    }
}
