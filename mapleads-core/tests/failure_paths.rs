//! Store outages and cancels racing a task resolution.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use mapleads_core::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use mapleads_core::dedup::ReviewItem;
use mapleads_core::orchestration::{
    EngineEvent, ExtractionError, ExtractionRequest, Extractor, ExtractorCapabilities,
    ExtractorRegistry, FieldSelection, InProcEventBus, JobCondition, JobStatus, Orchestrator,
    OrchestratorParts, ScrapeJob, SearchSpec, SearchTask, TaskStatus,
};
use mapleads_core::persistence::{InMemoryJobStore, InMemoryLeadStore, JobStore, LeadStore};
use mapleads_core::types::{JobId, LeadId, TaskId};
use mapleads_core::{EngineError, Lead, RawCandidate, Result};

use support::{ScriptedExtractor, collect_until, fast_config};

/// Lead store that rejects every write.
#[derive(Debug, Default)]
struct RejectingLeads {
    inner: InMemoryLeadStore,
    writes: AtomicU32,
}

#[async_trait]
impl LeadStore for RejectingLeads {
    async fn upsert_lead(&self, _lead: &Lead) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Persistence("disk full".into()))
    }

    async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
        self.inner.get_lead(id).await
    }

    async fn list_leads(&self) -> Result<Vec<Lead>> {
        self.inner.list_leads().await
    }

    async fn leads_for_job(&self, job_id: JobId) -> Result<Vec<Lead>> {
        self.inner.leads_for_job(job_id).await
    }

    async fn add_review(&self, item: &ReviewItem) -> Result<()> {
        self.inner.add_review(item).await
    }

    async fn list_reviews(&self) -> Result<Vec<ReviewItem>> {
        self.inner.list_reviews().await
    }
}

/// Job store whose task upserts fail; everything else goes through.
#[derive(Debug, Default)]
struct RejectingTaskWrites {
    inner: InMemoryJobStore,
    writes: AtomicU32,
}

#[async_trait]
impl JobStore for RejectingTaskWrites {
    async fn upsert_job(&self, job: &ScrapeJob) -> Result<()> {
        self.inner.upsert_job(job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<ScrapeJob>> {
        self.inner.list_jobs().await
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        self.inner.delete_job(id).await
    }

    async fn insert_tasks(&self, job_id: JobId, tasks: &[SearchTask]) -> Result<()> {
        self.inner.insert_tasks(job_id, tasks).await
    }

    async fn upsert_task(&self, _task: &SearchTask) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Persistence("connection reset".into()))
    }

    async fn get_task(&self, job_id: JobId, task_id: TaskId) -> Result<Option<SearchTask>> {
        self.inner.get_task(job_id, task_id).await
    }

    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<SearchTask>> {
        self.inner.list_tasks(job_id).await
    }
}

/// Hands every request to the test and fails with "not found" once released.
struct HandOff {
    requests: mpsc::UnboundedSender<(JobId, oneshot::Sender<()>)>,
}

#[async_trait]
impl Extractor for HandOff {
    fn capabilities(&self) -> ExtractorCapabilities {
        ExtractorCapabilities {
            name: "hand-off".into(),
            strategy_version: 1,
            supports_grid: false,
            fields: FieldSelection::all(),
        }
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> std::result::Result<Vec<RawCandidate>, ExtractionError> {
        let (release, released) = oneshot::channel();
        let _ = self.requests.send((request.job_id, release));
        let _ = released.await;
        Err(ExtractionError::not_found("no results for query"))
    }
}

async fn orchestrator<J, L>(
    jobs: Arc<J>,
    leads: Arc<L>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    events: Arc<InProcEventBus>,
    extractor: Arc<dyn Extractor>,
) -> Orchestrator<J, L, InMemoryCheckpointStore, InProcEventBus>
where
    J: JobStore + 'static,
    L: LeadStore + 'static,
{
    let mut config = fast_config();
    config.retry.persistence_attempts = 3;
    Orchestrator::new(
        config,
        OrchestratorParts {
            job_store: jobs,
            lead_store: leads,
            checkpoints,
            events,
            extractors: ExtractorRegistry::new().with(extractor),
            proxies: Vec::new(),
        },
    )
    .await
    .expect("orchestrator")
}

#[tokio::test]
async fn failing_lead_writes_pause_the_job_and_requeue_the_task() {
    let leads = Arc::new(RejectingLeads::default());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let events = Arc::new(InProcEventBus::new(256));
    let mut rx = events.subscribe();
    let orchestrator = orchestrator(
        Arc::new(InMemoryJobStore::new()),
        leads.clone(),
        checkpoints.clone(),
        events,
        Arc::new(ScriptedExtractor::one_per_location()),
    )
    .await;

    let job_id = orchestrator
        .submit(SearchSpec::keyword("gyms", "Pune"))
        .await
        .expect("submit");
    let events = collect_until(&mut rx, |e| matches!(e, EngineEvent::JobAlert { .. })).await;

    let Some(EngineEvent::JobAlert { condition, .. }) = events.last() else {
        panic!("expected an alert, got {events:?}");
    };
    assert!(matches!(condition, JobCondition::PersistenceFailure { .. }));
    assert_eq!(leads.writes.load(Ordering::SeqCst), 3);

    let job = orchestrator.status(job_id).await.expect("status");
    assert_eq!(job.status, JobStatus::Paused);
    assert!(matches!(
        job.condition,
        Some(JobCondition::PersistenceFailure { ref message }) if message.contains("disk full")
    ));
    assert_eq!(job.counts.tasks_done, 0);
    assert_eq!(job.counts.scraped, 0);

    let tasks = orchestrator.tasks(job_id).await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Requeued);
    assert!(
        checkpoints
            .load(job_id)
            .await
            .expect("checkpoint")
            .is_none_or(|cp| cp.completed.is_empty())
    );

    // Paused: no more attempts pile up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(leads.writes.load(Ordering::SeqCst), 3);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn failing_dispatch_record_pauses_before_extraction() {
    let jobs = Arc::new(RejectingTaskWrites::default());
    let extractor = Arc::new(ScriptedExtractor::one_per_location());
    let events = Arc::new(InProcEventBus::new(256));
    let mut rx = events.subscribe();
    let orchestrator = orchestrator(
        jobs.clone(),
        Arc::new(InMemoryLeadStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        events,
        extractor.clone(),
    )
    .await;

    let job_id = orchestrator
        .submit(SearchSpec::keyword("gyms", "Nagpur"))
        .await
        .expect("submit");
    collect_until(&mut rx, |e| {
        matches!(
            e,
            EngineEvent::JobAlert {
                condition: JobCondition::PersistenceFailure { .. },
                ..
            }
        )
    })
    .await;

    assert_eq!(jobs.writes.load(Ordering::SeqCst), 3);
    assert_eq!(extractor.calls(), 0);
    let job = orchestrator.status(job_id).await.expect("status");
    assert_eq!(job.status, JobStatus::Paused);
    let tasks = orchestrator.tasks(job_id).await.expect("tasks");
    assert_eq!(tasks[0].status, TaskStatus::Requeued);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn failure_resolved_after_cancel_writes_nothing() {
    let (requests, mut handoffs) = mpsc::unbounded_channel();
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let orchestrator = orchestrator(
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryLeadStore::new()),
        checkpoints.clone(),
        Arc::new(InProcEventBus::new(256)),
        Arc::new(HandOff { requests }),
    )
    .await;

    // Each job's only task fails right after its cancel returns. The worker
    // sees either the abort or the failure first, so run enough jobs to hit both.
    let mut cancelled = Vec::new();
    for n in 0..20 {
        let job_id = orchestrator
            .submit(SearchSpec::keyword("gyms", format!("Town {n}")))
            .await
            .expect("submit");
        let (seen, release) = tokio::time::timeout(Duration::from_secs(5), handoffs.recv())
            .await
            .expect("dispatch")
            .expect("extractor channel");
        assert_eq!(seen, job_id);
        let job = orchestrator.cancel(job_id).await.expect("cancel");
        assert_eq!(job.status, JobStatus::Cancelled);
        let _ = release.send(());
        cancelled.push(job_id);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.shutdown().await;

    for job_id in cancelled {
        let checkpoint = checkpoints.load(job_id).await.expect("checkpoint");
        assert!(
            checkpoint.is_none_or(|cp| cp.completed.is_empty()),
            "job {job_id} checkpointed after cancel"
        );
        let job = orchestrator.status(job_id).await.expect("status");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.counts.tasks_done, 0);
        let tasks = orchestrator.tasks(job_id).await.expect("tasks");
        assert!(tasks.iter().all(|task| task.status != TaskStatus::Done));
    }
}
