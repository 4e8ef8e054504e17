//! Shared harness for orchestration integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use mapleads_core::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use mapleads_core::config::{EngineConfig, PacingRule};
use mapleads_core::leads::{LeadFields, RawCandidate};
use mapleads_core::orchestration::{
    EngineEvent, ExtractionError, ExtractionRequest, Extractor, ExtractorCapabilities,
    ExtractorRegistry, FieldSelection, InProcEventBus, JobStatus, Orchestrator, OrchestratorParts,
    TaskTarget,
};
use mapleads_core::persistence::{InMemoryJobStore, InMemoryLeadStore};
use mapleads_core::types::{JobId, ProxyId, TaskId};

pub type TestOrchestrator<C = InMemoryCheckpointStore> =
    Orchestrator<InMemoryJobStore, InMemoryLeadStore, C, InProcEventBus>;

type Script =
    dyn Fn(&ExtractionRequest, u32) -> Result<Vec<LeadFields>, ExtractionError> + Send + Sync;

/// Extractor driven by a closure of (request, nth call for this task).
pub struct ScriptedExtractor {
    script: Box<Script>,
    delay: Duration,
    /// Calls past this count never return.
    hang_after: Option<usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_task: Mutex<HashMap<TaskId, u32>>,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl ScriptedExtractor {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ExtractionRequest, u32) -> Result<Vec<LeadFields>, ExtractionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            hang_after: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            per_task: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// One business per location, keyed by the location name.
    pub fn one_per_location() -> Self {
        Self::new(|request, _| Ok(vec![business_for(request)]))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn hang_after(mut self, calls: usize) -> Self {
        self.hang_after = Some(calls);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn capabilities(&self) -> ExtractorCapabilities {
        ExtractorCapabilities {
            name: "scripted".into(),
            strategy_version: 1,
            supports_grid: true,
            fields: FieldSelection::all(),
        }
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<RawCandidate>, ExtractionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let nth = {
            let mut per_task = self.per_task.lock().expect("per-task lock");
            let count = per_task.entry(request.task_id).or_default();
            *count += 1;
            *count
        };
        if self.hang_after.is_some_and(|limit| call > limit) {
            futures::future::pending::<()>().await;
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fields = (self.script)(request, nth)?;
        Ok(fields
            .into_iter()
            .map(|fields| RawCandidate::new(request.task_id, fields))
            .collect())
    }
}

pub fn location(request: &ExtractionRequest) -> String {
    match &request.target {
        TaskTarget::Location { location, .. } => location.clone(),
        TaskTarget::GridCell { row, col, .. } => format!("cell {row}x{col}"),
    }
}

/// A distinct business for the request's location.
pub fn business_for(request: &ExtractionRequest) -> LeadFields {
    let place = location(request);
    LeadFields {
        business_name: format!("{place} Fitness Studio"),
        city: Some(place.clone()),
        place_id: Some(format!("place-{}", place.to_lowercase().replace(' ', "-"))),
        ..LeadFields::default()
    }
}

/// Defaults with pacing, backoff and polling shrunk so jobs finish in
/// milliseconds.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers.pool_size = 2;
    config.workers.idle_poll_ms = 5;
    config.workers.extract_timeout_ms = 2_000;
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 10;
    config.retry.persistence_backoff_ms = 1;
    config.pacing.global = PacingRule::unrestricted();
    config.pacing.per_proxy = PacingRule::unrestricted();
    config.pacing.per_worker = PacingRule::unrestricted();
    config.proxy.allow_direct = true;
    config
}

pub struct Stores<C = InMemoryCheckpointStore> {
    pub jobs: Arc<InMemoryJobStore>,
    pub leads: Arc<InMemoryLeadStore>,
    pub checkpoints: Arc<C>,
}

impl<C> Clone for Stores<C> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            leads: Arc::clone(&self.leads),
            checkpoints: Arc::clone(&self.checkpoints),
        }
    }
}

impl Stores<InMemoryCheckpointStore> {
    pub fn in_memory() -> Self {
        Self::with_checkpoints(InMemoryCheckpointStore::new())
    }
}

impl<C> Stores<C> {
    pub fn with_checkpoints(checkpoints: C) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            leads: Arc::new(InMemoryLeadStore::new()),
            checkpoints: Arc::new(checkpoints),
        }
    }
}

pub struct Harness<C = InMemoryCheckpointStore> {
    pub orchestrator: TestOrchestrator<C>,
    pub stores: Stores<C>,
    pub events: Arc<InProcEventBus>,
    pub extractor: Arc<ScriptedExtractor>,
}

impl<C: CheckpointStore + 'static> Harness<C> {
    pub async fn start(
        config: EngineConfig,
        stores: Stores<C>,
        extractor: ScriptedExtractor,
        proxies: Vec<ProxyId>,
    ) -> Self {
        let extractor = Arc::new(extractor);
        let events = Arc::new(InProcEventBus::new(4096));
        let orchestrator = Orchestrator::new(
            config,
            OrchestratorParts {
                job_store: Arc::clone(&stores.jobs),
                lead_store: Arc::clone(&stores.leads),
                checkpoints: Arc::clone(&stores.checkpoints),
                events: Arc::clone(&events),
                extractors: ExtractorRegistry::new().with(extractor.clone()),
                proxies,
            },
        )
        .await
        .expect("orchestrator");
        Self {
            orchestrator,
            stores,
            events,
            extractor,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn wait_for_status(
        &self,
        job_id: JobId,
        done: impl Fn(JobStatus) -> bool,
    ) -> JobStatus {
        let mut rx = self.orchestrator.watch(job_id).await.expect("watch job");
        let status = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| done(*s)))
            .await
            .expect("timed out waiting for job status")
            .expect("status channel closed");
        *status
    }

    pub async fn run_to_end(&self, job_id: JobId) -> JobStatus {
        self.wait_for_status(job_id, JobStatus::is_terminal).await
    }
}

impl Harness<InMemoryCheckpointStore> {
    pub async fn direct(extractor: ScriptedExtractor) -> Self {
        Self::start(fast_config(), Stores::in_memory(), extractor, Vec::new()).await
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects events until one satisfies `last`, which is included.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<EngineEvent>,
    last: impl Fn(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let collect = async {
        loop {
            let event = rx.recv().await.expect("event stream");
            let done = last(&event);
            events.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("timed out waiting for event");
    events
}
