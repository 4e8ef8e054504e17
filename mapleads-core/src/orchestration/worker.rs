//! Worker loop: claim a task, pick an egress endpoint, wait for pacing,
//! extract, then deduplicate and commit or route the error through the
//! retry policy.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{EngineEvent, EventSink};
use super::extractor::{ExtractionError, ExtractionErrorKind, ExtractionRequest};
use super::job::{JobCondition, JobStatus};
use super::orchestrator::Shared;
use super::retry::RetryDecision;
use super::runtime::JobRuntime;
use super::runtime::job_state::{Claim, CommitTally, Effects};
use super::task::SearchTask;
use crate::checkpoint::CheckpointStore;
use crate::dedup::Classification;
use crate::error::EngineError;
use crate::leads::RawCandidate;
use crate::pacing::PacingScope;
use crate::persistence::{JobStore, LeadStore};
use crate::proxy::{FailureKind, ProxyHint};
use crate::types::{ProxyId, WorkerId};

impl<J, L, C, E> Shared<J, L, C, E>
where
    J: JobStore + 'static,
    L: LeadStore + 'static,
    C: CheckpointStore + 'static,
    E: EventSink + 'static,
{
    pub(crate) async fn run_worker(
        &self,
        runtime: Arc<JobRuntime>,
        slot: usize,
        stop: CancellationToken,
    ) {
        let worker = WorkerId::new(runtime.job_id, slot);
        let _permit = tokio::select! {
            permit = Arc::clone(&runtime.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = stop.cancelled() => return,
        };
        debug!(target: "mapleads::worker", %worker, "worker started");

        while !stop.is_cancelled() {
            // Registered before claiming so a wake between the claim and the
            // wait is not lost.
            let notified = runtime.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim = runtime.state.lock().await.claim(Instant::now());
            match claim {
                Claim::Stopped => break,
                Claim::Drained => {
                    self.finalize_if_done(&runtime).await;
                    break;
                }
                Claim::Wait(hint) => {
                    let idle = hint.unwrap_or_else(|| self.config.workers.idle_poll());
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Claim::Task { task, avoid } => {
                    self.execute(&runtime, &worker, task, avoid, &stop).await;
                    runtime.wake.notify_waiters();
                }
            }
        }
        self.pacing.forget(&PacingScope::Worker(worker.clone()));
        debug!(target: "mapleads::worker", %worker, "worker stopped");
    }

    async fn execute(
        &self,
        runtime: &JobRuntime,
        worker: &WorkerId,
        task: SearchTask,
        avoid: Option<ProxyId>,
        stop: &CancellationToken,
    ) {
        let hint = ProxyHint {
            prefer: None,
            avoid: avoid.iter().cloned().collect(),
        };
        let proxy = match self.proxies.next_healthy(&hint).await {
            Ok(proxy) => proxy,
            Err(none) => {
                runtime.state.lock().await.release(task.id, avoid);
                match none.retry_after {
                    None => {
                        self.auto_pause(runtime, JobCondition::NoHealthyProxy).await;
                    }
                    Some(wait) => {
                        let wait = wait.min(self.pacing.config().cooldown_ceiling());
                        debug!(
                            target: "mapleads::worker",
                            %worker,
                            wait_ms = wait.as_millis() as u64,
                            "every proxy is cooling down"
                        );
                        tokio::select! {
                            _ = stop.cancelled() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
                return;
            }
        };

        let scopes = [
            PacingScope::Global,
            PacingScope::Proxy(proxy.id.clone()),
            PacingScope::Worker(worker.clone()),
        ];
        if !self.pacing.wait_for_grant(&scopes, stop).await {
            runtime.state.lock().await.release(task.id, avoid);
            return;
        }

        let dispatched = {
            let mut state = runtime.state.lock().await;
            if state.job.status != JobStatus::Running {
                state.release(task.id, avoid);
                return;
            }
            match state.mark_dispatched(task.id, Some(proxy.id.clone())) {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    error!(target: "mapleads::worker", task_id = %task.id, error = %err, "dispatch rejected");
                    state.release(task.id, avoid);
                    return;
                }
            }
        };

        if let Err(err) = self
            .persist("task", || self.job_store.upsert_task(&dispatched))
            .await
        {
            runtime.state.lock().await.abandon(dispatched.id);
            self.auto_pause(
                runtime,
                JobCondition::PersistenceFailure {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }

        let request = ExtractionRequest {
            job_id: runtime.job_id,
            task_id: dispatched.id,
            target: dispatched.target.clone(),
            proxy: (!proxy.id.is_direct()).then(|| proxy.clone()),
            fields: runtime.spec.fields,
            attempt: dispatched.dispatches,
        };
        debug!(
            target: "mapleads::worker",
            %worker,
            task_id = %dispatched.id,
            key = %dispatched.key,
            proxy = %proxy.id,
            attempt = dispatched.dispatches,
            "dispatching task"
        );

        let timeout = self.config.workers.extract_timeout();
        let result = tokio::select! {
            _ = runtime.abort.cancelled() => {
                runtime.state.lock().await.abandon(dispatched.id);
                return;
            }
            result = tokio::time::timeout(timeout, runtime.extractor.extract(&request)) => {
                result.unwrap_or_else(|_| {
                    Err(ExtractionError::timeout(format!(
                        "no response within {} ms",
                        timeout.as_millis()
                    )))
                })
            }
        };

        match result {
            Ok(candidates) => {
                self.on_success(runtime, worker, &dispatched, &proxy.id, candidates)
                    .await
            }
            Err(err) => self.on_failure(runtime, worker, &dispatched, &proxy.id, err).await,
        }
    }

    async fn on_success(
        &self,
        runtime: &JobRuntime,
        worker: &WorkerId,
        task: &SearchTask,
        proxy: &ProxyId,
        candidates: Vec<RawCandidate>,
    ) {
        self.proxies.report_success(proxy).await;
        self.pacing
            .record_success(&PacingScope::Proxy(proxy.clone()))
            .await;
        self.pacing
            .record_success(&PacingScope::Worker(worker.clone()))
            .await;

        let _gate = runtime.commit_gate.read().await;
        if runtime.state.lock().await.job.status == JobStatus::Cancelled {
            return;
        }

        let spec = &runtime.spec;
        let received = candidates.len();
        let mut tally = CommitTally::default();
        let mut new_leads = Vec::new();
        let mut failure = None;
        for mut candidate in candidates {
            candidate.source_task = task.id;
            if !spec.filters.admits(&candidate.fields) {
                tally.filtered += 1;
                continue;
            }
            spec.fields.apply(&mut candidate.fields);
            let candidate = &candidate;
            let committed = self
                .persist("lead", || {
                    self.dedup
                        .commit(runtime.job_id, candidate, spec.duplicate_policy)
                })
                .await;
            match committed {
                Ok(outcome) => match outcome.decision.classification {
                    Classification::New => {
                        tally.inserted += 1;
                        new_leads.extend(outcome.lead);
                    }
                    Classification::Skip(_)
                    | Classification::Update(_)
                    | Classification::Merge(_) => tally.duplicates += 1,
                    Classification::FlagReview(_) => tally.flagged += 1,
                },
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let leads_found = u32::try_from(tally.inserted).unwrap_or(u32::MAX);
        let effects = {
            let mut state = runtime.state.lock().await;
            state.apply_tally(tally);
            if failure.is_some() {
                state.abandon(task.id);
                None
            } else {
                match state.complete(
                    task.id,
                    leads_found,
                    self.config.checkpoint.every_n_tasks,
                    self.config.retry.failure_ratio_threshold,
                ) {
                    Ok(effects) => Some(effects),
                    Err(err) => {
                        error!(target: "mapleads::worker", task_id = %task.id, error = %err, "task completion rejected");
                        None
                    }
                }
            }
        };

        for lead in new_leads {
            self.publish(EngineEvent::NewLead {
                job_id: runtime.job_id,
                lead: Box::new(lead),
            })
            .await;
        }

        if let Some(err) = failure {
            error!(
                target: "mapleads::worker",
                job_id = %runtime.job_id,
                task_id = %task.id,
                error = %err,
                "lead commit failed after retries"
            );
            self.auto_pause(
                runtime,
                JobCondition::PersistenceFailure {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }

        debug!(
            target: "mapleads::worker",
            %worker,
            task_id = %task.id,
            received,
            inserted = tally.inserted,
            duplicates = tally.duplicates,
            flagged = tally.flagged,
            filtered = tally.filtered,
            "task done"
        );
        if let Some(effects) = effects {
            self.apply_effects(runtime, effects).await;
        }
    }

    async fn on_failure(
        &self,
        runtime: &JobRuntime,
        worker: &WorkerId,
        task: &SearchTask,
        proxy: &ProxyId,
        err: ExtractionError,
    ) {
        let proxy_scope = PacingScope::Proxy(proxy.clone());
        match err.kind {
            ExtractionErrorKind::BlockedOrCaptcha => {
                self.proxies.report_failure(proxy, FailureKind::Blocked).await;
                self.pacing.penalize_block(&proxy_scope).await;
            }
            ExtractionErrorKind::ProxyDead => {
                self.proxies.report_failure(proxy, FailureKind::Dead).await;
            }
            ExtractionErrorKind::NetworkTimeout => {
                self.proxies.report_failure(proxy, FailureKind::Timeout).await;
                self.pacing.record_error(&proxy_scope).await;
                self.pacing
                    .record_error(&PacingScope::Worker(worker.clone()))
                    .await;
            }
            // The endpoint delivered a page; the problem is the content.
            ExtractionErrorKind::ParseFailure | ExtractionErrorKind::NotFound => {
                self.proxies.report_success(proxy).await;
            }
        }

        // Held through the writes below so a cancel cannot land between the
        // resolution and its checkpoint.
        let _gate = runtime.commit_gate.read().await;
        if runtime.state.lock().await.job.status == JobStatus::Cancelled {
            debug!(target: "mapleads::worker", %worker, task_id = %task.id, "job cancelled; failure dropped");
            return;
        }

        let now = Instant::now();
        let blocks = &self.config.blocks;
        let resolved = {
            let mut state = runtime.state.lock().await;
            let escalated = if err.kind == ExtractionErrorKind::BlockedOrCaptcha {
                state.record_block(proxy.clone(), now, blocks.window(), blocks.distinct_proxies)
            } else {
                None
            };
            state
                .fail(
                    task.id,
                    &err,
                    &self.retry,
                    now,
                    self.config.checkpoint.every_n_tasks,
                    self.config.retry.failure_ratio_threshold,
                )
                .map(|(decision, mut effects)| {
                    if let Some(proxies) = escalated
                        && state.job.status == JobStatus::Running
                    {
                        let condition = JobCondition::RecurrentBlocks { proxies };
                        if state.pause(condition.clone()).is_ok() {
                            effects.escalated = Some(condition);
                            effects.job = Some(state.snapshot());
                        }
                    }
                    (decision, effects)
                })
        };

        let (decision, effects) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(target: "mapleads::worker", task_id = %task.id, error = %e, "task failure rejected");
                return;
            }
        };

        match decision {
            RetryDecision::Terminal => warn!(
                target: "mapleads::worker",
                %worker,
                task_id = %task.id,
                key = %task.key,
                kind = ?err.kind,
                error = %err.message,
                "task failed"
            ),
            RetryDecision::Requeue => info!(
                target: "mapleads::worker",
                %worker,
                task_id = %task.id,
                proxy = %proxy,
                kind = ?err.kind,
                "task requeued on another proxy"
            ),
            RetryDecision::Retry { after } => debug!(
                target: "mapleads::worker",
                %worker,
                task_id = %task.id,
                kind = ?err.kind,
                backoff_ms = after.as_millis() as u64,
                "task will be retried"
            ),
            RetryDecision::Complete => debug!(
                target: "mapleads::worker",
                %worker,
                task_id = %task.id,
                "no results for task"
            ),
        }

        let escalated = effects.escalated.clone();
        self.apply_effects(runtime, effects).await;
        if let Some(condition) = escalated {
            runtime.stop_run().await;
            warn!(
                target: "mapleads::worker",
                job_id = %runtime.job_id,
                ?condition,
                "block signals from several proxies; job paused"
            );
            self.publish(EngineEvent::JobAlert {
                job_id: runtime.job_id,
                condition,
            })
            .await;
        }
    }

    /// Writes what a resolution produced: checkpoint first, then the task
    /// records it covers, then the job record.
    pub(crate) async fn apply_effects(&self, runtime: &JobRuntime, effects: Effects) {
        let Effects {
            task,
            checkpoint,
            job,
            finished,
            ..
        } = effects;

        let written = async {
            if let Some((checkpoint, covered)) = &checkpoint {
                self.write_checkpoint(runtime, checkpoint).await?;
                for task in covered {
                    self.persist("task", || self.job_store.upsert_task(task))
                        .await?;
                }
            }
            if let Some(task) = &task {
                self.persist("task", || self.job_store.upsert_task(task))
                    .await?;
            }
            if let Some(job) = &job {
                self.persist_job(runtime, job).await?;
            }
            Ok::<_, EngineError>(())
        }
        .await;

        if let Err(err) = written {
            error!(
                target: "mapleads::worker",
                job_id = %runtime.job_id,
                error = %err,
                "progress write failed after retries"
            );
            self.auto_pause(
                runtime,
                JobCondition::PersistenceFailure {
                    message: err.to_string(),
                },
            )
            .await;
            return;
        }

        let Some(snapshot) = job else {
            return;
        };
        self.publish_update(&snapshot.job).await;
        match finished {
            Some(JobStatus::Completed) => {
                info!(
                    target: "mapleads::orchestrator",
                    job_id = %runtime.job_id,
                    summary = %Self::counts_summary(&snapshot.job.counts),
                    "job completed"
                );
                self.publish(EngineEvent::JobCompleted {
                    job_id: runtime.job_id,
                    count: snapshot.job.counts.scraped,
                })
                .await;
            }
            Some(JobStatus::Failed) => {
                let message = snapshot
                    .job
                    .error
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string());
                warn!(
                    target: "mapleads::orchestrator",
                    job_id = %runtime.job_id,
                    summary = %Self::counts_summary(&snapshot.job.counts),
                    error = %message,
                    "job failed"
                );
                self.publish(EngineEvent::JobFailed {
                    job_id: runtime.job_id,
                    error: message,
                })
                .await;
            }
            _ => {}
        }
    }

    /// Completes the job if nothing is left to dispatch or in flight.
    pub(crate) async fn finalize_if_done(&self, runtime: &JobRuntime) {
        let effects = {
            let mut state = runtime.state.lock().await;
            let Some(status) = state.finish_if_done(self.config.retry.failure_ratio_threshold)
            else {
                return;
            };
            Effects {
                checkpoint: Some(state.checkpoint()),
                job: Some(state.snapshot()),
                finished: Some(status),
                ..Effects::default()
            }
        };
        self.apply_effects(runtime, effects).await;
    }

    /// Pauses a running job on a condition that needs an operator.
    pub(crate) async fn auto_pause(&self, runtime: &JobRuntime, condition: JobCondition) {
        let snapshot = {
            let mut state = runtime.state.lock().await;
            if !matches!(state.job.status, JobStatus::Running | JobStatus::Pending) {
                return;
            }
            if let Err(err) = state.pause(condition.clone()) {
                warn!(target: "mapleads::orchestrator", job_id = %runtime.job_id, error = %err, "auto-pause rejected");
                return;
            }
            state.snapshot()
        };
        runtime.stop_run().await;
        warn!(
            target: "mapleads::orchestrator",
            job_id = %runtime.job_id,
            ?condition,
            "job paused automatically"
        );
        if let Err(err) = self.persist_job(runtime, &snapshot).await {
            error!(
                target: "mapleads::orchestrator",
                job_id = %runtime.job_id,
                error = %err,
                "failed to persist paused job"
            );
        }
        self.publish(EngineEvent::JobAlert {
            job_id: runtime.job_id,
            condition,
        })
        .await;
        self.publish_update(&snapshot.job).await;
    }
}
