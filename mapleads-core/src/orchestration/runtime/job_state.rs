//! In-memory scheduling state of one job.
//!
//! Everything here is synchronous and guarded by the runtime's job lock; the
//! worker code does the awaiting (proxy selection, pacing, extraction, store
//! writes) outside of it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, Result};
use crate::orchestration::extractor::{ExtractionError, ExtractionErrorKind};
use crate::orchestration::job::{JobCondition, JobStatus, ScrapeJob};
use crate::orchestration::retry::{RetryDecision, RetryPolicy};
use crate::orchestration::task::{SearchTask, TaskStatus};
use crate::types::{ProxyId, TaskId};

#[derive(Clone, Debug)]
struct QueuedTask {
    id: TaskId,
    not_before: Option<Instant>,
    avoid: Option<ProxyId>,
}

/// Result of asking for the next task.
#[derive(Debug)]
pub(crate) enum Claim {
    /// Claimed; the caller owns the task until it dispatches or releases it.
    Task {
        task: SearchTask,
        avoid: Option<ProxyId>,
    },
    /// Nothing ready yet. `Some` is the time until the earliest backoff ends.
    Wait(Option<Duration>),
    /// No further dispatch for this job (all resolved or target reached).
    Drained,
    /// The job is not running.
    Stopped,
}

/// Side effects the caller performs after releasing the job lock.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Non-terminal task record to upsert.
    pub task: Option<SearchTask>,
    /// Snapshot to write, followed by the terminal tasks it covers.
    pub checkpoint: Option<(Checkpoint, Vec<SearchTask>)>,
    pub job: Option<JobSnapshot>,
    /// Set when this resolution moved the job to a terminal status.
    pub finished: Option<JobStatus>,
    /// Set when block signals escalated to a job pause.
    pub escalated: Option<JobCondition>,
}

/// Job record tagged with the revision it was taken at. Writers drop
/// snapshots older than the last one stored.
#[derive(Clone, Debug)]
pub(crate) struct JobSnapshot {
    pub revision: u64,
    pub job: ScrapeJob,
}

/// Candidate outcome counters for one task.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CommitTally {
    pub inserted: u64,
    pub duplicates: u64,
    pub flagged: u64,
    pub filtered: u64,
}

#[derive(Debug)]
pub(crate) struct JobState {
    pub job: ScrapeJob,
    tasks: HashMap<TaskId, SearchTask>,
    order: Vec<TaskId>,
    queue: VecDeque<QueuedTask>,
    active: HashSet<TaskId>,
    completed: BTreeSet<TaskId>,
    failed: BTreeSet<TaskId>,
    /// Terminal tasks not yet covered by a written checkpoint.
    unpersisted: Vec<TaskId>,
    resolved_since_checkpoint: u32,
    checkpoint_seq: u64,
    block_signals: VecDeque<(Instant, ProxyId)>,
    revision: u64,
    status_tx: watch::Sender<JobStatus>,
}

impl JobState {
    /// Builds state from a task set whose statuses are already normalized
    /// (`InFlight` is not expected and is treated as requeued).
    pub fn new(job: ScrapeJob, tasks: Vec<SearchTask>, checkpoint_seq: u64) -> Self {
        let (status_tx, _) = watch::channel(job.status);
        let mut state = Self {
            job,
            tasks: HashMap::with_capacity(tasks.len()),
            order: Vec::with_capacity(tasks.len()),
            queue: VecDeque::new(),
            active: HashSet::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            unpersisted: Vec::new(),
            resolved_since_checkpoint: 0,
            checkpoint_seq,
            block_signals: VecDeque::new(),
            revision: 0,
            status_tx,
        };
        for mut task in tasks {
            match task.status {
                TaskStatus::Done => {
                    state.completed.insert(task.id);
                }
                TaskStatus::Failed => {
                    state.failed.insert(task.id);
                }
                TaskStatus::InFlight => {
                    task.status = TaskStatus::Requeued;
                    state.queue.push_back(QueuedTask {
                        id: task.id,
                        not_before: None,
                        avoid: None,
                    });
                }
                TaskStatus::Queued | TaskStatus::Requeued => {
                    state.queue.push_back(QueuedTask {
                        id: task.id,
                        not_before: None,
                        avoid: None,
                    });
                }
            }
            state.order.push(task.id);
            state.tasks.insert(task.id, task);
        }
        state.job.counts.tasks_total = state.order.len() as u64;
        state.job.counts.tasks_done = state.completed.len() as u64;
        state.job.counts.tasks_failed = state.failed.len() as u64;
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        self.job.transition(next)?;
        self.status_tx.send_replace(next);
        Ok(())
    }

    pub fn snapshot(&mut self) -> JobSnapshot {
        self.revision += 1;
        JobSnapshot {
            revision: self.revision,
            job: self.job.clone(),
        }
    }

    pub fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint_seq
    }

    pub fn tasks(&self) -> Vec<SearchTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    pub fn completed(&self) -> &BTreeSet<TaskId> {
        &self.completed
    }

    pub fn failed(&self) -> &BTreeSet<TaskId> {
        &self.failed
    }

    /// Tasks that are neither done nor terminally failed, in decomposition order.
    pub fn pending(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| !self.completed.contains(id) && !self.failed.contains(id))
            .copied()
            .collect()
    }

    pub fn claim(&mut self, now: Instant) -> Claim {
        if self.job.status != JobStatus::Running {
            return Claim::Stopped;
        }
        if self.job.target_reached() {
            return Claim::Drained;
        }

        let ready = self
            .queue
            .iter()
            .position(|q| q.not_before.is_none_or(|at| at <= now));
        if let Some(pos) = ready
            && let Some(entry) = self.queue.remove(pos)
            && let Some(task) = self.tasks.get(&entry.id)
        {
            self.active.insert(entry.id);
            return Claim::Task {
                task: task.clone(),
                avoid: entry.avoid,
            };
        }

        if let Some(earliest) = self.queue.iter().filter_map(|q| q.not_before).min() {
            return Claim::Wait(Some(earliest.saturating_duration_since(now)));
        }
        if self.queue.is_empty() && self.active.is_empty() {
            return Claim::Drained;
        }
        Claim::Wait(None)
    }

    /// Hands a claimed but undispatched task back to the front of the queue.
    pub fn release(&mut self, id: TaskId, avoid: Option<ProxyId>) {
        if self.active.remove(&id) {
            self.queue.push_front(QueuedTask {
                id,
                not_before: None,
                avoid,
            });
        }
    }

    pub fn mark_dispatched(&mut self, id: TaskId, proxy: Option<ProxyId>) -> Result<SearchTask> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
        task.transition(TaskStatus::InFlight)?;
        task.dispatches = task.dispatches.saturating_add(1);
        task.assigned_proxy = proxy;
        Ok(task.clone())
    }

    /// Puts an in-flight task back without charging an attempt (pause, abort,
    /// store failure).
    pub fn abandon(&mut self, id: TaskId) -> Option<SearchTask> {
        self.active.remove(&id);
        let task = self.tasks.get_mut(&id)?;
        if task.status == TaskStatus::InFlight && task.transition(TaskStatus::Requeued).is_ok() {
            self.queue.push_front(QueuedTask {
                id,
                not_before: None,
                avoid: None,
            });
            return Some(task.clone());
        }
        None
    }

    pub fn apply_tally(&mut self, tally: CommitTally) {
        let counts = &mut self.job.counts;
        counts.scraped += tally.inserted;
        counts.duplicates += tally.duplicates;
        counts.flagged += tally.flagged;
        counts.filtered += tally.filtered;
        self.job.updated_at = Utc::now();
    }

    pub fn complete(
        &mut self,
        id: TaskId,
        leads: u32,
        every_n: u32,
        failure_ratio_threshold: f64,
    ) -> Result<Effects> {
        self.active.remove(&id);
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
        task.transition(TaskStatus::Done)?;
        task.leads_found = leads;
        self.completed.insert(id);
        self.job.counts.tasks_done = self.completed.len() as u64;
        self.after_terminal(id);
        Ok(self.effects(None, every_n, failure_ratio_threshold))
    }

    /// Counts the failure against the task, asks the retry policy, and moves
    /// the task accordingly.
    pub fn fail(
        &mut self,
        id: TaskId,
        error: &ExtractionError,
        policy: &RetryPolicy,
        now: Instant,
        every_n: u32,
        failure_ratio_threshold: f64,
    ) -> Result<(RetryDecision, Effects)> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
        match error.kind {
            ExtractionErrorKind::BlockedOrCaptcha => {
                task.attempts.blocks = task.attempts.blocks.saturating_add(1);
                self.job.counts.blocks += 1;
            }
            ExtractionErrorKind::NotFound => {}
            ExtractionErrorKind::ParseFailure => {
                task.attempts.failures = task.attempts.failures.saturating_add(1);
                task.attempts.parse_failures = task.attempts.parse_failures.saturating_add(1);
                self.job.counts.errors += 1;
            }
            ExtractionErrorKind::NetworkTimeout | ExtractionErrorKind::ProxyDead => {
                task.attempts.failures = task.attempts.failures.saturating_add(1);
                self.job.counts.errors += 1;
            }
        }
        task.last_error = Some(error.kind);
        task.last_error_message = Some(error.message.clone());
        let proxy = task.assigned_proxy.clone();

        let decision = policy.decide(error.kind, task.attempts);
        let mut touched = None;
        match decision {
            RetryDecision::Complete => {
                task.transition(TaskStatus::Done)?;
                task.leads_found = 0;
                self.active.remove(&id);
                self.completed.insert(id);
                self.job.counts.tasks_done = self.completed.len() as u64;
                self.after_terminal(id);
            }
            RetryDecision::Terminal => {
                task.transition(TaskStatus::Failed)?;
                self.active.remove(&id);
                self.failed.insert(id);
                self.job.counts.tasks_failed = self.failed.len() as u64;
                self.after_terminal(id);
            }
            RetryDecision::Retry { after } => {
                task.transition(TaskStatus::Failed)?;
                task.transition(TaskStatus::Requeued)?;
                touched = Some(task.clone());
                self.active.remove(&id);
                self.queue.push_back(QueuedTask {
                    id,
                    not_before: Some(now + after),
                    avoid: None,
                });
            }
            RetryDecision::Requeue => {
                if error.kind != ExtractionErrorKind::BlockedOrCaptcha {
                    task.transition(TaskStatus::Failed)?;
                }
                task.transition(TaskStatus::Requeued)?;
                touched = Some(task.clone());
                self.active.remove(&id);
                self.queue.push_back(QueuedTask {
                    id,
                    not_before: None,
                    avoid: proxy,
                });
            }
        }

        Ok((decision, self.effects(touched, every_n, failure_ratio_threshold)))
    }

    /// Records a block signal and returns the distinct proxies seen inside
    /// `window` once they reach `threshold`.
    pub fn record_block(
        &mut self,
        proxy: ProxyId,
        now: Instant,
        window: Duration,
        threshold: usize,
    ) -> Option<Vec<ProxyId>> {
        self.block_signals.push_back((now, proxy));
        while let Some((at, _)) = self.block_signals.front() {
            if now.saturating_duration_since(*at) > window {
                self.block_signals.pop_front();
            } else {
                break;
            }
        }
        let distinct: BTreeSet<ProxyId> =
            self.block_signals.iter().map(|(_, p)| p.clone()).collect();
        if threshold > 0 && distinct.len() >= threshold {
            self.block_signals.clear();
            return Some(distinct.into_iter().collect());
        }
        None
    }

    /// Moves a running (or pending) job to paused with `condition`.
    pub fn pause(&mut self, condition: JobCondition) -> Result<()> {
        self.transition(JobStatus::Paused)?;
        self.job.condition = Some(condition);
        Ok(())
    }

    fn after_terminal(&mut self, id: TaskId) {
        self.unpersisted.push(id);
        self.resolved_since_checkpoint += 1;
    }

    pub fn is_finished(&self) -> bool {
        self.active.is_empty() && (self.queue.is_empty() || self.job.target_reached())
    }

    /// Finalizes a running job whose work is exhausted.
    pub fn finish_if_done(&mut self, failure_ratio_threshold: f64) -> Option<JobStatus> {
        if self.job.status != JobStatus::Running || !self.is_finished() {
            return None;
        }
        let status = if self.job.failure_ratio() > failure_ratio_threshold {
            self.job.error = Some(format!(
                "{} of {} tasks failed",
                self.job.counts.tasks_failed, self.job.counts.tasks_total
            ));
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.transition(status).ok()?;
        Some(status)
    }

    fn effects(
        &mut self,
        task: Option<SearchTask>,
        every_n: u32,
        failure_ratio_threshold: f64,
    ) -> Effects {
        let finished = self.finish_if_done(failure_ratio_threshold);
        let due = finished.is_some()
            || (self.resolved_since_checkpoint > 0
                && self.resolved_since_checkpoint >= every_n.max(1));
        Effects {
            task,
            checkpoint: due.then(|| self.checkpoint()),
            job: Some(self.snapshot()),
            finished,
            escalated: None,
        }
    }

    /// Takes a snapshot and hands over the terminal tasks it covers.
    pub fn checkpoint(&mut self) -> (Checkpoint, Vec<SearchTask>) {
        self.checkpoint_seq += 1;
        self.resolved_since_checkpoint = 0;
        let covered = std::mem::take(&mut self.unpersisted)
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).cloned())
            .collect();
        let checkpoint = Checkpoint {
            job_id: self.job.id,
            sequence: self.checkpoint_seq,
            completed: self.completed.clone(),
            pending: self.pending().into_iter().collect(),
            failed: self.failed.clone(),
            committed_leads: self.job.counts.scraped,
            counts: self.job.counts,
            written_at: Utc::now(),
        };
        (checkpoint, covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::orchestration::search::SearchSpec;
    use crate::orchestration::task::decompose;

    fn running(locations: &[&str]) -> JobState {
        let mut job = ScrapeJob::new(SearchSpec::for_locations("gyms", locations.iter().copied()));
        let tasks = decompose(job.id, &job.spec);
        job.transition(JobStatus::Running).unwrap();
        JobState::new(job, tasks, 0)
    }

    fn claim(state: &mut JobState) -> SearchTask {
        match state.claim(Instant::now()) {
            Claim::Task { task, .. } => task,
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_last_task_and_checkpoints() {
        let mut state = running(&["Pune", "Nagpur"]);
        let a = claim(&mut state);
        let b = claim(&mut state);
        assert!(matches!(state.claim(Instant::now()), Claim::Wait(None)));

        state.mark_dispatched(a.id, None).unwrap();
        let effects = state.complete(a.id, 3, 1, 0.5).unwrap();
        let (checkpoint, covered) = effects.checkpoint.unwrap();
        assert_eq!(checkpoint.sequence, 1);
        assert_eq!(checkpoint.completed.len(), 1);
        assert_eq!(checkpoint.pending.len(), 1);
        assert_eq!(covered.len(), 1);
        assert!(effects.finished.is_none());

        state.mark_dispatched(b.id, None).unwrap();
        let effects = state.complete(b.id, 0, 1, 0.5).unwrap();
        assert_eq!(effects.finished, Some(JobStatus::Completed));
        assert!(effects.checkpoint.unwrap().0.is_complete());
        assert!(matches!(state.claim(Instant::now()), Claim::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_backs_off_before_redispatch() {
        let mut state = running(&["Pune"]);
        let policy = RetryPolicy::new(RetryConfig {
            backoff_base_ms: 1_000,
            ..RetryConfig::default()
        });
        let task = claim(&mut state);
        state.mark_dispatched(task.id, None).unwrap();

        let (decision, effects) = state
            .fail(
                task.id,
                &ExtractionError::timeout("slow"),
                &policy,
                Instant::now(),
                1,
                0.5,
            )
            .unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));
        assert_eq!(effects.task.unwrap().status, TaskStatus::Requeued);
        assert!(effects.checkpoint.is_none());

        assert!(matches!(state.claim(Instant::now()), Claim::Wait(Some(_))));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(claim(&mut state).id, task.id);
    }

    #[tokio::test(start_paused = true)]
    async fn majority_terminal_failures_fail_the_job() {
        let mut state = running(&["Pune"]);
        let task = claim(&mut state);
        state.mark_dispatched(task.id, None).unwrap();
        // Already in flight.
        state.mark_dispatched(task.id, None).unwrap_err();

        let (_, effects) = state
            .fail(
                task.id,
                &ExtractionError::parse("layout drift"),
                &RetryPolicy::new(RetryConfig {
                    parse_failure_retries: 0,
                    ..RetryConfig::default()
                }),
                Instant::now(),
                1,
                0.5,
            )
            .unwrap();
        assert_eq!(effects.finished, Some(JobStatus::Failed));
        assert!(state.job.error.is_some());
        assert_eq!(state.failed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn block_requeues_and_avoids_the_proxy() {
        let mut state = running(&["Pune"]);
        let policy = RetryPolicy::new(RetryConfig::default());
        let task = claim(&mut state);
        let proxy = ProxyId::new("a");
        state.mark_dispatched(task.id, Some(proxy.clone())).unwrap();

        let (decision, effects) = state
            .fail(
                task.id,
                &ExtractionError::blocked("captcha"),
                &policy,
                Instant::now(),
                1,
                0.5,
            )
            .unwrap();
        assert_eq!(decision, RetryDecision::Requeue);
        let requeued = effects.task.unwrap();
        assert_eq!(requeued.status, TaskStatus::Requeued);
        assert_eq!(requeued.attempts.blocks, 1);
        assert_eq!(state.job.counts.blocks, 1);
        assert_eq!(state.job.counts.errors, 0);

        match state.claim(Instant::now()) {
            Claim::Task { avoid, .. } => assert_eq!(avoid, Some(proxy)),
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_proxy_blocks_escalate() {
        let mut state = running(&["Pune"]);
        let window = Duration::from_secs(60);
        let now = Instant::now();
        assert!(state.record_block(ProxyId::new("a"), now, window, 2).is_none());
        assert!(state.record_block(ProxyId::new("a"), now, window, 2).is_none());
        let escalated = state
            .record_block(ProxyId::new("b"), now, window, 2)
            .unwrap();
        assert_eq!(escalated.len(), 2);

        // Old signals age out of the window.
        assert!(state.record_block(ProxyId::new("a"), now, window, 2).is_none());
        let later = now + Duration::from_secs(120);
        assert!(state.record_block(ProxyId::new("b"), later, window, 2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn target_stops_dispatch_and_completes_when_drained() {
        let mut job = ScrapeJob::new(
            SearchSpec::for_locations("gyms", ["Pune", "Nagpur", "Nashik"]).with_target(2),
        );
        let tasks = decompose(job.id, &job.spec);
        job.transition(JobStatus::Running).unwrap();
        let mut state = JobState::new(job, tasks, 0);

        let task = claim(&mut state);
        state.mark_dispatched(task.id, None).unwrap();
        state.apply_tally(CommitTally {
            inserted: 2,
            ..Default::default()
        });
        let effects = state.complete(task.id, 2, 1, 0.5).unwrap();
        assert_eq!(effects.finished, Some(JobStatus::Completed));
        assert_eq!(effects.checkpoint.unwrap().0.pending.len(), 2);
    }

    #[test]
    fn in_flight_tasks_are_requeued_on_rebuild() {
        let job = ScrapeJob::new(SearchSpec::for_locations("gyms", ["Pune", "Nagpur"]));
        let mut tasks = decompose(job.id, &job.spec);
        tasks[0].status = TaskStatus::InFlight;
        tasks[1].status = TaskStatus::Done;
        let state = JobState::new(job, tasks, 4);
        assert_eq!(state.pending().len(), 1);
        assert_eq!(state.tasks()[0].status, TaskStatus::Requeued);
        assert_eq!(state.job.counts.tasks_done, 1);
    }
}
