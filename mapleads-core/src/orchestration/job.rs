use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::search::SearchSpec;
use crate::error::{EngineError, Result};
use crate::types::{JobId, ProxyId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

/// Job-level condition that paused a job or needs operator attention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum JobCondition {
    /// Paused through the control surface.
    Manual,
    /// Every proxy is blacklisted (or none is configured).
    NoHealthyProxy,
    /// Block/CAPTCHA signals from several proxies inside the escalation window.
    RecurrentBlocks { proxies: Vec<ProxyId> },
    /// A store write kept failing after bounded retries.
    PersistenceFailure { message: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// New leads committed by this job.
    pub scraped: u64,
    /// Candidates matched to an existing lead (skipped, updated or merged).
    pub duplicates: u64,
    /// Candidates parked for review.
    pub flagged: u64,
    /// Candidates dropped by post-filters.
    pub filtered: u64,
    /// Failed extraction attempts, block signals excluded.
    pub errors: u64,
    pub blocks: u64,
    pub tasks_total: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
}

/// A scrape job. Mutated only through [`ScrapeJob::transition`] and counter updates
/// made by the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: JobId,
    pub spec: SearchSpec,
    pub status: JobStatus,
    pub counts: JobCounts,
    /// Extractor strategy chosen at submission (`name@version`).
    pub strategy: Option<String>,
    /// Why the job is paused, or the terminal condition that failed it.
    pub condition: Option<JobCondition>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScrapeJob {
    pub fn new(spec: SearchSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            spec,
            status: JobStatus::Pending,
            counts: JobCounts::default(),
            strategy: None,
            condition: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn target_leads(&self) -> Option<u64> {
        self.spec.target_leads
    }

    pub fn target_reached(&self) -> bool {
        self.target_leads()
            .is_some_and(|target| self.counts.scraped >= target)
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "job {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => {
                self.started_at.get_or_insert(now);
                self.condition = None;
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Pending | JobStatus::Paused => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Share of tasks that failed terminally.
    pub fn failure_ratio(&self) -> f64 {
        if self.counts.tasks_total == 0 {
            return 0.0;
        }
        self.counts.tasks_failed as f64 / self.counts.tasks_total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_state_machine() {
        let mut job = ScrapeJob::new(SearchSpec::keyword("gyms", "Pune"));
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.transition(JobStatus::Running).is_err());
    }

    #[test]
    fn resume_clears_pause_condition() {
        let mut job = ScrapeJob::new(SearchSpec::keyword("gyms", "Pune"));
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Paused).unwrap();
        job.condition = Some(JobCondition::NoHealthyProxy);
        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.condition, None);
    }

    #[test]
    fn cancelled_is_terminal() {
        let mut job = ScrapeJob::new(SearchSpec::keyword("gyms", "Pune"));
        job.transition(JobStatus::Cancelled).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.transition(JobStatus::Paused).is_err());
    }

    #[test]
    fn target_reached_tracks_scraped() {
        let mut job = ScrapeJob::new(SearchSpec::keyword("gyms", "Pune").with_target(2));
        job.counts.scraped = 1;
        assert!(!job.target_reached());
        job.counts.scraped = 2;
        assert!(job.target_reached());
    }
}
