use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobCondition, JobCounts, JobStatus};
use crate::error::Result;
use crate::leads::Lead;
use crate::types::JobId;

/// Progress snapshot published after every task resolution and status change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub counts: JobCounts,
    pub at: DateTime<Utc>,
}

/// Notifications for external consumers. Delivery is best-effort; nothing in
/// the orchestrator depends on an event being observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobUpdate(JobUpdate),
    JobCompleted { job_id: JobId, count: u64 },
    JobFailed { job_id: JobId, error: String },
    NewLead { job_id: JobId, lead: Box<Lead> },
    /// Job-level condition that needs attention (auto-pause and the like).
    JobAlert { job_id: JobId, condition: JobCondition },
}

impl EngineEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            EngineEvent::JobUpdate(update) => update.job_id,
            EngineEvent::JobCompleted { job_id, .. }
            | EngineEvent::JobFailed { job_id, .. }
            | EngineEvent::NewLead { job_id, .. }
            | EngineEvent::JobAlert { job_id, .. } => *job_id,
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;
}
