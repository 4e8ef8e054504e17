//! Durable progress snapshots.
//!
//! A [`Checkpoint`] is an immutable value. Stores replace the previous
//! snapshot for a job as a whole and never expose a partially written one.

mod file;

pub use file::FileCheckpointStore;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestration::job::JobCounts;
use crate::types::{JobId, TaskId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    /// Monotone per job; a store never replaces a snapshot with an older one.
    pub sequence: u64,
    pub completed: BTreeSet<TaskId>,
    pub pending: BTreeSet<TaskId>,
    /// Terminally failed tasks; not retried on resume.
    #[serde(default)]
    pub failed: BTreeSet<TaskId>,
    /// Leads committed by the job when the snapshot was taken.
    pub committed_leads: u64,
    #[serde(default)]
    pub counts: JobCounts,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomically replaces the job's snapshot. Returns false when a snapshot
    /// with an equal or newer sequence is already stored.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool>;

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>>;

    async fn delete(&self, job_id: JobId) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: DashMap<JobId, Arc<Checkpoint>>,
}

impl fmt::Debug for InMemoryCheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCheckpointStore")
            .field("jobs", &self.snapshots.len())
            .finish()
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool> {
        match self.snapshots.entry(checkpoint.job_id) {
            Entry::Occupied(mut current) => {
                if current.get().sequence >= checkpoint.sequence {
                    return Ok(false);
                }
                current.insert(Arc::new(checkpoint.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(checkpoint.clone()));
            }
        }
        Ok(true)
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>> {
        Ok(self.snapshots.get(&job_id).map(|c| c.value().as_ref().clone()))
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        self.snapshots.remove(&job_id);
        Ok(())
    }
}
