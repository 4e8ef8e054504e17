//! Storage ports consumed by the engine.
//!
//! Implementations only need atomic single-record upserts and point lookups.
//! The in-memory stores back tests and single-process deployments.

mod memory;

pub use memory::{InMemoryJobStore, InMemoryLeadStore};

use async_trait::async_trait;

use crate::dedup::ReviewItem;
use crate::error::Result;
use crate::leads::Lead;
use crate::orchestration::job::ScrapeJob;
use crate::orchestration::task::SearchTask;
use crate::types::{JobId, LeadId, TaskId};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert_job(&self, job: &ScrapeJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>>;

    async fn list_jobs(&self) -> Result<Vec<ScrapeJob>>;

    /// Removes the job and its tasks. Returns false if it did not exist.
    async fn delete_job(&self, id: JobId) -> Result<bool>;

    /// Stores the full task set of a job at decomposition time.
    async fn insert_tasks(&self, job_id: JobId, tasks: &[SearchTask]) -> Result<()>;

    async fn upsert_task(&self, task: &SearchTask) -> Result<()>;

    async fn get_task(&self, job_id: JobId, task_id: TaskId) -> Result<Option<SearchTask>>;

    /// Tasks of a job in decomposition order.
    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<SearchTask>>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()>;

    async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>>;

    async fn list_leads(&self) -> Result<Vec<Lead>>;

    /// Leads first discovered by `job_id`.
    async fn leads_for_job(&self, job_id: JobId) -> Result<Vec<Lead>>;

    async fn add_review(&self, item: &ReviewItem) -> Result<()>;

    async fn list_reviews(&self) -> Result<Vec<ReviewItem>>;
}
