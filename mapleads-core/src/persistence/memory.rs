use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{JobStore, LeadStore};
use crate::dedup::ReviewItem;
use crate::error::Result;
use crate::leads::Lead;
use crate::orchestration::job::ScrapeJob;
use crate::orchestration::task::SearchTask;
use crate::types::{JobId, LeadId, TaskId};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, ScrapeJob>,
    /// Per job: task order plus records.
    tasks: DashMap<JobId, (Vec<TaskId>, HashMap<TaskId, SearchTask>)>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_job(&self, job: &ScrapeJob) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>> {
        Ok(self.jobs.get(&id).map(|job| job.value().clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<ScrapeJob>> {
        let mut jobs: Vec<ScrapeJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        self.tasks.remove(&id);
        Ok(self.jobs.remove(&id).is_some())
    }

    async fn insert_tasks(&self, job_id: JobId, tasks: &[SearchTask]) -> Result<()> {
        let mut entry = self.tasks.entry(job_id).or_default();
        let (order, records) = &mut *entry;
        for task in tasks {
            if records.insert(task.id, task.clone()).is_none() {
                order.push(task.id);
            }
        }
        Ok(())
    }

    async fn upsert_task(&self, task: &SearchTask) -> Result<()> {
        let mut entry = self.tasks.entry(task.job_id).or_default();
        let (order, records) = &mut *entry;
        if records.insert(task.id, task.clone()).is_none() {
            order.push(task.id);
        }
        Ok(())
    }

    async fn get_task(&self, job_id: JobId, task_id: TaskId) -> Result<Option<SearchTask>> {
        Ok(self
            .tasks
            .get(&job_id)
            .and_then(|entry| entry.value().1.get(&task_id).cloned()))
    }

    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<SearchTask>> {
        Ok(self
            .tasks
            .get(&job_id)
            .map(|entry| {
                let (order, records) = entry.value();
                order
                    .iter()
                    .filter_map(|id| records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<LeadId, Lead>,
    reviews: RwLock<Vec<ReviewItem>>,
}

impl fmt::Debug for InMemoryLeadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLeadStore")
            .field("leads", &self.leads.len())
            .field(
                "reviews",
                &self.reviews.try_read().map(|r| r.len()).unwrap_or_default(),
            )
            .finish()
    }
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        self.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
        Ok(self.leads.get(&id).map(|lead| lead.value().clone()))
    }

    async fn list_leads(&self) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = self.leads.iter().map(|l| l.value().clone()).collect();
        leads.sort_by_key(|lead| lead.id);
        Ok(leads)
    }

    async fn leads_for_job(&self, job_id: JobId) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = self
            .leads
            .iter()
            .filter(|l| l.job_id == job_id)
            .map(|l| l.value().clone())
            .collect();
        leads.sort_by_key(|lead| lead.id);
        Ok(leads)
    }

    async fn add_review(&self, item: &ReviewItem) -> Result<()> {
        self.reviews.write().await.push(item.clone());
        Ok(())
    }

    async fn list_reviews(&self) -> Result<Vec<ReviewItem>> {
        Ok(self.reviews.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::search::SearchSpec;
    use crate::orchestration::task::{TaskStatus, decompose};

    #[tokio::test]
    async fn tasks_keep_decomposition_order() {
        let store = InMemoryJobStore::new();
        let job = ScrapeJob::new(SearchSpec::for_locations("gyms", ["Pune", "Nagpur", "Nashik"]));
        let tasks = decompose(job.id, &job.spec);
        store.upsert_job(&job).await.unwrap();
        store.insert_tasks(job.id, &tasks).await.unwrap();

        let mut second = tasks[1].clone();
        second.transition(TaskStatus::InFlight).unwrap();
        store.upsert_task(&second).await.unwrap();

        let listed = store.list_tasks(job.id).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id).collect();
        assert_eq!(ids, tasks.iter().map(|t| t.id).collect::<Vec<_>>());
        assert_eq!(listed[1].status, TaskStatus::InFlight);

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.list_tasks(job.id).await.unwrap().is_empty());
    }
}
