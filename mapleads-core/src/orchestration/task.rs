use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::extractor::ExtractionErrorKind;
use super::search::{BoundingBox, SearchSpec};
use crate::error::{EngineError, Result};
use crate::types::{JobId, ProxyId, TaskId};

/// Task lifecycle. Transitions are monotone:
/// `queued -> in_flight -> {done, failed -> requeued -> in_flight}`, and a
/// block signal may move `in_flight -> requeued` directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InFlight,
    Done,
    Failed,
    Requeued,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InFlight)
                | (Requeued, InFlight)
                | (InFlight, Done)
                | (InFlight, Failed)
                | (InFlight, Requeued)
                | (Failed, Requeued)
        )
    }

    /// Waiting for a worker.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Requeued)
    }
}

/// What the extractor should search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    Location {
        query: String,
        location: String,
    },
    GridCell {
        query: String,
        row: u32,
        col: u32,
        bounds: BoundingBox,
        center: (f64, f64),
    },
}

impl TaskTarget {
    pub fn query(&self) -> &str {
        match self {
            TaskTarget::Location { query, .. } | TaskTarget::GridCell { query, .. } => query,
        }
    }
}

/// Counters the retry policy decides on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempts {
    /// Failed dispatches other than block signals.
    pub failures: u16,
    pub parse_failures: u16,
    pub blocks: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    pub id: TaskId,
    pub job_id: JobId,
    /// Stable key within the job (`loc:...` or `grid:r:c`).
    pub key: String,
    pub target: TaskTarget,
    pub status: TaskStatus,
    /// Times the task was handed to the extractor.
    pub dispatches: u16,
    pub attempts: Attempts,
    pub assigned_proxy: Option<ProxyId>,
    pub last_error: Option<ExtractionErrorKind>,
    pub last_error_message: Option<String>,
    pub leads_found: u32,
    pub updated_at: DateTime<Utc>,
}

impl SearchTask {
    pub fn new(job_id: JobId, key: String, target: TaskTarget) -> Self {
        Self {
            id: TaskId::derive(job_id, &key),
            job_id,
            key,
            target,
            status: TaskStatus::Queued,
            dispatches: 0,
            attempts: Attempts::default(),
            assigned_proxy: None,
            last_error: None,
            last_error_message: None,
            leads_found: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "task {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Failed)
    }
}

fn location_key(location: &str) -> String {
    location
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Splits a search into tasks. The output depends only on the job id and the
/// search, so re-decomposing yields identical task ids in identical order.
pub fn decompose(job_id: JobId, spec: &SearchSpec) -> Vec<SearchTask> {
    let query = spec.query.trim().to_string();
    let mut seen = HashSet::new();
    let mut tasks = Vec::new();

    for location in &spec.locations {
        let normalized = location_key(location);
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            continue;
        }
        tasks.push(SearchTask::new(
            job_id,
            format!("loc:{normalized}"),
            TaskTarget::Location {
                query: query.clone(),
                location: location.trim().to_string(),
            },
        ));
    }

    if let Some(grid) = &spec.grid {
        for (row, col, bounds) in grid.cells() {
            tasks.push(SearchTask::new(
                job_id,
                format!("grid:{row}:{col}"),
                TaskTarget::GridCell {
                    query: query.clone(),
                    row,
                    col,
                    center: bounds.center(),
                    bounds,
                },
            ));
        }
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::search::GridSpec;

    #[test]
    fn decomposition_is_reproducible() {
        let job = JobId::new();
        let spec = SearchSpec::for_locations("dentists", ["Pune", "Nagpur", "Nashik"]);
        let first: Vec<_> = decompose(job, &spec).into_iter().map(|t| t.id).collect();
        let second: Vec<_> = decompose(job, &spec).into_iter().map(|t| t.id).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn duplicate_locations_collapse_in_input_order() {
        let job = JobId::new();
        let spec = SearchSpec::for_locations("dentists", ["Pune", " pune ", "Nagpur", "PUNE"]);
        let keys: Vec<_> = decompose(job, &spec).into_iter().map(|t| t.key).collect();
        assert_eq!(keys, ["loc:pune", "loc:nagpur"]);
    }

    #[test]
    fn grid_adds_one_task_per_cell() {
        let job = JobId::new();
        let spec = SearchSpec::for_grid(
            "cafes",
            GridSpec {
                south: 18.4,
                west: 73.7,
                north: 18.6,
                east: 73.9,
                rows: 3,
                cols: 2,
            },
        );
        let tasks = decompose(job, &spec);
        assert_eq!(tasks.len(), 6);
        assert_eq!(tasks[1].key, "grid:0:1");
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Queued));
    }

    #[test]
    fn done_is_final() {
        let mut task = SearchTask::new(
            JobId::new(),
            "loc:pune".into(),
            TaskTarget::Location {
                query: "gyms".into(),
                location: "Pune".into(),
            },
        );
        task.transition(TaskStatus::InFlight).unwrap();
        task.transition(TaskStatus::Done).unwrap();
        assert!(task.transition(TaskStatus::Requeued).is_err());
        assert!(task.transition(TaskStatus::Queued).is_err());
        assert!(task.transition(TaskStatus::InFlight).is_err());
    }

    #[test]
    fn failed_task_can_be_requeued_for_retry() {
        let mut task = SearchTask::new(
            JobId::new(),
            "loc:pune".into(),
            TaskTarget::Location {
                query: "gyms".into(),
                location: "Pune".into(),
            },
        );
        task.transition(TaskStatus::InFlight).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        task.transition(TaskStatus::Requeued).unwrap();
        task.transition(TaskStatus::InFlight).unwrap();
        assert!(task.transition(TaskStatus::Queued).is_err());
    }
}
