//! Scrape job orchestration.
//!
//! A job is decomposed into independent search tasks, each task is handed to
//! a worker, and every resolution is reflected in the job record, a durable
//! checkpoint and the event stream.

pub mod events;
pub mod extractor;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod search;
pub mod task;
mod worker;

pub use events::{EngineEvent, EventSink, JobUpdate};
pub use extractor::{
    ExtractionError, ExtractionErrorKind, ExtractionRequest, ExtractionRequirements, Extractor,
    ExtractorCapabilities, ExtractorRegistry,
};
pub use job::{JobCondition, JobCounts, JobStatus, ScrapeJob};
pub use orchestrator::{Orchestrator, OrchestratorParts};
pub use retry::{RetryDecision, RetryPolicy};
pub use runtime::{InProcEventBus, ResumePlan};
pub use search::{BoundingBox, FieldSelection, GridSpec, PostFilters, SearchSpec};
pub use task::{Attempts, SearchTask, TaskStatus, TaskTarget, decompose};
