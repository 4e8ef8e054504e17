//! # MapLeads Core
//!
//! Engine that turns a business search into deduplicated, persisted leads.
//!
//! ## Overview
//!
//! - **Orchestration**: job lifecycle, task decomposition and a bounded
//!   worker pool per job ([`orchestration`])
//! - **Pacing**: sliding-window cadence limits per global, proxy and worker
//!   scope ([`pacing`])
//! - **Proxy health**: rotation, cooldowns and blacklisting ([`proxy`])
//! - **Deduplication**: place id, phone, fuzzy name/address and geo
//!   proximity matching with per-job duplicate policies ([`dedup`])
//! - **Checkpoints**: atomic progress snapshots for crash-safe resume
//!   ([`checkpoint`])
//!
//! Page extraction itself is out of scope: callers register an
//! [`orchestration::Extractor`] that turns a task into raw candidates.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mapleads_core::checkpoint::InMemoryCheckpointStore;
//! use mapleads_core::config::EngineConfig;
//! use mapleads_core::orchestration::{
//!     ExtractorRegistry, InProcEventBus, Orchestrator, OrchestratorParts, SearchSpec,
//! };
//! use mapleads_core::persistence::{InMemoryJobStore, InMemoryLeadStore};
//! use mapleads_core::types::ProxyId;
//!
//! async fn run(extractors: ExtractorRegistry) -> mapleads_core::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         EngineConfig::default(),
//!         OrchestratorParts {
//!             job_store: Arc::new(InMemoryJobStore::new()),
//!             lead_store: Arc::new(InMemoryLeadStore::new()),
//!             checkpoints: Arc::new(InMemoryCheckpointStore::new()),
//!             events: Arc::new(InProcEventBus::default()),
//!             extractors,
//!             proxies: vec![ProxyId::new("http://10.0.0.2:3128")],
//!         },
//!     )
//!     .await?;
//!
//!     let job_id = orchestrator
//!         .submit(SearchSpec::for_state("dentists", "Maharashtra", ["Pune", "Nagpur"]).with_target(200))
//!         .await?;
//!     let mut status = orchestrator.watch(job_id).await?;
//!     status.wait_for(|s| s.is_terminal()).await.ok();
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod error;
pub mod leads;
pub mod orchestration;
pub mod pacing;
pub mod persistence;
pub mod proxy;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use leads::{Lead, LeadFields, RawCandidate};
pub use orchestration::{Orchestrator, OrchestratorParts};
