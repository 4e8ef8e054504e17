//! The extractor seam: turns a search task into raw candidates or a typed failure.
//!
//! Extraction strategies are versioned. Each implementation reports what it
//! can do through [`Extractor::capabilities`], and [`ExtractorRegistry`]
//! picks one per job at submission time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::search::FieldSelection;
use super::task::TaskTarget;
use crate::leads::RawCandidate;
use crate::proxy::ProxyEndpoint;
use crate::types::{JobId, TaskId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    NetworkTimeout,
    BlockedOrCaptcha,
    ParseFailure,
    NotFound,
    ProxyDead,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::NetworkTimeout, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::BlockedOrCaptcha, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::ParseFailure, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::NotFound, message)
    }

    pub fn proxy_dead(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::ProxyDead, message)
    }
}

/// One unit of work handed to an extractor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub target: TaskTarget,
    /// `None` only for direct egress.
    pub proxy: Option<ProxyEndpoint>,
    pub fields: FieldSelection,
    /// 1-based dispatch counter for this task.
    pub attempt: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorCapabilities {
    pub name: String,
    /// Selector/strategy revision; higher wins during negotiation.
    pub strategy_version: u32,
    pub supports_grid: bool,
    pub fields: FieldSelection,
}

impl ExtractorCapabilities {
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.strategy_version)
    }
}

/// What a job needs from an extractor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ExtractionRequirements {
    pub needs_grid: bool,
    pub fields: FieldSelection,
    pub min_version: Option<u32>,
}

impl ExtractionRequirements {
    pub fn satisfied_by(&self, caps: &ExtractorCapabilities) -> bool {
        (!self.needs_grid || caps.supports_grid)
            && self.fields.is_subset_of(&caps.fields)
            && self
                .min_version
                .is_none_or(|min| caps.strategy_version >= min)
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn capabilities(&self) -> ExtractorCapabilities;

    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> std::result::Result<Vec<RawCandidate>, ExtractionError>;
}

/// Available extraction strategies.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.extractors.iter().map(|e| e.capabilities().label()))
            .finish()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.register(extractor);
        self
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Highest strategy version satisfying `requirements`. Registration order
    /// breaks ties.
    pub fn negotiate(&self, requirements: &ExtractionRequirements) -> Option<Arc<dyn Extractor>> {
        let mut best: Option<(u32, &Arc<dyn Extractor>)> = None;
        for extractor in &self.extractors {
            let caps = extractor.capabilities();
            if !requirements.satisfied_by(&caps) {
                continue;
            }
            if best.is_none_or(|(version, _)| caps.strategy_version > version) {
                best = Some((caps.strategy_version, extractor));
            }
        }
        best.map(|(_, extractor)| extractor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ExtractorCapabilities);

    #[async_trait]
    impl Extractor for Fixed {
        fn capabilities(&self) -> ExtractorCapabilities {
            self.0.clone()
        }

        async fn extract(
            &self,
            _request: &ExtractionRequest,
        ) -> std::result::Result<Vec<RawCandidate>, ExtractionError> {
            Ok(Vec::new())
        }
    }

    fn caps(name: &str, version: u32, grid: bool, fields: FieldSelection) -> Arc<dyn Extractor> {
        Arc::new(Fixed(ExtractorCapabilities {
            name: name.into(),
            strategy_version: version,
            supports_grid: grid,
            fields,
        }))
    }

    #[test]
    fn negotiation_prefers_highest_satisfying_version() {
        let no_email = FieldSelection {
            email: false,
            ..FieldSelection::all()
        };
        let registry = ExtractorRegistry::new()
            .with(caps("listing", 1, false, FieldSelection::all()))
            .with(caps("listing", 3, false, no_email))
            .with(caps("grid", 2, true, FieldSelection::all()));

        let plain = ExtractionRequirements {
            fields: no_email,
            ..Default::default()
        };
        assert_eq!(
            registry.negotiate(&plain).unwrap().capabilities().label(),
            "listing@3"
        );

        let with_email = ExtractionRequirements::default();
        assert_eq!(
            registry.negotiate(&with_email).unwrap().capabilities().label(),
            "grid@2"
        );

        let grid_v3 = ExtractionRequirements {
            needs_grid: true,
            min_version: Some(3),
            fields: no_email,
        };
        assert!(registry.negotiate(&grid_v3).is_none());
    }
}
