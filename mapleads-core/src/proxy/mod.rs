//! Egress endpoint health tracking and rotation.
//!
//! Every endpoint has its own lock; there is no manager-wide lock. Selection
//! is least-recently-used among healthy endpoints, which degrades to round
//! robin when all of them are used evenly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::types::ProxyId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Healthy,
    Cooldown,
    Blacklisted,
}

/// Why a request through an endpoint failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    /// Block or CAPTCHA page served through this endpoint.
    Blocked,
    /// Connection refused, auth rejected or similar: the endpoint itself is unusable.
    Dead,
    Other,
}

/// Point-in-time view of an endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: ProxyId,
    pub status: ProxyStatus,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub cooldown_expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProxyEndpoint {
    pub fn address(&self) -> &str {
        self.id.as_str()
    }
}

/// Selection preferences for [`ProxyHealthManager::next_healthy`].
#[derive(Clone, Debug, Default)]
pub struct ProxyHint {
    /// Use this endpoint if it is healthy.
    pub prefer: Option<ProxyId>,
    /// Skip these unless nothing else is healthy (e.g. the proxy a task was
    /// just blocked on).
    pub avoid: Vec<ProxyId>,
}

impl ProxyHint {
    pub fn avoiding(id: ProxyId) -> Self {
        Self {
            prefer: None,
            avoid: vec![id],
        }
    }
}

/// No endpoint can be handed out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no healthy proxy available")]
pub struct NoneAvailable {
    /// Earliest cooldown expiry, or `None` when every endpoint is blacklisted.
    pub retry_after: Option<Duration>,
}

impl NoneAvailable {
    /// True when waiting cannot help.
    pub fn is_permanent(&self) -> bool {
        self.retry_after.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyStats {
    pub healthy: usize,
    pub cooldown: usize,
    pub blacklisted: usize,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[derive(Debug)]
struct EndpointState {
    status: ProxyStatus,
    consecutive_failures: u32,
    total_failures: u32,
    successes: u64,
    cooldowns: u32,
    cooldown_until: Option<Instant>,
    last_used: Option<Instant>,
    last_used_at: Option<DateTime<Utc>>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            status: ProxyStatus::Healthy,
            consecutive_failures: 0,
            total_failures: 0,
            successes: 0,
            cooldowns: 0,
            cooldown_until: None,
            last_used: None,
            last_used_at: None,
        }
    }

    /// An expired cooldown returns the endpoint to rotation.
    fn refresh(&mut self, now: Instant) {
        if self.status == ProxyStatus::Cooldown
            && self.cooldown_until.is_none_or(|until| until <= now)
        {
            self.status = ProxyStatus::Healthy;
            self.cooldown_until = None;
        }
    }

    fn enter_cooldown(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        self.status = ProxyStatus::Cooldown;
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        self.cooldowns = self.cooldowns.saturating_add(1);
    }

    fn snapshot(&self, id: &ProxyId, now: Instant) -> ProxyEndpoint {
        ProxyEndpoint {
            id: id.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            cooldown_expires_at: self.cooldown_until.and_then(|until| {
                let remaining = until.saturating_duration_since(now);
                chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|d| Utc::now() + d)
            }),
            last_used: self.last_used_at,
        }
    }
}

/// Tracks endpoint health and hands out endpoints for dispatch.
pub struct ProxyHealthManager {
    config: ProxyConfig,
    order: Vec<ProxyId>,
    endpoints: DashMap<ProxyId, Arc<Mutex<EndpointState>>>,
}

impl fmt::Debug for ProxyHealthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHealthManager")
            .field("endpoints", &self.order.len())
            .field("cooldown_threshold", &self.config.cooldown_threshold)
            .field("blacklist_threshold", &self.config.blacklist_threshold)
            .finish()
    }
}

impl ProxyHealthManager {
    /// Registers `proxies` in the given order. Duplicates are ignored. With an
    /// empty list and `allow_direct`, a single direct endpoint is registered.
    pub fn new(config: ProxyConfig, proxies: impl IntoIterator<Item = ProxyId>) -> Self {
        let endpoints = DashMap::new();
        let mut order = Vec::new();
        for id in proxies {
            if endpoints
                .insert(id.clone(), Arc::new(Mutex::new(EndpointState::new())))
                .is_none()
            {
                order.push(id);
            }
        }
        if order.is_empty() && config.allow_direct {
            let direct = ProxyId::direct();
            endpoints.insert(direct.clone(), Arc::new(Mutex::new(EndpointState::new())));
            order.push(direct);
        }
        Self {
            config,
            order,
            endpoints,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn endpoint(&self, id: &ProxyId) -> Option<Arc<Mutex<EndpointState>>> {
        self.endpoints.get(id).map(|e| e.clone())
    }

    fn cooldown_for(&self, prior_cooldowns: u32) -> Duration {
        let factor = 2u32.saturating_pow(prior_cooldowns.min(16));
        self.config
            .cooldown_base()
            .saturating_mul(factor)
            .min(self.config.cooldown_max())
    }

    /// Picks the least recently used healthy endpoint and marks it used.
    pub async fn next_healthy(&self, hint: &ProxyHint) -> Result<ProxyEndpoint, NoneAvailable> {
        // A concurrent failure report can flip the chosen endpoint between the
        // scan and the claim; rescan a bounded number of times.
        for _ in 0..=self.order.len() {
            let now = Instant::now();
            let mut preferred: Option<ProxyId> = None;
            let mut best: Option<(bool, Option<Instant>, usize)> = None;
            let mut earliest_expiry: Option<Duration> = None;

            for (idx, id) in self.order.iter().enumerate() {
                let Some(endpoint) = self.endpoint(id) else {
                    continue;
                };
                let mut state = endpoint.lock().await;
                state.refresh(now);
                match state.status {
                    ProxyStatus::Healthy => {
                        if hint.prefer.as_ref() == Some(id) {
                            preferred = Some(id.clone());
                        }
                        // Sort key: avoided endpoints last, then never-used first, then oldest use.
                        let key = (hint.avoid.contains(id), state.last_used, idx);
                        if best.as_ref().is_none_or(|current| key < *current) {
                            best = Some(key);
                        }
                    }
                    ProxyStatus::Cooldown => {
                        if let Some(until) = state.cooldown_until {
                            let remaining = until.saturating_duration_since(now);
                            earliest_expiry =
                                Some(earliest_expiry.map_or(remaining, |e| e.min(remaining)));
                        }
                    }
                    ProxyStatus::Blacklisted => {}
                }
            }

            let chosen = preferred.or_else(|| best.map(|(_, _, idx)| self.order[idx].clone()));
            let Some(id) = chosen else {
                return Err(NoneAvailable {
                    retry_after: earliest_expiry,
                });
            };

            let Some(endpoint) = self.endpoint(&id) else {
                continue;
            };
            let mut state = endpoint.lock().await;
            let now = Instant::now();
            state.refresh(now);
            if state.status != ProxyStatus::Healthy {
                continue;
            }
            state.last_used = Some(now);
            state.last_used_at = Some(Utc::now());
            return Ok(state.snapshot(&id, now));
        }

        Err(NoneAvailable {
            retry_after: Some(Duration::ZERO),
        })
    }

    pub async fn report_success(&self, id: &ProxyId) {
        let Some(endpoint) = self.endpoint(id) else {
            return;
        };
        let mut state = endpoint.lock().await;
        state.consecutive_failures = 0;
        state.cooldowns = 0;
        state.successes += 1;
    }

    /// Records a failure and returns the endpoint's resulting status.
    pub async fn report_failure(&self, id: &ProxyId, kind: FailureKind) -> Option<ProxyStatus> {
        let endpoint = self.endpoint(id)?;
        let mut state = endpoint.lock().await;
        let now = Instant::now();
        state.refresh(now);
        if state.status == ProxyStatus::Blacklisted {
            return Some(ProxyStatus::Blacklisted);
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.total_failures = state.total_failures.saturating_add(1);

        if state.total_failures >= self.config.blacklist_threshold {
            state.status = ProxyStatus::Blacklisted;
            state.cooldown_until = None;
            warn!(
                target: "mapleads::proxy",
                proxy = %id,
                total_failures = state.total_failures,
                "proxy blacklisted"
            );
            return Some(ProxyStatus::Blacklisted);
        }

        let cooldown = match kind {
            FailureKind::Blocked => Some(self.config.block_cooldown()),
            FailureKind::Dead => Some(self.cooldown_for(state.cooldowns)),
            FailureKind::Timeout | FailureKind::Other
                if state.consecutive_failures >= self.config.cooldown_threshold =>
            {
                Some(self.cooldown_for(state.cooldowns))
            }
            _ => None,
        };

        if let Some(duration) = cooldown {
            state.enter_cooldown(now, duration);
            info!(
                target: "mapleads::proxy",
                proxy = %id,
                ?kind,
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = duration.as_millis() as u64,
                "proxy moved to cooldown"
            );
        }
        Some(state.status)
    }

    pub async fn snapshot(&self, id: &ProxyId) -> Option<ProxyEndpoint> {
        let endpoint = self.endpoint(id)?;
        let mut state = endpoint.lock().await;
        let now = Instant::now();
        state.refresh(now);
        Some(state.snapshot(id, now))
    }

    /// Snapshots of every endpoint in registration order.
    pub async fn endpoints(&self) -> Vec<ProxyEndpoint> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(snapshot) = self.snapshot(id).await {
                out.push(snapshot);
            }
        }
        out
    }

    pub async fn stats(&self) -> ProxyStats {
        let mut stats = ProxyStats::default();
        for id in &self.order {
            let Some(endpoint) = self.endpoint(id) else {
                continue;
            };
            let mut state = endpoint.lock().await;
            state.refresh(Instant::now());
            match state.status {
                ProxyStatus::Healthy => stats.healthy += 1,
                ProxyStatus::Cooldown => stats.cooldown += 1,
                ProxyStatus::Blacklisted => stats.blacklisted += 1,
            }
            stats.total_failures += u64::from(state.total_failures);
            stats.total_successes += state.successes;
        }
        stats
    }
}
