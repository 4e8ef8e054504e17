//! Request cadence control.
//!
//! The controller keeps one sliding-window log per scope (global, per-proxy,
//! per-worker). `acquire` never blocks and never drops a request: it either
//! records a grant or tells the caller how long to suspend before asking
//! again. Windows are rolling, so there is no burst at a wall-clock boundary.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{PacingConfig, PacingRule};
use crate::types::{ProxyId, WorkerId};

/// Granularity at which cadence limits are enforced.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PacingScope {
    Global,
    Proxy(ProxyId),
    Worker(WorkerId),
}

impl fmt::Display for PacingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacingScope::Global => f.write_str("global"),
            PacingScope::Proxy(id) => write!(f, "proxy:{id}"),
            PacingScope::Worker(id) => write!(f, "worker:{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingDecision {
    Granted,
    /// Suspend for this long, then call `acquire` again.
    Wait(Duration),
}

impl PacingDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, PacingDecision::Granted)
    }
}

/// Counters for a single scope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PacingStats {
    /// Grants inside each configured window, in config order.
    pub in_window: Vec<u32>,
    pub total_grants: u64,
    pub cooldowns: u64,
    pub consecutive_errors: u32,
    /// Remaining forced pause, if any.
    pub blocked_for_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct ScopeState {
    grants: VecDeque<Instant>,
    last_grant: Option<Instant>,
    spacing: Duration,
    blocked_until: Option<Instant>,
    consecutive_errors: u32,
    total_grants: u64,
    cooldowns: u64,
}

impl ScopeState {
    fn prune(&mut self, now: Instant, horizon: Duration) {
        while let Some(front) = self.grants.front() {
            if now.saturating_duration_since(*front) >= horizon {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: Instant, window: Duration) -> usize {
        self.grants
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    /// Time until every layer of `rule` admits one more grant.
    fn required_wait(&self, rule: &PacingRule, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;

        if let Some(until) = self.blocked_until {
            wait = wait.max(until.saturating_duration_since(now));
        }

        if let Some(last) = self.last_grant {
            wait = wait.max((last + self.spacing).saturating_duration_since(now));
        }

        for limit in &rule.windows {
            let window = limit.window();
            let count = self.in_window(now, window);
            if limit.limit == 0 {
                wait = wait.max(window);
                continue;
            }
            if count >= limit.limit as usize {
                // Enough of the oldest in-window grants must age out to make room.
                let first_in_window = self.grants.len() - count;
                let must_expire = count - limit.limit as usize;
                if let Some(oldest) = self.grants.get(first_in_window + must_expire) {
                    wait = wait.max((*oldest + window).saturating_duration_since(now));
                }
            }
        }

        wait
    }

    fn record_grant(&mut self, rule: &PacingRule, config: &PacingConfig, now: Instant) {
        self.grants.push_back(now);
        self.last_grant = Some(now);
        self.total_grants += 1;
        self.spacing = randomized_spacing(rule, self.consecutive_errors, config.error_backoff_cap);

        let mut pause = Duration::ZERO;
        if rule.pause_every > 0 && self.total_grants % u64::from(rule.pause_every) == 0 {
            pause = pause.max(Duration::from_millis(rule.pause_ms));
        }
        if rule.cooldown_every > 0 && self.total_grants % u64::from(rule.cooldown_every) == 0 {
            pause = pause.max(Duration::from_millis(rule.cooldown_ms));
            self.cooldowns += 1;
        }
        if !pause.is_zero() {
            self.extend_block(now + pause);
        }
    }

    fn extend_block(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

fn randomized_spacing(rule: &PacingRule, errors: u32, cap: u32) -> Duration {
    let min = rule.base_delay_min_ms;
    let max = rule.base_delay_max_ms.max(min);
    let base = if max > min {
        rand::rng().random_range(min..=max)
    } else {
        min
    };
    let multiplier = 2u64.saturating_pow(errors).min(u64::from(cap.max(1)));
    Duration::from_millis(base.saturating_mul(multiplier))
}

/// Layered sliding-window pacing shared by every job in the process.
pub struct PacingController {
    config: PacingConfig,
    scopes: DashMap<PacingScope, Arc<Mutex<ScopeState>>>,
}

impl fmt::Debug for PacingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacingController")
            .field("scopes", &self.scopes.len())
            .field("block_cooldown_ms", &self.config.block_cooldown_ms)
            .finish()
    }
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            scopes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    fn rule(&self, scope: &PacingScope) -> &PacingRule {
        match scope {
            PacingScope::Global => &self.config.global,
            PacingScope::Proxy(_) => &self.config.per_proxy,
            PacingScope::Worker(_) => &self.config.per_worker,
        }
    }

    fn horizon(&self, scope: &PacingScope) -> Duration {
        self.rule(scope)
            .windows
            .iter()
            .map(|w| w.window())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn state(&self, scope: &PacingScope) -> Arc<Mutex<ScopeState>> {
        self.scopes.entry(scope.clone()).or_default().clone()
    }

    fn clamp(&self, wait: Duration) -> Duration {
        let ceiling = self.config.cooldown_ceiling();
        if ceiling.is_zero() { wait } else { wait.min(ceiling) }
    }

    /// Grant one request in `scope` or report how long to wait.
    pub async fn acquire(&self, scope: &PacingScope) -> PacingDecision {
        self.acquire_all(std::slice::from_ref(scope)).await
    }

    /// Grant one request in every scope at once, or none of them.
    ///
    /// Scope locks are taken in sorted order so concurrent callers with
    /// overlapping scope sets cannot deadlock.
    pub async fn acquire_all(&self, scopes: &[PacingScope]) -> PacingDecision {
        let mut ordered: Vec<&PacingScope> = scopes.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards: Vec<(&PacingScope, OwnedMutexGuard<ScopeState>)> =
            Vec::with_capacity(ordered.len());
        for scope in ordered {
            guards.push((scope, self.state(scope).lock_owned().await));
        }

        let now = Instant::now();
        let mut wait = Duration::ZERO;
        for (scope, state) in guards.iter_mut() {
            let scope: &PacingScope = scope;
            state.prune(now, self.horizon(scope));
            wait = wait.max(state.required_wait(self.rule(scope), now));
        }

        if !wait.is_zero() {
            let wait = self.clamp(wait);
            debug!(target: "mapleads::pacing", wait_ms = wait.as_millis() as u64, "pacing wait");
            return PacingDecision::Wait(wait);
        }

        for (scope, state) in guards.iter_mut() {
            let scope: &PacingScope = scope;
            state.record_grant(self.rule(scope), &self.config, now);
        }
        PacingDecision::Granted
    }

    /// Loops on [`acquire_all`](Self::acquire_all), sleeping for each returned
    /// wait. Returns `false` if `cancel` fires first.
    pub async fn wait_for_grant(&self, scopes: &[PacingScope], cancel: &CancellationToken) -> bool {
        loop {
            match self.acquire_all(scopes).await {
                PacingDecision::Granted => return true,
                PacingDecision::Wait(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Forces `scope` to wait at least `duration` before the next grant.
    pub async fn penalize(&self, scope: &PacingScope, duration: Duration) {
        let state = self.state(scope);
        let mut state = state.lock().await;
        state.extend_block(Instant::now() + duration);
        state.cooldowns += 1;
        info!(
            target: "mapleads::pacing",
            scope = %scope,
            cooldown_ms = duration.as_millis() as u64,
            "scope cooldown applied"
        );
    }

    /// Elevated cooldown after a block/CAPTCHA signal.
    pub async fn penalize_block(&self, scope: &PacingScope) {
        self.penalize(scope, self.config.block_cooldown()).await;
    }

    /// Errors stretch the base spacing; enough of them in a row force a cooldown.
    pub async fn record_error(&self, scope: &PacingScope) {
        let state = self.state(scope);
        let mut state = state.lock().await;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        let errors = state.consecutive_errors;
        let rule = self.rule(scope);
        state.spacing = randomized_spacing(rule, errors, self.config.error_backoff_cap);

        let threshold = self.config.error_cooldown_after;
        if threshold > 0 && errors >= threshold && errors % threshold == 0 {
            state.extend_block(Instant::now() + self.config.error_cooldown());
            state.cooldowns += 1;
            info!(
                target: "mapleads::pacing",
                scope = %scope,
                errors,
                "consecutive errors, cooling down scope"
            );
        }
    }

    pub async fn record_success(&self, scope: &PacingScope) {
        let state = self.state(scope);
        let mut state = state.lock().await;
        state.consecutive_errors = 0;
    }

    /// Drops the state kept for `scope`. Returns false if none was tracked.
    pub fn forget(&self, scope: &PacingScope) -> bool {
        self.scopes.remove(scope).is_some()
    }

    pub fn tracked_scopes(&self) -> usize {
        self.scopes.len()
    }

    pub async fn stats(&self, scope: &PacingScope) -> PacingStats {
        let Some(state) = self.scopes.get(scope).map(|s| s.clone()) else {
            return PacingStats {
                in_window: vec![0; self.rule(scope).windows.len()],
                ..Default::default()
            };
        };
        let state = state.lock().await;
        let now = Instant::now();
        PacingStats {
            in_window: self
                .rule(scope)
                .windows
                .iter()
                .map(|w| state.in_window(now, w.window()) as u32)
                .collect(),
            total_grants: state.total_grants,
            cooldowns: state.cooldowns,
            consecutive_errors: state.consecutive_errors,
            blocked_for_ms: state
                .blocked_until
                .filter(|until| *until > now)
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }
}
