use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune engine behaviour.
///
/// The configuration is immutable once the engine is built: every component
/// receives its own section at construction time. All fields carry defaults so
/// deployments can override only what they need.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool sizing and extractor timeout.
    pub workers: WorkerPoolConfig,
    /// Retry/backoff policy shared by all workers.
    pub retry: RetryConfig,
    /// Request cadence limits per pacing scope.
    pub pacing: PacingConfig,
    /// Proxy health thresholds and cooldown windows.
    pub proxy: ProxyConfig,
    /// Duplicate detection thresholds.
    pub dedup: DedupConfig,
    /// Escalation of block/CAPTCHA signals to a job-wide pause.
    pub blocks: BlockEscalationConfig,
    /// Checkpoint cadence.
    pub checkpoint: CheckpointConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Concurrent workers per job.
    pub pool_size: usize,
    /// Upper bound for a single extractor call; exceeding it is a `NetworkTimeout`.
    pub extract_timeout_ms: u64,
    /// How long an idle worker waits before re-checking the queue when
    /// nothing signals it.
    pub idle_poll_ms: u64,
}

impl WorkerPoolConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            extract_timeout_ms: 60_000,
            idle_poll_ms: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed dispatches allowed per task before it is failed. Block signals
    /// have their own budget (`max_block_requeues`).
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Extra attempts granted to a parse failure before it becomes terminal.
    pub parse_failure_retries: u16,
    /// Block/CAPTCHA requeues allowed per task before it is failed.
    pub max_block_requeues: u16,
    /// A job whose terminally failed share exceeds this ratio ends `failed`.
    pub failure_ratio_threshold: f64,
    /// Attempts for a single persistence operation before the job is paused.
    pub persistence_attempts: u16,
    pub persistence_backoff_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn persistence_backoff(&self) -> Duration {
        Duration::from_millis(self.persistence_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 5_000,
            backoff_max_ms: 5 * 60 * 1_000,
            parse_failure_retries: 1,
            max_block_requeues: 3,
            failure_ratio_threshold: 0.5,
            persistence_attempts: 3,
            persistence_backoff_ms: 250,
        }
    }
}

/// Cap on acquisitions inside a rolling window.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u32,
    pub window_ms: u64,
}

impl WindowLimit {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Layered limits for one pacing scope kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingRule {
    /// Rolling-window caps; every one of them must admit a grant.
    pub windows: Vec<WindowLimit>,
    /// Randomized spacing between two grants in the same scope.
    pub base_delay_min_ms: u64,
    pub base_delay_max_ms: u64,
    /// Short pause after every `pause_every` grants (0 disables).
    pub pause_every: u32,
    pub pause_ms: u64,
    /// Longer cooldown after every `cooldown_every` grants (0 disables).
    pub cooldown_every: u32,
    pub cooldown_ms: u64,
}

impl PacingRule {
    pub fn unrestricted() -> Self {
        Self {
            windows: Vec::new(),
            base_delay_min_ms: 0,
            base_delay_max_ms: 0,
            pause_every: 0,
            pause_ms: 0,
            cooldown_every: 0,
            cooldown_ms: 0,
        }
    }
}

impl Default for PacingRule {
    fn default() -> Self {
        Self::unrestricted()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub global: PacingRule,
    pub per_proxy: PacingRule,
    pub per_worker: PacingRule,
    /// Elevated cooldown applied to a scope after a block/CAPTCHA signal.
    pub block_cooldown_ms: u64,
    /// Cooldown applied to a scope after `error_cooldown_after` consecutive errors.
    pub error_cooldown_ms: u64,
    pub error_cooldown_after: u32,
    /// Maximum multiplier applied to the base delay while errors accumulate.
    pub error_backoff_cap: u32,
    /// No single wait handed back by `acquire` exceeds this ceiling.
    pub cooldown_ceiling_ms: u64,
}

impl PacingConfig {
    pub fn block_cooldown(&self) -> Duration {
        Duration::from_millis(self.block_cooldown_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn cooldown_ceiling(&self) -> Duration {
        Duration::from_millis(self.cooldown_ceiling_ms)
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            global: PacingRule {
                windows: vec![
                    WindowLimit {
                        limit: 20,
                        window_ms: 60_000,
                    },
                    WindowLimit {
                        limit: 100,
                        window_ms: 60 * 60_000,
                    },
                ],
                base_delay_min_ms: 0,
                base_delay_max_ms: 0,
                pause_every: 10,
                pause_ms: 30_000,
                cooldown_every: 50,
                cooldown_ms: 5 * 60_000,
            },
            per_proxy: PacingRule {
                windows: vec![WindowLimit {
                    limit: 10,
                    window_ms: 60_000,
                }],
                base_delay_min_ms: 3_000,
                base_delay_max_ms: 8_000,
                pause_every: 0,
                pause_ms: 0,
                cooldown_every: 0,
                cooldown_ms: 0,
            },
            per_worker: PacingRule {
                windows: Vec::new(),
                base_delay_min_ms: 3_000,
                base_delay_max_ms: 8_000,
                pause_every: 0,
                pause_ms: 0,
                cooldown_every: 0,
                cooldown_ms: 0,
            },
            block_cooldown_ms: 30 * 60_000,
            error_cooldown_ms: 60_000,
            error_cooldown_after: 3,
            error_backoff_cap: 8,
            cooldown_ceiling_ms: 60 * 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Consecutive failures that move an endpoint into cooldown.
    pub cooldown_threshold: u32,
    /// Cumulative failures that blacklist an endpoint permanently.
    pub blacklist_threshold: u32,
    pub cooldown_base_ms: u64,
    pub cooldown_max_ms: u64,
    /// Cooldown applied to an endpoint that reported a block/CAPTCHA page.
    pub block_cooldown_ms: u64,
    /// Register a single direct endpoint when no proxy list is supplied.
    pub allow_direct: bool,
}

impl ProxyConfig {
    pub fn cooldown_base(&self) -> Duration {
        Duration::from_millis(self.cooldown_base_ms)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_millis(self.cooldown_max_ms)
    }

    pub fn block_cooldown(&self) -> Duration {
        Duration::from_millis(self.block_cooldown_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cooldown_threshold: 3,
            blacklist_threshold: 10,
            cooldown_base_ms: 60_000,
            cooldown_max_ms: 30 * 60_000,
            block_cooldown_ms: 30 * 60_000,
            allow_direct: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Token-set name similarity (0-100) needed for a fuzzy match within a block.
    pub name_similarity_threshold: f64,
    /// Address similarity reported with fuzzy matches (0-100).
    pub address_similarity_threshold: f64,
    /// Radius for the geo-proximity review rule.
    pub proximity_meters: f64,
    /// Lower name similarity bar that accompanies the proximity rule.
    pub proximity_name_threshold: f64,
    /// Country calling code prefixed to bare national numbers.
    pub default_country_code: String,
    /// Length of a national number without trunk prefix.
    pub national_number_len: usize,
    /// Geohash length used for geo-cells. 7 chars is roughly 150m.
    pub geohash_precision: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            name_similarity_threshold: 85.0,
            address_similarity_threshold: 80.0,
            proximity_meters: 50.0,
            proximity_name_threshold: 70.0,
            default_country_code: "91".to_string(),
            national_number_len: 10,
            geohash_precision: 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockEscalationConfig {
    /// Rolling window in which block signals are correlated.
    pub window_ms: u64,
    /// Distinct proxies reporting blocks inside the window that pause the job.
    pub distinct_proxies: usize,
}

impl BlockEscalationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for BlockEscalationConfig {
    fn default() -> Self {
        Self {
            window_ms: 10 * 60_000,
            distinct_proxies: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write a checkpoint after this many task resolutions (1 = every task).
    /// A final checkpoint is always written when the job reaches a terminal state.
    pub every_n_tasks: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { every_n_tasks: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{ "workers": { "pool_size": 2 }, "dedup": { "proximity_meters": 25.0 } }"#;
        let config: EngineConfig = serde_json::from_str(raw).expect("valid config");

        assert_eq!(config.workers.pool_size, 2);
        assert_eq!(config.workers.extract_timeout_ms, 60_000);
        assert_eq!(config.dedup.proximity_meters, 25.0);
        assert_eq!(config.dedup.name_similarity_threshold, 85.0);
        assert_eq!(config.proxy.cooldown_threshold, 3);
        assert_eq!(config.pacing.global.windows.len(), 2);
    }
}
