use std::time::Duration;

use crate::config::RetryConfig;

use super::extractor::ExtractionErrorKind;
use super::task::Attempts;

/// What to do with a task after an extraction error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after a backoff delay.
    Retry { after: Duration },
    /// Requeue immediately, on a different endpoint where possible.
    Requeue,
    /// Give up; the task is failed.
    Terminal,
    /// Not an error for the task: mark it done with no leads.
    Complete,
}

/// Maps an error kind plus the task's attempt counters to a decision.
/// `attempts` already includes the failure being decided on.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Exponential backoff: `base * 2^(failures - 1)`, capped.
    pub fn backoff(&self, failures: u16) -> Duration {
        let exp = u32::from(failures.saturating_sub(1)).min(20);
        self.config
            .backoff_base()
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.backoff_max())
    }

    pub fn decide(&self, kind: ExtractionErrorKind, attempts: Attempts) -> RetryDecision {
        let budget_left = attempts.failures < self.config.max_attempts;
        match kind {
            ExtractionErrorKind::NotFound => RetryDecision::Complete,
            ExtractionErrorKind::NetworkTimeout if budget_left => RetryDecision::Retry {
                after: self.backoff(attempts.failures),
            },
            ExtractionErrorKind::ParseFailure
                if budget_left && attempts.parse_failures <= self.config.parse_failure_retries =>
            {
                RetryDecision::Retry {
                    after: self.backoff(attempts.failures),
                }
            }
            ExtractionErrorKind::ProxyDead if budget_left => RetryDecision::Requeue,
            ExtractionErrorKind::BlockedOrCaptcha
                if attempts.blocks <= self.config.max_block_requeues =>
            {
                RetryDecision::Requeue
            }
            _ => RetryDecision::Terminal,
        }
    }
}
