use mapleads_core::config::{PacingRule, WindowLimit};
use thiserror::Error;

use crate::settings::EngineSettings;

/// Settings the engine cannot run with.
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} minimum ({min}) exceeds maximum ({max})")]
    InvertedRange {
        field: &'static str,
        min: u64,
        max: u64,
    },
    #[error("{field} must be within {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },
    #[error("{scope} pacing window with a limit of 0 requests never admits a grant")]
    ClosedWindow { scope: &'static str },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.message.as_str())
    }

    /// Emits every warning through `tracing`.
    pub fn log(&self) {
        for item in &self.items {
            match &item.hint {
                Some(hint) => tracing::warn!(hint = %hint, "{}", item.message),
                None => tracing::warn!("{}", item.message),
            }
        }
    }
}

/// Rejects impossible settings and collects warnings for risky ones.
pub fn validate(settings: &EngineSettings) -> Result<ConfigWarnings, SettingsError> {
    let engine = &settings.engine;
    let mut warnings = ConfigWarnings::default();

    non_zero("workers.pool_size", engine.workers.pool_size as u64)?;
    non_zero("workers.extract_timeout_ms", engine.workers.extract_timeout_ms)?;
    non_zero("retry.max_attempts", u64::from(engine.retry.max_attempts))?;
    non_zero(
        "retry.persistence_attempts",
        u64::from(engine.retry.persistence_attempts),
    )?;
    non_zero("checkpoint.every_n_tasks", u64::from(engine.checkpoint.every_n_tasks))?;
    non_zero("blocks.distinct_proxies", engine.blocks.distinct_proxies as u64)?;
    non_zero("dedup.geohash_precision", engine.dedup.geohash_precision as u64)?;

    ordered(
        "retry.backoff",
        engine.retry.backoff_base_ms,
        engine.retry.backoff_max_ms,
    )?;
    ordered(
        "proxy.cooldown",
        engine.proxy.cooldown_base_ms,
        engine.proxy.cooldown_max_ms,
    )?;

    within(
        "retry.failure_ratio_threshold",
        "0.0..=1.0",
        engine.retry.failure_ratio_threshold,
        0.0,
        1.0,
    )?;
    for (field, value) in [
        ("dedup.name_similarity_threshold", engine.dedup.name_similarity_threshold),
        (
            "dedup.address_similarity_threshold",
            engine.dedup.address_similarity_threshold,
        ),
        ("dedup.proximity_name_threshold", engine.dedup.proximity_name_threshold),
    ] {
        within(field, "0.0..=100.0", value, 0.0, 100.0)?;
    }
    if engine.dedup.geohash_precision > 12 {
        return Err(SettingsError::OutOfRange {
            field: "dedup.geohash_precision",
            range: "1..=12",
            value: engine.dedup.geohash_precision as f64,
        });
    }
    if engine.dedup.proximity_meters.is_nan() || engine.dedup.proximity_meters <= 0.0 {
        return Err(SettingsError::OutOfRange {
            field: "dedup.proximity_meters",
            range: "> 0",
            value: engine.dedup.proximity_meters,
        });
    }

    for (scope, delay_field, rule) in [
        ("global", "pacing.global.base_delay", &engine.pacing.global),
        ("per_proxy", "pacing.per_proxy.base_delay", &engine.pacing.per_proxy),
        ("per_worker", "pacing.per_worker.base_delay", &engine.pacing.per_worker),
    ] {
        check_rule(scope, delay_field, rule)?;
    }

    let proxies = settings.proxy_ids();
    if proxies.is_empty() && !engine.proxy.allow_direct {
        warnings.push_with_hint(
            "No proxies configured and direct access is disabled; jobs will pause immediately",
            "List endpoints under `proxies` or set engine.proxy.allow_direct = true",
        );
    }
    if !proxies.is_empty() && engine.proxy.allow_direct {
        warnings.push("engine.proxy.allow_direct is ignored while proxies are configured");
    }
    if !proxies.is_empty() && engine.workers.pool_size > proxies.len() {
        warnings.push_with_hint(
            format!(
                "{} workers share {} proxies; some endpoints will carry parallel requests",
                engine.workers.pool_size,
                proxies.len()
            ),
            "Per-proxy pacing still applies, but blocks become more likely",
        );
    }
    if engine.pacing.global.windows.is_empty() {
        warnings.push_with_hint(
            "Global pacing has no rolling-window cap",
            "Add engine.pacing.global.windows to bound requests per minute/hour",
        );
    }
    if engine.proxy.blacklist_threshold <= engine.proxy.cooldown_threshold {
        warnings.push(format!(
            "proxy.blacklist_threshold ({}) is not above cooldown_threshold ({}); endpoints are blacklisted without a cooldown first",
            engine.proxy.blacklist_threshold, engine.proxy.cooldown_threshold
        ));
    }
    if engine.workers.extract_timeout_ms < 5_000 {
        warnings.push(format!(
            "workers.extract_timeout_ms = {} is short for a page render; expect spurious timeouts",
            engine.workers.extract_timeout_ms
        ));
    }
    if engine.checkpoint.every_n_tasks > 10 {
        warnings.push_with_hint(
            format!(
                "checkpoint.every_n_tasks = {}; up to that many tasks repeat after a crash",
                engine.checkpoint.every_n_tasks
            ),
            "Leads are still deduplicated, but extraction work is lost",
        );
    }

    Ok(warnings)
}

fn non_zero(field: &'static str, value: u64) -> Result<(), SettingsError> {
    if value == 0 {
        return Err(SettingsError::Zero { field });
    }
    Ok(())
}

fn ordered(field: &'static str, min: u64, max: u64) -> Result<(), SettingsError> {
    if min > max {
        return Err(SettingsError::InvertedRange { field, min, max });
    }
    Ok(())
}

fn within(
    field: &'static str,
    range: &'static str,
    value: f64,
    low: f64,
    high: f64,
) -> Result<(), SettingsError> {
    if !(low..=high).contains(&value) {
        return Err(SettingsError::OutOfRange {
            field,
            range,
            value,
        });
    }
    Ok(())
}

fn check_rule(
    scope: &'static str,
    delay_field: &'static str,
    rule: &PacingRule,
) -> Result<(), SettingsError> {
    ordered(delay_field, rule.base_delay_min_ms, rule.base_delay_max_ms)?;
    if rule
        .windows
        .iter()
        .any(|WindowLimit { limit, .. }| *limit == 0)
    {
        return Err(SettingsError::ClosedWindow { scope });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_with_a_proxy_warning() {
        let warnings = validate(&EngineSettings::default()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings.messages().any(|m| m.contains("No proxies")));
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        let mut settings = EngineSettings::default();
        settings.engine.pacing.per_proxy.base_delay_min_ms = 9_000;
        assert_eq!(
            validate(&settings).unwrap_err(),
            SettingsError::InvertedRange {
                field: "pacing.per_proxy.base_delay",
                min: 9_000,
                max: 8_000,
            }
        );
    }

    #[test]
    fn zero_pool_is_rejected() {
        let mut settings = EngineSettings::default();
        settings.engine.workers.pool_size = 0;
        assert_eq!(
            validate(&settings).unwrap_err(),
            SettingsError::Zero {
                field: "workers.pool_size"
            }
        );
    }

    #[test]
    fn closed_window_is_rejected() {
        let mut settings = EngineSettings::default();
        settings.engine.pacing.global.windows[0].limit = 0;
        assert_eq!(
            validate(&settings).unwrap_err(),
            SettingsError::ClosedWindow { scope: "global" }
        );
    }

    #[test]
    fn similarity_threshold_must_be_a_percentage() {
        let mut settings = EngineSettings::default();
        settings.engine.dedup.name_similarity_threshold = 0.85 * 200.0;
        assert!(matches!(
            validate(&settings),
            Err(SettingsError::OutOfRange {
                field: "dedup.name_similarity_threshold",
                ..
            })
        ));
    }

    #[test]
    fn more_workers_than_proxies_warns() {
        let mut settings = EngineSettings {
            proxies: vec!["http://a:1".into()],
            ..EngineSettings::default()
        };
        settings.engine.proxy.allow_direct = true;
        let warnings = validate(&settings).unwrap();
        let messages: Vec<&str> = warnings.messages().collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("allow_direct is ignored")));
        assert!(messages.iter().any(|m| m.contains("3 workers share 1 proxies")));
    }
}
