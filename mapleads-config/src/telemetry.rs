use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Quiet by default with orchestration lifecycle at info. Override via `RUST_LOG`.
pub const DEFAULT_FILTER: &str = "info,mapleads::pacing=warn,mapleads::dedup=warn";

/// Installs the global subscriber: `RUST_LOG` when set, else `default_filter`.
///
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
