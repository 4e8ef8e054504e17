//! Shared configuration library for processes that embed the mapleads engine.
//!
//! This crate loads [`EngineSettings`] from files or the environment, applies
//! guard rails before an orchestrator is built, and installs the tracing
//! subscriber. Binaries call [`EngineSettings::load_from_env`] once at startup
//! and hand the resulting [`mapleads_core::EngineConfig`] to the engine.

pub mod settings;
pub mod telemetry;
pub mod validation;

pub use settings::{EngineSettings, SettingsLoad, SettingsSource};
pub use telemetry::init_tracing;
pub use validation::{ConfigWarning, ConfigWarnings, SettingsError};
