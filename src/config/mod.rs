//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + NEWSLETTERD_* environment
//!     → loader.rs (parse, merge overrides, deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → AppConfig (validated, immutable)
//!     → shared via Arc through AppContext to every subsystem
//!
//! On file change (app.watch_config):
//!     watcher.rs detects change
//!     → loader.rs loads and validates the new file
//!     → a Reload trigger is fired
//!     → the supervisor tears down and boots a new generation
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Transport credentials live only here, never in code

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AppConfig, BounceAction, BounceActions, BounceConfig, BounceRule, CampaignConfig, DbConfig,
    ImporterConfig, LogFormat, ObservabilityConfig, PostbackConfig, ServerConfig, ShutdownConfig,
    SmtpAuth, SmtpConfig, SmtpTls, TemplatesConfig,
};
pub use validation::ValidationError;
pub use watcher::ConfigWatcher;
