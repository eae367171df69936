//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::scheduler::JobConfig;

/// Root configuration for newsletterd.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Process-level settings (listener address, update checks, reload).
    pub app: ServerConfig,

    /// Storage settings.
    pub db: DbConfig,

    /// The built-in `email` messenger.
    pub smtp: SmtpConfig,

    /// Additional HTTP postback messengers, keyed by name.
    pub messengers: Vec<PostbackConfig>,

    /// Campaign dispatch worker.
    pub campaign: CampaignConfig,

    /// Subscriber importer worker.
    pub importer: ImporterConfig,

    /// Optional bounce processor.
    pub bounce: BounceConfig,

    /// Periodic jobs run by the scheduler.
    pub jobs: Vec<JobConfig>,

    /// Notification template overrides.
    pub templates: TemplatesConfig,

    /// Per-step shutdown deadlines.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener (e.g., "0.0.0.0:9000").
    pub address: String,

    /// Poll for newer releases in the background.
    pub check_updates: bool,

    /// Release feed queried by the update checker.
    pub update_url: String,

    /// Seconds between update checks.
    pub update_interval_secs: u64,

    /// Fire a reload when the config file changes on disk.
    pub watch_config: bool,

    /// Boot a fresh generation after a reload trigger instead of exiting.
    pub restart_on_reload: bool,

    /// Addresses that receive operator notifications (import results).
    pub notify_emails: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            check_updates: false,
            update_url: "https://api.github.com/repos/newsletterd/newsletterd/releases/latest"
                .to_string(),
            update_interval_secs: 24 * 60 * 60,
            watch_config: false,
            restart_on_reload: true,
            notify_emails: Vec::new(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub path: String,

    /// Number of pooled connections.
    pub max_open: usize,

    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,

    /// Optional query file replacing the embedded one.
    pub queries_path: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: "newsletterd.db".to_string(),
            max_open: 4,
            busy_timeout_ms: 5000,
            queries_path: None,
        }
    }
}

/// SMTP authentication mechanism.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpAuth {
    #[default]
    None,
    Plain,
    Login,
}

/// Transport security for the SMTP connection.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain TCP. Only for local relays, and never with `auth`.
    None,
    /// Upgrade with STARTTLS after EHLO. Fails if the server does not offer it.
    #[default]
    StartTls,
    /// Implicit TLS from the first byte (usually port 465).
    Tls,
}

/// SMTP messenger configuration. Credentials only ever come from here.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Register the `email` messenger.
    pub enabled: bool,

    /// SMTP relay host.
    pub host: String,

    /// SMTP relay port.
    pub port: u16,

    pub tls: SmtpTls,

    /// Authentication mechanism.
    pub auth: SmtpAuth,

    pub username: String,

    pub password: String,

    /// Envelope and header sender.
    pub from: String,

    /// Name announced in EHLO.
    pub hello_hostname: String,

    /// Per-command I/O timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 25,
            tls: SmtpTls::StartTls,
            auth: SmtpAuth::None,
            username: String::new(),
            password: String::new(),
            from: "newsletter@localhost".to_string(),
            hello_hostname: "localhost".to_string(),
            timeout_secs: 10,
        }
    }
}

/// HTTP postback messenger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostbackConfig {
    /// Unique messenger name (`email` is reserved).
    pub name: String,

    /// Endpoint receiving the JSON message.
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Request timeout in seconds.
    #[serde(default = "default_postback_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_postback_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Campaign dispatch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Capacity of the outbound message queue.
    pub queue_size: usize,

    /// Attempts per message before giving up.
    pub max_send_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub retry_base_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub retry_max_ms: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            max_send_attempts: 3,
            retry_base_ms: 200,
            retry_max_ms: 5000,
        }
    }
}

/// Subscriber importer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Capacity of the import request queue.
    pub queue_size: usize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self { queue_size: 16 }
    }
}

/// What to do with a subscriber once a bounce threshold is reached.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BounceAction {
    None,
    Blocklist,
    Delete,
}

/// Threshold and action for one bounce kind.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BounceRule {
    pub count: u32,
    pub action: BounceAction,
}

/// Per-kind bounce rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BounceActions {
    pub soft: BounceRule,
    pub hard: BounceRule,
    pub complaint: BounceRule,
}

impl Default for BounceActions {
    fn default() -> Self {
        Self {
            soft: BounceRule { count: 2, action: BounceAction::None },
            hard: BounceRule { count: 1, action: BounceAction::Blocklist },
            complaint: BounceRule { count: 1, action: BounceAction::Blocklist },
        }
    }
}

/// Bounce processor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BounceConfig {
    /// Start the bounce processor.
    pub enabled: bool,

    /// Capacity of the bounce queue.
    pub queue_size: usize,

    pub actions: BounceActions,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_size: 256,
            actions: BounceActions::default(),
        }
    }
}

/// Notification template overrides.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Directory of `*.html` files overriding the built-in templates.
    pub dir: Option<String>,
}

/// Deadlines, in seconds, for each shutdown step.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub scheduler_secs: u64,
    pub listener_secs: u64,
    pub workers_secs: u64,
    pub messengers_secs: u64,
    pub storage_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            scheduler_secs: 5,
            listener_secs: 1,
            workers_secs: 10,
            messengers_secs: 5,
            storage_secs: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
