//! newsletterd: newsletter and campaign mail server core.
//!
//! The crate centres on the process lifecycle: ordered bootstrap with
//! rollback, trigger-driven shutdown with per-step deadlines, and reloads
//! that boot a fresh generation.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod messenger;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod update;

pub use config::AppConfig;
pub use http::HttpServer;
pub use lifecycle::{bootstrap, App, AppContext, BootstrapError, Lifecycle, LifecycleState, Supervisor};
pub use messenger::{Message, Messenger, MessengerError, MessengerRegistry};
