//! Message transports.
//!
//! # Data Flow
//! ```text
//! config (smtp, [[messengers]])
//!     → smtp.rs / postback.rs (construct + validate)
//!     → registry.rs (keyed by name)
//!     → campaign worker looks up by name and sends
//!
//! Shutdown:
//!     registry.close_all() closes every held instance exactly once
//! ```
//!
//! # Design Decisions
//! - A messenger is an opaque send/close capability; the core never
//!   inspects transport details
//! - Credentials come from configuration only

pub mod postback;
pub mod registry;
pub mod smtp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use postback::PostbackMessenger;
pub use registry::MessengerRegistry;
pub use smtp::SmtpMessenger;

/// Name of the built-in SMTP messenger.
pub const EMAIL_MESSENGER: &str = "email";

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub content_type: String,
    /// Campaign this message belongs to, if any.
    pub campaign_id: Option<i64>,
}

impl Message {
    /// An HTML message with a fresh id.
    pub fn new(to: Vec<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            to,
            subject: subject.into(),
            body: body.into(),
            content_type: "text/html".to_string(),
            campaign_id: None,
        }
    }

    pub fn with_campaign(mut self, campaign_id: i64) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }
}

/// Error type for messenger operations.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("messenger not found: {0}")]
    NotFound(String),

    #[error("messenger {0} is closed")]
    Closed(String),

    /// Bad configuration at construction, or a message the transport refuses to carry.
    #[error("invalid input for the {name} messenger: {reason}")]
    Invalid { name: String, reason: String },

    #[error("SMTP server replied {code}: {text}")]
    Smtp { code: u16, text: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A named transport able to deliver [`Message`]s.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<(), MessengerError>;

    /// Release the transport. Sends after close fail with
    /// [`MessengerError::Closed`].
    async fn close(&self) -> Result<(), MessengerError>;
}
