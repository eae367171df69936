//! Domain services.
//!
//! # Data Flow
//! ```text
//! scheduler / importer notifications
//!     → campaign.rs (bounded queue → registry lookup → send with retries)
//! import submissions
//!     → importer.rs (transactional upsert → status notification)
//! bounce reports (optional)
//!     → bounce.rs (record → threshold → blocklist/delete)
//! templates.rs renders notification bodies for the above
//! ```
//!
//! # Design Decisions
//! - Each worker owns its receiver; producers hold cheap cloneable queues
//! - Workers never touch the lifecycle state, they only watch their token

pub mod bounce;
pub mod campaign;
pub mod importer;
pub mod templates;

pub use bounce::{Bounce, BounceKind, BounceProcessor, BounceQueue};
pub use campaign::{CampaignCounters, CampaignManager, CampaignQueue, CampaignStats, Dispatch};
pub use importer::{ImportJob, ImportQueue, ImportRow, Importer};
pub use templates::{NotifTemplates, TemplateError};
