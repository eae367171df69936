//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Campaign worker sends a message:
//!     → retries.rs (classify the failure, decide on another attempt)
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Every wait between attempts yields to shutdown
//! - Jittered backoff keeps retries from several workers from aligning

pub mod backoff;
pub mod retries;

pub use retries::RetryPolicy;
