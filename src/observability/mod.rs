//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (subsystem, messenger, job, ...)
//!     → lifecycle events on the EventBus (state changes, stops, triggers)
//!
//! Consumers:
//!     → logging.rs (stdout, pretty or JSON)
//!     → EventBus subscribers (tests, embedders)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through HTTP spans via tower-http
//! - `RUST_LOG` overrides the configured level

pub mod logging;

pub use logging::init;
