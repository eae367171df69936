//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (listener bound by bootstrap)
//!     → server.rs (Axum setup, request ID, tracing, timeout)
//!     → /health (always answered, 503 unless Running)
//!     → middleware/lifecycle_gate.rs → /api/* (Running only)
//! ```

pub mod middleware;
pub mod server;

pub use server::{AppState, HttpServer};
