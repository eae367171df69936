//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! app.address
//!     → listener.rs (parse, bind)
//!     → Hand off to HTTP layer (http::server)
//! ```

pub mod listener;

pub use listener::{bind, ListenerError};
