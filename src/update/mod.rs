//! Out-of-band release checks.

pub mod checker;

pub use checker::{is_newer, UpdateChecker, UpdateError};
