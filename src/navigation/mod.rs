//! Navigation through the host app to the mini-program
//!
//! - [`screen`] - logical screens and tri-state verification
//! - [`wait`] - cancellation tokens and poll-with-backoff
//! - [`machine`] - the per-device state machine

pub mod machine;
pub mod screen;
pub mod wait;

pub use machine::{device_log_target, Navigator};
pub use screen::{LogicalScreen, Verification, VerificationPolicy};
pub use wait::{pause, poll_until, Backoff, CancelToken};
