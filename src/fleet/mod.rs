//! Device fleet
//!
//! - [`session`] - one connected device and the actions it supports
//! - [`orchestrator`] - discovery, connection and dispatch across devices
//! - [`outcome`] - per-device outcomes and the fleet success policy

pub mod orchestrator;
pub mod outcome;
pub mod session;

pub use orchestrator::{DeviceAction, DispatchTarget, FleetOrchestrator};
pub use outcome::{success_rate, DeviceOutcome, DispatchResult, FleetMode};
pub use session::DeviceSession;
