//! Miniprogram Fleet
//!
//! Drives a fleet of Android devices into a mini-program hosted inside a chat
//! app, using the UI tree where it can be trusted and screen analysis where it
//! cannot.
//!
//! A [`FleetOrchestrator`] discovers or connects the configured devices and
//! owns one [`DeviceSession`] per device. Actions dispatched to the fleet run
//! on each session, serially or one thread per device, and come back as a
//! [`DispatchResult`] with a per-device outcome and a fleet verdict.

pub mod config;
pub mod driver;
pub mod error;
pub mod fleet;
pub mod locator;
pub mod navigation;
pub mod vision;

// Re-export commonly used types
pub use config::{FleetConfig, FleetOptions, HeuristicTable, Heuristics, MiniprogramConfig, Timeouts};
pub use driver::{DeviceDriver, DeviceIdentity, DeviceTransport, MockDriver, MockTransport};
pub use error::{DriverError, FleetError, Result};
pub use fleet::{DeviceOutcome, DeviceSession, DispatchResult, DispatchTarget, FleetMode, FleetOrchestrator};
pub use locator::{LocateRequest, LocateResult, ScreenLocator, Strategy};
pub use navigation::{CancelToken, LogicalScreen, Navigator, Verification, VerificationPolicy};
pub use vision::ScreenshotStore;
