//! Device driver adapter
//!
//! The crate never talks to a phone directly. Everything goes through the
//! [`DeviceDriver`] capability trait, obtained from a [`DeviceTransport`]:
//!
//! - [`adb`] - transport over the `adb` command-line tool
//! - [`mock`] - scriptable doubles used by the test suite
//! - [`uitree`] - structured UI hierarchy and attribute selectors

pub mod adb;
pub mod mock;
pub mod traits;
pub mod uitree;

pub use adb::{AdbDriver, AdbTransport};
pub use mock::{DriverCall, MockDriver, MockHandle, MockScreen, MockTransport};
pub use traits::{
    DeviceDriver, DeviceIdentity, DeviceListing, DeviceTransport, DriverResult, ForegroundApp, Key,
};
pub use uitree::{Rect, Selector, UiNode, UiTree};
