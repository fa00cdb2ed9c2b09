//! Capability interface consumed from the device-automation driver
//!
//! These traits allow for dependency injection: the orchestrator and the
//! navigator only ever talk to a `dyn DeviceDriver`, so tests run against
//! [`MockDriver`](super::mock::MockDriver) without real hardware.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::uitree::{Selector, UiNode, UiTree};
use crate::error::DriverError;

/// Result type for driver calls
pub type DriverResult<T> = Result<T, DriverError>;

/// Logical device name plus opaque connection string (serial, `ip:port`, emulator id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub connect_info: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, connect_info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_info: connect_info.into(),
        }
    }

    /// Whether the connection string addresses a device over the network
    pub fn is_network(&self) -> bool {
        self.connect_info
            .rsplit_once(':')
            .map_or(false, |(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.connect_info)
    }
}

/// One entry of the transport's attached-device list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub serial: String,
    /// Transport state, e.g. `device`, `offline`, `unauthorized`
    pub state: String,
}

impl DeviceListing {
    pub fn new(serial: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: state.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

/// Package and activity currently displayed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundApp {
    pub package: String,
    pub activity: String,
}

impl ForegroundApp {
    pub fn new(package: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            activity: activity.into(),
        }
    }

    /// Whether the activity ends with any of `suffixes`.
    ///
    /// Activities come back either package-relative (`.ui.LauncherUI`) or
    /// fully qualified, so suffix comparison covers both.
    pub fn activity_matches<S: AsRef<str>>(&self, suffixes: &[S]) -> bool {
        suffixes
            .iter()
            .any(|s| !s.as_ref().is_empty() && self.activity.ends_with(s.as_ref()))
    }
}

/// Hardware and soft keys the navigator presses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Home,
    Back,
    Enter,
    Search,
    Delete,
    /// Driver-specific key name
    Named(String),
}

impl Key {
    pub fn name(&self) -> &str {
        match self {
            Key::Home => "home",
            Key::Back => "back",
            Key::Enter => "enter",
            Key::Search => "search",
            Key::Delete => "delete",
            Key::Named(n) => n,
        }
    }
}

impl std::str::FromStr for Key {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "home" => Key::Home,
            "back" => Key::Back,
            "enter" => Key::Enter,
            "search" => Key::Search,
            "delete" | "del" => Key::Delete,
            other => Key::Named(other.to_string()),
        })
    }
}

/// A live connection to one device. Never shared between threads at the same time.
pub trait DeviceDriver: Send {
    /// Capture the current screen
    fn capture(&mut self) -> DriverResult<DynamicImage>;

    /// Dump the UI hierarchy
    fn dump_ui_tree(&mut self) -> DriverResult<UiTree>;

    /// Dump the UI tree and return the first element matching `selector`
    fn find_element(&mut self, selector: &Selector) -> DriverResult<Option<UiNode>> {
        Ok(self.dump_ui_tree()?.find(selector).cloned())
    }

    fn tap(&mut self, x: u32, y: u32) -> DriverResult<()>;

    fn swipe(&mut self, from: (u32, u32), to: (u32, u32)) -> DriverResult<()>;

    /// Type text into the focused input
    fn send_keys(&mut self, text: &str) -> DriverResult<()>;

    /// Clear the focused input
    fn clear_text(&mut self) -> DriverResult<()>;

    fn press_key(&mut self, key: Key) -> DriverResult<()>;

    fn foreground_app(&mut self) -> DriverResult<ForegroundApp>;

    /// Screen size in pixels as (width, height)
    fn screen_size(&mut self) -> DriverResult<(u32, u32)>;

    /// Launch (or bring to front) the app with this package name
    fn app_start(&mut self, package: &str) -> DriverResult<()>;

    /// Stop any automation service the driver started on the device
    fn stop_automation_service(&mut self) -> DriverResult<()>;
}

/// Discovers devices and opens driver handles
pub trait DeviceTransport: Send + Sync {
    /// All attached devices regardless of state
    fn list_devices(&self) -> DriverResult<Vec<DeviceListing>>;

    /// Connect and complete the driver handshake
    fn connect(&self, identity: &DeviceIdentity) -> DriverResult<Box<dyn DeviceDriver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_network_detection() {
        assert!(DeviceIdentity::new("mumu_1", "127.0.0.1:16384").is_network());
        assert!(!DeviceIdentity::new("leidian_1", "emulator-5554").is_network());
        assert!(!DeviceIdentity::new("phone", "R58M123ABC").is_network());
    }

    #[test]
    fn test_activity_suffix_matching() {
        let fg = ForegroundApp::new("com.tencent.mm", "com.tencent.mm.plugin.appbrand.ui.AppBrandUI01");
        assert!(fg.activity_matches(&[".ui.AppBrandUI", ".ui.AppBrandUI01"]));
        assert!(!fg.activity_matches(&[".plugin.appbrand.ui.AppBrandPluginUI", ""]));

        let short = ForegroundApp::new("com.tencent.mm", ".plugin.appbrand.ui.AppBrandPluginUI");
        assert!(short.activity_matches(&[".plugin.appbrand.ui.AppBrandPluginUI"]));
    }

    #[test]
    fn test_key_parse() {
        assert_eq!("HOME".parse::<Key>().unwrap(), Key::Home);
        assert_eq!("del".parse::<Key>().unwrap(), Key::Delete);
        assert_eq!("volume_up".parse::<Key>().unwrap(), Key::Named("volume_up".into()));
    }
}
