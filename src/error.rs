//! Error types for the fleet
//!
//! `DriverError` covers the device transport; `FleetError` is what the rest of
//! the crate returns. Errors never leave a device session as values: the
//! orchestrator turns them into a failed [`DeviceOutcome`](crate::fleet::DeviceOutcome).

use thiserror::Error;

use crate::navigation::LogicalScreen;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors raised by a device driver or transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The device went away or the handshake failed
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Transport-level I/O failure during a screen, tap or input call
    #[error("driver I/O error: {0}")]
    Io(String),

    /// A driver command exited unsuccessfully
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Driver output could not be parsed
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// The driver does not implement this capability
    #[error("unsupported by driver: {0}")]
    Unsupported(&'static str),
}

impl DriverError {
    /// Create a parse error
    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            detail: detail.into(),
        }
    }
}

/// Errors surfaced by sessions, navigation and the orchestrator
#[derive(Debug, Error)]
pub enum FleetError {
    /// Device unreachable or driver handshake failure
    #[error("connection to {device} failed: {reason}")]
    Connection { device: String, reason: String },

    /// A hard-fail transition could not be verified
    #[error("navigation to {screen} failed: {reason}")]
    NavigationHard {
        screen: LogicalScreen,
        reason: String,
    },

    /// An inconclusive verification under the strict policy
    #[error("navigation to {screen} could not be confirmed: {reason}")]
    NavigationSoft {
        screen: LogicalScreen,
        reason: String,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template rejected: {0}")]
    InvalidTemplate(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{device} timed out after {seconds}s")]
    Timeout { device: String, seconds: u64 },
}

impl FleetError {
    /// Create a hard navigation failure
    pub fn hard(screen: LogicalScreen, reason: impl Into<String>) -> Self {
        Self::NavigationHard {
            screen,
            reason: reason.into(),
        }
    }

    /// Create a soft navigation failure
    pub fn soft(screen: LogicalScreen, reason: impl Into<String>) -> Self {
        Self::NavigationSoft {
            screen,
            reason: reason.into(),
        }
    }

    /// Whether the error means the device itself is unusable
    pub fn is_driver_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::Driver(DriverError::Disconnected(_)) | FleetError::Connection { .. }
        )
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(e: toml::de::Error) -> Self {
        FleetError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_screen() {
        let err = FleetError::hard(LogicalScreen::HostHome, "foreground is com.android.launcher");
        let s = err.to_string();
        assert!(s.contains("HostHome"));
        assert!(s.contains("com.android.launcher"));
    }

    #[test]
    fn test_driver_error_converts() {
        let err: FleetError = DriverError::Disconnected("emulator-5554".into()).into();
        assert!(err.is_driver_fatal());
        assert!(err.to_string().contains("emulator-5554"));
    }

    #[test]
    fn test_soft_is_not_fatal() {
        let err = FleetError::soft(LogicalScreen::SearchPage, "no cancel control");
        assert!(!err.is_driver_fatal());
    }
}
