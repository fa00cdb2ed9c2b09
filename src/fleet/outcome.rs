//! Per-device outcomes and fleet success accounting

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the device list was obtained, which decides the success policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FleetMode {
    /// Every discovered device must succeed
    AutoDiscovery,
    /// Any one configured device succeeding is enough
    Static,
}

impl FleetMode {
    pub fn from_auto_discovery(auto: bool) -> Self {
        if auto {
            FleetMode::AutoDiscovery
        } else {
            FleetMode::Static
        }
    }

    /// Overall success for `succeeded` out of `expected` devices.
    /// An empty fleet never succeeds.
    pub fn is_success(&self, expected: usize, succeeded: usize) -> bool {
        if expected == 0 {
            return false;
        }
        match self {
            FleetMode::AutoDiscovery => succeeded >= expected,
            FleetMode::Static => succeeded >= 1,
        }
    }
}

/// Percentage of `expected` that succeeded, 0 for an empty fleet
pub fn success_rate(expected: usize, succeeded: usize) -> f64 {
    if expected == 0 {
        0.0
    } else {
        succeeded as f64 * 100.0 / expected as f64
    }
}

/// Result of one device's action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl DeviceOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// Outcomes of one dispatch plus the fleet-level verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub mode: FleetMode,
    pub outcomes: BTreeMap<String, DeviceOutcome>,
    /// Devices the dispatch should have reached, including ones that never
    /// connected
    pub expected_count: usize,
}

impl DispatchResult {
    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.success).count()
    }

    /// Successful devices as a percentage of `expected_count`
    pub fn success_rate(&self) -> f64 {
        success_rate(self.expected_count, self.success_count())
    }

    /// Fleet verdict under this result's [`FleetMode`]
    pub fn is_success(&self) -> bool {
        self.mode.is_success(self.expected_count, self.success_count())
    }

    pub fn to_bool_map(&self) -> BTreeMap<String, bool> {
        self.outcomes
            .iter()
            .map(|(name, o)| (name.clone(), o.success))
            .collect()
    }

    /// Failed devices and their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.success)
            .map(|(name, o)| (name.as_str(), o.error.as_deref().unwrap_or("unknown error")))
    }
}
