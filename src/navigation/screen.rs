//! Logical screens and the tri-state verification result

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// The navigator's belief about what is on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LogicalScreen {
    /// Host app in the foreground
    HostHome,
    /// Host app's tabbed main interface, with the discover menu open
    HostMenu,
    /// The host's list of mini-programs
    MiniprogramGrid,
    /// Inside the target mini-program
    MiniprogramHome,
    /// The mini-program's search page
    SearchPage,
    #[default]
    Unknown,
}

impl LogicalScreen {
    /// Screens in navigation order, ending at the deepest one
    pub const PATH: [LogicalScreen; 5] = [
        LogicalScreen::HostHome,
        LogicalScreen::HostMenu,
        LogicalScreen::MiniprogramGrid,
        LogicalScreen::MiniprogramHome,
        LogicalScreen::SearchPage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LogicalScreen::HostHome => "HostHome",
            LogicalScreen::HostMenu => "HostMenu",
            LogicalScreen::MiniprogramGrid => "MiniprogramGrid",
            LogicalScreen::MiniprogramHome => "MiniprogramHome",
            LogicalScreen::SearchPage => "SearchPage",
            LogicalScreen::Unknown => "Unknown",
        }
    }

    /// Whether an unverified transition into this screen aborts the run
    /// regardless of policy
    pub fn is_hard(&self) -> bool {
        matches!(self, LogicalScreen::HostHome | LogicalScreen::HostMenu)
    }

    /// Position along [`Self::PATH`]; `None` for `Unknown`
    pub fn depth(&self) -> Option<usize> {
        Self::PATH.iter().position(|s| s == self)
    }
}

impl std::fmt::Display for LogicalScreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How inconclusive verifications on tolerant screens are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    /// Proceed without confirmation
    #[default]
    Lenient,
    /// Anything short of confirmation is a failure
    Strict,
}

/// Outcome of checking whether a transition landed where it should
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Positive evidence, with the signal that provided it
    Confirmed(String),
    /// No evidence either way
    Inconclusive(String),
    /// Evidence the transition did not happen
    Failed(String),
}

impl Verification {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verification::Confirmed(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Verification::Confirmed(s) | Verification::Inconclusive(s) | Verification::Failed(s) => s,
        }
    }

    /// Decide whether `screen` counts as reached.
    ///
    /// Hard screens accept only `Confirmed`. Tolerant screens accept anything
    /// under [`VerificationPolicy::Lenient`] and only `Confirmed` under
    /// [`VerificationPolicy::Strict`]. Returns whether the acceptance was
    /// confirmed rather than assumed.
    pub fn accept(&self, screen: LogicalScreen, policy: VerificationPolicy) -> Result<bool> {
        match self {
            Verification::Confirmed(_) => Ok(true),
            _ if screen.is_hard() => Err(FleetError::hard(screen, self.detail())),
            _ if policy == VerificationPolicy::Strict => Err(FleetError::soft(screen, self.detail())),
            _ => Ok(false),
        }
    }
}
