//! Disconnect strategy of a task group.
//!
//! Governs what happens to allocations on a node that stopped heartbeating.
//! Older jobs carry `max_client_disconnect` and `stop_after_client_disconnect`
//! on the group itself; those stay readable, but a group may not mix them with
//! a `disconnect` block.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::time::option_duration_nanos_serde;

string_enum! {
    /// Which allocation survives when a disconnected one comes back and a
    /// replacement is already running.
    pub enum ReconcileOption {
        BestScore => "best_score",
        LongestRunning => "longest_running",
        KeepOriginal => "keep_original",
        KeepReplacement => "keep_replacement",
    }
}

impl Default for ReconcileOption {
    fn default() -> Self {
        Self::BestScore
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisconnectStrategy {
    /// How long an allocation may stay `unknown` before it is marked lost.
    #[serde(default, with = "option_duration_nanos_serde")]
    pub lost_after: Option<Duration>,
    /// How long the client keeps running allocations after losing contact.
    #[serde(default, with = "option_duration_nanos_serde")]
    pub stop_on_client_after: Option<Duration>,
    /// Whether to place a replacement while the original is unknown.
    #[serde(default)]
    pub replace: Option<bool>,
    #[serde(default)]
    pub reconcile: ReconcileOption,
}

impl DisconnectStrategy {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let lost = self.lost_after.is_some_and(|d| !d.is_zero());
        let stop = self.stop_on_client_after.is_some_and(|d| !d.is_zero());
        if lost && stop {
            errs.push("lost_after and stop_on_client_after cannot both be set");
        }
        if !self.reconcile.is_known() {
            errs.push(format!(
                "reconcile option {:?} must be one of {}",
                self.reconcile.as_str(),
                ReconcileOption::KNOWN.join(", ")
            ));
        }
        errs.into_result()
    }

    /// Whether a replacement is placed for an `unknown` allocation.
    pub fn should_replace(&self) -> bool {
        self.replace.unwrap_or(true)
    }

    /// Configured lost-after window, zero when unset.
    pub fn lost_after(&self) -> Duration {
        self.lost_after.unwrap_or_default()
    }

    /// Configured stop-on-client window, zero when unset.
    pub fn stop_on_client_after(&self) -> Duration {
        self.stop_on_client_after.unwrap_or_default()
    }
}
