//! Rolling update and migration strategies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::time::{duration_nanos_serde, format_duration};

string_enum! {
    /// How allocation health is judged during a rollout.
    pub enum HealthCheck {
        Checks => "checks",
        TaskStates => "task_states",
        Manual => "manual",
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::Checks
    }
}

/// Controls how allocations of a group are replaced on job updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateStrategy {
    /// Pause between batches of a non-deployment rolling update.
    #[serde(with = "duration_nanos_serde")]
    pub stagger: Duration,
    pub max_parallel: i32,
    pub health_check: HealthCheck,
    #[serde(with = "duration_nanos_serde")]
    pub min_healthy_time: Duration,
    #[serde(with = "duration_nanos_serde")]
    pub healthy_deadline: Duration,
    /// Zero disables the progress deadline.
    #[serde(with = "duration_nanos_serde")]
    pub progress_deadline: Duration,
    pub auto_revert: bool,
    pub auto_promote: bool,
    pub canary: i32,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            stagger: Duration::from_secs(30),
            max_parallel: 1,
            health_check: HealthCheck::Checks,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
            progress_deadline: Duration::from_secs(10 * 60),
            auto_revert: false,
            auto_promote: false,
            canary: 0,
        }
    }
}

impl UpdateStrategy {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.health_check.is_known() {
            errs.push(format!(
                "Invalid health check given: {:?}",
                self.health_check.as_str()
            ));
        }
        if self.max_parallel < 0 {
            errs.push(format!(
                "Max parallel can not be less than zero: {} < 0",
                self.max_parallel
            ));
        }
        if self.canary < 0 {
            errs.push(format!(
                "Canary count can not be less than zero: {} < 0",
                self.canary
            ));
        }
        if self.canary == 0 && self.auto_promote {
            errs.push("Auto Promote requires a Canary count greater than zero");
        }
        if self.healthy_deadline.is_zero() {
            errs.push("Healthy deadline must be greater than zero: 0s");
        }
        if self.min_healthy_time >= self.healthy_deadline {
            errs.push(format!(
                "Minimum healthy time must be less than healthy deadline: {} > {}",
                format_duration(self.min_healthy_time),
                format_duration(self.healthy_deadline)
            ));
        }
        if !self.progress_deadline.is_zero() && self.healthy_deadline >= self.progress_deadline {
            errs.push(format!(
                "Healthy deadline must be less than progress deadline: {} > {}",
                format_duration(self.healthy_deadline),
                format_duration(self.progress_deadline)
            ));
        }
        if self.stagger.is_zero() {
            errs.push("Stagger must be greater than zero: 0s");
        }
        errs.into_result()
    }

    /// An update block with no parallelism does not drive deployments.
    pub fn is_empty(&self) -> bool {
        self.max_parallel == 0
    }

    /// Returns true if the strategy performs a staggered rolling update.
    pub fn rolling(&self) -> bool {
        !self.stagger.is_zero() && self.max_parallel > 0
    }
}

/// Controls how allocations are moved off draining nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrateStrategy {
    pub max_parallel: i32,
    pub health_check: HealthCheck,
    #[serde(with = "duration_nanos_serde")]
    pub min_healthy_time: Duration,
    #[serde(with = "duration_nanos_serde")]
    pub healthy_deadline: Duration,
}

impl Default for MigrateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check: HealthCheck::Checks,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
        }
    }
}

impl MigrateStrategy {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.max_parallel < 0 {
            errs.push(format!(
                "MaxParallel must be >= 0 but found {}",
                self.max_parallel
            ));
        }
        match &self.health_check {
            HealthCheck::Checks | HealthCheck::TaskStates => {}
            hc if hc.is_unset() => {
                if self.max_parallel > 0 {
                    errs.push("Missing HealthCheck");
                }
            }
            hc => errs.push(format!("Invalid HealthCheck: {:?}", hc.as_str())),
        }
        if self.min_healthy_time > self.healthy_deadline {
            errs.push("MinHealthyTime must be less than HealthyDeadline");
        }
        errs.into_result()
    }
}
