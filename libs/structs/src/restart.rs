//! Local restart policy of a task group.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::time::{duration_nanos_serde, format_duration};

/// Lower bound on the restart interval.
pub const RESTART_MIN_INTERVAL: Duration = Duration::from_secs(5);

string_enum! {
    /// What happens once the restart attempts inside an interval are used up.
    pub enum RestartMode {
        /// Wait for the interval to pass, then keep restarting.
        Delay => "delay",
        /// Mark the task failed.
        Fail => "fail",
    }
}

impl Default for RestartMode {
    fn default() -> Self {
        Self::Fail
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub attempts: u32,
    #[serde(with = "duration_nanos_serde")]
    pub interval: Duration,
    #[serde(with = "duration_nanos_serde")]
    pub delay: Duration,
    pub mode: RestartMode,
    #[serde(default)]
    pub render_templates: bool,
}

impl RestartPolicy {
    /// Default for service and system jobs.
    pub fn default_service() -> Self {
        Self {
            attempts: 2,
            interval: Duration::from_secs(30 * 60),
            delay: Duration::from_secs(15),
            mode: RestartMode::Fail,
            render_templates: false,
        }
    }

    /// Default for batch jobs.
    pub fn default_batch() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(24 * 3600),
            delay: Duration::from_secs(15),
            mode: RestartMode::Fail,
            render_templates: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.mode.is_known() {
            errs.push(format!("Unsupported restart mode: {:?}", self.mode.as_str()));
        }
        if self.attempts == 0 && self.mode != RestartMode::Fail {
            errs.push(format!(
                "Restart policy {:?} with {} attempts is ambiguous",
                self.mode.as_str(),
                self.attempts
            ));
        }
        if self.interval < RESTART_MIN_INTERVAL {
            errs.push(format!(
                "Interval can not be less than {} (got {})",
                format_duration(RESTART_MIN_INTERVAL),
                format_duration(self.interval)
            ));
        }
        if self.delay.saturating_mul(self.attempts) > self.interval {
            errs.push(format!(
                "can't restart the TaskGroup {} times in an interval of {} with a delay of {}",
                self.attempts,
                format_duration(self.interval),
                format_duration(self.delay)
            ));
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RestartPolicy::default_service().validate().is_ok());
        assert!(RestartPolicy::default_batch().validate().is_ok());
    }

    #[test]
    fn test_unsupported_mode() {
        let policy = RestartPolicy {
            mode: RestartMode::parse("retry"),
            ..RestartPolicy::default_service()
        };
        let errs = policy.validate().unwrap_err();
        assert!(errs.contains("Unsupported restart mode: \"retry\""));
    }

    #[test]
    fn test_zero_attempts_ambiguous_with_delay_mode() {
        let policy = RestartPolicy {
            attempts: 0,
            mode: RestartMode::Delay,
            ..RestartPolicy::default_service()
        };
        assert!(policy
            .validate()
            .unwrap_err()
            .contains("Restart policy \"delay\" with 0 attempts is ambiguous"));

        let fail = RestartPolicy {
            attempts: 0,
            ..RestartPolicy::default_service()
        };
        assert!(fail.validate().is_ok());
    }

    #[test]
    fn test_interval_floor_and_budget() {
        let policy = RestartPolicy {
            attempts: 3,
            interval: Duration::from_secs(2),
            delay: Duration::from_secs(1),
            mode: RestartMode::Fail,
            render_templates: false,
        };
        let errs = policy.validate().unwrap_err();
        assert!(errs.contains("Interval can not be less than 5s (got 2s)"));
        assert!(errs.contains("can't restart the TaskGroup 3 times in an interval of 2s with a delay of 1s"));
    }
}
