//! Periodic and parameterized job configuration.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::string_enum;

string_enum! {
    /// Syntax of a periodic launch specification.
    pub enum PeriodicSpecType {
        Cron => "cron",
        /// Comma separated Unix timestamps, used by tests.
        Test => "_internal_test",
    }
}

impl Default for PeriodicSpecType {
    fn default() -> Self {
        Self::Cron
    }
}

/// Launches a batch job on a schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodicConfig {
    pub enabled: bool,
    /// Cron expression with 5 to 7 fields, or a predefined `@daily` style
    /// alias.
    pub spec: String,
    pub spec_type: PeriodicSpecType,
    /// Skip a launch while the previous one is still running.
    pub prohibit_overlap: bool,
    /// IANA time zone the spec is evaluated in; empty means UTC.
    #[serde(default)]
    pub time_zone: String,
}

impl PeriodicConfig {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        if !self.enabled {
            return Ok(());
        }
        let mut errs = ValidationErrors::new();
        if self.spec.is_empty() {
            errs.push("Must specify a spec");
        }
        if let Err(err) = self.location() {
            errs.push(err);
        }
        match &self.spec_type {
            PeriodicSpecType::Cron => {
                if !self.spec.is_empty() {
                    if let Err(err) = parse_cron(&self.spec) {
                        errs.push(format!("Invalid cron spec {:?}: {err}", self.spec));
                    }
                }
            }
            PeriodicSpecType::Test => {}
            PeriodicSpecType::Unknown(other) => {
                errs.push(format!("Unknown periodic specification type {other:?}"));
            }
        }
        errs.into_result()
    }

    /// Time zone the spec is evaluated in.
    pub fn location(&self) -> Result<Tz, String> {
        if self.time_zone.is_empty() {
            return Ok(Tz::UTC);
        }
        Tz::from_str(&self.time_zone)
            .map_err(|err| format!("Invalid time zone {:?}: {err}", self.time_zone))
    }

    /// Next launch strictly after `from`, or `None` when the config is
    /// disabled or cannot be evaluated.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        match self.spec_type {
            PeriodicSpecType::Cron => {
                let schedule = parse_cron(&self.spec).ok()?;
                let tz = self.location().ok()?;
                schedule
                    .after(&from.with_timezone(&tz))
                    .next()
                    .map(|t| t.with_timezone(&Utc))
            }
            PeriodicSpecType::Test => self
                .spec
                .split(',')
                .filter_map(|s| s.trim().parse::<i64>().ok())
                .filter_map(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .filter(|t| *t > from)
                .min(),
            PeriodicSpecType::Unknown(_) => None,
        }
    }
}

/// Parses a cron expression of 5, 6 or 7 fields.
///
/// Five fields are `minute hour day month weekday`; six add a trailing year;
/// seven lead with seconds.
fn parse_cron(spec: &str) -> Result<Schedule, String> {
    let spec = spec.trim();
    if spec.starts_with('@') {
        return Schedule::from_str(spec).map_err(|e| e.to_string());
    }
    let fields = spec.split_whitespace().count();
    let normalized = match fields {
        5 | 6 => format!("0 {spec}"),
        7 => spec.to_string(),
        n => return Err(format!("expected 5 to 7 fields, found {n}")),
    };
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

string_enum! {
    /// Whether a dispatch must, may or must not carry a payload.
    pub enum DispatchPayload {
        Optional => "optional",
        Required => "required",
        Forbidden => "forbidden",
    }
}

impl Default for DispatchPayload {
    fn default() -> Self {
        Self::Optional
    }
}

/// Turns a batch job into a template that is instantiated by dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterizedJobConfig {
    pub payload: DispatchPayload,
    #[serde(default)]
    pub meta_required: Vec<String>,
    #[serde(default)]
    pub meta_optional: Vec<String>,
}

impl ParameterizedJobConfig {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.payload.is_known() {
            errs.push(format!(
                "Unknown payload requirement: {:?}",
                self.payload.as_str()
            ));
        }

        let required: BTreeSet<&str> = self.meta_required.iter().map(String::as_str).collect();
        let both: Vec<&str> = self
            .meta_optional
            .iter()
            .map(String::as_str)
            .filter(|k| required.contains(k))
            .collect();
        if !both.is_empty() {
            errs.push(format!(
                "Required and optional meta keys should be disjoint. Following keys exist in both: {}",
                both.join(", ")
            ));
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn cron(spec: &str) -> PeriodicConfig {
        PeriodicConfig {
            enabled: true,
            spec: spec.to_string(),
            spec_type: PeriodicSpecType::Cron,
            prohibit_overlap: false,
            time_zone: String::new(),
        }
    }

    #[rstest]
    #[case("*/15 * * * *")]
    #[case("0 0 * * * *")]
    #[case("0 30 2 * * Mon *")]
    #[case("@daily")]
    fn test_valid_cron(#[case] spec: &str) {
        assert!(cron(spec).validate().is_ok(), "{spec}");
    }

    #[rstest]
    #[case("* * *")]
    #[case("99 * * * *")]
    fn test_invalid_cron(#[case] spec: &str) {
        assert!(cron(spec).validate().unwrap_err().contains("Invalid cron spec"));
    }

    #[test]
    fn test_disabled_skips_validation() {
        let mut config = cron("garbage");
        config.enabled = false;
        assert!(config.validate().is_ok());
        assert_eq!(config.next(Utc::now()), None);
    }

    #[test]
    fn test_missing_spec() {
        assert!(cron("").validate().unwrap_err().contains("Must specify a spec"));
    }

    #[test]
    fn test_bad_time_zone() {
        let mut config = cron("@hourly");
        config.time_zone = "Mars/Olympus".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid time zone"));
    }

    #[test]
    fn test_next_launch_in_zone() {
        let mut config = cron("0 9 * * *");
        config.time_zone = "Europe/Berlin".to_string();
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        // 09:00 CET is 08:00 UTC in winter.
        assert_eq!(
            config.next(from),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_launch_test_spec() {
        let config = PeriodicConfig {
            enabled: true,
            spec: "100,300,200".to_string(),
            spec_type: PeriodicSpecType::Test,
            prohibit_overlap: false,
            time_zone: String::new(),
        };
        let from = Utc.timestamp_opt(150, 0).unwrap();
        assert_eq!(config.next(from), Some(Utc.timestamp_opt(200, 0).unwrap()));
    }

    #[test]
    fn test_parameterized_disjoint_meta() {
        let config = ParameterizedJobConfig {
            payload: DispatchPayload::Required,
            meta_required: vec!["a".into(), "b".into()],
            meta_optional: vec!["b".into(), "c".into()],
        };
        let errs = config.validate().unwrap_err();
        assert!(errs.contains("Following keys exist in both: b"));
    }

    #[test]
    fn test_parameterized_unknown_payload() {
        let config = ParameterizedJobConfig {
            payload: DispatchPayload::parse("sometimes"),
            ..ParameterizedJobConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("Unknown payload requirement"));
    }
}
