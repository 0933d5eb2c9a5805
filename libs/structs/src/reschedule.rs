//! Reschedule policy and the per-allocation reschedule tracker.
//!
//! ## Design Principles
//!
//! - The policy is validated up front, including a cross-check that the delay
//!   series can actually fit `attempts` reschedules inside `interval`
//! - The tracker is append-only; readers scan from the tail

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_id::{AllocId, NodeId};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::time::{duration_nanos_serde, format_duration};

/// Lower bound on the delay between reschedule attempts.
pub const RESCHEDULE_MIN_DELAY: Duration = Duration::from_secs(5);

/// Lower bound on the attempt-counting interval of a limited policy.
pub const RESCHEDULE_MIN_INTERVAL: Duration = Duration::from_secs(15);

string_enum! {
    /// How the delay grows across consecutive reschedules.
    pub enum DelayFunction {
        Constant => "constant",
        Exponential => "exponential",
        Fibonacci => "fibonacci",
    }
}

impl Default for DelayFunction {
    fn default() -> Self {
        Self::Constant
    }
}

/// How a failed allocation is replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    /// Reschedules allowed inside `interval`.
    pub attempts: u32,
    #[serde(with = "duration_nanos_serde")]
    pub interval: Duration,
    /// Initial delay before a replacement is placed.
    #[serde(with = "duration_nanos_serde")]
    pub delay: Duration,
    pub delay_function: DelayFunction,
    /// Ceiling of the delay series; ignored for `constant`.
    #[serde(with = "duration_nanos_serde")]
    pub max_delay: Duration,
    pub unlimited: bool,
}

impl ReschedulePolicy {
    /// Default for service jobs: unlimited, exponential back-off up to an hour.
    pub fn default_service() -> Self {
        Self {
            attempts: 0,
            interval: Duration::ZERO,
            delay: Duration::from_secs(30),
            delay_function: DelayFunction::Exponential,
            max_delay: Duration::from_secs(3600),
            unlimited: true,
        }
    }

    /// Default for batch jobs: a single attempt per day.
    pub fn default_batch() -> Self {
        Self {
            attempts: 1,
            interval: Duration::from_secs(24 * 3600),
            delay: Duration::from_secs(5),
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        }
    }

    /// Returns true if the policy allows any reschedule.
    pub fn enabled(&self) -> bool {
        self.attempts > 0 || self.unlimited
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        if !self.enabled() {
            return Ok(());
        }
        let mut errs = ValidationErrors::new();

        if self.attempts > 0 {
            if self.interval.is_zero() {
                errs.push("Interval must be a non zero value if Attempts > 0");
            }
            if self.unlimited {
                errs.push(format!(
                    "Reschedule Policy with Attempts = {}, Interval = {}, and Unlimited = {} is ambiguous",
                    self.attempts,
                    format_duration(self.interval),
                    self.unlimited
                ));
                errs.push("If Attempts >0, Unlimited cannot also be set to true");
            }
        }

        let mut delay_pre_check = true;
        if self.delay < RESCHEDULE_MIN_DELAY {
            errs.push(format!(
                "Delay cannot be less than {} (got {})",
                format_duration(RESCHEDULE_MIN_DELAY),
                format_duration(self.delay)
            ));
            delay_pre_check = false;
        }

        if !self.delay_function.is_known() {
            errs.push(format!(
                "Invalid delay function {:?}, must be one of {:?}",
                self.delay_function.as_str(),
                DelayFunction::KNOWN
            ));
            delay_pre_check = false;
        }

        if self.delay_function != DelayFunction::Constant {
            if self.max_delay < RESCHEDULE_MIN_DELAY {
                errs.push(format!(
                    "Max Delay cannot be less than {} (got {})",
                    format_duration(RESCHEDULE_MIN_DELAY),
                    format_duration(self.max_delay)
                ));
                delay_pre_check = false;
            }
            if self.max_delay < self.delay {
                errs.push(format!(
                    "Max Delay cannot be less than Delay {} (got {})",
                    format_duration(self.delay),
                    format_duration(self.max_delay)
                ));
                delay_pre_check = false;
            }
        }

        if !self.unlimited {
            if self.interval < RESCHEDULE_MIN_INTERVAL {
                errs.push(format!(
                    "Interval cannot be less than {} (got {})",
                    format_duration(RESCHEDULE_MIN_INTERVAL),
                    format_duration(self.interval)
                ));
            }
            if delay_pre_check {
                errs.merge(self.validate_delay_params());
            }
        }
        errs.into_result()
    }

    fn validate_delay_params(&self) -> Result<(), ValidationErrors> {
        let viability = self.viable_attempts();
        if viability.valid {
            return Ok(());
        }
        let mut errs = ValidationErrors::new();
        if self.delay_function == DelayFunction::Constant {
            errs.push(format!(
                "can only make {} attempts in {} with initial delay {} and delay function {:?}",
                viability.possible_attempts,
                format_duration(self.interval),
                format_duration(self.delay),
                self.delay_function.as_str()
            ));
        } else {
            errs.push(format!(
                "can only make {} attempts in {} with initial delay {}, delay function {:?}, and delay ceiling {}",
                viability.possible_attempts,
                format_duration(self.interval),
                format_duration(self.delay),
                self.delay_function.as_str(),
                format_duration(self.max_delay)
            ));
        }
        let rounded = Duration::from_secs(viability.recommended_interval.as_secs_f64().round() as u64);
        errs.push(format!(
            "Set the interval to at least {} to accommodate {} attempts",
            format_duration(rounded),
            self.attempts
        ));
        errs.into_result()
    }

    /// Works out how many attempts the delay series fits inside `interval`.
    fn viable_attempts(&self) -> Viability {
        let mut possible_attempts = 0u32;
        let mut recommended = Duration::ZERO;
        let mut valid = true;

        match self.delay_function {
            DelayFunction::Constant => {
                recommended = self.delay.saturating_mul(self.attempts);
                if self.interval < recommended {
                    let per = self.delay.as_nanos().max(1);
                    possible_attempts =
                        u32::try_from(self.interval.as_nanos() / per).unwrap_or(u32::MAX);
                    valid = false;
                }
            }
            DelayFunction::Exponential => {
                let mut possible = 0u64;
                for i in 0..self.attempts {
                    let factor = 1u32.checked_shl(i).unwrap_or(u32::MAX);
                    let next = self.delay.saturating_mul(factor);
                    let capped = next > self.max_delay;
                    if capped {
                        recommended = recommended.saturating_add(self.max_delay);
                    } else {
                        recommended = next;
                    }
                    if recommended < self.interval {
                        possible += 1;
                    }
                    // Past the ceiling, or once the factor saturates, every
                    // later attempt moves `recommended` by the same step.
                    if capped || factor == u32::MAX {
                        let remaining = self.attempts - i - 1;
                        let step = if capped { self.max_delay } else { Duration::ZERO };
                        possible += steps_below(recommended, step, remaining, self.interval);
                        recommended = recommended.saturating_add(step.saturating_mul(remaining));
                        break;
                    }
                }
                possible_attempts = u32::try_from(possible).unwrap_or(u32::MAX);
                if possible_attempts < self.attempts {
                    valid = false;
                }
            }
            DelayFunction::Fibonacci => {
                // Slot `n` is the delay before attempt `n`; there are always
                // at least two slots.
                let last = self.attempts.max(2) - 1;
                let mut first_over = (self.delay > self.interval).then_some(0u32);
                let (mut prev, mut cur) = (self.delay, self.delay);
                let mut slot = 1u32;
                let mut step = Duration::ZERO;
                while slot < last {
                    let sum = cur.saturating_add(prev);
                    let capped = sum > self.max_delay;
                    let next = if capped { self.max_delay } else { sum };
                    let stalled = next == cur;
                    prev = cur;
                    cur = next;
                    slot += 1;
                    if first_over.is_none() && cur > self.interval {
                        first_over = Some(slot);
                    }
                    if capped || stalled {
                        step = if capped { self.max_delay } else { Duration::ZERO };
                        break;
                    }
                }
                // The remaining slots grow linearly from `cur`.
                let remaining = last - slot;
                if first_over.is_none() && !step.is_zero() {
                    let gap = self.interval.saturating_sub(cur).as_nanos();
                    let k = gap / step.as_nanos() + 1;
                    if k <= u128::from(remaining) {
                        first_over = u32::try_from(k).ok().map(|k| slot + k);
                    }
                }
                recommended = cur.saturating_add(step.saturating_mul(remaining));
                if self.interval < recommended {
                    valid = false;
                    if let Some(idx) = first_over {
                        possible_attempts = idx;
                    }
                }
            }
            DelayFunction::Unknown(_) => {
                return Viability {
                    valid: false,
                    possible_attempts: 0,
                    recommended_interval: Duration::ZERO,
                };
            }
        }

        Viability {
            valid,
            possible_attempts,
            recommended_interval: recommended,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Viability {
    valid: bool,
    possible_attempts: u32,
    recommended_interval: Duration,
}

/// Counts `k` in `1..=n` with `start + k * step < limit`.
fn steps_below(start: Duration, step: Duration, n: u32, limit: Duration) -> u64 {
    if start >= limit {
        return 0;
    }
    if step.is_zero() {
        return u64::from(n);
    }
    let k = (limit - start).as_nanos().saturating_sub(1) / step.as_nanos();
    u64::try_from(k).unwrap_or(u64::MAX).min(u64::from(n))
}

// =============================================================================
// Tracker
// =============================================================================

/// One reschedule attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RescheduleEvent {
    /// Unix nanoseconds of the attempt.
    pub reschedule_time: i64,
    pub prev_alloc_id: AllocId,
    pub prev_node_id: NodeId,
    /// Delay applied at this attempt.
    #[serde(with = "duration_nanos_serde")]
    pub delay: Duration,
}

impl RescheduleEvent {
    pub fn new(
        reschedule_time: i64,
        prev_alloc_id: AllocId,
        prev_node_id: NodeId,
        delay: Duration,
    ) -> Self {
        Self {
            reschedule_time,
            prev_alloc_id,
            prev_node_id,
            delay,
        }
    }
}

/// Outcome of the most recent reschedule attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRescheduleStatus {
    #[default]
    #[serde(rename = "")]
    None,
    Success,
    FailedToPlace,
}

/// History of reschedule attempts carried from one allocation to its
/// replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RescheduleTracker {
    #[serde(default)]
    pub events: Vec<RescheduleEvent>,
    #[serde(default)]
    pub last_reschedule: LastRescheduleStatus,
}

impl RescheduleTracker {
    /// Deep copy of the tracker.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Records an attempt and its outcome together.
    pub fn record(&mut self, event: RescheduleEvent, outcome: LastRescheduleStatus) {
        self.events.push(event);
        self.last_reschedule = outcome;
    }

    /// Most recent attempt, if any.
    pub fn last_event(&self) -> Option<&RescheduleEvent> {
        self.events.last()
    }

    /// Number of attempts inside `[fail_time - interval, fail_time]`.
    pub fn attempts_within(&self, fail_time_nanos: i64, interval: Duration) -> u32 {
        let window = i128::try_from(interval.as_nanos()).unwrap_or(i128::MAX);
        let count = self
            .events
            .iter()
            .rev()
            .filter(|e| i128::from(fail_time_nanos) - i128::from(e.reschedule_time) < window)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
