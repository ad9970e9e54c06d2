//! Consecutive-outcome counters, circuit breaker and alert thresholds.
//!
//! The store applies a [`BreakerPolicy`] atomically and hands back the
//! counters from just before and just after the run as a [`StateChange`];
//! [`AlertPolicy::decide`] looks only at that pair.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use beacon_core::{EntityRunState, MonitorDefinition, ScheduleDefinition};

/// When repeated failures open the breaker, and for how long.
/// A zero threshold or duration disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub duration_ms: u64,
}

impl BreakerPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn for_schedule(schedule: &ScheduleDefinition) -> Self {
        Self {
            threshold: schedule.circuit_breaker_threshold,
            duration_ms: schedule.circuit_breaker_duration_ms,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0 && self.duration_ms > 0
    }

    /// Deadline the breaker opens until if a failure at `now` brings the
    /// failure count to `failures`.
    pub fn trips_at(&self, failures: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_enabled() && failures >= self.threshold {
            let duration = i64::try_from(self.duration_ms).unwrap_or(i64::MAX);
            now.checked_add_signed(Duration::milliseconds(duration))
        } else {
            None
        }
    }

    /// The state after one executed run. A failure that does not trip the
    /// breaker leaves any existing deadline alone; a success clears it.
    pub fn apply(&self, state: &EntityRunState, success: bool, now: DateTime<Utc>) -> EntityRunState {
        if success {
            EntityRunState {
                consecutive_failures: 0,
                consecutive_successes: state.consecutive_successes.saturating_add(1),
                circuit_open_until: None,
            }
        } else {
            let failures = state.consecutive_failures.saturating_add(1);
            EntityRunState {
                consecutive_failures: failures,
                consecutive_successes: 0,
                circuit_open_until: self.trips_at(failures, now).or(state.circuit_open_until),
            }
        }
    }
}

/// Counters around one executed run, as written by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    pub before: EntityRunState,
    pub after: EntityRunState,
}

impl StateChange {
    pub fn new(before: EntityRunState, after: EntityRunState) -> Self {
        Self { before, after }
    }
}

/// Cancellation reason when the breaker is open at `now`.
pub fn gate(state: &EntityRunState, now: DateTime<Utc>) -> Option<String> {
    state
        .circuit_open_until
        .filter(|_| state.is_open_at(now))
        .map(|until| format!("Circuit open until {}", until.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Failure,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub failure_threshold: u32,
    pub alert_on_recovery: bool,
}

impl AlertPolicy {
    pub fn for_schedule(schedule: &ScheduleDefinition) -> Self {
        Self {
            failure_threshold: schedule.failure_threshold,
            alert_on_recovery: schedule.alert_on_recovery,
        }
    }

    pub fn for_monitor(monitor: &MonitorDefinition) -> Self {
        Self {
            failure_threshold: monitor.failure_threshold,
            alert_on_recovery: monitor.alert_on_recovery,
        }
    }

    /// Failure alerts fire once, on the run whose failure count equals the
    /// threshold exactly. Recovery alerts fire on the success that ends a
    /// failure streak; an entity that never failed has nothing to recover
    /// from.
    pub fn decide(&self, success: bool, change: &StateChange) -> Option<AlertKind> {
        if success {
            (self.alert_on_recovery && change.before.consecutive_failures > 0).then_some(AlertKind::Recovery)
        } else {
            (change.after.consecutive_failures == self.failure_threshold).then_some(AlertKind::Failure)
        }
    }
}
