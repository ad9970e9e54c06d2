//! Run conditions: predicates over a schedule's previous run.

use chrono::{DateTime, Duration, Utc};

use beacon_core::{RunConditions, RunRecord};

/// Result of checking a schedule's run conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// The run must be canceled with this reason.
    Denied(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Conditions are conjunctive; the first one that fails decides the reason.
/// A missing prior run fails `requires_last_status` but satisfies
/// `min_minutes_since_last_run`.
pub fn evaluate(
    conditions: Option<&RunConditions>,
    last_run: Option<&RunRecord>,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(conditions) = conditions.filter(|c| !c.is_empty()) else {
        return Verdict::Allowed;
    };

    if let Some(required) = conditions.requires_last_status {
        if last_run.map(|run| run.status) != Some(required) {
            return Verdict::Denied(format!("Condition requires last status {required}"));
        }
    }

    if let (Some(minutes), Some(last)) = (conditions.min_minutes_since_last_run, last_run) {
        let elapsed = now.signed_duration_since(last.finished_at);
        if elapsed < Duration::minutes(i64::from(minutes)) {
            return Verdict::Denied(format!("Condition requires {minutes}m since last run"));
        }
    }

    Verdict::Allowed
}
