//! Performance flags derived from a staff member's live task set.

/// Rule cascade turning a task list into a flag.
pub mod evaluator;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use evaluator::{evaluate, FlagRules};

/// Traffic-light performance flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    /// On track.
    Green,
    /// Needs attention soon.
    Yellow,
    /// Needs management attention now.
    Red,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// Which cascade step produced a flag, in severity order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FlagRule {
    /// Any open task past its deadline.
    Overdue,
    /// Open tasks for today after the cutoff hour.
    AfterCutoff,
    /// Open tasks for today due within the warning window.
    DueSoon,
    /// Open tasks for today after the warning hour.
    AfternoonWarning,
    /// Nothing matched.
    OnTrack,
}

impl FlagRule {
    /// Flag the rule maps to.
    #[must_use]
    pub const fn flag(self) -> Flag {
        match self {
            Self::Overdue | Self::AfterCutoff => Flag::Red,
            Self::DueSoon | Self::AfternoonWarning => Flag::Yellow,
            Self::OnTrack => Flag::Green,
        }
    }
}

/// Counts shown next to the flag.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlagMetrics {
    /// Open tasks dated today.
    pub pending_today: usize,
    /// Open tasks past their deadline, any date.
    pub overdue: usize,
    /// Open tasks dated today due within the warning window.
    pub due_within_hour: usize,
}

/// Output of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlagAssessment {
    /// Resulting flag.
    pub flag: Flag,
    /// Rule that matched.
    pub rule: FlagRule,
    /// Human readable justification.
    pub reason: String,
    /// Supporting counts.
    pub metrics: FlagMetrics,
}

impl FlagAssessment {
    /// Stamps the assessment into a persistable record.
    #[must_use]
    pub fn into_record(self, flag_updated_at: DateTime<Utc>) -> FlagRecord {
        FlagRecord {
            flag: self.flag,
            reason: self.reason,
            metrics: self.metrics,
            flag_updated_at,
        }
    }
}

/// Flag fields embedded in a user record. Always written as one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRecord {
    /// Current flag.
    pub flag: Flag,
    /// Justification matching `flag`.
    pub reason: String,
    /// Supporting counts.
    pub metrics: FlagMetrics,
    /// Last recompute.
    pub flag_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rule_order_matches_severity() {
        let rules = [
            FlagRule::Overdue,
            FlagRule::AfterCutoff,
            FlagRule::DueSoon,
            FlagRule::AfternoonWarning,
            FlagRule::OnTrack,
        ];
        for pair in rules.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].flag() >= pair[1].flag());
        }
    }

    #[test]
    fn record_serializes_lowercase_flag() {
        let record = FlagAssessment {
            flag: Flag::Red,
            rule: FlagRule::Overdue,
            reason: "1 tasks overdue".into(),
            metrics: FlagMetrics {
                pending_today: 0,
                overdue: 1,
                due_within_hour: 0,
            },
        }
        .into_record(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["flag"], "red");
        assert_eq!(json["metrics"]["overdue"], 1);
    }
}
