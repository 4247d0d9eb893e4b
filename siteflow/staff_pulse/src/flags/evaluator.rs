use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};

use super::{FlagAssessment, FlagMetrics, FlagRule};
use crate::task::Task;

/// Thresholds for the rule cascade, expressed in business-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRules {
    /// Offset used to derive "today" and the hour of day.
    pub utc_offset: FixedOffset,
    /// Open work for today turns yellow from this hour.
    pub warning_hour: u32,
    /// Open work for today turns red from this hour.
    pub cutoff_hour: u32,
    /// Deadlines closer than this turn yellow.
    pub due_soon: Duration,
}

impl Default for FlagRules {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            warning_hour: 16,
            cutoff_hour: 18,
            due_soon: Duration::minutes(60),
        }
    }
}

/// Evaluates one user's tasks at `now`. Pure and deterministic.
///
/// Rules are checked in severity order and the first match wins:
/// overdue, after cutoff, due soon, afternoon warning, on track.
#[must_use]
pub fn evaluate(tasks: &[Task], now: DateTime<Utc>, rules: &FlagRules) -> FlagAssessment {
    let local = now.with_timezone(&rules.utc_offset);
    let today = local.date_naive();
    let hour = local.hour();

    let pending_today: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.date == today && task.is_open())
        .collect();
    let overdue = tasks.iter().filter(|task| task.is_overdue(now)).count();
    let due_within_hour = pending_today
        .iter()
        .filter(|task| {
            task.time_left(now)
                .is_some_and(|left| left > Duration::zero() && left <= rules.due_soon)
        })
        .count();

    let metrics = FlagMetrics {
        pending_today: pending_today.len(),
        overdue,
        due_within_hour,
    };

    let (rule, reason) = if metrics.overdue > 0 {
        (FlagRule::Overdue, format!("{} tasks overdue", metrics.overdue))
    } else if hour >= rules.cutoff_hour && metrics.pending_today > 0 {
        (
            FlagRule::AfterCutoff,
            format!(
                "{} tasks incomplete after {}",
                metrics.pending_today,
                clock_label(rules.cutoff_hour)
            ),
        )
    } else if metrics.due_within_hour > 0 {
        (
            FlagRule::DueSoon,
            format!(
                "{} tasks due in <{}",
                metrics.due_within_hour,
                window_label(rules.due_soon)
            ),
        )
    } else if hour >= rules.warning_hour && metrics.pending_today > 0 {
        (
            FlagRule::AfternoonWarning,
            format!(
                "{} tasks pending ({} warning)",
                metrics.pending_today,
                clock_label(rules.warning_hour)
            ),
        )
    } else {
        (FlagRule::OnTrack, "On Track".to_string())
    };

    FlagAssessment {
        flag: rule.flag(),
        rule,
        reason,
        metrics,
    }
}

fn clock_label(hour: u32) -> String {
    let suffix = if hour < 12 { "AM" } else { "PM" };
    let display = match hour % 12 {
        0 => 12,
        h => h,
    };
    format!("{display} {suffix}")
}

fn window_label(window: Duration) -> String {
    let minutes = window.num_minutes();
    if minutes % 60 == 0 {
        format!("{} hr", minutes / 60)
    } else {
        format!("{minutes} min")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flag;
    use crate::task::{NewTask, TaskStage};
    use chrono::{NaiveDate, TimeZone};
    use uuid::Uuid;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn task(date: NaiveDate, due_at: Option<DateTime<Utc>>, stage: TaskStage) -> Task {
        let mut draft = NewTask::new("u1", "Site measurement", date);
        draft.due_at = due_at;
        let mut task = Task::assigned(Uuid::new_v4(), draft, "u2", at(7, 0));
        task.stage = stage;
        task
    }

    fn ongoing() -> TaskStage {
        TaskStage::Ongoing {
            started_at: at(8, 0),
        }
    }

    fn completed() -> TaskStage {
        TaskStage::Completed {
            started_at: at(8, 0),
            completed_at: at(9, 0),
        }
    }

    #[test]
    fn task_due_in_half_an_hour_is_yellow() {
        let now = at(10, 0);
        let tasks = [task(day(), Some(now + Duration::minutes(30)), TaskStage::Assigned)];
        let result = evaluate(&tasks, now, &FlagRules::default());
        assert_eq!(result.flag, Flag::Yellow);
        assert_eq!(result.reason, "1 tasks due in <1 hr");
        assert_eq!(
            result.metrics,
            FlagMetrics {
                pending_today: 1,
                overdue: 0,
                due_within_hour: 1
            }
        );
    }

    #[test]
    fn task_due_yesterday_is_red_at_any_hour() {
        let yesterday = day().pred_opt().unwrap();
        let due = Utc.with_ymd_and_hms(2026, 3, 1, 17, 0, 0).unwrap();
        let tasks = [task(yesterday, Some(due), ongoing())];
        for hour in 0..24 {
            let result = evaluate(&tasks, at(hour, 0), &FlagRules::default());
            assert_eq!(result.flag, Flag::Red, "hour {hour}");
            assert_eq!(result.reason, "1 tasks overdue");
        }
    }

    #[test]
    fn evening_with_nothing_due_today_is_green() {
        let tomorrow = day().succ_opt().unwrap();
        let tasks = [task(tomorrow, None, TaskStage::Assigned)];
        let result = evaluate(&tasks, at(19, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Green);
        assert_eq!(result.reason, "On Track");
        assert_eq!(result.metrics, FlagMetrics::default());
    }

    #[test]
    fn two_open_tasks_at_five_pm_get_the_afternoon_warning() {
        let tasks = [
            task(day(), None, TaskStage::Assigned),
            task(day(), None, TaskStage::Assigned),
        ];
        let result = evaluate(&tasks, at(17, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Yellow);
        assert_eq!(result.rule, FlagRule::AfternoonWarning);
        assert_eq!(result.reason, "2 tasks pending (4 PM warning)");
    }

    #[test]
    fn open_work_after_six_pm_is_red() {
        let tasks = [
            task(day(), None, ongoing()),
            task(day(), None, completed()),
        ];
        let result = evaluate(&tasks, at(18, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Red);
        assert_eq!(result.reason, "1 tasks incomplete after 6 PM");
    }

    fn acknowledged() -> TaskStage {
        TaskStage::Acknowledged {
            started_at: at(8, 0),
            completed_at: at(9, 0),
            acknowledged_at: at(9, 30),
            acknowledged_by: "boss".into(),
        }
    }

    #[test]
    fn completed_tasks_are_never_overdue() {
        let tasks = [
            task(day(), Some(at(9, 0)), completed()),
            task(day() - Duration::days(1), Some(at(9, 0) - Duration::days(1)), completed()),
        ];
        let result = evaluate(&tasks, at(19, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Green);
        assert_eq!(result.metrics, FlagMetrics::default());
    }

    #[test]
    fn acknowledged_task_past_its_deadline_is_overdue() {
        let yesterday = day() - Duration::days(1);
        let tasks = [task(yesterday, Some(at(14, 0) - Duration::days(1)), acknowledged())];
        let result = evaluate(&tasks, at(10, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Red);
        assert_eq!(result.reason, "1 tasks overdue");
        assert_eq!(result.metrics.overdue, 1);
    }

    #[test]
    fn acknowledged_task_dated_today_stays_pending() {
        let tasks = [task(day(), None, acknowledged())];
        let result = evaluate(&tasks, at(19, 0), &FlagRules::default());
        assert_eq!(result.flag, Flag::Red);
        assert_eq!(result.reason, "1 tasks incomplete after 6 PM");
        assert_eq!(result.metrics.pending_today, 1);
    }

    #[test]
    fn due_soon_window_excludes_now_and_includes_its_edge() {
        let now = at(11, 0);
        let tasks = [
            task(day(), Some(now), TaskStage::Assigned),
            task(day(), Some(now + Duration::minutes(60)), TaskStage::Assigned),
            task(day(), Some(now + Duration::minutes(61)), TaskStage::Assigned),
        ];
        let result = evaluate(&tasks, now, &FlagRules::default());
        assert_eq!(result.metrics.due_within_hour, 1);
        assert_eq!(result.metrics.overdue, 0);
    }

    #[test]
    fn overdue_counts_every_date_but_due_soon_only_today() {
        let now = at(10, 0);
        let tomorrow = day().succ_opt().unwrap();
        let tasks = [
            task(tomorrow, Some(now + Duration::minutes(10)), TaskStage::Assigned),
            task(tomorrow, Some(now - Duration::minutes(10)), TaskStage::Assigned),
        ];
        let result = evaluate(&tasks, now, &FlagRules::default());
        assert_eq!(result.metrics.due_within_hour, 0);
        assert_eq!(result.metrics.overdue, 1);
        assert_eq!(result.metrics.pending_today, 0);
    }

    #[test]
    fn same_input_gives_identical_output() {
        let now = at(16, 30);
        let tasks = [
            task(day(), Some(now + Duration::minutes(20)), TaskStage::Assigned),
            task(day(), None, ongoing()),
        ];
        let first = evaluate(&tasks, now, &FlagRules::default());
        let second = evaluate(&tasks, now, &FlagRules::default());
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    fn matches(rule: FlagRule, tasks: &[Task], now: DateTime<Utc>) -> bool {
        let pending: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.date == day() && t.is_open())
            .collect();
        match rule {
            FlagRule::Overdue => tasks.iter().any(|t| t.is_overdue(now)),
            FlagRule::AfterCutoff => now.hour() >= 18 && !pending.is_empty(),
            FlagRule::DueSoon => pending.iter().any(|t| {
                t.time_left(now)
                    .is_some_and(|left| left > Duration::zero() && left <= Duration::minutes(60))
            }),
            FlagRule::AfternoonWarning => now.hour() >= 16 && !pending.is_empty(),
            FlagRule::OnTrack => true,
        }
    }

    #[test]
    fn first_matching_rule_always_wins() {
        let order = [
            FlagRule::Overdue,
            FlagRule::AfterCutoff,
            FlagRule::DueSoon,
            FlagRule::AfternoonWarning,
            FlagRule::OnTrack,
        ];
        for hour in [9, 15, 16, 17, 18, 21] {
            let now = at(hour, 30);
            for mask in 0u8..8 {
                let mut tasks = Vec::new();
                if mask & 1 != 0 {
                    tasks.push(task(day(), Some(now - Duration::minutes(5)), ongoing()));
                }
                if mask & 2 != 0 {
                    tasks.push(task(day(), Some(now + Duration::minutes(15)), TaskStage::Assigned));
                }
                if mask & 4 != 0 {
                    tasks.push(task(day(), None, TaskStage::Assigned));
                }
                let expected = order
                    .iter()
                    .copied()
                    .find(|rule| matches(*rule, &tasks, now))
                    .unwrap();
                let result = evaluate(&tasks, now, &FlagRules::default());
                assert_eq!(result.rule, expected, "hour {hour} mask {mask}");
                assert_eq!(result.flag, expected.flag());
            }
        }
    }

    #[test]
    fn local_offset_decides_today_and_hour() {
        let rules = FlagRules {
            utc_offset: FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
            ..FlagRules::default()
        };
        // 12:45 UTC is 18:15 at +05:30.
        let tasks = [task(day(), None, TaskStage::Assigned)];
        let result = evaluate(&tasks, at(12, 45), &rules);
        assert_eq!(result.rule, FlagRule::AfterCutoff);

        // 20:00 UTC is already the next local day, so the task is not "today".
        let result = evaluate(&tasks, at(20, 0), &rules);
        assert_eq!(result.flag, Flag::Green);
    }

    #[test]
    fn labels_follow_configured_hours() {
        assert_eq!(clock_label(0), "12 AM");
        assert_eq!(clock_label(12), "12 PM");
        assert_eq!(clock_label(17), "5 PM");
        assert_eq!(window_label(Duration::minutes(45)), "45 min");
        assert_eq!(window_label(Duration::minutes(120)), "2 hr");
    }
}
