use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;

use crate::{
    recompute::{FlagRecomputer, RecomputeTrigger},
    store::{
        ActivityEntry, ActivityLog, Collaborators, ContextStore, HistoryEntry, Notification,
        NotificationError, NotificationSink, StoreError,
    },
    task::{ContextId, UserId},
};

/// Follow-up work requested by a lifecycle write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    /// Deliver a notification.
    Notify(Notification),
    /// Append to a context's history.
    AppendHistory {
        /// Target context.
        context_id: ContextId,
        /// Entry to append.
        entry: HistoryEntry,
    },
    /// Append to the global activity log.
    LogActivity(ActivityEntry),
    /// Re-evaluate and store a user's flag.
    RecomputeFlag {
        /// Whose flag.
        user_id: UserId,
    },
}

impl SideEffect {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Notify(_) => "notify",
            Self::AppendHistory { .. } => "append_history",
            Self::LogActivity(_) => "log_activity",
            Self::RecomputeFlag { .. } => "recompute_flag",
        }
    }
}

/// Retry budget for each side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectPolicy {
    /// Tries per effect, including the first.
    pub attempts: u32,
    /// Pause between tries.
    pub backoff: Duration,
}

impl Default for EffectPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

/// What happened to one side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectReport {
    /// The effect.
    pub effect: SideEffect,
    /// Whether any try succeeded.
    pub applied: bool,
    /// Tries made.
    pub attempts: u32,
    /// Last error when not applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum EffectError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

/// Executes side effects concurrently, each with its own retry budget.
#[derive(Clone)]
pub(crate) struct EffectRunner {
    notifications: Arc<dyn NotificationSink>,
    contexts: Arc<dyn ContextStore>,
    activity: Arc<dyn ActivityLog>,
    recomputer: FlagRecomputer,
    policy: EffectPolicy,
}

impl EffectRunner {
    pub(crate) fn new(
        collaborators: &Collaborators,
        recomputer: FlagRecomputer,
        policy: EffectPolicy,
    ) -> Self {
        Self {
            notifications: Arc::clone(&collaborators.notifications),
            contexts: Arc::clone(&collaborators.contexts),
            activity: Arc::clone(&collaborators.activity),
            recomputer,
            policy,
        }
    }

    pub(crate) async fn run_all(&self, effects: Vec<SideEffect>) -> Vec<EffectReport> {
        join_all(effects.into_iter().map(|effect| self.run(effect))).await
    }

    async fn run(&self, effect: SideEffect) -> EffectReport {
        let budget = self.policy.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=budget {
            match self.apply(&effect).await {
                Ok(()) => {
                    return EffectReport {
                        effect,
                        applied: true,
                        attempts: attempt,
                        error: None,
                    }
                }
                Err(err) => {
                    tracing::debug!(effect = effect.label(), attempt, error = %err, "side effect failed");
                    last_error = Some(err.to_string());
                    if attempt < budget {
                        sleep(self.policy.backoff).await;
                    }
                }
            }
        }
        tracing::warn!(
            effect = effect.label(),
            attempts = budget,
            error = last_error.as_deref().unwrap_or_default(),
            "dropping side effect"
        );
        EffectReport {
            effect,
            applied: false,
            attempts: budget,
            error: last_error,
        }
    }

    async fn apply(&self, effect: &SideEffect) -> Result<(), EffectError> {
        match effect {
            SideEffect::Notify(notification) => {
                self.notifications.send(notification.clone()).await?;
            }
            SideEffect::AppendHistory { context_id, entry } => {
                let mut history = self.contexts.history(context_id).await?;
                history.push(entry.clone());
                self.contexts.replace_history(context_id, history).await?;
            }
            SideEffect::LogActivity(entry) => self.activity.append(entry.clone()).await?,
            SideEffect::RecomputeFlag { user_id } => {
                self.recomputer
                    .recompute(user_id, RecomputeTrigger::Lifecycle)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::FlagRules,
        store::{memory::MemoryBackend, Clock, NotificationKind},
        telemetry::PulseTelemetry,
    };
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn runner(backend: &MemoryBackend, attempts: u32) -> EffectRunner {
        let collaborators = backend.collaborators();
        let recomputer =
            FlagRecomputer::new(&collaborators, FlagRules::default(), PulseTelemetry::disabled());
        EffectRunner::new(
            &collaborators,
            recomputer,
            EffectPolicy {
                attempts,
                backoff: Duration::ZERO,
            },
        )
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn history_is_appended_not_replaced() {
        let backend = backend();
        let runner = runner(&backend, 1);
        let entry = |note: &str| HistoryEntry {
            at: backend.clock.now(),
            actor_id: "u1".into(),
            actor_name: "Ravi".into(),
            action: "Task Completed".into(),
            task_id: Uuid::nil(),
            note: note.into(),
        };
        for note in ["first", "second"] {
            let reports = runner
                .run_all(vec![SideEffect::AppendHistory {
                    context_id: "lead-7".into(),
                    entry: entry(note),
                }])
                .await;
            assert!(reports[0].applied);
        }
        let notes: Vec<String> = backend
            .contexts
            .entries("lead-7")
            .into_iter()
            .map(|e| e.note)
            .collect();
        assert_eq!(notes, ["first", "second"]);
    }

    #[tokio::test]
    async fn failing_effect_uses_its_budget_without_blocking_others() {
        let backend = backend();
        backend.notifications.fail_for("ghost");
        let runner = runner(&backend, 3);
        let reports = runner
            .run_all(vec![
                SideEffect::Notify(Notification::new("ghost", "t", "m", NotificationKind::Info)),
                SideEffect::Notify(Notification::new("u2", "t", "m", NotificationKind::Info)),
            ])
            .await;
        assert!(!reports[0].applied);
        assert_eq!(reports[0].attempts, 3);
        assert!(reports[0].error.is_some());
        assert!(reports[1].applied);
        assert_eq!(reports[1].attempts, 1);
        assert_eq!(backend.notifications.sent_to("u2").len(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let backend = backend();
        let runner = runner(&backend, 0);
        let reports = runner
            .run_all(vec![SideEffect::RecomputeFlag {
                user_id: "u1".into(),
            }])
            .await;
        assert!(reports[0].applied);
        assert!(backend.directory.flag("u1").is_some());
    }
}
