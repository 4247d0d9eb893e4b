use std::{fmt, sync::Arc};

use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

use super::{EscalationGate, MonitorError};
use crate::{
    escalation::EscalationNotifier,
    flags::FlagRules,
    recompute::{FlagRecomputer, RecomputeTrigger},
    store::{Collaborators, StaffDirectory, StaffMember, StoreError, TaskFeed, TaskStore},
    task::{Task, UserId},
    telemetry::PulseTelemetry,
};

/// Shared wiring handed to every monitor of a fleet.
#[derive(Clone)]
pub(crate) struct MonitorParts {
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) directory: Arc<dyn StaffDirectory>,
    pub(crate) recomputer: FlagRecomputer,
    pub(crate) escalation: EscalationNotifier,
    pub(crate) telemetry: PulseTelemetry,
}

impl MonitorParts {
    pub(crate) fn new(
        collaborators: &Collaborators,
        rules: FlagRules,
        telemetry: PulseTelemetry,
    ) -> Self {
        Self {
            tasks: Arc::clone(&collaborators.tasks),
            directory: Arc::clone(&collaborators.directory),
            recomputer: FlagRecomputer::new(collaborators, rules, telemetry.clone()),
            escalation: EscalationNotifier::new(collaborators, telemetry.clone()),
            telemetry,
        }
    }
}

/// Keeps one staff member's flag in step with their live task set.
///
/// Every snapshot from the feed is evaluated and persisted. A transition
/// into red, judged against the flag this monitor last produced, triggers
/// one escalation.
#[derive(Clone)]
pub struct UserMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    worker: Worker,
    tasks: Arc<dyn TaskStore>,
    directory: Arc<dyn StaffDirectory>,
    running: Mutex<Option<Running>>,
}

struct Running {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl fmt::Debug for UserMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMonitor")
            .field("user_id", &self.inner.worker.user_id)
            .finish_non_exhaustive()
    }
}

impl UserMonitor {
    /// Creates a stopped monitor for `member`.
    #[must_use]
    pub fn new(
        member: &StaffMember,
        collaborators: &Collaborators,
        rules: FlagRules,
        telemetry: PulseTelemetry,
    ) -> Self {
        Self::from_parts(member, MonitorParts::new(collaborators, rules, telemetry))
    }

    pub(crate) fn from_parts(member: &StaffMember, parts: MonitorParts) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                worker: Worker {
                    user_id: member.id.clone(),
                    user_name: member.name.clone(),
                    recomputer: parts.recomputer,
                    escalation: parts.escalation,
                    telemetry: parts.telemetry,
                },
                tasks: parts.tasks,
                directory: parts.directory,
                running: Mutex::new(None),
            }),
        }
    }

    /// Monitored user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inner.worker.user_id
    }

    /// Subscribes and starts processing snapshots.
    ///
    /// Returns `false` without opening a second subscription when already
    /// running.
    pub async fn start(&self) -> Result<bool, MonitorError> {
        let mut running = self.inner.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.join.is_finished()) {
            return Ok(false);
        }

        let user_id = &self.inner.worker.user_id;
        let start_error = |source: StoreError| MonitorError::Start {
            user_id: user_id.clone(),
            source,
        };
        let seed = self
            .inner
            .directory
            .read_flag(user_id)
            .await
            .map_err(start_error)?
            .map(|record| record.flag);
        let feed = self
            .inner
            .tasks
            .subscribe_assignee(user_id)
            .await
            .map_err(start_error)?;

        let (stop, stop_rx) = watch::channel(false);
        let worker = self.inner.worker.clone();
        let join = tokio::spawn(worker.run(feed, EscalationGate::seeded(seed), stop_rx));
        *running = Some(Running { stop, join });
        tracing::debug!(user_id = %user_id, ?seed, "monitor started");
        Ok(true)
    }

    /// Stops the monitor and waits for any in-flight snapshot to finish.
    ///
    /// Nothing is written for this user by the monitor once this returns.
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.inner.running.lock().await.take() else {
            return false;
        };
        let _ = running.stop.send(true);
        if let Err(err) = running.join.await {
            tracing::error!(
                user_id = %self.inner.worker.user_id,
                error = %err,
                "monitor task ended abnormally"
            );
        }
        true
    }

    /// Whether the processing loop is alive.
    pub async fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.join.is_finished())
    }
}

#[derive(Clone)]
struct Worker {
    user_id: UserId,
    user_name: String,
    recomputer: FlagRecomputer,
    escalation: EscalationNotifier,
    telemetry: PulseTelemetry,
}

impl Worker {
    async fn run(
        self,
        mut feed: TaskFeed,
        mut gate: EscalationGate,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                // Also fires when the owning monitor is dropped.
                _ = stop.changed() => break,
                snapshot = feed.next() => match snapshot {
                    Some(Ok(tasks)) => self.handle(&tasks, &mut gate).await,
                    Some(Err(err)) => {
                        tracing::warn!(user_id = %self.user_id, error = %err, "task feed error");
                        self.telemetry
                            .emit(
                                LogLevel::Warn,
                                "pulse.monitor.feed_error",
                                &self.user_id,
                                json!({ "error": err.to_string() }),
                            )
                            .await;
                    }
                    None => {
                        tracing::debug!(user_id = %self.user_id, "task feed closed");
                        break;
                    }
                },
            }
        }
    }

    async fn handle(&self, tasks: &[Task], gate: &mut EscalationGate) {
        let record = self.recomputer.assess(tasks);
        if let Err(err) = self
            .recomputer
            .write(&self.user_id, &record, RecomputeTrigger::Snapshot)
            .await
        {
            tracing::warn!(user_id = %self.user_id, error = %err, "flag write failed");
        }
        if gate.observe(record.flag) {
            match self
                .escalation
                .notify_red_flag(&self.user_name, &record.reason, &self.user_id)
                .await
            {
                Ok(report) => tracing::info!(
                    user_id = %self.user_id,
                    delivered = report.delivered.len(),
                    failed = report.failed.len(),
                    "red flag escalated"
                ),
                Err(err) => {
                    tracing::warn!(user_id = %self.user_id, error = %err, "escalation skipped");
                }
            }
        }
    }
}
