use std::{fmt, sync::Arc, time::Duration};

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::{user::MonitorParts, MonitorError, UserMonitor};
use crate::{
    flags::FlagRules,
    recompute::RecomputeTrigger,
    store::{Collaborators, StaffMember, StoreError},
    task::UserId,
    telemetry::PulseTelemetry,
};

/// Default period of the backstop resync.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// One user whose flag could not be refreshed during a resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncFailure {
    /// User id.
    pub user_id: UserId,
    /// Store error text.
    pub error: String,
}

/// Outcome of one resync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncSummary {
    /// Users whose flag was re-evaluated and written.
    pub recomputed: Vec<UserId>,
    /// Users whose flag could not be refreshed.
    pub failed: Vec<ResyncFailure>,
    /// Monitors started or restarted by roster reconciliation.
    pub started: Vec<UserId>,
    /// Monitors stopped because the user left the active roster.
    pub stopped: Vec<UserId>,
}

/// Builder for [`FleetMonitor`].
pub struct FleetMonitorBuilder {
    collaborators: Collaborators,
    rules: FlagRules,
    resync_interval: Option<Duration>,
    telemetry: PulseTelemetry,
}

impl FleetMonitorBuilder {
    /// Overrides the flag thresholds.
    #[must_use]
    pub fn rules(mut self, rules: FlagRules) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the resync period. Zero disables the periodic pass.
    #[must_use]
    pub fn resync_interval(mut self, period: Duration) -> Self {
        self.resync_interval = (!period.is_zero()).then_some(period);
        self
    }

    /// Disables the periodic pass; [`FleetHandle::resync_now`] still works.
    #[must_use]
    pub fn without_resync(mut self) -> Self {
        self.resync_interval = None;
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: PulseTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Finalizes the builder.
    #[must_use]
    pub fn build(self) -> FleetMonitor {
        FleetMonitor {
            parts: MonitorParts::new(&self.collaborators, self.rules, self.telemetry),
            resync_interval: self.resync_interval,
        }
    }
}

/// Starts one [`UserMonitor`] per active staff member.
#[derive(Clone)]
pub struct FleetMonitor {
    parts: MonitorParts,
    resync_interval: Option<Duration>,
}

impl fmt::Debug for FleetMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetMonitor")
            .field("resync_interval", &self.resync_interval)
            .finish_non_exhaustive()
    }
}

impl FleetMonitor {
    /// Creates a builder with default rules and a five minute resync.
    #[must_use]
    pub fn builder(collaborators: Collaborators) -> FleetMonitorBuilder {
        FleetMonitorBuilder {
            collaborators,
            rules: FlagRules::default(),
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
            telemetry: PulseTelemetry::disabled(),
        }
    }

    /// Lists staff, starts a monitor for every active member and, unless
    /// disabled, the periodic resync.
    ///
    /// A member whose monitor fails to start is logged and left to the next
    /// resync.
    pub async fn start_all(&self) -> Result<FleetHandle, MonitorError> {
        let roster = self
            .parts
            .directory
            .list_staff()
            .await
            .map_err(MonitorError::Roster)?;

        let shared = Arc::new(FleetShared {
            parts: self.parts.clone(),
            monitors: Mutex::new(IndexMap::new()),
        });
        {
            let mut monitors = shared.monitors.lock().await;
            for member in roster.iter().filter(|member| member.active) {
                if let Some(monitor) = shared.launch(member).await {
                    monitors.insert(member.id.clone(), monitor);
                }
            }
            self.parts
                .telemetry
                .emit(
                    LogLevel::Info,
                    "pulse.fleet.started",
                    "fleet",
                    json!({
                        "monitors": monitors.len(),
                        "roster": roster.len(),
                        "resync_secs": self.resync_interval.map(|p| p.as_secs()),
                    }),
                )
                .await;
        }

        let resync = self
            .resync_interval
            .map(|period| ResyncLoop::spawn(Arc::clone(&shared), period));
        Ok(FleetHandle { shared, resync })
    }
}

struct FleetShared {
    parts: MonitorParts,
    monitors: Mutex<IndexMap<UserId, UserMonitor>>,
}

impl FleetShared {
    async fn launch(&self, member: &StaffMember) -> Option<UserMonitor> {
        let monitor = UserMonitor::from_parts(member, self.parts.clone());
        match monitor.start().await {
            Ok(_) => Some(monitor),
            Err(err) => {
                tracing::warn!(user_id = %member.id, error = %err, "monitor failed to start");
                None
            }
        }
    }

    /// Reconciles the roster, then recomputes every active user from a
    /// one-shot read. Never escalates.
    async fn resync(&self) -> Result<ResyncSummary, StoreError> {
        let roster = self.parts.directory.list_staff().await?;
        let active: IndexMap<&str, &StaffMember> = roster
            .iter()
            .filter(|member| member.active)
            .map(|member| (member.id.as_str(), member))
            .collect();
        let mut summary = ResyncSummary::default();

        {
            let mut monitors = self.monitors.lock().await;
            let departed: Vec<UserId> = monitors
                .keys()
                .filter(|id| !active.contains_key(id.as_str()))
                .cloned()
                .collect();
            for user_id in departed {
                if let Some(monitor) = monitors.shift_remove(&user_id) {
                    monitor.stop().await;
                    summary.stopped.push(user_id);
                }
            }
            for (user_id, member) in &active {
                let existing = monitors.get(*user_id).cloned();
                if let Some(monitor) = existing {
                    // A closed feed ends the loop; bring it back.
                    if monitor.is_running().await {
                        continue;
                    }
                    match monitor.start().await {
                        Ok(_) => summary.started.push((*user_id).to_string()),
                        Err(err) => {
                            tracing::warn!(user_id, error = %err, "monitor restart failed");
                        }
                    }
                } else if let Some(monitor) = self.launch(member).await {
                    monitors.insert((*user_id).to_string(), monitor);
                    summary.started.push((*user_id).to_string());
                }
            }
        }

        let recomputes = active.keys().map(|user_id| async move {
            let outcome = self
                .parts
                .recomputer
                .recompute(user_id, RecomputeTrigger::Resync)
                .await;
            ((*user_id).to_string(), outcome)
        });
        for (user_id, outcome) in join_all(recomputes).await {
            match outcome {
                Ok(_) => summary.recomputed.push(user_id),
                Err(err) => {
                    tracing::warn!(user_id = %user_id, error = %err, "resync recompute failed");
                    summary.failed.push(ResyncFailure {
                        user_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        self.parts
            .telemetry
            .emit(
                if summary.failed.is_empty() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                },
                "pulse.fleet.resynced",
                "fleet",
                json!(summary),
            )
            .await;
        Ok(summary)
    }
}

struct ResyncLoop {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ResyncLoop {
    fn spawn(shared: Arc<FleetShared>, period: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; monitors already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = shared.resync().await {
                            tracing::warn!(error = %err, "periodic resync failed");
                        }
                    }
                }
            }
        });
        Self { stop, join }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "resync loop ended abnormally");
        }
    }
}

/// Running fleet. Dropping it signals every task to stop; call
/// [`FleetHandle::stop_all`] to wait for them.
pub struct FleetHandle {
    shared: Arc<FleetShared>,
    resync: Option<ResyncLoop>,
}

impl fmt::Debug for FleetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetHandle")
            .field("resync", &self.resync.is_some())
            .finish_non_exhaustive()
    }
}

impl FleetHandle {
    /// Runs one resync pass now.
    pub async fn resync_now(&self) -> Result<ResyncSummary, MonitorError> {
        self.shared.resync().await.map_err(MonitorError::Roster)
    }

    /// Ids with a monitor in the arena, in start order.
    pub async fn monitored(&self) -> Vec<UserId> {
        self.shared.monitors.lock().await.keys().cloned().collect()
    }

    /// Monitor of one user.
    pub async fn monitor(&self, user_id: &str) -> Option<UserMonitor> {
        self.shared.monitors.lock().await.get(user_id).cloned()
    }

    /// Stops the resync loop and every monitor, returning the ids stopped.
    pub async fn stop_all(mut self) -> Vec<UserId> {
        if let Some(resync) = self.resync.take() {
            resync.shutdown().await;
        }
        let monitors = std::mem::take(&mut *self.shared.monitors.lock().await);
        join_all(monitors.values().map(UserMonitor::stop)).await;
        self.shared
            .parts
            .telemetry
            .emit(
                LogLevel::Info,
                "pulse.fleet.stopped",
                "fleet",
                json!({ "monitors": monitors.len() }),
            )
            .await;
        monitors.into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::{Flag, FlagAssessment, FlagMetrics, FlagRule},
        store::{memory::MemoryBackend, StaffRole},
        task::{NewTask, Task},
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap()
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new(now());
        backend.directory.upsert(StaffMember::new("m1", "Meera", StaffRole::Manager));
        backend.directory.upsert(StaffMember::new("u1", "Ravi", StaffRole::Staff));
        backend.directory.upsert(StaffMember::new("u2", "Kiran", StaffRole::Staff));
        backend.directory.upsert(StaffMember {
            active: false,
            ..StaffMember::new("u3", "Old", StaffRole::Staff)
        });
        backend
    }

    fn record(flag: Flag) -> crate::flags::FlagRecord {
        FlagAssessment {
            flag,
            rule: if flag == Flag::Red { FlagRule::Overdue } else { FlagRule::OnTrack },
            reason: String::new(),
            metrics: FlagMetrics::default(),
        }
        .into_record(now())
    }

    fn overdue_for(user: &str) -> Task {
        let draft = NewTask::new(user, "Site visit", now().date_naive())
            .due(now() - ChronoDuration::minutes(30));
        Task::assigned(Uuid::new_v4(), draft, "m1", now())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn fleet(backend: &MemoryBackend) -> FleetMonitor {
        FleetMonitor::builder(backend.collaborators())
            .without_resync()
            .build()
    }

    #[tokio::test]
    async fn monitors_every_active_member_and_stops_them_all() {
        let backend = backend();
        let handle = fleet(&backend).start_all().await.unwrap();
        assert_eq!(handle.monitored().await, ["m1", "u1", "u2"]);
        assert_eq!(backend.tasks.live_feeds(), 3);
        let monitor = handle.monitor("u1").await.unwrap();

        let stopped = handle.stop_all().await;
        assert_eq!(stopped, ["m1", "u1", "u2"]);
        assert!(!monitor.is_running().await);
        wait_until(|| backend.tasks.live_feeds() == 0).await;
    }

    #[tokio::test]
    async fn resync_heals_drift_without_escalating() {
        let backend = backend();
        backend.tasks.seed(overdue_for("u1"));
        backend.directory.seed_flag("u1", record(Flag::Red));
        let handle = fleet(&backend).start_all().await.unwrap();
        wait_until(|| backend.directory.flag_writes() >= 3).await;

        backend.directory.seed_flag("u1", record(Flag::Green));
        let summary = handle.resync_now().await.unwrap();

        assert_eq!(summary.recomputed, ["m1", "u1", "u2"]);
        assert!(summary.failed.is_empty());
        assert!(summary.started.is_empty() && summary.stopped.is_empty());
        let healed = backend.directory.flag("u1").unwrap();
        assert_eq!(healed.flag, Flag::Red);
        assert_eq!(healed.reason, "1 tasks overdue");
        assert!(backend.notifications.sent().is_empty());
        handle.stop_all().await;
    }

    #[tokio::test]
    async fn resync_reconciles_the_roster() {
        let backend = backend();
        let handle = fleet(&backend).start_all().await.unwrap();

        backend.directory.upsert(StaffMember::new("u4", "Neha", StaffRole::Staff));
        backend.directory.deactivate("u2");
        let summary = handle.resync_now().await.unwrap();

        assert_eq!(summary.started, ["u4"]);
        assert_eq!(summary.stopped, ["u2"]);
        assert_eq!(handle.monitored().await, ["m1", "u1", "u4"]);
        assert_eq!(backend.tasks.live_feeds(), 3);
        handle.stop_all().await;
    }

    #[tokio::test]
    async fn resync_reports_failed_writes() {
        let backend = backend();
        let handle = fleet(&backend).start_all().await.unwrap();
        backend.directory.fail_flag_writes(true);
        let summary = handle.resync_now().await.unwrap();
        assert!(summary.recomputed.is_empty());
        let failed: Vec<&str> = summary.failed.iter().map(|f| f.user_id.as_str()).collect();
        assert_eq!(failed, ["m1", "u1", "u2"]);
        handle.stop_all().await;
    }

    #[tokio::test]
    async fn periodic_resync_runs_on_its_interval() {
        let backend = backend();
        backend.tasks.seed(overdue_for("u2"));
        let handle = FleetMonitor::builder(backend.collaborators())
            .resync_interval(Duration::from_millis(20))
            .build()
            .start_all()
            .await
            .unwrap();
        wait_until(|| backend.notifications.sent_to("m1").len() == 1).await;

        backend.directory.seed_flag("u2", record(Flag::Green));
        wait_until(|| backend.directory.flag("u2").is_some_and(|r| r.flag == Flag::Red)).await;
        assert_eq!(backend.notifications.sent_to("m1").len(), 1);
        handle.stop_all().await;
    }

    #[tokio::test]
    async fn unreadable_roster_fails_start() {
        let backend = backend();
        backend.directory.fail_listing(true);
        let err = fleet(&backend).start_all().await.unwrap_err();
        assert!(matches!(err, MonitorError::Roster(StoreError::Unavailable(_))));
        assert_eq!(backend.tasks.live_feeds(), 0);
    }

    #[tokio::test]
    async fn member_failing_to_start_is_picked_up_by_resync() {
        let backend = backend();
        backend.tasks.fail_subscriptions(true);
        let handle = fleet(&backend).start_all().await.unwrap();
        assert!(handle.monitored().await.is_empty());

        backend.tasks.fail_subscriptions(false);
        let summary = handle.resync_now().await.unwrap();
        assert_eq!(summary.started, ["m1", "u1", "u2"]);
        handle.stop_all().await;
    }
}
