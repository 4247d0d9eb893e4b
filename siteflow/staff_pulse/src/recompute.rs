//! Evaluate-and-persist step shared by monitors, the fleet resync and the
//! lifecycle controller.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    flags::{evaluate, FlagRecord, FlagRules},
    store::{Clock, Collaborators, StaffDirectory, StoreError, TaskStore},
    task::Task,
    telemetry::PulseTelemetry,
};

/// Which path asked for a recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeTrigger {
    /// Live feed snapshot.
    Snapshot,
    /// Periodic or on-demand fleet pass.
    Resync,
    /// Task created or transitioned.
    Lifecycle,
}

/// Turns a task set into a stored flag record.
#[derive(Clone)]
pub struct FlagRecomputer {
    tasks: Arc<dyn TaskStore>,
    directory: Arc<dyn StaffDirectory>,
    clock: Arc<dyn Clock>,
    rules: FlagRules,
    telemetry: PulseTelemetry,
}

impl fmt::Debug for FlagRecomputer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagRecomputer")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl FlagRecomputer {
    /// Wires the recomputer to the shared collaborators.
    #[must_use]
    pub fn new(collaborators: &Collaborators, rules: FlagRules, telemetry: PulseTelemetry) -> Self {
        Self {
            tasks: Arc::clone(&collaborators.tasks),
            directory: Arc::clone(&collaborators.directory),
            clock: Arc::clone(&collaborators.clock),
            rules,
            telemetry,
        }
    }

    /// Rule thresholds in use.
    #[must_use]
    pub const fn rules(&self) -> &FlagRules {
        &self.rules
    }

    /// Evaluates `tasks` at the current clock reading without persisting.
    #[must_use]
    pub fn assess(&self, tasks: &[Task]) -> FlagRecord {
        let now = self.clock.now();
        evaluate(tasks, now, &self.rules).into_record(now)
    }

    /// Evaluates `tasks` and overwrites the stored flag of `user_id`.
    pub async fn persist(
        &self,
        user_id: &str,
        tasks: &[Task],
        trigger: RecomputeTrigger,
    ) -> Result<FlagRecord, StoreError> {
        let record = self.assess(tasks);
        self.write(user_id, &record, trigger).await?;
        Ok(record)
    }

    /// Overwrites the stored flag of `user_id` with an already computed record.
    pub async fn write(
        &self,
        user_id: &str,
        record: &FlagRecord,
        trigger: RecomputeTrigger,
    ) -> Result<(), StoreError> {
        self.directory.write_flag(user_id, record).await?;
        self.telemetry
            .emit(
                LogLevel::Debug,
                "pulse.flag.recomputed",
                user_id,
                json!({
                    "trigger": trigger,
                    "flag": record.flag,
                    "reason": record.reason,
                    "metrics": record.metrics,
                }),
            )
            .await;
        Ok(())
    }

    /// One-shot read of `user_id`'s tasks followed by [`Self::persist`].
    pub async fn recompute(
        &self,
        user_id: &str,
        trigger: RecomputeTrigger,
    ) -> Result<FlagRecord, StoreError> {
        let tasks = self.tasks.list_for_assignee(user_id).await?;
        self.persist(user_id, &tasks, trigger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::Flag,
        store::{memory::MemoryBackend, TaskStore},
        task::NewTask,
    };
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn recompute_reads_tasks_and_overwrites_flag() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let backend = MemoryBackend::new(now);
        let recomputer =
            FlagRecomputer::new(&backend.collaborators(), FlagRules::default(), PulseTelemetry::disabled());

        let draft = NewTask::new("u1", "Quote for lobby", now.date_naive())
            .due(now + Duration::minutes(30));
        backend.tasks.insert(draft, "boss", now).await.unwrap();

        let record = recomputer
            .recompute("u1", RecomputeTrigger::Resync)
            .await
            .unwrap();
        assert_eq!(record.flag, Flag::Yellow);
        assert_eq!(record.flag_updated_at, now);
        assert_eq!(backend.directory.flag("u1"), Some(record));
    }

    #[tokio::test]
    async fn failed_flag_write_is_returned() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let backend = MemoryBackend::new(now);
        backend.directory.fail_flag_writes(true);
        let recomputer =
            FlagRecomputer::new(&backend.collaborators(), FlagRules::default(), PulseTelemetry::disabled());
        let err = recomputer
            .persist("u1", &[], RecomputeTrigger::Snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(backend.directory.flag("u1"), None);
    }
}
