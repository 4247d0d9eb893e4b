//! Task lifecycle controller.
//!
//! The status write is the operation of record. Notifications, history,
//! activity and flag recomputes run afterwards as independent side effects
//! and never undo the write.

/// Side-effect requests and their retrying runner.
pub mod effects;

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::instrument;

pub use effects::{EffectPolicy, EffectReport, SideEffect};

use crate::{
    flags::FlagRules,
    recompute::FlagRecomputer,
    store::{
        ActivityEntry, Clock, Collaborators, HistoryEntry, Notification, NotificationKind,
        StaffRole, StoreError, TaskStore,
    },
    task::{
        InvalidTransition, NewTask, Task, TaskId, TaskStatus, TaskValidationError, UserId,
    },
    telemetry::PulseTelemetry,
};
use effects::EffectRunner;

/// Rejected lifecycle request.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Target status is not the single legal successor.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
    /// No task with that id.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    /// Draft failed validation.
    #[error(transparent)]
    Validation(#[from] TaskValidationError),
    /// The status write failed.
    #[error("task write failed: {0}")]
    Persistence(#[from] StoreError),
}

impl From<InvalidTransition> for LifecycleError {
    fn from(err: InvalidTransition) -> Self {
        Self::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

/// Who is acting on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorContext {
    /// Actor id.
    pub user_id: UserId,
    /// Display name used in notifications and history.
    pub name: String,
    /// Role recorded in the activity log.
    pub role: StaffRole,
}

impl ActorContext {
    /// Creates an actor.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, name: impl Into<String>, role: StaffRole) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role,
        }
    }
}

/// Result of a successful create or transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    /// Task as written.
    pub task: Task,
    /// Every side effect requested by the write.
    pub effects: Vec<EffectReport>,
}

impl TaskOutcome {
    /// Whether every side effect was applied.
    #[must_use]
    pub fn fully_applied(&self) -> bool {
        self.effects.iter().all(|report| report.applied)
    }

    /// Side effects that were dropped.
    pub fn dropped(&self) -> impl Iterator<Item = &EffectReport> {
        self.effects.iter().filter(|report| !report.applied)
    }
}

/// Builder used to configure a [`LifecycleController`].
pub struct LifecycleControllerBuilder {
    collaborators: Collaborators,
    rules: FlagRules,
    policy: EffectPolicy,
    telemetry: PulseTelemetry,
}

impl LifecycleControllerBuilder {
    /// Overrides the flag thresholds used for recomputes.
    #[must_use]
    pub fn rules(mut self, rules: FlagRules) -> Self {
        self.rules = rules;
        self
    }

    /// Overrides the side-effect retry policy.
    #[must_use]
    pub fn policy(mut self, policy: EffectPolicy) -> Self {
        self.policy = policy;
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
    pub fn build(self) -> LifecycleController {
        let recomputer =
            FlagRecomputer::new(&self.collaborators, self.rules, self.telemetry.clone());
        LifecycleController {
            tasks: Arc::clone(&self.collaborators.tasks),
            clock: Arc::clone(&self.collaborators.clock),
            effects: EffectRunner::new(&self.collaborators, recomputer, self.policy),
            telemetry: self.telemetry,
        }
    }
}

/// Validates and applies task creation and status transitions.
#[derive(Clone)]
pub struct LifecycleController {
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    effects: EffectRunner,
    telemetry: PulseTelemetry,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Creates a builder with default rules and retry policy.
    #[must_use]
    pub fn builder(collaborators: Collaborators) -> LifecycleControllerBuilder {
        LifecycleControllerBuilder {
            collaborators,
            rules: FlagRules::default(),
            policy: EffectPolicy::default(),
            telemetry: PulseTelemetry::disabled(),
        }
    }

    /// Validates and inserts a new task in `Assigned`.
    #[instrument(skip_all, fields(assignee = %draft.assignee_id, actor = %actor.user_id))]
    pub async fn create(
        &self,
        draft: NewTask,
        actor: &ActorContext,
    ) -> Result<TaskOutcome, LifecycleError> {
        draft.validate()?;
        let now = self.clock.now();
        let task = self.tasks.insert(draft, &actor.user_id, now).await?;

        let mut requested = Vec::new();
        if task.assignee_id != actor.user_id {
            requested.push(SideEffect::Notify(
                Notification::new(
                    task.assignee_id.clone(),
                    "New Task Assigned",
                    format!("{} assigned you a new task: {}", actor.name, task.title),
                    NotificationKind::Info,
                )
                .related_to("task", task.id.to_string()),
            ));
        }
        requested.push(SideEffect::RecomputeFlag {
            user_id: task.assignee_id.clone(),
        });

        self.telemetry
            .emit(
                LogLevel::Info,
                "pulse.lifecycle.created",
                &task.id.to_string(),
                json!({ "assignee": task.assignee_id, "creator": actor.user_id, "date": task.date }),
            )
            .await;

        let effects = self.effects.run_all(requested).await;
        Ok(TaskOutcome { task, effects })
    }

    /// Moves a task to `target` if that is its single legal next status.
    ///
    /// Illegal requests fail before any write and leave the record untouched.
    /// The write is a compare-and-set on the status read here, so two racing
    /// transitions cannot both succeed.
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn transition(
        &self,
        task_id: TaskId,
        target: TaskStatus,
        actor: &ActorContext,
    ) -> Result<TaskOutcome, LifecycleError> {
        let current = self.tasks.get(task_id).await.map_err(|err| match err {
            StoreError::NotFound(_) => LifecycleError::TaskNotFound(task_id),
            other => LifecycleError::Persistence(other),
        })?;
        let from = current.status();
        let now = self.clock.now();
        let stage = current.stage.advance(target, now, &actor.user_id)?;
        let task = self.tasks.update_stage(task_id, from, stage).await?;

        let mut requested = Vec::new();
        if target == TaskStatus::Completed {
            requested.extend(completion_effects(&task, actor, now));
        }
        requested.push(SideEffect::RecomputeFlag {
            user_id: task.assignee_id.clone(),
        });

        self.telemetry
            .emit(
                LogLevel::Info,
                "pulse.lifecycle.transitioned",
                &task.id.to_string(),
                json!({
                    "from": from,
                    "to": target,
                    "assignee": task.assignee_id,
                    "actor": actor.user_id,
                }),
            )
            .await;

        let effects = self.effects.run_all(requested).await;
        Ok(TaskOutcome { task, effects })
    }

    /// `Assigned -> Ongoing`.
    pub async fn start(
        &self,
        task_id: TaskId,
        actor: &ActorContext,
    ) -> Result<TaskOutcome, LifecycleError> {
        self.transition(task_id, TaskStatus::Ongoing, actor).await
    }

    /// `Ongoing -> Completed`.
    pub async fn complete(
        &self,
        task_id: TaskId,
        actor: &ActorContext,
    ) -> Result<TaskOutcome, LifecycleError> {
        self.transition(task_id, TaskStatus::Completed, actor).await
    }

    /// `Completed -> Acknowledged`.
    pub async fn acknowledge(
        &self,
        task_id: TaskId,
        actor: &ActorContext,
    ) -> Result<TaskOutcome, LifecycleError> {
        self.transition(task_id, TaskStatus::Acknowledged, actor).await
    }
}

fn completion_effects(
    task: &Task,
    actor: &ActorContext,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<SideEffect> {
    let mut effects = Vec::new();
    if let Some(requester) = task.external_requester() {
        effects.push(SideEffect::Notify(
            Notification::new(
                requester,
                "Task Completed",
                format!("{} completed: {}", actor.name, task.title),
                NotificationKind::Success,
            )
            .related_to("task", task.id.to_string()),
        ));
    }
    if let Some(context) = &task.context {
        effects.push(SideEffect::AppendHistory {
            context_id: context.id.clone(),
            entry: HistoryEntry {
                at: now,
                actor_id: actor.user_id.clone(),
                actor_name: actor.name.clone(),
                action: "Task Completed".into(),
                task_id: task.id,
                note: task.title.clone(),
            },
        });
        effects.push(SideEffect::LogActivity(ActivityEntry {
            description: format!("Completed task: {}", task.title),
            role: actor.role.to_string(),
            user_id: actor.user_id.clone(),
            status: TaskStatus::Completed.to_string(),
            context_id: Some(context.id.clone()),
            at: now,
        }));
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::Flag,
        store::{
            memory::{MemoryBackend, MemoryTaskStore},
            TaskFeed,
        },
        task::TaskStage,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn controller(backend: &MemoryBackend) -> LifecycleController {
        LifecycleController::builder(backend.collaborators())
            .policy(EffectPolicy {
                attempts: 2,
                backoff: StdDuration::ZERO,
            })
            .build()
    }

    fn manager() -> ActorContext {
        ActorContext::new("m1", "Meera", StaffRole::Manager)
    }

    fn worker() -> ActorContext {
        ActorContext::new("u1", "Ravi", StaffRole::Staff)
    }

    fn draft() -> NewTask {
        NewTask::new("u1", "Prepare BOQ", now().date_naive())
            .requested_by("m1")
            .in_context("lead-42", "lead")
    }

    #[tokio::test]
    async fn create_notifies_assignee_and_recomputes() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let outcome = controller
            .create(draft().due(now() + Duration::minutes(20)), &manager())
            .await
            .unwrap();

        assert_eq!(outcome.task.status(), TaskStatus::Assigned);
        assert!(outcome.fully_applied());
        let sent = backend.notifications.sent_to("u1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "New Task Assigned");
        assert_eq!(sent[0].kind, NotificationKind::Info);
        assert_eq!(
            sent[0].related.as_ref().map(|r| r.entity_type.as_str()),
            Some("task")
        );
        assert_eq!(backend.directory.flag("u1").unwrap().flag, Flag::Yellow);
    }

    #[tokio::test]
    async fn self_assigned_task_sends_no_notification() {
        let backend = MemoryBackend::new(now());
        controller(&backend).create(draft(), &worker()).await.unwrap();
        assert!(backend.notifications.sent().is_empty());
        assert!(backend.directory.flag("u1").is_some());
    }

    #[tokio::test]
    async fn invalid_draft_never_reaches_the_store() {
        let backend = MemoryBackend::new(now());
        let err = controller(&backend)
            .create(NewTask::new("u1", " ", now().date_naive()), &manager())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(TaskValidationError::EmptyTitle)));
        assert!(backend.tasks.list_for_assignee("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skipping_to_acknowledged_is_rejected_and_record_unchanged() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;

        let err = controller.acknowledge(task.id, &manager()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: TaskStatus::Assigned,
                to: TaskStatus::Acknowledged
            }
        ));
        let stored = backend.tasks.get(task.id).await.unwrap();
        assert_eq!(stored.stage, TaskStage::Assigned);
    }

    #[tokio::test]
    async fn backward_and_repeated_transitions_are_rejected() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;
        controller.start(task.id, &worker()).await.unwrap();

        for target in [TaskStatus::Assigned, TaskStatus::Ongoing, TaskStatus::Acknowledged] {
            let err = controller
                .transition(task.id, target, &worker())
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidTransition { .. }), "{target}");
        }
        assert_eq!(
            backend.tasks.get(task.id).await.unwrap().status(),
            TaskStatus::Ongoing
        );
    }

    #[tokio::test]
    async fn completion_notifies_requester_and_writes_history() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;
        controller.start(task.id, &worker()).await.unwrap();
        backend.clock.advance(Duration::minutes(45));
        let outcome = controller.complete(task.id, &worker()).await.unwrap();

        assert_eq!(outcome.task.stage.completed_at(), Some(now() + Duration::minutes(45)));
        assert!(outcome.fully_applied());
        let to_requester = backend.notifications.sent_to("m1");
        assert_eq!(to_requester.len(), 1);
        assert_eq!(to_requester[0].title, "Task Completed");
        assert_eq!(to_requester[0].kind, NotificationKind::Success);

        let history = backend.contexts.entries("lead-42");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "Task Completed");
        assert_eq!(history[0].task_id, task.id);
        let activity = backend.activity.entries();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].status, "Completed");
        assert_eq!(activity[0].role, "Staff");
    }

    #[tokio::test]
    async fn acknowledgement_records_reviewer() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;
        controller.start(task.id, &worker()).await.unwrap();
        controller.complete(task.id, &worker()).await.unwrap();
        let outcome = controller.acknowledge(task.id, &manager()).await.unwrap();
        assert_eq!(outcome.task.stage.acknowledged_by(), Some("m1"));
        assert_eq!(outcome.effects.len(), 1);
        assert_eq!(outcome.effects[0].effect.label(), "recompute_flag");
    }

    #[tokio::test]
    async fn side_effect_failure_does_not_revert_the_transition() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;
        controller.start(task.id, &worker()).await.unwrap();

        backend.notifications.fail_for("m1");
        backend.contexts.fail_writes(true);
        backend.directory.fail_flag_writes(true);
        let outcome = controller.complete(task.id, &worker()).await.unwrap();

        assert_eq!(outcome.task.status(), TaskStatus::Completed);
        let dropped: Vec<&str> = outcome.dropped().map(|r| r.effect.label()).collect();
        assert_eq!(dropped, ["notify", "append_history", "recompute_flag"]);
        assert!(outcome.dropped().all(|r| r.attempts == 2));
        assert_eq!(backend.activity.entries().len(), 1);
        assert_eq!(
            backend.tasks.get(task.id).await.unwrap().status(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let backend = MemoryBackend::new(now());
        let id = uuid::Uuid::new_v4();
        let err = controller(&backend).start(id, &worker()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TaskNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn failed_status_write_surfaces_as_persistence_error() {
        let backend = MemoryBackend::new(now());
        let controller = controller(&backend);
        let task = controller.create(draft(), &manager()).await.unwrap().task;
        backend.tasks.fail_writes(true);
        let err = controller.start(task.id, &worker()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Persistence(StoreError::Unavailable(_))));
    }

    /// Starts the task on behalf of another worker between the controller's
    /// read and its write.
    struct InterleavedStore {
        inner: Arc<MemoryTaskStore>,
    }

    #[async_trait]
    impl TaskStore for InterleavedStore {
        async fn insert(
            &self,
            draft: NewTask,
            creator_id: &str,
            created_at: DateTime<Utc>,
        ) -> Result<Task, StoreError> {
            self.inner.insert(draft, creator_id, created_at).await
        }

        async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
            let read = self.inner.get(id).await?;
            let rival = read
                .stage
                .advance(TaskStatus::Ongoing, now() - Duration::minutes(1), "u2")
                .unwrap();
            self.inner.update_stage(id, read.status(), rival).await?;
            Ok(read)
        }

        async fn update_stage(
            &self,
            id: TaskId,
            expected: TaskStatus,
            stage: TaskStage,
        ) -> Result<Task, StoreError> {
            self.inner.update_stage(id, expected, stage).await
        }

        async fn list_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, StoreError> {
            self.inner.list_for_assignee(assignee).await
        }

        async fn subscribe_assignee(&self, assignee: &str) -> Result<TaskFeed, StoreError> {
            self.inner.subscribe_assignee(assignee).await
        }
    }

    #[tokio::test]
    async fn stale_transition_loses_the_compare_and_set() {
        let backend = MemoryBackend::new(now());
        let mut collaborators = backend.collaborators();
        collaborators.tasks = Arc::new(InterleavedStore {
            inner: Arc::clone(&backend.tasks),
        });
        let controller = LifecycleController::builder(collaborators).build();
        let task = backend.tasks.insert(draft(), "m1", now()).await.unwrap();

        let err = controller.start(task.id, &worker()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Persistence(StoreError::Conflict {
                expected: TaskStatus::Assigned,
                found: TaskStatus::Ongoing,
                ..
            })
        ));
        let stored = backend.tasks.get(task.id).await.unwrap();
        assert_eq!(stored.stage.started_at(), Some(now() - Duration::minutes(1)));
        assert!(backend.notifications.sent().is_empty());
        assert!(backend.directory.flag("u1").is_none());
    }
}
