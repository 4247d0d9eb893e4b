//! Contracts the engine needs from the surrounding application: task store,
//! staff directory, notification sink, context history, activity log, clock.
//!
//! The engine never talks to a concrete database. Embedding applications
//! implement these traits; [`memory`] ships in-process versions.

/// In-process collaborators backed by `tokio::sync::broadcast`.
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    flags::FlagRecord,
    task::{ContextId, NewTask, Task, TaskId, TaskStage, TaskStatus, UserId},
};

/// Persistence and subscription failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record with that id.
    #[error("record not found: {0}")]
    NotFound(String),
    /// The record changed underneath a compare-and-set write.
    #[error("conflicting update on {id}: expected {expected}, found {found}")]
    Conflict {
        /// Record id.
        id: String,
        /// Status the writer expected.
        expected: TaskStatus,
        /// Status actually stored.
        found: TaskStatus,
    },
    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A live feed failed.
    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// Full task set for one assignee, re-delivered on every change.
pub type TaskSnapshot = Result<Vec<Task>, StoreError>;

/// Live feed of snapshots for one assignee. Dropping it unsubscribes.
#[derive(Debug)]
pub struct TaskFeed {
    assignee: UserId,
    rx: mpsc::Receiver<TaskSnapshot>,
}

impl TaskFeed {
    /// Wraps the receiving half of a snapshot channel.
    #[must_use]
    pub fn new(assignee: impl Into<UserId>, rx: mpsc::Receiver<TaskSnapshot>) -> Self {
        Self {
            assignee: assignee.into(),
            rx,
        }
    }

    /// User whose tasks this feed carries.
    #[must_use]
    pub fn assignee(&self) -> &str {
        &self.assignee
    }

    /// Next snapshot, or `None` once the store closes the feed.
    pub async fn next(&mut self) -> Option<TaskSnapshot> {
        self.rx.recv().await
    }
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task in `Assigned` with a generated id.
    async fn insert(
        &self,
        draft: NewTask,
        creator_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    /// Loads one task.
    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Replaces the lifecycle stage of a task if its stored status is still
    /// `expected`.
    async fn update_stage(
        &self,
        id: TaskId,
        expected: TaskStatus,
        stage: TaskStage,
    ) -> Result<Task, StoreError>;

    /// One-shot read of every task assigned to `assignee`.
    async fn list_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, StoreError>;

    /// Live feed of `assignee`'s tasks. The current set is delivered first.
    async fn subscribe_assignee(&self, assignee: &str) -> Result<TaskFeed, StoreError>;
}

/// Role held in the organisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StaffRole {
    /// Full administrative access.
    Admin,
    /// Team oversight.
    Manager,
    /// Regular staff.
    Staff,
    /// Any role the engine does not interpret.
    Other(String),
}

impl StaffRole {
    /// Roles that receive red-flag escalations.
    #[must_use]
    pub const fn is_oversight(&self) -> bool {
        matches!(self, Self::Admin | Self::Manager)
    }
}

impl fmt::Display for StaffRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "Admin"),
            Self::Manager => write!(f, "Manager"),
            Self::Staff => write!(f, "Staff"),
            Self::Other(role) => write!(f, "{role}"),
        }
    }
}

/// Entry in the staff directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaffMember {
    /// Directory id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Role.
    pub role: StaffRole,
    /// Inactive members are neither monitored nor notified.
    #[serde(default = "default_active")]
    pub active: bool,
}

const fn default_active() -> bool {
    true
}

impl StaffMember {
    /// Creates an active member.
    #[must_use]
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: StaffRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            active: true,
        }
    }
}

/// Staff directory: roster plus the embedded flag record.
#[async_trait]
pub trait StaffDirectory: Send + Sync {
    /// Every staff member, active or not.
    async fn list_staff(&self) -> Result<Vec<StaffMember>, StoreError>;

    /// Last persisted flag record for `user_id`.
    async fn read_flag(&self, user_id: &str) -> Result<Option<FlagRecord>, StoreError>;

    /// Overwrites the flag record of `user_id` as one unit.
    async fn write_flag(&self, user_id: &str, record: &FlagRecord) -> Result<(), StoreError>;
}

/// Presentation hint for a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Neutral information.
    Info,
    /// Something finished.
    Success,
    /// Needs attention.
    Warning,
    /// Alert.
    Error,
}

/// Entity a notification links to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedEntity {
    /// Entity type, e.g. `task` or `user`.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
}

/// Directed notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// Recipient user id.
    pub recipient: UserId,
    /// Title.
    pub title: String,
    /// Body.
    pub message: String,
    /// Presentation hint.
    pub kind: NotificationKind,
    /// Linked entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<RelatedEntity>,
}

impl Notification {
    /// Creates a notification without a linked entity.
    #[must_use]
    pub fn new(
        recipient: impl Into<UserId>,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            title: title.into(),
            message: message.into(),
            kind,
            related: None,
        }
    }

    /// Links the notification to an entity.
    #[must_use]
    pub fn related_to(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.related = Some(RelatedEntity {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        });
        self
    }
}

/// Delivery failed for one recipient.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("notification to {recipient} failed: {message}")]
pub struct NotificationError {
    /// Recipient that was not reached.
    pub recipient: UserId,
    /// Backend message.
    pub message: String,
}

/// Best-effort notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sends one notification.
    async fn send(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// One line of a context's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Who did it.
    pub actor_id: UserId,
    /// Actor display name.
    pub actor_name: String,
    /// Short action label.
    pub action: String,
    /// Task involved.
    pub task_id: TaskId,
    /// Free text.
    #[serde(default)]
    pub note: String,
}

/// Project/case history.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Current history array of a context.
    async fn history(&self, context_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Rewrites the history array of a context.
    async fn replace_history(
        &self,
        context_id: &str,
        history: Vec<HistoryEntry>,
    ) -> Result<(), StoreError>;
}

/// Entry in the global activity log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEntry {
    /// What happened.
    pub description: String,
    /// Role of the actor.
    pub role: String,
    /// Actor id.
    pub user_id: UserId,
    /// Resulting status label.
    pub status: String,
    /// Related context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Append-only global activity log.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    /// Appends one entry.
    async fn append(&self, entry: ActivityEntry) -> Result<(), StoreError>;
}

/// Source of "now".
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Starts at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Jumps to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Moves forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Every collaborator the engine needs, bundled for wiring.
#[derive(Clone)]
pub struct Collaborators {
    /// Task persistence.
    pub tasks: Arc<dyn TaskStore>,
    /// Staff directory.
    pub directory: Arc<dyn StaffDirectory>,
    /// Notification sink.
    pub notifications: Arc<dyn NotificationSink>,
    /// Context history.
    pub contexts: Arc<dyn ContextStore>,
    /// Activity log.
    pub activity: Arc<dyn ActivityLog>,
    /// Clock.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}
