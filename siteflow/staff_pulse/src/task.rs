//! Task records and their fixed lifecycle.
//!
//! The lifecycle timestamps live inside [`TaskStage`], so a task can only
//! carry the instants that are valid for its current status.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier generated by the task store on insert.
pub type TaskId = Uuid;
/// Opaque staff identifier owned by the staff directory.
pub type UserId = String;
/// Identifier of an external project/case a task may reference.
pub type ContextId = String;

const MAX_TITLE_CHARS: usize = 200;

/// Lifecycle status, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskStatus {
    /// Created and waiting for the assignee.
    Assigned,
    /// Work has started.
    Ongoing,
    /// Work is finished and awaiting review.
    Completed,
    /// Reviewed by someone with oversight.
    Acknowledged,
}

impl TaskStatus {
    /// The single status reachable from `self`, if any.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Assigned => Some(Self::Ongoing),
            Self::Ongoing => Some(Self::Completed),
            Self::Completed => Some(Self::Acknowledged),
            Self::Acknowledged => None,
        }
    }

    /// Whether `target` is the legal next status.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.successor() == Some(target)
    }

    /// Whether a task in this status still counts against its assignee.
    ///
    /// Only `Completed` drops out. Acknowledged tasks are expected to leave
    /// the assignee's feed through downstream queries; while still present
    /// they count as pending.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "Assigned"),
            Self::Ongoing => write!(f, "Ongoing"),
            Self::Completed => write!(f, "Completed"),
            Self::Acknowledged => write!(f, "Acknowledged"),
        }
    }
}

/// Requested status change does not follow the lifecycle order.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current status.
    pub from: TaskStatus,
    /// Requested status.
    pub to: TaskStatus,
}

/// Lifecycle position together with the timestamps that position implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum TaskStage {
    /// Waiting for the assignee.
    Assigned,
    /// Started.
    Ongoing {
        /// When work started.
        started_at: DateTime<Utc>,
    },
    /// Finished.
    Completed {
        /// When work started.
        started_at: DateTime<Utc>,
        /// When work finished.
        completed_at: DateTime<Utc>,
    },
    /// Reviewed.
    Acknowledged {
        /// When work started.
        started_at: DateTime<Utc>,
        /// When work finished.
        completed_at: DateTime<Utc>,
        /// When the review happened.
        acknowledged_at: DateTime<Utc>,
        /// Who reviewed it.
        acknowledged_by: UserId,
    },
}

impl TaskStage {
    /// Status of this stage.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        match self {
            Self::Assigned => TaskStatus::Assigned,
            Self::Ongoing { .. } => TaskStatus::Ongoing,
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Acknowledged { .. } => TaskStatus::Acknowledged,
        }
    }

    /// Set once the task leaves `Assigned`.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Assigned => None,
            Self::Ongoing { started_at }
            | Self::Completed { started_at, .. }
            | Self::Acknowledged { started_at, .. } => Some(*started_at),
        }
    }

    /// Set once the task reaches `Completed`.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Completed { completed_at, .. } | Self::Acknowledged { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Set only in `Acknowledged`.
    #[must_use]
    pub const fn acknowledged_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Acknowledged {
                acknowledged_at, ..
            } => Some(*acknowledged_at),
            _ => None,
        }
    }

    /// Reviewer, set only in `Acknowledged`.
    #[must_use]
    pub fn acknowledged_by(&self) -> Option<&str> {
        match self {
            Self::Acknowledged {
                acknowledged_by, ..
            } => Some(acknowledged_by),
            _ => None,
        }
    }

    /// Moves one step forward, stamping the instant the step implies.
    pub fn advance(
        &self,
        target: TaskStatus,
        at: DateTime<Utc>,
        actor: &str,
    ) -> Result<Self, InvalidTransition> {
        let invalid = InvalidTransition {
            from: self.status(),
            to: target,
        };
        match (self, target) {
            (Self::Assigned, TaskStatus::Ongoing) => Ok(Self::Ongoing { started_at: at }),
            (Self::Ongoing { started_at }, TaskStatus::Completed) => Ok(Self::Completed {
                started_at: *started_at,
                completed_at: at,
            }),
            (
                Self::Completed {
                    started_at,
                    completed_at,
                },
                TaskStatus::Acknowledged,
            ) => Ok(Self::Acknowledged {
                started_at: *started_at,
                completed_at: *completed_at,
                acknowledged_at: at,
                acknowledged_by: actor.to_string(),
            }),
            _ => Err(invalid),
        }
    }
}

/// Work category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum TaskCategory {
    /// Preparing a quotation.
    Quotation,
    /// Design drawings.
    Drawing,
    /// Bill of quantities.
    #[serde(rename = "BOQ")]
    Boq,
    /// Visiting a site.
    #[serde(rename = "Site Visit")]
    SiteVisit,
    /// Purchasing materials.
    Procurement,
    /// On-site execution.
    Execution,
    /// Anything else.
    #[default]
    General,
}

/// Task priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum TaskPriority {
    /// Urgent.
    High,
    /// Normal.
    #[default]
    Medium,
    /// Can wait.
    Low,
}

/// External project/case a task belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskContext {
    /// Context identifier.
    pub id: ContextId,
    /// Context category, e.g. `lead` or `project`.
    pub category: String,
}

/// Durable unit of assigned work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Store-generated id.
    pub id: TaskId,
    /// Who does the work.
    pub assignee_id: UserId,
    /// Who created the record.
    pub creator_id: UserId,
    /// Who asked for the work, notified on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<UserId>,
    /// Linked project/case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    /// Short title.
    pub title: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Category.
    #[serde(default)]
    pub category: TaskCategory,
    /// Priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Calendar day the task belongs to.
    pub date: NaiveDate,
    /// Deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Lifecycle position; serialized inline as `status` plus its timestamps.
    #[serde(flatten)]
    pub stage: TaskStage,
}

impl Task {
    /// Builds a freshly inserted task in `Assigned`.
    #[must_use]
    pub fn assigned(
        id: TaskId,
        draft: NewTask,
        creator_id: impl Into<UserId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            assignee_id: draft.assignee_id,
            creator_id: creator_id.into(),
            requester_id: draft.requester_id,
            context: draft.context,
            title: draft.title,
            description: draft.description,
            category: draft.category,
            priority: draft.priority,
            created_at,
            date: draft.date,
            due_at: draft.due_at,
            stage: TaskStage::Assigned,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.stage.status()
    }

    /// Whether the task still counts as open work.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.stage.status().is_pending()
    }

    /// Open and past its deadline.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.due_at.is_some_and(|due| due < now)
    }

    /// Time left until the deadline; negative once overdue.
    #[must_use]
    pub fn time_left(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.due_at.map(|due| due - now)
    }

    /// Requester to notify on completion, when distinct from the assignee.
    #[must_use]
    pub fn external_requester(&self) -> Option<&str> {
        self.requester_id
            .as_deref()
            .filter(|requester| *requester != self.assignee_id)
    }
}

/// Rejected task draft.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskValidationError {
    /// Title empty after trimming.
    #[error("task title cannot be empty")]
    EmptyTitle,
    /// Title exceeds the maximum length.
    #[error("task title too long (max 200 characters)")]
    TitleTooLong,
    /// Assignee id empty.
    #[error("task must have an assignee")]
    MissingAssignee,
}

/// Fields supplied by the caller when creating a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    /// Who does the work.
    pub assignee_id: UserId,
    /// Who asked for it.
    #[serde(default)]
    pub requester_id: Option<UserId>,
    /// Linked project/case.
    #[serde(default)]
    pub context: Option<TaskContext>,
    /// Short title.
    pub title: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Category.
    #[serde(default)]
    pub category: TaskCategory,
    /// Priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Calendar day.
    pub date: NaiveDate,
    /// Deadline.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Creates a draft with default category and priority.
    #[must_use]
    pub fn new(assignee_id: impl Into<UserId>, title: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            assignee_id: assignee_id.into(),
            requester_id: None,
            context: None,
            title: title.into(),
            description: String::new(),
            category: TaskCategory::default(),
            priority: TaskPriority::default(),
            date,
            due_at: None,
        }
    }

    /// Sets the deadline.
    #[must_use]
    pub fn due(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    /// Sets the requester.
    #[must_use]
    pub fn requested_by(mut self, requester: impl Into<UserId>) -> Self {
        self.requester_id = Some(requester.into());
        self
    }

    /// Links the task to a project/case.
    #[must_use]
    pub fn in_context(mut self, id: impl Into<ContextId>, category: impl Into<String>) -> Self {
        self.context = Some(TaskContext {
            id: id.into(),
            category: category.into(),
        });
        self
    }

    /// Sets the category.
    #[must_use]
    pub fn category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks the draft before it reaches the store.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(TaskValidationError::EmptyTitle);
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(TaskValidationError::TitleTooLong);
        }
        if self.assignee_id.trim().is_empty() {
            return Err(TaskValidationError::MissingAssignee);
        }
        Ok(())
    }
}
