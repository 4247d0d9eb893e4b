use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    ActivityEntry, ActivityLog, Clock, Collaborators, ContextStore, HistoryEntry, ManualClock,
    Notification, NotificationError, NotificationSink, StaffDirectory, StaffMember, StoreError,
    TaskFeed, TaskStore,
};
use crate::{
    flags::FlagRecord,
    task::{NewTask, Task, TaskId, TaskStage, TaskStatus, UserId},
};

const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum StoreSignal {
    Changed(UserId),
    Failed(UserId, String),
}

#[derive(Debug)]
struct TaskStoreInner {
    tasks: RwLock<IndexMap<TaskId, Task>>,
    changes: broadcast::Sender<StoreSignal>,
    feed_capacity: usize,
    live_feeds: AtomicUsize,
    fail_writes: AtomicBool,
    fail_subscriptions: AtomicBool,
}

impl TaskStoreInner {
    fn snapshot_for(&self, assignee: &str) -> Vec<Task> {
        self.tasks
            .read()
            .values()
            .filter(|task| task.assignee_id == assignee)
            .cloned()
            .collect()
    }

    fn announce(&self, assignee: &str) {
        // Nobody listening is fine.
        let _ = self.changes.send(StoreSignal::Changed(assignee.to_string()));
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("task store rejected write".into()));
        }
        Ok(())
    }
}

struct FeedGuard(Arc<TaskStoreInner>);

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.0.live_feeds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process task store. Every write fans out to live feeds of the
/// affected assignee, which re-read and deliver the full set.
#[derive(Debug, Clone)]
pub struct MemoryTaskStore {
    inner: Arc<TaskStoreInner>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl MemoryTaskStore {
    /// Creates a store whose feeds buffer up to `feed_capacity` snapshots.
    #[must_use]
    pub fn new(feed_capacity: usize) -> Self {
        let feed_capacity = feed_capacity.max(1);
        let (changes, _) = broadcast::channel(feed_capacity);
        Self {
            inner: Arc::new(TaskStoreInner {
                tasks: RwLock::new(IndexMap::new()),
                changes,
                feed_capacity,
                live_feeds: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
                fail_subscriptions: AtomicBool::new(false),
            }),
        }
    }

    /// Stores a fully formed task as-is and notifies its assignee's feeds.
    pub fn seed(&self, task: Task) {
        let assignee = task.assignee_id.clone();
        self.inner.tasks.write().insert(task.id, task);
        self.inner.announce(&assignee);
    }

    /// Number of feeds whose forwarding task is still running.
    #[must_use]
    pub fn live_feeds(&self) -> usize {
        self.inner.live_feeds.load(Ordering::SeqCst)
    }

    /// Makes every subsequent write fail with `Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent subscribe call fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.inner.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Pushes an error into every live feed of `assignee`.
    pub fn break_feed(&self, assignee: &str, message: impl Into<String>) {
        let _ = self
            .inner
            .changes
            .send(StoreSignal::Failed(assignee.to_string(), message.into()));
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(
        &self,
        draft: NewTask,
        creator_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.inner.check_writable()?;
        let task = Task::assigned(Uuid::new_v4(), draft, creator_id, created_at);
        self.inner.tasks.write().insert(task.id, task.clone());
        self.inner.announce(&task.assignee_id);
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.inner
            .tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_stage(
        &self,
        id: TaskId,
        expected: TaskStatus,
        stage: TaskStage,
    ) -> Result<Task, StoreError> {
        self.inner.check_writable()?;
        let updated = {
            let mut tasks = self.inner.tasks.write();
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if task.status() != expected {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected,
                    found: task.status(),
                });
            }
            task.stage = stage;
            task.clone()
        };
        self.inner.announce(&updated.assignee_id);
        Ok(updated)
    }

    async fn list_for_assignee(&self, assignee: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self.inner.snapshot_for(assignee))
    }

    async fn subscribe_assignee(&self, assignee: &str) -> Result<TaskFeed, StoreError> {
        if self.inner.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(StoreError::Subscription(format!(
                "cannot open feed for {assignee}"
            )));
        }
        let (tx, rx) = mpsc::channel(self.inner.feed_capacity);
        let mut changes = self.inner.changes.subscribe();
        self.inner.live_feeds.fetch_add(1, Ordering::SeqCst);
        let guard = FeedGuard(Arc::clone(&self.inner));
        let inner = Arc::clone(&self.inner);
        let owner = assignee.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            if tx.send(Ok(inner.snapshot_for(&owner))).await.is_err() {
                return;
            }
            loop {
                let signal = tokio::select! {
                    _ = tx.closed() => break,
                    signal = changes.recv() => signal,
                };
                let outgoing = match signal {
                    Ok(StoreSignal::Changed(user)) if user == owner => {
                        Ok(inner.snapshot_for(&owner))
                    }
                    Ok(StoreSignal::Failed(user, message)) if user == owner => {
                        Err(StoreError::Subscription(message))
                    }
                    Ok(_) => continue,
                    // Missed signals are covered by re-reading the full set.
                    Err(broadcast::error::RecvError::Lagged(_)) => Ok(inner.snapshot_for(&owner)),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(outgoing).await.is_err() {
                    break;
                }
            }
        });

        Ok(TaskFeed::new(assignee, rx))
    }
}

/// In-process staff directory with embedded flag records.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    staff: RwLock<IndexMap<UserId, StaffMember>>,
    flags: RwLock<HashMap<UserId, FlagRecord>>,
    flag_writes: AtomicUsize,
    fail_listing: AtomicBool,
    fail_flag_writes: AtomicBool,
}

impl MemoryDirectory {
    /// Adds or replaces a member.
    pub fn upsert(&self, member: StaffMember) {
        self.staff.write().insert(member.id.clone(), member);
    }

    /// Removes a member from the roster.
    pub fn remove(&self, user_id: &str) -> Option<StaffMember> {
        self.staff.write().shift_remove(user_id)
    }

    /// Flags a member inactive.
    pub fn deactivate(&self, user_id: &str) {
        if let Some(member) = self.staff.write().get_mut(user_id) {
            member.active = false;
        }
    }

    /// Stored flag record of `user_id`.
    #[must_use]
    pub fn flag(&self, user_id: &str) -> Option<FlagRecord> {
        self.flags.read().get(user_id).cloned()
    }

    /// Overwrites a stored flag without counting it as an engine write.
    pub fn seed_flag(&self, user_id: &str, record: FlagRecord) {
        self.flags.write().insert(user_id.to_string(), record);
    }

    /// Number of successful flag writes so far.
    #[must_use]
    pub fn flag_writes(&self) -> usize {
        self.flag_writes.load(Ordering::SeqCst)
    }

    /// Makes `list_staff` fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Makes `write_flag` fail.
    pub fn fail_flag_writes(&self, fail: bool) {
        self.fail_flag_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StaffDirectory for MemoryDirectory {
    async fn list_staff(&self) -> Result<Vec<StaffMember>, StoreError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("staff directory offline".into()));
        }
        Ok(self.staff.read().values().cloned().collect())
    }

    async fn read_flag(&self, user_id: &str) -> Result<Option<FlagRecord>, StoreError> {
        Ok(self.flag(user_id))
    }

    async fn write_flag(&self, user_id: &str, record: &FlagRecord) -> Result<(), StoreError> {
        if self.fail_flag_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "flag write for {user_id} rejected"
            )));
        }
        self.flags.write().insert(user_id.to_string(), record.clone());
        self.flag_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: RwLock<Vec<Notification>>,
    failing: RwLock<HashSet<UserId>>,
}

impl MemoryNotifier {
    /// Makes delivery to `recipient` fail.
    pub fn fail_for(&self, recipient: impl Into<UserId>) {
        self.failing.write().insert(recipient.into());
    }

    /// Everything delivered so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.read().clone()
    }

    /// Notifications delivered to `recipient`.
    #[must_use]
    pub fn sent_to(&self, recipient: &str) -> Vec<Notification> {
        self.sent
            .read()
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        if self.failing.read().contains(&notification.recipient) {
            return Err(NotificationError {
                recipient: notification.recipient,
                message: "recipient unreachable".into(),
            });
        }
        self.sent.write().push(notification);
        Ok(())
    }
}

/// In-process context history. Unknown contexts start with empty history.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    histories: RwLock<HashMap<String, Vec<HistoryEntry>>>,
    fail_writes: AtomicBool,
}

impl MemoryContextStore {
    /// History of `context_id`.
    #[must_use]
    pub fn entries(&self, context_id: &str) -> Vec<HistoryEntry> {
        self.histories
            .read()
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes `replace_history` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn history(&self, context_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.entries(context_id))
    }

    async fn replace_history(
        &self,
        context_id: &str,
        history: Vec<HistoryEntry>,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "context {context_id} is read-only"
            )));
        }
        self.histories.write().insert(context_id.to_string(), history);
        Ok(())
    }
}

/// In-process activity log.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: RwLock<Vec<ActivityEntry>>,
    fail_appends: AtomicBool,
}

impl MemoryActivityLog {
    /// Every entry so far.
    #[must_use]
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().clone()
    }

    /// Makes `append` fail.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn append(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("activity log unavailable".into()));
        }
        self.entries.write().push(entry);
        Ok(())
    }
}

/// Concrete in-process collaborators, kept typed so callers can inspect
/// them and inject failures.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    /// Task store.
    pub tasks: Arc<MemoryTaskStore>,
    /// Staff directory.
    pub directory: Arc<MemoryDirectory>,
    /// Notification recorder.
    pub notifications: Arc<MemoryNotifier>,
    /// Context histories.
    pub contexts: Arc<MemoryContextStore>,
    /// Activity log.
    pub activity: Arc<MemoryActivityLog>,
    /// Clock shared by every component.
    pub clock: ManualClock,
}

impl MemoryBackend {
    /// Empty backend with the clock set to `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_feed_capacity(now, DEFAULT_FEED_CAPACITY)
    }

    /// Empty backend with a custom feed buffer size.
    #[must_use]
    pub fn with_feed_capacity(now: DateTime<Utc>, feed_capacity: usize) -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::new(feed_capacity)),
            directory: Arc::new(MemoryDirectory::default()),
            notifications: Arc::new(MemoryNotifier::default()),
            contexts: Arc::new(MemoryContextStore::default()),
            activity: Arc::new(MemoryActivityLog::default()),
            clock: ManualClock::new(now),
        }
    }

    /// Type-erased view using the backend's manual clock.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with_clock(Arc::new(self.clock.clone()))
    }

    /// Type-erased view using a different clock.
    #[must_use]
    pub fn collaborators_with_clock(&self, clock: Arc<dyn Clock>) -> Collaborators {
        Collaborators {
            tasks: self.tasks.clone(),
            directory: self.directory.clone(),
            notifications: self.notifications.clone(),
            contexts: self.contexts.clone(),
            activity: self.activity.clone(),
            clock,
        }
    }
}
