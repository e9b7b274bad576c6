//! Expiry scheduling
//!
//! Temporary punishments register a named task that runs once the duration
//! elapses. [`TaskScheduler`] keeps pending tasks in `schedule.yaml`, so tasks
//! missed while the bot was down still run after a restart. The
//! [`ExpiryHandler`] turns a due task back into an undo.

use crate::moderation::{
    ActionContext, ActionData, ActionOptions, ActionRegistry, Entry, ExtraData, GuildOperations,
    ModerationError, ModerationRegistry, ModerationResult, TypeVariation,
};
use crate::settings::SettingsStore;
use crate::storage::{read_yaml, write_yaml_atomic};
use crate::MODERATION_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs a failed task gets before it is dropped
const MAX_TASK_ATTEMPTS: u32 = 5;
/// Delay before the first retry of a failed task, doubled for each later one
const RETRY_BASE_DELAY_SECONDS: i64 = 60;

/// Payload of an undo task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoTaskData {
    pub case_id: u64,
    pub user_id: u64,
    pub guild_id: u64,
    pub kind: TypeVariation,
    pub duration: Option<u64>,
    pub extra_data: Option<ExtraData>,
}

impl From<&Entry> for UndoTaskData {
    fn from(entry: &Entry) -> Self {
        Self {
            case_id: entry.id,
            user_id: entry.user_id,
            guild_id: entry.guild_id,
            kind: entry.kind,
            duration: entry.duration,
            extra_data: entry.extra_data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Run once on startup if the time passed while the bot was offline
    pub catch_up: bool,
    pub data: UndoTaskData,
}

/// Where the manager registers expiry tasks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpiryScheduler: Send + Sync {
    async fn add(&self, task: &str, run_at: DateTime<Utc>, options: ScheduleOptions) -> ModerationResult<()>;

    /// Drop every pending task of a guild, returning how many were dropped
    async fn remove_guild(&self, guild_id: u64) -> ModerationResult<usize>;
}

/// A pending task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub task: String,
    pub run_at: DateTime<Utc>,
    pub catch_up: bool,
    pub data: UndoTaskData,
    /// Failed runs so far
    #[serde(default)]
    pub attempts: u32,
}

/// Runs due tasks
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &ScheduledTask) -> ModerationResult<()>;
}

/// Requests accepted by the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerRequest {
    /// Run every due task now instead of waiting for the next tick
    RunDue,
    Shutdown,
}

/// Durable task queue
pub struct TaskScheduler {
    tasks: DashMap<Uuid, ScheduledTask>,
    path: Option<PathBuf>,
    /// Serializes snapshot writes
    persist_lock: Mutex<()>,
    tx: Sender<SchedulerRequest>,
    rx: Mutex<Option<Receiver<SchedulerRequest>>>,
    /// Tasks later than this without `catch_up` are dropped
    grace: chrono::Duration,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.tasks.len())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// A scheduler persisting to `<data_dir>/schedule.yaml`
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, interval_seconds: u64) -> Self {
        Self::build(Some(data_dir.into().join("schedule.yaml")), interval_seconds)
    }

    /// A scheduler that keeps tasks in memory only
    #[must_use]
    pub fn in_memory(interval_seconds: u64) -> Self {
        Self::build(None, interval_seconds)
    }

    fn build(path: Option<PathBuf>, interval_seconds: u64) -> Self {
        let (tx, rx) = mpsc::channel(100);
        let grace = i64::try_from(interval_seconds.saturating_mul(2)).unwrap_or(i64::MAX);
        Self {
            tasks: DashMap::new(),
            path,
            persist_lock: Mutex::new(()),
            tx,
            rx: Mutex::new(Some(rx)),
            grace: chrono::Duration::try_seconds(grace).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Load tasks saved by a previous run
    ///
    /// # Errors
    /// Returns an error if the schedule file exists but cannot be read.
    pub async fn load(&self) -> ModerationResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let tasks: Vec<ScheduledTask> = read_yaml(path).await?.unwrap_or_default();
        let count = tasks.len();
        for task in tasks {
            self.tasks.insert(task.id, task);
        }
        info!(target: MODERATION_TARGET, count, "Loaded scheduled tasks");
        Ok(count)
    }

    /// Pending tasks ordered by due time
    #[must_use]
    pub fn pending(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.iter().map(|task| task.value().clone()).collect();
        tasks.sort_by_key(|task| task.run_at);
        tasks
    }

    async fn persist(&self) -> ModerationResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        write_yaml_atomic(path, &self.pending()).await?;
        Ok(())
    }

    /// Run every task due at `now` through `handler` and drop it from the queue.
    ///
    /// Tasks that missed their time by more than the grace period run only if
    /// they opted into catch-up. A failed task is queued again with an
    /// exponential backoff until it has failed [`MAX_TASK_ATTEMPTS`] times.
    pub async fn run_due(&self, handler: &dyn TaskHandler, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduledTask> = self
            .pending()
            .into_iter()
            .filter(|task| task.run_at <= now)
            .collect();
        if due.is_empty() {
            return 0;
        }

        let mut ran = 0;
        for task in &due {
            self.tasks.remove(&task.id);

            if !task.catch_up && now - task.run_at > self.grace {
                warn!(
                    target: MODERATION_TARGET,
                    task = %task.task,
                    guild_id = %task.data.guild_id,
                    case_id = %task.data.case_id,
                    "Dropping missed task without catch-up"
                );
                continue;
            }

            debug!(target: MODERATION_TARGET, task = %task.task, case_id = %task.data.case_id, "Running scheduled task");
            if let Err(e) = handler.run(task).await {
                let attempts = task.attempts + 1;
                if is_retryable(&e) && attempts < MAX_TASK_ATTEMPTS {
                    let retry = ScheduledTask {
                        run_at: now + retry_delay(attempts),
                        attempts,
                        ..task.clone()
                    };
                    warn!(
                        target: MODERATION_TARGET,
                        task = %task.task,
                        guild_id = %task.data.guild_id,
                        case_id = %task.data.case_id,
                        attempts,
                        retry_at = %retry.run_at,
                        error = %e,
                        "Scheduled task failed, retrying later"
                    );
                    self.tasks.insert(retry.id, retry);
                } else {
                    error!(
                        target: MODERATION_TARGET,
                        task = %task.task,
                        guild_id = %task.data.guild_id,
                        case_id = %task.data.case_id,
                        attempts,
                        error = %e,
                        "Scheduled task failed"
                    );
                }
            }
            ran += 1;
        }

        if let Err(e) = self.persist().await {
            error!(target: MODERATION_TARGET, error = %e, "Failed to save schedule");
        }
        ran
    }

    /// Ask the loop to run due tasks now
    pub async fn notify(&self, request: SchedulerRequest) -> ModerationResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|e| ModerationError::Scheduler(format!("Failed to send scheduler request: {e}")))
    }

    /// Spawn the scheduler loop. Does nothing if it was already started.
    pub async fn start(self: Arc<Self>, handler: Arc<dyn TaskHandler>, interval_seconds: u64) {
        let Some(rx) = self.rx.lock().await.take() else {
            warn!(target: MODERATION_TARGET, "Scheduler already started");
            return;
        };
        tokio::spawn(async move {
            self.scheduler_task(handler, rx, interval_seconds).await;
        });
    }

    async fn scheduler_task(
        &self,
        handler: Arc<dyn TaskHandler>,
        mut rx: Receiver<SchedulerRequest>,
        interval_seconds: u64,
    ) {
        info!(target: MODERATION_TARGET, "Starting scheduler with {interval_seconds}s interval");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));

        loop {
            tokio::select! {
                Some(request) = rx.recv() => match request {
                    SchedulerRequest::RunDue => {
                        self.run_due(handler.as_ref(), Utc::now()).await;
                    }
                    SchedulerRequest::Shutdown => break,
                },
                _ = interval.tick() => {
                    self.run_due(handler.as_ref(), Utc::now()).await;
                }
            }
        }

        info!(target: MODERATION_TARGET, "Scheduler shut down");
    }
}

/// Unknown task names and kinds fail the same way on every run
fn is_retryable(error: &ModerationError) -> bool {
    !matches!(error, ModerationError::Scheduler(_) | ModerationError::UnknownAction(_))
}

fn retry_delay(attempts: u32) -> chrono::Duration {
    let shift = attempts.saturating_sub(1).min(16);
    chrono::Duration::seconds(RETRY_BASE_DELAY_SECONDS << shift)
}

#[async_trait]
impl ExpiryScheduler for TaskScheduler {
    async fn add(&self, task: &str, run_at: DateTime<Utc>, options: ScheduleOptions) -> ModerationResult<()> {
        let scheduled = ScheduledTask {
            id: Uuid::new_v4(),
            task: task.to_string(),
            run_at,
            catch_up: options.catch_up,
            data: options.data,
            attempts: 0,
        };
        debug!(
            target: MODERATION_TARGET,
            task = %scheduled.task,
            guild_id = %scheduled.data.guild_id,
            case_id = %scheduled.data.case_id,
            run_at = %scheduled.run_at,
            "Task scheduled"
        );
        self.tasks.insert(scheduled.id, scheduled);
        self.persist().await
    }

    async fn remove_guild(&self, guild_id: u64) -> ModerationResult<usize> {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| task.data.guild_id != guild_id);
        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

/// Lifts expired punishments
pub struct ExpiryHandler {
    moderation: ModerationRegistry,
    actions: Arc<ActionRegistry>,
    ops: Arc<dyn GuildOperations>,
    settings: SettingsStore,
}

impl ExpiryHandler {
    #[must_use]
    pub fn new(
        moderation: ModerationRegistry,
        actions: Arc<ActionRegistry>,
        ops: Arc<dyn GuildOperations>,
        settings: SettingsStore,
    ) -> Self {
        Self {
            moderation,
            actions,
            ops,
            settings,
        }
    }
}

#[async_trait]
impl TaskHandler for ExpiryHandler {
    async fn run(&self, task: &ScheduledTask) -> ModerationResult<()> {
        let data = &task.data;
        let kind = TypeVariation::from_undo_task_name(&task.task)
            .ok_or_else(|| ModerationError::Scheduler(format!("Unknown task: {}", task.task)))?;

        let manager = self.moderation.get(data.guild_id);
        let Some(entry) = manager.fetch_one(data.case_id).await? else {
            debug!(target: MODERATION_TARGET, case_id = %data.case_id, "Expired entry no longer exists");
            return Ok(());
        };
        if entry.is_closed() {
            debug!(target: MODERATION_TARGET, case_id = %entry.id, "Expired entry already closed");
            return Ok(());
        }
        if entry.kind != kind || entry.user_id != data.user_id {
            warn!(
                target: MODERATION_TARGET,
                guild_id = %data.guild_id,
                case_id = %entry.id,
                task = %task.task,
                "Expired task does not match its entry"
            );
            return Ok(());
        }

        let guild_name = match self.ops.guild_name(data.guild_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!(target: MODERATION_TARGET, guild_id = %data.guild_id, error = %e, "Guild name unavailable");
                data.guild_id.to_string()
            }
        };
        let ctx = ActionContext {
            guild_id: data.guild_id,
            guild_name,
            manager: Arc::clone(&manager),
            ops: Arc::clone(&self.ops),
            settings: self.settings.clone(),
            delete_message_seconds: 0,
        };
        let options = ActionOptions {
            user_id: data.user_id,
            moderator_id: None,
            reason: Some("Automatic expiry".to_string()),
            duration: None,
            case_id: Some(entry.id),
        };

        self.actions
            .get(kind)?
            .undo(&ctx, options, &ActionData::default())
            .await?;
        manager.complete(&entry).await?;

        info!(
            target: MODERATION_TARGET,
            guild_id = %data.guild_id,
            case_id = %entry.id,
            user_id = %entry.user_id,
            action_type = %kind,
            "Moderation entry expired"
        );
        Ok(())
    }
}
