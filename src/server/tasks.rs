//! The task table and its state machine driver.
//!
//! Tasks live in an insertion-ordered table behind a dedicated
//! read/write lock. Lifecycle hooks always fire after the lock is
//! released; hook callbacks must not re-enter the task API for the same
//! id.

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::protocol::CallToolResult;
use crate::types::tasks::{Task, TaskRequestParams, TaskStatus};

use super::hooks::Hooks;
use super::registry::paginate;

/// Tuning knobs for the task subsystem.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Active-task ceiling; `0` means unlimited.
    pub max_concurrent: usize,
    /// Retention after a terminal state when the caller gave no TTL,
    /// in milliseconds.
    pub default_ttl_ms: u64,
    /// Poll interval suggested to clients that gave none.
    pub default_poll_interval_ms: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            default_ttl_ms: 300_000,
            default_poll_interval_ms: None,
        }
    }
}

struct TaskEntry {
    task: Task,
    tool_name: String,
    cancel: CancellationToken,
    result: Option<CallToolResult>,
    error: Option<String>,
}

/// Server-wide task table with concurrency limiting, cancellation, and
/// TTL-based retirement.
pub struct TaskManager {
    tasks: Arc<RwLock<IndexMap<String, TaskEntry>>>,
    active: AtomicUsize,
    config: TaskConfig,
    hooks: Arc<Hooks>,
    recover_panics: bool,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.tasks.read().len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl TaskManager {
    pub(crate) fn new(config: TaskConfig, hooks: Arc<Hooks>, recover_panics: bool) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(IndexMap::new())),
            active: AtomicUsize::new(0),
            config,
            hooks,
            recover_panics,
        }
    }

    /// Number of tasks in a non-terminal state.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Create a task for a tool invocation.
    ///
    /// Fails when the active-task ceiling is reached. The new task is
    /// inserted as `submitted`; the caller transitions it to `working`
    /// when the driver starts.
    pub fn create_task(&self, tool_name: &str, params: &TaskRequestParams) -> Result<Task> {
        let now = now_rfc3339();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::Submitted,
            status_message: None,
            created_at: now.clone(),
            last_updated_at: now,
            completed_at: None,
            ttl: params.ttl.or(Some(self.config.default_ttl_ms)),
            poll_interval: params.poll_interval.or(self.config.default_poll_interval_ms),
            _meta: None,
        };

        {
            let mut tasks = self.tasks.write();
            let limit = self.config.max_concurrent;
            if limit > 0 && self.active.load(Ordering::Acquire) >= limit {
                return Err(Error::MaxConcurrentTasks(limit));
            }
            tasks.insert(
                task.task_id.clone(),
                TaskEntry {
                    task: task.clone(),
                    tool_name: tool_name.to_string(),
                    cancel: CancellationToken::new(),
                    result: None,
                    error: None,
                },
            );
            self.active.fetch_add(1, Ordering::AcqRel);
        }

        self.hooks.run_task_created(self.recover_panics, &task);
        Ok(task)
    }

    /// The cancellation token stored for a task.
    pub fn cancellation_token(&self, id: &str) -> Result<CancellationToken> {
        self.tasks
            .read()
            .get(id)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Transition a task to a non-terminal status (`working` or
    /// `input_required`), bumping `lastUpdatedAt`.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<Task> {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            entry.task.status.validate_transition(id, &status)?;
            if status.is_terminal() {
                return Err(Error::internal(
                    "terminal transitions go through complete or cancel".to_string(),
                ));
            }
            entry.task.status = status;
            entry.task.status_message = message;
            entry.task.last_updated_at = now_rfc3339();
            entry.task.clone()
        };
        self.hooks
            .run_task_status_changed(self.recover_panics, &snapshot);
        Ok(snapshot)
    }

    /// Record a handler outcome, transitioning to `completed` or
    /// `failed`. Idempotent against tasks that already reached a
    /// terminal state (a cancelled task discards the late outcome).
    pub fn complete_task(&self, id: &str, outcome: Result<CallToolResult>) {
        let snapshot = {
            let mut tasks = self.tasks.write();
            let Some(entry) = tasks.get_mut(id) else {
                return;
            };
            if entry.task.status.is_terminal() {
                return;
            }
            let now = now_rfc3339();
            match outcome {
                Ok(result) => {
                    entry.task.status = TaskStatus::Completed;
                    entry.result = Some(result);
                },
                Err(e) => {
                    entry.task.status = TaskStatus::Failed;
                    entry.task.status_message = Some(e.to_string());
                    entry.error = Some(e.to_string());
                },
            }
            entry.task.last_updated_at = now.clone();
            // Exactly once: this is the only non-terminal -> terminal
            // path besides cancel, and both are gated on is_terminal.
            entry.task.completed_at = Some(now);
            self.active.fetch_sub(1, Ordering::AcqRel);
            entry.task.clone()
        };

        self.hooks
            .run_task_status_changed(self.recover_panics, &snapshot);
        match snapshot.status {
            TaskStatus::Completed => self.hooks.run_task_completed(self.recover_panics, &snapshot),
            TaskStatus::Failed => self.hooks.run_task_failed(self.recover_panics, &snapshot),
            _ => {},
        }
        self.schedule_expiry(&snapshot);
    }

    /// Cancel a task: invoke its stored cancellation token and mark it
    /// `cancelled`. A task already in a terminal state is a no-op that
    /// returns its current snapshot.
    pub fn cancel_task(&self, id: &str) -> Result<Task> {
        let (snapshot, was_active) = {
            let mut tasks = self.tasks.write();
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            if entry.task.status.is_terminal() {
                return Ok(entry.task.clone());
            }
            entry.cancel.cancel();
            let now = now_rfc3339();
            entry.task.status = TaskStatus::Cancelled;
            entry.task.last_updated_at = now.clone();
            entry.task.completed_at = Some(now);
            self.active.fetch_sub(1, Ordering::AcqRel);
            (entry.task.clone(), true)
        };

        if was_active {
            self.hooks
                .run_task_status_changed(self.recover_panics, &snapshot);
            self.hooks.run_task_cancelled(self.recover_panics, &snapshot);
            self.schedule_expiry(&snapshot);
        }
        Ok(snapshot)
    }

    /// Current snapshot of a task.
    pub fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// The tool this task is running.
    pub fn tool_name(&self, id: &str) -> Result<String> {
        self.tasks
            .read()
            .get(id)
            .map(|entry| entry.tool_name.clone())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// The stored result of a terminal task.
    ///
    /// Non-terminal tasks fail with a status-bearing invalid-params
    /// error; failed and cancelled tasks reproduce their failure.
    pub fn result(&self, id: &str) -> Result<CallToolResult> {
        let tasks = self.tasks.read();
        let entry = tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        match entry.task.status {
            TaskStatus::Completed => entry
                .result
                .clone()
                .ok_or_else(|| Error::internal(format!("completed task {id} has no result"))),
            TaskStatus::Failed => Err(Error::internal(
                entry
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("task {id} failed")),
            )),
            TaskStatus::Cancelled => Err(Error::Interrupted(format!("task {id} was cancelled"))),
            status => Err(Error::TaskNotReady {
                task_id: id.to_string(),
                status,
            }),
        }
    }

    /// Page over tasks in creation order.
    pub fn list(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(Vec<Task>, Option<String>)> {
        let ordered: Vec<(String, Task)> = self
            .tasks
            .read()
            .iter()
            .map(|(k, entry)| (k.clone(), entry.task.clone()))
            .collect();
        paginate(&ordered, cursor, limit)
    }

    /// Retire a terminal task after its TTL elapses.
    fn schedule_expiry(&self, task: &Task) {
        let Some(ttl) = task.ttl else { return };
        let table = Arc::downgrade(&self.tasks);
        let id = task.task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ttl)).await;
            if let Some(table) = table.upgrade() {
                let removed = table.write().shift_remove(&id).is_some();
                if removed {
                    tracing::debug!(target: "mcp.tasks", task = %id, "task expired");
                }
            }
        });
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TaskManager> {
        Arc::new(TaskManager::new(
            TaskConfig::default(),
            Arc::new(Hooks::new()),
            false,
        ))
    }

    fn manager_with(config: TaskConfig, hooks: Hooks) -> Arc<TaskManager> {
        Arc::new(TaskManager::new(config, Arc::new(hooks), false))
    }

    #[tokio::test]
    async fn create_then_complete() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(manager.active_count(), 1);

        manager
            .update_status(&task.task_id, TaskStatus::Working, None)
            .unwrap();
        manager.complete_task(&task.task_id, Ok(CallToolResult::text("done")));

        let finished = manager.get(&task.task_id).unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(manager.active_count(), 0);

        let result = manager.result(&task.task_id).unwrap();
        assert_eq!(result.content.len(), 1);
    }

    #[tokio::test]
    async fn result_before_terminal_state_is_rejected() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        manager
            .update_status(&task.task_id, TaskStatus::Working, None)
            .unwrap();

        let err = manager.result(&task.task_id).unwrap_err();
        assert!(matches!(
            err,
            Error::TaskNotReady {
                status: TaskStatus::Working,
                ..
            }
        ));
        assert!(err.to_string().contains("working"));
    }

    #[tokio::test]
    async fn concurrency_limit_applies() {
        let manager = manager_with(
            TaskConfig {
                max_concurrent: 2,
                ..Default::default()
            },
            Hooks::new(),
        );
        let params = TaskRequestParams::default();
        let a = manager.create_task("t", &params).unwrap();
        let _b = manager.create_task("t", &params).unwrap();

        let err = manager.create_task("t", &params).unwrap_err();
        assert_eq!(err.to_string(), "max concurrent tasks limit reached (2)");

        // Completing one frees a slot.
        manager.complete_task(&a.task_id, Ok(CallToolResult::text("ok")));
        assert!(manager.create_task("t", &params).is_ok());
    }

    #[tokio::test]
    async fn cancel_invokes_token_and_is_idempotent() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        let token = manager.cancellation_token(&task.task_id).unwrap();
        assert!(!token.is_cancelled());

        let cancelled = manager.cancel_task(&task.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(token.is_cancelled());
        assert_eq!(manager.active_count(), 0);

        // Second cancel is a no-op success.
        let again = manager.cancel_task(&task.task_id).unwrap();
        assert_eq!(again.status, TaskStatus::Cancelled);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_task_fails() {
        let manager = manager();
        let err = manager.cancel_task("missing").unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn late_outcome_after_cancel_is_discarded() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        manager.cancel_task(&task.task_id).unwrap();

        manager.complete_task(&task.task_id, Ok(CallToolResult::text("late")));
        let snapshot = manager.get(&task.task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert!(manager.result(&task.task_id).is_err());
    }

    #[tokio::test]
    async fn failed_outcome_records_message() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        manager.complete_task(&task.task_id, Err(Error::internal("disk on fire")));

        let snapshot = manager.get(&task.task_id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.status_message.as_deref(), Some("disk on fire"));

        let err = manager.result(&task.task_id).unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn lifecycle_hooks_fire_in_order() {
        use parking_lot::Mutex;
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        {
            let events = events.clone();
            hooks.add_on_task_created(move |task| {
                events.lock().push(format!("created:{}", task.status));
            });
        }
        {
            let events = events.clone();
            hooks.add_on_task_status_changed(move |task| {
                events.lock().push(format!("status:{}", task.status));
            });
        }
        {
            let events = events.clone();
            hooks.add_on_task_completed(move |task| {
                events.lock().push(format!("completed:{}", task.status));
            });
        }

        let manager = manager_with(TaskConfig::default(), hooks);
        let task = manager
            .create_task("t", &TaskRequestParams::default())
            .unwrap();
        manager
            .update_status(&task.task_id, TaskStatus::Working, None)
            .unwrap();
        manager.complete_task(&task.task_id, Ok(CallToolResult::text("ok")));

        assert_eq!(
            *events.lock(),
            vec![
                "created:submitted",
                "status:working",
                "status:completed",
                "completed:completed"
            ]
        );
    }

    #[tokio::test]
    async fn completed_at_is_set_exactly_once() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();
        assert!(task.completed_at.is_none());

        let working = manager
            .update_status(&task.task_id, TaskStatus::Working, None)
            .unwrap();
        assert!(
            working.completed_at.is_none(),
            "non-terminal transitions must not set completedAt"
        );

        manager.complete_task(&task.task_id, Ok(CallToolResult::text("done")));
        let finished = manager.get(&task.task_id).unwrap();
        let stamped = finished.completed_at.expect("terminal entry sets completedAt");

        // Idempotent re-completion and late cancellation leave it alone.
        manager.complete_task(&task.task_id, Ok(CallToolResult::text("again")));
        manager.cancel_task(&task.task_id).unwrap();
        let after = manager.get(&task.task_id).unwrap();
        assert_eq!(after.completed_at.as_deref(), Some(stamped.as_str()));
        assert_eq!(after.last_updated_at, finished.last_updated_at);
    }

    #[tokio::test]
    async fn cancel_sets_completed_at_once() {
        let manager = manager();
        let task = manager
            .create_task("slow", &TaskRequestParams::default())
            .unwrap();

        let cancelled = manager.cancel_task(&task.task_id).unwrap();
        let stamped = cancelled.completed_at.expect("cancel stamps completedAt");

        // A second cancel is a no-op and a late outcome is discarded.
        manager.cancel_task(&task.task_id).unwrap();
        manager.complete_task(&task.task_id, Ok(CallToolResult::text("late")));
        let after = manager.get(&task.task_id).unwrap();
        assert_eq!(after.completed_at.as_deref(), Some(stamped.as_str()));
    }

    #[tokio::test]
    async fn ttl_retires_terminal_tasks() {
        let manager = manager();
        let task = manager
            .create_task(
                "t",
                &TaskRequestParams {
                    ttl: Some(20),
                    poll_interval: None,
                },
            )
            .unwrap();
        manager.complete_task(&task.task_id, Ok(CallToolResult::text("ok")));
        assert!(manager.get(&task.task_id).is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(matches!(
            manager.get(&task.task_id),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_pages_in_creation_order() {
        let manager = manager();
        let params = TaskRequestParams::default();
        let ids: Vec<String> = (0..3)
            .map(|_| manager.create_task("t", &params).unwrap().task_id)
            .collect();

        let (page, next) = manager.list(None, Some(2)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].task_id, ids[0]);
        assert_eq!(page[1].task_id, ids[1]);

        let (rest, end) = manager.list(next.as_deref(), Some(2)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].task_id, ids[2]);
        assert!(end.is_none());
    }
}
