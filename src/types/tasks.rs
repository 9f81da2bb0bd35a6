//! Wire types and state machine for asynchronous tasks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Task lifecycle status.
///
/// Transitions are monotonic toward a terminal state, except for the
/// `Working` / `InputRequired` pair which may alternate:
///
/// ```text
/// submitted -> working <-> input_required
///                 |               |
///                 +--> completed / failed / cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted but not yet running.
    Submitted,
    /// Actively being processed.
    Working,
    /// Blocked on input from the client.
    InputRequired,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
    /// Cancelled before completion (terminal).
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Working => write!(f, "working"),
            Self::InputRequired => write!(f, "input_required"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// True for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from this status to `next` is a legal transition.
    /// Self-transitions are rejected; terminal states reject everything.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Submitted => !matches!(next, Self::Submitted),
            Self::Working => matches!(
                next,
                Self::InputRequired | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::InputRequired => matches!(
                next,
                Self::Working | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Validate a transition, producing a descriptive error on rejection.
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// The wire representation of a task.
///
/// `ttl` is required but nullable: `None` serializes as `null`
/// (unlimited), never omitted. `pollInterval` and `statusMessage` are
/// omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Server-wide unique id.
    pub task_id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Optional human-readable status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 timestamp of the last transition or progress report.
    pub last_updated_at: String,
    /// ISO 8601 timestamp set exactly once, on entering a terminal
    /// state. Absent while the task is live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Retention in milliseconds after reaching a terminal state.
    pub ttl: Option<u64>,
    /// Suggested polling interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
    /// Optional metadata.
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    #[allow(clippy::pub_underscore_fields)]
    pub _meta: Option<Map<String, Value>>,
}

/// Result of a task-augmented `tools/call`: the task wrapped in a `task`
/// field at the top level of the JSON-RPC `result`, never under `_meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResult {
    /// The created task.
    pub task: Task,
}

/// `tasks/get` result: the task fields flat at the result level.
pub type GetTaskResult = Task;

/// `tasks/cancel` result: the task fields flat at the result level.
pub type CancelTaskResult = Task;

/// The `task` member of a `tools/call` request that opts into
/// task-augmented execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequestParams {
    /// Requested retention in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Requested polling interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}
