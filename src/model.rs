use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Tag used for keyword-variant generation tasks.
pub const KIND_KEYWORD_VARIANTS: &str = "keyword_variants";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    /// Staying in the same non-terminal status is allowed; terminal states are final.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("invalid task status: {}", s)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of background work tracked by identifier and status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub kind: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub result: Option<Map<String, Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: owner.into(),
            kind: kind.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
            result: None,
            error: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status snapshot. Returns `false` (and leaves the task untouched)
    /// when the snapshot would move the status backwards or out of a terminal state.
    pub fn apply(&mut self, snapshot: &TaskSnapshot) -> bool {
        if !self.status.can_transition_to(snapshot.status) {
            return false;
        }
        self.status = snapshot.status;
        self.result = snapshot.result.clone();
        self.error = snapshot.error.clone();
        self.updated_at = snapshot.updated_at.unwrap_or_else(Utc::now);
        true
    }
}

/// Status endpoint payload: `{status, result?, error?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            updated_at: None,
        }
    }

    pub fn completed(result: Map<String, Value>) -> Self {
        Self {
            result: Some(result),
            ..Self::status(TaskStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(TaskStatus::Failed)
        }
    }
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            updated_at: Some(task.updated_at),
        }
    }
}

/// Creation request body for `POST /tasks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub kind: String,
    pub owner: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Creation response: `{id, status}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedTask {
    pub id: String,
    pub status: TaskStatus,
}
