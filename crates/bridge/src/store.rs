//! Persistence for task records, sessions and revoked-credential markers.
//!
//! Two backends implement [`Store`]: an in-process map (single replica, tests) and Redis (shared
//! between replicas). Every record carries a TTL; an expired record reads exactly like a missing
//! one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Longest lifetime a record can get; larger TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Reserved. Nothing transitions into it.
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed forward edges of the task state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one background tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub server_name: String,
    pub tool_name: String,
    pub method: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    /// Incremented on every applied transition.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    #[must_use]
    pub fn pending(server_name: &str, tool_name: &str, user_id: &str) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            method: "tools/call".to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            result: None,
            error: None,
            progress: None,
            version: 0,
        }
    }

    /// Compute the record after `transition`, if it is allowed from `expected`.
    pub fn apply(&self, expected: TaskStatus, transition: &TaskTransition) -> Result<Self, TaskStatus> {
        let target = transition.target();
        if self.status != expected || !self.status.can_transition_to(target) {
            return Err(self.status);
        }
        let mut next = self.clone();
        next.status = target;
        next.updated_at = Some(Utc::now());
        next.version = self.version.saturating_add(1);
        match transition {
            TaskTransition::Start => next.progress = Some(0.0),
            TaskTransition::Complete { result } => {
                next.result = Some(result.clone());
                next.progress = Some(1.0);
            }
            TaskTransition::Fail { error } => next.error = Some(error.clone()),
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Start,
    Complete { result: Value },
    Fail { error: String },
}

impl TaskTransition {
    #[must_use]
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Start => TaskStatus::Running,
            Self::Complete { .. } => TaskStatus::Completed,
            Self::Fail { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Task),
    /// The stored status was not the expected one, or the edge is not allowed.
    Rejected { current: TaskStatus },
    /// Unknown or expired.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedCredential {
    pub credential_id: String,
    pub revoked_until: DateTime<Utc>,
}

impl RevokedCredential {
    /// Remaining lifetime of the marker; zero once `revoked_until` has passed.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        (self.revoked_until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, task: &Task, ttl: Duration) -> anyhow::Result<()>;
    async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<Task>>;
    /// Compare-and-set a status transition. Never regresses a record.
    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        transition: TaskTransition,
    ) -> anyhow::Result<TransitionOutcome>;

    async fn create_session(&self, session: &Session, ttl: Duration) -> anyhow::Result<()>;
    /// Returns the session with `last_accessed` refreshed.
    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>>;
    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()>;

    async fn revoke_credential(&self, marker: &RevokedCredential) -> anyhow::Result<()>;
    async fn is_credential_revoked(&self, credential_id: &str) -> anyhow::Result<bool>;

    async fn ping(&self) -> anyhow::Result<()>;
}
