use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    MAX_TTL, RevokedCredential, Session, Store, Task, TaskStatus, TaskTransition, TransitionOutcome,
};

fn deadline(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: deadline(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Expiring<Task>>,
    sessions: HashMap<String, Expiring<Session>>,
    revoked: HashMap<String, Instant>,
}

/// In-process store. Expired entries are invisible to reads and removed by [`sweep`].
///
/// [`sweep`]: MemoryStore::sweep
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.tasks.len() + inner.sessions.len() + inner.revoked.len();
        inner.tasks.retain(|_, e| e.is_live(now));
        inner.sessions.retain(|_, e| e.is_live(now));
        inner.revoked.retain(|_, until| now < *until);
        before - (inner.tasks.len() + inner.sessions.len() + inner.revoked.len())
    }
}

/// Periodically purge expired records until `shutdown` fires.
pub fn spawn_sweeper(store: Arc<MemoryStore>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let removed = store.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "memory store sweep removed expired records");
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(&self, task: &Task, ttl: Duration) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            !inner
                .tasks
                .get(&task.task_id)
                .is_some_and(|e| e.is_live(Instant::now())),
            "task {} already exists",
            task.task_id
        );
        inner
            .tasks
            .insert(task.task_id, Expiring::new(task.clone(), ttl));
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<Task>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner
            .tasks
            .get(&task_id)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        transition: TaskTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.tasks.get_mut(&task_id).filter(|e| e.is_live(now)) else {
            return Ok(TransitionOutcome::Missing);
        };
        match entry.value.apply(expected, &transition) {
            Ok(next) => {
                entry.value = next.clone();
                Ok(TransitionOutcome::Applied(next))
            }
            Err(current) => Ok(TransitionOutcome::Rejected { current }),
        }
    }

    async fn create_session(&self, session: &Session, ttl: Duration) -> anyhow::Result<()> {
        self.inner
            .lock()
            .sessions
            .insert(session.session_id.clone(), Expiring::new(session.clone(), ttl));
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.sessions.get_mut(session_id).filter(|e| e.is_live(now)) else {
            return Ok(None);
        };
        entry.value.last_accessed = Utc::now();
        Ok(Some(entry.value.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.inner.lock().sessions.remove(session_id);
        Ok(())
    }

    async fn revoke_credential(&self, marker: &RevokedCredential) -> anyhow::Result<()> {
        let ttl = marker.ttl();
        if ttl.is_zero() {
            return Ok(());
        }
        self.inner
            .lock()
            .revoked
            .insert(marker.credential_id.clone(), deadline(ttl));
        Ok(())
    }

    async fn is_credential_revoked(&self, credential_id: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .revoked
            .get(credential_id)
            .is_some_and(|until| now < *until))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
