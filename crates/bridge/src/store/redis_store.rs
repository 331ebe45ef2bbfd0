use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands as _;
use redis::aio::ConnectionManager;
use std::time::Duration;
use uuid::Uuid;

use super::{
    MAX_TTL, RevokedCredential, Session, Store, Task, TaskStatus, TaskTransition,
    TransitionOutcome,
};

/// Optimistic concurrency retries for a task transition before giving up.
const TRANSITION_ATTEMPTS: usize = 8;

/// Replace the record only if its version is unchanged.
/// Returns 1 when applied, 0 on version mismatch, -1 when the key is gone.
const CAS_TASK_SCRIPT: &str = r"
local v = redis.call('HGET', KEYS[1], 'version')
if not v then return -1 end
if v ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', ARGV[3])
return 1
";

/// Create a task record unless the key already exists.
/// Returns 1 when created, 0 when a live record is already there.
const CREATE_TASK_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
";

/// Rewrite a session body without resurrecting an expired key.
const TOUCH_SESSION_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'data', ARGV[1])
  return 1
end
return 0
";

/// Redis-backed store shared between bridge replicas.
///
/// Layout: `task:{id}` and `session:{id}` are hashes with a JSON `data` field (tasks also carry
/// `version`); `revoked:{jti}` is a plain marker key. Every key has a TTL.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    create_task: redis::Script,
    cas_task: redis::Script,
    touch_session: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse Redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connect to Redis")?;
        Ok(Self {
            conn,
            create_task: redis::Script::new(CREATE_TASK_SCRIPT),
            cas_task: redis::Script::new(CAS_TASK_SCRIPT),
            touch_session: redis::Script::new(TOUCH_SESSION_SCRIPT),
        })
    }

    fn task_key(id: Uuid) -> String {
        format!("task:{id}")
    }

    fn session_key(id: &str) -> String {
        format!("session:{id}")
    }

    fn revoked_key(credential_id: &str) -> String {
        format!("revoked:{credential_id}")
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(i64::MAX)
        .max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn create_task(&self, task: &Task, ttl: Duration) -> anyhow::Result<()> {
        let key = Self::task_key(task.task_id);
        let data = serde_json::to_string(task).context("encode task")?;
        let mut conn = self.conn.clone();

        let created: i64 = self
            .create_task
            .key(&key)
            .arg(data)
            .arg(task.version)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("create task {}", task.task_id))?;
        anyhow::ensure!(created == 1, "task {} already exists", task.task_id);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> anyhow::Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .hget(Self::task_key(task_id), "data")
            .await
            .with_context(|| format!("read task {task_id}"))?;
        data.map(|s| serde_json::from_str(&s).context("decode task"))
            .transpose()
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        transition: TaskTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        let key = Self::task_key(task_id);
        for _ in 0..TRANSITION_ATTEMPTS {
            let Some(current) = self.get_task(task_id).await? else {
                return Ok(TransitionOutcome::Missing);
            };
            let next = match current.apply(expected, &transition) {
                Ok(next) => next,
                Err(current) => return Ok(TransitionOutcome::Rejected { current }),
            };
            let data = serde_json::to_string(&next).context("encode task")?;

            let mut conn = self.conn.clone();
            let applied: i64 = self
                .cas_task
                .key(&key)
                .arg(current.version)
                .arg(data)
                .arg(next.version)
                .invoke_async(&mut conn)
                .await
                .with_context(|| format!("update task {task_id}"))?;
            match applied {
                1 => return Ok(TransitionOutcome::Applied(next)),
                -1 => return Ok(TransitionOutcome::Missing),
                _ => tracing::debug!(%task_id, "task changed concurrently, retrying transition"),
            }
        }
        anyhow::bail!("task {task_id}: transition lost {TRANSITION_ATTEMPTS} races in a row")
    }

    async fn create_session(&self, session: &Session, ttl: Duration) -> anyhow::Result<()> {
        let key = Self::session_key(&session.session_id);
        let data = serde_json::to_string(session).context("encode session")?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "data", data)
            .pexpire(&key, ttl_millis(ttl));
        pipe.query_async::<()>(&mut conn)
            .await
            .context("create session")?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let key = Self::session_key(session_id);
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(&key, "data").await.context("read session")?;
        let Some(data) = data else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_str(&data).context("decode session")?;
        session.last_accessed = Utc::now();

        let body = serde_json::to_string(&session).context("encode session")?;
        let touched: i64 = self
            .touch_session
            .key(&key)
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .context("touch session")?;
        Ok((touched == 1).then_some(session))
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(Self::session_key(session_id))
            .await
            .context("delete session")?;
        Ok(())
    }

    async fn revoke_credential(&self, marker: &RevokedCredential) -> anyhow::Result<()> {
        let ttl = marker.ttl();
        if ttl.is_zero() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(Self::revoked_key(&marker.credential_id))
            .arg(marker.revoked_until.to_rfc3339())
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .context("store revocation marker")?;
        Ok(())
    }

    async fn is_credential_revoked(&self, credential_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(Self::revoked_key(credential_id))
            .await
            .context("read revocation marker")
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("ping Redis")?;
        Ok(())
    }
}
