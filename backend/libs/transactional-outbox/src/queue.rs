//! Task queue boundary used by the outbox worker.
//!
//! The broker is Redis. A task lands on `{namespace}:queue:{queue}` as a JSON
//! envelope and its id is claimed under `{namespace}:task:{id}` with `SET NX`,
//! so enqueueing the same id twice is rejected with
//! [`OutboxError::TaskIdConflict`] instead of producing a second task.
//!
//! Claim and push run as one server-side script. A push that fails leaves no
//! claim behind, and a claim never exists without its envelope on the list.

use crate::error::{OutboxError, OutboxResult};
use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// KEYS: task claim, queue list. ARGV: queue name, claim TTL secs, envelope.
/// Returns 1 when pushed, 0 when the id is already claimed.
static ENQUEUE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    return 0
end
local pushed = redis.pcall('LPUSH', KEYS[2], ARGV[3])
if type(pushed) == 'table' and pushed.err then
    redis.call('DEL', KEYS[1])
    return redis.error_reply(pushed.err)
end
return 1
"#,
    )
});

const ENQUEUED: i64 = 1;
const ALREADY_CLAIMED: i64 = 0;

/// A unit of background work: type name plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Deduplication key; a random id is used when absent
    pub task_id: Option<String>,
    /// Retries the consumer may spend on the task
    pub max_retry: u32,
    /// Target queue; the broker default when absent
    pub queue: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            max_retry: 5,
            queue: None,
        }
    }
}

/// Where an accepted task ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand a task to the broker.
    ///
    /// # Errors
    ///
    /// * [`OutboxError::TaskIdConflict`] when `options.task_id` is already taken
    /// * [`OutboxError::EnqueueFailed`] on broker failure
    async fn enqueue(&self, task: Task, options: TaskOptions) -> OutboxResult<TaskInfo>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a serde_json::Value,
    queue: &'a str,
    max_retry: u32,
    retried: u32,
    enqueued_at: i64,
}

/// Redis-backed [`TaskQueue`].
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    namespace: String,
    default_queue: String,
    dedup_ttl: Duration,
}

impl RedisTaskQueue {
    pub fn new(
        conn: ConnectionManager,
        namespace: impl Into<String>,
        default_queue: impl Into<String>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            default_queue: default_queue.into(),
            dedup_ttl,
        }
    }

    /// Open a managed connection to `redis_url`.
    pub async fn connect(
        redis_url: &str,
        namespace: impl Into<String>,
        default_queue: impl Into<String>,
        dedup_ttl: Duration,
    ) -> OutboxResult<Self> {
        let client = Client::open(redis_url).context("failed to construct Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;
        Ok(Self::new(conn, namespace, default_queue, dedup_ttl))
    }

    pub(crate) fn queue_key(namespace: &str, queue: &str) -> String {
        format!("{}:queue:{}", namespace, queue)
    }

    pub(crate) fn task_key(namespace: &str, task_id: &str) -> String {
        format!("{}:task:{}", namespace, task_id)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: Task, options: TaskOptions) -> OutboxResult<TaskInfo> {
        let queue = options
            .queue
            .unwrap_or_else(|| self.default_queue.clone());
        let task_id = options
            .task_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let envelope = serde_json::to_string(&Envelope {
            id: &task_id,
            kind: &task.name,
            payload: &task.payload,
            queue: &queue,
            max_retry: options.max_retry,
            retried: 0,
            enqueued_at: crate::now_millis(),
        })?;

        let mut conn = self.conn.clone();
        let reply: i64 = ENQUEUE_SCRIPT
            .key(Self::task_key(&self.namespace, &task_id))
            .key(Self::queue_key(&self.namespace, &queue))
            .arg(&queue)
            .arg(self.dedup_ttl.as_secs().max(1))
            .arg(envelope)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| OutboxError::EnqueueFailed(e.to_string()))?;

        enqueue_reply(reply, &task_id)?;

        debug!(task_id = %task_id, task = %task.name, queue = %queue, "Task enqueued");

        Ok(TaskInfo { id: task_id, queue })
    }
}

fn enqueue_reply(reply: i64, task_id: &str) -> OutboxResult<()> {
    match reply {
        ENQUEUED => Ok(()),
        ALREADY_CLAIMED => {
            debug!(task_id = %task_id, "Task id already claimed");
            Err(OutboxError::TaskIdConflict(task_id.to_string()))
        }
        other => Err(OutboxError::EnqueueFailed(format!(
            "unexpected enqueue reply {}",
            other
        ))),
    }
}
