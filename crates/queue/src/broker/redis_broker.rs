//! Redis-backed broker.
//!
//! Layout, per task and per queue:
//! - `pingme:task:{id}`: hash with kind, payload, queue, max_retry, retried,
//!   timeout_ms, enqueued_at and last_error
//! - `pingme:queue:{name}:pending`: ids waiting to run (LPUSH in, RIGHT out)
//! - `pingme:queue:{name}:active`: ids currently held by a consumer
//! - `pingme:queue:{name}:lease`: sorted set of active ids scored by lease
//!   deadline (unix millis)
//! - `pingme:queue:{name}:dead`: ids whose retry budget ran out
//!
//! Every state change that touches more than one key runs as a Lua script,
//! so two consumers never receive the same delivery and a lapsed lease is
//! settled exactly once.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::{NewTask, Task, TaskInfo};

use super::{Broker, Disposition, LEASE_EXPIRED};

const KEY_PREFIX: &str = "pingme";

/// KEYS: pending, active, lease. ARGV: now_ms, task key prefix.
const DEQUEUE_LUA: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then return false end
redis.call('LPUSH', KEYS[2], id)
local timeout = tonumber(redis.call('HGET', ARGV[2] .. id, 'timeout_ms') or '0') or 0
redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + timeout, id)
return id
"#;

/// KEYS: lease, active, pending, dead, task. ARGV: id, reason.
/// Returns 0 when the lease was already gone, 1 on retry, 2 when buried.
const FAIL_LUA: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('LREM', KEYS[2], 1, ARGV[1])
redis.call('HSET', KEYS[5], 'last_error', ARGV[2])
local retried = tonumber(redis.call('HGET', KEYS[5], 'retried') or '0') or 0
local max_retry = tonumber(redis.call('HGET', KEYS[5], 'max_retry') or '0') or 0
if retried < max_retry then
  redis.call('HINCRBY', KEYS[5], 'retried', 1)
  redis.call('LPUSH', KEYS[3], ARGV[1])
  return 1
end
redis.call('LPUSH', KEYS[4], ARGV[1])
return 2
"#;

/// KEYS: lease, active, pending, dead. ARGV: now_ms, task key prefix, reason.
/// Returns the number of reclaimed ids.
const RECLAIM_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LREM', KEYS[2], 1, id)
  local key = ARGV[2] .. id
  redis.call('HSET', key, 'last_error', ARGV[3])
  local retried = tonumber(redis.call('HGET', key, 'retried') or '0') or 0
  local max_retry = tonumber(redis.call('HGET', key, 'max_retry') or '0') or 0
  if retried < max_retry then
    redis.call('HINCRBY', key, 'retried', 1)
    redis.call('LPUSH', KEYS[3], id)
  else
    redis.call('LPUSH', KEYS[4], id)
  end
end
return #ids
"#;

/// Broker storing tasks in Redis lists, sorted sets and hashes.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    dequeue_script: Script,
    fail_script: Script,
    reclaim_script: Script,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            dequeue_script: Script::new(DEQUEUE_LUA),
            fail_script: Script::new(FAIL_LUA),
            reclaim_script: Script::new(RECLAIM_LUA),
        }
    }

    fn task_prefix() -> String {
        format!("{}:task:", KEY_PREFIX)
    }

    fn task_key(id: &str) -> String {
        format!("{}{}", Self::task_prefix(), id)
    }

    fn queue_key(queue: &str, state: &str) -> String {
        format!("{}:queue:{}:{}", KEY_PREFIX, queue, state)
    }

    fn parse_task(id: String, fields: HashMap<String, Vec<u8>>) -> Result<Task, QueueError> {
        let malformed = |reason: String| QueueError::MalformedTask {
            id: id.clone(),
            reason,
        };

        let text = |name: &str| -> Result<String, QueueError> {
            let raw = fields
                .get(name)
                .ok_or_else(|| malformed(format!("missing field '{}'", name)))?;
            String::from_utf8(raw.clone())
                .map_err(|_| malformed(format!("field '{}' is not UTF-8", name)))
        };

        let number = |name: &str| -> Result<u64, QueueError> {
            text(name)?
                .parse()
                .map_err(|_| malformed(format!("field '{}' is not a number", name)))
        };

        let enqueued_at = DateTime::parse_from_rfc3339(&text("enqueued_at")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| malformed(format!("bad enqueued_at: {}", e)))?;

        Ok(Task {
            kind: text("kind")?,
            payload: fields.get("payload").cloned().unwrap_or_default(),
            queue: text("queue")?,
            max_retry: number("max_retry")? as u32,
            retried: number("retried")? as u32,
            timeout: Duration::from_millis(number("timeout_ms")?),
            enqueued_at,
            id,
        })
    }

    /// Park an id whose hash cannot be turned into a task.
    async fn bury_malformed(&self, queue: &str, id: &str, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .lrem(Self::queue_key(queue, "active"), 1, id)
            .ignore()
            .zrem(Self::queue_key(queue, "lease"), id)
            .ignore()
            .hset(Self::task_key(id), "last_error", reason)
            .ignore()
            .lpush(Self::queue_key(queue, "dead"), id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task: NewTask) -> Result<TaskInfo, QueueError> {
        let mut conn = self.conn.clone();
        let id = Uuid::new_v4().to_string();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(Self::task_key(&id))
            .arg("kind")
            .arg(&task.kind)
            .arg("payload")
            .arg(&task.payload)
            .arg("queue")
            .arg(&task.queue)
            .arg("max_retry")
            .arg(task.max_retry)
            .arg("retried")
            .arg(0u32)
            .arg("timeout_ms")
            .arg(task.timeout.as_millis() as u64)
            .arg("enqueued_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .lpush(Self::queue_key(&task.queue, "pending"), &id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(task_id = %id, queue = %task.queue, kind = %task.kind, "Task enqueued");

        Ok(TaskInfo {
            id,
            queue: task.queue,
        })
    }

    async fn dequeue(&self, queues: &[&str]) -> Result<Option<Task>, QueueError> {
        self.requeue_expired(queues).await?;

        let mut conn = self.conn.clone();

        for queue in queues {
            let id: Option<String> = self
                .dequeue_script
                .key(Self::queue_key(queue, "pending"))
                .key(Self::queue_key(queue, "active"))
                .key(Self::queue_key(queue, "lease"))
                .arg(Utc::now().timestamp_millis())
                .arg(Self::task_prefix())
                .invoke_async(&mut conn)
                .await?;

            let Some(id) = id else { continue };

            let fields: HashMap<String, Vec<u8>> = conn.hgetall(Self::task_key(&id)).await?;
            if fields.is_empty() {
                // Hash removed out of band; nothing left to run.
                tracing::warn!(task_id = %id, queue, "Dropping task id without task data");
                let _: () = redis::pipe()
                    .atomic()
                    .lrem(Self::queue_key(queue, "active"), 1, &id)
                    .ignore()
                    .zrem(Self::queue_key(queue, "lease"), &id)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                continue;
            }

            match Self::parse_task(id.clone(), fields) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => {
                    tracing::error!(task_id = %id, queue, error = %e, "Burying malformed task");
                    self.bury_malformed(queue, &id, &e.to_string()).await?;
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        // Also drops any copy a lapsed lease already put back.
        let _: () = redis::pipe()
            .atomic()
            .lrem(Self::queue_key(&task.queue, "active"), 1, &task.id)
            .ignore()
            .lrem(Self::queue_key(&task.queue, "pending"), 0, &task.id)
            .ignore()
            .lrem(Self::queue_key(&task.queue, "dead"), 0, &task.id)
            .ignore()
            .zrem(Self::queue_key(&task.queue, "lease"), &task.id)
            .ignore()
            .del(Self::task_key(&task.id))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn fail(&self, task: &Task, reason: &str) -> Result<Disposition, QueueError> {
        let mut conn = self.conn.clone();

        let outcome: i64 = self
            .fail_script
            .key(Self::queue_key(&task.queue, "lease"))
            .key(Self::queue_key(&task.queue, "active"))
            .key(Self::queue_key(&task.queue, "pending"))
            .key(Self::queue_key(&task.queue, "dead"))
            .key(Self::task_key(&task.id))
            .arg(&task.id)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => Disposition::Retry,
            2 => Disposition::Dead,
            _ => Disposition::Expired,
        })
    }

    async fn requeue_expired(&self, queues: &[&str]) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let mut reclaimed = 0;

        for queue in queues {
            let count: usize = self
                .reclaim_script
                .key(Self::queue_key(queue, "lease"))
                .key(Self::queue_key(queue, "active"))
                .key(Self::queue_key(queue, "pending"))
                .key(Self::queue_key(queue, "dead"))
                .arg(now_ms)
                .arg(Self::task_prefix())
                .arg(LEASE_EXPIRED)
                .invoke_async(&mut conn)
                .await?;

            if count > 0 {
                tracing::warn!(queue, count, "Reclaimed tasks with expired leases");
            }
            reclaimed += count;
        }

        Ok(reclaimed)
    }
}
