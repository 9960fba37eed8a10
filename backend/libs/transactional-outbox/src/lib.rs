//! # Transactional Outbox
//!
//! Durable record of facts that must trigger an asynchronous effect, plus the
//! worker that hands them to an external task queue.
//!
//! ## Guarantees
//!
//! 1. The event row is written in the same transaction as the domain change it
//!    describes, so either both exist or neither does.
//! 2. The worker enqueues a task only after that transaction committed; no
//!    database transaction is held open across a broker call.
//! 3. Each event carries its own id as the task id. The queue refuses a second
//!    task with the same id, so a row that is re-polled before its status
//!    update lands produces one external side effect, not two.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──enqueue ok──────────────▶ success
//!    │
//!    ├──bad payload─────────────────▶ failed
//!    └──enqueue error × max_attempts─▶ failed
//! ```
//!
//! Every status update is guarded by `status = 'pending'`; terminal rows are
//! never touched again and rows are never deleted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use db_pool::{PgTransactionManager, TransactionCoordinator};
//! use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), transactional_outbox::OutboxError> {
//! let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
//! let coordinator = TransactionCoordinator::new(PgTransactionManager::new(pool));
//!
//! let event = OutboxEvent::new("login", &serde_json::json!({ "userID": "42" }))?;
//! coordinator
//!     .with_transaction(move |mut scope| {
//!         Box::pin(async move {
//!             // ... domain writes with scope.reborrow() ...
//!             outbox.insert(scope.reborrow(), &event).await
//!         })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use async_trait::async_trait;
use db_pool::{PgTx, Scope};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
pub mod metrics;
pub mod processor;
pub mod queue;

pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;
pub use processor::{
    BatchReport, EventOutcome, OutboxProcessor, OutboxProcessorConfig, OutboxWorkerHandle,
    TaskBuilder,
};
pub use queue::{RedisTaskQueue, Task, TaskInfo, TaskOptions, TaskQueue};

/// Current time as epoch milliseconds, the unit of every outbox timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delivery state of an outbox event. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Success,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Success => "success",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "success" => Ok(OutboxStatus::Success),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::UnknownStatus(other.to_string())),
        }
    }
}

/// A row of the `outbox_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier; doubles as the task id on enqueue
    pub id: Uuid,

    /// Event name from the closed taxonomy (e.g. "login")
    pub event_name: String,

    /// Serialized parameters of the effect
    pub payload: serde_json::Value,

    pub status: OutboxStatus,

    /// Failed enqueue attempts so far
    pub attempts: i32,

    /// Last enqueue error, for operators
    pub last_error: Option<String>,

    /// Epoch milliseconds
    pub created_at: i64,

    /// Epoch milliseconds
    pub updated_at: i64,
}

impl OutboxEvent {
    /// New pending event with a serialized payload.
    pub fn new<P: Serialize + ?Sized>(
        event_name: impl Into<String>,
        payload: &P,
    ) -> OutboxResult<Self> {
        let now = now_millis();
        Ok(Self {
            id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload: serde_json::to_value(payload)?,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Storage of outbox events.
///
/// `insert` is the writer side and runs inside the caller's unit of work; the
/// remaining methods belong to the worker and run on the shared pool.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Transaction handle accepted by [`OutboxRepository::insert`].
    type Tx: Send;

    /// Append an event. Pass the scope of the transaction that performs the
    /// domain change so both commit together.
    async fn insert(&self, scope: Scope<'_, Self::Tx>, event: &OutboxEvent) -> OutboxResult<()>;

    /// Pending events of one name, oldest first.
    async fn find_pending(&self, event_name: &str, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// `pending → success`. Returns false when the row was no longer pending.
    async fn mark_success(&self, event_id: Uuid) -> OutboxResult<bool>;

    /// `pending → failed`. Returns false when the row was no longer pending.
    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<bool>;

    /// Count one failed attempt and store the error. The row becomes `failed`
    /// once `attempts` reaches `max_attempts`; the resulting status is returned.
    async fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus>;

    /// Pending count and oldest pending age in seconds (0 when none pending)
    /// for events of one name.
    async fn pending_stats(&self, event_name: &str) -> OutboxResult<(i64, i64)>;
}

/// PostgreSQL implementation of [`OutboxRepository`].
#[derive(Clone)]
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a single event regardless of status.
    pub async fn find_by_id(&self, event_id: Uuid) -> OutboxResult<OutboxEvent> {
        let row = sqlx::query(
            r#"
            SELECT id, event_name, payload, status, attempts, last_error, created_at, updated_at
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch outbox event")?;

        match row {
            Some(row) => event_from_row(&row),
            None => Err(OutboxError::EventNotFound(event_id)),
        }
    }
}

fn event_from_row(row: &PgRow) -> OutboxResult<OutboxEvent> {
    let status: String = row.try_get("status")?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_name: row.try_get("event_name")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    type Tx = PgTx;

    async fn insert(&self, scope: Scope<'_, PgTx>, event: &OutboxEvent) -> OutboxResult<()> {
        let mut conn = db_pool::connection(&self.pool, scope).await?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, event_name, payload, status, attempts, last_error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(&event.event_name)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut *conn)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_name = %event.event_name,
            "Event inserted into outbox"
        );

        Ok(())
    }

    async fn find_pending(&self, event_name: &str, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_name, payload, status, attempts, last_error, created_at, updated_at
            FROM outbox_events
            WHERE event_name = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(event_name)
        .bind(OutboxStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending events")?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<OutboxResult<Vec<_>>>()?;

        debug!(count = events.len(), event_name, "Fetched pending events");

        Ok(events)
    }

    async fn mark_success(&self, event_id: Uuid) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'success', last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to mark event as success")?;

        let updated = result.rows_affected() > 0;
        if !updated {
            debug!(event_id = %event_id, "Event was not pending when marking success");
        }
        Ok(updated)
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed', last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        let updated = result.rows_affected() > 0;
        if updated {
            warn!(event_id = %event_id, error = %error, "Event marked as failed");
        }
        Ok(updated)
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'pending' END,
                updated_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(max_attempts)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record delivery failure")?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                status.parse()
            }
            None => {
                warn!(event_id = %event_id, "Event not pending when recording failure");
                Err(OutboxError::EventNotFound(event_id))
            }
        }
    }

    async fn pending_stats(&self, event_name: &str) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS pending, MIN(created_at) AS oldest
            FROM outbox_events
            WHERE event_name = $1 AND status = $2
            "#,
        )
        .bind(event_name)
        .bind(OutboxStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending")?;
        let oldest: Option<i64> = rec.try_get("oldest")?;
        let age = oldest
            .map(|created_at| (now_millis() - created_at).max(0) / 1000)
            .unwrap_or(0);
        Ok((pending, age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_text() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Success,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!(matches!(
            "retrying".parse::<OutboxStatus>(),
            Err(OutboxError::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_only_pending_is_not_terminal() {
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(OutboxStatus::Success.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_event_is_pending_with_serialized_payload() {
        #[derive(Serialize)]
        struct Params<'a> {
            #[serde(rename = "userID")]
            user_id: &'a str,
        }

        let event = OutboxEvent::new("login", &Params { user_id: "42" }).unwrap();

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.created_at, event.updated_at);
        assert_eq!(event.payload, serde_json::json!({ "userID": "42" }));
        assert!(!event.id.is_nil());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(OutboxError::InvalidPayload("missing userID".into()).is_fatal());
        assert!(!OutboxError::EnqueueFailed("broker down".into()).is_fatal());
        assert!(!OutboxError::TaskIdConflict("id".into()).is_fatal());
    }
}
