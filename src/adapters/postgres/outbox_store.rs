//! PostgreSQL implementation of the outbox ports.
//!
//! `create` runs on the caller's connection so the event commits or rolls
//! back with the business write. Relay-side transitions each run in their own
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::foundation::{DomainError, ErrorCode, OutboxEventId, Timestamp};
use crate::domain::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::ports::{OutboxStore, OutboxTransaction};

/// PostgreSQL-backed outbox table.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a pending event using the caller's transaction.
    ///
    /// Any error must abort the caller's transaction.
    pub async fn create(
        conn: &mut PgConnection,
        new: &NewOutboxEvent,
    ) -> Result<OutboxEvent, DomainError> {
        let row: OutboxRow = sqlx::query_as(
            r#"
            INSERT INTO outbox (aggregate_type, aggregate_id, event_type, payload, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING id, aggregate_type, aggregate_id, event_type, payload, status,
                      attempts, last_error, created_at, processed_at
            "#,
        )
        .bind(&new.aggregate_type)
        .bind(new.aggregate_id)
        .bind(&new.event_type)
        .bind(&new.payload)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| DomainError::database("Failed to insert outbox event", e))?;

        row.try_into()
    }
}

/// Database row representation of an outbox event.
#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    aggregate_type: String,
    aggregate_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status: OutboxStatus = row.status.parse().map_err(|_| {
            DomainError::new(
                ErrorCode::DatabaseError,
                format!("Invalid outbox status value: {}", row.status),
            )
        })?;

        Ok(OutboxEvent {
            id: OutboxEventId::new(row.id),
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: Timestamp::from_datetime(row.created_at),
            processed_at: row.processed_at.map(Timestamp::from_datetime),
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEvent>, DomainError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, status,
                   attempts, last_error, created_at, processed_at
            FROM outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to fetch pending outbox events", e))?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, DomainError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::database("Failed to begin outbox transaction", e))?;
        Ok(Box::new(PostgresOutboxTransaction { tx }))
    }

    async fn cleanup_processed(&self, before: Timestamp) -> Result<u64, DomainError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE status = 'processed' AND processed_at < $1
            "#,
        )
        .bind(before.as_datetime())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to clean up processed outbox events", e))?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<Vec<(OutboxStatus, i64)>, DomainError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM outbox GROUP BY status ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to count outbox events", e))?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse::<OutboxStatus>()?, count)))
            .collect()
    }
}

/// One relay-side unit of work. Dropped without `commit` it rolls back.
pub struct PostgresOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresOutboxTransaction {
    fn not_transitioned(id: OutboxEventId, to: OutboxStatus) -> DomainError {
        DomainError::new(
            ErrorCode::InvalidStateTransition,
            format!("Outbox event {} is not processing, cannot mark {}", id, to),
        )
    }
}

#[async_trait]
impl OutboxTransaction for PostgresOutboxTransaction {
    async fn mark_processing(&mut self, id: OutboxEventId) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'processing', attempts = attempts + 1
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| DomainError::database("Failed to mark outbox event processing", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), DomainError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'processed', processed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| DomainError::database("Failed to mark outbox event processed", e))?;

        if result.rows_affected() == 0 {
            return Err(Self::not_transitioned(id, OutboxStatus::Processed));
        }
        Ok(())
    }

    async fn mark_failed(&mut self, id: OutboxEventId, reason: &str) -> Result<(), DomainError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'failed', last_error = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_i64())
        .bind(reason)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| DomainError::database("Failed to mark outbox event failed", e))?;

        if result.rows_affected() == 0 {
            return Err(Self::not_transitioned(id, OutboxStatus::Failed));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DomainError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DomainError::database("Failed to commit outbox transaction", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outbox::EventType;
    use serde_json::json;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        pool
    }

    fn new_event() -> NewOutboxEvent {
        NewOutboxEvent::new(
            "message",
            Uuid::new_v4(),
            EventType::MessageCreated,
            &json!({"message": {"content": "hi"}}),
        )
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn rolled_back_create_leaves_no_row() {
        let pool = pool().await;
        let store = PostgresOutboxStore::new(pool.clone());

        let mut tx = pool.begin().await.unwrap();
        let event = PostgresOutboxStore::create(&mut tx, &new_event()).await.unwrap();
        tx.rollback().await.unwrap();

        let pending = store.fetch_pending(1_000).await.unwrap();
        assert!(pending.iter().all(|e| e.id != event.id));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn uncommitted_claim_stays_pending() {
        let pool = pool().await;
        let store = PostgresOutboxStore::new(pool.clone());

        let mut conn = pool.acquire().await.unwrap();
        let event = PostgresOutboxStore::create(&mut conn, &new_event()).await.unwrap();
        drop(conn);

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.mark_processing(event.id).await.unwrap());
        }

        let pending = store.fetch_pending(1_000).await.unwrap();
        assert!(pending.iter().any(|e| e.id == event.id));
    }
}
