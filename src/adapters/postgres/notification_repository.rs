//! PostgreSQL implementation of NotificationRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::foundation::{
    DomainError, ErrorCode, NotificationId, Timestamp, UserId,
};
use crate::domain::notification::{EntityRef, Notification, NotificationType};
use crate::ports::NotificationRepository;

pub struct PostgresNotificationRepository {
    pool: PgPool,
}

impl PostgresNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a notification.
#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    title: String,
    body: String,
    entity_type: Option<String>,
    entity_id: Option<Uuid>,
    data: Option<serde_json::Value>,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = DomainError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let kind: NotificationType = row.kind.parse().map_err(|_| {
            DomainError::new(
                ErrorCode::DatabaseError,
                format!("Invalid notification type value: {}", row.kind),
            )
        })?;
        let user_id = UserId::new(row.user_id).map_err(|e| {
            DomainError::new(ErrorCode::DatabaseError, format!("Invalid user_id: {}", e))
        })?;
        let entity = match (row.entity_type, row.entity_id) {
            (Some(kind), Some(id)) => Some(EntityRef { kind, id }),
            _ => None,
        };

        Ok(Notification {
            id: NotificationId::from_uuid(row.id),
            user_id,
            kind,
            title: row.title,
            body: row.body,
            entity,
            data: row.data,
            read_at: row.read_at.map(Timestamp::from_datetime),
            created_at: Timestamp::from_datetime(row.created_at),
        })
    }
}

#[async_trait]
impl NotificationRepository for PostgresNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, type, title, body, entity_type, entity_id, data, read_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id.as_uuid())
        .bind(notification.user_id.as_str())
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.entity.as_ref().map(|e| e.kind.as_str()))
        .bind(notification.entity.as_ref().map(|e| e.id))
        .bind(&notification.data)
        .bind(notification.read_at.map(|t| *t.as_datetime()))
        .bind(notification.created_at.as_datetime())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to insert notification", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, DomainError> {
        let row: Option<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, type, title, body, entity_type, entity_id, data, read_at, created_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to find notification", e))?;

        row.map(Notification::try_from).transpose()
    }

    async fn list_for_user(
        &self,
        user: &UserId,
        limit: u32,
    ) -> Result<Vec<Notification>, DomainError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, type, title, body, entity_type, entity_id, data, read_at, created_at
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to list notifications", e))?;

        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn mark_read(&self, id: &NotificationId, user: &UserId) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET read_at = NOW()
            WHERE id = $1 AND user_id = $2 AND read_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(user.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to mark notification read", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM notifications WHERE id = $1 AND user_id = $2)
            "#,
        )
        .bind(id.as_uuid())
        .bind(user.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DomainError::database("Failed to look up notification", e))?;

        if !exists {
            return Err(DomainError::new(
                ErrorCode::NotificationNotFound,
                format!("Notification {} not found", id),
            ));
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn create_then_mark_read() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        let repo = PostgresNotificationRepository::new(pool);

        let user = UserId::new(format!("user-{}", Uuid::new_v4())).unwrap();
        let n = Notification::class_invite(user.clone(), Uuid::new_v4(), "Chemistry", "student");
        assert!(repo.create(&n).await.unwrap());
        assert!(!repo.create(&n).await.unwrap());

        let found = repo.find_by_id(&n.id).await.unwrap().unwrap();
        assert_eq!(found.title, "Class invitation");
        assert_eq!(found.entity.as_ref().map(|e| e.kind.as_str()), Some("class"));

        assert!(repo.mark_read(&n.id, &user).await.unwrap());
        assert!(!repo.mark_read(&n.id, &user).await.unwrap());
        assert_eq!(repo.list_for_user(&user, 10).await.unwrap().len(), 1);
    }
}
