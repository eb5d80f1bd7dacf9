//! PostgreSQL implementation of the dispatch stores
//!
//! Production persistence using PostgreSQL with:
//! - Lease acquisition as a single conditional `UPDATE ... WHERE popped = FALSE`
//! - Idempotent inserts through unique keys (`ON CONFLICT DO NOTHING`)
//! - No multi-statement transactions; every invariant is one-row

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;

/// PostgreSQL implementation of [`MessageStore`] and [`MarkerStore`]
///
/// Uses a connection pool for efficient database access. Many producers,
/// pollers and reapers may share the same tables.
///
/// # Example
///
/// ```ignore
/// use taskgate::PostgresDispatchStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresDispatchStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDispatchStore {
    pool: PgPool,
}

impl PostgresDispatchStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of at most `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Migration(e.to_string())
            })?;
        debug!("applied dispatch migrations");
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresDispatchStore {
    #[instrument(skip(self))]
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskgate_queues (queue_name)
            VALUES ($1)
            ON CONFLICT (queue_name) DO NOTHING
            "#,
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register queue: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT queue_name
            FROM taskgate_queue_messages
            ORDER BY queue_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list queues: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("queue_name")).collect())
    }

    #[instrument(skip(self, message), fields(queue = %message.queue_name, id = %message.message_id))]
    async fn upsert_message(&self, message: NewMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskgate_queue_messages (
                queue_name, message_id, payload, priority, offset_time_seconds, deliver_on, popped
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            ON CONFLICT (queue_name, message_id) DO UPDATE SET
                priority = EXCLUDED.priority,
                offset_time_seconds = EXCLUDED.offset_time_seconds,
                deliver_on = EXCLUDED.deliver_on,
                popped = FALSE
            "#,
        )
        .bind(&message.queue_name)
        .bind(&message.message_id)
        .bind(&message.payload)
        .bind(message.priority)
        .bind(message.offset_time_seconds)
        .bind(message.deliver_on)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to upsert message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(queue = %message.queue_name, id = %message.message_id, "upserted message");
        Ok(())
    }

    #[instrument(skip(self, message), fields(queue = %message.queue_name, id = %message.message_id))]
    async fn insert_message_if_absent(&self, message: NewMessage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO taskgate_queue_messages (
                queue_name, message_id, payload, priority, offset_time_seconds, deliver_on, popped
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            ON CONFLICT (queue_name, message_id) DO NOTHING
            "#,
        )
        .bind(&message.queue_name)
        .bind(&message.message_id)
        .bind(&message.payload)
        .bind(message.priority)
        .bind(message.offset_time_seconds)
        .bind(message.deliver_on)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn try_lease(
        &self,
        queue_name: &str,
        message_id: &str,
        leased_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE taskgate_queue_messages
            SET popped = TRUE,
                deliver_on = $3
            WHERE queue_name = $1 AND message_id = $2 AND popped = FALSE
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .bind(leased_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn set_deliver_on(
        &self,
        queue_name: &str,
        message_id: &str,
        offset_time_seconds: i64,
        deliver_on: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE taskgate_queue_messages
            SET offset_time_seconds = $3,
                deliver_on = $4
            WHERE queue_name = $1 AND message_id = $2
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .bind(offset_time_seconds)
        .bind(deliver_on)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to set deliver_on: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reset_delivery(
        &self,
        queue_name: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE taskgate_queue_messages
            SET offset_time_seconds = 0,
                deliver_on = $3,
                popped = FALSE
            WHERE queue_name = $1 AND message_id = $2
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reset offset time: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM taskgate_queue_messages
            WHERE queue_name = $1 AND message_id = $2
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM taskgate_queue_messages WHERE queue_name = $1")
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to flush queue: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(queue_name, removed = result.rows_affected(), "flushed queue");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn release_expired_leases(
        &self,
        queue_name: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE taskgate_queue_messages
            SET popped = FALSE
            WHERE popped = TRUE
              AND deliver_on < $1
              AND ($2::text IS NULL OR queue_name = $2)
            "#,
        )
        .bind(cutoff)
        .bind(queue_name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release expired leases: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_available(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, message_id, payload, priority, offset_time_seconds,
                   deliver_on, popped, created_on
            FROM taskgate_queue_messages
            WHERE queue_name = $1
              AND popped = FALSE
              AND deliver_on <= $2
            ORDER BY priority DESC, created_on, deliver_on, id
            LIMIT $3
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find available messages: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn get_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT queue_name, message_id, payload, priority, offset_time_seconds,
                   deliver_on, popped, created_on
            FROM taskgate_queue_messages
            WHERE queue_name = $1 AND message_id = $2
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.as_ref().map(message_from_row))
    }

    #[instrument(skip(self))]
    async fn contains_message(
        &self,
        queue_name: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM taskgate_queue_messages
                WHERE queue_name = $1 AND message_id = $2
            ) AS found
            "#,
        )
        .bind(queue_name)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to check message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get("found"))
    }

    #[instrument(skip(self))]
    async fn count_messages(&self, queue_name: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM taskgate_queue_messages WHERE queue_name = $1",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count messages: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    #[instrument(skip(self))]
    async fn count_by_state(&self, queue_name: &str) -> Result<QueueDetail, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE popped = FALSE) AS available,
                   COUNT(*) FILTER (WHERE popped = TRUE) AS leased
            FROM taskgate_queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count queue detail: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(QueueDetail {
            available: row.get::<i64, _>("available") as u64,
            leased: row.get::<i64, _>("leased") as u64,
        })
    }
}

#[async_trait]
impl MarkerStore for PostgresDispatchStore {
    #[instrument(skip(self))]
    async fn insert_scheduled_if_absent(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO taskgate_task_scheduled (workflow_id, task_key)
            VALUES ($1, $2)
            "#,
        )
        .bind(workflow_id)
        .bind(task_key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => {
                debug!(workflow_id, task_key, "task already scheduled");
                Ok(false)
            }
            Err(e) => {
                error!("Failed to insert scheduled task: {}", e);
                Err(StoreError::Database(e.to_string()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_scheduled(
        &self,
        workflow_id: &str,
        task_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM taskgate_task_scheduled WHERE workflow_id = $1 AND task_key = $2",
        )
        .bind(workflow_id)
        .bind(task_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete scheduled task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn insert_in_progress_if_absent(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO taskgate_task_in_progress (task_def_name, task_id, workflow_id, in_progress)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (task_def_name, task_id) DO NOTHING
            "#,
        )
        .bind(task_def_name)
        .bind(task_id)
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert in-progress marker: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn upsert_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
        workflow_id: &str,
        in_progress: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskgate_task_in_progress (task_def_name, task_id, workflow_id, in_progress)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_def_name, task_id) DO UPDATE SET
                in_progress = EXCLUDED.in_progress,
                modified_on = NOW()
            "#,
        )
        .bind(task_def_name)
        .bind(task_id)
        .bind(workflow_id)
        .bind(in_progress)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update in-progress marker: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM taskgate_task_in_progress WHERE task_def_name = $1 AND task_id = $2",
        )
        .bind(task_def_name)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete in-progress marker: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn count_in_progress(&self, task_def_name: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM taskgate_task_in_progress
            WHERE task_def_name = $1 AND in_progress = TRUE
            "#,
        )
        .bind(task_def_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count in-progress tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    #[instrument(skip(self))]
    async fn oldest_in_progress(
        &self,
        task_def_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id
            FROM taskgate_task_in_progress
            WHERE task_def_name = $1
            ORDER BY created_on, id
            LIMIT $2
            "#,
        )
        .bind(task_def_name)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list in-progress tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("task_id")).collect())
    }

    #[instrument(skip(self))]
    async fn get_in_progress(
        &self,
        task_def_name: &str,
        task_id: &str,
    ) -> Result<Option<InProgressMarker>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT task_def_name, task_id, workflow_id, in_progress, created_on, modified_on
            FROM taskgate_task_in_progress
            WHERE task_def_name = $1 AND task_id = $2
            "#,
        )
        .bind(task_def_name)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get in-progress marker: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(|r| InProgressMarker {
            task_def_name: r.get("task_def_name"),
            task_id: r.get("task_id"),
            workflow_id: r.get("workflow_id"),
            in_progress: r.get("in_progress"),
            created_on: r.get("created_on"),
            modified_on: r.get("modified_on"),
        }))
    }
}

// Helper functions

fn message_from_row(row: &sqlx::postgres::PgRow) -> QueueMessage {
    QueueMessage {
        queue_name: row.get("queue_name"),
        message_id: row.get("message_id"),
        payload: row.get("payload"),
        priority: row.get("priority"),
        offset_time_seconds: row.get("offset_time_seconds"),
        deliver_on: row.get("deliver_on"),
        popped: row.get("popped"),
        created_on: row.get("created_on"),
    }
}

/// SQLSTATE 23505
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database
    // Run with: cargo test -p taskgate --test postgres_integration_test -- --ignored --test-threads=1

    use super::is_unique_violation;

    #[test]
    fn test_non_database_error_is_not_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }
}
