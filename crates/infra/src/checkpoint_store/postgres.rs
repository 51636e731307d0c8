//! Postgres-backed checkpoint store.
//!
//! One row per (consumer group, partition) in `partition_checkpoints`; see
//! `migrations/0001_partition_checkpoints.sql`. Upserts only move a row
//! forward (the `WHERE` on the conflict branch compares sequence numbers).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::instrument;

use streamhost_core::{EventPosition, PartitionCheckpoint, PartitionId};

use super::{CheckpointStore, CheckpointStoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_partition_checkpoints.sql");

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the checkpoint table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointStoreError> {
        sqlx::query(SCHEMA).execute(&*self.pool).await?;
        Ok(())
    }
}

fn checkpoint_from_row(row: &PgRow) -> Result<PartitionCheckpoint, CheckpointStoreError> {
    let partition: String = row.try_get("partition_id")?;
    let partition_id =
        PartitionId::new(partition).map_err(|e| CheckpointStoreError::Corrupt(e.to_string()))?;

    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
    Ok(PartitionCheckpoint {
        consumer_group: row.try_get("consumer_group")?,
        partition_id,
        position: EventPosition::new(
            row.try_get::<String, _>("offset_value")?,
            row.try_get::<i64, _>("sequence_number")?,
            enqueued_at,
        ),
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), fields(partition = %partition_id), err)]
    async fn load(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointStoreError> {
        let row = sqlx::query(
            r#"
            SELECT consumer_group, partition_id, offset_value, sequence_number, enqueued_at, updated_at
            FROM partition_checkpoints
            WHERE consumer_group = $1 AND partition_id = $2
            "#,
        )
        .bind(consumer_group)
        .bind(partition_id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn list(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<PartitionCheckpoint>, CheckpointStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT consumer_group, partition_id, offset_value, sequence_number, enqueued_at, updated_at
            FROM partition_checkpoints
            WHERE consumer_group = $1
            ORDER BY partition_id
            "#,
        )
        .bind(consumer_group)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(checkpoint_from_row).collect()
    }

    #[instrument(
        skip(self, checkpoint),
        fields(
            partition = %checkpoint.partition_id,
            sequence_number = checkpoint.position.sequence_number
        ),
        err
    )]
    async fn save(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointStoreError> {
        sqlx::query(
            r#"
            INSERT INTO partition_checkpoints (
                consumer_group,
                partition_id,
                offset_value,
                sequence_number,
                enqueued_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (consumer_group, partition_id)
            DO UPDATE SET
                offset_value = EXCLUDED.offset_value,
                sequence_number = EXCLUDED.sequence_number,
                enqueued_at = EXCLUDED.enqueued_at,
                updated_at = EXCLUDED.updated_at
            WHERE partition_checkpoints.sequence_number <= EXCLUDED.sequence_number
            "#,
        )
        .bind(&checkpoint.consumer_group)
        .bind(checkpoint.partition_id.as_str())
        .bind(&checkpoint.position.offset)
        .bind(checkpoint.position.sequence_number)
        .bind(checkpoint.position.enqueued_at)
        .bind(checkpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
