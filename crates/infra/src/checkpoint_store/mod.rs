//! Durable partition checkpoint storage.
//!
//! Transports persist progress through a [`CheckpointStore`] so the same
//! reader code can run against process memory (tests, single-node dev),
//! Postgres, or Redis.
//!
//! ## Monotonicity
//!
//! A store never moves a partition backwards: saving a checkpoint whose
//! sequence number is lower than the stored one is accepted and ignored.
//! Redelivered events after a restart therefore cannot rewind progress.

use async_trait::async_trait;
use thiserror::Error;

use streamhost_core::{PartitionCheckpoint, PartitionId};

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCheckpointStore;

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

/// Checkpoint persistence, keyed by (consumer group, partition).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointStoreError>;

    /// All checkpoints of a consumer group, ordered by partition.
    async fn list(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<PartitionCheckpoint>, CheckpointStoreError>;

    /// Insert or advance a checkpoint (idempotent).
    async fn save(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointStoreError>;
}

#[async_trait]
impl<S> CheckpointStore for std::sync::Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn load(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointStoreError> {
        (**self).load(consumer_group, partition_id).await
    }

    async fn list(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<PartitionCheckpoint>, CheckpointStoreError> {
        (**self).list(consumer_group).await
    }

    async fn save(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointStoreError> {
        (**self).save(checkpoint).await
    }
}
