//! Redis-backed checkpoint store.
//!
//! Checkpoints of one consumer group live in a single hash
//! (`{prefix}:{consumer_group}`), one JSON-encoded [`PartitionCheckpoint`]
//! per partition field.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use streamhost_core::{PartitionCheckpoint, PartitionId};

use super::{CheckpointStore, CheckpointStoreError};

const DEFAULT_KEY_PREFIX: &str = "streamhost:checkpoints";

#[derive(Debug, Clone)]
pub struct RedisCheckpointStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisCheckpointStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CheckpointStoreError> {
        Ok(Self {
            client: redis::Client::open(redis_url.as_ref())?,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, consumer_group: &str) -> String {
        format!("{}:{}", self.key_prefix, consumer_group)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn load(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn
            .hget(self.key(consumer_group), partition_id.as_str())
            .await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn list(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<PartitionCheckpoint>, CheckpointStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key(consumer_group)).await?;

        let mut checkpoints = raw
            .values()
            .map(|json| serde_json::from_str::<PartitionCheckpoint>(json))
            .collect::<Result<Vec<_>, _>>()?;
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }

    /// Read-compare-write; assumes a single writer per partition.
    async fn save(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointStoreError> {
        let key = self.key(&checkpoint.consumer_group);
        let field = checkpoint.partition_id.as_str().to_owned();
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let stored: Option<String> = conn.hget(&key, &field).await?;
        if let Some(stored) = stored {
            let stored: PartitionCheckpoint = serde_json::from_str(&stored)?;
            if stored.position.sequence_number > checkpoint.position.sequence_number {
                return Ok(());
            }
        }

        let json = serde_json::to_string(&checkpoint)?;
        let _: () = conn.hset(&key, &field, json).await?;
        Ok(())
    }
}
