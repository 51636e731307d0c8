use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use streamhost_core::{PartitionCheckpoint, PartitionId};

use super::{CheckpointStore, CheckpointStoreError};

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<BTreeMap<(String, PartitionId), PartitionCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, CheckpointStoreError> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(&(consumer_group.to_owned(), partition_id.clone()))
            .cloned())
    }

    async fn list(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<PartitionCheckpoint>, CheckpointStoreError> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .iter()
            .filter(|((group, _), _)| group == consumer_group)
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }

    async fn save(&self, checkpoint: PartitionCheckpoint) -> Result<(), CheckpointStoreError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let key = (
            checkpoint.consumer_group.clone(),
            checkpoint.partition_id.clone(),
        );
        match map.get(&key) {
            Some(stored)
                if stored.position.sequence_number > checkpoint.position.sequence_number => {}
            _ => {
                map.insert(key, checkpoint);
            }
        }
        Ok(())
    }
}
