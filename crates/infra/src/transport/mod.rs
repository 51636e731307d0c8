//! Transport collaborator contracts.
//!
//! The host never talks to a concrete event hub. It consumes one of two
//! shapes:
//!
//! - **Direct**: an [`EventSource`] that opens a single stream over every
//!   partition. The host owns reconnects and resume positions.
//! - **Distributed**: a [`PartitionCoordinator`] that owns partition
//!   assignment and lease renewal, and calls back into a
//!   [`PartitionProcessor`] implemented by the host.
//!
//! Both persist progress through [`Checkpointer`].

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use streamhost_core::{EventPosition, PartitionCheckpoint, PartitionId, StartPosition};

use crate::checkpoint_store::CheckpointStoreError;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{EventData, InMemoryCoordinator, InMemoryEventHub};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsSource;

/// One event as received from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub partition_id: PartitionId,
    pub position: EventPosition,
    pub body: Vec<u8>,
    /// Application properties set by the producer.
    pub properties: BTreeMap<String, String>,
    /// Properties stamped by the platform.
    pub system_properties: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("malformed event: {0}")]
    Decode(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("checkpoint store error: {0}")]
    CheckpointStore(#[from] CheckpointStoreError),

    #[error("coordinator error: {0}")]
    Coordinator(String),
}

/// Persists a partition's progress. Must be idempotent.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(
        &self,
        partition_id: &PartitionId,
        position: &EventPosition,
    ) -> Result<(), TransportError>;
}

#[async_trait]
impl<C> Checkpointer for Arc<C>
where
    C: Checkpointer + ?Sized,
{
    async fn checkpoint(
        &self,
        partition_id: &PartitionId,
        position: &EventPosition,
    ) -> Result<(), TransportError> {
        (**self).checkpoint(partition_id, position).await
    }
}

/// Where each partition of a direct reader starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Used for partitions absent from `starts`.
    pub default_start: StartPosition,
    /// Per-partition overrides (resume points, stored checkpoints).
    pub starts: HashMap<PartitionId, StartPosition>,
}

impl ReadOptions {
    pub fn new(default_start: StartPosition) -> Self {
        Self {
            default_start,
            starts: HashMap::new(),
        }
    }

    /// Resume `partition_id` strictly after `position`.
    pub fn resume_after(mut self, partition_id: PartitionId, position: EventPosition) -> Self {
        self.starts
            .insert(partition_id, StartPosition::After(position));
        self
    }

    pub fn start_for(&self, partition_id: &PartitionId) -> StartPosition {
        self.starts
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| self.default_start.clone())
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<TransportEvent, TransportError>> + Send>>;

/// Direct-mode transport: one stream across all partitions.
///
/// A stream yielding an error (or ending) is treated as a broken connection:
/// the host drops it and opens a new one.
#[async_trait]
pub trait EventSource: Checkpointer {
    /// Checkpoints previously persisted for this source's consumer group.
    async fn stored_checkpoints(&self) -> Result<Vec<PartitionCheckpoint>, TransportError>;

    async fn open(&self, options: ReadOptions) -> Result<EventStream, TransportError>;
}

/// Why a partition is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    OwnershipLost,
}

/// Failure reported by a coordinator through [`PartitionProcessor::on_error`].
#[derive(Debug)]
pub struct ProcessorError {
    /// `None` for failures not tied to a single partition (e.g. load balancing).
    pub partition_id: Option<PartitionId>,
    pub operation: String,
    pub error: TransportError,
}

/// Callbacks a [`PartitionCoordinator`] drives.
///
/// Calls for one partition are sequential; different partitions run
/// concurrently.
#[async_trait]
pub trait PartitionProcessor: Send + Sync {
    /// A partition was assigned. Returns where reading starts.
    async fn on_partition_opening(
        &self,
        partition_id: &PartitionId,
        checkpoint: Option<&PartitionCheckpoint>,
    ) -> StartPosition;

    async fn on_partition_closing(&self, partition_id: &PartitionId, reason: CloseReason);

    async fn on_event(&self, event: TransportEvent);

    async fn on_error(&self, error: ProcessorError);
}

/// Distributed-mode transport: owns partition assignment and leases.
#[async_trait]
pub trait PartitionCoordinator: Checkpointer {
    async fn start(&self, processor: Arc<dyn PartitionProcessor>) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    fn is_running(&self) -> bool;
}
