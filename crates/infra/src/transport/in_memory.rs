//! In-process partitioned event hub.
//!
//! Backs the test suite and local development. Each partition is an
//! append-only `Vec`; readers are woken through a version counter. Reads,
//! checkpoints and coordinator load balancing can be made to fail on demand.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use streamhost_core::{EventPosition, PartitionCheckpoint, PartitionId, StartPosition};
use streamhost_events::routing::names;

use super::{
    Checkpointer, CloseReason, EventSource, EventStream, PartitionCoordinator,
    PartitionProcessor, ProcessorError, ReadOptions, TransportError, TransportEvent,
};
use crate::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore};

const DEFAULT_CONSUMER_GROUP: &str = "$Default";
const STREAM_BUFFER: usize = 64;

/// Event to publish into an [`InMemoryEventHub`].
#[derive(Debug, Clone, Default)]
pub struct EventData {
    body: Vec<u8>,
    properties: BTreeMap<String, String>,
    system_properties: BTreeMap<String, String>,
    enqueued_at: Option<DateTime<Utc>>,
}

impl EventData {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Event carrying the platform device-id system property.
    pub fn from_device(device_id: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(body).with_system_property(names::PLATFORM_DEVICE_ID, device_id)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_system_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.system_properties.insert(key.into(), value.into());
        self
    }

    /// Override the enqueue time (defaults to the time of `send`).
    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }
}

struct HubInner {
    partitions: Vec<PartitionId>,
    logs: Mutex<HashMap<PartitionId, Vec<TransportEvent>>>,
    version: watch::Sender<u64>,
    read_failures: Mutex<VecDeque<String>>,
    checkpoint_failures: AtomicUsize,
    opens: AtomicUsize,
}

impl HubInner {
    fn events_from(&self, partition_id: &PartitionId, from: usize) -> Vec<TransportEvent> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(partition_id)
            .and_then(|log| log.get(from..))
            .map(<[TransportEvent]>::to_vec)
            .unwrap_or_default()
    }

    fn start_index(&self, partition_id: &PartitionId, start: &StartPosition) -> usize {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.get(partition_id).map(Vec::as_slice).unwrap_or_default();
        match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => log.len(),
            StartPosition::EnqueuedAfter(at) => log
                .iter()
                .position(|e| e.position.enqueued_at > *at)
                .unwrap_or(log.len()),
            StartPosition::After(position) => {
                usize::try_from(position.sequence_number.saturating_add(1)).unwrap_or(0)
            }
            StartPosition::At(position) => usize::try_from(position.sequence_number).unwrap_or(0),
        }
    }

    fn take_read_failure(&self) -> Option<String> {
        self.read_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn wake_readers(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-process partitioned event hub.
///
/// Cloning yields another handle onto the same partitions.
#[derive(Clone)]
pub struct InMemoryEventHub {
    inner: Arc<HubInner>,
    store: Arc<dyn CheckpointStore>,
    consumer_group: Arc<str>,
}

impl InMemoryEventHub {
    pub fn new(partition_count: u32) -> Self {
        let partitions: Vec<_> = (0..partition_count).map(PartitionId::from_index).collect();
        let logs = partitions.iter().map(|p| (p.clone(), Vec::new())).collect();
        let (version, _) = watch::channel(0);

        Self {
            inner: Arc::new(HubInner {
                partitions,
                logs: Mutex::new(logs),
                version,
                read_failures: Mutex::new(VecDeque::new()),
                checkpoint_failures: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            }),
            store: Arc::new(InMemoryCheckpointStore::new()),
            consumer_group: Arc::from(DEFAULT_CONSUMER_GROUP),
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_consumer_group(mut self, consumer_group: impl AsRef<str>) -> Self {
        self.consumer_group = Arc::from(consumer_group.as_ref());
        self
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.inner.partitions
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Append an event to a partition and wake every reader.
    pub fn send(
        &self,
        partition_id: &PartitionId,
        data: EventData,
    ) -> Result<EventPosition, TransportError> {
        let position = {
            let mut logs = self.inner.logs.lock().unwrap_or_else(PoisonError::into_inner);
            let log = logs
                .get_mut(partition_id)
                .ok_or_else(|| TransportError::Read(format!("unknown partition {partition_id}")))?;

            let sequence_number = log.len() as i64;
            let position = EventPosition::new(
                sequence_number.to_string(),
                sequence_number,
                data.enqueued_at.unwrap_or_else(Utc::now),
            );
            log.push(TransportEvent {
                partition_id: partition_id.clone(),
                position: position.clone(),
                body: data.body,
                properties: data.properties,
                system_properties: data.system_properties,
            });
            position
        };

        self.inner.wake_readers();
        Ok(position)
    }

    /// Make the next read of an open stream fail with `message`.
    pub fn fail_next_read(&self, message: impl Into<String>) {
        self.inner
            .read_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.into());
        self.inner.wake_readers();
    }

    /// Make the next `count` checkpoint writes fail.
    pub fn fail_next_checkpoints(&self, count: usize) {
        self.inner
            .checkpoint_failures
            .fetch_add(count, Ordering::SeqCst);
    }

    /// How many times a direct reader opened the hub.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub async fn stored_checkpoint(
        &self,
        partition_id: &PartitionId,
    ) -> Result<Option<PartitionCheckpoint>, TransportError> {
        Ok(self.store.load(&self.consumer_group, partition_id).await?)
    }
}

#[async_trait]
impl Checkpointer for InMemoryEventHub {
    async fn checkpoint(
        &self,
        partition_id: &PartitionId,
        position: &EventPosition,
    ) -> Result<(), TransportError> {
        let injected = self
            .inner
            .checkpoint_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Checkpoint(
                "injected checkpoint failure".to_string(),
            ));
        }

        self.store
            .save(PartitionCheckpoint {
                consumer_group: self.consumer_group.to_string(),
                partition_id: partition_id.clone(),
                position: position.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventSource for InMemoryEventHub {
    async fn stored_checkpoints(&self) -> Result<Vec<PartitionCheckpoint>, TransportError> {
        Ok(self.store.list(&self.consumer_group).await?)
    }

    async fn open(&self, options: ReadOptions) -> Result<EventStream, TransportError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let next: BTreeMap<_, _> = self
            .inner
            .partitions
            .iter()
            .map(|p| (p.clone(), self.inner.start_index(p, &options.start_for(p))))
            .collect();
        debug!(?next, "in-memory reader opened");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(feed(self.inner.clone(), next, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn feed(
    inner: Arc<HubInner>,
    mut next: BTreeMap<PartitionId, usize>,
    tx: mpsc::Sender<Result<TransportEvent, TransportError>>,
) {
    let mut version = inner.version.subscribe();
    loop {
        if let Some(message) = inner.take_read_failure() {
            let _ = tx.send(Err(TransportError::Read(message))).await;
            return;
        }

        for (partition_id, next_index) in next.iter_mut() {
            for event in inner.events_from(partition_id, *next_index) {
                *next_index += 1;
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            changed = version.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tx.closed() => return,
        }
    }
}

struct Assignment {
    processor: Arc<dyn PartitionProcessor>,
    close: watch::Sender<Option<CloseReason>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Partition coordinator over an [`InMemoryEventHub`].
///
/// Owns every partition of the hub while running (single consumer, no lease
/// contention). [`fail`](Self::fail) simulates losing all leases.
pub struct InMemoryCoordinator {
    hub: InMemoryEventHub,
    assignment: Mutex<Option<Assignment>>,
    running: AtomicBool,
    starts: AtomicUsize,
}

impl InMemoryCoordinator {
    pub fn new(hub: InMemoryEventHub) -> Self {
        Self {
            hub,
            assignment: Mutex::new(None),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn hub(&self) -> &InMemoryEventHub {
        &self.hub
    }

    /// Number of successful `start` calls.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Drop every partition, stop, then report the failure to the processor.
    pub async fn fail(&self, message: impl Into<String>) {
        let Some(assignment) = self.take_assignment() else {
            return;
        };
        let processor = assignment.processor.clone();
        self.release(assignment, CloseReason::OwnershipLost).await;

        processor
            .on_error(ProcessorError {
                partition_id: None,
                operation: "load_balancing".to_string(),
                error: TransportError::Coordinator(message.into()),
            })
            .await;
    }

    fn take_assignment(&self) -> Option<Assignment> {
        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn release(&self, assignment: Assignment, reason: CloseReason) {
        self.running.store(false, Ordering::SeqCst);
        let _ = assignment.close.send(Some(reason));
        for joined in join_all(assignment.tasks).await {
            if let Err(err) = joined {
                warn!(error = %err, "partition reader task failed");
            }
        }
    }
}

#[async_trait]
impl Checkpointer for InMemoryCoordinator {
    async fn checkpoint(
        &self,
        partition_id: &PartitionId,
        position: &EventPosition,
    ) -> Result<(), TransportError> {
        self.hub.checkpoint(partition_id, position).await
    }
}

#[async_trait]
impl PartitionCoordinator for InMemoryCoordinator {
    async fn start(&self, processor: Arc<dyn PartitionProcessor>) -> Result<(), TransportError> {
        let mut assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if assignment.is_some() {
            return Err(TransportError::Coordinator("already running".to_string()));
        }

        let (close, _) = watch::channel(None);
        let tasks = self
            .hub
            .partitions()
            .iter()
            .cloned()
            .map(|partition_id| {
                tokio::spawn(read_partition(
                    self.hub.clone(),
                    partition_id,
                    processor.clone(),
                    close.subscribe(),
                ))
            })
            .collect();

        *assignment = Some(Assignment {
            processor,
            close,
            tasks,
        });
        self.running.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(assignment) = self.take_assignment() {
            self.release(assignment, CloseReason::Shutdown).await;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn read_partition(
    hub: InMemoryEventHub,
    partition_id: PartitionId,
    processor: Arc<dyn PartitionProcessor>,
    mut close: watch::Receiver<Option<CloseReason>>,
) {
    let checkpoint = match hub.stored_checkpoint(&partition_id).await {
        Ok(checkpoint) => checkpoint,
        Err(error) => {
            processor
                .on_error(ProcessorError {
                    partition_id: Some(partition_id.clone()),
                    operation: "load_checkpoint".to_string(),
                    error,
                })
                .await;
            None
        }
    };

    let start = processor
        .on_partition_opening(&partition_id, checkpoint.as_ref())
        .await;
    let mut next = hub.inner.start_index(&partition_id, &start);
    let mut version = hub.inner.version.subscribe();

    let reason = 'read: loop {
        for event in hub.inner.events_from(&partition_id, next) {
            let closing = *close.borrow();
            if let Some(reason) = closing {
                break 'read reason;
            }
            next += 1;
            processor.on_event(event).await;
        }

        tokio::select! {
            changed = close.changed() => {
                let closing = *close.borrow();
                match (changed, closing) {
                    (_, Some(reason)) => break 'read reason,
                    (Err(_), None) => break 'read CloseReason::Shutdown,
                    (Ok(()), None) => {}
                }
            }
            _ = version.changed() => {}
        }
    };

    processor.on_partition_closing(&partition_id, reason).await;
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn p(index: u32) -> PartitionId {
        PartitionId::from_index(index)
    }

    #[tokio::test]
    async fn send_assigns_sequential_positions_per_partition() {
        let hub = InMemoryEventHub::new(2);
        let a = hub.send(&p(0), EventData::new("a")).unwrap();
        let b = hub.send(&p(0), EventData::new("b")).unwrap();
        let c = hub.send(&p(1), EventData::new("c")).unwrap();

        assert_eq!((a.sequence_number, b.sequence_number), (0, 1));
        assert_eq!(c.sequence_number, 0);
        assert!(hub.send(&p(9), EventData::new("x")).is_err());
    }

    #[tokio::test]
    async fn open_honours_start_positions() {
        let hub = InMemoryEventHub::new(1);
        let first = hub.send(&p(0), EventData::new("0")).unwrap();
        hub.send(&p(0), EventData::new("1")).unwrap();

        let options = ReadOptions::new(StartPosition::Earliest).resume_after(p(0), first.clone());
        let mut stream = hub.open(options).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.position.sequence_number, 1);

        let mut options = ReadOptions::new(StartPosition::Latest);
        options.starts.insert(p(0), StartPosition::At(first));
        let mut stream = hub.open(options).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.position.sequence_number, 0);
    }

    #[tokio::test]
    async fn stored_checkpoints_lists_the_consumer_group() {
        let hub = InMemoryEventHub::new(2).with_consumer_group("ingest");
        assert!(hub.stored_checkpoints().await.unwrap().is_empty());

        let position = hub.send(&p(1), EventData::new("x")).unwrap();
        hub.checkpoint(&p(1), &position).await.unwrap();

        let stored = hub.stored_checkpoints().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].partition_id, p(1));
        assert_eq!(stored[0].consumer_group, "ingest");
    }

    #[tokio::test]
    async fn latest_only_sees_new_events() {
        let hub = InMemoryEventHub::new(1);
        hub.send(&p(0), EventData::new("old")).unwrap();

        let mut stream = hub.open(ReadOptions::new(StartPosition::Latest)).await.unwrap();
        hub.send(&p(0), EventData::new("new")).unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.body, b"new");
    }

    #[tokio::test]
    async fn enqueued_after_skips_older_events() {
        let hub = InMemoryEventHub::new(1);
        let cutoff = Utc::now();
        hub.send(
            &p(0),
            EventData::new("old").with_enqueued_at(cutoff - chrono::Duration::minutes(5)),
        )
        .unwrap();
        hub.send(
            &p(0),
            EventData::new("fresh").with_enqueued_at(cutoff + chrono::Duration::seconds(1)),
        )
        .unwrap();

        let mut stream = hub
            .open(ReadOptions::new(StartPosition::EnqueuedAfter(cutoff)))
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.body, b"fresh");
    }

    #[tokio::test]
    async fn injected_read_failure_breaks_the_stream() {
        let hub = InMemoryEventHub::new(1);
        let mut stream = hub.open(ReadOptions::new(StartPosition::Earliest)).await.unwrap();
        hub.fail_next_read("connection reset");

        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(TransportError::Read(m)) if m == "connection reset"));
        assert!(stream.next().await.is_none());
        assert_eq!(hub.open_count(), 1);
    }

    #[tokio::test]
    async fn checkpoints_land_in_store_unless_failure_injected() {
        let hub = InMemoryEventHub::new(1);
        let position = hub.send(&p(0), EventData::new("a")).unwrap();

        hub.fail_next_checkpoints(1);
        assert!(hub.checkpoint(&p(0), &position).await.is_err());
        assert!(hub.stored_checkpoint(&p(0)).await.unwrap().is_none());

        hub.checkpoint(&p(0), &position).await.unwrap();
        let stored = hub.stored_checkpoint(&p(0)).await.unwrap().unwrap();
        assert_eq!(stored.consumer_group, "$Default");
        assert_eq!(stored.position, position);
    }
}
