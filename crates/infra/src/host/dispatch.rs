//! Per-event dispatch path shared by direct and distributed modes.
//!
//! 1. Resolve routing metadata; events without a device id are dropped.
//! 2. Fan the message out to every matching subscriber and wait for all.
//! 3. Advance the partition cursor and checkpoint when the policy says so,
//!    or unconditionally once shutdown was requested.
//!
//! A handler failure skips step 3 for that event. Dropped events still
//! advance the cursor. Every received event is noted on its cursor so a
//! reopened partition without a checkpoint starts at its first event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, trace, warn};

use streamhost_core::{EventPosition, PartitionId, StartPosition};
use streamhost_events::{
    CheckpointPolicy, InboundMessage, PartitionCursor, RoutingMetadata, SubscriptionRegistry,
    merge_properties,
};

use super::shutdown::ShutdownSignal;
use super::stats::HostStats;
use crate::transport::{Checkpointer, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    /// Shutdown was requested; the reader should stop.
    Cancelled,
}

pub(crate) struct Dispatcher {
    registry: SubscriptionRegistry,
    checkpointer: Arc<dyn Checkpointer>,
    policy: CheckpointPolicy,
    cursors: Mutex<HashMap<PartitionId, PartitionCursor>>,
    stats: Arc<HostStats>,
    shutdown: ShutdownSignal,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: SubscriptionRegistry,
        checkpointer: Arc<dyn Checkpointer>,
        policy: CheckpointPolicy,
        stats: Arc<HostStats>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            checkpointer,
            policy,
            cursors: Mutex::new(HashMap::new()),
            stats,
            shutdown,
        }
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<PartitionId, PartitionCursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a partition, optionally from a persisted checkpoint.
    pub(crate) fn open_partition(&self, partition_id: &PartitionId, checkpoint: Option<EventPosition>) {
        let cursor = match checkpoint {
            Some(position) => PartitionCursor::resumed(partition_id.clone(), position),
            None => PartitionCursor::new(partition_id.clone()),
        };
        self.cursors().insert(partition_id.clone(), cursor);
    }

    pub(crate) fn close_partition(&self, partition_id: &PartitionId) {
        self.cursors().remove(partition_id);
    }

    /// Where each tracked partition picks up when its reader reopens.
    pub(crate) fn resume_starts(&self) -> HashMap<PartitionId, StartPosition> {
        self.cursors()
            .iter()
            .filter_map(|(id, cursor)| cursor.resume_start().map(|start| (id.clone(), start)))
            .collect()
    }

    pub(crate) async fn process(&self, event: TransportEvent) -> Outcome {
        self.stats.record_received();
        let TransportEvent {
            partition_id,
            position,
            body,
            properties,
            system_properties,
        } = event;

        self.cursors()
            .entry(partition_id.clone())
            .or_insert_with(|| PartitionCursor::new(partition_id.clone()))
            .mark_received(&position);

        let properties = merge_properties(&properties, &system_properties);
        match RoutingMetadata::resolve(&properties) {
            None => {
                debug!(
                    partition = %partition_id,
                    offset = %position.offset,
                    "event has no device id; dropping"
                );
                self.stats.record_dropped();
            }
            Some(routing) => {
                let message = InboundMessage::new(
                    routing.target,
                    body,
                    routing.content_type,
                    routing.content_encoding,
                    properties,
                    partition_id.clone(),
                    position.clone(),
                );

                match self.registry.deliver(&message).await {
                    Ok(handlers) => {
                        trace!(
                            partition = %partition_id,
                            topic = message.target(),
                            handlers,
                            "message dispatched"
                        );
                        self.stats.record_dispatched();
                    }
                    Err(err) => {
                        warn!(
                            partition = %partition_id,
                            offset = %position.offset,
                            device_id = %routing.device_id,
                            error = %err,
                            "handler failed; checkpoint withheld"
                        );
                        self.stats.record_handler_failure();
                        return self.outcome();
                    }
                }
            }
        }

        self.advance(&partition_id, position).await;
        self.outcome()
    }

    fn outcome(&self) -> Outcome {
        if self.shutdown.is_triggered() {
            Outcome::Cancelled
        } else {
            Outcome::Continue
        }
    }

    async fn advance(&self, partition_id: &PartitionId, position: EventPosition) {
        let due = {
            let mut cursors = self.cursors();
            let cursor = cursors
                .entry(partition_id.clone())
                .or_insert_with(|| PartitionCursor::new(partition_id.clone()));
            cursor.observe(position.clone(), Instant::now());
            self.policy.should_checkpoint(cursor)
        };

        let forced = self.shutdown.is_triggered();
        if !due && !forced {
            return;
        }
        self.persist(partition_id, &position, forced).await;
    }

    /// Checkpoint every processed position that is not persisted yet.
    /// Failures are logged and ignored.
    pub(crate) async fn flush(&self) {
        let pending = self.unpersisted(|_| true);
        for (partition_id, position) in pending {
            self.persist(&partition_id, &position, true).await;
        }
    }

    pub(crate) async fn flush_partition(&self, partition_id: &PartitionId) {
        let pending = self.unpersisted(|id| id == partition_id);
        for (partition_id, position) in pending {
            self.persist(&partition_id, &position, true).await;
        }
    }

    fn unpersisted(
        &self,
        include: impl Fn(&PartitionId) -> bool,
    ) -> Vec<(PartitionId, EventPosition)> {
        self.cursors()
            .iter()
            .filter(|(id, cursor)| include(id) && cursor.has_unpersisted_progress())
            .filter_map(|(id, cursor)| Some((id.clone(), cursor.last_position()?.clone())))
            .collect()
    }

    async fn persist(&self, partition_id: &PartitionId, position: &EventPosition, forced: bool) {
        match self.checkpointer.checkpoint(partition_id, position).await {
            Ok(()) => {
                if let Some(cursor) = self.cursors().get_mut(partition_id) {
                    self.policy.record_checkpoint(cursor);
                }
                self.stats.record_checkpoint();
                debug!(
                    partition = %partition_id,
                    sequence_number = position.sequence_number,
                    forced,
                    "checkpoint written"
                );
            }
            Err(err) => {
                self.stats.record_checkpoint_failure();
                if forced {
                    warn!(partition = %partition_id, error = %err, "shutdown checkpoint failed");
                } else {
                    warn!(partition = %partition_id, error = %err, "checkpoint failed; will retry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use streamhost_events::handler_fn;
    use streamhost_events::routing::names;

    use super::*;
    use crate::transport::{EventData, InMemoryEventHub};

    fn dispatcher(hub: &InMemoryEventHub, registry: SubscriptionRegistry) -> Dispatcher {
        Dispatcher::new(
            registry,
            Arc::new(hub.clone()),
            CheckpointPolicy::new(Duration::from_secs(60)),
            Arc::new(HostStats::new()),
            ShutdownSignal::new(),
        )
    }

    fn event(hub: &InMemoryEventHub, data: EventData) -> TransportEvent {
        let partition_id = PartitionId::from_index(0);
        let position = hub.send(&partition_id, data.clone()).unwrap();
        TransportEvent {
            partition_id,
            position,
            body: b"{}".to_vec(),
            properties: Default::default(),
            system_properties: [(names::PLATFORM_DEVICE_ID.to_string(), "dev-1".to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn first_event_checkpoints_then_waits_for_interval() {
        let hub = InMemoryEventHub::new(1);
        let d = dispatcher(&hub, SubscriptionRegistry::new());

        assert_eq!(d.process(event(&hub, EventData::new("a"))).await, Outcome::Continue);
        assert_eq!(d.process(event(&hub, EventData::new("b"))).await, Outcome::Continue);

        let stored = hub
            .stored_checkpoint(&PartitionId::from_index(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.position.sequence_number, 0);
        assert_eq!(d.stats.snapshot().checkpoints_written, 1);
    }

    #[tokio::test]
    async fn handler_failure_withholds_checkpoint() {
        let hub = InMemoryEventHub::new(1);
        let registry = SubscriptionRegistry::new();
        let _sub = registry
            .subscribe(
                "#",
                handler_fn(|_msg| async { Err::<(), _>(anyhow::anyhow!("down")) }),
            )
            .unwrap();
        let d = dispatcher(&hub, registry);

        d.process(event(&hub, EventData::new("a"))).await;

        assert!(hub.stored_checkpoint(&PartitionId::from_index(0)).await.unwrap().is_none());
        assert!(matches!(
            d.resume_starts().get(&PartitionId::from_index(0)),
            Some(StartPosition::At(p)) if p.sequence_number == 0
        ));
        assert_eq!(d.stats.snapshot().handler_failures, 1);
    }

    #[tokio::test]
    async fn dropped_event_still_advances_cursor() {
        let hub = InMemoryEventHub::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = SubscriptionRegistry::new();
        let counter = calls.clone();
        let _sub = registry
            .subscribe(
                "#",
                handler_fn(move |_msg| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let d = dispatcher(&hub, registry);

        let mut anonymous = event(&hub, EventData::new("a"));
        anonymous.system_properties.clear();
        d.process(anonymous).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(d.stats.snapshot().messages_dropped, 1);
        assert!(matches!(
            d.resume_starts().get(&PartitionId::from_index(0)),
            Some(StartPosition::After(p)) if p.sequence_number == 0
        ));
    }

    #[tokio::test]
    async fn shutdown_forces_checkpoint_and_cancels() {
        let hub = InMemoryEventHub::new(1);
        let d = dispatcher(&hub, SubscriptionRegistry::new());
        d.process(event(&hub, EventData::new("a"))).await;

        d.shutdown.trigger();
        assert_eq!(d.process(event(&hub, EventData::new("b"))).await, Outcome::Cancelled);

        let stored = hub
            .stored_checkpoint(&PartitionId::from_index(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.position.sequence_number, 1);
    }

    #[tokio::test]
    async fn failed_checkpoint_is_retried_on_next_event() {
        let hub = InMemoryEventHub::new(1);
        let d = dispatcher(&hub, SubscriptionRegistry::new());
        hub.fail_next_checkpoints(1);

        d.process(event(&hub, EventData::new("a"))).await;
        assert_eq!(d.stats.snapshot().checkpoint_failures, 1);

        d.process(event(&hub, EventData::new("b"))).await;
        let stored = hub
            .stored_checkpoint(&PartitionId::from_index(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.position.sequence_number, 1);
    }

    #[tokio::test]
    async fn resumed_partition_reports_its_checkpoint() {
        let hub = InMemoryEventHub::new(1);
        let d = dispatcher(&hub, SubscriptionRegistry::new());
        let partition = PartitionId::from_index(0);
        let position = EventPosition::new("9", 9, Utc::now());

        d.open_partition(&partition, Some(position.clone()));
        assert_eq!(
            d.resume_starts().get(&partition),
            Some(&StartPosition::After(position))
        );

        d.close_partition(&partition);
        assert!(d.resume_starts().is_empty());
    }

    #[tokio::test]
    async fn flush_persists_progress_not_yet_checkpointed() {
        let hub = InMemoryEventHub::new(1);
        let d = dispatcher(&hub, SubscriptionRegistry::new());
        let partition = PartitionId::from_index(0);

        d.process(event(&hub, EventData::new("a"))).await;
        d.process(event(&hub, EventData::new("b"))).await;
        let stored = hub.stored_checkpoint(&partition).await.unwrap().unwrap();
        assert_eq!(stored.position.sequence_number, 0);

        d.flush().await;
        let stored = hub.stored_checkpoint(&partition).await.unwrap().unwrap();
        assert_eq!(stored.position.sequence_number, 1);
        assert_eq!(d.stats.snapshot().checkpoints_written, 2);

        d.flush().await;
        d.flush_partition(&partition).await;
        assert_eq!(d.stats.snapshot().checkpoints_written, 2);
    }

    #[tokio::test]
    async fn flush_skips_partitions_whose_handlers_failed() {
        let hub = InMemoryEventHub::new(1);
        let registry = SubscriptionRegistry::new();
        let _sub = registry
            .subscribe(
                "#",
                handler_fn(|_msg| async { Err::<(), _>(anyhow::anyhow!("down")) }),
            )
            .unwrap();
        let d = dispatcher(&hub, registry);

        d.process(event(&hub, EventData::new("a"))).await;
        d.flush_partition(&PartitionId::from_index(0)).await;

        assert!(hub.stored_checkpoint(&PartitionId::from_index(0)).await.unwrap().is_none());
        assert_eq!(d.stats.snapshot().checkpoints_written, 0);
    }
}
