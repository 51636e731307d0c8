//! Redis Streams-backed partitioned event source (direct mode).
//!
//! ## Layout
//!
//! - **Partitions**: one stream per partition, keyed `{source}:{partition}`
//!   (e.g. `streamhost:events:0`).
//! - **Entries**: the payload lives in the `body` field. Fields prefixed with
//!   `prop.` are application properties, fields prefixed with `sys.` are
//!   system properties (prefix stripped).
//! - **Positions**: the entry id is the offset. The enqueue time is the id's
//!   millisecond part; the sequence number packs `(ms << 16) | seq`.
//!
//! Reads use plain `XREAD` (no consumer group): progress is tracked by the
//! host and persisted through a [`CheckpointStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use streamhost_core::{EventPosition, PartitionCheckpoint, PartitionId, StartPosition};

use super::{Checkpointer, EventSource, EventStream, ReadOptions, TransportError, TransportEvent};
use crate::checkpoint_store::CheckpointStore;
use crate::config::{DEFAULT_CONSUMER_GROUP, HostConfig};

const BODY_FIELD: &str = "body";
const PROPERTY_PREFIX: &str = "prop.";
const SYSTEM_PROPERTY_PREFIX: &str = "sys.";

const DEFAULT_BLOCK: Duration = Duration::from_millis(1000);
const DEFAULT_BATCH: usize = 100;
const STREAM_BUFFER: usize = 256;

pub struct RedisStreamsSource {
    client: redis::Client,
    source: String,
    partitions: Vec<PartitionId>,
    store: Arc<dyn CheckpointStore>,
    consumer_group: String,
    block: Duration,
    batch: usize,
}

impl RedisStreamsSource {
    pub fn new(
        redis_url: impl AsRef<str>,
        source: impl Into<String>,
        partition_count: u32,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            source: source.into(),
            partitions: (0..partition_count).map(PartitionId::from_index).collect(),
            store,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            block: DEFAULT_BLOCK,
            batch: DEFAULT_BATCH,
        })
    }

    /// Source described by the host configuration's transport section.
    pub fn from_config(
        config: &HostConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(
            &config.transport.url,
            config.transport.source.clone(),
            config.transport.partition_count,
            store,
        )?
        .with_consumer_group(config.consumer_group.clone()))
    }

    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    pub fn with_batch(mut self, batch: usize, block: Duration) -> Self {
        self.batch = batch;
        self.block = block;
        self
    }

    fn stream_key(&self, partition_id: &PartitionId) -> String {
        stream_key(&self.source, partition_id)
    }

    async fn resolve_start_id(
        &self,
        conn: &mut MultiplexedConnection,
        partition_id: &PartitionId,
        start: &StartPosition,
    ) -> Result<String, TransportError> {
        match start {
            StartPosition::Latest => {
                // "$" is only meaningful for a single XREAD; pin the current tail.
                let reply: StreamRangeReply = conn
                    .xrevrange_count(self.stream_key(partition_id), "+", "-", 1)
                    .await
                    .map_err(|e| TransportError::Read(format!("XREVRANGE failed: {e}")))?;
                Ok(reply
                    .ids
                    .first()
                    .map(|entry| entry.id.clone())
                    .unwrap_or_else(|| "0-0".to_string()))
            }
            other => Ok(start_id(other)),
        }
    }
}

fn stream_key(source: &str, partition_id: &PartitionId) -> String {
    format!("{source}:{partition_id}")
}

/// `XREAD` id returning entries strictly after the start position.
fn start_id(start: &StartPosition) -> String {
    match start {
        StartPosition::Earliest => "0-0".to_string(),
        StartPosition::Latest => "$".to_string(),
        StartPosition::EnqueuedAfter(at) => format!("{}-{}", at.timestamp_millis().max(0), u64::MAX),
        StartPosition::After(position) => position.offset.clone(),
        StartPosition::At(position) => preceding_id(&position.offset),
    }
}

/// Largest possible id below `id`, so `XREAD` includes `id` itself.
fn preceding_id(id: &str) -> String {
    match parse_entry_id(id) {
        Ok((ms, seq)) if seq > 0 => format!("{ms}-{}", seq - 1),
        Ok((ms, _)) if ms > 0 => format!("{}-{}", ms - 1, u64::MAX),
        _ => "0-0".to_string(),
    }
}

fn parse_entry_id(id: &str) -> Result<(i64, i64), TransportError> {
    let (ms, seq) = id
        .split_once('-')
        .ok_or_else(|| TransportError::Decode(format!("invalid stream id '{id}'")))?;
    let ms = ms
        .parse::<i64>()
        .map_err(|e| TransportError::Decode(format!("invalid stream id '{id}': {e}")))?;
    let seq = seq
        .parse::<i64>()
        .map_err(|e| TransportError::Decode(format!("invalid stream id '{id}': {e}")))?;
    Ok((ms, seq))
}

fn position_from_id(id: &str) -> Result<EventPosition, TransportError> {
    let (ms, seq) = parse_entry_id(id)?;
    let enqueued_at = DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| TransportError::Decode(format!("stream id '{id}' out of range")))?;
    let sequence_number = (ms << 16) | (seq & 0xFFFF);
    Ok(EventPosition::new(id, sequence_number, enqueued_at))
}

fn parse_entry(partition_id: &PartitionId, entry: &StreamId) -> Result<TransportEvent, TransportError> {
    let position = position_from_id(&entry.id)?;

    let mut body = None;
    let mut properties = BTreeMap::new();
    let mut system_properties = BTreeMap::new();
    for (field, value) in &entry.map {
        if field == BODY_FIELD {
            let bytes: Vec<u8> = redis::from_redis_value(value)
                .map_err(|e| TransportError::Decode(format!("body of '{}': {e}", entry.id)))?;
            body = Some(bytes);
            continue;
        }

        let (target, name) = if let Some(name) = field.strip_prefix(SYSTEM_PROPERTY_PREFIX) {
            (&mut system_properties, name)
        } else if let Some(name) = field.strip_prefix(PROPERTY_PREFIX) {
            (&mut properties, name)
        } else {
            continue;
        };
        let value: String = redis::from_redis_value(value)
            .map_err(|e| TransportError::Decode(format!("field '{field}' of '{}': {e}", entry.id)))?;
        target.insert(name.to_string(), value);
    }

    Ok(TransportEvent {
        partition_id: partition_id.clone(),
        position,
        body: body.ok_or_else(|| TransportError::Decode(format!("entry '{}' has no body", entry.id)))?,
        properties,
        system_properties,
    })
}

#[async_trait]
impl Checkpointer for RedisStreamsSource {
    async fn checkpoint(
        &self,
        partition_id: &PartitionId,
        position: &EventPosition,
    ) -> Result<(), TransportError> {
        self.store
            .save(PartitionCheckpoint {
                consumer_group: self.consumer_group.clone(),
                partition_id: partition_id.clone(),
                position: position.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisStreamsSource {
    async fn stored_checkpoints(&self) -> Result<Vec<PartitionCheckpoint>, TransportError> {
        Ok(self.store.list(&self.consumer_group).await?)
    }

    #[instrument(skip(self, options), fields(source = %self.source), err)]
    async fn open(&self, options: ReadOptions) -> Result<EventStream, TransportError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut keys = Vec::with_capacity(self.partitions.len());
        let mut ids = Vec::with_capacity(self.partitions.len());
        for partition_id in &self.partitions {
            keys.push(self.stream_key(partition_id));
            ids.push(
                self.resolve_start_id(&mut conn, partition_id, &options.start_for(partition_id))
                    .await?,
            );
        }
        debug!(?keys, ?ids, "redis stream reader opened");

        let partitions_by_key: HashMap<String, PartitionId> = keys
            .iter()
            .cloned()
            .zip(self.partitions.iter().cloned())
            .collect();
        let read_options = StreamReadOptions::default()
            .count(self.batch)
            .block(self.block.as_millis() as usize);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let reply: Option<StreamReadReply> =
                    match conn.xread_options(&keys, &ids, &read_options).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            let _ = tx
                                .send(Err(TransportError::Read(format!("XREAD failed: {e}"))))
                                .await;
                            return;
                        }
                    };

                for stream in reply.map(|r| r.keys).unwrap_or_default() {
                    let Some(partition_id) = partitions_by_key.get(&stream.key) else {
                        continue;
                    };
                    let Some(slot) = keys.iter().position(|k| *k == stream.key) else {
                        continue;
                    };

                    for entry in &stream.ids {
                        ids[slot] = entry.id.clone();
                        match parse_entry(partition_id, entry) {
                            Ok(event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(partition = %partition_id, error = %err, "skipping malformed stream entry");
                            }
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, fields: &[(&str, &[u8])]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.to_vec())))
                .collect(),
        }
    }

    #[test]
    fn stream_keys_are_per_partition() {
        assert_eq!(
            stream_key("streamhost:events", &PartitionId::from_index(3)),
            "streamhost:events:3"
        );
    }

    #[test]
    fn start_ids() {
        assert_eq!(start_id(&StartPosition::Earliest), "0-0");

        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        assert_eq!(
            start_id(&StartPosition::EnqueuedAfter(at)),
            format!("1700000000000-{}", u64::MAX)
        );

        let position = EventPosition::new("1700000000000-4", 0, at);
        assert_eq!(start_id(&StartPosition::After(position)), "1700000000000-4");
    }

    #[test]
    fn inclusive_start_reads_from_the_preceding_id() {
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let start = |id: &str| start_id(&StartPosition::At(EventPosition::new(id, 0, at)));

        assert_eq!(start("1700000000000-4"), "1700000000000-3");
        assert_eq!(start("1700000000000-0"), format!("1699999999999-{}", u64::MAX));
        assert_eq!(start("0-0"), "0-0");
    }

    #[test]
    fn positions_increase_with_stream_ids() {
        let a = position_from_id("1700000000000-0").unwrap();
        let b = position_from_id("1700000000000-1").unwrap();
        let c = position_from_id("1700000000001-0").unwrap();

        assert!(a.sequence_number < b.sequence_number);
        assert!(b.sequence_number < c.sequence_number);
        assert_eq!(a.enqueued_at.timestamp_millis(), 1_700_000_000_000);
        assert!(position_from_id("garbage").is_err());
    }

    #[test]
    fn entry_fields_split_into_namespaces() {
        let event = parse_entry(
            &PartitionId::from_index(0),
            &entry(
                "1700000000000-2",
                &[
                    ("body", b"{\"t\":21}"),
                    ("prop.to", b"site/room1/temp"),
                    ("sys.iothub-connection-device-id", b"dev-1"),
                    ("ignored", b"x"),
                ],
            ),
        )
        .unwrap();

        assert_eq!(event.body, b"{\"t\":21}");
        assert_eq!(event.properties.get("to").map(String::as_str), Some("site/room1/temp"));
        assert_eq!(
            event
                .system_properties
                .get("iothub-connection-device-id")
                .map(String::as_str),
            Some("dev-1")
        );
        assert_eq!(event.properties.len() + event.system_properties.len(), 2);
    }

    #[test]
    fn entry_without_body_is_malformed() {
        let err = parse_entry(&PartitionId::from_index(0), &entry("1-0", &[("prop.a", b"b")]))
            .unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }
}
