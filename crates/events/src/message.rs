use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use streamhost_core::{EventPosition, PartitionId};

/// A message ready for fan-out to subscribers.
///
/// Built by the host from one transport event after routing metadata has been
/// resolved; immutable and discarded once every matched handler finished.
///
/// Notes:
/// - `target` is the topic matched against subscriber filters.
/// - `properties` is the merged view of the transport's property namespaces
///   (platform/system properties win over application properties on collision).
/// - Delivery is at-least-once: the same `(partition_id, position)` may be seen
///   again after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    target: String,
    payload: Vec<u8>,
    content_type: String,
    content_encoding: String,
    properties: BTreeMap<String, String>,

    partition_id: PartitionId,
    position: EventPosition,
}

impl InboundMessage {
    pub fn new(
        target: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
        properties: BTreeMap<String, String>,
        partition_id: PartitionId,
        position: EventPosition,
    ) -> Self {
        Self {
            target: target.into(),
            payload,
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            properties,
            partition_id,
            position,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    pub fn position(&self) -> &EventPosition {
        &self.position
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.position.enqueued_at
    }

    /// Payload decoded as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
