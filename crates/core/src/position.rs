//! Positions within a partition and where a reader starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::PartitionId;

/// Position of a single event inside a partition.
///
/// - `offset` is the transport's own cursor (e.g. a Redis stream entry id).
/// - `sequence_number` increases monotonically per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    pub offset: String,
    pub sequence_number: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl EventPosition {
    pub fn new(offset: impl Into<String>, sequence_number: i64, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
            enqueued_at,
        }
    }
}

/// Where a partition reader begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest retained event.
    Earliest,
    /// Only events enqueued after the reader opens.
    Latest,
    /// First event enqueued strictly after the given instant.
    EnqueuedAfter(DateTime<Utc>),
    /// First event after the given (already processed) position.
    After(EventPosition),
    /// The given position itself, then everything after it.
    At(EventPosition),
}

/// Durable progress marker for one partition of one consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub consumer_group: String,
    pub partition_id: PartitionId,
    pub position: EventPosition,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_serializes_snake_case() {
        let json = serde_json::to_string(&StartPosition::Earliest).unwrap();
        assert_eq!(json, "\"earliest\"");
    }

    #[test]
    fn inclusive_start_round_trips() {
        let start = StartPosition::At(EventPosition::new("3", 3, Utc::now()));
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.starts_with("{\"at\":"));
        assert_eq!(serde_json::from_str::<StartPosition>(&json).unwrap(), start);
    }
}
