//! Per-partition progress tracking and checkpoint cadence.
//!
//! A [`PartitionCursor`] is owned by exactly one reader loop; it is never
//! shared. The [`CheckpointPolicy`] decides from the cursor alone whether
//! progress should be persisted now:
//!
//! - always on the first evaluation of a cursor that was never checkpointed
//! - afterwards, once the elapsed time since the last checkpoint reaches the
//!   configured interval
//!
//! Recording a checkpoint resets the elapsed-time accumulator.
//!
//! A reader reopening the partition resumes after the checkpointed position,
//! or at the first event the cursor received if nothing was persisted yet.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use streamhost_core::{EventPosition, PartitionId, StartPosition};

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(5000);

/// Progress of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    partition_id: PartitionId,
    elapsed: Duration,
    last_observed_at: Option<Instant>,
    last_checkpoint_at: Option<DateTime<Utc>>,
    first_received: Option<EventPosition>,
    last_position: Option<EventPosition>,
    checkpointed_position: Option<EventPosition>,
}

impl PartitionCursor {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            elapsed: Duration::ZERO,
            last_observed_at: None,
            last_checkpoint_at: None,
            first_received: None,
            last_position: None,
            checkpointed_position: None,
        }
    }

    /// Cursor for a partition that resumes from a persisted checkpoint.
    ///
    /// The first evaluation still checkpoints: nothing was persisted by this
    /// reader yet.
    pub fn resumed(partition_id: PartitionId, checkpointed: EventPosition) -> Self {
        Self {
            checkpointed_position: Some(checkpointed),
            ..Self::new(partition_id)
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Time accumulated since the last checkpoint.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn last_checkpoint_at(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint_at
    }

    /// Whether this cursor has recorded a checkpoint.
    pub fn is_checkpointed(&self) -> bool {
        self.last_checkpoint_at.is_some()
    }

    /// Last position handed to [`observe`](Self::observe).
    pub fn last_position(&self) -> Option<&EventPosition> {
        self.last_position.as_ref()
    }

    /// Last position known to be durably persisted.
    pub fn checkpointed_position(&self) -> Option<&EventPosition> {
        self.checkpointed_position.as_ref()
    }

    /// Whether processed progress has not been persisted yet.
    pub fn has_unpersisted_progress(&self) -> bool {
        self.last_position.is_some() && self.last_position != self.checkpointed_position
    }

    /// Note that an event arrived, whether or not it ends up processed.
    pub fn mark_received(&mut self, position: &EventPosition) {
        if self.first_received.is_none() {
            self.first_received = Some(position.clone());
        }
    }

    pub fn resume_start(&self) -> Option<StartPosition> {
        match (&self.checkpointed_position, &self.first_received) {
            (Some(checkpointed), _) => Some(StartPosition::After(checkpointed.clone())),
            (None, Some(first)) => Some(StartPosition::At(first.clone())),
            (None, None) => None,
        }
    }

    /// Add elapsed time directly.
    pub fn advance(&mut self, by: Duration) {
        self.elapsed = self.elapsed.saturating_add(by);
    }

    /// Record that `position` was processed at `now`.
    ///
    /// Accumulates the wall time since the previous observation.
    pub fn observe(&mut self, position: EventPosition, now: Instant) {
        if let Some(previous) = self.last_observed_at {
            self.advance(now.saturating_duration_since(previous));
        }
        self.last_observed_at = Some(now);
        self.last_position = Some(position);
    }
}

/// Time-based checkpoint cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    interval: Duration,
}

impl CheckpointPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_checkpoint(&self, cursor: &PartitionCursor) -> bool {
        !cursor.is_checkpointed() || cursor.elapsed >= self.interval
    }

    /// Mark the cursor's last observed position as persisted.
    pub fn record_checkpoint(&self, cursor: &mut PartitionCursor) {
        cursor.elapsed = Duration::ZERO;
        cursor.last_checkpoint_at = Some(Utc::now());
        if let Some(position) = cursor.last_position.clone() {
            cursor.checkpointed_position = Some(position);
        }
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(seq: i64) -> EventPosition {
        EventPosition::new(seq.to_string(), seq, Utc::now())
    }

    fn cursor() -> PartitionCursor {
        PartitionCursor::new(PartitionId::from_index(0))
    }

    #[test]
    fn fresh_cursor_checkpoints_on_first_evaluation() {
        let policy = CheckpointPolicy::default();
        assert!(policy.should_checkpoint(&cursor()));
    }

    #[test]
    fn not_due_right_after_recording() {
        let policy = CheckpointPolicy::default();
        let mut c = cursor();
        c.observe(position(1), Instant::now());
        policy.record_checkpoint(&mut c);
        assert!(!policy.should_checkpoint(&c));
        assert_eq!(c.elapsed(), Duration::ZERO);
        assert_eq!(c.checkpointed_position().map(|p| p.sequence_number), Some(1));
    }

    #[test]
    fn due_again_once_interval_elapsed() {
        let policy = CheckpointPolicy::new(Duration::from_millis(5000));
        let mut c = cursor();
        policy.record_checkpoint(&mut c);

        c.advance(Duration::from_millis(4999));
        assert!(!policy.should_checkpoint(&c));

        c.advance(Duration::from_millis(1));
        assert!(policy.should_checkpoint(&c));

        policy.record_checkpoint(&mut c);
        assert!(!policy.should_checkpoint(&c));
    }

    #[test]
    fn observe_accumulates_time_between_events() {
        let policy = CheckpointPolicy::new(Duration::from_secs(5));
        let mut c = cursor();
        let t0 = Instant::now();
        c.observe(position(1), t0);
        policy.record_checkpoint(&mut c);

        c.observe(position(2), t0 + Duration::from_secs(3));
        assert!(!policy.should_checkpoint(&c));

        c.observe(position(3), t0 + Duration::from_secs(6));
        assert!(policy.should_checkpoint(&c));
        assert_eq!(c.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn resume_start_prefers_checkpoint_then_first_received() {
        let policy = CheckpointPolicy::default();
        let mut c = cursor();
        assert_eq!(c.resume_start(), None);

        c.mark_received(&position(4));
        c.mark_received(&position(5));
        assert!(matches!(
            c.resume_start(),
            Some(StartPosition::At(p)) if p.sequence_number == 4
        ));

        c.observe(position(5), Instant::now());
        assert!(c.has_unpersisted_progress());
        policy.record_checkpoint(&mut c);
        assert!(!c.has_unpersisted_progress());
        assert!(matches!(
            c.resume_start(),
            Some(StartPosition::After(p)) if p.sequence_number == 5
        ));
    }

    #[test]
    fn resumed_cursor_keeps_checkpointed_position_but_is_due() {
        let policy = CheckpointPolicy::default();
        let c = PartitionCursor::resumed(PartitionId::from_index(1), position(9));
        assert!(policy.should_checkpoint(&c));
        assert_eq!(c.checkpointed_position().map(|p| p.sequence_number), Some(9));
    }
}
