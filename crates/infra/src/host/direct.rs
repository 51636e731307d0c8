//! Direct mode: one reader across all partitions, reconnect-and-resume.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{info, warn};

use streamhost_core::{PartitionCheckpoint, PartitionId, StartPosition};

use super::dispatch::{Dispatcher, Outcome};
use super::shutdown::ShutdownSignal;
use super::stats::HostStats;
use crate::config::HostConfig;
use crate::transport::{EventSource, ReadOptions};

/// Runs until `shutdown` fires. Read failures never end the loop: the stream
/// is reopened after `reconnect_delay`.
///
/// Partition start positions, first match wins:
/// 1. this reader's own cursor (after its checkpoint, or at its first
///    received event when nothing was persisted yet);
/// 2. the checkpoint stored before the host started, subject to the lookback;
/// 3. the configured default start.
///
/// On exit, progress that was processed but not yet checkpointed is flushed.
pub(crate) async fn run_direct(
    source: Arc<dyn EventSource>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<HostConfig>,
    shutdown: ShutdownSignal,
    stats: Arc<HostStats>,
) {
    let mut stored: Option<HashMap<PartitionId, StartPosition>> = None;

    'reconnect: loop {
        if stored.is_none() {
            let loaded = tokio::select! {
                biased;
                _ = shutdown.triggered() => break 'reconnect,
                loaded = source.stored_checkpoints() => loaded,
            };
            match loaded {
                Ok(checkpoints) => {
                    info!(stored_checkpoints = checkpoints.len(), "checkpoints loaded");
                    stored = Some(stored_starts(&dispatcher, &config, checkpoints));
                }
                Err(err) => warn!(error = %err, "failed to load checkpoints; retrying"),
            }
        }

        if let Some(stored) = &stored {
            let mut options = ReadOptions::new(config.default_start_position(Utc::now()));
            options.starts.extend(stored.clone());
            let resumed = dispatcher.resume_starts();
            let resumed_partitions = resumed.len();
            options.starts.extend(resumed);

            let opened = tokio::select! {
                biased;
                _ = shutdown.triggered() => break 'reconnect,
                opened = source.open(options) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    info!(resumed_partitions, "event source opened");
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = shutdown.triggered() => break 'reconnect,
                            next = stream.next() => next,
                        };

                        match next {
                            Some(Ok(event)) => {
                                if dispatcher.process(event).await == Outcome::Cancelled {
                                    break 'reconnect;
                                }
                            }
                            Some(Err(err)) => {
                                warn!(error = %err, "read failed; reconnecting");
                                break;
                            }
                            None => {
                                warn!("event stream ended; reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to open event source; retrying");
                }
            }
        }

        stats.record_reconnect();
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break 'reconnect,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    dispatcher.flush().await;
    info!("direct reader stopped");
}

/// Start positions from checkpoints persisted by an earlier run.
///
/// Partitions that resume after their checkpoint also get a cursor, so a
/// reconnect keeps resuming from there until a newer checkpoint lands.
fn stored_starts(
    dispatcher: &Dispatcher,
    config: &HostConfig,
    checkpoints: Vec<PartitionCheckpoint>,
) -> HashMap<PartitionId, StartPosition> {
    let now = Utc::now();
    checkpoints
        .into_iter()
        .map(|checkpoint| {
            let start = config.opening_position(Some(&checkpoint.position), now);
            if matches!(start, StartPosition::After(_)) {
                dispatcher.open_partition(&checkpoint.partition_id, Some(checkpoint.position));
            }
            (checkpoint.partition_id, start)
        })
        .collect()
}
