//! Distributed mode: an external coordinator owns partition assignment.
//!
//! The host only reacts to callbacks. When the coordinator reports an error
//! and is no longer running, the host stops and restarts it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use streamhost_core::{PartitionCheckpoint, PartitionId, StartPosition};

use super::HostState;
use super::dispatch::Dispatcher;
use super::shutdown::ShutdownSignal;
use super::stats::HostStats;
use crate::config::HostConfig;
use crate::transport::{
    CloseReason, PartitionCoordinator, PartitionProcessor, ProcessorError, TransportEvent,
};

pub(crate) struct HostProcessor {
    dispatcher: Arc<Dispatcher>,
    config: Arc<HostConfig>,
    coordinator: Weak<dyn PartitionCoordinator>,
    shutdown: ShutdownSignal,
    restart: Notify,
}

impl HostProcessor {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        config: Arc<HostConfig>,
        coordinator: Weak<dyn PartitionCoordinator>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            dispatcher,
            config,
            coordinator,
            shutdown,
            restart: Notify::new(),
        }
    }

    fn coordinator_running(&self) -> bool {
        self.coordinator
            .upgrade()
            .is_some_and(|coordinator| coordinator.is_running())
    }
}

#[async_trait]
impl PartitionProcessor for HostProcessor {
    async fn on_partition_opening(
        &self,
        partition_id: &PartitionId,
        checkpoint: Option<&PartitionCheckpoint>,
    ) -> StartPosition {
        let checkpointed = checkpoint.map(|c| c.position.clone());
        let start = self
            .config
            .opening_position(checkpointed.as_ref(), Utc::now());
        self.dispatcher.open_partition(partition_id, checkpointed);

        info!(partition = %partition_id, start = ?start, "partition opened");
        start
    }

    async fn on_partition_closing(&self, partition_id: &PartitionId, reason: CloseReason) {
        info!(partition = %partition_id, reason = ?reason, "partition closing");
        // After ownership loss another host may already be writing checkpoints.
        if reason == CloseReason::Shutdown {
            self.dispatcher.flush_partition(partition_id).await;
        }
        self.dispatcher.close_partition(partition_id);
    }

    async fn on_event(&self, event: TransportEvent) {
        self.dispatcher.process(event).await;
    }

    async fn on_error(&self, error: ProcessorError) {
        warn!(
            partition = ?error.partition_id.as_ref().map(PartitionId::as_str),
            operation = %error.operation,
            error = %error.error,
            "partition processor error"
        );

        if self.shutdown.is_triggered() || self.coordinator_running() {
            return;
        }
        self.restart.notify_one();
    }
}

pub(crate) async fn run_distributed(
    coordinator: Arc<dyn PartitionCoordinator>,
    processor: Arc<HostProcessor>,
    config: Arc<HostConfig>,
    state: &watch::Sender<HostState>,
    shutdown: ShutdownSignal,
    stats: Arc<HostStats>,
) {
    'host: loop {
        let started = tokio::select! {
            biased;
            _ = shutdown.triggered() => break 'host,
            started = coordinator.start(processor.clone()) => started,
        };

        if let Err(err) = started {
            warn!(error = %err, "failed to start partition coordinator; retrying");
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break 'host,
                _ = tokio::time::sleep(config.reconnect_delay) => continue 'host,
            }
        }

        state.send_replace(HostState::RunningDistributed);
        info!("partition coordinator started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break 'host,
                _ = processor.restart.notified() => {}
            }
            if !coordinator.is_running() {
                break;
            }
            debug!("ignoring restart request; coordinator is running");
        }

        state.send_replace(HostState::Restarting);
        stats.record_restart();
        warn!("partition coordinator stopped unexpectedly; restarting");
        if let Err(err) = coordinator.stop().await {
            warn!(error = %err, "stopping coordinator before restart failed");
        }
    }

    state.send_replace(HostState::Stopping);
    match tokio::time::timeout(config.stop_timeout, coordinator.stop()).await {
        Ok(Ok(())) => info!("partition coordinator stopped"),
        Ok(Err(err)) => warn!(error = %err, "partition coordinator stop failed"),
        Err(_) => warn!(
            timeout_ms = config.stop_timeout.as_millis() as u64,
            "partition coordinator did not stop in time"
        ),
    }
}
