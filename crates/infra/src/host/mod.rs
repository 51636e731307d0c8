//! Ingestion host.
//!
//! Reads a partitioned event source, resolves routing metadata, fans each
//! message out through a [`SubscriptionRegistry`], and checkpoints progress.
//!
//! ## Modes
//!
//! The mode is chosen once, at [`IngestionHostBuilder::build`]:
//!
//! - **Direct** (no lease store configured): one reader over every partition
//!   via an [`EventSource`]. Read failures reconnect after
//!   `reconnect_delay`; partitions resume after their last checkpoint,
//!   including checkpoints stored by an earlier run.
//! - **Distributed** (lease store configured): a [`PartitionCoordinator`]
//!   assigns partitions and calls back into the host. If it stops on an
//!   error the host restarts it (`Restarting`).
//!
//! ## Lifecycle
//!
//! `Starting → RunningDirect | RunningDistributed → (Restarting →
//! RunningDistributed)* → Stopping → Stopped`.
//!
//! Delivery is at-least-once per partition. Handlers see duplicates after a
//! reconnect or restart and must be idempotent.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span};

use streamhost_core::HostId;
use streamhost_events::{CheckpointPolicy, SubscriptionRegistry};

use crate::config::{ConfigError, HostConfig};
use crate::transport::{Checkpointer, EventSource, PartitionCoordinator};

mod direct;
mod dispatch;
mod distributed;
mod shutdown;
mod stats;

pub use shutdown::ShutdownSignal;
pub use stats::{HostStats, HostStatsSnapshot};

use direct::run_direct;
use dispatch::Dispatcher;
use distributed::{HostProcessor, run_distributed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Starting,
    RunningDirect,
    RunningDistributed,
    Restarting,
    Stopping,
    Stopped,
}

impl core::fmt::Display for HostState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            HostState::Starting => "starting",
            HostState::RunningDirect => "running_direct",
            HostState::RunningDistributed => "running_distributed",
            HostState::Restarting => "restarting",
            HostState::Stopping => "stopping",
            HostState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How the host reads partitions.
pub enum HostMode {
    Direct {
        source: Arc<dyn EventSource>,
        checkpointer: Arc<dyn Checkpointer>,
    },
    Distributed {
        coordinator: Arc<dyn PartitionCoordinator>,
        checkpointer: Arc<dyn Checkpointer>,
    },
}

impl HostMode {
    pub fn name(&self) -> &'static str {
        match self {
            HostMode::Direct { .. } => "direct",
            HostMode::Distributed { .. } => "distributed",
        }
    }
}

impl core::fmt::Debug for HostMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Default)]
pub struct IngestionHostBuilder {
    config: HostConfig,
    id: Option<HostId>,
    registry: Option<SubscriptionRegistry>,
    source: Option<(Arc<dyn EventSource>, Arc<dyn Checkpointer>)>,
    coordinator: Option<(Arc<dyn PartitionCoordinator>, Arc<dyn Checkpointer>)>,
    shutdown: Option<ShutdownSignal>,
}

impl IngestionHostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn id(mut self, id: HostId) -> Self {
        self.id = Some(id);
        self
    }

    /// Registry to dispatch through (a fresh one otherwise).
    pub fn registry(mut self, registry: SubscriptionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Transport for direct mode.
    pub fn event_source<S>(mut self, source: Arc<S>) -> Self
    where
        S: EventSource + 'static,
    {
        let checkpointer: Arc<dyn Checkpointer> = source.clone();
        let source: Arc<dyn EventSource> = source;
        self.source = Some((source, checkpointer));
        self
    }

    /// Transport for distributed mode.
    pub fn coordinator<C>(mut self, coordinator: Arc<C>) -> Self
    where
        C: PartitionCoordinator + 'static,
    {
        let checkpointer: Arc<dyn Checkpointer> = coordinator.clone();
        let coordinator: Arc<dyn PartitionCoordinator> = coordinator;
        self.coordinator = Some((coordinator, checkpointer));
        self
    }

    /// Share an externally owned cancellation signal.
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Validate the configuration and pick the mode.
    pub fn build(self) -> Result<IngestionHost, ConfigError> {
        self.config.validate()?;

        let mode = if self.config.is_distributed() {
            let (coordinator, checkpointer) =
                self.coordinator.ok_or(ConfigError::MissingCoordinator)?;
            HostMode::Distributed {
                coordinator,
                checkpointer,
            }
        } else {
            let (source, checkpointer) = self.source.ok_or(ConfigError::MissingEventSource)?;
            HostMode::Direct {
                source,
                checkpointer,
            }
        };

        Ok(IngestionHost {
            id: self.id.unwrap_or_default(),
            config: Arc::new(self.config),
            registry: self.registry.unwrap_or_default(),
            mode,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

/// A configured, not yet running host.
#[derive(Debug)]
pub struct IngestionHost {
    id: HostId,
    config: Arc<HostConfig>,
    registry: SubscriptionRegistry,
    mode: HostMode,
    shutdown: ShutdownSignal,
}

impl IngestionHost {
    pub fn builder(config: HostConfig) -> IngestionHostBuilder {
        IngestionHostBuilder::new(config)
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn mode(&self) -> &HostMode {
        &self.mode
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Registry messages are dispatched through; subscribe here.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Spawn the read loop on the current tokio runtime.
    pub fn start(self) -> HostHandle {
        let IngestionHost {
            id,
            config,
            registry,
            mode,
            shutdown,
        } = self;

        let stats = Arc::new(HostStats::new());
        let (state_tx, state_rx) = watch::channel(HostState::Starting);
        let policy = CheckpointPolicy::new(config.checkpoint_interval);

        let run = {
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            async move {
                info!(mode = mode.name(), consumer_group = %config.consumer_group, "ingestion host starting");
                match mode {
                    HostMode::Direct {
                        source,
                        checkpointer,
                    } => {
                        let dispatcher = Arc::new(Dispatcher::new(
                            registry,
                            checkpointer,
                            policy,
                            stats.clone(),
                            shutdown.clone(),
                        ));
                        state_tx.send_replace(HostState::RunningDirect);
                        run_direct(source, dispatcher, config, shutdown, stats).await;
                        state_tx.send_replace(HostState::Stopping);
                    }
                    HostMode::Distributed {
                        coordinator,
                        checkpointer,
                    } => {
                        let dispatcher = Arc::new(Dispatcher::new(
                            registry,
                            checkpointer,
                            policy,
                            stats.clone(),
                            shutdown.clone(),
                        ));
                        let processor = Arc::new(HostProcessor::new(
                            dispatcher,
                            config.clone(),
                            Arc::downgrade(&coordinator),
                            shutdown.clone(),
                        ));
                        run_distributed(coordinator, processor, config, &state_tx, shutdown, stats)
                            .await;
                    }
                }
                state_tx.send_replace(HostState::Stopped);
                info!("ingestion host stopped");
            }
        };

        let join = tokio::spawn(run.instrument(info_span!("ingestion_host", host_id = %id)));

        HostHandle {
            id,
            state: state_rx,
            stats,
            shutdown,
            join: Some(join),
        }
    }
}

/// Control handle of a running host.
///
/// Dropping the handle requests shutdown without waiting for it.
#[derive(Debug)]
pub struct HostHandle {
    id: HostId,
    state: watch::Receiver<HostState>,
    stats: Arc<HostStats>,
    shutdown: ShutdownSignal,
    join: Option<JoinHandle<()>>,
}

impl HostHandle {
    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Wait until the host reaches `target`. Returns `false` if the host
    /// stopped without ever reaching it.
    pub async fn wait_for_state(&self, target: HostState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }

    pub fn stats(&self) -> HostStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Request cancellation and wait for the read loop to finish.
    ///
    /// A panicked loop is logged, not propagated.
    pub async fn shutdown(mut self) {
        self.shutdown.trigger();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(host_id = %self.id, error = %err, "ingestion host task failed");
            }
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
