//! Process wiring for the `streamhost` binary.
//!
//! Picks a checkpoint store from the environment, reads device telemetry from
//! Redis streams and logs every routed message. Applications embedding the
//! host register their own handlers on [`IngestionHost::registry`] instead.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use streamhost_events::routing::names;
use streamhost_events::{
    InboundMessage, InvalidFilterError, MessageHandler, SubscriptionHandle, SubscriptionRegistry,
};
use streamhost_infra::checkpoint_store::RedisCheckpointStore;
use streamhost_infra::transport::RedisStreamsSource;
use streamhost_infra::{
    CheckpointStore, HostConfig, HostStatsSnapshot, InMemoryCheckpointStore, IngestionHost,
    PostgresCheckpointStore,
};

/// Filter used when no subscriptions are configured.
pub const DEFAULT_SUBSCRIPTION: &str = "#";

/// Where partition checkpoints are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointBackend {
    Postgres { url: String },
    Redis { url: String },
    Memory,
}

impl CheckpointBackend {
    /// `DATABASE_URL` selects Postgres. Otherwise
    /// `STREAMHOST_CHECKPOINT_STORE=redis` stores checkpoints next to the
    /// streams. Anything else keeps them in memory.
    pub fn from_lookup<F>(config: &HostConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            return CheckpointBackend::Postgres { url };
        }
        match lookup("STREAMHOST_CHECKPOINT_STORE").as_deref() {
            Some("redis") => CheckpointBackend::Redis {
                url: config.transport.url.clone(),
            },
            _ => CheckpointBackend::Memory,
        }
    }

    pub fn from_env(config: &HostConfig) -> Self {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckpointBackend::Postgres { .. } => "postgres",
            CheckpointBackend::Redis { .. } => "redis",
            CheckpointBackend::Memory => "memory",
        }
    }

    pub async fn connect(&self) -> anyhow::Result<Arc<dyn CheckpointStore>> {
        match self {
            CheckpointBackend::Postgres { url } => {
                let pool = PgPool::connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                let store = PostgresCheckpointStore::new(pool);
                store
                    .ensure_schema()
                    .await
                    .context("failed to create checkpoint table")?;
                Ok(Arc::new(store))
            }
            CheckpointBackend::Redis { url } => Ok(Arc::new(RedisCheckpointStore::new(url)?)),
            CheckpointBackend::Memory => {
                warn!("no durable checkpoint store configured; progress is lost on restart");
                Ok(Arc::new(InMemoryCheckpointStore::new()))
            }
        }
    }
}

/// Logs every message it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        let device_id = message
            .property(names::PLATFORM_DEVICE_ID)
            .or_else(|| message.property(names::DEVICE_ID))
            .unwrap_or_default();
        info!(
            topic = message.target(),
            device_id,
            partition = %message.partition_id(),
            sequence_number = message.position().sequence_number,
            content_type = message.content_type(),
            enqueued_at = %message.enqueued_at(),
            bytes = message.payload().len(),
            "message received"
        );
        if let Some(payload) = message.payload_str() {
            debug!(topic = message.target(), payload, "message payload");
        }
        Ok(())
    }
}

/// Subscribe a [`LoggingHandler`] to each filter, or to
/// [`DEFAULT_SUBSCRIPTION`] when `filters` is empty.
pub fn subscribe_logging(
    registry: &SubscriptionRegistry,
    filters: &[String],
) -> Result<Vec<SubscriptionHandle>, InvalidFilterError> {
    if filters.is_empty() {
        return Ok(vec![registry.subscribe(DEFAULT_SUBSCRIPTION, LoggingHandler)?]);
    }
    filters
        .iter()
        .map(|filter| registry.subscribe(filter, LoggingHandler))
        .collect()
}

/// Run a direct-mode host over Redis streams until `shutdown` resolves.
///
/// Returns the host's counters at shutdown.
pub async fn run<F>(
    config: HostConfig,
    store: Arc<dyn CheckpointStore>,
    shutdown: F,
) -> anyhow::Result<HostStatsSnapshot>
where
    F: Future<Output = ()>,
{
    if config.is_distributed() {
        bail!(
            "lease store configured but no partition coordinator is available; \
             unset STREAMHOST_LEASE_STORE_URL to run in direct mode"
        );
    }

    let source = RedisStreamsSource::from_config(&config, store)?;
    let filters = config.subscriptions.clone();
    let host = IngestionHost::builder(config)
        .event_source(Arc::new(source))
        .build()?;
    let _subscriptions = subscribe_logging(host.registry(), &filters)?;

    let handle = host.start();
    info!(host_id = %handle.id(), "streamhost running");

    shutdown.await;
    info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await;
    info!(
        events_received = stats.events_received,
        messages_dispatched = stats.messages_dispatched,
        checkpoints_written = stats.checkpoints_written,
        "streamhost stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use chrono::Utc;
    use streamhost_core::{EventPosition, PartitionId};
    use streamhost_infra::LeaseStoreConfig;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn database_url_selects_postgres() {
        let config = HostConfig::default();
        let backend = CheckpointBackend::from_lookup(
            &config,
            lookup(&[
                ("DATABASE_URL", "postgres://localhost/streamhost"),
                ("STREAMHOST_CHECKPOINT_STORE", "redis"),
            ]),
        );
        assert_eq!(
            backend,
            CheckpointBackend::Postgres {
                url: "postgres://localhost/streamhost".to_string()
            }
        );
    }

    #[test]
    fn redis_backend_reuses_transport_url() {
        let config = HostConfig::default();
        let backend = CheckpointBackend::from_lookup(
            &config,
            lookup(&[("STREAMHOST_CHECKPOINT_STORE", "redis")]),
        );
        assert_eq!(
            backend,
            CheckpointBackend::Redis {
                url: config.transport.url.clone()
            }
        );
        assert_eq!(
            CheckpointBackend::from_lookup(&config, lookup(&[])).name(),
            "memory"
        );
    }

    #[test]
    fn empty_subscription_list_subscribes_to_everything() {
        let registry = SubscriptionRegistry::new();
        let handles = subscribe_logging(&registry, &[]).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(registry.filters(), vec![DEFAULT_SUBSCRIPTION.to_string()]);
    }

    #[test]
    fn configured_filters_are_each_subscribed() {
        let registry = SubscriptionRegistry::new();
        let filters = vec!["devices/#".to_string(), "site/+/temp".to_string()];
        let handles = subscribe_logging(&registry, &filters).unwrap();
        assert_eq!(handles.len(), 2);

        drop(handles);
        assert!(registry.is_empty());

        assert!(subscribe_logging(&registry, &["a/#/b".to_string()]).is_err());
    }

    #[tokio::test]
    async fn logging_handler_accepts_any_message() {
        let mut properties = BTreeMap::new();
        properties.insert(names::DEVICE_ID.to_string(), "dev-1".to_string());
        let message = InboundMessage::new(
            "devices/dev-1/messages/events",
            b"{}".to_vec(),
            "application/json",
            "utf-8",
            properties,
            PartitionId::from_index(0),
            EventPosition::new("0", 0, Utc::now()),
        );
        LoggingHandler.handle(&message).await.unwrap();
    }

    #[tokio::test]
    async fn distributed_configuration_is_rejected() {
        let config = HostConfig::default().with_lease_store(LeaseStoreConfig {
            connection_string: "leases".to_string(),
            container: "leases".to_string(),
        });
        let err = run(config, Arc::new(InMemoryCheckpointStore::new()), async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no partition coordinator"));
    }
}
