//! Host configuration.
//!
//! Loaded from the environment (`STREAMHOST_*`, plus the conventional
//! `REDIS_URL`) or deserialized from any serde format. Durations are
//! expressed in milliseconds on the wire.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use streamhost_core::{EventPosition, StartPosition};
use streamhost_events::{DEFAULT_CHECKPOINT_INTERVAL, TopicFilter};

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("direct mode requires an event source")]
    MissingEventSource,

    #[error("a lease store is configured but no partition coordinator was provided")]
    MissingCoordinator,
}

/// External lease store used for multi-consumer load balancing.
///
/// Its presence selects distributed mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStoreConfig {
    pub connection_string: String,
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    /// Event source name (stream key prefix for Redis).
    pub source: String,
    pub partition_count: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            source: "streamhost:events".to_string(),
            partition_count: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    #[serde(with = "millis")]
    pub checkpoint_interval: Duration,
    /// Start from the oldest retained event when no checkpoint exists.
    pub read_from_start: bool,
    /// Lookback bound applied when no checkpoint exists (and to stale ones).
    #[serde(with = "opt_millis")]
    pub skip_events_older_than: Option<Duration>,
    pub lease_store: Option<LeaseStoreConfig>,
    pub consumer_group: String,
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    #[serde(with = "millis")]
    pub stop_timeout: Duration,
    pub transport: TransportConfig,
    /// Topic filters the server binary subscribes to.
    pub subscriptions: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            read_from_start: false,
            skip_events_older_than: None,
            lease_store: None,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            transport: TransportConfig::default(),
            subscriptions: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_read_from_start(mut self, read_from_start: bool) -> Self {
        self.read_from_start = read_from_start;
        self
    }

    pub fn with_skip_events_older_than(mut self, lookback: Duration) -> Self {
        self.skip_events_older_than = Some(lookback);
        self
    }

    pub fn with_lease_store(mut self, lease_store: LeaseStoreConfig) -> Self {
        self.lease_store = Some(lease_store);
        self
    }

    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_subscription(mut self, filter: impl Into<String>) -> Self {
        self.subscriptions.push(filter.into());
        self
    }

    pub fn is_distributed(&self) -> bool {
        self.lease_store.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval.is_zero() {
            return Err(invalid("checkpoint_interval", "must be greater than zero"));
        }
        if self.skip_events_older_than.is_some_and(|d| d.is_zero()) {
            return Err(invalid("skip_events_older_than", "must be greater than zero"));
        }
        if self.stop_timeout.is_zero() {
            return Err(invalid("stop_timeout", "must be greater than zero"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(invalid("consumer_group", "must not be empty"));
        }
        if self.transport.partition_count == 0 {
            return Err(invalid("transport.partition_count", "must be at least 1"));
        }
        if let Some(lease_store) = &self.lease_store {
            if lease_store.connection_string.trim().is_empty() {
                return Err(invalid("lease_store.connection_string", "must not be empty"));
            }
        }
        for filter in &self.subscriptions {
            TopicFilter::parse(filter)
                .map_err(|e| invalid("subscriptions", format!("'{filter}': {e}")))?;
        }
        Ok(())
    }

    /// Lower bound on enqueue time, if a lookback is configured.
    pub fn lookback_bound(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let lookback = chrono::Duration::from_std(self.skip_events_older_than?).ok()?;
        now.checked_sub_signed(lookback)
    }

    /// Start position for a partition with no checkpoint.
    pub fn default_start_position(&self, now: DateTime<Utc>) -> StartPosition {
        if self.read_from_start {
            return StartPosition::Earliest;
        }
        match self.skip_events_older_than {
            Some(_) => match self.lookback_bound(now) {
                Some(bound) => StartPosition::EnqueuedAfter(bound),
                None => StartPosition::Earliest,
            },
            None => StartPosition::Latest,
        }
    }

    /// Start position for a partition being opened, given its stored checkpoint.
    ///
    /// A checkpoint older than the lookback bound is skipped forward to it.
    pub fn opening_position(
        &self,
        checkpoint: Option<&EventPosition>,
        now: DateTime<Utc>,
    ) -> StartPosition {
        let Some(position) = checkpoint else {
            return self.default_start_position(now);
        };
        match self.lookback_bound(now) {
            Some(bound) if position.enqueued_at < bound => StartPosition::EnqueuedAfter(bound),
            _ => StartPosition::After(position.clone()),
        }
    }

    /// Load from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMHOST_CHECKPOINT_INTERVAL_MS")? {
            config.checkpoint_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_var::<bool>(&lookup, "STREAMHOST_READ_FROM_START")? {
            config.read_from_start = flag;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STREAMHOST_SKIP_EVENTS_OLDER_THAN_SECS")? {
            config.skip_events_older_than = Some(Duration::from_secs(secs));
        }
        if let Some(connection_string) = lookup("STREAMHOST_LEASE_STORE_URL") {
            config.lease_store = Some(LeaseStoreConfig {
                connection_string,
                container: lookup("STREAMHOST_LEASE_STORE_CONTAINER")
                    .unwrap_or_else(|| "streamhost-leases".to_string()),
            });
        }
        if let Some(group) = lookup("STREAMHOST_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMHOST_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "STREAMHOST_STOP_TIMEOUT_SECS")? {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(url) = lookup("STREAMHOST_TRANSPORT_URL").or_else(|| lookup("REDIS_URL")) {
            config.transport.url = url;
        }
        if let Some(source) = lookup("STREAMHOST_SOURCE") {
            config.transport.source = source;
        }
        if let Some(count) = parse_var::<u32>(&lookup, "STREAMHOST_PARTITION_COUNT")? {
            config.transport.partition_count = count;
        }
        if let Some(filters) = lookup("STREAMHOST_SUBSCRIPTIONS") {
            config.subscriptions = filters
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_owned)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Env {
                var,
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
