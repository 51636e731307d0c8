//! Infrastructure layer: transports, checkpoint storage, configuration and
//! the ingestion host that ties them to the subscription registry.

pub mod checkpoint_store;
pub mod config;
pub mod host;
pub mod transport;


pub use checkpoint_store::{
    CheckpointStore, CheckpointStoreError, InMemoryCheckpointStore, PostgresCheckpointStore,
};
pub use config::{ConfigError, HostConfig, LeaseStoreConfig, TransportConfig};
pub use host::{
    HostHandle, HostMode, HostState, HostStats, HostStatsSnapshot, IngestionHost,
    IngestionHostBuilder, ShutdownSignal,
};
pub use transport::{
    Checkpointer, CloseReason, EventSource, PartitionCoordinator, PartitionProcessor,
    ProcessorError, ReadOptions, TransportError, TransportEvent,
};
