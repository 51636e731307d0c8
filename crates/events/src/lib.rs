//! Topic filtering, subscription fan-out and checkpoint cadence.
//!
//! This crate is transport-agnostic: it knows nothing about partitions beyond
//! their identifiers and performs no IO of its own.

pub mod checkpoint;
pub mod filter;
pub mod handler;
pub mod message;
pub mod registry;
pub mod routing;

pub use checkpoint::{CheckpointPolicy, PartitionCursor, DEFAULT_CHECKPOINT_INTERVAL};
pub use filter::{matches, InvalidFilterError, TopicFilter};
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use message::InboundMessage;
pub use registry::{DeliveryError, SubscriptionHandle, SubscriptionRegistry};
pub use routing::{merge_properties, RoutingMetadata};
