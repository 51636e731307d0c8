//! `streamhost-core`: shared building blocks.
//!
//! This crate contains identifiers and positions only (no IO, no async).

pub mod error;
pub mod id;
pub mod position;

pub use error::{CoreError, CoreResult};
pub use id::{HostId, PartitionId, SubscriptionId};
pub use position::{EventPosition, PartitionCheckpoint, StartPosition};
