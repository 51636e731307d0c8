//! Subscription registry (topic filter → handler fan-out).
//!
//! The registry is the only state shared between the ingestion loop and the
//! rest of the process. It is built for a read-mostly workload:
//!
//! - **Dispatch** loads an immutable snapshot of the current registrations and
//!   scans it linearly. It never takes a lock.
//! - **Subscribe / unsubscribe** publish a new snapshot (copy-on-write via
//!   `ArcSwap::rcu`). Registrations number in the tens to low hundreds, so
//!   copying the vector is cheap.
//!
//! A removal racing with an in-flight dispatch is safe; whether that dispatch
//! still sees the removed handler is unspecified.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use futures::future::join_all;
use thiserror::Error;
use tracing::debug;

use streamhost_core::SubscriptionId;

use crate::filter::{InvalidFilterError, TopicFilter};
use crate::handler::MessageHandler;
use crate::InboundMessage;

struct Registration {
    id: SubscriptionId,
    filter: TopicFilter,
    handler: Arc<dyn MessageHandler>,
}

struct RegistryInner {
    snapshot: ArcSwap<Vec<Arc<Registration>>>,
}

impl RegistryInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let previous = self.snapshot.rcu(|current| {
            current
                .iter()
                .filter(|r| r.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|r| r.id == id)
    }
}

/// One or more handlers failed while a message was fanned out.
#[derive(Debug, Error)]
#[error("{failed} of {matched} handler(s) failed for target '{target}': {first:#}")]
pub struct DeliveryError {
    pub target: String,
    pub matched: usize,
    pub failed: usize,
    /// First failure observed (the others are counted only).
    pub first: anyhow::Error,
}

/// Concurrent registry of (topic filter, handler) subscriptions.
///
/// Cloning is cheap and yields another handle onto the same registrations.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every topic matched by `pattern`.
    ///
    /// Fails fast on malformed patterns. The returned handle removes the
    /// subscription when released (explicitly or on drop).
    pub fn subscribe<H>(
        &self,
        pattern: &str,
        handler: H,
    ) -> Result<SubscriptionHandle, InvalidFilterError>
    where
        H: MessageHandler + 'static,
    {
        let filter = TopicFilter::parse(pattern)?;
        let id = SubscriptionId::new();
        let registration = Arc::new(Registration {
            id,
            filter: filter.clone(),
            handler: Arc::new(handler),
        });

        self.inner.snapshot.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(registration.clone());
            next
        });

        debug!(subscription_id = %id, filter = %filter, "subscription registered");

        Ok(SubscriptionHandle {
            id,
            filter,
            registry: Arc::downgrade(&self.inner),
            released: false,
        })
    }

    /// Handlers whose filter matches `topic`, evaluated over a snapshot taken now.
    ///
    /// No ordering is guaranteed among the returned handlers.
    pub fn dispatch(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.inner
            .snapshot
            .load()
            .iter()
            .filter(|r| r.filter.matches(topic))
            .map(|r| r.handler.clone())
            .collect()
    }

    /// Fan `message` out to every matching handler and wait for all of them.
    ///
    /// Handlers run concurrently. Returns the number of handlers invoked, or a
    /// [`DeliveryError`] if at least one of them failed (after all completed).
    pub async fn deliver(&self, message: &InboundMessage) -> Result<usize, DeliveryError> {
        let handlers = self.dispatch(message.target());
        let matched = handlers.len();
        if matched == 0 {
            return Ok(0);
        }

        let results = join_all(handlers.iter().map(|h| h.handle(message))).await;

        let mut failures = results.into_iter().filter_map(Result::err);
        match failures.next() {
            None => Ok(matched),
            Some(first) => {
                let failed = 1 + failures.count();
                Err(DeliveryError {
                    target: message.target().to_owned(),
                    matched,
                    failed,
                    first,
                })
            }
        }
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.inner.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered filter patterns (diagnostics).
    pub fn filters(&self) -> Vec<String> {
        self.inner
            .snapshot
            .load()
            .iter()
            .map(|r| r.filter.as_str().to_owned())
            .collect()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                snapshot: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("filters", &self.filters())
            .finish()
    }
}

/// Scoped ownership of one subscription.
///
/// Dropping the handle unsubscribes. Releasing after the registry itself was
/// dropped is a no-op.
#[derive(Debug)]
#[must_use = "dropping the handle removes the subscription"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    filter: TopicFilter,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Remove the subscription now. Returns whether it was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let removed = inner.remove(self.id);
        if removed {
            debug!(subscription_id = %self.id, filter = %self.filter, "subscription removed");
        }
        removed
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}
