use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::InboundMessage;

/// Subscriber capability: consumes one inbound message.
///
/// Handlers are invoked concurrently with every other handler whose filter
/// matched the same message, and the same message may be delivered more than
/// once (at-least-once). Implementations must therefore be idempotent.
///
/// Returning an error withholds the partition checkpoint for that message, so
/// it will be redelivered after a restart.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        (**self).handle(message).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
///
/// The closure receives an owned copy of the message.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        (self.0)(message.clone()).await
    }
}

impl<F> core::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FnHandler")
    }
}
