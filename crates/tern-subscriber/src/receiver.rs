// User-supplied message handling seam.
use anyhow::Result;
use async_trait::async_trait;
use tern_wire::PubsubMessage;

/// Decision returned by the receiver for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    Ack,
    Nack,
}

/// Asynchronous message handler.
///
/// An `Err` is treated as a nack and logged. Receivers should not block the
/// calling task indefinitely; outstanding work is bounded by the flow
/// controller, not by the receiver.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    async fn receive(&self, message: PubsubMessage) -> Result<AckReply>;
}
