// Receiver implementations for exercising the subscriber.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use tern_subscriber::{AckReply, MessageReceiver};
use tern_wire::PubsubMessage;

/// Acks every message after an optional processing delay.
pub struct AutoAckReceiver {
    pub delay: Duration,
}

impl AutoAckReceiver {
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MessageReceiver for AutoAckReceiver {
    async fn receive(&self, _message: PubsubMessage) -> Result<AckReply> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(AckReply::Ack)
    }
}

/// Fails every decision, which the subscriber treats as a nack.
pub struct FailingReceiver;

#[async_trait]
impl MessageReceiver for FailingReceiver {
    async fn receive(&self, _message: PubsubMessage) -> Result<AckReply> {
        Err(anyhow!("handler crashed"))
    }
}

/// One undecided delivery, handed to the test body to resolve.
pub struct ManualDelivery {
    pub message: PubsubMessage,
    pub reply: oneshot::Sender<Result<AckReply>>,
}

/// Forwards each delivery to the test, which decides when (and how) to reply.
pub struct ManualReceiver {
    deliveries: mpsc::UnboundedSender<ManualDelivery>,
}

impl ManualReceiver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ManualDelivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (Self { deliveries }, rx)
    }
}

#[async_trait]
impl MessageReceiver for ManualReceiver {
    async fn receive(&self, message: PubsubMessage) -> Result<AckReply> {
        let (reply, decision) = oneshot::channel();
        self.deliveries
            .send(ManualDelivery { message, reply })
            .map_err(|_| anyhow!("test dropped the delivery channel"))?;
        decision
            .await
            .map_err(|_| anyhow!("test dropped the reply channel"))?
    }
}
