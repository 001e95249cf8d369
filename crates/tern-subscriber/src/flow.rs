// Outstanding-message and byte credit gating inbound dispatch.
use anyhow::{Context, Result};
use tokio::sync::Semaphore;

/// Bounds outstanding messages and bytes.
///
/// `reserve` blocks until credit is available rather than rejecting; that
/// block is the backpressure that stops the dispatcher from pulling the next
/// inbound frame. Every reservation is paired with exactly one `release` on
/// ack, nack, or receiver failure.
pub struct FlowController {
    max_bytes: usize,
    messages: Semaphore,
    bytes: Semaphore,
}

impl FlowController {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        let max_bytes = max_bytes.min(u32::MAX as usize);
        Self {
            max_bytes,
            messages: Semaphore::new(max_messages),
            bytes: Semaphore::new(max_bytes),
        }
    }

    pub async fn reserve(&self, messages: usize, bytes: usize) -> Result<()> {
        self.messages
            .acquire_many(messages as u32)
            .await
            .context("reserve message credit")?
            .forget();
        self.bytes
            .acquire_many(self.clamp_bytes(bytes))
            .await
            .context("reserve byte credit")?
            .forget();
        Ok(())
    }

    pub fn release(&self, messages: usize, bytes: usize) {
        self.messages.add_permits(messages);
        self.bytes.add_permits(self.clamp_bytes(bytes) as usize);
    }

    // A batch larger than the whole byte budget still reserves at most the
    // budget so the dispatcher can make progress; release applies the same
    // cap to keep credit balanced.
    fn clamp_bytes(&self, bytes: usize) -> u32 {
        bytes.min(self.max_bytes) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn release_restores_exactly_what_was_reserved() {
        let flow = FlowController::new(10, 1_000);
        flow.reserve(3, 300).await.expect("reserve");
        assert_eq!(flow.messages.available_permits(), 7);
        assert_eq!(flow.bytes.available_permits(), 700);
        flow.release(3, 300);
        assert_eq!(flow.messages.available_permits(), 10);
        assert_eq!(flow.bytes.available_permits(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_blocks_until_credit_returns() {
        let flow = std::sync::Arc::new(FlowController::new(1, 1_000));
        flow.reserve(1, 100).await.expect("first reserve");

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.reserve(1, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "reserve should be blocked");

        flow.release(1, 100);
        waiter.await.expect("join").expect("second reserve");
    }

    #[tokio::test]
    async fn oversized_reservation_caps_at_the_budget() {
        let flow = FlowController::new(10, 500);
        flow.reserve(1, 10_000).await.expect("reserve");
        assert_eq!(flow.bytes.available_permits(), 0);
        flow.release(1, 10_000);
        assert_eq!(flow.bytes.available_permits(), 500);
    }
}
