// In-flight message gate used to drain receiver callbacks at shutdown.
use tokio::sync::watch;

/// Signed counter of messages handed to the receiver whose decisions have not
/// come back yet. Shutdown waits for it to reach zero before the final flush.
pub(crate) struct InflightGate {
    count: watch::Sender<i64>,
}

impl InflightGate {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub(crate) fn add(&self, delta: i64) {
        self.count.send_modify(|count| *count += delta);
    }

    pub(crate) fn current(&self) -> i64 {
        *self.count.borrow()
    }

    pub(crate) async fn wait_none(&self) {
        let mut receiver = self.count.subscribe();
        receiver
            .wait_for(|count| *count <= 0)
            .await
            .expect("in-flight gate sender alive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_none_returns_immediately_at_zero() {
        let gate = InflightGate::new();
        gate.wait_none().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_none_blocks_until_drained() {
        let gate = Arc::new(InflightGate::new());
        gate.add(3);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_none().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        gate.add(-1);
        gate.add(-2);
        waiter.await.expect("join");
        assert_eq!(gate.current(), 0);
    }
}
