// Test harness for the tern subscriber: an in-process scripted pull server,
// a channel-backed transport, and receiver helpers.
pub mod receivers;
pub mod server;

pub use receivers::{AutoAckReceiver, FailingReceiver, ManualDelivery, ManualReceiver};
pub use server::{PullServer, RecordedClose, RecordedRequest};

/// Install a test logger once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
