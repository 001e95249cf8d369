// Bidirectional stream seam over the RPC transport.
//
// The transport owns connection establishment and byte-level frame encoding;
// the subscriber only sees typed frames. Inbound is pull-based: the core
// calls `next` once per frame it is ready to process, which is how manual
// flow control (one requested response at a time) is expressed here.
use async_trait::async_trait;
use tern_wire::{Status, StreamingPullRequest, StreamingPullResponse};

/// Opens bidirectional streaming-pull streams, one per supervisor generation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(
        &self,
        token: &str,
    ) -> Result<(Box<dyn RequestSink>, Box<dyn ResponseStream>), Status>;
}

/// Outbound half of one stream.
#[async_trait]
pub trait RequestSink: Send {
    async fn send(&mut self, request: StreamingPullRequest) -> Result<(), Status>;

    /// Terminate the stream from the client side with the given status.
    async fn close(&mut self, status: Status);
}

/// Inbound half of one stream.
///
/// `next` must be cancel-safe: the supervisor races it against shutdown and
/// drops the in-flight call without losing a frame.
#[async_trait]
pub trait ResponseStream: Send {
    /// The next response frame, a terminal error, or `None` on clean close.
    async fn next(&mut self) -> Option<Result<StreamingPullResponse, Status>>;
}
