// Typed frames exchanged on a streaming-pull connection.
//
// The transport collaborator owns byte-level frame encoding; this crate only
// defines the request/response shapes and the status model the subscriber
// core reasons about.
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, Status>;

/// Terminal status of a stream or call, in the transport's code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// Whether a stream that died with this code should be reopened.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::DeadlineExceeded
                | Code::Internal
                | Code::Cancelled
                | Code::ResourceExhausted
                | Code::Unavailable
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Stream termination status: a code plus a human-readable message.
///
/// ```
/// use tern_wire::{Code, Status};
///
/// let status = Status::new(Code::Unavailable, "server going away");
/// assert!(status.is_retryable());
/// assert!(!Status::new(Code::NotFound, "no such subscription").is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// A message as published, with its service-assigned metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PubsubMessage {
    pub data: Bytes,
    pub attributes: BTreeMap<String, String>,
    pub message_id: String,
    pub ordering_key: String,
}

impl PubsubMessage {
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Serialized size used for flow-control accounting.
    pub fn encoded_len(&self) -> usize {
        self.data.len()
            + self.message_id.len()
            + self.ordering_key.len()
            + self
                .attributes
                .iter()
                .map(|(key, value)| key.len() + value.len())
                .sum::<usize>()
    }
}

/// One delivered message with the lease token identifying it to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
}

/// Inbound frame: a batch of delivered messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedMessage>,
}

/// Outbound frame.
///
/// The first frame on a stream names the subscription and the stream-wide ack
/// deadline. Later frames carry acks and modify-deadline pairs, or a bare
/// deadline update. `modify_deadline_ack_ids` and `modify_deadline_seconds`
/// are parallel arrays; the ith pair is one modification, and seconds of zero
/// releases the lease immediately (a nack).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingPullRequest {
    pub subscription: String,
    pub stream_ack_deadline_seconds: u64,
    pub ack_ids: Vec<String>,
    pub modify_deadline_ack_ids: Vec<String>,
    pub modify_deadline_seconds: Vec<u64>,
}

impl StreamingPullRequest {
    /// Initialization frame sent once per stream open.
    pub fn initial(subscription: impl Into<String>, stream_ack_deadline_seconds: u64) -> Self {
        Self {
            subscription: subscription.into(),
            stream_ack_deadline_seconds,
            ..Self::default()
        }
    }

    /// Frame carrying only a new stream-wide ack deadline.
    pub fn deadline_update(stream_ack_deadline_seconds: u64) -> Self {
        Self {
            stream_ack_deadline_seconds,
            ..Self::default()
        }
    }

    pub fn push_modify_deadline(&mut self, ack_id: impl Into<String>, seconds: u64) {
        self.modify_deadline_ack_ids.push(ack_id.into());
        self.modify_deadline_seconds.push(seconds);
    }

    pub fn modify_deadline_len(&self) -> usize {
        debug_assert_eq!(
            self.modify_deadline_ack_ids.len(),
            self.modify_deadline_seconds.len()
        );
        self.modify_deadline_ack_ids.len()
    }

    /// Whether this frame carries only a new stream-wide ack deadline — no
    /// subscription name, acks, or deadline modifications.
    pub fn is_deadline_update(&self) -> bool {
        self.subscription.is_empty()
            && self.stream_ack_deadline_seconds > 0
            && self.ack_ids.is_empty()
            && self.modify_deadline_ack_ids.is_empty()
    }
}
