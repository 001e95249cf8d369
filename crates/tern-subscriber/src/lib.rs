//! Streaming pull subscriber.
//!
//! A long-lived client that pulls messages over a bidirectional stream, hands
//! each one to a user [`MessageReceiver`], and acknowledges, negatively
//! acknowledges, or extends per-message lease deadlines back to the server.
//! Stream churn is invisible to the receiver: retryable errors reconnect with
//! exponential backoff while in-flight state is preserved.
//!
//! The transport, credentials, and receiver are injected trait objects; see
//! [`Transport`], [`TokenProvider`], and [`MessageReceiver`].
mod batcher;
mod connection;
mod distribution;
mod expiration;
mod lifecycle;
mod waiter;

pub mod auth;
pub mod config;
pub mod flow;
pub mod receiver;
pub mod transport;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use config::SubscriberConfig;
pub use connection::Subscriber;
pub use flow::FlowController;
pub use lifecycle::State;
pub use receiver::{AckReply, MessageReceiver};
pub use transport::{RequestSink, ResponseStream, Transport};
