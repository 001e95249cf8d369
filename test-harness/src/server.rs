// Scripted in-process streaming-pull server.
//
// Tests drive it directly: queue response frames onto the current stream,
// fail or complete streams, and assert on the requests the subscriber sent.
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use tern_subscriber::{RequestSink, ResponseStream, Transport};
use tern_wire::{PubsubMessage, ReceivedMessage, Status, StreamingPullRequest, StreamingPullResponse};

const SESSION_QUEUE_DEPTH: usize = 64;

/// One outbound request as the server saw it, tagged with the stream
/// generation that carried it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub generation: usize,
    pub request: StreamingPullRequest,
}

/// Client-side stream closure, tagged like [`RecordedRequest`].
#[derive(Debug, Clone)]
pub struct RecordedClose {
    pub generation: usize,
    pub status: Status,
}

struct ServerState {
    opens: Mutex<Vec<Instant>>,
    tokens: Mutex<Vec<String>>,
    open_refusals: Mutex<VecDeque<Status>>,
    current: Mutex<Option<mpsc::Sender<Result<StreamingPullResponse, Status>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    closes: Mutex<Vec<RecordedClose>>,
    version: watch::Sender<u64>,
}

impl ServerState {
    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

/// Handle shared by the test body and the transport it hands the subscriber.
#[derive(Clone)]
pub struct PullServer {
    state: Arc<ServerState>,
}

impl PullServer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(ServerState {
                opens: Mutex::new(Vec::new()),
                tokens: Mutex::new(Vec::new()),
                open_refusals: Mutex::new(VecDeque::new()),
                current: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
                version,
            }),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(ScriptedTransport {
            state: Arc::clone(&self.state),
        })
    }

    /// Queue a stream-open failure consumed by the next `open` call.
    pub fn refuse_next_open(&self, status: Status) {
        self.state
            .open_refusals
            .lock()
            .expect("open refusals lock")
            .push_back(status);
    }

    /// Deliver one response frame on the current stream. Returns false when no
    /// stream is up.
    pub async fn deliver(&self, messages: Vec<(&str, PubsubMessage)>) -> bool {
        let response = StreamingPullResponse {
            received_messages: messages
                .into_iter()
                .map(|(ack_id, message)| ReceivedMessage {
                    ack_id: ack_id.to_string(),
                    message,
                })
                .collect(),
        };
        let sender = self
            .state
            .current
            .lock()
            .expect("current session lock")
            .clone();
        match sender {
            Some(sender) => sender.send(Ok(response)).await.is_ok(),
            None => false,
        }
    }

    /// Terminate the current stream with an error status.
    pub async fn fail_stream(&self, status: Status) -> bool {
        let sender = self
            .state
            .current
            .lock()
            .expect("current session lock")
            .take();
        match sender {
            Some(sender) => sender.send(Err(status)).await.is_ok(),
            None => false,
        }
    }

    /// Close the current stream cleanly (server half-close).
    pub fn complete_stream(&self) -> bool {
        self.state
            .current
            .lock()
            .expect("current session lock")
            .take()
            .is_some()
    }

    pub fn open_instants(&self) -> Vec<Instant> {
        self.state.opens.lock().expect("opens lock").clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.lock().expect("opens lock").len()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().expect("tokens lock").clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }

    pub fn closes(&self) -> Vec<RecordedClose> {
        self.state.closes.lock().expect("closes lock").clone()
    }

    /// Block until `predicate` produces a value from the request log.
    pub async fn wait_for_requests<F, T>(&self, mut predicate: F) -> T
    where
        F: FnMut(&[RecordedRequest]) -> Option<T>,
    {
        let mut version = self.state.version.subscribe();
        loop {
            {
                let requests = self.state.requests.lock().expect("requests lock");
                if let Some(value) = predicate(&requests) {
                    return value;
                }
            }
            version.changed().await.expect("server state alive");
        }
    }

    /// Block until some request matches `predicate`; returns the first match.
    pub async fn wait_for_request<F>(&self, mut predicate: F) -> StreamingPullRequest
    where
        F: FnMut(&StreamingPullRequest) -> bool,
    {
        self.wait_for_requests(|requests| {
            requests
                .iter()
                .find(|recorded| predicate(&recorded.request))
                .map(|recorded| recorded.request.clone())
        })
        .await
    }

    /// Block until at least `count` streams have been opened.
    pub async fn wait_for_opens(&self, count: usize) {
        let mut version = self.state.version.subscribe();
        loop {
            if self.open_count() >= count {
                return;
            }
            version.changed().await.expect("server state alive");
        }
    }

    /// Block until at least `count` client-side closes were recorded.
    pub async fn wait_for_closes(&self, count: usize) {
        let mut version = self.state.version.subscribe();
        loop {
            if self.closes().len() >= count {
                return;
            }
            version.changed().await.expect("server state alive");
        }
    }
}

impl Default for PullServer {
    fn default() -> Self {
        Self::new()
    }
}

struct ScriptedTransport {
    state: Arc<ServerState>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        token: &str,
    ) -> Result<(Box<dyn RequestSink>, Box<dyn ResponseStream>), Status> {
        let refusal = self
            .state
            .open_refusals
            .lock()
            .expect("open refusals lock")
            .pop_front();
        let generation = {
            let mut opens = self.state.opens.lock().expect("opens lock");
            opens.push(Instant::now());
            opens.len() - 1
        };
        self.state
            .tokens
            .lock()
            .expect("tokens lock")
            .push(token.to_string());
        self.state.bump();
        if let Some(status) = refusal {
            return Err(status);
        }

        let (response_tx, response_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        *self.state.current.lock().expect("current session lock") = Some(response_tx);
        Ok((
            Box::new(ScriptedSink {
                state: Arc::clone(&self.state),
                generation,
            }),
            Box::new(ScriptedStream { rx: response_rx }),
        ))
    }
}

struct ScriptedSink {
    state: Arc<ServerState>,
    generation: usize,
}

#[async_trait]
impl RequestSink for ScriptedSink {
    async fn send(&mut self, request: StreamingPullRequest) -> Result<(), Status> {
        self.state
            .requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                generation: self.generation,
                request,
            });
        self.state.bump();
        Ok(())
    }

    async fn close(&mut self, status: Status) {
        self.state
            .closes
            .lock()
            .expect("closes lock")
            .push(RecordedClose {
                generation: self.generation,
                status,
            });
        self.state.bump();
    }
}

struct ScriptedStream {
    rx: mpsc::Receiver<Result<StreamingPullResponse, Status>>,
}

#[async_trait]
impl ResponseStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<StreamingPullResponse, Status>> {
        self.rx.recv().await
    }
}
