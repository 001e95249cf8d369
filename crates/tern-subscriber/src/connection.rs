//! Streaming pull connection core.
//!
//! # Purpose
//! Owns the bidirectional stream lifecycle: supervises reconnection with
//! backoff, registers inbound messages in the expiration table, dispatches
//! them to the user receiver, sweeps near-expiry leases back onto the stream,
//! and adapts the stream-wide ack deadline to observed handling latency.
//!
//! # Design notes
//! Each stream generation gets its own writer task fed by a bounded channel;
//! the channel's sender lives in a shared slot so the batcher, the lease
//! extender, and the deadline controller always address the current stream.
//! Alarms are abortable spawned tasks behind a single lock. The inbound side
//! is pulled one frame at a time, so a blocking flow-control reservation is
//! the backpressure that slows the server down.
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use tern_wire::{Code, PubsubMessage, Status, StreamingPullRequest, StreamingPullResponse};

use crate::auth::TokenProvider;
use crate::batcher::{AckBatcher, PendingModifyDeadline};
use crate::config::{
    ACK_DEADLINE_UPDATE_PERIOD, INITIAL_ACK_DEADLINE_EXTENSION_SECONDS,
    INITIAL_CHANNEL_RECONNECT_BACKOFF, MAX_ACK_DEADLINE_SECONDS, MIN_ACK_DEADLINE_SECONDS,
    PENDING_ACKS_SEND_DELAY, PERCENTILE_FOR_ACK_DEADLINE_UPDATES, SubscriberConfig,
};
use crate::distribution::LatencyDistribution;
use crate::expiration::{ExpirationTable, LeaseHandle};
use crate::flow::FlowController;
use crate::lifecycle::{Lifecycle, State};
use crate::receiver::{AckReply, MessageReceiver};
use crate::transport::{RequestSink, Transport};
use crate::waiter::InflightGate;

enum StreamWrite {
    Request(StreamingPullRequest),
    Close(Status),
}

/// Sender for the current stream generation's writer task. Replaced on every
/// reopen; sends into a dead generation fail and the operations are dropped,
/// which the server's at-least-once redelivery covers.
struct OutboundSlot {
    sender: Mutex<mpsc::Sender<StreamWrite>>,
}

impl OutboundSlot {
    fn detached() -> Self {
        // Receiver dropped immediately: sends fail until a stream is up.
        let (sender, _) = mpsc::channel(1);
        Self {
            sender: Mutex::new(sender),
        }
    }

    fn replace(&self, sender: mpsc::Sender<StreamWrite>) {
        *self.sender.lock().expect("outbound slot lock") = sender;
    }

    async fn send(&self, write: StreamWrite) -> bool {
        let sender = self.sender.lock().expect("outbound slot lock").clone();
        sender.send(write).await.is_ok()
    }
}

#[derive(Default)]
struct Alarms {
    extension: Option<JoinHandle<()>>,
    next_extension_at: Option<Instant>,
    debounce: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    deadline_updater: Option<JoinHandle<()>>,
}

struct Connection {
    /// Self-handle for spawning alarm and dispatch tasks from `&self` paths.
    weak: Weak<Connection>,
    config: SubscriberConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn TokenProvider>,
    receiver: Arc<dyn MessageReceiver>,
    flow: Arc<FlowController>,
    lifecycle: Lifecycle,
    /// Construction instant; cut-over rounding is done against it so
    /// near-simultaneous expirations coalesce into one sweep.
    epoch: Instant,
    stream_deadline_secs: AtomicU64,
    table: Mutex<ExpirationTable>,
    batcher: AckBatcher,
    latency: LatencyDistribution,
    inflight: InflightGate,
    alarms: Mutex<Alarms>,
    outbound: OutboundSlot,
}

/// Streaming pull subscriber.
///
/// `start` opens the stream and begins delivering messages to the receiver;
/// `stop` drains in-flight callbacks, flushes pending operations, and closes
/// the stream. The host observes progress through [`Subscriber::watch_state`].
pub struct Subscriber {
    connection: Arc<Connection>,
    tasks: Mutex<Tasks>,
}

impl Subscriber {
    pub fn new(
        config: SubscriberConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn TokenProvider>,
        receiver: Arc<dyn MessageReceiver>,
        flow: Arc<FlowController>,
    ) -> Self {
        let initial_deadline = config.initial_stream_deadline_seconds();
        Self {
            connection: Arc::new_cyclic(|weak| Connection {
                weak: weak.clone(),
                config,
                transport,
                credentials,
                receiver,
                flow,
                lifecycle: Lifecycle::new(),
                epoch: Instant::now(),
                stream_deadline_secs: AtomicU64::new(initial_deadline),
                table: Mutex::new(ExpirationTable::new()),
                batcher: AckBatcher::new(),
                latency: LatencyDistribution::new(),
                inflight: InflightGate::new(),
                alarms: Mutex::new(Alarms::default()),
                outbound: OutboundSlot::detached(),
            }),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn start(&self) -> Result<()> {
        anyhow::ensure!(
            self.connection.lifecycle.transition(State::Starting),
            "subscriber already started"
        );
        debug!(subscription = %self.connection.config.subscription, "starting subscriber");
        {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            tasks.supervisor = Some(tokio::spawn(Connection::run_supervisor(Arc::clone(
                &self.connection,
            ))));
            tasks.deadline_updater = Some(tokio::spawn(Connection::run_deadline_updater(
                Arc::clone(&self.connection),
            )));
        }
        self.connection.lifecycle.transition(State::Running);
        Ok(())
    }

    /// Drain in-flight receiver callbacks, cancel the alarms, send one final
    /// flush, and close the stream with a cancelled status.
    pub async fn stop(&self) -> Result<()> {
        anyhow::ensure!(
            self.connection.lifecycle.is_alive(),
            "subscriber is not running"
        );
        anyhow::ensure!(
            self.connection.lifecycle.transition(State::Stopping),
            "subscriber is not running"
        );
        debug!("stopping subscriber");
        self.connection.inflight.wait_none().await;
        {
            let mut alarms = self.connection.alarms.lock().expect("alarms lock");
            if let Some(handle) = alarms.extension.take() {
                handle.abort();
            }
            alarms.next_extension_at = None;
            if let Some(handle) = alarms.debounce.take() {
                handle.abort();
            }
        }
        self.connection.flush(Vec::new()).await;
        let (supervisor, deadline_updater) = {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            (tasks.supervisor.take(), tasks.deadline_updater.take())
        };
        if let Some(handle) = deadline_updater {
            handle.abort();
        }
        self.connection
            .outbound
            .send(StreamWrite::Close(Status::cancelled("subscriber stopped")))
            .await;
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.connection.lifecycle.transition(State::Terminated);
        Ok(())
    }

    pub fn state(&self) -> State {
        self.connection.lifecycle.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.connection.lifecycle.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.lifecycle.is_alive()
    }

    /// Stream-wide ack deadline currently in force.
    pub fn stream_ack_deadline_seconds(&self) -> u64 {
        self.connection.stream_deadline_secs.load(Ordering::Relaxed)
    }
}

impl Connection {
    fn shared(&self) -> Arc<Connection> {
        self.weak.upgrade().expect("connection alive")
    }

    // ---- stream supervision -------------------------------------------------

    async fn run_supervisor(self: Arc<Self>) {
        let mut backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
        while self.lifecycle.is_alive() {
            let token = match self.credentials.token().await {
                Ok(token) => token,
                Err(err) => {
                    self.fail(Status::new(Code::Unauthenticated, err.to_string()));
                    break;
                }
            };
            let (sink, mut stream) = match self.transport.open(&token).await {
                Ok(pair) => pair,
                Err(status) => {
                    if !self.handle_stream_error(status, &mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue_depth);
            self.outbound.replace(out_tx.clone());
            let writer = tokio::spawn(run_stream_writer(sink, out_rx));

            let deadline = self.stream_deadline_secs.load(Ordering::Relaxed);
            debug!(
                subscription = %self.config.subscription,
                deadline,
                "initializing stream"
            );
            let initial =
                StreamingPullRequest::initial(self.config.subscription.clone(), deadline);
            let _ = out_tx.send(StreamWrite::Request(initial)).await;

            let outcome: Result<(), Status> = loop {
                tokio::select! {
                    _ = self.lifecycle.wait_not_alive() => break Ok(()),
                    next = stream.next() => match next {
                        Some(Ok(response)) => {
                            if let Err(err) = self.process_received(response).await {
                                let status = Status::internal(err.to_string());
                                let _ = out_tx
                                    .send(StreamWrite::Close(status.clone()))
                                    .await;
                                break Err(status);
                            }
                        }
                        Some(Err(status)) => break Err(status),
                        None => break Ok(()),
                    },
                }
            };
            drop(out_tx);

            match outcome {
                Ok(()) => {
                    if !self.lifecycle.is_alive() {
                        // Shutdown: the writer exits once it has drained the
                        // final flush and the close frame.
                        let _ = writer.await;
                        break;
                    }
                    debug!("stream closed cleanly; reopening");
                    writer.abort();
                    backoff = INITIAL_CHANNEL_RECONNECT_BACKOFF;
                }
                Err(status) => {
                    writer.abort();
                    if !self.handle_stream_error(status, &mut backoff).await {
                        break;
                    }
                }
            }
        }
        debug!("stream supervisor exited");
    }

    /// Returns whether the supervisor should attempt another generation.
    async fn handle_stream_error(&self, status: Status, backoff: &mut Duration) -> bool {
        if !self.lifecycle.is_alive() {
            return false;
        }
        if !status.is_retryable() {
            self.fail(status);
            return false;
        }
        debug!(
            %status,
            backoff_ms = backoff.as_millis() as u64,
            "retryable stream error; scheduling reconnect"
        );
        metrics::counter!("tern_subscriber_stream_reconnects_total").increment(1);
        let survived = tokio::select! {
            _ = tokio::time::sleep(*backoff) => true,
            _ = self.lifecycle.wait_not_alive() => false,
        };
        *backoff = backoff.saturating_mul(2);
        survived
    }

    fn fail(&self, status: Status) {
        warn!(%status, "subscriber failed");
        self.lifecycle.transition(State::Failed(status));
    }

    // ---- receiver dispatch --------------------------------------------------

    async fn process_received(&self, response: StreamingPullResponse) -> Result<()> {
        let received = response.received_messages;
        if received.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let count = received.len();
        let mut total_bytes = 0usize;
        let mut handles = Vec::with_capacity(count);
        for message in &received {
            let size = message.message.encoded_len();
            total_bytes += size;
            handles.push(Arc::new(LeaseHandle::new(message.ack_id.clone(), size, now)));
        }

        let deadline_secs = self.stream_deadline_secs.load(Ordering::Relaxed);
        let expiration = now + Duration::from_secs(deadline_secs);
        {
            let mut table = self.table.lock().expect("expiration table lock");
            table.insert(
                expiration,
                INITIAL_ACK_DEADLINE_EXTENSION_SECONDS,
                handles.clone(),
            );
        }
        debug!(count, "received messages");
        metrics::counter!("tern_subscriber_messages_received_total").increment(count as u64);
        self.schedule_extension_alarm(expiration);

        self.inflight.add(count as i64);
        metrics::gauge!("tern_subscriber_inflight_messages").set(self.inflight.current() as f64);
        for (message, handle) in received.into_iter().zip(handles) {
            let connection = self.shared();
            tokio::spawn(async move {
                connection.dispatch(message.message, handle).await;
            });
        }

        // Blocks until credit frees up; the next inbound frame is not pulled
        // until this returns.
        self.flow.reserve(count, total_bytes).await?;
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, message: PubsubMessage, handle: Arc<LeaseHandle>) {
        match self.receiver.receive(message).await {
            Ok(AckReply::Ack) => {
                handle.decide();
                self.batcher.add_ack(handle.ack_id.clone());
                self.arm_debounce();
                self.flow.release(1, handle.bytes);
                let seconds = handle.received_at.elapsed().as_secs_f64().ceil() as u64;
                self.latency.record(seconds);
                self.inflight.add(-1);
            }
            Ok(AckReply::Nack) => {
                self.complete_nack(&handle);
            }
            Err(err) => {
                warn!(
                    ack_id = %handle.ack_id,
                    error = %err,
                    "receiver failed; message will be nacked"
                );
                self.complete_nack(&handle);
            }
        }
        metrics::gauge!("tern_subscriber_inflight_messages").set(self.inflight.current() as f64);
    }

    fn complete_nack(&self, handle: &LeaseHandle) {
        handle.decide();
        self.batcher.add_nack(handle.ack_id.clone());
        self.arm_debounce();
        self.flow.release(1, handle.bytes);
        self.inflight.add(-1);
    }

    // ---- alarms and flushing ------------------------------------------------

    fn arm_debounce(&self) {
        let mut alarms = self.alarms.lock().expect("alarms lock");
        if alarms.debounce.is_some() {
            return;
        }
        let connection = self.shared();
        alarms.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(PENDING_ACKS_SEND_DELAY).await;
            {
                let mut alarms = connection.alarms.lock().expect("alarms lock");
                alarms.debounce = None;
            }
            connection.flush(Vec::new()).await;
        }));
    }

    fn schedule_extension_alarm(&self, bucket_expiration: Instant) {
        let fire_at = bucket_expiration
            .checked_sub(self.config.ack_expiration_padding)
            .unwrap_or_else(Instant::now);
        let mut alarms = self.alarms.lock().expect("alarms lock");
        if alarms
            .next_extension_at
            .is_some_and(|current| current <= fire_at)
        {
            return;
        }
        if let Some(handle) = alarms.extension.take() {
            handle.abort();
        }
        alarms.next_extension_at = Some(fire_at);
        let connection = self.shared();
        alarms.extension = Some(tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            connection.run_extension_sweep().await;
        }));
    }

    async fn run_extension_sweep(self: Arc<Self>) {
        {
            let mut alarms = self.alarms.lock().expect("alarms lock");
            alarms.next_extension_at = None;
            alarms.extension = None;
            // The sweep flushes the batcher itself; a pending debounce flush
            // would only duplicate frames.
            if let Some(handle) = alarms.debounce.take() {
                handle.abort();
            }
        }
        let now = Instant::now();
        let cut_over = self.round_up_to_second(
            now + self.config.ack_expiration_padding + Duration::from_millis(500),
        );
        let sweep = {
            let mut table = self.table.lock().expect("expiration table lock");
            table.sweep(now, cut_over)
        };
        debug!(extensions = sweep.extensions.len(), "extension sweep");
        if !sweep.extensions.is_empty() {
            metrics::counter!("tern_subscriber_deadline_extensions_total")
                .increment(sweep.extensions.len() as u64);
        }
        self.flush(sweep.extensions).await;
        if let Some(expiration) = sweep.next_expiration {
            self.schedule_extension_alarm(expiration);
        }
    }

    /// Coalesce to a whole second past the construction instant, so alarms
    /// only ever target second-resolution fire times.
    fn round_up_to_second(&self, at: Instant) -> Instant {
        let offset = at.duration_since(self.epoch);
        let whole_seconds = offset.as_millis().div_ceil(1000) as u64;
        self.epoch + Duration::from_secs(whole_seconds)
    }

    async fn flush(&self, extensions: Vec<PendingModifyDeadline>) {
        let frames = self.batcher.drain(extensions);
        for frame in frames {
            debug!(
                acks = frame.ack_ids.len(),
                modifications = frame.modify_deadline_len(),
                "flushing ack operations"
            );
            metrics::counter!("tern_subscriber_acks_sent_total")
                .increment(frame.ack_ids.len() as u64);
            metrics::counter!("tern_subscriber_modify_deadlines_sent_total")
                .increment(frame.modify_deadline_len() as u64);
            if !self.outbound.send(StreamWrite::Request(frame)).await {
                debug!("no active stream; dropping flushed operations");
                break;
            }
        }
    }

    // ---- adaptive deadline --------------------------------------------------

    async fn run_deadline_updater(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + ACK_DEADLINE_UPDATE_PERIOD,
            ACK_DEADLINE_UPDATE_PERIOD,
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.maybe_update_deadline().await,
                _ = self.lifecycle.wait_not_alive() => break,
            }
        }
    }

    async fn maybe_update_deadline(&self) {
        let latency = self.latency.percentile(PERCENTILE_FOR_ACK_DEADLINE_UPDATES);
        if latency == 0 {
            return;
        }
        let candidate = latency
            .max(self.config.ack_expiration_padding.as_secs())
            .max(MIN_ACK_DEADLINE_SECONDS)
            .min(MAX_ACK_DEADLINE_SECONDS);
        if candidate == self.stream_deadline_secs.load(Ordering::Relaxed) {
            return;
        }
        self.stream_deadline_secs.store(candidate, Ordering::Relaxed);
        debug!(seconds = candidate, "updating stream ack deadline");
        if !self
            .outbound
            .send(StreamWrite::Request(StreamingPullRequest::deadline_update(
                candidate,
            )))
            .await
        {
            // No stream right now; the next initialization frame carries the
            // new deadline.
            debug!("no active stream for deadline update");
        }
    }
}

async fn run_stream_writer(
    mut sink: Box<dyn RequestSink>,
    mut requests: mpsc::Receiver<StreamWrite>,
) {
    while let Some(write) = requests.recv().await {
        match write {
            StreamWrite::Request(request) => {
                if let Err(status) = sink.send(request).await {
                    debug!(%status, "stream writer stopped");
                    break;
                }
            }
            StreamWrite::Close(status) => {
                sink.close(status).await;
                break;
            }
        }
    }
}
