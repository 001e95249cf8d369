// End-to-end subscriber scenarios against the scripted in-process server.
//
// All timing-sensitive tests run under paused tokio time, so debounce
// windows, lease extensions, and reconnect backoff advance deterministically.
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tern_harness::{AutoAckReceiver, FailingReceiver, ManualReceiver, PullServer, init_test_logging};
use tern_subscriber::{
    AckReply, FlowController, MessageReceiver, State, StaticTokenProvider, Subscriber,
    SubscriberConfig,
};
use tern_wire::{Code, PubsubMessage, Status};

const SUBSCRIPTION: &str = "projects/p/subscriptions/s";

fn build_subscriber(
    server: &PullServer,
    receiver: Arc<dyn MessageReceiver>,
    padding: Duration,
    flow: Arc<FlowController>,
) -> Subscriber {
    let mut config = SubscriberConfig::new(SUBSCRIPTION);
    config.ack_expiration_padding = padding;
    Subscriber::new(
        config,
        server.transport(),
        Arc::new(StaticTokenProvider::new("test-token")),
        receiver,
        flow,
    )
}

#[tokio::test(start_paused = true)]
async fn happy_ack_flushes_within_the_debounce_window() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let subscriber = build_subscriber(
        &server,
        Arc::new(AutoAckReceiver::after(Duration::from_millis(200))),
        Duration::from_secs(5),
        flow.clone(),
    );
    subscriber.start().expect("start");

    server.wait_for_opens(1).await;
    assert_eq!(server.tokens(), vec!["test-token"]);
    let initial = server
        .wait_for_request(|request| !request.subscription.is_empty())
        .await;
    assert_eq!(initial.subscription, SUBSCRIPTION);
    assert_eq!(initial.stream_ack_deadline_seconds, 10);

    let delivered_at = Instant::now();
    assert!(
        server
            .deliver(vec![("A1", PubsubMessage::from_data(vec![0u8; 50]))])
            .await
    );
    let flush = server
        .wait_for_request(|request| !request.ack_ids.is_empty())
        .await;
    assert_eq!(flush.ack_ids, vec!["A1"]);
    assert_eq!(flush.modify_deadline_len(), 0);
    // 200 ms of handling plus the 100 ms debounce window.
    assert_eq!(delivered_at.elapsed(), Duration::from_millis(300));

    // The (1, 50) reservation was released: the full budget reserves cleanly.
    tokio::time::timeout(Duration::from_secs(1), flow.reserve(10, 1_000))
        .await
        .expect("credit fully released")
        .expect("reserve");
    flow.release(10, 1_000);

    subscriber.stop().await.expect("stop");
    assert_eq!(subscriber.state(), State::Terminated);
}

#[tokio::test(start_paused = true)]
async fn receiver_failure_turns_into_a_nack() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let subscriber = build_subscriber(
        &server,
        Arc::new(FailingReceiver),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");

    server.wait_for_opens(1).await;
    assert!(
        server
            .deliver(vec![("B1", PubsubMessage::from_data("payload"))])
            .await
    );
    let flush = server
        .wait_for_request(|request| request.modify_deadline_len() > 0)
        .await;
    assert!(flush.ack_ids.is_empty());
    assert_eq!(flush.modify_deadline_ack_ids, vec!["B1"]);
    assert_eq!(flush.modify_deadline_seconds, vec![0]);

    subscriber.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn lease_extends_before_decision_then_acks_cleanly() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let (receiver, mut deliveries) = ManualReceiver::new();
    let subscriber = build_subscriber(
        &server,
        Arc::new(receiver),
        Duration::from_secs(1),
        flow,
    );
    subscriber.start().expect("start");

    server.wait_for_opens(1).await;
    assert!(
        server
            .deliver(vec![("C1", PubsubMessage::from_data("held"))])
            .await
    );
    let delivery = deliveries.recv().await.expect("delivery");

    // The alarm fires at expiration minus padding and re-extends by the
    // initial two-second step.
    let extension = server
        .wait_for_request(|request| request.modify_deadline_len() > 0)
        .await;
    assert_eq!(extension.modify_deadline_ack_ids, vec!["C1"]);
    assert_eq!(extension.modify_deadline_seconds, vec![2]);

    delivery.reply.send(Ok(AckReply::Ack)).expect("reply");
    let flush = server
        .wait_for_request(|request| !request.ack_ids.is_empty())
        .await;
    assert_eq!(flush.ack_ids, vec!["C1"]);

    subscriber.stop().await.expect("stop");

    // Exactly one extension ever went out for C1: the post-ack sweep dropped
    // the decided handle instead of re-extending it.
    let extension_frames = server
        .requests()
        .iter()
        .filter(|recorded| {
            recorded
                .request
                .modify_deadline_ack_ids
                .iter()
                .any(|ack_id| ack_id == "C1")
        })
        .count();
    assert_eq!(extension_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_ack_batches_chunk_at_the_cap() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(20_000, 64 * 1024 * 1024));
    let subscriber = build_subscriber(
        &server,
        Arc::new(AutoAckReceiver::immediate()),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");
    server.wait_for_opens(1).await;

    let ack_ids: Vec<String> = (0..15_000).map(|i| format!("m-{i}")).collect();
    let batch: Vec<(&str, PubsubMessage)> = ack_ids
        .iter()
        .map(|ack_id| (ack_id.as_str(), PubsubMessage::from_data("x")))
        .collect();
    assert!(server.deliver(batch).await);

    let mut sizes = server
        .wait_for_requests(|requests| {
            let sizes: Vec<usize> = requests
                .iter()
                .map(|recorded| recorded.request.ack_ids.len())
                .filter(|len| *len > 0)
                .collect();
            if sizes.iter().sum::<usize>() == 15_000 {
                Some(sizes)
            } else {
                None
            }
        })
        .await;
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5_000, 10_000]);

    subscriber.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_doubles_and_resets_on_clean_close() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let subscriber = build_subscriber(
        &server,
        Arc::new(AutoAckReceiver::immediate()),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");

    for expected_opens in 1..=3 {
        server.wait_for_opens(expected_opens).await;
        assert!(server.fail_stream(Status::unavailable("flake")).await);
    }
    server.wait_for_opens(4).await;
    server.complete_stream();
    server.wait_for_opens(5).await;
    assert!(server.fail_stream(Status::unavailable("flake")).await);
    server.wait_for_opens(6).await;

    let opens = server.open_instants();
    let deltas: Vec<Duration> = opens.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(deltas[0], Duration::from_millis(100));
    assert_eq!(deltas[1], Duration::from_millis(200));
    assert_eq!(deltas[2], Duration::from_millis(400));
    // Clean close reopens without backoff and resets the schedule.
    assert_eq!(deltas[3], Duration::ZERO);
    assert_eq!(deltas[4], Duration::from_millis(100));

    subscriber.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn failed_opens_back_off_like_stream_errors() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    for _ in 0..3 {
        server.refuse_next_open(Status::unavailable("endpoint draining"));
    }
    let subscriber = build_subscriber(
        &server,
        Arc::new(AutoAckReceiver::immediate()),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");

    // The fourth attempt gets through and initializes normally.
    server.wait_for_opens(4).await;
    let initial = server
        .wait_for_request(|request| !request.subscription.is_empty())
        .await;
    assert_eq!(initial.subscription, SUBSCRIPTION);

    let opens = server.open_instants();
    let deltas: Vec<Duration> = opens.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(
        deltas,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );

    subscriber.stop().await.expect("stop");
}

/// Sleeps the number of seconds named by the message payload, then acks.
struct PayloadDelayReceiver;

#[async_trait]
impl MessageReceiver for PayloadDelayReceiver {
    async fn receive(&self, message: PubsubMessage) -> Result<AckReply> {
        let seconds: u64 = String::from_utf8_lossy(&message.data).parse()?;
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(AckReply::Ack)
    }
}

#[tokio::test(start_paused = true)]
async fn stream_deadline_adapts_to_observed_latency() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(2_000, 64 * 1024 * 1024));
    let subscriber = build_subscriber(
        &server,
        Arc::new(PayloadDelayReceiver),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");
    server.wait_for_opens(1).await;
    assert_eq!(subscriber.stream_ack_deadline_seconds(), 10);

    let payloads: Vec<String> = (0..1_000).map(|i| format!("{}", 5 + i % 16)).collect();
    let ack_ids: Vec<String> = (0..1_000).map(|i| format!("l-{i}")).collect();
    let batch: Vec<(&str, PubsubMessage)> = ack_ids
        .iter()
        .zip(&payloads)
        .map(|(ack_id, payload)| (ack_id.as_str(), PubsubMessage::from_data(payload.clone())))
        .collect();
    assert!(server.deliver(batch).await);

    // After the 60 s tick the p99.9 handling latency (20 s) becomes the
    // stream deadline, pushed as a frame carrying only the new value.
    let update = server
        .wait_for_request(|request| request.is_deadline_update())
        .await;
    assert_eq!(update.stream_ack_deadline_seconds, 20);
    assert_eq!(subscriber.stream_ack_deadline_seconds(), 20);

    let update_frames = server
        .requests()
        .iter()
        .filter(|recorded| recorded.request.is_deadline_update())
        .count();
    assert_eq!(update_frames, 1);

    subscriber.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_in_flight_messages_and_closes_cancelled() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let (receiver, mut deliveries) = ManualReceiver::new();
    let subscriber = Arc::new(build_subscriber(
        &server,
        Arc::new(receiver),
        Duration::from_secs(5),
        flow,
    ));
    subscriber.start().expect("start");
    server.wait_for_opens(1).await;

    assert!(
        server
            .deliver(vec![
                ("D1", PubsubMessage::from_data("one")),
                ("D2", PubsubMessage::from_data("two")),
            ])
            .await
    );
    let first = deliveries.recv().await.expect("first delivery");
    let second = deliveries.recv().await.expect("second delivery");

    let stopper = {
        let subscriber = subscriber.clone();
        tokio::spawn(async move { subscriber.stop().await })
    };
    tokio::task::yield_now().await;
    assert!(!stopper.is_finished(), "stop must wait for in-flight drain");

    first.reply.send(Ok(AckReply::Ack)).expect("reply first");
    second.reply.send(Ok(AckReply::Ack)).expect("reply second");
    stopper.await.expect("join").expect("stop");

    assert_eq!(subscriber.state(), State::Terminated);
    let acked: Vec<String> = server
        .requests()
        .iter()
        .flat_map(|recorded| recorded.request.ack_ids.clone())
        .collect();
    assert!(acked.contains(&"D1".to_string()));
    assert!(acked.contains(&"D2".to_string()));
    let closes = server.closes();
    assert!(!closes.is_empty(), "stream closed from the client side");
    assert_eq!(closes.last().expect("close").status.code, Code::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn fatal_stream_error_fails_the_subscriber() {
    init_test_logging();
    let server = PullServer::new();
    let flow = Arc::new(FlowController::new(10, 1_000));
    let subscriber = build_subscriber(
        &server,
        Arc::new(AutoAckReceiver::immediate()),
        Duration::from_secs(5),
        flow,
    );
    subscriber.start().expect("start");
    server.wait_for_opens(1).await;

    let mut states = subscriber.watch_state();
    assert!(
        server
            .fail_stream(Status::new(Code::PermissionDenied, "subscription revoked"))
            .await
    );
    let failed = states
        .wait_for(|state| matches!(state, State::Failed(_)))
        .await
        .expect("state watch");
    match &*failed {
        State::Failed(status) => assert_eq!(status.code, Code::PermissionDenied),
        other => panic!("unexpected state: {other:?}"),
    }
    // No reconnect was attempted after the fatal status.
    assert_eq!(server.open_count(), 1);
}
