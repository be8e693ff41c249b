//! Topic-addressed pub/sub over a single reconnecting transport
//!
//! The bus composes the transport, the topic registry and the middleware
//! chain. Publishes are fire-and-forget from the caller's point of view:
//! while connected they go straight to the wire (with bounded retries for
//! send-level failures), while disconnected they land in the per-topic
//! pending buffer and flush in FIFO order once the connection is restored.

use crate::buffer::{PendingBuffer, PushOutcome};
use crate::config::BusOptions;
use crate::envelope::Envelope;
use crate::error::SendError;
use crate::middleware::{Direction, LoggingStage, Middleware, MiddlewareChain};
use crate::registry::{Handler, TopicRegistry};
use crate::transport::{ConnectionState, Transport, TransportEvent};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Report delivered on the bus failure channel when a publish is dropped
/// after exhausting its retries
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub topic: String,
    pub reason: String,
    /// Send attempts made, including the first
    pub attempts: u32,
}

/// Handle returned by [`MessageBus::subscribe`]; the only way to remove
/// the handler it stands for
pub struct Subscription {
    topic: String,
    id: Uuid,
    inner: Arc<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the handler; takes effect for subsequent dispatches only,
    /// an invocation already in flight is not interrupted
    pub fn unsubscribe(self) {
        self.inner.registry.lock().remove(&self.topic, self.id);
    }
}

struct PumpHandle {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

struct BusInner {
    options: BusOptions,
    transport: Transport,
    registry: Mutex<TopicRegistry>,
    buffer: Mutex<PendingBuffer>,
    chain: Mutex<MiddlewareChain>,
    outbound_seq: Mutex<HashMap<String, u64>>,
    inbound_seq: Mutex<HashMap<String, u64>>,
    failures: broadcast::Sender<PublishFailure>,
    // Latched true during close() so pending retry timers die with the bus
    retry_cancel: watch::Sender<bool>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    pump: Mutex<Option<PumpHandle>>,
}

/// Message bus over one exclusively-owned transport
///
/// Cheaply cloneable; all clones share the same registry, buffer and
/// middleware chain.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Take ownership of the transport and wrap it in bus semantics
    ///
    /// The bus installs its own [`LoggingStage`] at the configured
    /// `log_level` as the first middleware stage; stages added through
    /// [`use_middleware`](Self::use_middleware) run after it.
    pub fn new(transport: Transport, options: BusOptions) -> Self {
        let events_rx = transport.take_events();
        let (failures, _) = broadcast::channel(64);
        let (retry_cancel, _) = watch::channel(false);

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(LoggingStage::new(options.log_level)));

        Self {
            inner: Arc::new(BusInner {
                buffer: Mutex::new(PendingBuffer::new(options.buffer_capacity, options.overflow)),
                options,
                transport,
                registry: Mutex::new(TopicRegistry::new()),
                chain: Mutex::new(chain),
                outbound_seq: Mutex::new(HashMap::new()),
                inbound_seq: Mutex::new(HashMap::new()),
                failures,
                retry_cancel,
                events_rx: Mutex::new(events_rx),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Start (or restart) the transport and the inbound event pump
    pub fn connect(&self) {
        self.inner.retry_cancel.send_replace(false);
        self.ensure_pump();
        self.inner.transport.connect();
    }

    /// Tear down: cancel retry timers, stop the pump, close the transport.
    ///
    /// Idempotent. Registry and buffer are left intact but inert; a later
    /// `connect()` resumes service.
    pub async fn close(&self) {
        self.inner.retry_cancel.send_replace(true);

        let pump = self.inner.pump.lock().take();
        if let Some(PumpHandle { task, shutdown }) = pump {
            let _ = shutdown.send(());
            let _ = task.await;
        }

        self.inner.transport.close().await;
    }

    /// Publish a payload to a topic
    ///
    /// Never returns an error: middleware may drop the message, a
    /// disconnected transport buffers it, and send-level failures are
    /// retried per the bus retry policy and finally reported through
    /// [`failures`](Self::failures).
    pub fn publish(&self, topic: &str, payload: Value) {
        let sequence = self.inner.next_sequence(topic);
        let envelope = Envelope::new(topic, payload, sequence);

        let chain = self.inner.chain.lock().clone();
        let Some(envelope) = chain.run(envelope, Direction::Outbound) else {
            debug!(topic, "outbound message halted by middleware");
            return;
        };

        self.inner.forward(envelope, 0);
    }

    /// Register a handler for a topic; all handlers of a topic receive
    /// every message, in registration order
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let id = self.inner.registry.lock().add(topic, handler);
        Subscription {
            topic: topic.to_string(),
            id,
            inner: self.inner.clone(),
        }
    }

    /// Append a middleware stage; applied to inbound and outbound traffic
    /// alike, in append order
    pub fn use_middleware(&self, stage: impl Middleware + 'static) {
        self.inner.chain.lock().push(Arc::new(stage));
    }

    /// Topics that currently have at least one subscriber
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.lock().topics()
    }

    /// Drop all subscribers and any buffered envelopes for a topic.
    /// A dispatch already in flight for the topic completes normally.
    pub fn clear_topic(&self, topic: &str) {
        let removed = self.inner.registry.lock().clear(topic);
        let dropped = self.inner.buffer.lock().clear_topic(topic);
        debug!(topic, removed, dropped, "cleared topic");
    }

    /// Current transport state
    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Watch transport state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.state_receiver()
    }

    /// Subscribe to publish-failure reports. Reports sent while nobody
    /// listens are silently dropped.
    pub fn failures(&self) -> broadcast::Receiver<PublishFailure> {
        self.inner.failures.subscribe()
    }

    fn ensure_pump(&self) {
        let mut pump = self.inner.pump.lock();
        if let Some(handle) = pump.as_ref() {
            if !handle.task.is_finished() {
                return;
            }
        }

        let Some(events) = self.inner.events_rx.lock().take() else {
            warn!("transport event stream unavailable, inbound dispatch disabled");
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let task = tokio::spawn(run_pump(inner, events, shutdown_rx));
        *pump = Some(PumpHandle {
            task,
            shutdown: shutdown_tx,
        });
    }
}

impl BusInner {
    fn next_sequence(&self, topic: &str) -> u64 {
        let mut seqs = self.outbound_seq.lock();
        let counter = seqs.entry(topic.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Send, buffer or retry depending on what the transport reports
    fn forward(self: &Arc<Self>, envelope: Envelope, retries_used: u32) {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                error!(topic = %envelope.topic, error = %err, "failed to encode envelope");
                return;
            }
        };

        match self.transport.send(frame) {
            Ok(()) => {}
            Err(SendError::NotConnected) => self.enqueue(envelope),
            Err(err) => {
                if retries_used >= self.options.retry.max_retries {
                    warn!(
                        topic = %envelope.topic,
                        error = %err,
                        retries = retries_used,
                        "dropping message, retries exhausted"
                    );
                    let _ = self.failures.send(PublishFailure {
                        topic: envelope.topic,
                        reason: err.to_string(),
                        attempts: retries_used + 1,
                    });
                } else {
                    self.schedule_retry(envelope, retries_used + 1);
                }
            }
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        let topic = envelope.topic.clone();
        match self.buffer.lock().push(envelope) {
            PushOutcome::Stored => debug!(topic = %topic, "buffered message while disconnected"),
            PushOutcome::DroppedOldest => {
                warn!(topic = %topic, "pending buffer full, dropped oldest message")
            }
            PushOutcome::Rejected => {
                warn!(topic = %topic, "pending buffer full, rejected new message")
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, envelope: Envelope, retries_used: u32) {
        let mut cancel = self.retry_cancel.subscribe();
        if *cancel.borrow() {
            return;
        }

        let delay = self.options.retry.retry_delay;
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.forward(envelope, retries_used),
                _ = cancel.changed() => {}
            }
        });
    }

    /// Drain every topic's pending queue in FIFO order after a reconnect
    fn flush_pending(self: &Arc<Self>) {
        let drained = self.buffer.lock().drain_all();
        for (topic, queue) in drained {
            if !queue.is_empty() {
                debug!(topic = %topic, count = queue.len(), "flushing buffered messages");
            }
            for envelope in queue {
                // a failure here re-enters the same path as a fresh publish
                self.forward(envelope, 0);
            }
        }
    }

    fn dispatch_frame(self: &Arc<Self>, frame: &str) {
        let envelope = match Envelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "discarding undecodable frame");
                return;
            }
        };

        let chain = self.chain.lock().clone();
        let Some(envelope) = chain.run(envelope, Direction::Inbound) else {
            debug!("inbound message halted by middleware");
            return;
        };

        self.note_inbound_sequence(&envelope);

        let handlers = self.registry.lock().handlers(&envelope.topic);
        for handler in handlers {
            let topic = envelope.topic.as_str();
            let payload = envelope.payload.clone();
            // one misbehaving subscriber must not starve its siblings
            if catch_unwind(AssertUnwindSafe(|| handler(topic, payload))).is_err() {
                error!(topic = %envelope.topic, "subscriber panicked during dispatch");
            }
        }
    }

    /// Advisory reorder detection; never delays or reorders delivery
    fn note_inbound_sequence(&self, envelope: &Envelope) {
        if envelope.sequence == 0 {
            return;
        }
        let mut seqs = self.inbound_seq.lock();
        let last = seqs.entry(envelope.topic.clone()).or_insert(0);
        if envelope.sequence <= *last {
            debug!(
                topic = %envelope.topic,
                sequence = envelope.sequence,
                last = *last,
                "frame arrived out of order"
            );
        } else {
            *last = envelope.sequence;
        }
    }
}

async fn run_pump(
    inner: Arc<BusInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Opened) => {
                    debug!("transport connected, flushing pending buffers");
                    inner.flush_pending();
                }
                Some(TransportEvent::Frame(frame)) => inner.dispatch_frame(&frame),
                Some(TransportEvent::Closed { reason }) => debug!(%reason, "transport closed"),
                Some(TransportEvent::Error { detail }) => debug!(%detail, "transport error"),
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }

    // hand the receiver back so a later connect() can resume dispatch
    *inner.events_rx.lock() = Some(events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogLevel, OverflowPolicy};
    use crate::dialer::{Connection, Dialer};
    use crate::error::TransportError;
    use crate::middleware::{LoggingStage, Next, ValidationResult, ValidationStage};
    use crate::config::TransportOptions;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type PeerTx = mpsc::UnboundedSender<Result<String, TransportError>>;
    type SentRx = mpsc::UnboundedReceiver<String>;

    fn loopback_connection() -> (Connection, PeerTx, SentRx) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel::<String>();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();

        let sink = futures_util::sink::unfold(sent_tx, |tx, frame: String| async move {
            tx.send(frame).map_err(|_| TransportError::ConnectionClosed)?;
            Ok::<_, TransportError>(tx)
        });
        let stream = futures_util::stream::unfold(peer_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        (
            Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            },
            peer_tx,
            sent_rx,
        )
    }

    struct LoopbackDialer {
        links: Arc<Mutex<Vec<(PeerTx, SentRx)>>>,
    }

    impl LoopbackDialer {
        fn new() -> Self {
            Self {
                links: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial(&self, _options: &TransportOptions) -> Result<Connection, TransportError> {
            let (connection, peer_tx, sent_rx) = loopback_connection();
            self.links.lock().push((peer_tx, sent_rx));
            Ok(connection)
        }
    }

    fn test_bus(bus_options: BusOptions) -> (MessageBus, Arc<Mutex<Vec<(PeerTx, SentRx)>>>) {
        test_bus_with(bus_options, TransportOptions::new("ws://localhost:9000/ws"))
    }

    fn test_bus_with(
        bus_options: BusOptions,
        transport_options: TransportOptions,
    ) -> (MessageBus, Arc<Mutex<Vec<(PeerTx, SentRx)>>>) {
        let dialer = LoopbackDialer::new();
        let links = dialer.links.clone();
        let transport = Transport::with_dialer(transport_options, Arc::new(dialer));
        (MessageBus::new(transport, bus_options), links)
    }

    async fn wait_for_state(bus: &MessageBus, target: ConnectionState) {
        let mut rx = bus.state_receiver();
        loop {
            if *rx.borrow() == target {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_publishes_flush_in_fifo_order() {
        let (bus, links) = test_bus(BusOptions::default());

        // Disconnected: both publishes land in the pending buffer
        bus.publish("camera/setting", json!({"setting": "gain", "value": 50}));
        bus.publish("camera/setting", json!({"setting": "offset", "value": 10}));
        assert_eq!(bus.state(), ConnectionState::Disconnected);

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let (_peer, mut sent_rx) = links.lock().remove(0);
        let first = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();
        let second = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();

        assert_eq!(first.payload["setting"], "gain");
        assert_eq!(first.sequence, 1);
        assert_eq!(second.payload["setting"], "offset");
        assert_eq!(second.sequence, 2);

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequences_are_per_topic() {
        let (bus, links) = test_bus(BusOptions::default());
        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        bus.publish("camera/setting", json!(1));
        bus.publish("camera/setting", json!(2));
        bus.publish("mount/status", json!(3));

        let (_peer, mut sent_rx) = links.lock().remove(0);
        let mut sequences = Vec::new();
        for _ in 0..3 {
            let envelope = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();
            sequences.push((envelope.topic, envelope.sequence));
        }

        assert_eq!(
            sequences,
            vec![
                ("camera/setting".to_string(), 1),
                ("camera/setting".to_string(), 2),
                ("mount/status".to_string(), 1),
            ]
        );

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_subscriber_does_not_starve_siblings() {
        let (bus, links) = test_bus(BusOptions::default());
        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let _bad = bus.subscribe("guider/frame", |_, _| panic!("boom"));

        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        let _good = bus.subscribe("guider/frame", move |_, payload| {
            delivered_tx.send(payload).expect("test channel");
        });

        let (peer_tx, _sent_rx) = links.lock().remove(0);
        let frame = Envelope::new("guider/frame", json!({"star": "lost"}), 1)
            .to_frame()
            .unwrap();
        peer_tx.send(Ok(frame)).expect("peer send");

        let payload = delivered_rx.recv().await.expect("sibling still delivered");
        assert_eq!(payload, json!({"star": "lost"}));

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_subsequent_dispatch() {
        let (bus, links) = test_bus(BusOptions::default());
        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let first_calls = Arc::new(AtomicUsize::new(0));
        let calls = first_calls.clone();
        let sub = bus.subscribe("dome/shutter", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let _keep = bus.subscribe("dome/shutter", move |_, payload| {
            second_tx.send(payload).expect("test channel");
        });

        sub.unsubscribe();

        let (peer_tx, _sent_rx) = links.lock().remove(0);
        let frame = Envelope::new("dome/shutter", json!("open"), 1).to_frame().unwrap();
        peer_tx.send(Ok(frame)).expect("peer send");

        second_rx.recv().await.expect("remaining handler delivered");
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_middleware_stops_send_and_buffering() {
        let (bus, links) = test_bus(BusOptions::default());

        let logged = Arc::new(AtomicUsize::new(0));
        let seen = logged.clone();
        bus.use_middleware(move |env: Envelope, _dir: Direction, next: Next| {
            seen.fetch_add(1, Ordering::SeqCst);
            next.run(env);
        });
        bus.use_middleware(
            ValidationStage::new().rule("camera/setting", |_: &str, payload: &Value| {
                if payload["value"].as_i64().unwrap_or(0) < 0 {
                    ValidationResult::Reject("negative value".to_string())
                } else {
                    ValidationResult::Accept
                }
            }),
        );

        // Rejected while disconnected: must not even be buffered
        bus.publish("camera/setting", json!({"setting": "gain", "value": -1}));
        bus.publish("camera/setting", json!({"setting": "gain", "value": 50}));
        assert_eq!(logged.load(Ordering::SeqCst), 2);

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let (_peer, mut sent_rx) = links.lock().remove(0);
        let flushed = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();
        assert_eq!(flushed.payload["value"], 50);

        // Nothing else was buffered
        assert!(sent_rx.try_recv().is_err());

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_validation_drop_never_reaches_subscribers() {
        let (bus, links) = test_bus(BusOptions::default());
        bus.use_middleware(LoggingStage::new(LogLevel::Debug));
        bus.use_middleware(
            ValidationStage::new().rule("camera/setting", |_: &str, payload: &Value| {
                if payload.get("setting").is_none() {
                    ValidationResult::Reject("missing setting field".to_string())
                } else {
                    ValidationResult::Accept
                }
            }),
        );

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe("camera/setting", move |_, payload| {
            received_tx.send(payload).expect("test channel");
        });

        let (peer_tx, _sent_rx) = links.lock().remove(0);
        let malformed = Envelope::new("camera/setting", json!({"bogus": true}), 1)
            .to_frame()
            .unwrap();
        let wellformed = Envelope::new("camera/setting", json!({"setting": "gain"}), 2)
            .to_frame()
            .unwrap();
        peer_tx.send(Ok(malformed)).expect("peer send");
        peer_tx.send(Ok(wellformed)).expect("peer send");

        // Only the well-formed payload arrives
        let payload = received_rx.recv().await.expect("delivery");
        assert_eq!(payload, json!({"setting": "gain"}));
        assert!(received_rx.try_recv().is_err());

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_retries_then_reports() {
        let transport_options =
            TransportOptions::new("ws://localhost:9000/ws").max_frame_size(16);
        let bus_options = BusOptions::default()
            .max_retries(2)
            .retry_delay(Duration::from_millis(10));
        let (bus, _links) = test_bus_with(bus_options, transport_options);

        let mut failures = bus.failures();

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        bus.publish(
            "camera/image",
            json!({"data": "a payload that cannot fit in sixteen bytes"}),
        );

        let failure = failures.recv().await.expect("failure report");
        assert_eq!(failure.topic, "camera/image");
        assert_eq!(failure.attempts, 3);
        assert!(failure.reason.contains("exceeds limit"));

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retries() {
        let transport_options =
            TransportOptions::new("ws://localhost:9000/ws").max_frame_size(16);
        let bus_options = BusOptions::default()
            .max_retries(5)
            .retry_delay(Duration::from_secs(5));
        let (bus, _links) = test_bus_with(bus_options, transport_options);

        let mut failures = bus.failures();

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        bus.publish("camera/image", json!({"data": "far too large for the frame limit"}));
        bus.close().await;

        // The retry timer was cancelled: advancing time produces neither a
        // resend nor a failure report
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(
            failures.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_topic_drops_subscribers_and_buffered() {
        let (bus, links) = test_bus(BusOptions::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let _sub = bus.subscribe("camera/setting", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("camera/setting", json!(1));
        bus.publish("mount/status", json!(2));
        bus.clear_topic("camera/setting");

        assert!(bus.topics().is_empty());

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        // Only the mount/status envelope survived the clear
        let (peer_tx, mut sent_rx) = links.lock().remove(0);
        let flushed = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();
        assert_eq!(flushed.topic, "mount/status");
        assert!(sent_rx.try_recv().is_err());

        // And inbound traffic on the cleared topic has nobody to call
        let frame = Envelope::new("camera/setting", json!(3), 9).to_frame().unwrap();
        peer_tx.send(Ok(frame)).expect("peer send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_reflects_live_subscriptions() {
        let (bus, _links) = test_bus(BusOptions::default());

        let sub_a = bus.subscribe("camera/setting", |_, _| {});
        let _sub_b = bus.subscribe("mount/status", |_, _| {});

        let mut topics = bus.topics();
        topics.sort();
        assert_eq!(topics, vec!["camera/setting", "mount/status"]);
        assert_eq!(sub_a.topic(), "camera/setting");

        sub_a.unsubscribe();
        assert_eq!(bus.topics(), vec!["mount/status"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_overflow_reject_new_keeps_earliest() {
        let bus_options = BusOptions::default()
            .buffer_capacity(1)
            .overflow(OverflowPolicy::RejectNew);
        let (bus, links) = test_bus(bus_options);

        bus.publish("camera/setting", json!(1));
        bus.publish("camera/setting", json!(2));

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let (_peer, mut sent_rx) = links.lock().remove(0);
        let flushed = Envelope::from_frame(&sent_rx.recv().await.unwrap()).unwrap();
        assert_eq!(flushed.payload, json!(1));
        assert!(sent_rx.try_recv().is_err());

        bus.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_close_resumes_dispatch() {
        let (bus, links) = test_bus(BusOptions::default());

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;
        bus.close().await;
        assert_eq!(bus.state(), ConnectionState::Disconnected);

        bus.connect();
        wait_for_state(&bus, ConnectionState::Connected).await;

        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe("mount/status", move |_, payload| {
            received_tx.send(payload).expect("test channel");
        });

        let (peer_tx, _sent_rx) = links.lock().remove(1);
        let frame = Envelope::new("mount/status", json!({"tracking": true}), 1)
            .to_frame()
            .unwrap();
        peer_tx.send(Ok(frame)).expect("peer send");

        let payload = received_rx.recv().await.expect("delivery after reconnect");
        assert_eq!(payload, json!({"tracking": true}));

        bus.close().await;
    }
}
