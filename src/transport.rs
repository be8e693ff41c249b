//! Socket transport with a bounded-retry reconnection state machine
//!
//! One transport owns one logical connection. A driver task dials through
//! the [`Dialer`], pumps frames while connected, and re-dials on a fixed
//! interval after an unexpected drop until the attempt budget is spent.
//! Connection failure is an expected state here, not an error: callers
//! observe it through the state watch and the lifecycle event stream.

use crate::config::TransportOptions;
use crate::dialer::{Connection, Dialer, WsDialer};
use crate::error::SendError;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle state
///
/// `Failed` is terminal until an explicit [`Transport::connect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Connected and ready
    Connected,
    /// Waiting out the backoff interval before the next attempt
    Reconnecting,
    /// Attempt budget spent; only connect() leaves this state
    Failed,
}

/// Lifecycle and frame events emitted to the owning bus
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection opened
    Opened,
    /// The connection ended, deliberately or not
    Closed { reason: String },
    /// A connection attempt failed
    Error { detail: String },
    /// A raw text frame arrived
    Frame(String),
}

struct DriverHandle {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

struct TransportInner {
    options: TransportOptions,
    dialer: Arc<dyn Dialer>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    // Present exactly while a connection is live
    frame_tx: Mutex<Option<mpsc::Sender<String>>>,
    driver: Mutex<Option<DriverHandle>>,
}

impl TransportInner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// Self-reconnecting socket transport
///
/// Cheaply cloneable; all clones drive the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Create a transport that dials real WebSocket connections
    pub fn new(options: TransportOptions) -> Self {
        Self::with_dialer(options, Arc::new(WsDialer))
    }

    /// Create a transport with a custom connection factory
    pub fn with_dialer(options: TransportOptions, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(TransportInner {
                options,
                dialer,
                state_tx,
                state_rx,
                events: events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                frame_tx: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Watch connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Take the lifecycle event stream; yields `Some` exactly once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Start the connection driver
    ///
    /// Idempotent: a no-op while a driver is already running (Connecting,
    /// Connected or Reconnecting). From `Disconnected` or `Failed` this
    /// starts a fresh attempt budget.
    pub fn connect(&self) {
        let mut driver = self.inner.driver.lock();
        if let Some(handle) = driver.as_ref() {
            if !handle.task.is_finished() {
                debug!("connect ignored, driver already running");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.inner.set_state(ConnectionState::Connecting);

        let inner = self.inner.clone();
        let task = tokio::spawn(run_driver(inner, shutdown_rx));
        *driver = Some(DriverHandle {
            task,
            shutdown: shutdown_tx,
        });
    }

    /// Queue a raw frame for the peer
    ///
    /// Returns a definite outcome and never queues while disconnected;
    /// buffering across disconnects is the bus's job, not the transport's.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if frame.len() > self.inner.options.max_frame_size {
            return Err(SendError::FrameTooLarge {
                size: frame.len(),
                limit: self.inner.options.max_frame_size,
            });
        }

        let guard = self.inner.frame_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::NotConnected);
        };

        tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Deliberately disconnect, cancelling any pending reconnect timer
    ///
    /// Idempotent; ends in `Disconnected` from any state.
    pub async fn close(&self) {
        let handle = self.inner.driver.lock().take();
        if let Some(DriverHandle { task, shutdown }) = handle {
            let _ = shutdown.send(());
            let _ = task.await;
        }

        *self.inner.frame_tx.lock() = None;
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

enum PumpOutcome {
    Shutdown,
    Dropped(String),
}

async fn run_driver(inner: Arc<TransportInner>, mut shutdown: oneshot::Receiver<()>) {
    let mut attempts: u32 = 0;

    loop {
        inner.set_state(ConnectionState::Connecting);

        let dialed = tokio::select! {
            result = inner.dialer.dial(&inner.options) => result,
            _ = &mut shutdown => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        match dialed {
            Ok(connection) => {
                attempts = 0;
                let (frame_tx, frame_rx) = mpsc::channel(inner.options.send_queue_depth);
                *inner.frame_tx.lock() = Some(frame_tx);
                inner.set_state(ConnectionState::Connected);
                info!(url = %inner.options.url, "connected");
                inner.emit(TransportEvent::Opened);

                let outcome = pump_connection(&inner, connection, frame_rx, &mut shutdown).await;
                *inner.frame_tx.lock() = None;

                match outcome {
                    PumpOutcome::Shutdown => {
                        inner.set_state(ConnectionState::Disconnected);
                        inner.emit(TransportEvent::Closed {
                            reason: "close requested".to_string(),
                        });
                        return;
                    }
                    PumpOutcome::Dropped(reason) => {
                        warn!(%reason, "connection lost");
                        inner.emit(TransportEvent::Closed { reason });
                    }
                }
            }
            Err(err) => {
                attempts += 1;
                debug!(error = %err, attempt = attempts, "connection attempt failed");
                inner.emit(TransportEvent::Error {
                    detail: err.to_string(),
                });
            }
        }

        if attempts >= inner.options.max_reconnect_attempts {
            warn!(attempts, "reconnect attempts exhausted, giving up");
            inner.set_state(ConnectionState::Failed);
            return;
        }

        inner.set_state(ConnectionState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(inner.options.reconnect_interval) => {}
            _ = &mut shutdown => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

async fn pump_connection(
    inner: &TransportInner,
    connection: Connection,
    mut frame_rx: mpsc::Receiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
) -> PumpOutcome {
    let Connection {
        mut sink,
        mut stream,
    } = connection;

    loop {
        tokio::select! {
            outbound = frame_rx.recv() => match outbound {
                Some(frame) => {
                    if inner.options.debug {
                        debug!(frame = %frame, "sending frame");
                    }
                    if let Err(err) = sink.send(frame).await {
                        return PumpOutcome::Dropped(err.to_string());
                    }
                }
                None => return PumpOutcome::Dropped("outbound queue closed".to_string()),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => {
                    if inner.options.debug {
                        debug!(frame = %frame, "received frame");
                    }
                    inner.emit(TransportEvent::Frame(frame));
                }
                Some(Err(err)) => return PumpOutcome::Dropped(err.to_string()),
                None => return PumpOutcome::Dropped("connection closed by peer".to_string()),
            },
            _ = &mut *shutdown => return PumpOutcome::Shutdown,
        }
    }
}
