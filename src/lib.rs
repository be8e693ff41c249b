//! Scopebus - resilient topic message bus over a reconnecting WebSocket
//!
//! The control-panel stores of a device dashboard all talk to their peer
//! through one multiplexed socket. This crate provides that core: a
//! transport with a bounded-retry reconnection state machine, topic-based
//! publish/subscribe fan-out, an ordered middleware pipeline for logging
//! and schema validation, and per-topic FIFO buffering while disconnected.
//!
//! # Example
//!
//! ```no_run
//! use scopebus::{BusOptions, MessageBus, Transport, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Transport::new(TransportOptions::new("ws://localhost:9000/ws"));
//!     let bus = MessageBus::new(transport, BusOptions::default());
//!     bus.connect();
//!
//!     let subscription = bus.subscribe("camera/setting", |topic, payload| {
//!         println!("{topic}: {payload}");
//!     });
//!
//!     bus.publish("camera/setting", serde_json::json!({"setting": "gain", "value": 50}));
//!
//!     subscription.unsubscribe();
//!     bus.close().await;
//! }
//! ```

pub mod buffer;
pub mod bus;
pub mod config;
pub mod dialer;
pub mod envelope;
pub mod error;
pub mod middleware;
pub mod registry;
pub mod transport;

pub use bus::{MessageBus, PublishFailure, Subscription};
pub use config::{
    BusOptions, LogLevel, OverflowPolicy, ProxyAuth, ProxyOptions, RetryPolicy, TransportOptions,
};
pub use dialer::{Connection, Dialer, WsDialer};
pub use envelope::Envelope;
pub use error::{SendError, TransportError};
pub use middleware::{
    Direction, LoggingStage, Middleware, MiddlewareChain, Next, ValidationResult, ValidationStage,
    Validator,
};
pub use registry::{Handler, TopicRegistry};
pub use transport::{ConnectionState, Transport, TransportEvent};
