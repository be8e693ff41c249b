//! Configuration for the transport and the message bus

use std::time::Duration;

/// Forwarding proxy credentials (HTTP Basic)
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Optional forwarding proxy for the WebSocket connection
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl ProxyOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// Attach Basic credentials for the CONNECT handshake
    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Configuration for a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Server URL (e.g., "ws://localhost:9000/ws" or "wss://...")
    pub url: String,

    /// Delay between reconnection attempts (fixed interval)
    pub reconnect_interval: Duration,

    /// Number of consecutive failed connection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Log every raw frame at debug level
    pub debug: bool,

    /// Optional forwarding proxy (HTTP CONNECT)
    pub proxy: Option<ProxyOptions>,

    /// Largest frame `send()` will accept, in bytes
    pub max_frame_size: usize,

    /// Capacity of the outbound frame queue; a full queue fails the send
    pub send_queue_depth: usize,
}

impl TransportOptions {
    /// Create a new configuration with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            debug: false,
            proxy: None,
            max_frame_size: 1024 * 1024,
            send_queue_depth: 100,
        }
    }

    /// Set the delay between reconnection attempts
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the number of failed attempts tolerated before `Failed`
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enable per-frame debug logging
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Route the connection through a forwarding proxy
    pub fn proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the largest frame `send()` will accept
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the outbound frame queue capacity
    pub fn send_queue_depth(mut self, depth: usize) -> Self {
        self.send_queue_depth = depth;
        self
    }
}

/// Verbosity of the built-in logging middleware stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Retry behavior for publishes that fail at the send level
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial failed send
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// What to do when a topic's pending buffer reaches capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered envelope to make room
    DropOldest,
    /// Refuse the new envelope and keep what is buffered
    RejectNew,
}

/// Configuration for a [`MessageBus`](crate::bus::MessageBus)
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Level used by [`LoggingStage`](crate::middleware::LoggingStage)
    pub log_level: LogLevel,

    /// Retry behavior for send-level publish failures
    pub retry: RetryPolicy,

    /// Per-topic cap on envelopes buffered while disconnected
    pub buffer_capacity: usize,

    /// Overflow behavior when a topic's buffer is full
    pub overflow: OverflowPolicy,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            retry: RetryPolicy::default(),
            buffer_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl BusOptions {
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = delay;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }
}
