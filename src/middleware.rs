//! Ordered interception pipeline for inbound and outbound messages
//!
//! Stages run synchronously, in registration order, for both directions.
//! A stage forwards a message by calling `next.run(envelope)`; returning
//! without doing so halts the pipeline, and the message never reaches the
//! wire (outbound) or any subscriber (inbound). Because the envelope is
//! passed by value, a stage may also transform it before forwarding.

use crate::config::LogLevel;
use crate::envelope::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which way a message is traveling through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A single interception stage
pub trait Middleware: Send + Sync {
    fn handle(&self, envelope: Envelope, direction: Direction, next: Next);
}

impl<F> Middleware for F
where
    F: Fn(Envelope, Direction, Next) + Send + Sync,
{
    fn handle(&self, envelope: Envelope, direction: Direction, next: Next) {
        self(envelope, direction, next)
    }
}

/// Continuation handed to each stage; consumed on use so a stage can
/// forward a message at most once
pub struct Next {
    stages: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    direction: Direction,
    output: Arc<Mutex<Option<Envelope>>>,
}

impl Next {
    /// Pass the envelope to the following stage, or out of the chain if
    /// this was the last one
    pub fn run(self, envelope: Envelope) {
        let stage = self.stages.get(self.index).cloned();
        match stage {
            Some(stage) => {
                let direction = self.direction;
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                stage.handle(envelope, direction, next);
            }
            None => {
                *self.output.lock() = Some(envelope);
            }
        }
    }
}

/// The ordered list of stages; append order is execution order
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    /// Run the envelope through every stage. `Some` carries the (possibly
    /// transformed) envelope out of the far end; `None` means a stage
    /// halted the pipeline.
    pub fn run(&self, envelope: Envelope, direction: Direction) -> Option<Envelope> {
        if self.stages.is_empty() {
            return Some(envelope);
        }

        let output = Arc::new(Mutex::new(None));
        let next = Next {
            stages: Arc::from(self.stages.clone()),
            index: 0,
            direction,
            output: output.clone(),
        };
        next.run(envelope);

        let result = output.lock().take();
        result
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Structured verdict from a [`Validator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Accept,
    Reject(String),
}

/// Shape check for a topic's payloads; rejects with a reason, never panics
pub trait Validator: Send + Sync {
    fn validate(&self, topic: &str, payload: &Value) -> ValidationResult;
}

impl<F> Validator for F
where
    F: Fn(&str, &Value) -> ValidationResult + Send + Sync,
{
    fn validate(&self, topic: &str, payload: &Value) -> ValidationResult {
        self(topic, payload)
    }
}

/// Middleware stage that drops payloads failing their topic's validator
///
/// Topics without a registered validator pass through untouched. A
/// rejection is logged once and the pipeline is halted, so the message
/// reaches neither the wire nor any subscriber.
#[derive(Default)]
pub struct ValidationStage {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidationStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a validator to a topic
    pub fn rule(mut self, topic: impl Into<String>, validator: impl Validator + 'static) -> Self {
        self.validators.insert(topic.into(), Arc::new(validator));
        self
    }
}

impl Middleware for ValidationStage {
    fn handle(&self, envelope: Envelope, _direction: Direction, next: Next) {
        if let Some(validator) = self.validators.get(&envelope.topic) {
            if let ValidationResult::Reject(reason) = validator.validate(&envelope.topic, &envelope.payload) {
                warn!(topic = %envelope.topic, %reason, "dropping message that failed validation");
                return;
            }
        }
        next.run(envelope);
    }
}

/// Middleware stage that logs every passing message and always continues
pub struct LoggingStage {
    level: LogLevel,
}

impl LoggingStage {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

impl Middleware for LoggingStage {
    fn handle(&self, envelope: Envelope, direction: Direction, next: Next) {
        let topic = envelope.topic.as_str();
        let sequence = envelope.sequence;
        match self.level {
            LogLevel::Debug => debug!(topic, sequence, ?direction, "bus message"),
            LogLevel::Info => info!(topic, sequence, ?direction, "bus message"),
            LogLevel::Warn => warn!(topic, sequence, ?direction, "bus message"),
            LogLevel::Error => error!(topic, sequence, ?direction, "bus message"),
        }
        next.run(envelope);
    }
}
