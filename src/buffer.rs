//! Per-topic FIFO of envelopes awaiting a restored connection

use crate::config::OverflowPolicy;
use crate::envelope::Envelope;
use std::collections::{HashMap, VecDeque};

/// Result of offering an envelope to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored without eviction
    Stored,
    /// Stored, the oldest envelope of the topic was evicted
    DroppedOldest,
    /// Refused, the topic's queue is full
    Rejected,
}

/// Holds publishes made while the transport is not connected, flushed in
/// FIFO order per topic once the connection is restored. Each topic's queue
/// is capped; the overflow policy decides which end loses.
pub struct PendingBuffer {
    capacity: usize,
    overflow: OverflowPolicy,
    queues: HashMap<String, VecDeque<Envelope>>,
}

impl PendingBuffer {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow,
            queues: HashMap::new(),
        }
    }

    /// Append an envelope to its topic's queue, applying the overflow policy
    pub fn push(&mut self, envelope: Envelope) -> PushOutcome {
        let queue = self.queues.entry(envelope.topic.clone()).or_default();

        if queue.len() < self.capacity {
            queue.push_back(envelope);
            return PushOutcome::Stored;
        }

        match self.overflow {
            OverflowPolicy::DropOldest => {
                queue.pop_front();
                queue.push_back(envelope);
                PushOutcome::DroppedOldest
            }
            OverflowPolicy::RejectNew => PushOutcome::Rejected,
        }
    }

    /// Take every queue out of the buffer, leaving it empty
    pub fn drain_all(&mut self) -> Vec<(String, VecDeque<Envelope>)> {
        self.queues.drain().collect()
    }

    /// Discard everything buffered for a topic; returns how many were dropped
    pub fn clear_topic(&mut self, topic: &str) -> usize {
        self.queues.remove(topic).map(|q| q.len()).unwrap_or(0)
    }

    /// Buffered envelopes across all topics
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.is_empty())
    }
}
