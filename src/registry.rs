//! Topic registry: ordered subscriber lists per topic
//!
//! The registry is exclusively owned by the bus; handlers are removed only
//! through the id returned at registration, so one consumer cannot knock
//! out another's handler.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Handler invoked for each message on a subscribed topic
pub type Handler = Arc<dyn Fn(&str, Value) + Send + Sync>;

struct RegisteredHandler {
    id: Uuid,
    handler: Handler,
}

/// Maps topic names to subscriber callbacks in registration order
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Vec<RegisteredHandler>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the returned id is the only removal key
    pub fn add(&mut self, topic: &str, handler: Handler) -> Uuid {
        let id = Uuid::new_v4();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(RegisteredHandler { id, handler });
        id
    }

    /// Remove the handler with the given id; true if it was present
    pub fn remove(&mut self, topic: &str, id: Uuid) -> bool {
        let Some(handlers) = self.topics.get_mut(topic) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        let removed = handlers.len() < before;

        if handlers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Drop every handler for a topic; returns how many were removed
    pub fn clear(&mut self, topic: &str) -> usize {
        self.topics.remove(topic).map(|h| h.len()).unwrap_or(0)
    }

    /// Topics that currently have at least one subscriber
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Snapshot of a topic's handlers, in registration order
    pub fn handlers(&self, topic: &str) -> Vec<Handler> {
        self.topics
            .get(topic)
            .map(|handlers| handlers.iter().map(|h| h.handler.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
