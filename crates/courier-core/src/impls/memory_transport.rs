//! InMemoryTransport - records what would have gone to the broker.
//!
//! Failures can be scripted: the next N sends, or every send to a topic.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::domain::errors::CourierError;
use crate::domain::outbox::OutboxMessage;
use crate::ports::MessageTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub body: Vec<u8>,
}

impl SentMessage {
    pub fn decode(&self) -> Result<OutboxMessage, CourierError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Default)]
struct Script {
    fail_next: usize,
    failing_topics: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    script: Mutex<Script>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends.
    pub fn fail_next(&self, count: usize) {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).fail_next = count;
    }

    /// Fail every send to `topic` until `heal_topic`.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failing_topics
            .insert(topic.into());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failing_topics
            .remove(topic);
    }

    /// Successfully sent messages, in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn send(&self, topic: &str, message: &[u8]) -> Result<(), CourierError> {
        {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            if script.fail_next > 0 {
                script.fail_next -= 1;
                return Err(CourierError::Transport(format!("send to {topic} failed")));
            }
            if script.failing_topics.contains(topic) {
                return Err(CourierError::Transport(format!("topic {topic} unavailable")));
            }
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                topic: topic.to_string(),
                body: message.to_vec(),
            });
        Ok(())
    }
}
