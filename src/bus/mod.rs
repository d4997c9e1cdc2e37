//! Partitioned, key-ordered event log.
//!
//! Topics are split into partition streams; a message's key picks the
//! partition, so everything about one context id is read in append order.
//! Delivery is at-least-once: consumers must tolerate redelivery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod memory;
pub mod outbox;
pub mod redis_streams;

pub type Headers = BTreeMap<String, String>;

/// How much acknowledgement a publish waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Acks {
    /// The primary accepted the append.
    #[default]
    Leader,
    /// The append reached the configured number of replicas.
    All,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub acks: Acks,
}

impl OutboundMessage {
    pub fn json(topic: impl Into<String>, key: impl Into<String>, body: &Value) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            headers: Headers::new(),
            payload: Bytes::from(body.to_string()),
            acks: Acks::Leader,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }
}

/// A message read from one partition stream.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: u32,
    pub stream: String,
    pub entry_id: String,
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
    /// Times this entry has been handed to a consumer, this delivery included.
    pub deliveries: u64,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Append a message and return the entry id assigned by the log.
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<String>;
}

/// One batch from [`Subscription::read`].
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub messages: Vec<InboundMessage>,
    /// Replayed streams that had nothing left pending for this consumer.
    pub drained: Vec<String>,
}

/// A consumer-group membership over every partition of one topic.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Partition streams covered, in partition order.
    fn streams(&self) -> &[String];

    /// Read new entries from all partitions except `replay`; for the streams
    /// in `replay`, re-read this consumer's own unacknowledged entries in id
    /// order instead.
    async fn read(&mut self, replay: &[String]) -> anyhow::Result<ReadBatch>;

    /// Take over entries another consumer left unacknowledged for too long.
    async fn claim_idle(&mut self) -> anyhow::Result<Vec<InboundMessage>>;

    async fn ack(&mut self, message: &InboundMessage) -> anyhow::Result<()>;

    /// Copy the entry to the topic's dead-letter stream, then acknowledge it.
    async fn dead_letter(&mut self, message: &InboundMessage, reason: &str) -> anyhow::Result<()>;
}

/// Partition for a key: first eight bytes of its SHA-256, modulo the count.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}

pub fn stream_name(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

pub fn dead_letter_stream(topic: &str) -> String {
    format!("{topic}.dead-letter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for key in ["ctx-1", "ctx-2", "session-42", ""] {
            let p = partition_for(key, 3);
            assert!(p < 3);
            assert_eq!(p, partition_for(key, 3));
        }
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let used: std::collections::HashSet<u32> =
            (0..64).map(|i| partition_for(&format!("ctx-{i}"), 3)).collect();
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(stream_name("workflow-events", 2), "workflow-events:2");
        assert_eq!(dead_letter_stream("workflow-events"), "workflow-events.dead-letter");
    }
}
