//! In-process event log for tests and single-process demos.
//!
//! Partitioning matches [`RedisLog`](crate::bus::redis_streams::RedisLog).
//! Consumer groups share a cursor and a pending list per partition; every
//! pending entry is owned by the consumer it was last handed to. Plain
//! [`MemoryLog::subscribe`] opens a fresh group each call.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bus::{
    dead_letter_stream, partition_for, stream_name, InboundMessage, OutboundMessage, Publisher,
    ReadBatch, Subscription,
};

struct PendingEntry {
    consumer: String,
    deliveries: u64,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    cursors: HashMap<String, usize>,
    /// (stream, index) -> current owner.
    pending: BTreeMap<(String, usize), PendingEntry>,
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, Vec<InboundMessage>>,
    /// (topic, group) -> group state.
    groups: HashMap<(String, String), GroupState>,
    published: Vec<OutboundMessage>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
    partitions: u32,
    unavailable: Arc<AtomicBool>,
    groups_opened: Arc<AtomicU64>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
            partitions: partitions.max(1),
            unavailable: Arc::new(AtomicBool::new(false)),
            groups_opened: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every publish fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every successful publish, in order.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published()
            .await
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub async fn stream_entries(&self, stream: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Unacknowledged entries across every consumer of a group.
    pub async fn group_pending(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .await
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map(|g| g.pending.len())
            .unwrap_or_default()
    }

    /// Join a fresh, private group.
    pub fn subscribe(&self, topic: &str, read_count: usize) -> MemorySubscription {
        let group = format!("group-{}", self.groups_opened.fetch_add(1, Ordering::SeqCst) + 1);
        self.subscribe_as(topic, &group, "consumer", read_count)
    }

    /// Join `group` as `consumer`. Two subscriptions with the same group split
    /// the topic; the same consumer name resumes the previous owner's entries.
    pub fn subscribe_as(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        read_count: usize,
    ) -> MemorySubscription {
        MemorySubscription {
            log: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams: (0..self.partitions).map(|p| stream_name(topic, p)).collect(),
            read_count: read_count.max(1),
            claim_idle: Duration::from_secs(30),
        }
    }

    async fn append(&self, stream: String, mut entry: InboundMessage) -> String {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        entry.entry_id = format!("{}-0", state.next_seq);
        entry.stream = stream.clone();
        let id = entry.entry_id.clone();
        state.streams.entry(stream).or_default().push(entry);
        id
    }
}

#[async_trait]
impl Publisher for MemoryLog {
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("event log unavailable");
        }

        let partition = partition_for(&message.key, self.partitions);
        let stream = stream_name(&message.topic, partition);
        let entry = InboundMessage {
            topic: message.topic.clone(),
            partition,
            stream: stream.clone(),
            entry_id: String::new(),
            key: Some(message.key.clone()),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            deliveries: 0,
        };

        let id = self.append(stream, entry).await;
        self.state.lock().await.published.push(message);
        Ok(id)
    }
}

pub struct MemorySubscription {
    log: MemoryLog,
    topic: String,
    group: String,
    consumer: String,
    streams: Vec<String>,
    read_count: usize,
    claim_idle: Duration,
}

impl MemorySubscription {
    /// Minimum idle time before another consumer's entry can be claimed.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Entries this consumer holds unacknowledged.
    pub async fn pending_len(&self) -> usize {
        self.log
            .state
            .lock()
            .await
            .groups
            .get(&self.group_key())
            .map(|g| g.pending.values().filter(|p| p.consumer == self.consumer).count())
            .unwrap_or_default()
    }

    fn group_key(&self) -> (String, String) {
        (self.topic.clone(), self.group.clone())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn streams(&self) -> &[String] {
        &self.streams
    }

    async fn read(&mut self, replay: &[String]) -> anyhow::Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        let now = Instant::now();

        {
            let mut guard = self.log.state.lock().await;
            let LogState { streams, groups, .. } = &mut *guard;
            let group = groups.entry(self.group_key()).or_default();

            for stream in &self.streams {
                let entries = streams.get(stream).map(Vec::as_slice).unwrap_or_default();

                if replay.contains(stream) {
                    let mut replayed = 0;
                    for ((_, index), owner) in group
                        .pending
                        .range_mut((stream.clone(), 0)..=(stream.clone(), usize::MAX))
                        .filter(|(_, p)| p.consumer == self.consumer)
                    {
                        owner.deliveries += 1;
                        owner.delivered_at = now;
                        let mut message = entries[*index].clone();
                        message.deliveries = owner.deliveries;
                        batch.messages.push(message);
                        replayed += 1;
                    }
                    if replayed == 0 {
                        batch.drained.push(stream.clone());
                    }
                    continue;
                }

                let cursor = group.cursors.entry(stream.clone()).or_default();
                while *cursor < entries.len() && batch.messages.len() < self.read_count {
                    let mut message = entries[*cursor].clone();
                    message.deliveries = 1;
                    group.pending.insert(
                        (stream.clone(), *cursor),
                        PendingEntry {
                            consumer: self.consumer.clone(),
                            deliveries: 1,
                            delivered_at: now,
                        },
                    );
                    batch.messages.push(message);
                    *cursor += 1;
                }
            }
        }

        if batch.messages.is_empty() && batch.drained.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(batch)
    }

    async fn claim_idle(&mut self) -> anyhow::Result<Vec<InboundMessage>> {
        let now = Instant::now();
        let mut guard = self.log.state.lock().await;
        let LogState { streams, groups, .. } = &mut *guard;
        let group = groups.entry(self.group_key()).or_default();

        let mut claimed = Vec::new();
        for stream in &self.streams {
            let entries = streams.get(stream).map(Vec::as_slice).unwrap_or_default();
            let stale = group
                .pending
                .range_mut((stream.clone(), 0)..=(stream.clone(), usize::MAX))
                .filter(|(_, p)| {
                    p.consumer != self.consumer && now.duration_since(p.delivered_at) >= self.claim_idle
                })
                .take(self.read_count);

            for ((_, index), owner) in stale {
                tracing::info!(
                    stream = %stream,
                    entry_id = %entries[*index].entry_id,
                    from = %owner.consumer,
                    deliveries = owner.deliveries + 1,
                    "claimed idle entry"
                );
                owner.consumer = self.consumer.clone();
                owner.deliveries += 1;
                owner.delivered_at = now;
                let mut message = entries[*index].clone();
                message.deliveries = owner.deliveries;
                claimed.push(message);
            }
        }
        Ok(claimed)
    }

    async fn ack(&mut self, message: &InboundMessage) -> anyhow::Result<()> {
        let mut guard = self.log.state.lock().await;
        let LogState { streams, groups, .. } = &mut *guard;
        let Some(group) = groups.get_mut(&self.group_key()) else {
            return Ok(());
        };
        let index = streams
            .get(&message.stream)
            .and_then(|entries| entries.iter().position(|e| e.entry_id == message.entry_id));
        if let Some(index) = index {
            group.pending.remove(&(message.stream.clone(), index));
        }
        Ok(())
    }

    async fn dead_letter(&mut self, message: &InboundMessage, reason: &str) -> anyhow::Result<()> {
        let mut copy = message.clone();
        copy.headers.insert("dead-letter-reason".into(), reason.to_string());
        copy.headers.insert("source-stream".into(), message.stream.clone());
        self.log.append(dead_letter_stream(&self.topic), copy).await;
        self.ack(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_same_key_lands_on_one_stream_in_order() {
        let log = MemoryLog::new(3);
        for n in 0..3 {
            log.publish(OutboundMessage::json("t", "ctx-1", &json!({"n": n})))
                .await
                .unwrap();
        }

        let stream = stream_name("t", partition_for("ctx-1", 3));
        let entries = log.stream_entries(&stream).await;
        assert_eq!(entries.len(), 3);
        let ns: Vec<u64> = entries
            .iter()
            .map(|e| serde_json::from_slice::<serde_json::Value>(&e.payload).unwrap()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unacked_entries_replay_in_order() {
        let log = MemoryLog::new(1);
        log.publish(OutboundMessage::json("t", "k", &json!({"n": 1}))).await.unwrap();
        log.publish(OutboundMessage::json("t", "k", &json!({"n": 2}))).await.unwrap();

        let mut sub = log.subscribe("t", 10);
        let first = sub.read(&[]).await.unwrap();
        assert_eq!(first.messages.len(), 2);
        sub.ack(&first.messages[0]).await.unwrap();

        let replay = sub.read(&["t:0".to_string()]).await.unwrap();
        assert_eq!(replay.messages.len(), 1);
        assert_eq!(replay.messages[0].entry_id, first.messages[1].entry_id);
        assert_eq!(replay.messages[0].deliveries, 2);

        sub.ack(&replay.messages[0]).await.unwrap();
        let drained = sub.read(&["t:0".to_string()]).await.unwrap();
        assert_eq!(drained.drained, vec!["t:0".to_string()]);
    }

    #[tokio::test]
    async fn test_group_members_split_the_topic() {
        let log = MemoryLog::new(1);
        log.publish(OutboundMessage::json("t", "k", &json!({"n": 1}))).await.unwrap();
        log.publish(OutboundMessage::json("t", "k", &json!({"n": 2}))).await.unwrap();

        let mut a = log.subscribe_as("t", "g", "a", 1);
        let mut b = log.subscribe_as("t", "g", "b", 1);
        let from_a = a.read(&[]).await.unwrap();
        let from_b = b.read(&[]).await.unwrap();

        assert_eq!(from_a.messages.len(), 1);
        assert_eq!(from_b.messages.len(), 1);
        assert_ne!(from_a.messages[0].entry_id, from_b.messages[0].entry_id);
        assert_eq!(log.group_pending("t", "g").await, 2);

        // Another group still sees everything.
        let mut other = log.subscribe("t", 10);
        assert_eq!(other.read(&[]).await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_respects_idle_time_and_counts_deliveries() {
        let log = MemoryLog::new(1);
        log.publish(OutboundMessage::json("t", "k", &json!({"n": 1}))).await.unwrap();

        let mut owner = log.subscribe_as("t", "g", "a", 10);
        owner.read(&[]).await.unwrap();

        let mut patient = log.subscribe_as("t", "g", "b", 10).with_claim_idle(Duration::from_secs(60));
        assert!(patient.claim_idle().await.unwrap().is_empty());

        let mut eager = log.subscribe_as("t", "g", "b", 10).with_claim_idle(Duration::ZERO);
        let claimed = eager.claim_idle().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].deliveries, 2);
        assert_eq!(owner.pending_len().await, 0);
        assert_eq!(eager.pending_len().await, 1);

        // A consumer never claims from itself.
        assert!(eager.claim_idle().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_log_rejects_publish() {
        let log = MemoryLog::new(1);
        log.set_unavailable(true);
        assert!(log.publish(OutboundMessage::json("t", "k", &json!({}))).await.is_err());
        assert!(log.published().await.is_empty());
    }
}
