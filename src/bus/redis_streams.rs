//! Event log on Redis Streams.
//!
//! Each topic is `P` streams (`<topic>:<n>`). Entries carry three fields:
//! `key`, `headers` (a JSON object) and `payload` (raw bytes). Consumers are
//! members of a consumer group; unacknowledged entries stay in the group's
//! pending list until acked, replayed, claimed or dead-lettered.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;

use crate::bus::{
    dead_letter_stream, partition_for, stream_name, Acks, Headers, InboundMessage,
    OutboundMessage, Publisher, ReadBatch, Subscription,
};

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub partitions: u32,
    /// Approximate cap on entries kept per stream.
    pub max_len: usize,
    /// Replicas that must confirm an `Acks::All` publish; `0` disables the wait.
    pub min_replicas: u32,
    pub replica_timeout: Duration,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            partitions: 3,
            max_len: 100_000,
            min_replicas: 0,
            replica_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub read_count: usize,
    pub block: Duration,
    /// Minimum idle time before another consumer's pending entry is claimed.
    pub claim_idle: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            read_count: 16,
            block: Duration::from_millis(5000),
            claim_idle: Duration::from_secs(30),
        }
    }
}

/// Process-wide handle: publishes over one shared connection and hands out
/// subscriptions, each on a dedicated connection so blocking reads never
/// stall publishers.
#[derive(Clone)]
pub struct RedisLog {
    client: redis::Client,
    conn: ConnectionManager,
    settings: LogSettings,
}

impl RedisLog {
    pub async fn connect(redis_url: &str, settings: LogSettings) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to Redis")?;
        Ok(Self {
            client,
            conn,
            settings,
        })
    }

    /// Join `group` on every partition of `topic`, creating streams and the
    /// group as needed.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        options: SubscribeOptions,
    ) -> anyhow::Result<StreamSubscription> {
        let mut conn = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to open consumer connection")?;

        let streams: Vec<String> = (0..self.settings.partitions.max(1))
            .map(|p| stream_name(topic, p))
            .collect();
        for stream in &streams {
            ensure_group(&mut conn, stream, group).await?;
        }

        tracing::info!(topic, group, consumer, partitions = streams.len(), "subscribed");

        Ok(StreamSubscription {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
            options,
            max_len: self.settings.max_len,
        })
    }
}

async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> anyhow::Result<()> {
    match conn
        .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
        .await
    {
        Ok(()) => {
            tracing::debug!(stream, group, "created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("XGROUP CREATE {stream} {group}"))),
    }
}

#[async_trait]
impl Publisher for RedisLog {
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<String> {
        let partition = partition_for(&message.key, self.settings.partitions);
        let stream = stream_name(&message.topic, partition);
        let headers = serde_json::to_string(&message.headers)?;

        let mut conn = self.conn.clone();
        let fields: [(&str, &[u8]); 3] = [
            ("key", message.key.as_bytes()),
            ("headers", headers.as_bytes()),
            ("payload", &message.payload[..]),
        ];
        let entry_id: String = conn
            .xadd_maxlen(&stream, StreamMaxlen::Approx(self.settings.max_len), "*", &fields)
            .await
            .with_context(|| format!("XADD {stream}"))?;

        if message.acks == Acks::All && self.settings.min_replicas > 0 {
            let acked: i64 = redis::cmd("WAIT")
                .arg(self.settings.min_replicas)
                .arg(self.settings.replica_timeout.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .context("WAIT for replicas")?;
            if acked < i64::from(self.settings.min_replicas) {
                anyhow::bail!(
                    "entry {} on {} reached {} of {} required replicas",
                    entry_id,
                    stream,
                    acked,
                    self.settings.min_replicas
                );
            }
        }

        tracing::debug!(stream = %stream, entry_id = %entry_id, key = %message.key, "published");
        Ok(entry_id)
    }
}

pub struct StreamSubscription {
    conn: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    streams: Vec<String>,
    options: SubscribeOptions,
    max_len: usize,
}

impl StreamSubscription {
    fn partition_of(&self, stream: &str) -> u32 {
        self.streams
            .iter()
            .position(|s| s == stream)
            .unwrap_or_default() as u32
    }

    fn decode(&self, stream: &str, entry: &StreamId, deliveries: u64) -> InboundMessage {
        let headers: Headers = entry
            .get::<String>("headers")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        InboundMessage {
            topic: self.topic.clone(),
            partition: self.partition_of(stream),
            stream: stream.to_string(),
            entry_id: entry.id.clone(),
            key: entry.get::<String>("key").filter(|k| !k.is_empty()),
            headers,
            payload: entry
                .get::<Vec<u8>>("payload")
                .map(Bytes::from)
                .unwrap_or_default(),
            deliveries,
        }
    }
}

#[async_trait]
impl Subscription for StreamSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn streams(&self) -> &[String] {
        &self.streams
    }

    async fn read(&mut self, replay: &[String]) -> anyhow::Result<ReadBatch> {
        let ids: Vec<&str> = self
            .streams
            .iter()
            .map(|s| if replay.contains(s) { "0" } else { ">" })
            .collect();

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.options.read_count)
            .block(self.options.block.as_millis() as usize);

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&self.streams, &ids, &opts)
            .await
            .with_context(|| format!("XREADGROUP {} {}", self.group, self.topic))?;

        let mut batch = ReadBatch::default();
        let mut replayed: HashSet<String> = HashSet::new();

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            let replaying = replay.contains(&key.key);
            if replaying && !key.ids.is_empty() {
                replayed.insert(key.key.clone());
            }
            for entry in &key.ids {
                // Replayed entries carry no delivery count; the runtime tracks it.
                let deliveries = if replaying { 0 } else { 1 };
                batch.messages.push(self.decode(&key.key, entry, deliveries));
            }
        }

        batch.drained = replay
            .iter()
            .filter(|s| !replayed.contains(*s))
            .cloned()
            .collect();
        Ok(batch)
    }

    async fn claim_idle(&mut self) -> anyhow::Result<Vec<InboundMessage>> {
        let min_idle = self.options.claim_idle.as_millis() as usize;
        let mut claimed = Vec::new();

        for stream in self.streams.clone() {
            let pending: StreamPendingCountReply = self
                .conn
                .xpending_count(&stream, &self.group, "-", "+", self.options.read_count)
                .await
                .with_context(|| format!("XPENDING {stream}"))?;

            let stale: HashMap<String, usize> = pending
                .ids
                .into_iter()
                .filter(|p| p.consumer != self.consumer && p.last_delivered_ms >= min_idle)
                .map(|p| (p.id, p.times_delivered))
                .collect();
            if stale.is_empty() {
                continue;
            }

            let mut ids: Vec<&str> = stale.keys().map(String::as_str).collect();
            ids.sort_by(|a, b| compare_entry_ids(a, b));

            let reply: StreamClaimReply = self
                .conn
                .xclaim(&stream, &self.group, &self.consumer, min_idle, &ids)
                .await
                .with_context(|| format!("XCLAIM {stream}"))?;

            for entry in &reply.ids {
                let previous = stale.get(&entry.id).copied().unwrap_or_default() as u64;
                tracing::info!(
                    stream = %stream,
                    entry_id = %entry.id,
                    deliveries = previous + 1,
                    "claimed idle entry"
                );
                claimed.push(self.decode(&stream, entry, previous + 1));
            }
        }

        Ok(claimed)
    }

    async fn ack(&mut self, message: &InboundMessage) -> anyhow::Result<()> {
        self.conn
            .xack::<_, _, _, i64>(&message.stream, &self.group, &[&message.entry_id])
            .await
            .with_context(|| format!("XACK {} {}", message.stream, message.entry_id))?;
        Ok(())
    }

    async fn dead_letter(&mut self, message: &InboundMessage, reason: &str) -> anyhow::Result<()> {
        let target = dead_letter_stream(&self.topic);
        let headers = serde_json::to_string(&message.headers)?;
        let key = message.key.clone().unwrap_or_default();

        let fields: [(&str, &[u8]); 6] = [
            ("source_stream", message.stream.as_bytes()),
            ("entry_id", message.entry_id.as_bytes()),
            ("key", key.as_bytes()),
            ("headers", headers.as_bytes()),
            ("payload", &message.payload[..]),
            ("reason", reason.as_bytes()),
        ];
        self.conn
            .xadd_maxlen::<_, _, _, _, String>(&target, StreamMaxlen::Approx(self.max_len), "*", &fields)
            .await
            .with_context(|| format!("XADD {target}"))?;

        self.ack(message).await
    }
}

/// Order `<ms>-<seq>` entry ids numerically.
fn compare_entry_ids(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(id: &str) -> (u64, u64) {
        let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
        (ms.parse().unwrap_or_default(), seq.parse().unwrap_or_default())
    }
    parts(a).cmp(&parts(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_ordering_is_numeric() {
        let mut ids = vec!["1700000000010-0", "1700000000002-5", "1700000000002-12"];
        ids.sort_by(|a, b| compare_entry_ids(a, b));
        assert_eq!(ids, vec!["1700000000002-5", "1700000000002-12", "1700000000010-0"]);
    }

    #[test]
    fn test_default_settings() {
        let s = LogSettings::default();
        assert_eq!(s.partitions, 3);
        assert_eq!(s.min_replicas, 0);
        let o = SubscribeOptions::default();
        assert_eq!(o.read_count, 16);
        assert_eq!(o.claim_idle, Duration::from_secs(30));
    }
}
