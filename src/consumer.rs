//! Consumer runtime shared by the pipeline components.
//!
//! Messages are handled one at a time. `Processed` and `Dropped` are acked.
//! `Failed` is not: the entry stays pending, the rest of that partition is
//! held back, and after `replay_delay` the consumer re-reads its own pending
//! entries for the partition in id order. An entry handed out more than
//! `max_deliveries` times goes to the dead-letter stream instead.
//!
//! Every partition starts out due for replay, so entries a previous process
//! under the same consumer name read but never settled go first.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::bus::{InboundMessage, Subscription};
use crate::metrics;

#[derive(Debug)]
pub enum HandlerOutcome {
    Processed,
    /// Malformed or irrelevant input; acked without retry.
    Dropped(String),
    /// Transient failure; left pending for redelivery.
    Failed(anyhow::Error),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, message: &InboundMessage) -> HandlerOutcome;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_deliveries: u64,
    pub reclaim_interval: Duration,
    pub replay_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            reclaim_interval: Duration::from_secs(15),
            replay_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub processed: usize,
    pub dropped: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub held_back: usize,
}

#[derive(Default)]
struct Attempts {
    count: u64,
    last_error: Option<String>,
}

pub struct Consumer<S: Subscription> {
    subscription: S,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    /// Partition streams with a failed entry, and when to replay them.
    stalled: HashMap<String, Instant>,
    attempts: HashMap<String, Attempts>,
    next_reclaim: Instant,
}

impl<S: Subscription> Consumer<S> {
    pub fn new(subscription: S, handler: Arc<dyn MessageHandler>, settings: ConsumerSettings) -> Self {
        let now = Instant::now();
        let stalled = subscription
            .streams()
            .iter()
            .map(|stream| (stream.clone(), now))
            .collect();
        Self {
            subscription,
            handler,
            settings,
            stalled,
            attempts: HashMap::new(),
            next_reclaim: Instant::now(),
        }
    }

    pub fn subscription(&self) -> &S {
        &self.subscription
    }

    /// Read and settle until `shutdown` flips. The message being handled when
    /// the signal arrives is always settled first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.handler.name();
        tracing::info!(consumer = name, topic = self.subscription.topic(), "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= self.next_reclaim {
                if let Err(e) = self.reclaim_once().await {
                    tracing::warn!(consumer = name, error = %e, "reclaim sweep failed");
                }
                self.next_reclaim = Instant::now() + self.settings.reclaim_interval;
            }

            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.next_batch() => read,
            };

            match read {
                Ok((messages, replay)) => {
                    let mut stats = PollStats::default();
                    self.process(messages, &replay, &mut stats).await;
                }
                Err(e) => {
                    tracing::error!(consumer = name, error = %e, "read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        tracing::info!(consumer = name, "consumer stopped");
        Ok(())
    }

    /// One read-and-settle pass.
    pub async fn poll_once(&mut self) -> anyhow::Result<PollStats> {
        let (messages, replay) = self.next_batch().await?;
        let mut stats = PollStats::default();
        self.process(messages, &replay, &mut stats).await;
        Ok(stats)
    }

    /// Read until something arrives or nothing is left to replay. A read that
    /// only drains replays is followed straight away by one for new entries.
    async fn next_batch(&mut self) -> anyhow::Result<(Vec<InboundMessage>, Vec<String>)> {
        loop {
            let replay = self.due_replays();
            let batch = self.subscription.read(&replay).await?;
            self.settle_drained(&batch.drained);
            if batch.messages.is_empty() && !batch.drained.is_empty() {
                continue;
            }
            return Ok((batch.messages, replay));
        }
    }

    /// Claim and settle entries abandoned by other consumers.
    pub async fn reclaim_once(&mut self) -> anyhow::Result<PollStats> {
        let claimed = self.subscription.claim_idle().await?;
        let mut stats = PollStats::default();
        if !claimed.is_empty() {
            self.process(claimed, &[], &mut stats).await;
        }
        Ok(stats)
    }

    fn due_replays(&self) -> Vec<String> {
        let now = Instant::now();
        self.stalled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(stream, _)| stream.clone())
            .collect()
    }

    fn settle_drained(&mut self, drained: &[String]) {
        for stream in drained {
            if self.stalled.remove(stream).is_some() {
                tracing::info!(consumer = self.handler.name(), stream = %stream, "partition caught up");
            }
        }
    }

    fn stall(&mut self, stream: &str) {
        self.stalled
            .insert(stream.to_string(), Instant::now() + self.settings.replay_delay);
    }

    async fn process(&mut self, messages: Vec<InboundMessage>, replaying: &[String], stats: &mut PollStats) {
        let name = self.handler.name();
        let mut blocked: HashSet<String> = HashSet::new();

        for message in messages {
            let stalled_elsewhere =
                self.stalled.contains_key(&message.stream) && !replaying.contains(&message.stream);
            if stalled_elsewhere || blocked.contains(&message.stream) {
                stats.held_back += 1;
                continue;
            }

            let attempt_key = format!("{}/{}", message.stream, message.entry_id);
            let attempts = self.attempts.entry(attempt_key.clone()).or_default();
            attempts.count = (attempts.count + 1).max(message.deliveries);

            if attempts.count > self.settings.max_deliveries {
                let reason = format!(
                    "exceeded {} deliveries: {}",
                    self.settings.max_deliveries,
                    attempts.last_error.as_deref().unwrap_or("unknown error")
                );
                match self.subscription.dead_letter(&message, &reason).await {
                    Ok(()) => {
                        tracing::error!(
                            consumer = name,
                            topic = %message.topic,
                            partition = message.partition,
                            entry_id = %message.entry_id,
                            key = ?message.key,
                            reason = %reason,
                            "message dead-lettered"
                        );
                        metrics::dead_letter(&message.topic);
                        metrics::message_settled(name, "dead_lettered");
                        self.attempts.remove(&attempt_key);
                        stats.dead_lettered += 1;
                    }
                    Err(e) => {
                        tracing::error!(consumer = name, entry_id = %message.entry_id, error = %e, "dead-letter failed");
                        blocked.insert(message.stream.clone());
                        self.stall(&message.stream);
                    }
                }
                continue;
            }

            match dispatch_one(self.handler.as_ref(), &message).await {
                HandlerOutcome::Processed => {
                    metrics::message_settled(name, "processed");
                    stats.processed += 1;
                    self.attempts.remove(&attempt_key);
                    self.ack(&message).await;
                }
                HandlerOutcome::Dropped(reason) => {
                    tracing::warn!(
                        consumer = name,
                        topic = %message.topic,
                        partition = message.partition,
                        entry_id = %message.entry_id,
                        key = ?message.key,
                        reason = %reason,
                        "message dropped"
                    );
                    metrics::message_settled(name, "dropped");
                    stats.dropped += 1;
                    self.attempts.remove(&attempt_key);
                    self.ack(&message).await;
                }
                HandlerOutcome::Failed(e) => {
                    tracing::error!(
                        consumer = name,
                        topic = %message.topic,
                        partition = message.partition,
                        entry_id = %message.entry_id,
                        key = ?message.key,
                        error = %format!("{:#}", e),
                        "message failed, leaving pending"
                    );
                    metrics::message_settled(name, "failed");
                    stats.failed += 1;
                    if let Some(a) = self.attempts.get_mut(&attempt_key) {
                        a.last_error = Some(format!("{:#}", e));
                    }
                    blocked.insert(message.stream.clone());
                    self.stall(&message.stream);
                }
            }
        }
    }

    async fn ack(&mut self, message: &InboundMessage) {
        if let Err(e) = self.subscription.ack(message).await {
            tracing::error!(
                consumer = self.handler.name(),
                entry_id = %message.entry_id,
                error = %e,
                "ack failed, message will be redelivered"
            );
        }
    }
}

/// Run the handler with panics converted into `Failed`.
pub async fn dispatch_one(handler: &dyn MessageHandler, message: &InboundMessage) -> HandlerOutcome {
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let what = panic_message(panic.as_ref());
            tracing::error!(
                consumer = handler.name(),
                topic = %message.topic,
                partition = message.partition,
                entry_id = %message.entry_id,
                key = ?message.key,
                panic = %what,
                "handler panicked"
            );
            HandlerOutcome::Failed(anyhow::anyhow!("handler panicked: {}", what))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
