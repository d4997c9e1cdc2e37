//! Prometheus metrics for the approval pipeline.
//!
//! Exposed on `/metrics` for scraping. All counters live in the global default
//! registry and are registered once, on first use.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, CounterVec, Encoder, TextEncoder};

pub struct PipelineMetrics {
    messages_total: CounterVec,
    transaction_retries_total: CounterVec,
    channel_deliveries_total: CounterVec,
    post_commit_emits_total: CounterVec,
    dead_letters_total: CounterVec,
}

static METRICS: Lazy<PipelineMetrics> = Lazy::new(PipelineMetrics::register);

impl PipelineMetrics {
    fn register() -> Self {
        let messages_total = register_counter_vec!(
            opts!("hitl_messages_total", "Messages settled by consumers"),
            &["consumer", "outcome"]
        )
        .expect("failed to register hitl_messages_total");

        let transaction_retries_total = register_counter_vec!(
            opts!("hitl_transaction_retries_total", "Store transactions retried after an error"),
            &["operation"]
        )
        .expect("failed to register hitl_transaction_retries_total");

        let channel_deliveries_total = register_counter_vec!(
            opts!("hitl_channel_deliveries_total", "Notification deliveries by channel"),
            &["channel", "result"]
        )
        .expect("failed to register hitl_channel_deliveries_total");

        let post_commit_emits_total = register_counter_vec!(
            opts!("hitl_post_commit_emits_total", "Events emitted after a committed transaction"),
            &["topic", "result"]
        )
        .expect("failed to register hitl_post_commit_emits_total");

        let dead_letters_total = register_counter_vec!(
            opts!("hitl_dead_letters_total", "Messages moved to a dead-letter stream"),
            &["topic"]
        )
        .expect("failed to register hitl_dead_letters_total");

        Self {
            messages_total,
            transaction_retries_total,
            channel_deliveries_total,
            post_commit_emits_total,
            dead_letters_total,
        }
    }
}

/// Force registration so `/metrics` lists every series from startup.
pub fn init() {
    Lazy::force(&METRICS);
}

pub fn message_settled(consumer: &str, outcome: &str) {
    METRICS.messages_total.with_label_values(&[consumer, outcome]).inc();
}

pub fn transaction_retry(operation: &str) {
    METRICS
        .transaction_retries_total
        .with_label_values(&[operation])
        .inc();
}

pub fn channel_delivery(channel: &str, result: &str) {
    METRICS
        .channel_deliveries_total
        .with_label_values(&[channel, result])
        .inc();
}

pub fn post_commit_emit(topic: &str, result: &str) {
    METRICS
        .post_commit_emits_total
        .with_label_values(&[topic, result])
        .inc();
}

pub fn dead_letter(topic: &str) {
    METRICS.dead_letters_total.with_label_values(&[topic]).inc();
}

/// Render all metrics in Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_counters() {
        init();
        message_settled("materializer", "processed");
        let text = render();
        assert!(text.contains("hitl_messages_total"));
    }
}
