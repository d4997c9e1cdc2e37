//! Emit-after-commit.
//!
//! Events derived from a committed transaction are published once, after the
//! commit, and never retried. A lost emit is logged and counted; it never
//! rolls back or fails the work that produced it.

use crate::bus::{OutboundMessage, Publisher};
use crate::metrics;

#[derive(Debug)]
pub enum EmitOutcome {
    Published(String),
    Lost(anyhow::Error),
}

impl EmitOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, EmitOutcome::Published(_))
    }
}

pub async fn emit_after_commit(publisher: &dyn Publisher, message: OutboundMessage) -> EmitOutcome {
    let topic = message.topic.clone();
    let key = message.key.clone();

    match publisher.publish(message).await {
        Ok(entry_id) => {
            tracing::info!(topic = %topic, key = %key, entry_id = %entry_id, "post-commit event emitted");
            metrics::post_commit_emit(&topic, "published");
            EmitOutcome::Published(entry_id)
        }
        Err(e) => {
            tracing::warn!(topic = %topic, key = %key, error = %e, "post-commit event lost");
            metrics::post_commit_emit(&topic, "lost");
            EmitOutcome::Lost(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryLog;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reports_loss_without_error() {
        let log = MemoryLog::new(1);
        log.set_unavailable(true);
        let outcome = emit_after_commit(&log, OutboundMessage::json("n", "ctx", &json!({}))).await;
        assert!(matches!(outcome, EmitOutcome::Lost(_)));

        log.set_unavailable(false);
        let outcome = emit_after_commit(&log, OutboundMessage::json("n", "ctx", &json!({}))).await;
        assert!(outcome.is_published());
    }
}
