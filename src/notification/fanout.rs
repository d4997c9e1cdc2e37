//! Parallel delivery of one notification to every populated channel.
//!
//! Each channel runs as its own task under its own timeout. All handles are
//! joined together; a failure, timeout or panic in one task is recorded as
//! that channel's rejection and never touches the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::metrics;
use crate::models::channel::{ChannelKind, DeliveryChannel};
use crate::models::event::{ApprovalCreated, APPROVAL_CREATED};
use crate::notification::email::{compose, Mailer};
use crate::notification::webhook::{DeliveryReport, WebhookSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleStatus {
    Fulfilled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub channel: ChannelKind,
    pub status: SettleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Fixed-shape outcome of a fan-out: one report and one settlement per channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutResult {
    pub results: BTreeMap<&'static str, DeliveryReport>,
    pub settled: Vec<Settlement>,
}

impl FanoutResult {
    pub fn settlement(&self, channel: ChannelKind) -> Option<&Settlement> {
        self.settled.iter().find(|s| s.channel == channel)
    }
}

#[derive(Clone)]
pub struct Fanout {
    webhook: WebhookSender,
    mailer: Arc<dyn Mailer>,
    timeout: Duration,
    subject_prefix: String,
}

impl Fanout {
    pub fn new(
        webhook: WebhookSender,
        mailer: Arc<dyn Mailer>,
        timeout: Duration,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            webhook,
            mailer,
            timeout,
            subject_prefix: subject_prefix.into(),
        }
    }

    pub async fn deliver(&self, notification: &ApprovalCreated, channels: Vec<DeliveryChannel>) -> FanoutResult {
        let tasks: Vec<_> = channels
            .into_iter()
            .map(|channel| {
                let kind = channel.kind();
                let work = self.clone().deliver_one(channel, notification.clone());
                let timeout = self.timeout;
                let handle = tokio::spawn(async move { tokio::time::timeout(timeout, work).await });
                (kind, handle)
            })
            .collect();

        let (kinds, handles): (Vec<ChannelKind>, Vec<_>) = tasks.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut outcome = FanoutResult::default();
        for (kind, joined) in kinds.into_iter().zip(joined) {
            let settled = match joined {
                Ok(Ok(Ok(report))) => Ok(report),
                Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
                Ok(Err(_)) => Err(format!("timed out after {:?}", self.timeout)),
                Err(join_err) if join_err.is_panic() => Err("delivery task panicked".to_string()),
                Err(join_err) => Err(format!("delivery task aborted: {}", join_err)),
            };

            match settled {
                Ok(report) => {
                    metrics::channel_delivery(kind.as_str(), if report.ok { "delivered" } else { "failed" });
                    outcome.results.insert(kind.as_str(), report);
                    outcome.settled.push(Settlement {
                        channel: kind,
                        status: SettleStatus::Fulfilled,
                        reason: None,
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        context_id = %notification.context_id,
                        channel = kind.as_str(),
                        reason = %reason,
                        "channel delivery rejected"
                    );
                    metrics::channel_delivery(kind.as_str(), "rejected");
                    outcome
                        .results
                        .insert(kind.as_str(), DeliveryReport::failed(&reason));
                    outcome.settled.push(Settlement {
                        channel: kind,
                        status: SettleStatus::Rejected,
                        reason: Some(reason),
                    });
                }
            }
        }

        outcome
    }

    async fn deliver_one(self, channel: DeliveryChannel, notification: ApprovalCreated) -> anyhow::Result<DeliveryReport> {
        match channel {
            DeliveryChannel::Webhook { url } => {
                self.webhook
                    .send(&url, APPROVAL_CREATED, &notification.raw)
                    .await
            }
            DeliveryChannel::Email { recipients } => {
                let message = compose(&notification, &recipients, &self.subject_prefix);
                self.mailer.send(&message).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::email::EmailMessage;
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowMailer;

    #[async_trait]
    impl Mailer for SlowMailer {
        async fn send(&self, _message: &EmailMessage) -> anyhow::Result<DeliveryReport> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DeliveryReport::delivered(Some(250)))
        }
    }

    struct PanickingMailer;

    #[async_trait]
    impl Mailer for PanickingMailer {
        async fn send(&self, _message: &EmailMessage) -> anyhow::Result<DeliveryReport> {
            panic!("mail relay exploded");
        }
    }

    fn notification() -> ApprovalCreated {
        ApprovalCreated::new("ctx-1".into(), Some("alice".into()), None, "t".into(), json!({}))
    }

    fn email_only() -> Vec<DeliveryChannel> {
        vec![DeliveryChannel::Email {
            recipients: vec!["alice@example.com".into()],
        }]
    }

    #[tokio::test]
    async fn test_timeout_is_a_rejection() {
        let fanout = Fanout::new(
            WebhookSender::new(Duration::from_secs(1), None).unwrap(),
            Arc::new(SlowMailer),
            Duration::from_millis(50),
            "",
        );
        let out = fanout.deliver(&notification(), email_only()).await;
        let s = out.settlement(ChannelKind::Email).unwrap();
        assert_eq!(s.status, SettleStatus::Rejected);
        assert_eq!(s.reason.as_deref(), Some("timed out after 50ms"));
        assert!(!out.results["email"].ok);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let fanout = Fanout::new(
            WebhookSender::new(Duration::from_secs(1), None).unwrap(),
            Arc::new(PanickingMailer),
            Duration::from_secs(1),
            "",
        );
        let out = fanout.deliver(&notification(), email_only()).await;
        assert_eq!(
            out.settlement(ChannelKind::Email).unwrap().reason.as_deref(),
            Some("delivery task panicked")
        );
    }

    #[tokio::test]
    async fn test_no_channels_settles_nothing() {
        let fanout = Fanout::new(
            WebhookSender::new(Duration::from_secs(1), None).unwrap(),
            Arc::new(SlowMailer),
            Duration::from_secs(1),
            "",
        );
        let out = fanout.deliver(&notification(), vec![]).await;
        assert!(out.settled.is_empty());
        assert!(out.results.is_empty());
    }
}
