//! Notification dispatch tests.
//!
//! These tests verify:
//! 1. A failing channel never blocks the others: each settles independently
//! 2. `notification_sent` records per-channel results and settlements
//! 3. Missing approvers, missing rows and blank channels are audited as skips
//! 4. A failing audit append does not fail the dispatch
//!
//! Webhook endpoints are served by wiremock; email goes to an in-process mailer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pipeline::models::channel::{ChannelConfig, ChannelKind};
use pipeline::models::event::ApprovalCreated;
use pipeline::notification::email::{EmailMessage, Mailer};
use pipeline::notification::fanout::{Fanout, SettleStatus};
use pipeline::notification::webhook::{DeliveryReport, WebhookSender};
use pipeline::pipeline::notifier::{DispatchOutcome, SkipReason};
use pipeline::pipeline::Dispatcher;
use pipeline::store::memory::MemoryStore;

struct AcceptingMailer;

#[async_trait]
impl Mailer for AcceptingMailer {
    async fn send(&self, _message: &EmailMessage) -> anyhow::Result<DeliveryReport> {
        Ok(DeliveryReport::delivered(None))
    }
}

fn dispatcher(store: &MemoryStore) -> Dispatcher {
    let webhook = WebhookSender::new(Duration::from_secs(2), None).unwrap();
    Dispatcher::new(
        Arc::new(store.clone()),
        Fanout::new(webhook, Arc::new(AcceptingMailer), Duration::from_secs(5), "[HITL] "),
    )
}

fn notification(approver: Option<&str>) -> ApprovalCreated {
    ApprovalCreated::new(
        "ctx-1".into(),
        approver.map(String::from),
        Some("Deploy".into()),
        "2025-01-01T00:00:00Z".into(),
        json!({"variables": null}),
    )
}

mod isolation_tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_block_email() {
        let store = MemoryStore::new();
        store.set_channels(ChannelConfig {
            username: "alice".into(),
            // Nothing listens on the discard port.
            webhook: Some("http://127.0.0.1:9/hook".into()),
            email: Some("alice@example.com".into()),
        });

        let outcome = dispatcher(&store).dispatch(&notification(Some("alice"))).await.unwrap();
        let DispatchOutcome::Sent(result) = outcome else {
            panic!("expected a fan-out");
        };

        let webhook = result.settlement(ChannelKind::Webhook).unwrap();
        assert_eq!(webhook.status, SettleStatus::Rejected);
        assert!(webhook.reason.is_some());
        let email = result.settlement(ChannelKind::Email).unwrap();
        assert_eq!(email.status, SettleStatus::Fulfilled);

        let events = store.all_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "notification_sent");
        assert_eq!(events[0].actor.as_deref(), Some("notifier"));
        let settled = events[0].payload["settled"].as_array().unwrap();
        assert_eq!(settled.len(), 2);
        assert!(settled.iter().any(|s| s["status"] == "rejected"));
        assert!(settled.iter().any(|s| s["status"] == "fulfilled"));
        assert_eq!(events[0].payload["results"]["email"]["ok"], true);
        assert_eq!(events[0].payload["notification"]["context_id"], "ctx-1");
    }

    #[tokio::test]
    async fn test_non_2xx_webhook_is_fulfilled_but_not_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        store.set_channels(ChannelConfig {
            username: "alice".into(),
            webhook: Some(format!("{}/hook", server.uri())),
            email: None,
        });

        let DispatchOutcome::Sent(result) =
            dispatcher(&store).dispatch(&notification(Some("alice"))).await.unwrap()
        else {
            panic!("expected a fan-out");
        };

        assert_eq!(
            result.settlement(ChannelKind::Webhook).unwrap().status,
            SettleStatus::Fulfilled
        );
        let report = &result.results["webhook"];
        assert!(!report.ok);
        assert_eq!(report.status, Some(500));
    }

    #[tokio::test]
    async fn test_audit_failure_is_swallowed() {
        let store = MemoryStore::new();
        store.set_channels(ChannelConfig {
            username: "alice".into(),
            webhook: None,
            email: Some("alice@example.com".into()),
        });
        store.inject_append_failures(1);

        let outcome = dispatcher(&store).dispatch(&notification(Some("alice"))).await;
        assert!(matches!(outcome, Ok(DispatchOutcome::Sent(_))));
        assert!(store.all_events().await.is_empty());
    }
}

mod skip_tests {
    use super::*;

    async fn skipped(store: &MemoryStore, approver: Option<&str>) -> SkipReason {
        match dispatcher(store).dispatch(&notification(approver)).await.unwrap() {
            DispatchOutcome::Skipped(reason) => reason,
            DispatchOutcome::Sent(_) => panic!("expected a skip"),
        }
    }

    #[tokio::test]
    async fn test_missing_approver() {
        let store = MemoryStore::new();
        assert_eq!(skipped(&store, None).await, SkipReason::NoApprover);

        let events = store.all_events().await;
        assert_eq!(events[0].event_type, "notification_skipped");
        assert_eq!(events[0].payload["reason"], "no_approver");
    }

    #[tokio::test]
    async fn test_unknown_approver() {
        let store = MemoryStore::new();
        assert_eq!(skipped(&store, Some("nobody")).await, SkipReason::NoChannels);
        assert_eq!(store.all_events().await[0].payload["reason"], "no_channels");
    }

    #[tokio::test]
    async fn test_blank_channels() {
        let store = MemoryStore::new();
        store.set_channels(ChannelConfig {
            username: "alice".into(),
            webhook: Some("   ".into()),
            email: Some("".into()),
        });

        assert_eq!(skipped(&store, Some("alice")).await, SkipReason::NoActionableChannels);
        let events = store.all_events().await;
        assert_eq!(events[0].payload["reason"], "no_actionable_channels");
        assert_eq!(events[0].payload["channels"]["username"], "alice");
    }
}
