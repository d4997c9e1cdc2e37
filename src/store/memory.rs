//! In-process store with the same merge and transaction semantics as
//! [`PgStore`](crate::store::postgres::PgStore).
//!
//! A transaction holds the state lock and works on a staged copy; commit
//! swaps the copy in, rollback discards it. Commit and append failures can be
//! injected to exercise the retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::approval::Approval;
use crate::models::audit::{AuditEvent, NewAuditEvent};
use crate::models::channel::ChannelConfig;
use crate::store::tx::{run_in_transaction, RetryPolicy, Transactional};
use crate::store::{ApprovalStore, DecisionRecord, MaterializeRequest};

#[derive(Debug, Clone, Default)]
struct State {
    approvals: HashMap<String, Approval>,
    events: Vec<AuditEvent>,
    next_event_id: i64,
}

impl State {
    fn push_event(&mut self, event: &NewAuditEvent) -> i64 {
        self.next_event_id += 1;
        self.events.push(AuditEvent {
            id: self.next_event_id,
            context_id: event.context_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            payload: event.payload.clone(),
            actor: Some(event.actor.clone()),
            created_at: Utc::now(),
        });
        self.next_event_id
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    channels: Arc<DashMap<String, ChannelConfig>>,
    retry: RetryPolicy,
    commit_failures: Arc<AtomicU32>,
    append_failures: Arc<AtomicU32>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make the next `n` commits fail after the work has run.
    pub fn inject_commit_failures(&self, n: u32) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` standalone appends fail.
    pub fn inject_append_failures(&self, n: u32) {
        self.append_failures.store(n, Ordering::SeqCst);
    }

    /// Committed transactions plus standalone appends.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn approval_count(&self) -> usize {
        self.state.lock().await.approvals.len()
    }

    pub async fn all_events(&self) -> Vec<AuditEvent> {
        self.state.lock().await.events.clone()
    }

    pub fn set_channels(&self, config: ChannelConfig) {
        self.channels.insert(config.username.clone(), config);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transactional for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> anyhow::Result<Self::Tx> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx { guard, staged })
    }

    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()> {
        if take_one(&self.commit_failures) {
            anyhow::bail!("injected commit failure");
        }
        let MemoryTx { mut guard, staged } = tx;
        *guard = staged;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> anyhow::Result<()> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn materialize_request(&self, request: &MaterializeRequest) -> anyhow::Result<Approval> {
        let request = request.clone();
        run_in_transaction(self, &self.retry, "materialize_request", move |tx| {
            let request = request.clone();
            Box::pin(async move {
                tx.staged.push_event(&request.audit);
                let merged = request
                    .upsert
                    .apply(tx.staged.approvals.get(&request.upsert.context_id), Utc::now());
                tx.staged
                    .approvals
                    .insert(merged.context_id.clone(), merged.clone());
                Ok(merged)
            })
        })
        .await
    }

    async fn apply_decision(&self, decision: &DecisionRecord) -> anyhow::Result<Option<Approval>> {
        let decision = decision.clone();
        run_in_transaction(self, &self.retry, "apply_decision", move |tx| {
            let decision = decision.clone();
            Box::pin(async move {
                let updated = tx.staged.approvals.get_mut(&decision.context_id).map(|row| {
                    row.status = decision.status;
                    row.updated_at = Utc::now();
                    row.clone()
                });
                tx.staged.push_event(&decision.audit);
                Ok(updated)
            })
        })
        .await
    }

    async fn append_event(&self, event: &NewAuditEvent) -> anyhow::Result<i64> {
        if take_one(&self.append_failures) {
            anyhow::bail!("injected append failure");
        }
        let id = self.state.lock().await.push_event(event);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn channels_for(&self, username: &str) -> anyhow::Result<Option<ChannelConfig>> {
        Ok(self.channels.get(username).map(|c| c.clone()))
    }

    async fn upsert_channel(&self, config: &ChannelConfig) -> anyhow::Result<()> {
        let mut entry = self
            .channels
            .entry(config.username.clone())
            .or_insert_with(|| ChannelConfig {
                username: config.username.clone(),
                ..Default::default()
            });
        if config.webhook.is_some() {
            entry.webhook = config.webhook.clone();
        }
        if config.email.is_some() {
            entry.email = config.email.clone();
        }
        Ok(())
    }

    async fn get_approval(&self, context_id: &str) -> anyhow::Result<Option<Approval>> {
        Ok(self.state.lock().await.approvals.get(context_id).cloned())
    }

    async fn list_approvals(&self, approver: &str) -> anyhow::Result<Vec<Approval>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Approval> = state
            .approvals
            .values()
            .filter(|a| a.approver_name.as_deref() == Some(approver))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_events(&self, context_id: &str) -> anyhow::Result<Vec<AuditEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.context_id == context_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::approval::{ApprovalStatus, ApprovalUpsert};
    use crate::models::audit::AuditEventType;
    use serde_json::json;
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn request(context_id: &str, approver: Option<&str>) -> MaterializeRequest {
        MaterializeRequest {
            upsert: ApprovalUpsert {
                context_id: context_id.into(),
                approver: approver.map(String::from),
                title: None,
                deadline: None,
                turns: None,
                snapshot: json!({"context_id": context_id}),
            },
            audit: NewAuditEvent::new(context_id, AuditEventType::ApprovalRequested, json!({}), "agent"),
        }
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_no_partial_state() {
        let store = MemoryStore::new().with_retry_policy(fast());
        store.inject_commit_failures(2);

        store.materialize_request(&request("ctx-1", Some("alice"))).await.unwrap();

        assert_eq!(store.approval_count().await, 1);
        assert_eq!(store.list_events("ctx-1").await.unwrap().len(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_commit_failures_write_nothing() {
        let store = MemoryStore::new().with_retry_policy(fast());
        store.inject_commit_failures(10);

        assert!(store.materialize_request(&request("ctx-1", None)).await.is_err());
        assert_eq!(store.approval_count().await, 0);
        assert!(store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_decision_on_unknown_context_only_audits() {
        let store = MemoryStore::new();
        let updated = store
            .apply_decision(&DecisionRecord {
                context_id: "ghost".into(),
                status: ApprovalStatus::Approved,
                audit: NewAuditEvent::new("ghost", AuditEventType::HumanAction, json!({}), "human"),
            })
            .await
            .unwrap();

        assert!(updated.is_none());
        assert_eq!(store.approval_count().await, 0);
        assert_eq!(store.list_events("ghost").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_by_approver() {
        let store = MemoryStore::new();
        store.materialize_request(&request("a", Some("alice"))).await.unwrap();
        store.materialize_request(&request("b", Some("bob"))).await.unwrap();

        let rows = store.list_approvals("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].context_id, "a");
    }

    #[tokio::test]
    async fn test_channel_upsert_keeps_unset_fields() {
        let store = MemoryStore::new();
        store
            .upsert_channel(&ChannelConfig {
                username: "alice".into(),
                webhook: Some("https://hooks.example.com/a".into()),
                email: None,
            })
            .await
            .unwrap();
        store
            .upsert_channel(&ChannelConfig {
                username: "alice".into(),
                webhook: None,
                email: Some("alice@example.com".into()),
            })
            .await
            .unwrap();

        let cfg = store.channels_for("alice").await.unwrap().unwrap();
        assert_eq!(cfg.webhook.as_deref(), Some("https://hooks.example.com/a"));
        assert_eq!(cfg.email.as_deref(), Some("alice@example.com"));
    }
}
