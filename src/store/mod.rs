//! Durable state for approvals, the audit trail and approver channels.

use async_trait::async_trait;

use crate::models::approval::{Approval, ApprovalStatus, ApprovalUpsert};
use crate::models::audit::{AuditEvent, NewAuditEvent};
use crate::models::channel::ChannelConfig;

pub mod memory;
pub mod postgres;
pub mod tx;

/// One materialization: the audit row and the aggregate upsert, written in a
/// single transaction.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub upsert: ApprovalUpsert,
    pub audit: NewAuditEvent,
}

/// One human decision: the status change and its audit row, written in a
/// single transaction. The audit row is appended even when no aggregate
/// exists for the context id.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub context_id: String,
    pub status: ApprovalStatus,
    pub audit: NewAuditEvent,
}

/// Everything the pipeline and the query API need from the store.
///
/// Multi-statement writes run through [`tx::run_in_transaction`] inside the
/// implementation, so callers see either the whole write or nothing.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn materialize_request(&self, request: &MaterializeRequest) -> anyhow::Result<Approval>;

    /// Returns the updated aggregate, or `None` when the context id is unknown.
    async fn apply_decision(&self, decision: &DecisionRecord) -> anyhow::Result<Option<Approval>>;

    /// Single-statement append outside any pipeline transaction.
    async fn append_event(&self, event: &NewAuditEvent) -> anyhow::Result<i64>;

    async fn channels_for(&self, username: &str) -> anyhow::Result<Option<ChannelConfig>>;

    async fn upsert_channel(&self, config: &ChannelConfig) -> anyhow::Result<()>;

    async fn get_approval(&self, context_id: &str) -> anyhow::Result<Option<Approval>>;

    /// Newest first.
    async fn list_approvals(&self, approver: &str) -> anyhow::Result<Vec<Approval>>;

    /// Oldest first.
    async fn list_events(&self, context_id: &str) -> anyhow::Result<Vec<AuditEvent>>;
}
