use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgExecutor, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::approval::{Approval, ApprovalStatus, ApprovalUpsert};
use crate::models::audit::{AuditEvent, NewAuditEvent};
use crate::models::channel::ChannelConfig;
use crate::store::tx::{run_in_transaction, RetryPolicy, Transactional};
use crate::store::{ApprovalStore, DecisionRecord, MaterializeRequest};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self {
            pool,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Transactional for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> anyhow::Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> anyhow::Result<()> {
        tx.rollback().await?;
        Ok(())
    }
}

// -- Statements --

async fn insert_event<'e, E: PgExecutor<'e>>(executor: E, event: &NewAuditEvent) -> anyhow::Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"INSERT INTO events (context_id, type, payload, actor, created_at)
           VALUES ($1, $2, $3, $4, NOW())
           RETURNING id"#,
    )
    .bind(&event.context_id)
    .bind(event.event_type.as_str())
    .bind(&event.payload)
    .bind(&event.actor)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Insert-or-merge keyed by `context_id`. Mirrors [`ApprovalUpsert::apply`].
async fn upsert_approval<'e, E: PgExecutor<'e>>(executor: E, upsert: &ApprovalUpsert) -> anyhow::Result<Approval> {
    let row = sqlx::query_as::<_, Approval>(
        r#"INSERT INTO approvals (
               context_id, approver_name, title, deadline,
               turns, snapshot, status, created_at, updated_at
           )
           VALUES ($1, $2, $3, $4, COALESCE($5::jsonb, '[]'::jsonb), $6, 'pending', NOW(), NOW())
           ON CONFLICT (context_id) DO UPDATE
             SET snapshot = EXCLUDED.snapshot,
                 approver_name = COALESCE(EXCLUDED.approver_name, approvals.approver_name),
                 title = COALESCE(EXCLUDED.title, approvals.title),
                 deadline = COALESCE(EXCLUDED.deadline, approvals.deadline),
                 turns = COALESCE($5::jsonb, approvals.turns),
                 status = 'pending',
                 updated_at = NOW()
           RETURNING context_id, approver_name, title, deadline, turns, snapshot,
                     status, created_at, updated_at"#,
    )
    .bind(&upsert.context_id)
    .bind(&upsert.approver)
    .bind(&upsert.title)
    .bind(upsert.deadline)
    .bind(&upsert.turns)
    .bind(&upsert.snapshot)
    .fetch_one(executor)
    .await?;
    Ok(row)
}

async fn update_status<'e, E: PgExecutor<'e>>(
    executor: E,
    context_id: &str,
    status: ApprovalStatus,
) -> anyhow::Result<Option<Approval>> {
    let row = sqlx::query_as::<_, Approval>(
        r#"UPDATE approvals
           SET status = $1, updated_at = NOW()
           WHERE context_id = $2
           RETURNING context_id, approver_name, title, deadline, turns, snapshot,
                     status, created_at, updated_at"#,
    )
    .bind(status)
    .bind(context_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

#[async_trait]
impl ApprovalStore for PgStore {
    async fn materialize_request(&self, request: &MaterializeRequest) -> anyhow::Result<Approval> {
        let request = request.clone();
        run_in_transaction(self, &self.retry, "materialize_request", move |tx| {
            let request = request.clone();
            Box::pin(async move {
                insert_event(&mut **tx, &request.audit).await?;
                upsert_approval(&mut **tx, &request.upsert).await
            })
        })
        .await
    }

    async fn apply_decision(&self, decision: &DecisionRecord) -> anyhow::Result<Option<Approval>> {
        let decision = decision.clone();
        run_in_transaction(self, &self.retry, "apply_decision", move |tx| {
            let decision = decision.clone();
            Box::pin(async move {
                let updated = update_status(&mut **tx, &decision.context_id, decision.status).await?;
                insert_event(&mut **tx, &decision.audit).await?;
                Ok(updated)
            })
        })
        .await
    }

    async fn append_event(&self, event: &NewAuditEvent) -> anyhow::Result<i64> {
        insert_event(&self.pool, event).await
    }

    async fn channels_for(&self, username: &str) -> anyhow::Result<Option<ChannelConfig>> {
        let row = sqlx::query_as::<_, ChannelConfig>(
            "SELECT username, webhook, email FROM channels WHERE username = $1 LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_channel(&self, config: &ChannelConfig) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO channels (username, webhook, email)
               VALUES ($1, $2, $3)
               ON CONFLICT (username) DO UPDATE
                 SET webhook = COALESCE(EXCLUDED.webhook, channels.webhook),
                     email = COALESCE(EXCLUDED.email, channels.email)"#,
        )
        .bind(&config.username)
        .bind(&config.webhook)
        .bind(&config.email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_approval(&self, context_id: &str) -> anyhow::Result<Option<Approval>> {
        let row = sqlx::query_as::<_, Approval>(
            r#"SELECT context_id, approver_name, title, deadline, turns, snapshot,
                      status, created_at, updated_at
               FROM approvals WHERE context_id = $1"#,
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_approvals(&self, approver: &str) -> anyhow::Result<Vec<Approval>> {
        let rows = sqlx::query_as::<_, Approval>(
            r#"SELECT context_id, approver_name, title, deadline, turns, snapshot,
                      status, created_at, updated_at
               FROM approvals
               WHERE approver_name = $1
               ORDER BY created_at DESC"#,
        )
        .bind(approver)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_events(&self, context_id: &str) -> anyhow::Result<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            r#"SELECT id, context_id, type AS event_type, payload, actor, created_at
               FROM events
               WHERE context_id = $1
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
