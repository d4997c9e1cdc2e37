use std::time::Duration;

use crate::bus::redis_streams::{LogSettings, SubscribeOptions};
use crate::consumer::ConsumerSettings;
use crate::notification::email::SmtpSettings;
use crate::store::tx::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_pool_max: u32,
    pub redis_url: String,
    pub dashboard_origin: String,

    pub topic_requests: String,
    pub topic_decisions: String,
    pub topic_notifications: String,
    pub partitions: u32,
    pub stream_max_len: usize,
    /// Replicas that must confirm ingress publishes. 0 = no wait.
    pub min_replicas: u32,
    pub replica_timeout_ms: u64,

    pub group_materializer: String,
    pub group_actions: String,
    pub group_notifier: String,
    pub consumer_name: String,
    pub read_count: usize,
    pub read_block_ms: u64,
    pub claim_idle_ms: u64,
    pub reclaim_interval_secs: u64,
    pub max_deliveries: u64,

    pub tx_max_retries: u32,
    pub tx_base_delay_ms: u64,

    pub webhook_secret: Option<String>,
    pub webhook_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_from: String,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_starttls: bool,
    pub mail_subject_prefix: String,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.tx_max_retries,
            base_delay: Duration::from_millis(self.tx_base_delay_ms),
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            partitions: self.partitions.max(1),
            max_len: self.stream_max_len,
            min_replicas: self.min_replicas,
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
        }
    }

    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            read_count: self.read_count.max(1),
            block: Duration::from_millis(self.read_block_ms),
            claim_idle: Duration::from_millis(self.claim_idle_ms),
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_deliveries: self.max_deliveries.max(1),
            reclaim_interval: Duration::from_secs(self.reclaim_interval_secs.max(1)),
            ..ConsumerSettings::default()
        }
    }

    pub fn smtp_settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            from: self.smtp_from.clone(),
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            starttls: self.smtp_starttls,
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Ok(from_env())
}

/// Read the configuration from the current environment without touching `.env`.
pub fn from_env() -> Config {
    let default_consumer = format!("hitl-{}", std::process::id());

    let cfg = Config {
        port: parsed_or("HITL_PORT", 8080),
        database_url: var_or("DATABASE_URL", "postgres://localhost/hitl"),
        db_pool_max: parsed_or("HITL_DB_POOL_MAX", 10),
        redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
        dashboard_origin: var_or("DASHBOARD_ORIGIN", "http://localhost:3000"),

        topic_requests: var_or("HITL_TOPIC_REQUESTS", "workflow-events"),
        topic_decisions: var_or("HITL_TOPIC_DECISIONS", "human-responses"),
        topic_notifications: var_or("HITL_TOPIC_NOTIFICATIONS", "notification-events"),
        partitions: parsed_or("HITL_PARTITIONS", 3),
        stream_max_len: parsed_or("HITL_STREAM_MAXLEN", 100_000),
        min_replicas: parsed_or("HITL_MIN_REPLICAS", 0),
        replica_timeout_ms: parsed_or("HITL_REPLICA_TIMEOUT_MS", 1000),

        group_materializer: var_or("HITL_GROUP_MATERIALIZER", "approval-materializer"),
        group_actions: var_or("HITL_GROUP_ACTIONS", "action-processor"),
        group_notifier: var_or("HITL_GROUP_NOTIFIER", "notification-dispatcher"),
        consumer_name: var_or("HITL_CONSUMER_NAME", &default_consumer),
        read_count: parsed_or("HITL_READ_COUNT", 16),
        read_block_ms: parsed_or("HITL_READ_BLOCK_MS", 5000),
        claim_idle_ms: parsed_or("HITL_CLAIM_IDLE_MS", 30_000),
        reclaim_interval_secs: parsed_or("HITL_RECLAIM_INTERVAL_SECS", 15),
        max_deliveries: parsed_or("HITL_MAX_DELIVERIES", 5),

        tx_max_retries: parsed_or("HITL_TX_MAX_RETRIES", 3),
        tx_base_delay_ms: parsed_or("HITL_TX_BASE_DELAY_MS", 200),

        webhook_secret: optional("HITL_WEBHOOK_SECRET"),
        webhook_timeout_secs: parsed_or("HITL_WEBHOOK_TIMEOUT_SECS", 10),
        dispatch_timeout_secs: parsed_or("HITL_DISPATCH_TIMEOUT_SECS", 30),

        smtp_host: var_or("SMTP_HOST", "mailhog"),
        smtp_port: parsed_or("SMTP_PORT", 1025),
        smtp_from: var_or("SMTP_FROM", "HITL <no-reply@hitl.local>"),
        smtp_username: optional("SMTP_USERNAME"),
        smtp_password: optional("SMTP_PASSWORD"),
        smtp_starttls: flag("SMTP_STARTTLS"),
        mail_subject_prefix: var_or("HITL_MAIL_SUBJECT_PREFIX", "[HITL] "),
    };

    let env_mode = std::env::var("HITL_ENV").unwrap_or_default();
    if env_mode == "production" && cfg.min_replicas == 0 {
        tracing::warn!("HITL_MIN_REPLICAS is 0 in production: ingress publishes are not replica-confirmed");
    }

    cfg
}
