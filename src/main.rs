use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline::api::{self, AppState};
use pipeline::bus::redis_streams::RedisLog;
use pipeline::bus::Publisher;
use pipeline::config::{self, Config};
use pipeline::consumer::{Consumer, MessageHandler};
use pipeline::ingress::IngressPublisher;
use pipeline::models::channel::ChannelConfig;
use pipeline::notification::email::SmtpMailer;
use pipeline::notification::fanout::Fanout;
use pipeline::notification::webhook::WebhookSender;
use pipeline::pipeline::{ActionProcessor, Dispatcher, Materializer};
use pipeline::store::postgres::PgStore;
use pipeline::store::ApprovalStore;

mod cli;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Http,
    Materializer,
    Actions,
    Notifier,
}

const ALL_ROLES: [Role; 4] = [Role::Http, Role::Materializer, Role::Actions, Role::Notifier];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "hitl-pipeline"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pipeline=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    pipeline::metrics::init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        None => run(cfg, &ALL_ROLES).await,
        Some(cli::Commands::Run { port }) => run(with_port(cfg, port), &ALL_ROLES).await,
        Some(cli::Commands::Serve { port }) => run(with_port(cfg, port), &[Role::Http]).await,
        Some(cli::Commands::Materializer) => run(cfg, &[Role::Materializer]).await,
        Some(cli::Commands::Actions) => run(cfg, &[Role::Actions]).await,
        Some(cli::Commands::Notifier) => run(cfg, &[Role::Notifier]).await,
        Some(cli::Commands::Migrate) => {
            let store = connect_store(&cfg).await?;
            store.migrate().await?;
            println!("Migrations applied.");
            store.close().await;
            Ok(())
        }
        Some(cli::Commands::Approval { command }) => {
            let store = connect_store(&cfg).await?;
            let res = handle_approval_command(&store, command).await;
            store.close().await;
            res
        }
        Some(cli::Commands::Channel { command }) => {
            let store = connect_store(&cfg).await?;
            let res = handle_channel_command(&store, command).await;
            store.close().await;
            res
        }
    };

    opentelemetry::global::shutdown_tracer_provider();
    result
}

fn with_port(mut cfg: Config, port: Option<u16>) -> Config {
    if let Some(port) = port {
        cfg.port = port;
    }
    cfg
}

async fn connect_store(cfg: &Config) -> anyhow::Result<PgStore> {
    tracing::info!("Connecting to database...");
    Ok(PgStore::connect(&cfg.database_url, cfg.db_pool_max)
        .await?
        .with_retry_policy(cfg.retry_policy()))
}

async fn run(cfg: Config, roles: &[Role]) -> anyhow::Result<()> {
    let pg = connect_store(&cfg).await?;
    tracing::info!("Running migrations...");
    pg.migrate().await?;
    let store: Arc<dyn ApprovalStore> = Arc::new(pg.clone());

    tracing::info!("Connecting to Redis...");
    let log = RedisLog::connect(&cfg.redis_url, cfg.log_settings()).await?;
    let publisher: Arc<dyn Publisher> = Arc::new(log.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&'static str, JoinHandle<anyhow::Result<()>>)> = Vec::new();

    for role in roles {
        match role {
            Role::Http => {
                let state = Arc::new(AppState {
                    store: store.clone(),
                    ingress: IngressPublisher::new(
                        publisher.clone(),
                        cfg.topic_requests.clone(),
                        cfg.topic_decisions.clone(),
                    ),
                });
                let app = api::router(state, &cfg.dashboard_origin);
                let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind {}", addr))?;
                tracing::info!("HITL API listening on {}", addr);

                let mut rx = shutdown_rx.clone();
                tasks.push((
                    "http",
                    tokio::spawn(async move {
                        axum::serve(listener, app)
                            .with_graceful_shutdown(async move {
                                let _ = rx.changed().await;
                            })
                            .await
                            .context("HTTP server failed")
                    }),
                ));
            }
            Role::Materializer => {
                let handler = Arc::new(Materializer::new(
                    store.clone(),
                    publisher.clone(),
                    cfg.topic_notifications.clone(),
                ));
                let task = spawn_consumer(
                    &log,
                    &cfg,
                    &cfg.topic_requests,
                    &cfg.group_materializer,
                    handler,
                    shutdown_rx.clone(),
                )
                .await?;
                tasks.push(("materializer", task));
            }
            Role::Actions => {
                let webhook = WebhookSender::new(cfg.webhook_timeout(), cfg.webhook_secret.clone())?;
                let handler = Arc::new(ActionProcessor::new(store.clone(), webhook));
                let task = spawn_consumer(
                    &log,
                    &cfg,
                    &cfg.topic_decisions,
                    &cfg.group_actions,
                    handler,
                    shutdown_rx.clone(),
                )
                .await?;
                tasks.push(("actions", task));
            }
            Role::Notifier => {
                let webhook = WebhookSender::new(cfg.webhook_timeout(), cfg.webhook_secret.clone())?;
                let mailer = Arc::new(SmtpMailer::new(&cfg.smtp_settings())?);
                let fanout = Fanout::new(
                    webhook,
                    mailer,
                    cfg.dispatch_timeout(),
                    cfg.mail_subject_prefix.clone(),
                );
                let handler = Arc::new(Dispatcher::new(store.clone(), fanout));
                let task = spawn_consumer(
                    &log,
                    &cfg,
                    &cfg.topic_notifications,
                    &cfg.group_notifier,
                    handler,
                    shutdown_rx.clone(),
                )
                .await?;
                tasks.push(("notifier", task));
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining in-flight work...");
    let _ = shutdown_tx.send(true);

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => tracing::info!(component = name, "stopped"),
            Ok(Err(e)) => tracing::error!(component = name, error = %format!("{:#}", e), "stopped with error"),
            Err(e) => tracing::error!(component = name, error = %e, "task panicked"),
        }
    }

    pg.close().await;
    Ok(())
}

async fn spawn_consumer(
    log: &RedisLog,
    cfg: &Config,
    topic: &str,
    group: &str,
    handler: Arc<dyn MessageHandler>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let subscription = log
        .subscribe(topic, group, &cfg.consumer_name, cfg.subscribe_options())
        .await?;
    let consumer = Consumer::new(subscription, handler, cfg.consumer_settings());
    Ok(tokio::spawn(consumer.run(shutdown)))
}

async fn handle_approval_command(store: &PgStore, cmd: cli::ApprovalCommands) -> anyhow::Result<()> {
    match cmd {
        cli::ApprovalCommands::List { approver } => {
            let approvals = store.list_approvals(&approver).await?;
            if approvals.is_empty() {
                println!("No approvals for {}.", approver);
                return Ok(());
            }

            println!("{:<38} {:<10} {:<30} CREATED", "CONTEXT", "STATUS", "TITLE");
            for a in approvals {
                let title = a.title.unwrap_or_default();
                let title_display = if title.chars().count() > 30 {
                    format!("{}...", title.chars().take(27).collect::<String>())
                } else {
                    title
                };
                println!(
                    "{:<38} {:<10} {:<30} {}",
                    a.context_id,
                    a.status.as_str(),
                    title_display,
                    a.created_at.to_rfc3339()
                );
            }
        }
        cli::ApprovalCommands::Status { context_id } => match store.get_approval(&context_id).await? {
            Some(a) => println!("{} {} (updated {})", a.context_id, a.status, a.updated_at.to_rfc3339()),
            None => println!("Approval {} not found.", context_id),
        },
        cli::ApprovalCommands::Events { context_id } => {
            let events = store.list_events(&context_id).await?;
            if events.is_empty() {
                println!("No events for {}.", context_id);
            }
            for e in events {
                println!(
                    "{} {:<22} {:<12} {}",
                    e.created_at.to_rfc3339(),
                    e.event_type,
                    e.actor.unwrap_or_default(),
                    e.payload
                );
            }
        }
    }
    Ok(())
}

async fn handle_channel_command(store: &dyn ApprovalStore, cmd: cli::ChannelCommands) -> anyhow::Result<()> {
    match cmd {
        cli::ChannelCommands::Set { username, webhook, email } => {
            let stored = set_channels(store, ChannelConfig { username, webhook, email }).await?;
            println!(
                "Channels for {}: {} actionable.",
                stored.username,
                stored.delivery_channels().len()
            );
        }
    }
    Ok(())
}

/// Upsert, then read back the merged row.
async fn set_channels(store: &dyn ApprovalStore, config: ChannelConfig) -> anyhow::Result<ChannelConfig> {
    store.upsert_channel(&config).await?;
    store
        .channels_for(&config.username)
        .await?
        .with_context(|| format!("channels for {} missing after upsert", config.username))
}
