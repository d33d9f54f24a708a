//! `campaign-sendd`: the single daemon binary that wires every component
//! crate together, selecting which subsystems run via `--role`. Mirrors
//! the teacher's single-binary `kumod`, minus the Lua policy layer and
//! privilege-drop dance this system has no need for.
use anyhow::Context;
use campaign_core::CampaignId;
use clap::{Parser, ValueEnum};
use config::Settings;
use db::{CoordinationStore, PostgresCoordinationStore, RedisCoordinationStore};
use esp_adapter::{EspClient, SesClient, SparkPostClient};
use server_runtime::lifecycle::{LifeCycle, ShutdownSubcription};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Which subsystems this process instance runs. A single binary can play
/// every role at once (`all`, the default for a small deployment) or be
/// split across processes for independent scaling ("the
/// dispatch pool scales independently of the enqueue worker").
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "kebab-case")]
enum Role {
    /// Runs the dispatch worker pool's lease/send loop and lease reaper.
    Dispatcher,
    /// Polls for campaigns due to enter `preparing` and builds their queues.
    Enqueue,
    /// Serves the open pixel, click redirect, and unsubscribe routes.
    TrackingHttp,
    /// Serves the per-provider webhook ingest route.
    WebhookHttp,
    /// Every role in one process.
    All,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum LogFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// Campaign Send Pipeline daemon.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Which subsystems to run in this process.
    #[arg(long, value_enum, default_value = "all")]
    role: Role,

    /// Path to `campaign_sendd.toml`. Missing file is not an error; see
    /// `config::Settings::load`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed. If omitted,
    /// diagnostics print to stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// How diagnostic logs render. `pretty`/`full`/`compact` are for
    /// humans; `json` is machine-readable.
    #[arg(long, value_enum, default_value = "full")]
    log_format: LogFormat,

    /// Skips running pending `sqlx` migrations against `database.url` at
    /// start-up. Migrations run by default since every role depends on
    /// the same schema being current.
    #[arg(long)]
    no_migrate: bool,
}

fn init_logging(opt: &Opt) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("CAMPAIGN_SENDD_LOG")
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;

    let (writer, guard) = if let Some(log_dir) = &opt.log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "campaign-sendd.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);
    let fmt_layer: Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync> =
        match opt.log_format {
            LogFormat::Pretty => Box::new(fmt_layer.pretty()),
            LogFormat::Full => Box::new(fmt_layer),
            LogFormat::Compact => Box::new(fmt_layer.compact()),
            LogFormat::Json => Box::new(fmt_layer.json()),
        };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    // Leak the non-blocking writer guard: it must live for the process
    // lifetime and this is a one-shot daemon entry point, not a library.
    if let Some(guard) = guard {
        std::mem::forget(guard);
    }
    Ok(())
}

/// Builds one `EspClient` per configured provider. A `SendingProfile`
/// naming a provider with no matching entry here is simply unusable at
/// send time (dispatch's `process_item` already handles that as a
/// per-item failure, not a startup error) — provider credentials are a
/// deploy-time secret that may be rolled out independently of profile
/// rows.
fn build_esp_clients(
    settings: &Settings,
    classifier: Arc<bounce_classify::BounceClassifier>,
) -> anyhow::Result<HashMap<String, Arc<dyn EspClient>>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building esp http client")?;

    let mut clients: HashMap<String, Arc<dyn EspClient>> = HashMap::new();
    for (provider, creds) in &settings.esp.providers {
        let client: Arc<dyn EspClient> = match provider.as_str() {
            "ses" => Arc::new(SesClient::new(http.clone(), creds.endpoint.clone(), classifier.clone())),
            "sparkpost" => Arc::new(SparkPostClient::new(
                http.clone(),
                creds.endpoint.clone(),
                creds.api_key.clone(),
                classifier.clone(),
            )),
            other => {
                tracing::warn!(provider = other, "no adapter implementation for configured esp provider, skipping");
                continue;
            }
        };
        clients.insert(provider.clone(), client);
    }

    if clients.is_empty() {
        tracing::warn!("no esp providers configured; dispatch will fail every send until `esp.<provider>` is set");
    }
    Ok(clients)
}

/// A holder id that is stable for this process and distinguishable in
/// `distributed_locks`/queue-item-holder logs, the way the teacher's
/// egress paths are named `<source>@<host>`.
fn holder_id() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{host}-{}", uuid::Uuid::new_v4())
}

struct Built {
    settings: Settings,
    pool: sqlx::PgPool,
    coordination: Arc<dyn CoordinationStore>,
    suppression: Arc<suppression_hub::SuppressionHub>,
    campaign_state: Arc<campaign_state::CampaignStateMachine>,
    holder_id: String,
}

async fn build_common(opt: &Opt) -> anyhow::Result<Built> {
    let settings = Settings::load(opt.config.as_deref().and_then(|p| p.to_str()))
        .context("loading configuration")?;

    let pool_config = db::PoolConfig {
        url: settings.database.url.clone(),
        max_connections: settings.database.max_connections,
        ..db::PoolConfig::default()
    };
    let pool = db::connect(&pool_config).await.context("connecting to postgres")?;
    if !opt.no_migrate {
        db::migrate(&pool).await.context("running migrations")?;
    }

    let coordination: Arc<dyn CoordinationStore> = match &settings.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("opening redis client")?;
            Arc::new(RedisCoordinationStore::new(client))
        }
        None => Arc::new(PostgresCoordinationStore::new(pool.clone())),
    };

    let suppression = suppression_hub::SuppressionHub::load(
        db::SuppressionRepo::new(pool.clone()),
        suppression_hub::SoftBouncePolicy {
            threshold: settings.enqueue.soft_bounce_threshold,
            window: settings.enqueue.soft_bounce_window,
        },
    )
    .await
    .context("loading suppression hub")?;

    let campaign_state = Arc::new(campaign_state::CampaignStateMachine::new(
        db::CampaignRepo::new(pool.clone()),
        db::QueueRepo::new(pool.clone()),
        pool.clone(),
        settings.campaign_state.min_preparation_minutes,
    ));

    Ok(Built {
        settings,
        pool,
        coordination,
        suppression,
        campaign_state,
        holder_id: holder_id(),
    })
}

fn build_throttle_store(settings: &Settings) -> anyhow::Result<throttle::ThrottleStore> {
    match &settings.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("opening redis client for throttle")?;
            Ok(throttle::ThrottleStore::with_redis(client))
        }
        None => Ok(throttle::ThrottleStore::local_only()),
    }
}

/// Runs the dispatch pool's lease/send loop alongside its lease reaper,
/// both stopping promptly on shutdown.
async fn run_dispatcher(built: Arc<Built>) -> anyhow::Result<()> {
    let settings = &built.settings;
    let classifier = Arc::new(
        bounce_classify::BounceClassifierBuilder::with_default_rules()
            .build()
            .map_err(|err| anyhow::anyhow!(err))
            .context("building bounce classifier")?,
    );
    let esp_clients = build_esp_clients(settings, classifier)?;

    let worker = Arc::new(dispatch::DispatchWorker {
        queue: db::QueueRepo::new(built.pool.clone()),
        campaigns: db::CampaignRepo::new(built.pool.clone()),
        subscribers: db::SubscriberRepo::new(built.pool.clone()),
        sending_profiles: db::SendingProfileRepo::new(built.pool.clone()),
        isp_health: db::IspHealthRepo::new(built.pool.clone()),
        tracking: db::TrackingRepo::new(built.pool.clone()),
        suppression: built.suppression.clone(),
        campaign_state: built.campaign_state.clone(),
        esp_clients,
        throttle: build_throttle_store(settings)?,
        isp_throttle: settings.isp_throttle.clone(),
        settings: settings.dispatch.clone(),
        holder_id: built.holder_id.clone(),
    });

    let send_loop = {
        let worker = worker.clone();
        server_runtime::spawn("dispatch-send-loop", async move {
            let activity = server_runtime::lifecycle::Activity::get("dispatch-send-loop".to_string());
            let mut shutdown = ShutdownSubcription::get();
            loop {
                if activity.is_err() {
                    return;
                }
                match worker.run_once().await {
                    Ok(0) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                            _ = shutdown.shutting_down() => return,
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "dispatch run_once failed");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.shutting_down() => return,
                        }
                    }
                }
            }
        })?
    };

    let reaper_interval = settings.dispatch.reaper_interval;
    let reap_loop = {
        let worker = worker.clone();
        server_runtime::spawn("dispatch-reaper", async move {
            let mut shutdown = ShutdownSubcription::get();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reaper_interval) => {}
                    _ = shutdown.shutting_down() => return,
                }
                match worker.reap().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(reclaimed = n, "reaper reclaimed expired leases"),
                    Err(err) => tracing::error!(error = %err, "reaper failed"),
                }
                match worker.check_completions().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(completed = n, "campaigns transitioned to a terminal status"),
                    Err(err) => tracing::error!(error = %err, "check_completions failed"),
                }
            }
        })?
    };

    send_loop.await.ok();
    reap_loop.await.ok();
    Ok(())
}

/// Polls for campaigns whose `scheduled_at` has arrived, transitions them
/// into `preparing`, and builds their per-recipient queues (spec.md
/// §4.1, §4.4). Instant sends never appear here — they enter `preparing`
/// directly from the state machine's `send_now`.
async fn run_enqueue(built: Arc<Built>) -> anyhow::Result<()> {
    let settings = &built.settings;
    let worker = Arc::new(enqueue::EnqueueWorker {
        campaigns: db::CampaignRepo::new(built.pool.clone()),
        subscribers: db::SubscriberRepo::new(built.pool.clone()),
        segments: db::SegmentRepo::new(built.pool.clone()),
        queue: db::QueueRepo::new(built.pool.clone()),
        sending_profiles: db::SendingProfileRepo::new(built.pool.clone()),
        suppression: built.suppression.clone(),
        campaign_state: built.campaign_state.clone(),
        coordination: built.coordination.clone(),
        tracking: settings.tracking.clone(),
        lock_ttl: settings.campaign_state.lock_ttl,
        holder_id: built.holder_id.clone(),
    });

    let campaigns = db::CampaignRepo::new(built.pool.clone());
    let mut shutdown = ShutdownSubcription::get();
    loop {
        let due = campaigns.due_for_preparation(chrono::Utc::now()).await;
        match due {
            Ok(due) => {
                for campaign in due {
                    let campaign_id: CampaignId = campaign.id;
                    let prepared = built
                        .campaign_state
                        .begin_preparation(campaign_id, built.coordination.as_ref(), &built.holder_id, settings.campaign_state.lock_ttl)
                        .await;
                    match prepared {
                        Ok(Some(_)) => {
                            let worker = worker.clone();
                            server_runtime::spawn("enqueue-build", async move {
                                if let Err(err) = worker.run(campaign_id).await {
                                    tracing::error!(error = %err, campaign_id = %campaign_id, "failed to build campaign queue");
                                }
                            })
                            .ok();
                        }
                        Ok(None) => {}
                        Err(err) => tracing::error!(error = %err, campaign_id = %campaign_id, "failed to begin preparation"),
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to list campaigns due for preparation"),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            _ = shutdown.shutting_down() => return Ok(()),
        }
    }
}

fn build_metrics_aggregator(pool: &sqlx::PgPool) -> metrics_aggregator::MetricsAggregator {
    metrics_aggregator::MetricsAggregator::new(
        db::TrackingRepo::new(pool.clone()),
        db::SubscriberRepo::new(pool.clone()),
        db::CampaignRepo::new(pool.clone()),
        db::IspHealthRepo::new(pool.clone()),
    )
}

async fn serve(addr: &str, app: axum::Router, label: &'static str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {label} listener on {addr}"))?;
    tracing::info!(addr, label, "listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let mut shutdown = ShutdownSubcription::get();
            shutdown.shutting_down().await;
        })
        .await
        .with_context(|| format!("serving {label}"))
}

async fn run_tracking_http(built: Arc<Built>) -> anyhow::Result<()> {
    let state = Arc::new(tracking::TrackingState {
        metrics: build_metrics_aggregator(&built.pool),
        subscribers: db::SubscriberRepo::new(built.pool.clone()),
        suppression: built.suppression.clone(),
        settings: built.settings.tracking.clone(),
    });
    let app = tracking::router(state)
        .merge(server_runtime::metrics::router())
        .layer(tower_http::trace::TraceLayer::new_for_http());
    serve(&built.settings.http.tracking_listen, app, "tracking-http").await
}

async fn run_webhook_http(built: Arc<Built>) -> anyhow::Result<()> {
    let state = Arc::new(webhook::WebhookState {
        metrics: build_metrics_aggregator(&built.pool),
        subscribers: db::SubscriberRepo::new(built.pool.clone()),
        campaigns: db::CampaignRepo::new(built.pool.clone()),
        suppression: built.suppression.clone(),
        body_limit_bytes: built.settings.http.webhook_body_limit_bytes,
    });
    let app = webhook::router(state)
        .merge(server_runtime::metrics::router())
        .layer(tower_http::trace::TraceLayer::new_for_http());
    serve(&built.settings.http.webhook_listen, app, "webhook-http").await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    init_logging(&opt)?;

    let mut lifecycle = LifeCycle::new();
    let built = Arc::new(build_common(&opt).await?);

    let roles: Vec<Role> = if opt.role == Role::All {
        vec![Role::Dispatcher, Role::Enqueue, Role::TrackingHttp, Role::WebhookHttp]
    } else {
        vec![opt.role]
    };

    let mut handles = Vec::new();
    for role in roles {
        let built = built.clone();
        match role {
            Role::Dispatcher => handles.push(tokio::spawn(async move { run_dispatcher(built).await })),
            Role::Enqueue => handles.push(tokio::spawn(async move { run_enqueue(built).await })),
            Role::TrackingHttp => handles.push(tokio::spawn(async move { run_tracking_http(built).await })),
            Role::WebhookHttp => handles.push(tokio::spawn(async move { run_webhook_http(built).await })),
            Role::All => unreachable!("expanded above"),
        }
    }

    tokio::select! {
        _ = lifecycle.wait_for_shutdown() => {}
        result = futures::future::select_all(handles.into_iter().map(Box::pin)) => {
            let (outcome, _, _) = result;
            if let Ok(Err(err)) = outcome {
                tracing::error!(error = %err, "a subsystem exited with an error");
            }
            LifeCycle::request_shutdown().await;
            lifecycle.wait_for_shutdown().await;
        }
    }

    Ok(())
}
