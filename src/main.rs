//! Atelier server entry point: load configuration, wire the components,
//! start the scheduler worker, serve HTTP.

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use atelier::api::{AppState, create_router};
use atelier::comfy::ComfyTimeouts;
use atelier::config::Config;
use atelier::core::{JobKind, Scheduler, scheduler::SchedulerSettings};
use atelier::media::{FeedMediaStore, MediaStore};
use atelier::notify::{self, NOTIFY_INBOX_CAPACITY, NotificationHub};
use atelier::pipeline::GenerationProcessor;
use atelier::store::{JobStore, PostStore};
use atelier::translate::Translator;
use atelier::workflows::WorkflowRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _log_guard = init_tracing(&config);

    std::fs::create_dir_all(&config.output_dir)?;
    if let Some(parent) = config.job_db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // One SQLite pool backs both stores; each runs its own migrations.
    let options = SqliteConnectOptions::from_str(&format!(
        "sqlite:{display}",
        display = config.job_db_path.display()
    ))?
    .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    let jobs = JobStore::from_pool(pool.clone(), &config.output_dir).await?;
    let posts = PostStore::from_pool(pool).await?;

    let media = MediaStore::new(&config.output_dir);
    let feed_media = FeedMediaStore::new(&config.output_dir);
    let workflows = Arc::new(WorkflowRegistry::load(&config.workflow_dir));
    let hub = Arc::new(NotificationHub::new());
    let translator = Translator::new(&config)?;

    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_INBOX_CAPACITY);
    let scheduler = Arc::new(Scheduler::new(
        SchedulerSettings::from_config(&config),
        notify_tx,
    ));
    scheduler.register_processor(
        JobKind::Generate,
        Arc::new(GenerationProcessor::new(
            config.comfy_server.clone(),
            ComfyTimeouts::from_config(&config),
            config.comfy_input_dir.clone(),
            media.clone(),
            Arc::clone(&workflows),
        )),
    );

    let _pump = tokio::spawn(notify::run_pump(
        notify_rx,
        Arc::clone(&hub),
        jobs.clone(),
    ));
    let worker = scheduler.start(tokio::runtime::Handle::current())?;

    let state = AppState {
        config: Arc::new(config.clone()),
        scheduler: Arc::clone(&scheduler),
        hub,
        media,
        feed_media,
        posts,
        jobs,
        workflows,
        translator,
    };
    let router = create_router(state);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, comfy = %config.comfy_server, "atelier listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    scheduler.shutdown();
    let _ = worker.join();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "shutdown signal listener failed");
    }
}

/// Install the tracing subscriber: env-filtered, JSON or text, with an
/// optional daily-rotated file sink. The returned guard must stay alive
/// for the file writer to flush.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let json = config.log_format.eq_ignore_ascii_case("json");

    let stdout_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = if config.log_to_file {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "atelier.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    guard
}
