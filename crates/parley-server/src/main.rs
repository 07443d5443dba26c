//! Parley server: HTTP front for one model-backed inference task.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley_core::config::{BackendKind, InitMode};
use parley_core::{ReferenceModelLoader, RequestPipeline, ServiceConfig, TaskKind};
use parley_server::state::{DEFAULT_MAX_CONCURRENT, DEFAULT_REQUEST_TIMEOUT_SECS};
use parley_server::{create_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "parley-server", version, about = "Serve one inference task over HTTP")]
struct Args {
    /// JSON deployment configuration
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PARLEY_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "PARLEY_PORT", default_value_t = 8080)]
    port: u16,

    /// Overrides the task named in the configuration
    #[arg(long)]
    task: Option<TaskKind>,

    /// Maximum number of requests processed at once
    #[arg(long, env = "PARLEY_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Overall request timeout in seconds
    #[arg(long, env = "PARLEY_REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout: u64,

    /// Seconds between remote backend health probes
    #[arg(long, default_value_t = 30)]
    health_interval: u64,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "parley_server=debug,parley_core=debug,tower_http=debug"
    } else {
        "parley_server=info,parley_core=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Parley server");

    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .await
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    config.apply_env();
    if let Some(task) = args.task {
        config.task = task;
    }
    config.validate().context("invalid configuration")?;

    info!(
        "Task: {}, model: {} ({}), device: {}",
        config.task, config.model.id, config.model.variant, config.device.placement
    );

    let has_remote = config
        .backends
        .iter()
        .any(|b| b.kind == BackendKind::Remote);
    let eager = config.readiness.init_mode == InitMode::Eager;

    let pipeline = Arc::new(
        RequestPipeline::from_config(Arc::new(config), Arc::new(ReferenceModelLoader))
            .context("building request pipeline")?,
    );

    if eager {
        pipeline
            .lifecycle()
            .start()
            .await
            .context("model initialization failed")?;
        info!("Model ready");
    }

    let monitor = has_remote.then(|| {
        pipeline
            .chain()
            .clone()
            .spawn_health_monitor(Duration::from_secs(args.health_interval.max(1)))
    });

    let state = AppState::new(pipeline, args.max_concurrent, args.request_timeout);
    let app = create_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = monitor {
        handle.abort();
    }
    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received, draining connections");
}
