mod config;

use anyhow::{Context, Result};
use clap::Parser;
use herald_isr::{router, HttpRenderClient, InvalidationHandler, IsrEngine, IsrState, RouteTable};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "herald-server")]
#[command(version, about = "Herald ISR server - cache-first pages with webhook invalidation", long_about = None)]
struct Args {
    /// Path to herald.toml
    #[arg(short, long, default_value = "herald.toml")]
    config: PathBuf,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.server.log_level;
        EnvFilter::new(format!(
            "warn,herald_server={level},herald_isr={level},tower_http=info"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let isr_config = config.isr.to_runtime_config()?;
    info!(
        storage = ?isr_config.storage,
        max_workers = isr_config.max_workers,
        default_ttl = isr_config.default_ttl.as_secs(),
        "starting herald"
    );

    let renderer = Arc::new(HttpRenderClient::new(&config.render.origin)?);
    let engine = IsrEngine::new(isr_config, renderer)
        .await
        .context("Failed to initialise ISR storage")?;

    let table = match &config.webhook.routes_file {
        Some(path) => RouteTable::load(path).await?,
        None => RouteTable::builtin()?,
    };
    info!(events = table.len(), "loaded invalidation routes");

    let http_config = config.http_config();
    if http_config.webhook_secret.is_none() {
        warn!("no webhook secret configured; webhook requests will be rejected");
    }

    let invalidation = InvalidationHandler::new(table, engine.clone());
    let state = IsrState::new(engine, invalidation, http_config);
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, origin = %config.render.origin, "server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
