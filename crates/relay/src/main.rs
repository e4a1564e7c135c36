use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vr_domain::{ConfigSeverity, RelayConfig};
use vr_relay::api;
use vr_relay::state::AppState;

#[derive(Parser)]
#[command(name = "voicerelay", about = "Voice-agent relay with gated tool execution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default).
    Serve,
    /// Print the resolved configuration (secrets redacted).
    Config,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(RelayConfig::from_env());
            run_server(config).await
        }
        Some(Command::Config) => {
            let config = RelayConfig::from_env();
            println!("{}", serde_json::to_string_pretty(&config)?);
            for issue in config.validate() {
                eprintln!("{issue}");
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("voicerelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the `serve` command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vr_relay=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<RelayConfig>) -> anyhow::Result<()> {
    tracing::info!("voicerelay starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let state = AppState::from_config(config.clone());
    tracing::info!(
        upstream = %config.upstream_url,
        tool_webhooks = config.tool_webhooks.len(),
        hmac = config.hmac_secret.is_some(),
        rate_limit = config.rate_limit,
        "relay state ready"
    );

    // ── Registry reapers ─────────────────────────────────────────────
    {
        let state = state.clone();
        let gate2_timeout = state.confirms.timeout();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                state.cancels.reap(Duration::from_secs(600));
                state.callbacks.reap(Duration::from_secs(600));
                state.confirms.sweep_stale(gate2_timeout * 2);
                state.idempotency.sweep();
            }
        });
    }

    // ── Rate-bucket + session-cache sweeps (5-minute tick) ───────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                state.rate.sweep();
                state.cache.sweep();
            }
        });
    }

    // ── Sink pending-log flush (30-second pulse) ─────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                state.sink.flush_pending().await;
            }
        });
    }

    // ── Concurrency limit (backpressure protection) ──────────────────
    let max_concurrent = std::env::var("VR_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    let app = api::router()
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "voicerelay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    tracing::info!("voicerelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
        return;
    }
    tracing::info!("shutdown signal received");
}
