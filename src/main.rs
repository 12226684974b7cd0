use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_relay::config::RelayConfig;
use inbox_relay::relay::Relay;
use inbox_relay::status::{spawn_status_server, status_routes};
use inbox_relay::store::LibSqlBackend;

/// Time pollers get to finish their current cycle after Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// stderr logging, plus a daily-rolling file when `log_dir` is set.
/// The returned guard must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let sources = config.enabled_sources();
    eprintln!("📥 Inbox Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Sources: {}",
        if sources.is_empty() {
            "none".to_string()
        } else {
            sources.join(", ")
        }
    );
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Media: {}", config.media_dir.display());
    eprintln!(
        "   Agents: {}",
        if config.llm.is_some() { "enabled" } else { "disabled" }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Status server ───────────────────────────────────────────────────
    if let Some(port) = config.status_port {
        spawn_status_server(port, status_routes(db.clone(), db.clone()));
        eprintln!("   Status: http://0.0.0.0:{port}/health");
    }

    // ── Pollers ─────────────────────────────────────────────────────────
    let relay = Relay::start(&config, db).await?;
    eprintln!("   Pollers: {}\n", relay.poller_names().join(", "));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    relay.shutdown(SHUTDOWN_TIMEOUT).await;

    Ok(())
}
