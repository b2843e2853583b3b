use anyhow::{Context as _, Result};
use archon_daemon::{config::DaemonConfig, rest, AppContext};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "archond", about = "Archon Host — control-plane daemon for multiplexed AI coding assistant sessions", version)]
struct Args {
    /// HTTP server port
    #[arg(long, env = "ARCHON_PORT")]
    port: Option<u16>,

    /// Data directory for sessions, config, and SQLite database
    #[arg(long, env = "ARCHON_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ARCHON_LOG")]
    log: Option<String>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, env = "ARCHON_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ARCHON_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "archond starting");

    let config = DaemonConfig::new(args.port, args.data_dir, args.log, args.max_sessions);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        max_sessions = config.max_sessions,
        "config loaded"
    );

    for binary in &["claude", "codex", "opencode"] {
        let available = std::process::Command::new(binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if available {
            info!(binary = %binary, "provider CLI found");
        } else {
            warn!(binary = %binary, "provider CLI not found on PATH — sessions using this provider will fail");
        }
    }

    let ctx = Arc::new(AppContext::new(config).await.context("failed to build app context")?);

    archon_daemon::syncer::spawn(ctx.manager.clone(), ctx.stores.clone(), "codex".to_string());

    let bind = format!("127.0.0.1:{}", ctx.config.port);
    let addr: std::net::SocketAddr = bind.parse()?;
    let router = rest::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(ctx))
        .await?;

    Ok(())
}

async fn shutdown_signal(ctx: Arc<AppContext>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining sessions");
    ctx.manager.drain().await;
}

/// Initializes the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("archond.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        None
    }
}
