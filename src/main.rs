//! CSP Collector - violation report ingestion and archival service
//!
//! Accepts browser CSP reports for whitelisted domains, keeps them in
//! per-domain zip buffers, rotates those into archive files and forwards
//! every accepted report to a syslog collector.
//!
//! ## Features
//!
//! - Per-domain buffering with threshold-triggered archive rotation
//! - Daily archive sequence reset and stale-buffer flush
//! - Best-effort syslog forwarding over TCP or UDP
//! - Optional operator API for live counts, archive lists and flushes
//! - Graceful shutdown on Ctrl+C, flushing every domain
//!
//! ## Configuration
//!
//! See [`csp_collector::config::Config`]; `RUST_LOG` sets the log filter
//! (default: info).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use csp_collector::aggregator::SystemClock;
use csp_collector::config::Config;
use csp_collector::context::AppContext;
use csp_collector::forwarder::{
    spawn_forwarder, Forwarder, ForwarderConfig, ForwarderStats, DEFAULT_QUEUE_CAPACITY,
};
use csp_collector::scheduler::spawn_schedulers;
use csp_collector::server::{admin_router, ingest_router};

/// How long shutdown waits for servers and the forwarder to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting CSP Collector service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                domains = ?config.domains,
                report_addr = %config.report_addr,
                archive_dir = %config.archive_dir.display(),
                max_reports_per_archive = config.max_reports_per_archive,
                max_report_size = config.max_report_size,
                request_timeout = ?config.request_timeout,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.archive_dir) {
        error!(
            archive_dir = %config.archive_dir.display(),
            error = %e,
            "Failed to create archive directory"
        );
        std::process::exit(1);
    }

    let (forwarder, forwarder_handle) = match &config.syslog_addr {
        Some(addr) => {
            let forwarder =
                Forwarder::new(ForwarderConfig::new(addr.clone(), config.syslog_transport));
            let (sender, handle) = spawn_forwarder(forwarder, DEFAULT_QUEUE_CAPACITY);
            (Some(sender), Some(handle))
        }
        None => {
            warn!("No syslog collector configured, forwarding disabled");
            (None, None)
        }
    };

    let ctx = match AppContext::new(&config, Arc::new(SystemClock), forwarder) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "Failed to initialize domain buffers");
            std::process::exit(1);
        }
    };

    let schedulers = spawn_schedulers(ctx.domains());
    info!(domains = schedulers.len(), "Daily reset schedulers started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut servers = Vec::new();
    match serve("ingest", &config.report_addr, ingest_router(ctx.clone()), shutdown_rx.clone()).await {
        Ok(handle) => servers.push(handle),
        Err(()) => std::process::exit(1),
    }
    if let Some(admin_addr) = &config.admin_addr {
        match serve("admin", admin_addr, admin_router(ctx.clone()), shutdown_rx.clone()).await {
            Ok(handle) => servers.push(handle),
            Err(()) => std::process::exit(1),
        }
    }

    info!("CSP Collector running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Stop accepting reports, then persist what is buffered.
    let _ = shutdown_tx.send(true);
    for server in servers {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await.is_err() {
            warn!("Server shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
    }
    for scheduler in schedulers {
        scheduler.abort();
    }

    let flush_ctx = ctx.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || flush_ctx.flush_all()).await {
        error!(error = %e, "Final flush panicked");
    }

    // Dropping the last context closes the forwarder queue.
    drop(ctx);
    if let Some(handle) = forwarder_handle {
        drain_forwarder(handle).await;
    }

    info!("CSP Collector stopped");
}

/// Bind `addr` and serve `router` until the shutdown flag flips.
async fn serve(
    name: &'static str,
    addr: &str,
    router: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, ()> {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(server = name, addr = %addr, error = %e, "Failed to bind");
            return Err(());
        }
    };
    info!(server = name, addr = %addr, "Listening");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!(server = name, error = %e, "Server error");
        }
    }))
}

async fn drain_forwarder(handle: JoinHandle<ForwarderStats>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(stats)) => info!(
            sent = stats.sent,
            dropped = stats.dropped,
            "Forwarder drained"
        ),
        Ok(Err(e)) => warn!(error = %e, "Forwarder task panicked during shutdown"),
        Err(_) => warn!("Forwarder shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
