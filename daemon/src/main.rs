//! modhost daemon
//!
//! Loads every plugin package in the modules directory, then serves
//! addressed requests over a newline-delimited TCP transport. A small HTTP
//! endpoint reports what is loaded.
//!
//! Usage:
//!   modhost-daemon --config modhost.toml --port 7070 --http-port 7071

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use modhost_daemon::{build_router, serve_with_limit, DEFAULT_MAX_LINE_BYTES};
use modhost_host::{Host, HostConfig, ModuleRegistry, CONFIG_FILE};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "modhost-daemon")]
#[command(about = "Sandboxed wasm plugin host")]
struct Args {
    /// Path to the host configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Directory scanned for plugin packages (overrides the config file)
    #[arg(short, long)]
    modules_dir: Option<PathBuf>,

    /// Port for the request transport (TCP, one JSON request per line)
    #[arg(short, long, default_value = "7070")]
    port: u16,

    /// HTTP port for the diagnostics endpoint
    #[arg(long, default_value = "7071")]
    http_port: u16,

    /// Longest request line accepted before the connection is closed
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    max_line_bytes: usize,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("modhost daemon starting...");
    let mut config = HostConfig::load_from(&args.config);
    if let Some(dir) = args.modules_dir {
        config.modules_dir = dir;
    }

    // Loading fetches remote artifacts with a blocking client, so it runs
    // before the async runtime exists.
    let host = Host::new(config).context("Failed to initialise host")?;
    let summary = host.load_all().context("Failed to load modules")?;

    println!("\n========================================");
    println!("  modhost daemon");
    println!("========================================");
    println!("  Modules:    {}", host.config().modules_dir.display());
    println!("  Running:    {}", summary.running.join(", "));
    println!("  Registered: {}", summary.registered.join(", "));
    println!("  Failed:     {}", summary.failed.join(", "));
    println!("  TCP Port:   {}", args.port);
    println!("  HTTP Port:  {}", args.http_port);
    println!("========================================\n");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    let result = runtime.block_on(run(args.port, args.http_port, args.max_line_bytes, Arc::clone(host.registry())));
    runtime.shutdown_timeout(Duration::from_secs(5));

    host.shutdown();
    info!("modhost daemon stopped");
    result
}

async fn run(port: u16, http_port: u16, max_line_bytes: usize, registry: Arc<ModuleRegistry>) -> Result<()> {
    let transport = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind transport port {port}"))?;
    let http = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {http_port}"))?;

    let app = build_router(Arc::clone(&registry));
    tokio::spawn(async move {
        info!("HTTP diagnostics endpoint listening on port {}", http_port);
        if let Err(e) = axum::serve(http, app).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    tokio::select! {
        result = serve_with_limit(transport, registry, max_line_bytes) => result.context("Transport failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }
    Ok(())
}
