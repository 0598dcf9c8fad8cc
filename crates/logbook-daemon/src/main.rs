//! logbook-daemon: Headless practice-log sync daemon.
//!
//! Wires a file-backed store to a shared-directory remote and keeps them
//! reconciled on a debounced periodic schedule. Without `--remote` it runs
//! in local-only mode: every mutation still lands durably on disk, nothing
//! is synced.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use logbook_daemon::scheduler::{
    DEFAULT_DEBOUNCE, DEFAULT_INTERVAL, DEFAULT_TIMEOUT, SyncScheduler, SyncTrigger,
};
use logbook_daemon::{FileRemote, FileStorage};

use logbook_core::remote::{AuthState, RemoteAuthority, StaticAuth};
use logbook_core::store::LogbookStore;
use logbook_core::sync_engine::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "logbook-daemon")]
#[command(about = "Local-first practice-log sync daemon")]
struct Args {
    /// Directory for the durable local cache
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Shared remote directory to sync against (local-only mode if unset)
    #[arg(short, long)]
    remote: Option<PathBuf>,

    /// Seconds between periodic sync passes
    #[arg(long, default_value_t = DEFAULT_INTERVAL.as_secs())]
    interval: u64,

    /// Debounce window for sync triggers, in seconds
    #[arg(long, default_value_t = DEFAULT_DEBOUNCE.as_secs())]
    debounce: u64,

    /// Timeout for a single sync pass, in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,logbook_daemon=debug"
    } else {
        "info,logbook_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting logbook-daemon");
    info!("Data directory: {:?}", args.data_dir);

    let storage = Arc::new(FileStorage::new(&args.data_dir)?);

    let syncing = args.remote.is_some();
    let remote_dir = args
        .remote
        .clone()
        .unwrap_or_else(|| args.data_dir.join("remote.disabled"));
    let remote: Arc<dyn RemoteAuthority> = Arc::new(FileRemote::new(remote_dir));
    let auth: Arc<dyn AuthState> = StaticAuth::new(syncing);
    if syncing {
        info!("Remote directory: {:?}", args.remote.as_ref().unwrap());
    } else {
        info!("No remote configured, running local-only");
    }

    let store = Arc::new(
        LogbookStore::open(Arc::clone(&storage), Arc::clone(&remote), Arc::clone(&auth)).await,
    );
    info!(
        "Store loaded: {} entries, {} goals",
        store.entry_count(),
        store.list_goals().len()
    );

    let engine = Arc::new(SyncEngine::new(Arc::clone(&store), remote, auth));
    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&engine),
        Duration::from_secs(args.debounce),
        Duration::from_secs(args.timeout),
    ));

    // Headless: always "visible"; online tracks whether a remote exists.
    let visible = Arc::new(AtomicBool::new(true));
    let online = Arc::new(AtomicBool::new(syncing));
    let periodic = Arc::clone(&scheduler).start_periodic(
        Duration::from_secs(args.interval),
        visible,
        Arc::clone(&online),
    );

    if syncing {
        info!("Initial sync pass");
        let request = scheduler.request(SyncTrigger::Manual).await;
        info!("Initial sync: {:?}", request);
    }

    info!("Daemon running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    periodic.abort();

    // Flush pending debounced writes before exiting
    if let Err(e) = store.cache().flush().await {
        warn!("Failed to flush cache on shutdown: {}", e);
    }
    if syncing {
        scheduler.request(SyncTrigger::Manual).await;
    }

    info!("Shutting down");
    Ok(())
}
