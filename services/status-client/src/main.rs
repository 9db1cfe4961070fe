// status-client: Keeps a live status channel open and logs what comes over it.
//
// Wires together the event bus, the reconnecting connection manager, the
// conversation tracker and the subscription reconciler.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use status_client::bus::StatusBus;
use status_client::config::{self, ClientConfig};
use status_client::connection::{ConnectionManager, ConnectionState};
use status_client::reconciler::SubscriptionReconciler;
use status_client::runtime::{EnvelopeDispatcher, register_logging_listeners};
use status_client::tracker::ConversationTracker;
use status_client::verifier::HttpReceiptVerifier;
use tokio::sync::watch;
use tracing::{info, warn};

fn init_tracing(cfg_level: Option<&str>) {
    let fallback = cfg_level.unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> ClientConfig {
    let loaded = match path {
        Some(path) => config::load_config_from_path(path),
        None => config::load_config(),
    };
    match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = Command::new("Status Client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Follows conversation and subscription status over a live channel")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("receipt_file")
                .help("File holding the base64 purchase receipt to verify")
                .short('r')
                .long("receipt-file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let cfg = load_config(matches.get_one::<PathBuf>("config"));
    init_tracing(cfg.log_level.as_deref());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ws_url = %cfg.server.ws_url,
        products = cfg.products.len(),
        "status-client starting"
    );

    let receipt = match matches.get_one::<PathBuf>("receipt_file") {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(s) => Some(s.trim().to_owned()),
            Err(e) => {
                eprintln!("FATAL: reading receipt file '{}': {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };
    if receipt.is_some() {
        if let Err(e) = cfg.check_receipt_verification() {
            eprintln!("FATAL: cannot verify receipts: {e}");
            std::process::exit(1);
        }
    }

    let verifier = match HttpReceiptVerifier::new(
        cfg.verification.production_url.clone(),
        cfg.verification.sandbox_url.clone(),
        cfg.verification.timeout,
    ) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("FATAL: failed to create verification client: {e}");
            std::process::exit(1);
        }
    };

    let bus = StatusBus::new();
    for handle in register_logging_listeners(&bus) {
        handle.detach();
    }

    let reconciler = Arc::new(SubscriptionReconciler::new(
        verifier,
        cfg.reconciler_config(),
        bus.clone(),
    ));
    let manager = ConnectionManager::new(cfg.server.ws_url.clone(), bus.clone());
    let tracker = ConversationTracker::new(bus.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe before connecting so nothing from the first session is missed.
    let tracker_task = {
        let tracker = tracker.clone();
        let stream = manager.subscribe();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { tracker.run(stream, shutdown).await })
    };
    let dispatcher_task = {
        let dispatcher = EnvelopeDispatcher::new(Arc::clone(&reconciler), receipt.clone());
        let stream = manager.subscribe();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(stream, shutdown).await })
    };

    manager.connect(cfg.connect_options());

    if let Some(receipt) = receipt.as_deref() {
        if let Err(e) = reconciler.reconcile(receipt).await {
            warn!(error = %e, "start-up verification failed");
        }
    } else {
        info!("no receipt configured; subscription state stays unverified");
    }

    let mut state_rx = manager.state_changes();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => {
            warn!("status channel closed; exiting");
        }
    }

    manager.close();
    shutdown_tx.send(true).ok();
    manager.join().await;
    let _ = tracker_task.await;
    let _ = dispatcher_task.await;

    info!(tracked = tracker.len(), "status-client shutdown complete");
}
