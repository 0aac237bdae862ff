//! Data middleware gateway binary.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 fatal startup error, 130 on
//! interrupt.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datamiddleware::{server, Args, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("datamiddleware={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {e}");
        std::process::exit(1);
    }

    info!("======================================");
    info!("  DataMiddleware - game data gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("TCP listen: {}", args.tcp_listen);
    info!("HTTP listen: {}", args.http_listen);
    info!("Games: {}", args.game_list().join(", "));
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Pool capacity: {} (min {}, max {})", args.pool_capacity, args.pool_hard_min, args.pool_hard_max);
    info!("L1 shards: {} x {} entries", args.l1_shards, args.l1_max_per_shard);
    info!("======================================");

    let state = match AppState::build(args) {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(2);
        }
    };
    state.start_background().await;

    let mut tcp = tokio::spawn(server::run_tcp(Arc::clone(&state)));
    let mut http = tokio::spawn(server::run_http(Arc::clone(&state)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            tcp.abort();
            http.abort();
            state.shutdown().await;
            std::process::exit(130);
        }
        result = &mut tcp => {
            report_listener_exit("tcp", result);
        }
        result = &mut http => {
            report_listener_exit("http", result);
        }
    }

    state.shutdown().await;
    std::process::exit(2);
}

fn report_listener_exit(
    surface: &str,
    result: std::result::Result<datamiddleware::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => error!("{surface} listener exited unexpectedly"),
        Ok(Err(e)) => error!("{surface} listener failed: {e}"),
        Err(e) => error!("{surface} listener task panicked: {e}"),
    }
}
