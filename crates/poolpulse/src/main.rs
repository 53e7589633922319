//! poolpulse service binary.
//!
//! Wires the chain client, price engine, listener registry, mempool tracker,
//! fan-out hub, and confirmation emitter together, owns the periodic timers,
//! and coordinates graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use poolpulse::chain::ChainClient;
use poolpulse::config::FeedConfig;
use poolpulse::confirm::ConfirmEmitter;
use poolpulse::fanout::{FanoutHub, RegistryCommand};
use poolpulse::mempool::MempoolTracker;
use poolpulse::metrics::Metrics;
use poolpulse::pool::decimals::DecimalsCache;
use poolpulse::price::agent::AgentRegistry;
use poolpulse::price::bnb::BnbReference;
use poolpulse::price::PriceEngine;
use poolpulse::registry::ListenerRegistry;
use poolpulse::types::parse_address;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration.
    let config = FeedConfig::from_env().context("failed to load feed config")?;

    info!(
        node = %config.node_ws_url,
        listen = %config.listen_addr,
        confirm = ?config.confirm_url,
        tokens = config.tokens.len(),
        agents = config.agents.len(),
        threshold = config.price_update_threshold,
        "poolpulse starting"
    );

    let shutdown = CancellationToken::new();

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    let metrics = Arc::new(Metrics::new());

    let chain = Arc::new(ChainClient::new(
        &config.node_ws_url,
        Duration::from_secs(config.rpc_timeout_secs),
        Duration::from_secs(config.reconnect_delay_secs),
        config.max_reconnect_attempts,
        shutdown.clone(),
    ));

    let decimals = Arc::new(DecimalsCache::new());
    for token in &config.tokens {
        if let Ok(addr) = parse_address(&token.address) {
            decimals.seed(addr, token.decimals);
        }
    }

    let bnb_pools = config
        .bnb_reference_pools
        .iter()
        .filter_map(|s| match parse_address(s) {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(pool = %s, error = %e, "invalid BNB reference pool, skipping");
                None
            }
        })
        .collect();
    let bnb = Arc::new(BnbReference::new(
        chain.clone(),
        decimals.clone(),
        bnb_pools,
        config.default_bnb_price,
        Duration::from_secs(config.bnb_refresh_interval_secs),
    ));

    let agents = Arc::new(AgentRegistry::new(Duration::from_secs(
        config.agent_cache_ttl_secs,
    )));
    agents
        .register_all(&config.agents)
        .await
        .context("failed to register agent tokens")?;

    let engine = Arc::new(PriceEngine::new(
        chain.clone(),
        decimals.clone(),
        bnb.clone(),
        agents.clone(),
        metrics.clone(),
        config.price_update_threshold,
    ));

    let confirm = Arc::new(ConfirmEmitter::new(config.confirm_url.clone()));

    let mempool = Arc::new(MempoolTracker::new(
        chain.clone(),
        confirm.clone(),
        metrics.clone(),
        Duration::from_secs(config.pending_timeout_secs),
        config.dedup_cache_size,
    ));

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<RegistryCommand>(64);
    let fanout = Arc::new(FanoutHub::new(
        engine.clone(),
        metrics.clone(),
        cmd_tx,
        Duration::from_secs(config.stale_session_secs),
        config.production,
    ));

    let registry = Arc::new(ListenerRegistry::new(
        chain.clone(),
        engine.clone(),
        fanout.clone(),
        mempool.clone(),
        metrics.clone(),
        config.tokens.clone(),
        Duration::from_millis(config.coalesce_window_ms),
    ));

    // -----------------------------------------------------------------------
    // Spawn background tasks
    // -----------------------------------------------------------------------

    // 1. Node connection driver.
    let chain_clone = chain.clone();
    let chain_handle = tokio::spawn(async move { chain_clone.run().await });

    // Wait for the first connection before touching the chain.
    tokio::select! {
        _ = chain.wait_connected() => {}
        _ = shutdown.cancelled() => {
            anyhow::bail!("node connection failed before startup completed");
        }
    }

    match (chain.chain_id().await, chain.block_number().await) {
        (Ok(chain_id), Ok(block)) => {
            info!(chain_id = chain_id, block = block, "node connection verified");
        }
        (chain_id, block) => {
            warn!(chain_id = ?chain_id, block = ?block, "node verification incomplete");
        }
    }

    // Prime the BNB/USD reference before the first token loads.
    let bnb_usd = bnb.refresh().await;
    info!(bnb_usd = bnb_usd, "BNB/USD reference primed");

    // Monitor every statically configured token from the start.
    for token in &config.tokens {
        match parse_address(&token.address) {
            Ok(addr) => match registry.add_token(addr).await {
                Ok(Some(price)) => {
                    info!(token = %token.symbol, price_usd = price.price_usd, "token monitored");
                }
                Ok(None) => warn!(token = %token.symbol, "token has no live pools"),
                Err(e) => warn!(token = %token.symbol, error = %e, "token add failed"),
            },
            Err(e) => warn!(token = %token.address, error = %e, "bad configured address"),
        }
    }

    // 2. BNB reference refresher.
    let bnb_clone = bnb.clone();
    let bnb_shutdown = shutdown.clone();
    let bnb_handle = tokio::spawn(async move { bnb_clone.run_refresher(bnb_shutdown).await });

    // 3. Fan-out listener + stale reaper + heartbeat.
    let fanout_clone = fanout.clone();
    let listen_addr = config.listen_addr.clone();
    let fanout_shutdown = shutdown.clone();
    let fanout_handle = tokio::spawn(async move {
        if let Err(e) = fanout_clone.run_listener(&listen_addr, fanout_shutdown).await {
            error!(error = %e, "fan-out listener failed");
        }
    });

    let reaper = fanout.clone();
    let reaper_interval = Duration::from_secs(config.reaper_interval_secs);
    let reaper_shutdown = shutdown.clone();
    let reaper_handle =
        tokio::spawn(async move { reaper.run_reaper(reaper_interval, reaper_shutdown).await });

    let heartbeat_fanout = fanout.clone();
    let heartbeat_registry = registry.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(heartbeat_interval) => {
                    let monitored = heartbeat_registry.monitored_tokens().await.len();
                    heartbeat_fanout.broadcast_heartbeat(monitored).await;
                }
                _ = heartbeat_shutdown.cancelled() => return,
            }
        }
    });

    // 4. Mempool tracker.
    let mempool_clone = mempool.clone();
    let mempool_shutdown = shutdown.clone();
    let mempool_handle = tokio::spawn(async move { mempool_clone.run(mempool_shutdown).await });

    // 5. Confirmation emitter.
    let confirm_clone = confirm.clone();
    let confirm_shutdown = shutdown.clone();
    let confirm_handle = tokio::spawn(async move { confirm_clone.run(confirm_shutdown).await });

    // 6. Registry command loop (subscribe / room-empty side effects).
    let cmd_registry = registry.clone();
    let cmd_shutdown = shutdown.clone();
    let command_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RegistryCommand::Subscribe(addr)) => {
                            if !cmd_registry.is_monitored(&addr).await {
                                if let Err(e) = cmd_registry.add_token(addr).await {
                                    debug!(error = %e, "subscription for unconfigured token");
                                }
                            }
                        }
                        Some(RegistryCommand::RoomEmpty(addr)) => {
                            cmd_registry.on_room_empty(addr).await;
                        }
                        None => return,
                    }
                }
                _ = cmd_shutdown.cancelled() => return,
            }
        }
    });

    // 7. Resubscribe bindings after reconnects.
    let reconnect_registry = registry.clone();
    let mut epochs = chain.reconnect_epochs();
    let reconnect_shutdown = shutdown.clone();
    let reconnect_handle = tokio::spawn(async move {
        let mut last_epoch = *epochs.borrow();
        loop {
            tokio::select! {
                changed = epochs.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let epoch = *epochs.borrow_and_update();
                    if epoch > last_epoch {
                        info!(epoch = epoch, "reconnected, resubscribing");
                        reconnect_registry.on_reconnect().await;
                    }
                    last_epoch = epoch;
                }
                _ = reconnect_shutdown.cancelled() => return,
            }
        }
    });

    info!("all tasks running — press Ctrl+C to shutdown");

    // -----------------------------------------------------------------------
    // Wait for shutdown
    // -----------------------------------------------------------------------

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("shutdown signal received, stopping gracefully...");
        }
        _ = shutdown.cancelled() => {
            warn!("internal fatal condition, shutting down");
        }
    }
    shutdown.cancel();

    let joins = tokio::join!(
        chain_handle,
        bnb_handle,
        fanout_handle,
        reaper_handle,
        heartbeat_handle,
        mempool_handle,
        confirm_handle,
        command_handle,
        reconnect_handle,
    );
    let (chain_r, bnb_r, fanout_r, reaper_r, heartbeat_r, mempool_r, confirm_r, command_r, reconnect_r) =
        joins;
    for (name, result) in [
        ("chain client", chain_r),
        ("bnb refresher", bnb_r),
        ("fan-out listener", fanout_r),
        ("stale reaper", reaper_r),
        ("heartbeat", heartbeat_r),
        ("mempool tracker", mempool_r),
        ("confirmation emitter", confirm_r),
        ("command loop", command_r),
        ("reconnect watcher", reconnect_r),
    ] {
        if let Err(e) = result {
            error!(task = name, error = %e, "task panicked");
        }
    }

    let stats = metrics.get_stats();
    info!(
        uptime_secs = stats.uptime_seconds,
        events = stats.events_received,
        price_updates = stats.price_updates,
        dropped_confirmations = confirm.dropped_count(),
        "shutdown complete"
    );
    Ok(())
}
