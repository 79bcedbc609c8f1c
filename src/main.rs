// =============================================================================
// Aurora Meme Executor — Main Entry Point
// =============================================================================
//
// Signal-driven swap execution against the routing API, with tiered
// profit-taking position management. Three long-running loops (signals,
// positions, maintenance) plus ephemeral confirmation tasks, all on one
// tokio runtime with watch-channel cancellation.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod book;
mod error;
mod execution;
mod lock;
mod metrics;
mod onchain;
mod position;
mod queue;
mod risk;
mod router;
mod rpc;
mod settings;
mod signer;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::book::PositionBook;
use crate::execution::ExecutionEngine;
use crate::lock::AssetLock;
use crate::metrics::Metrics;
use crate::position::PositionMonitor;
use crate::queue::SignalQueue;
use crate::risk::RiskManager;
use crate::router::{NativePriceCache, RouterClient};
use crate::rpc::RpcGateway;
use crate::settings::{Settings, SOL_MINT};
use crate::signer::{LocalSigner, TransactionSigner};
use crate::store::StateStore;

/// Minimum SOL the signing wallet must hold to start trading.
const MIN_WALLET_SOL: f64 = 0.1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Meme Executor — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Arc::new(Settings::from_env()?);
    let redis_url = settings
        .redis_url
        .clone()
        .context("REDIS_URL is required (signal stream + asset locks)")?;

    info!(
        base_size_usd = settings.base_position_size_usd,
        max_positions = settings.max_concurrent_positions,
        daily_loss_limit_pct = settings.daily_loss_limit_pct,
        hot_path_budget_ms = settings.hot_path_budget_ms,
        "executor configured"
    );

    // ── 2. Core components ───────────────────────────────────────────────
    let metrics = Arc::new(Metrics::new()?);

    let signer: Arc<dyn TransactionSigner> =
        Arc::new(LocalSigner::from_base58(&settings.private_key)?);

    let rpc = Arc::new(RpcGateway::new(
        settings.rpc_url.clone(),
        settings.backup_rpc_url.clone(),
        settings.bundle_url.clone(),
        metrics.clone(),
    )?);

    let router = Arc::new(RouterClient::new(
        settings.router_api_url.clone(),
        settings.price_api_url.clone(),
    )?);
    let sol_price = Arc::new(NativePriceCache::new(router.clone(), SOL_MINT));

    let store = StateStore::open(&settings.db_path).await?;

    let queue = Arc::new(
        SignalQueue::connect(
            &redis_url,
            &settings.redis_stream_key,
            &settings.redis_consumer_group,
            &settings.redis_consumer_name,
        )
        .await?,
    );
    let lock = Arc::new(AssetLock::connect(Some(redis_url.as_str())).await?);

    // ── 3. Shared state ──────────────────────────────────────────────────
    let book = Arc::new(PositionBook::new());
    let estimator_book = book.clone();
    let risk = Arc::new(RiskManager::new(
        settings.clone(),
        // Conservative account-value estimate: mark-to-market of the book
        // with a fixed floor. Keeps the risk manager free of engine calls.
        Box::new(move || estimator_book.mark_to_market_usd().max(1000.0)),
    ));
    let state = Arc::new(AppState::new(
        settings.clone(),
        book,
        risk,
        metrics.clone(),
    ));

    // ── 4. Wallet preflight ──────────────────────────────────────────────
    let balance = rpc
        .get_balance(&signer.pubkey())
        .await
        .context("wallet balance check failed")?;
    if balance < MIN_WALLET_SOL {
        anyhow::bail!("insufficient SOL balance: {balance:.3} (need {MIN_WALLET_SOL})");
    }
    info!(pubkey = %signer.pubkey(), balance_sol = balance, "wallet ready");

    // ── 5. Engine + startup recovery ─────────────────────────────────────
    let engine = Arc::new(ExecutionEngine::new(
        settings.clone(),
        state.clone(),
        queue,
        store.clone(),
        lock,
        router.clone(),
        rpc.clone(),
        signer.clone(),
        sol_price.clone(),
    ));

    let recovered = engine.recover_positions().await?;
    if recovered > 0 {
        info!(count = recovered, "recovered active positions from state store");
    }

    let monitor = Arc::new(PositionMonitor::new(
        settings.clone(),
        state.clone(),
        store,
        router,
        rpc,
        signer,
        sol_price,
    ));

    // ── 6. Operational API ───────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = settings.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "operational API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 7. Loops ─────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_handle = tokio::spawn(engine.clone().run_signal_loop(shutdown_rx.clone()));
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let maintenance_handle = tokio::spawn(engine.clone().run_maintenance_loop(shutdown_rx));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping loops");

    let _ = shutdown_tx.send(true);
    let _ = signal_handle.await;
    let _ = monitor_handle.await;
    let _ = maintenance_handle.await;

    engine.drain_confirmers().await;

    info!("Aurora Meme Executor shut down complete.");
    Ok(())
}
