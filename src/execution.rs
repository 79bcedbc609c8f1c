// =============================================================================
// Execution Engine — signal loop, hot path, order FSM, maintenance
// =============================================================================
//
// The latency-sensitive path from signal arrival to transaction submission:
//
//   read batch → idempotency check → admission → per-asset lock → risk-flag
//   gate → concentration micro-guard → quote (direct-first) → validate →
//   build swap → LATENCY GATE (100 ms budget) → sign → submit → persist
//   position → background confirmer
//
// Every FSM transition is durably written before the next external action,
// and a signal is only acked after its processed/terminal marker is durable.
// Per-signal failures never take the engine down; they are classified
// (transient / validation / contract / rejected) and handled at the loop
// boundary.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::error::ExecError;
use crate::lock::AssetLock;
use crate::metrics::LatencyTracker;
use crate::onchain::ConcentrationGuard;
use crate::queue::SignalQueue;
use crate::router::{NativePriceCache, RouterClient};
use crate::rpc::{ConfirmStatus, RpcGateway};
use crate::settings::{PretradeFailMode, Settings, SOL_MINT};
use crate::signer::TransactionSigner;
use crate::store::{PositionRow, StateStore};
use crate::types::{now_ts, OrderState, Position, PositionStatus, Signal};

/// Batch size for each queue read.
const READ_BATCH: usize = 64;
/// Queue block time when idle.
const READ_BLOCK_MS: u64 = 50;
/// Maintenance cadence.
const MAINTENANCE_INTERVAL_SECS: u64 = 300;
/// How long shutdown waits for in-flight confirmers.
const CONFIRMER_DRAIN_SECS: u64 = 5;

pub struct ExecutionEngine {
    pub settings: Arc<Settings>,
    pub state: Arc<AppState>,
    pub queue: Arc<SignalQueue>,
    pub store: StateStore,
    pub lock: Arc<AssetLock>,
    pub router: Arc<RouterClient>,
    pub rpc: Arc<RpcGateway>,
    pub signer: Arc<dyn TransactionSigner>,
    pub guard: Arc<ConcentrationGuard>,
    pub sol_price: Arc<NativePriceCache>,
    confirmers: tokio::sync::Mutex<JoinSet<()>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        state: Arc<AppState>,
        queue: Arc<SignalQueue>,
        store: StateStore,
        lock: Arc<AssetLock>,
        router: Arc<RouterClient>,
        rpc: Arc<RpcGateway>,
        signer: Arc<dyn TransactionSigner>,
        sol_price: Arc<NativePriceCache>,
    ) -> Self {
        let guard = Arc::new(ConcentrationGuard::new(rpc.clone()));
        Self {
            settings,
            state,
            queue,
            store,
            lock,
            router,
            rpc,
            signer,
            guard,
            sol_price,
            confirmers: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    // =========================================================================
    // Signal loop
    // =========================================================================

    /// Consume the signal stream until shutdown. Never returns on per-signal
    /// errors; queue-level errors back off briefly.
    pub async fn run_signal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("signal loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.queue.read_new(READ_BATCH, READ_BLOCK_MS) => res,
            };

            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "queue read failed — backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for (msg_id, signal) in entries {
                self.state.record_signal();
                self.handle_entry(&msg_id, signal).await;
            }
        }
        info!("signal loop stopped");
    }

    /// One queue entry: dedupe, process, persist the outcome, ack.
    ///
    /// The ack only happens after a successful durable write; persistence
    /// errors leave the entry unacked so the consumer group redelivers it.
    async fn handle_entry(&self, msg_id: &str, signal: Signal) {
        match self.store.has_processed(&signal.signal_id).await {
            Ok(true) => {
                debug!(signal_id = %signal.signal_id, "duplicate delivery — acking");
                self.queue.ack(msg_id).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(signal_id = %signal.signal_id, error = %e, "idempotency check failed — leaving unacked");
                return;
            }
        }

        // A crash mid-order leaves FSM transitions without the processed
        // marker. Such a signal is never re-executed: whatever reached the
        // wire is authoritative, and an order stranded before CONFIRMED is
        // downgraded to FAILED.
        match self.store.last_state(&signal.signal_id).await {
            Ok(None) => {}
            Ok(Some(state)) => {
                warn!(
                    signal_id = %signal.signal_id,
                    last_state = %state,
                    "redelivered signal already has an order record — not re-executing"
                );
                let stranded = matches!(state.as_str(), "pending" | "quoted" | "signed" | "submitted");
                if stranded {
                    self.state.metrics.orders_failed.inc();
                    if let Err(e) = self
                        .store
                        .record_transition(&signal.signal_id, &signal.mint, OrderState::Failed.as_str())
                        .await
                    {
                        error!(error = %e, "failed to downgrade stranded order — leaving unacked");
                        return;
                    }
                }
                if self.store.mark_processed(&signal.signal_id).await.is_ok() {
                    self.queue.ack(msg_id).await;
                }
                return;
            }
            Err(e) => {
                error!(signal_id = %signal.signal_id, error = %e, "order-state check failed — leaving unacked");
                return;
            }
        }

        let outcome = self.process_signal(&signal).await;

        match &outcome {
            Ok(()) => {}
            Err(e) if e.is_order_failure() => {
                warn!(signal_id = %signal.signal_id, mint = %signal.mint, error = %e, "order failed");
                self.state.metrics.orders_failed.inc();
                if let Err(pe) = self
                    .store
                    .record_transition(&signal.signal_id, &signal.mint, OrderState::Failed.as_str())
                    .await
                {
                    error!(error = %pe, "failed to persist FAILED transition — leaving unacked");
                    return;
                }
            }
            Err(e) => {
                info!(signal_id = %signal.signal_id, mint = %signal.mint, reason = %e, "signal rejected");
            }
        }

        match self.store.mark_processed(&signal.signal_id).await {
            Ok(()) => self.queue.ack(msg_id).await,
            Err(e) => {
                error!(signal_id = %signal.signal_id, error = %e, "failed to persist processed marker — leaving unacked");
            }
        }
    }

    // =========================================================================
    // Hot path
    // =========================================================================

    async fn process_signal(&self, signal: &Signal) -> Result<(), ExecError> {
        let mint = &signal.mint;
        let signal_id = &signal.signal_id;

        // 1. Already holding this mint.
        if self.state.book.contains(mint) {
            return Err(ExecError::Rejected("already holding this mint".into()));
        }

        // 2. Portfolio admission.
        let (ok, reason) = self.state.risk.can_open(signal);
        if !ok {
            return Err(ExecError::Rejected(
                reason.unwrap_or_else(|| "admission rejected".into()),
            ));
        }

        // 3. Cross-worker lock on (mint, signal).
        let lock_key = format!("{mint}:{signal_id}");
        if !self.lock.acquire(&lock_key, self.settings.lock_ttl_ms).await {
            return Err(ExecError::Rejected("asset lock busy".into()));
        }

        let result = self.enter_position(signal).await;
        // The entry either submitted or died; either way the lock has done
        // its job (the TTL also covers a lost release).
        self.lock.release(&lock_key).await;
        result
    }

    async fn enter_position(&self, signal: &Signal) -> Result<(), ExecError> {
        let mint = &signal.mint;
        let signal_id = &signal.signal_id;
        let mut tracker = LatencyTracker::new(self.state.metrics.clone());

        // 4. Hard risk-flag gates.
        let risks = signal.rugcheck_risks.to_lowercase();
        for flag in ["honeypot", "blacklisted", "blacklist"] {
            if risks.contains(flag) {
                return Err(ExecError::Rejected(format!("risk flag: {flag}")));
            }
        }
        if risks.contains("high_tax") {
            return Err(ExecError::Rejected("risk flag: high_tax".into()));
        }

        // 5. Concentration micro-guard under a hard time budget.
        self.run_pretrade_guard(mint).await?;

        // Order accepted: the FSM starts here.
        self.persist_transition(signal_id, mint, OrderState::Pending)
            .await?;
        self.state.metrics.orders_started.inc();

        // 6. Size the entry in native-token atomic units.
        let size_usd = self.settings.base_position_size_usd;
        let sol_usd = self
            .sol_price
            .usd_price()
            .await
            .map_err(|e| ExecError::Transient(format!("SOL price fetch failed: {e}")))?
            .ok_or_else(|| ExecError::Transient("SOL/USD price unavailable".into()))?;
        if sol_usd <= 0.0 {
            return Err(ExecError::Transient("SOL/USD price is zero".into()));
        }
        let sol_lamports = (size_usd / sol_usd * 1e9) as u64;

        // 7. Quote, direct routes first.
        tracker.mark_quote_requested();
        let quote = self
            .router
            .quote_with_fallback(SOL_MINT, mint, sol_lamports, self.settings.max_slippage_bps)
            .await
            .map_err(|e| ExecError::Transient(format!("quote failed: {e}")))?
            .ok_or_else(|| ExecError::Validation("no route for mint".into()))?;
        tracker.mark_quote_received();
        self.persist_transition(signal_id, mint, OrderState::Quoted)
            .await?;

        // 8. Validate against the impact budget.
        quote
            .validate(self.settings.max_impact_bps as f64 / 100.0)
            .map_err(ExecError::Validation)?;

        // 9. Build the unsigned swap.
        let unsigned_b64 = self
            .router
            .build_swap(
                &quote,
                &self.signer.pubkey(),
                self.settings.priority_fee_lamports,
            )
            .await
            .map_err(|e| ExecError::Transient(format!("swap build failed: {e}")))?;

        // 10. Latency gate: too slow to still be worth submitting.
        let elapsed_ms = tracker.hot_path_ms_so_far();
        if elapsed_ms > self.settings.hot_path_budget_ms {
            self.state.metrics.orders_aborted_latency.inc();
            return Err(ExecError::Validation(format!(
                "hot path {elapsed_ms:.1} ms exceeded {:.0} ms budget",
                self.settings.hot_path_budget_ms
            )));
        }

        // 11. Sign.
        let signed_b64 = self
            .signer
            .sign_b64(&unsigned_b64)
            .await
            .map_err(|e| ExecError::Contract(format!("signing failed: {e}")))?;
        tracker.mark_signed();
        self.persist_transition(signal_id, mint, OrderState::Signed)
            .await?;

        // 12. Submit.
        let tx_id = self
            .rpc
            .submit_signed_tx(&signed_b64)
            .await
            .map_err(|e| ExecError::Transient(format!("submit failed: {e}")))?;
        tracker.mark_submitted();
        self.persist_transition(signal_id, mint, OrderState::Submitted)
            .await?;

        // Entry accounting: price in USD per UI token.
        let entry_time = now_ts();
        let token_decimals = quote.out_decimals.unwrap_or(9);
        let out_ui = quote.out_amount / 10f64.powi(token_decimals as i32);
        let in_usd = quote.in_amount / 1e9 * sol_usd;
        let entry_price = if out_ui > 0.0 { in_usd / out_ui } else { 0.0 };

        let mut position = Position {
            mint: mint.clone(),
            signal_id: signal_id.clone(),
            entry_price,
            entry_time,
            size_usd,
            size_tokens: quote.out_amount as u64,
            remaining_tokens: quote.out_amount as u64,
            token_decimals,
            entry_tx_id: tx_id.clone(),
            rugcheck_score: signal.rugcheck_score.clone(),
            rugcheck_risks: signal.rugcheck_risks.clone(),
            lp_locked: signal.lp_locked(),
            stop_loss_price: 0.0,
            peak_price: entry_price,
            peak_multiple: 1.0,
            is_derisked: false,
            derisked_price: 0.0,
            runner_peak_price: 0.0,
            tiers_hit: Default::default(),
            last_partial_sell_ts: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Active,
        };
        position.stop_loss_price = self.state.risk.stop_loss_price(&position);

        // Durable snapshot before the position goes live in memory.
        self.store
            .upsert_position(&PositionRow {
                signal_id: signal_id.clone(),
                mint: mint.clone(),
                entry_tx_id: Some(tx_id.clone()),
                entry_time: Some(entry_time),
                size_usd: Some(size_usd),
                size_tokens: Some(position.size_tokens as i64),
                token_decimals: Some(token_decimals as i64),
                entry_price: Some(entry_price),
                status: Some(PositionStatus::Active.as_str().into()),
            })
            .await
            .map_err(|e| ExecError::Contract(format!("position persist failed: {e}")))?;

        // Optimistic CONFIRMED: the async confirmer may downgrade to FAILED.
        self.persist_transition(signal_id, mint, OrderState::Confirmed)
            .await?;

        info!(
            mint = %mint,
            signal_id = %signal_id,
            size_usd,
            tokens = position.size_tokens,
            entry_price,
            stop = position.stop_loss_price,
            tx_id = %tx_id,
            hot_path_ms = tracker.hot_path_ms_so_far(),
            "position opened"
        );

        self.state.book.insert(position);
        self.state.risk.position_opened();

        self.spawn_confirmer(signal_id.clone(), mint.clone(), tx_id, tracker)
            .await;

        Ok(())
    }

    async fn run_pretrade_guard(&self, mint: &str) -> Result<(), ExecError> {
        let (top1_max, top10_max) = (
            self.settings.pretrade_top1_max_pct,
            self.settings.pretrade_top10_max_pct,
        );
        if top1_max.is_none() && top10_max.is_none() {
            return Ok(());
        }

        let budget = Duration::from_millis(self.settings.pretrade_guard_budget_ms);
        let analysis = tokio::time::timeout(budget, self.guard.analyze(mint)).await;

        let concentration = match analysis {
            Ok(Ok(Some(c))) => c,
            // Timeout or unusable data: the guard is best-effort.
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
                return match self.settings.pretrade_fail_mode {
                    PretradeFailMode::Soft => {
                        debug!(mint, "concentration guard inconclusive — proceeding (soft)");
                        Ok(())
                    }
                    PretradeFailMode::Hard => Err(ExecError::Rejected(
                        "concentration guard inconclusive (hard mode)".into(),
                    )),
                };
            }
        };

        if let Some(max) = top1_max {
            if concentration.top1_pct >= max {
                return Err(ExecError::Rejected(format!(
                    "top-1 holder {:.1}% >= {max:.1}%",
                    concentration.top1_pct
                )));
            }
        }
        if let Some(max) = top10_max {
            if concentration.top10_pct >= max {
                return Err(ExecError::Rejected(format!(
                    "top-10 holders {:.1}% >= {max:.1}%",
                    concentration.top10_pct
                )));
            }
        }
        Ok(())
    }

    async fn persist_transition(
        &self,
        signal_id: &str,
        mint: &str,
        state: OrderState,
    ) -> Result<(), ExecError> {
        self.store
            .record_transition(signal_id, mint, state.as_str())
            .await
            .map_err(|e| ExecError::Contract(format!("persist {state} failed: {e}")))
    }

    // =========================================================================
    // Background confirmer
    // =========================================================================

    /// Watch the entry transaction. Confirmation keeps the optimistic state;
    /// failure or timeout evicts the position and downgrades the order.
    async fn spawn_confirmer(
        &self,
        signal_id: String,
        mint: String,
        tx_id: String,
        tracker: LatencyTracker,
    ) {
        let rpc = self.rpc.clone();
        let store = self.store.clone();
        let state = self.state.clone();
        let timeout_secs = self.settings.confirm_timeout_secs;

        self.confirmers.lock().await.spawn(async move {
            match rpc.confirm(&tx_id, timeout_secs).await {
                ConfirmStatus::Confirmed => {
                    tracker.mark_confirmed();
                    state.metrics.orders_confirmed.inc();
                }
                status => {
                    warn!(%tx_id, mint = %mint, ?status, "entry not confirmed — evicting position");
                    state.metrics.orders_failed.inc();

                    if state.book.remove(&mint).is_some() {
                        state.risk.position_closed();
                    }
                    let failed = PositionRow {
                        signal_id: signal_id.clone(),
                        mint: mint.clone(),
                        status: Some(PositionStatus::Failed.as_str().into()),
                        ..Default::default()
                    };
                    if let Err(e) = store.upsert_position(&failed).await {
                        error!(error = %e, "failed to persist failed position");
                    }
                    if let Err(e) = store
                        .record_transition(&signal_id, &mint, OrderState::Failed.as_str())
                        .await
                    {
                        error!(error = %e, "failed to persist FAILED transition");
                    }
                }
            }
        });
    }

    /// Await in-flight confirmers up to the drain deadline (shutdown path).
    pub async fn drain_confirmers(&self) {
        let mut set = self.confirmers.lock().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(CONFIRMER_DRAIN_SECS);
        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = set.len(), "confirmer drain deadline reached");
                    set.abort_all();
                    break;
                }
            }
        }
    }

    // =========================================================================
    // Startup recovery
    // =========================================================================

    /// Rebuild the in-memory book from persisted active positions. Risk
    /// metadata is not part of the snapshot, so recovered positions get the
    /// conservative "pending" profile and a recomputed stop.
    pub async fn recover_positions(&self) -> anyhow::Result<usize> {
        let rows = self.store.load_positions_by_status("active").await?;
        let mut recovered = 0;

        for row in rows {
            let entry_price = row.entry_price.unwrap_or(0.0);
            if entry_price <= 0.0 {
                warn!(mint = %row.mint, "skipping recovery of position without entry price");
                continue;
            }
            let mut position = Position {
                mint: row.mint.clone(),
                signal_id: row.signal_id.clone(),
                entry_price,
                entry_time: row.entry_time.unwrap_or_else(now_ts),
                size_usd: row.size_usd.unwrap_or(0.0),
                size_tokens: row.size_tokens.unwrap_or(0).max(0) as u64,
                remaining_tokens: row.size_tokens.unwrap_or(0).max(0) as u64,
                token_decimals: row.token_decimals.unwrap_or(9).clamp(0, 18) as u8,
                entry_tx_id: row.entry_tx_id.clone().unwrap_or_default(),
                rugcheck_score: "pending".into(),
                rugcheck_risks: String::new(),
                lp_locked: false,
                stop_loss_price: 0.0,
                peak_price: entry_price,
                peak_multiple: 1.0,
                is_derisked: false,
                derisked_price: 0.0,
                runner_peak_price: 0.0,
                tiers_hit: Default::default(),
                last_partial_sell_ts: 0.0,
                realized_pnl: 0.0,
                status: PositionStatus::Active,
            };
            position.stop_loss_price = self.state.risk.stop_loss_price(&position);

            // Account for fills that happened before the crash.
            let sold = self.store.sum_exit_fractions(&row.signal_id).await?;
            if sold > 0.0 {
                let remaining = (position.size_tokens as f64 * (1.0 - sold)).max(0.0);
                position.remaining_tokens = remaining as u64;
            }

            info!(mint = %position.mint, signal_id = %position.signal_id, "recovered active position");
            self.state.book.insert(position);
            recovered += 1;
        }

        self.state.risk.restore_active_positions(recovered as u32);
        Ok(recovered)
    }

    // =========================================================================
    // Maintenance loop
    // =========================================================================

    pub async fn run_maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = MAINTENANCE_INTERVAL_SECS, "maintenance loop starting");
        let mut ticker = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        ticker.tick().await; // immediate first tick is a no-op

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            self.queue.trim().await;
            self.router.clear_price_cache();
            self.state.risk.maybe_reset_daily();

            let snapshot = self.state.risk.snapshot();
            info!(
                open_positions = self.state.book.len(),
                mtm_usd = self.state.book.mark_to_market_usd(),
                daily_pnl = snapshot.daily_realized_pnl,
                total_trades = snapshot.total_trades,
                win_rate = snapshot.win_rate,
                signals = self.state.signals_total(),
                "portfolio status"
            );
        }
        info!("maintenance loop stopped");
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("state", &self.state)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use crate::router::Quote;

    #[test]
    fn entry_price_math_matches_quote_units() {
        // 0.05 SOL in (50M lamports) at 200 USD/SOL buying 2,000.0 UI tokens
        // (decimals 6) prices the token at 0.005 USD.
        let quote = Quote::from_route(serde_json::json!({
            "inAmount": "50000000",
            "outAmount": "2000000000",
            "priceImpactPct": 0.1,
            "outToken": { "decimals": 6 },
        }))
        .unwrap();

        let sol_usd = 200.0;
        let decimals = quote.out_decimals.unwrap_or(9);
        let out_ui = quote.out_amount / 10f64.powi(decimals as i32);
        let in_usd = quote.in_amount / 1e9 * sol_usd;
        let entry_price = in_usd / out_ui;

        assert!((entry_price - 0.005).abs() < 1e-12);
    }
}
