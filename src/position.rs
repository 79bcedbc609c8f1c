// =============================================================================
// Position Monitor — periodic exit evaluation and sell execution
// =============================================================================
//
// Wakes every `price_check_interval_ms`, and for each live position: fetch
// the (cached) spot price, ratchet the peak, run the exit ladder, execute any
// triggered sale. Decision-making happens under the book's write lock with
// no awaits; network work happens on copies and results are written back.
//
// Near-stop turbo: when a price lands within `near_stop_delta_pct` of an
// armed stop without crossing it, the position gets a follow-up check after
// `near_stop_check_ms` with an uncached price, so a fast collapse between
// regular ticks is not missed.
//
// A failed partial sell leaves the position active; the next tick retries.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::risk::ExitDecision;
use crate::router::{NativePriceCache, RouterClient};
use crate::rpc::RpcGateway;
use crate::settings::{Settings, SOL_MINT};
use crate::signer::TransactionSigner;
use crate::store::{PositionRow, StateStore};
use crate::types::{now_ts, ExitReason, OrderState, Position, PositionStatus, TradeResult};

pub struct PositionMonitor {
    pub settings: Arc<Settings>,
    pub state: Arc<AppState>,
    pub store: StateStore,
    pub router: Arc<RouterClient>,
    pub rpc: Arc<RpcGateway>,
    pub signer: Arc<dyn TransactionSigner>,
    pub sol_price: Arc<NativePriceCache>,
}

impl PositionMonitor {
    pub fn new(
        settings: Arc<Settings>,
        state: Arc<AppState>,
        store: StateStore,
        router: Arc<RouterClient>,
        rpc: Arc<RpcGateway>,
        signer: Arc<dyn TransactionSigner>,
        sol_price: Arc<NativePriceCache>,
    ) -> Self {
        Self {
            settings,
            state,
            store,
            router,
            rpc,
            signer,
            sol_price,
        }
    }

    // =========================================================================
    // Loop
    // =========================================================================

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.settings.price_check_interval_ms,
            "position monitor starting"
        );
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            self.settings.price_check_interval_ms,
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let mints = self.state.book.mints();
            if mints.is_empty() {
                continue;
            }

            let mut near_stop = Vec::new();
            for mint in &mints {
                if self.check_position(mint, false).await {
                    near_stop.push(mint.clone());
                }
            }

            // Turbo pass: positions hovering at a stop get a fast re-check
            // with a fresh price before the next full cycle.
            if !near_stop.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.settings.near_stop_check_ms,
                ))
                .await;
                for mint in &near_stop {
                    debug!(mint = %mint, "near-stop turbo re-check");
                    self.check_position(mint, true).await;
                }
            }
        }
        info!("position monitor stopped");
    }

    /// Evaluate one position. Returns `true` when the price sits within the
    /// near-stop band of an armed stop (and no exit fired).
    async fn check_position(&self, mint: &str, uncached: bool) -> bool {
        let price = if uncached {
            self.router.spot_price_uncached(mint).await
        } else {
            self.router.spot_price(mint).await
        };
        let price = match price {
            Ok(Some(p)) if p > 0.0 => p,
            Ok(_) => {
                warn!(mint = %mint, "no price available — skipping exit evaluation");
                return false;
            }
            Err(e) => {
                warn!(mint = %mint, error = %e, "price fetch failed");
                return false;
            }
        };

        let now = now_ts();
        let delta_pct = self.settings.near_stop_delta_pct;
        let risk = self.state.risk.clone();

        // Decide under the write lock; no awaits in here.
        let evaluated = self.state.book.with_position_mut(mint, |pos| {
            if price > pos.peak_price {
                pos.peak_price = price;
                pos.peak_multiple = pos.multiple(price);
            }
            let decision = risk.should_exit(pos, price, now);
            let near = decision.is_none()
                && risk
                    .armed_stops(pos, price)
                    .iter()
                    .any(|stop| *stop > 0.0 && ((price - stop).abs() / stop) <= delta_pct);
            (decision, near, pos.clone())
        });

        let Some((decision, near, snapshot)) = evaluated else {
            return false; // evicted concurrently (failed confirmation)
        };

        if let Some(decision) = decision {
            self.execute_sell(snapshot, decision, price).await;
            return false;
        }
        near
    }

    // =========================================================================
    // Sell execution
    // =========================================================================

    /// Quote → build → sign → submit a sale of `decision.fraction` of the
    /// remaining inventory, then apply fill bookkeeping. Any error before
    /// submission simply returns; the position stays active and the next
    /// tick retries.
    pub async fn execute_sell(&self, position: Position, decision: ExitDecision, price: f64) {
        let mint = &position.mint;
        let full_exit = decision.fraction >= 1.0;

        let tokens_to_sell = if full_exit {
            position.remaining_tokens
        } else {
            (position.remaining_tokens as f64 * decision.fraction).floor() as u64
        };
        if tokens_to_sell < 1 {
            if full_exit {
                // Nothing left on chain; close the books directly.
                self.finalize_full_exit(&position, decision.reason, price, position.realized_pnl)
                    .await;
            } else {
                debug!(mint = %mint, "partial sale below one atomic unit — skipping");
            }
            return;
        }

        info!(
            mint = %mint,
            reason = %decision.reason,
            fraction = decision.fraction,
            tokens = tokens_to_sell,
            multiple = position.multiple(price),
            "executing sell"
        );

        let quote = match self
            .router
            .quote_with_fallback(mint, SOL_MINT, tokens_to_sell, self.settings.max_slippage_bps)
            .await
        {
            Ok(Some(q)) => q,
            Ok(None) => {
                warn!(mint = %mint, "no sell route — will retry next tick");
                return;
            }
            Err(e) => {
                warn!(mint = %mint, error = %e, "sell quote failed — will retry next tick");
                return;
            }
        };

        let unsigned = match self
            .router
            .build_swap(
                &quote,
                &self.signer.pubkey(),
                self.settings.priority_fee_lamports,
            )
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                warn!(mint = %mint, error = %e, "sell swap build failed — will retry next tick");
                return;
            }
        };

        let signed = match self.signer.sign_b64(&unsigned).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(mint = %mint, error = %e, "sell signing failed — will retry next tick");
                return;
            }
        };

        let tx_id = match self.rpc.submit_signed_tx(&signed).await {
            Ok(id) => id,
            Err(e) => {
                warn!(mint = %mint, error = %e, "sell submit failed — will retry next tick");
                return;
            }
        };

        // Fill accounting in USD.
        let sol_usd = self
            .sol_price
            .usd_price()
            .await
            .ok()
            .flatten()
            .unwrap_or(0.0);
        let proceeds_usd = quote.out_amount / 1e9 * sol_usd;
        let fraction_of_original = if position.size_tokens > 0 {
            tokens_to_sell as f64 / position.size_tokens as f64
        } else {
            0.0
        };
        let fill_pnl = proceeds_usd - position.size_usd * fraction_of_original;

        if let Err(e) = self
            .store
            .record_exit(&position.signal_id, mint, fraction_of_original)
            .await
        {
            warn!(mint = %mint, error = %e, "failed to persist exit fill");
        }

        // Write the fill back into the live position.
        let was_derisked = position.is_derisked;
        let updated = self.state.book.with_position_mut(mint, |pos| {
            pos.remaining_tokens = pos.remaining_tokens.saturating_sub(tokens_to_sell);
            pos.realized_pnl += fill_pnl;
            if full_exit {
                pos.status = PositionStatus::Completed;
            } else if decision.reason == ExitReason::ProfitTake && !pos.is_derisked {
                self.state.risk.mark_derisked(pos, price);
            }
            pos.clone()
        });

        let Some(updated) = updated else {
            warn!(mint = %mint, "position vanished during sell bookkeeping");
            return;
        };

        if full_exit {
            self.finalize_full_exit(&updated, decision.reason, price, updated.realized_pnl)
                .await;
        } else {
            info!(
                mint = %mint,
                tx_id = %tx_id,
                sold_fraction = fraction_of_original,
                remaining_tokens = updated.remaining_tokens,
                derisked = !was_derisked && updated.is_derisked,
                fill_pnl,
                "partial sell filled"
            );
        }
    }

    /// Terminal bookkeeping once a position is fully sold: persist the
    /// completed snapshot and CLOSED transition, evict from the book, and
    /// feed the portfolio counters.
    async fn finalize_full_exit(
        &self,
        position: &Position,
        reason: ExitReason,
        exit_price: f64,
        total_pnl: f64,
    ) {
        let now = now_ts();

        if let Err(e) = self
            .store
            .upsert_position(&PositionRow {
                signal_id: position.signal_id.clone(),
                mint: position.mint.clone(),
                status: Some(PositionStatus::Completed.as_str().into()),
                ..Default::default()
            })
            .await
        {
            warn!(mint = %position.mint, error = %e, "failed to persist completed position");
        }
        if let Err(e) = self
            .store
            .record_transition(&position.signal_id, &position.mint, OrderState::Closed.as_str())
            .await
        {
            warn!(mint = %position.mint, error = %e, "failed to persist CLOSED transition");
        }

        if self.state.book.remove(&position.mint).is_some() {
            self.state.risk.position_closed();
        }

        let trade = TradeResult {
            mint: position.mint.clone(),
            entry_time: position.entry_time,
            exit_time: now,
            entry_price: position.entry_price,
            exit_price,
            size_usd: position.size_usd,
            pnl_usd: total_pnl,
            pnl_pct: if position.size_usd > 0.0 {
                total_pnl / position.size_usd
            } else {
                0.0
            },
            exit_reason: reason,
            duration_minutes: (now - position.entry_time) / 60.0,
            peak_multiple: position.peak_multiple,
        };

        info!(
            mint = %trade.mint,
            reason = %reason,
            pnl_usd = trade.pnl_usd,
            pnl_pct = trade.pnl_pct,
            peak_multiple = trade.peak_multiple,
            duration_minutes = trade.duration_minutes,
            "position closed"
        );

        self.state.risk.record_trade_result(total_pnl);
        self.state.metrics.trades_total.inc();
        if total_pnl > 0.0 {
            self.state.metrics.trades_won.inc();
        }
        self.state.push_trade(trade);
    }
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("open_positions", &self.state.book.len())
            .finish()
    }
}
