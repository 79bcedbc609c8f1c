// =============================================================================
// Risk Manager — portfolio circuit breakers + "capture the runner" exits
// =============================================================================
//
// Pure decision logic: consumes a signal or a position plus the current
// price, returns admit/exit decisions. Never performs I/O and never calls
// back into the engine; the account value needed for the daily-loss breaker
// is an injected estimator.
//
// Entry breakers (checked in order):
//   1. Trading halt window active.
//   2. Daily realized loss beyond limit  -> halts 6 h.
//   3. Consecutive losses at limit       -> halts 2 h.
//   4. Concurrent position cap.
//   5. Quality-score floor (0.6).
//
// Exit ladder (evaluated in order per price tick):
//   disaster stop -> base stop -> time stop -> de-risking -> profit tiers
//   -> runner trailing stop.
//
// Stop comparisons tolerate a 1e-12 relative epsilon so boundary prices
// never miss a fire.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::settings::Settings;
use crate::types::{now_ts, ExitReason, Position, PositionStatus, Signal};

/// Hard floor on signal quality for admission.
const QUALITY_FLOOR: f64 = 0.6;
/// Relative tolerance for stop/threshold boundary comparisons.
const BOUNDARY_EPS: f64 = 1e-12;

/// `a <= b` with relative epsilon (stop-style trigger).
fn le_eps(a: f64, b: f64) -> bool {
    a <= b + b.abs() * BOUNDARY_EPS
}

/// `a >= b` with relative epsilon (threshold-style trigger).
fn ge_eps(a: f64, b: f64) -> bool {
    a >= b - b.abs() * BOUNDARY_EPS
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An exit instruction: sell `fraction` of the remaining inventory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub fraction: f64,
}

/// Serialisable snapshot of the portfolio counters.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate: f64,
    pub daily_realized_pnl: f64,
    pub consecutive_losses: u32,
    pub active_positions: u32,
    pub trading_halted_until: f64,
    pub last_reset_time: f64,
}

// ---------------------------------------------------------------------------
// Internal mutable state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Inner {
    total_trades: u64,
    winning_trades: u64,
    losing_trades: u64,
    daily_realized_pnl: f64,
    consecutive_losses: u32,
    active_positions: u32,
    last_reset_time: f64,
    /// Epoch seconds; 0 means not halted.
    trading_halted_until: f64,
}

impl Inner {
    fn fresh() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            daily_realized_pnl: 0.0,
            consecutive_losses: 0,
            active_positions: 0,
            last_reset_time: now_ts(),
            trading_halted_until: 0.0,
        }
    }
}

/// Injected estimator of the total account value in USD.
pub type AccountValueFn = Box<dyn Fn() -> f64 + Send + Sync>;

pub struct RiskManager {
    settings: Arc<Settings>,
    stats: RwLock<Inner>,
    account_value: AccountValueFn,
}

impl RiskManager {
    pub fn new(settings: Arc<Settings>, account_value: AccountValueFn) -> Self {
        Self {
            settings,
            stats: RwLock::new(Inner::fresh()),
            account_value,
        }
    }

    // -------------------------------------------------------------------------
    // Entry admission
    // -------------------------------------------------------------------------

    /// Whether a new position may be opened for `signal`. Returns
    /// `(false, reason)` on rejection; the loss and streak breakers also arm
    /// the trading halt as a side effect.
    pub fn can_open(&self, signal: &Signal) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let now = now_ts();

        {
            let s = self.stats.read();
            if now < s.trading_halted_until {
                let remaining_min = (s.trading_halted_until - now) / 60.0;
                return (
                    false,
                    Some(format!("trading halted for {remaining_min:.1} more minutes")),
                );
            }
        }

        let account_value = (self.account_value)();
        let daily_loss_limit = account_value * self.settings.daily_loss_limit_pct;
        let (daily_pnl, consecutive, active) = {
            let s = self.stats.read();
            (s.daily_realized_pnl, s.consecutive_losses, s.active_positions)
        };

        if daily_pnl < -daily_loss_limit {
            self.halt_trading(6.0, "daily loss limit exceeded");
            return (false, Some("daily loss limit exceeded".into()));
        }

        if consecutive >= self.settings.consecutive_loss_limit {
            self.halt_trading(2.0, "too many consecutive losses");
            return (
                false,
                Some(format!("too many consecutive losses ({consecutive})")),
            );
        }

        if active >= self.settings.max_concurrent_positions {
            return (false, Some(format!("too many active positions ({active})")));
        }

        if signal.quality_score < QUALITY_FLOOR {
            return (
                false,
                Some(format!(
                    "signal quality too low ({:.3})",
                    signal.quality_score
                )),
            );
        }

        (true, None)
    }

    /// Halt all entries for `hours`.
    pub fn halt_trading(&self, hours: f64, reason: &str) {
        let until = now_ts() + hours * 3600.0;
        self.stats.write().trading_halted_until = until;
        warn!(hours, reason, "trading halted");
    }

    // -------------------------------------------------------------------------
    // Stop sizing from the risk profile
    // -------------------------------------------------------------------------

    /// Risk-adjusted stop percentage in [0.10, 0.90].
    ///
    /// Unknown scores widen the stop (more room), low scores and explicit
    /// risk flags tighten it; flag multipliers override the score multiplier
    /// and an unlocked LP tightens a further 20 %.
    pub fn stop_pct(&self, rugcheck_score: &str, rugcheck_risks: &str, lp_locked: bool) -> f64 {
        let mut multiplier = match rugcheck_score {
            "pending" | "n/a" => 0.7,
            s => match s.parse::<f64>() {
                Ok(score) if score <= 3.0 => 1.4,
                Ok(score) if score <= 6.0 => 1.2,
                Ok(score) if score >= 8.0 => 0.8,
                Ok(_) => 1.0,
                Err(_) => 1.0,
            },
        };

        let risks = rugcheck_risks.to_lowercase();
        if risks.contains("honeypot") {
            multiplier = 2.0;
        } else if risks.contains("blacklist") {
            multiplier = 1.8;
        } else if risks.contains("high_tax") {
            multiplier = 1.3;
        }

        if !lp_locked {
            multiplier *= 1.2;
        }

        (self.settings.stop_loss_base_pct * multiplier).clamp(0.10, 0.90)
    }

    /// Stop-loss price for a freshly opened position.
    pub fn stop_loss_price(&self, position: &Position) -> f64 {
        let pct = self.stop_pct(
            &position.rugcheck_score,
            &position.rugcheck_risks,
            position.lp_locked,
        );
        position.entry_price * (1.0 - pct)
    }

    /// Risk-adjusted time-stop window in minutes.
    pub fn time_stop_minutes(&self, position: &Position) -> f64 {
        let base = self.settings.time_stop_minutes;
        if position.rugcheck_score == "pending" {
            base * 0.5
        } else if position.rugcheck_risks.to_lowercase().contains("honeypot") {
            base * 0.3
        } else if !position.lp_locked {
            base * 0.7
        } else {
            base
        }
    }

    // -------------------------------------------------------------------------
    // Exit ladder
    // -------------------------------------------------------------------------

    /// Evaluate the exit ladder for one price observation.
    ///
    /// Mutates exit-management state on the position: tier bookkeeping and
    /// the runner peak ratchet happen at decision time so a redelivered tick
    /// cannot fire the same tier twice. De-risk completion (`is_derisked`,
    /// breakeven stop) is flipped by the caller once the sale succeeds.
    pub fn should_exit(
        &self,
        position: &mut Position,
        current_price: f64,
        now: f64,
    ) -> Option<ExitDecision> {
        if position.status != PositionStatus::Active {
            return None;
        }

        let multiple = position.multiple(current_price);
        let minutes_held = position.minutes_held(now);

        // 1. Disaster stop.
        let disaster_price = position.entry_price * (1.0 - self.settings.disaster_stop_pct);
        if le_eps(current_price, disaster_price) {
            warn!(mint = %position.mint, multiple, "disaster stop triggered");
            return Some(ExitDecision {
                reason: ExitReason::Disaster,
                fraction: 1.0,
            });
        }

        // 2. Base stop.
        if position.stop_loss_price > 0.0 && le_eps(current_price, position.stop_loss_price) {
            info!(
                mint = %position.mint,
                price = current_price,
                stop = position.stop_loss_price,
                "stop loss triggered"
            );
            return Some(ExitDecision {
                reason: ExitReason::StopLoss,
                fraction: 1.0,
            });
        }

        // 3. Time stop: held past the window without reaching the profit target.
        let profit_target = 1.0 + self.settings.time_stop_profit_target_pct;
        if minutes_held >= self.time_stop_minutes(position) && multiple < profit_target {
            info!(
                mint = %position.mint,
                multiple,
                minutes_held,
                "time stop triggered"
            );
            return Some(ExitDecision {
                reason: ExitReason::TimeStop,
                fraction: 1.0,
            });
        }

        // 4. De-risking: first partial that recovers the principal.
        if !position.is_derisked && ge_eps(multiple, self.settings.derisking_multiple) {
            info!(
                mint = %position.mint,
                multiple,
                sell_pct = self.settings.derisking_sell_pct,
                "de-risking triggered"
            );
            return Some(ExitDecision {
                reason: ExitReason::ProfitTake,
                fraction: self.settings.derisking_sell_pct,
            });
        }

        // 5. Profit tiers: lowest unhit tier at or below the current multiple.
        if position.is_derisked
            && position.remaining_tokens > 0
            && now - position.last_partial_sell_ts >= self.settings.partial_sell_cooldown_sec
        {
            for &(tier_multiple, tier_fraction) in &self.settings.profit_tiers {
                let tier_key = tier_multiple as u32;
                if position.tiers_hit.contains(&tier_key) {
                    continue;
                }
                if !ge_eps(multiple, tier_multiple) {
                    break;
                }

                // Cap the sale so the remaining share of the original buy
                // never drops below the permanent runner floor.
                let remaining_frac = position.remaining_fraction();
                let max_fraction = if remaining_frac > 0.0 {
                    (1.0 - self.settings.min_runner_pct / remaining_frac).max(0.0)
                } else {
                    0.0
                };
                let fraction = tier_fraction.min(max_fraction);

                if fraction <= 0.0 {
                    // Already at the runner floor; higher tiers are capped too.
                    debug!(mint = %position.mint, tier = tier_multiple, "tier capped to runner floor");
                    break;
                }

                position.tiers_hit.insert(tier_key);
                position.last_partial_sell_ts = now;
                info!(
                    mint = %position.mint,
                    tier = tier_multiple,
                    fraction,
                    "profit tier triggered"
                );
                return Some(ExitDecision {
                    reason: ExitReason::ProfitTake,
                    fraction,
                });
            }
        }

        // 6. Runner trailing stop, ratcheting by zones.
        if position.is_derisked {
            if position.runner_peak_price <= 0.0 {
                position.runner_peak_price = position.peak_price.max(position.entry_price);
            }
            if current_price > position.runner_peak_price {
                position.runner_peak_price = current_price;
            }

            let mut trail_pct = self.settings.runner_trailing_stop_pct;
            for &(threshold, pct) in &self.settings.trailing_zones {
                if ge_eps(multiple, threshold) {
                    trail_pct = pct;
                } else {
                    break;
                }
            }

            let trailing_stop = position.runner_peak_price * (1.0 - trail_pct);
            let final_stop = trailing_stop.max(position.entry_price);
            if le_eps(current_price, final_stop) {
                info!(
                    mint = %position.mint,
                    peak_multiple = position.runner_peak_price / position.entry_price,
                    multiple,
                    trail_pct,
                    "runner trailing stop triggered"
                );
                return Some(ExitDecision {
                    reason: ExitReason::TrailingStop,
                    fraction: 1.0,
                });
            }
        }

        None
    }

    /// The stop prices that can fire between regular ticks, for the
    /// near-stop turbo check: the base stop plus (when de-risked) the
    /// current runner trailing stop.
    pub fn armed_stops(&self, position: &Position, current_price: f64) -> Vec<f64> {
        let mut stops = Vec::with_capacity(2);
        if position.stop_loss_price > 0.0 {
            stops.push(position.stop_loss_price);
        }
        if position.is_derisked && position.runner_peak_price > 0.0 {
            let multiple = position.multiple(current_price);
            let mut trail_pct = self.settings.runner_trailing_stop_pct;
            for &(threshold, pct) in &self.settings.trailing_zones {
                if ge_eps(multiple, threshold) {
                    trail_pct = pct;
                } else {
                    break;
                }
            }
            let trail = (position.runner_peak_price * (1.0 - trail_pct)).max(position.entry_price);
            stops.push(trail);
        }
        stops
    }

    /// Flip a position into its de-risked state after the recovery sale
    /// filled: breakeven stop, runner peak seeded at the sale price.
    pub fn mark_derisked(&self, position: &mut Position, sale_price: f64) {
        position.is_derisked = true;
        position.derisked_price = sale_price;
        position.runner_peak_price = sale_price;
        position.stop_loss_price = position.entry_price;
        info!(
            mint = %position.mint,
            sale_multiple = position.multiple(sale_price),
            "position de-risked — stop moved to breakeven"
        );
    }

    // -------------------------------------------------------------------------
    // Portfolio accounting
    // -------------------------------------------------------------------------

    /// Record the PnL of a fully closed trade.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.stats.write();
        s.total_trades += 1;
        s.daily_realized_pnl += pnl;
        if pnl > 0.0 {
            s.winning_trades += 1;
            s.consecutive_losses = 0;
        } else {
            s.losing_trades += 1;
            s.consecutive_losses += 1;
        }
        let win_rate = s.winning_trades as f64 / s.total_trades.max(1) as f64;
        info!(
            pnl,
            daily_pnl = s.daily_realized_pnl,
            consecutive_losses = s.consecutive_losses,
            win_rate,
            "trade recorded"
        );
    }

    pub fn position_opened(&self) {
        self.stats.write().active_positions += 1;
    }

    pub fn position_closed(&self) {
        let mut s = self.stats.write();
        s.active_positions = s.active_positions.saturating_sub(1);
    }

    /// Seed counters from recovered state on boot.
    pub fn restore_active_positions(&self, count: u32) {
        self.stats.write().active_positions = count;
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let s = self.stats.read();
        PortfolioSnapshot {
            total_trades: s.total_trades,
            winning_trades: s.winning_trades,
            losing_trades: s.losing_trades,
            win_rate: s.winning_trades as f64 / s.total_trades.max(1) as f64,
            daily_realized_pnl: s.daily_realized_pnl,
            consecutive_losses: s.consecutive_losses,
            active_positions: s.active_positions,
            trading_halted_until: s.trading_halted_until,
            last_reset_time: s.last_reset_time,
        }
    }

    /// Reset the daily counters once 24 h have passed since the last reset.
    pub fn maybe_reset_daily(&self) {
        let now = now_ts();
        {
            let s = self.stats.read();
            if now - s.last_reset_time < 24.0 * 3600.0 {
                return;
            }
        }
        let mut s = self.stats.write();
        if now - s.last_reset_time >= 24.0 * 3600.0 {
            info!("daily portfolio counters reset");
            s.daily_realized_pnl = 0.0;
            s.consecutive_losses = 0;
            s.last_reset_time = now;
        }
    }

    #[cfg(test)]
    fn force_stats<F: FnOnce(&mut Inner)>(&self, f: F) {
        f(&mut self.stats.write());
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.stats.read();
        f.debug_struct("RiskManager")
            .field("active_positions", &s.active_positions)
            .field("daily_realized_pnl", &s.daily_realized_pnl)
            .field("consecutive_losses", &s.consecutive_losses)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn risk() -> RiskManager {
        RiskManager::new(Arc::new(Settings::for_tests()), Box::new(|| 1000.0))
    }

    fn signal(quality: f64) -> Signal {
        Signal {
            signal_id: "sig-1".into(),
            mint: "MintA".into(),
            timestamp: now_ts(),
            kind: "fast".into(),
            ug_fast: 5,
            ug_slow: 1,
            velocity_mpm: 2.0,
            first_seen_ts: None,
            rugcheck_score: "7".into(),
            rugcheck_risks: "none".into(),
            rugcheck_lp: "90% locked".into(),
            quality_score: quality,
        }
    }

    fn position(entry: f64) -> Position {
        Position {
            mint: "MintA".into(),
            signal_id: "sig-1".into(),
            entry_price: entry,
            entry_time: now_ts(),
            size_usd: 10.0,
            size_tokens: 1_000_000,
            remaining_tokens: 1_000_000,
            token_decimals: 6,
            entry_tx_id: "tx".into(),
            rugcheck_score: "7".into(),
            rugcheck_risks: "none".into(),
            lp_locked: true,
            stop_loss_price: entry * 0.5,
            peak_price: entry,
            peak_multiple: 1.0,
            is_derisked: false,
            derisked_price: 0.0,
            runner_peak_price: 0.0,
            tiers_hit: BTreeSet::new(),
            last_partial_sell_ts: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Active,
        }
    }

    // ── Admission ───────────────────────────────────────────────────────

    #[test]
    fn admits_a_clean_signal() {
        let r = risk();
        let (ok, reason) = r.can_open(&signal(0.8));
        assert!(ok, "rejected: {reason:?}");
    }

    #[test]
    fn rejects_below_quality_floor() {
        let r = risk();
        let (ok, reason) = r.can_open(&signal(0.59));
        assert!(!ok);
        assert!(reason.unwrap().contains("quality"));
    }

    #[test]
    fn rejects_at_position_cap() {
        let r = risk();
        for _ in 0..8 {
            r.position_opened();
        }
        let (ok, reason) = r.can_open(&signal(0.9));
        assert!(!ok);
        assert!(reason.unwrap().contains("active positions"));
    }

    #[test]
    fn consecutive_losses_trip_a_two_hour_halt() {
        let r = risk();
        for _ in 0..4 {
            r.record_trade_result(-5.0);
        }
        let (ok, reason) = r.can_open(&signal(0.9));
        assert!(!ok);
        assert!(reason.unwrap().contains("consecutive losses"));

        // The halt is now armed; subsequent rejections cite the halt window.
        let (ok, reason) = r.can_open(&signal(0.9));
        assert!(!ok);
        assert!(reason.unwrap().contains("halted"));

        // Once the halt expires (and the streak is broken), entries resume.
        r.force_stats(|s| {
            s.trading_halted_until = now_ts() - 1.0;
            s.consecutive_losses = 0;
        });
        let (ok, _) = r.can_open(&signal(0.9));
        assert!(ok);
    }

    #[test]
    fn daily_loss_limit_trips_a_six_hour_halt() {
        let r = risk();
        // 1000 USD account, 4% limit: -41 breaches it.
        r.record_trade_result(-41.0);
        let (ok, reason) = r.can_open(&signal(0.9));
        assert!(!ok);
        assert!(reason.unwrap().contains("daily loss"));
        let halted_until = r.snapshot().trading_halted_until;
        assert!(halted_until > now_ts() + 5.9 * 3600.0);
    }

    #[test]
    fn a_win_resets_the_loss_streak() {
        let r = risk();
        for _ in 0..3 {
            r.record_trade_result(-1.0);
        }
        r.record_trade_result(10.0);
        assert_eq!(r.snapshot().consecutive_losses, 0);
        let (ok, _) = r.can_open(&signal(0.9));
        assert!(ok);
    }

    // ── Stop sizing ─────────────────────────────────────────────────────

    #[test]
    fn stop_pct_widens_for_unknown_scores() {
        let r = risk();
        // 0.50 base × 0.7 = 0.35.
        assert!((r.stop_pct("pending", "none", true) - 0.35).abs() < 1e-9);
    }

    #[test]
    fn stop_pct_score_bands() {
        let r = risk();
        assert!((r.stop_pct("2", "none", true) - 0.70).abs() < 1e-9); // ×1.4
        assert!((r.stop_pct("5", "none", true) - 0.60).abs() < 1e-9); // ×1.2
        assert!((r.stop_pct("9", "none", true) - 0.40).abs() < 1e-9); // ×0.8
        assert!((r.stop_pct("7", "none", true) - 0.50).abs() < 1e-9); // ×1.0
    }

    #[test]
    fn risk_flags_override_the_score_multiplier() {
        let r = risk();
        // honeypot: 0.50 × 2.0 = 1.0, clamped to 0.90.
        assert!((r.stop_pct("9", "HONEYPOT risk", true) - 0.90).abs() < 1e-9);
        assert!((r.stop_pct("9", "blacklisted", true) - 0.90).abs() < 1e-9);
        assert!((r.stop_pct("9", "high_tax", true) - 0.65).abs() < 1e-9);
    }

    #[test]
    fn unlocked_lp_tightens_further() {
        let r = risk();
        // 0.50 × 1.0 × 1.2 = 0.60.
        assert!((r.stop_pct("7", "none", false) - 0.60).abs() < 1e-9);
    }

    #[test]
    fn time_stop_scales_with_risk_profile() {
        let r = risk();
        let mut p = position(1.0);
        assert!((r.time_stop_minutes(&p) - 60.0).abs() < 1e-9);

        p.rugcheck_score = "pending".into();
        assert!((r.time_stop_minutes(&p) - 30.0).abs() < 1e-9);

        p.rugcheck_score = "7".into();
        p.rugcheck_risks = "honeypot".into();
        assert!((r.time_stop_minutes(&p) - 18.0).abs() < 1e-9);

        p.rugcheck_risks = "none".into();
        p.lp_locked = false;
        assert!((r.time_stop_minutes(&p) - 42.0).abs() < 1e-9);
    }

    // ── Exit ladder ─────────────────────────────────────────────────────

    #[test]
    fn disaster_stop_fires_at_the_boundary() {
        let r = risk();
        let mut p = position(1.0);
        let d = r.should_exit(&mut p, 0.20, now_ts()).unwrap();
        assert_eq!(d.reason, ExitReason::Disaster);
        assert!((d.fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disaster_outranks_the_base_stop() {
        let r = risk();
        let mut p = position(1.0);
        p.stop_loss_price = 0.5;
        let d = r.should_exit(&mut p, 0.15, now_ts()).unwrap();
        assert_eq!(d.reason, ExitReason::Disaster);
    }

    #[test]
    fn base_stop_fires_at_exact_stop_price() {
        let r = risk();
        let mut p = position(1.0);
        p.stop_loss_price = 0.5;
        let d = r.should_exit(&mut p, 0.5, now_ts()).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
        assert!((d.fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn time_stop_fires_only_without_the_profit_target() {
        let r = risk();
        let now = now_ts();

        let mut p = position(1.0);
        p.entry_time = now - 61.0 * 60.0;
        let d = r.should_exit(&mut p, 1.1, now).unwrap();
        assert_eq!(d.reason, ExitReason::TimeStop);

        // Same age but at 1.6x: the target (+50%) was reached, so it holds.
        let mut p = position(1.0);
        p.entry_time = now - 61.0 * 60.0;
        assert!(r.should_exit(&mut p, 1.6, now).is_none());
    }

    #[test]
    fn derisking_fires_at_exactly_the_configured_multiple() {
        let r = risk();
        let mut p = position(1.0);
        let d = r.should_exit(&mut p, 3.0, now_ts()).unwrap();
        assert_eq!(d.reason, ExitReason::ProfitTake);
        assert!((d.fraction - 0.33).abs() < 1e-9);
        // The flag flips only when the sale completes.
        assert!(!p.is_derisked);
    }

    #[test]
    fn no_exit_in_the_quiet_zone() {
        let r = risk();
        let mut p = position(1.0);
        assert!(r.should_exit(&mut p, 1.5, now_ts()).is_none());
    }

    #[test]
    fn tiers_fire_lowest_first_and_only_once() {
        let r = risk();
        let now = now_ts();
        let mut p = position(1.0);
        r.mark_derisked(&mut p, 3.0);
        p.remaining_tokens = 670_000;

        // 9x clears the 5x and 8x tiers, but only the lowest fires per tick.
        let d = r.should_exit(&mut p, 9.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::ProfitTake);
        assert!((d.fraction - 0.10).abs() < 1e-9);
        assert!(p.tiers_hit.contains(&5));
        assert!(!p.tiers_hit.contains(&8));

        // Cooldown gates the next tier.
        assert!(r.should_exit(&mut p, 9.0, now + 1.0).is_none());

        // After the cooldown, the 8x tier fires.
        let d = r.should_exit(&mut p, 9.0, now + 181.0).unwrap();
        assert_eq!(d.reason, ExitReason::ProfitTake);
        assert!(p.tiers_hit.contains(&8));
    }

    #[test]
    fn tier_sale_is_capped_by_the_runner_floor() {
        let r = risk();
        let now = now_ts();
        let mut p = position(1.0);
        r.mark_derisked(&mut p, 3.0);
        // 7.5% of the original left; a full 10% tier would dip below the 7% floor.
        p.remaining_tokens = 75_000;
        p.last_partial_sell_ts = 0.0;

        let d = r.should_exit(&mut p, 5.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::ProfitTake);
        // Only the excess above the floor may be sold: 1 - 0.07/0.075.
        assert!((d.fraction - (1.0 - 0.07 / 0.075)).abs() < 1e-9);

        let after_sale = p.remaining_fraction() * (1.0 - d.fraction);
        assert!(after_sale >= 0.07 - 1e-9);
    }

    #[test]
    fn tier_at_the_floor_sells_nothing_and_stays_unhit() {
        let r = risk();
        let mut p = position(1.0);
        r.mark_derisked(&mut p, 3.0);
        p.remaining_tokens = 70_000; // exactly the 7% floor
        p.last_partial_sell_ts = 0.0;

        assert!(r.should_exit(&mut p, 5.0, now_ts()).is_none());
        assert!(p.tiers_hit.is_empty());
    }

    #[test]
    fn trailing_stop_ratchets_and_never_sells_below_entry() {
        let r = risk();
        let now = now_ts();
        let mut p = position(1.0);
        r.mark_derisked(&mut p, 3.0);
        p.tiers_hit = (0u32..2000).collect(); // silence tiers for this test

        // Peak ratchets to 10x. Back at 8x the zone trail is 25%, so the
        // stop off the peak sits at 7.5.
        assert!(r.should_exit(&mut p, 10.0, now).is_none());
        assert!((p.runner_peak_price - 10.0).abs() < 1e-9);
        assert!(r.should_exit(&mut p, 8.0, now).is_none());

        let d = r.should_exit(&mut p, 7.5, now).unwrap();
        assert_eq!(d.reason, ExitReason::TrailingStop);

        // A collapsed runner is still floored at breakeven, not below.
        let mut p2 = position(1.0);
        r.mark_derisked(&mut p2, 3.0);
        p2.tiers_hit = (0u32..2000).collect();
        p2.runner_peak_price = 1.2;
        let d = r.should_exit(&mut p2, 1.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::TrailingStop);
    }

    #[test]
    fn trailing_zone_selection_takes_highest_threshold_reached() {
        let r = risk();
        let now = now_ts();
        let mut p = position(1.0);
        r.mark_derisked(&mut p, 3.0);
        p.tiers_hit = (0u32..2000).collect();

        // Peak ratchets to 55x; at 55x the 50-zone gives a 15% trail
        // (stop 46.75). Once price sits at 47x the zone loosens to 20%
        // (stop 44.0): no fire at 47, fire at the 44 boundary.
        assert!(r.should_exit(&mut p, 55.0, now).is_none());
        assert!(r.should_exit(&mut p, 47.0, now).is_none());
        let d = r.should_exit(&mut p, 44.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::TrailingStop);
    }

    #[test]
    fn clean_winner_walkthrough() {
        // Entry 1.00 → 3.10 de-risk → 8.00 tier → 55.00 peak → 38.00 exit.
        let r = risk();
        let mut now = now_ts();
        let mut p = position(1.0);
        p.stop_loss_price = 0.5;

        // 3.10: de-risk partial.
        let d = r.should_exit(&mut p, 3.10, now).unwrap();
        assert_eq!((d.reason, d.fraction), (ExitReason::ProfitTake, 0.33));
        p.remaining_tokens = (p.remaining_tokens as f64 * (1.0 - d.fraction)) as u64;
        r.mark_derisked(&mut p, 3.10);

        // 8.00 after the cooldown: the 5x tier (lowest unhit) fires.
        now += 200.0;
        let d = r.should_exit(&mut p, 8.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::ProfitTake);
        assert!(p.tiers_hit.contains(&5));
        p.remaining_tokens = (p.remaining_tokens as f64 * (1.0 - d.fraction)) as u64;

        // 55.00 much later: tiers keep peeling as cooldowns pass; eventually
        // the runner peak sits at 55 and a drop to 38 (< 55×0.85) fires the
        // trailing stop in the 50x zone.
        for _ in 0..10 {
            now += 200.0;
            if let Some(d) = r.should_exit(&mut p, 55.0, now) {
                assert_eq!(d.reason, ExitReason::ProfitTake);
                p.remaining_tokens = (p.remaining_tokens as f64 * (1.0 - d.fraction)) as u64;
            } else {
                break;
            }
        }
        assert!((p.runner_peak_price - 55.0).abs() < 1e-9);
        assert!(p.remaining_fraction() >= 0.07 - 1e-9);

        now += 200.0;
        let d = r.should_exit(&mut p, 38.0, now).unwrap();
        assert_eq!(d.reason, ExitReason::TrailingStop);
        assert!((d.fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn armed_stops_cover_base_and_trailing() {
        let r = risk();
        let mut p = position(1.0);
        p.stop_loss_price = 0.5;
        assert_eq!(r.armed_stops(&p, 1.0), vec![0.5]);

        r.mark_derisked(&mut p, 3.0);
        p.runner_peak_price = 10.0;
        let stops = r.armed_stops(&p, 10.0);
        assert_eq!(stops.len(), 2);
        // Breakeven stop plus the 22% zone trail off the 10x peak.
        assert!((stops[0] - 1.0).abs() < 1e-9);
        assert!((stops[1] - 7.8).abs() < 1e-9);
    }
}
