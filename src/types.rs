// =============================================================================
// Shared types used across the Aurora meme executor
// =============================================================================

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the UNIX epoch as a float (sub-second precision).
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A token-discovery signal delivered by the upstream mention aggregator.
///
/// Signals are immutable once parsed off the stream. `signal_id` is either
/// producer-supplied or derived deterministically so that redelivery of the
/// same discovery event maps to the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    /// Token mint address.
    pub mint: String,
    /// Epoch seconds when the producer emitted the signal.
    pub timestamp: f64,
    /// "fast" or "slow" aggregation window.
    pub kind: String,
    pub ug_fast: u32,
    pub ug_slow: u32,
    pub velocity_mpm: f64,
    pub first_seen_ts: Option<i64>,
    /// Rugcheck score as delivered: "pending", "n/a", or a 0-10 rating where
    /// higher means safer.
    pub rugcheck_score: String,
    /// Free-form risk flag text, matched lowercase for honeypot/blacklist/high_tax.
    pub rugcheck_risks: String,
    /// LP lock description, e.g. "80% locked".
    pub rugcheck_lp: String,
    /// Admission priority in [0,1]; 0.6 is the hard entry floor.
    pub quality_score: f64,
}

impl Signal {
    /// Derive a deterministic signal id when the producer did not attach one.
    pub fn derive_signal_id(mint: &str, first_seen_ts: Option<i64>, timestamp: f64) -> String {
        let anchor = first_seen_ts.unwrap_or(timestamp as i64);
        format!("{mint}:{anchor}")
    }

    /// Whether the LP is considered locked. The upstream text is free-form;
    /// the contract is: locked iff it mentions a percentage and that
    /// percentage is not "0%".
    pub fn lp_locked(&self) -> bool {
        self.rugcheck_lp.contains('%') && !self.rugcheck_lp.contains("0%")
    }

    /// Reconstruct the quality score from signal features. Only used when the
    /// producer did not attach a score; a provided score is always accepted
    /// unchanged.
    pub fn reconstruct_quality_score(&self) -> f64 {
        let base = 0.6;
        let group_boost = ((self.ug_fast as f64 - 4.0) * 0.05).clamp(0.0, 0.2);
        let velocity_boost = (self.velocity_mpm / 10.0).min(0.1);

        let mut age_penalty = 0.0;
        if let Some(first_seen) = self.first_seen_ts {
            let age_minutes = (self.timestamp - first_seen as f64) / 60.0;
            if age_minutes > 30.0 {
                age_penalty = ((age_minutes - 30.0) / 60.0).min(0.2);
            }
        }

        (base + group_boost + velocity_boost - age_penalty).clamp(0.3, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Order lifecycle
// ---------------------------------------------------------------------------

/// Per-order finite-state machine. States only advance; FAILED is reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Quoted,
    Signed,
    Submitted,
    Confirmed,
    Failed,
    Closed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Quoted => "quoted",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Stopped,
    Completed,
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position (or a slice of it) was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Disaster,
    StopLoss,
    TimeStop,
    ProfitTake,
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disaster => "disaster",
            Self::StopLoss => "stop_loss",
            Self::TimeStop => "time_stop",
            Self::ProfitTake => "profit_take",
            Self::TrailingStop => "trailing_stop",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live position and its exit-management state.
///
/// Created on a confirmed (optimistically, on submitted) entry, mutated only
/// by the position monitor task that owns its mint, destroyed on terminal
/// exit or on confirmation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub mint: String,
    pub signal_id: String,
    /// Entry price in USD per UI token.
    pub entry_price: f64,
    /// Epoch seconds of entry submission.
    pub entry_time: f64,
    pub size_usd: f64,
    /// Total bought amount in atomic (smallest on-chain) units.
    pub size_tokens: u64,
    /// Unsold amount in atomic units.
    pub remaining_tokens: u64,
    pub token_decimals: u8,
    /// Entry transaction signature.
    pub entry_tx_id: String,

    // Risk metadata snapshot, frozen at entry.
    pub rugcheck_score: String,
    pub rugcheck_risks: String,
    pub lp_locked: bool,

    // Exit management.
    pub stop_loss_price: f64,
    pub peak_price: f64,
    pub peak_multiple: f64,
    pub is_derisked: bool,
    pub derisked_price: f64,
    pub runner_peak_price: f64,
    /// Integer multiples whose tier sale already fired.
    pub tiers_hit: BTreeSet<u32>,
    pub last_partial_sell_ts: f64,

    pub realized_pnl: f64,
    pub status: PositionStatus,
}

impl Position {
    /// Fraction of the original buy still held, in [0, 1].
    pub fn remaining_fraction(&self) -> f64 {
        if self.size_tokens == 0 {
            return 0.0;
        }
        self.remaining_tokens as f64 / self.size_tokens as f64
    }

    /// Unsold amount in UI units.
    pub fn remaining_ui(&self) -> f64 {
        self.remaining_tokens as f64 / 10f64.powi(self.token_decimals as i32)
    }

    /// Price multiple relative to entry.
    pub fn multiple(&self, current_price: f64) -> f64 {
        if self.entry_price > 0.0 {
            current_price / self.entry_price
        } else {
            0.0
        }
    }

    pub fn minutes_held(&self, now: f64) -> f64 {
        (now - self.entry_time) / 60.0
    }
}

// ---------------------------------------------------------------------------
// Trade results
// ---------------------------------------------------------------------------

/// Immutable record of a fully closed trade, fed into portfolio statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub mint: String,
    pub entry_time: f64,
    pub exit_time: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub duration_minutes: f64,
    pub peak_multiple: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn signal(ug_fast: u32, velocity: f64, age_min: f64) -> Signal {
        let now = 1_700_000_000.0;
        Signal {
            signal_id: "x".into(),
            mint: "MintA".into(),
            timestamp: now,
            kind: "fast".into(),
            ug_fast,
            ug_slow: 0,
            velocity_mpm: velocity,
            first_seen_ts: Some((now - age_min * 60.0) as i64),
            rugcheck_score: "pending".into(),
            rugcheck_risks: String::new(),
            rugcheck_lp: String::new(),
            quality_score: 0.0,
        }
    }

    #[test]
    fn signal_id_derivation_prefers_first_seen() {
        let id = Signal::derive_signal_id("MintA", Some(123), 456.7);
        assert_eq!(id, "MintA:123");
        let id = Signal::derive_signal_id("MintA", None, 456.7);
        assert_eq!(id, "MintA:456");
    }

    #[test]
    fn lp_locked_requires_nonzero_percentage() {
        let mut s = signal(4, 0.0, 0.0);
        s.rugcheck_lp = "95% locked".into();
        assert!(s.lp_locked());
        s.rugcheck_lp = "0% locked".into();
        assert!(!s.lp_locked());
        s.rugcheck_lp = "unknown".into();
        assert!(!s.lp_locked());
    }

    #[test]
    fn quality_reconstruction_base_case() {
        // At the group threshold, no velocity, fresh token: exactly base.
        let s = signal(4, 0.0, 0.0);
        assert!((s.reconstruct_quality_score() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn quality_reconstruction_boosts_are_capped() {
        // Many groups and extreme velocity saturate at 0.6 + 0.2 + 0.1.
        let s = signal(50, 1000.0, 0.0);
        assert!((s.reconstruct_quality_score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn quality_reconstruction_age_penalty_and_floor() {
        // Old token with no boosts is penalised but never below 0.3.
        let s = signal(4, 0.0, 120.0);
        let q = s.reconstruct_quality_score();
        assert!(q < 0.6);
        assert!(q >= 0.3);
    }

    #[test]
    fn order_state_round_trips_through_display() {
        for st in [
            OrderState::Pending,
            OrderState::Quoted,
            OrderState::Signed,
            OrderState::Submitted,
            OrderState::Confirmed,
            OrderState::Failed,
            OrderState::Closed,
        ] {
            assert_eq!(st.to_string(), st.as_str());
        }
    }

    #[test]
    fn position_fraction_math() {
        let pos = Position {
            mint: "m".into(),
            signal_id: "s".into(),
            entry_price: 2.0,
            entry_time: 0.0,
            size_usd: 10.0,
            size_tokens: 1_000,
            remaining_tokens: 250,
            token_decimals: 2,
            entry_tx_id: String::new(),
            rugcheck_score: "5".into(),
            rugcheck_risks: String::new(),
            lp_locked: true,
            stop_loss_price: 1.0,
            peak_price: 2.0,
            peak_multiple: 1.0,
            is_derisked: false,
            derisked_price: 0.0,
            runner_peak_price: 0.0,
            tiers_hit: BTreeSet::new(),
            last_partial_sell_ts: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Active,
        };
        assert!((pos.remaining_fraction() - 0.25).abs() < 1e-12);
        assert!((pos.remaining_ui() - 2.5).abs() < 1e-12);
        assert!((pos.multiple(4.0) - 2.0).abs() < 1e-12);
    }
}
