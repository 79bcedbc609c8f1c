// =============================================================================
// Central Application State — Aurora Meme Executor
// =============================================================================
//
// Ties the long-lived subsystems together for the loops and the operational
// API. All subsystems manage their own interior mutability; AppState itself
// only adds atomic counters and the start time.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::book::PositionBook;
use crate::metrics::Metrics;
use crate::risk::RiskManager;
use crate::settings::Settings;
use crate::types::TradeResult;

/// Maximum number of recent trade results retained for the API.
const MAX_RECENT_TRADES: usize = 100;

pub struct AppState {
    pub settings: Arc<Settings>,
    pub book: Arc<PositionBook>,
    pub risk: Arc<RiskManager>,
    pub metrics: Arc<Metrics>,

    /// Total signals pulled off the queue since boot.
    pub signals_processed: AtomicU64,

    /// Ring buffer of recently completed trades (newest last).
    pub recent_trades: RwLock<Vec<TradeResult>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        book: Arc<PositionBook>,
        risk: Arc<RiskManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            book,
            risk,
            metrics,
            signals_processed: AtomicU64::new(0),
            recent_trades: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Append a completed trade, evicting the oldest past the cap.
    pub fn push_trade(&self, trade: TradeResult) {
        let mut trades = self.recent_trades.write();
        trades.push(trade);
        if trades.len() > MAX_RECENT_TRADES {
            let excess = trades.len() - MAX_RECENT_TRADES;
            trades.drain(0..excess);
        }
    }

    pub fn record_signal(&self) {
        self.signals_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signals_total(&self) -> u64 {
        self.signals_processed.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("open_positions", &self.book.len())
            .field("signals_processed", &self.signals_total())
            .finish()
    }
}
