// =============================================================================
// Position Book — in-memory table of live positions, keyed by mint
// =============================================================================
//
// Owns every active Position. Mutation happens from the position monitor
// (price updates, exit bookkeeping) and from the execution engine (open,
// confirmation failure); the lock is never held across an await point, so
// monitor passes copy what they need out, act, then write results back.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::Position;

pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a freshly opened (or recovered) position.
    pub fn insert(&self, position: Position) {
        self.positions
            .write()
            .insert(position.mint.clone(), position);
    }

    /// Remove and return a position (terminal exit or failed confirmation).
    pub fn remove(&self, mint: &str) -> Option<Position> {
        self.positions.write().remove(mint)
    }

    /// Whether the book already holds this mint.
    pub fn contains(&self, mint: &str) -> bool {
        self.positions.read().contains_key(mint)
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// Mints of all live positions; the monitor iterates over this snapshot
    /// so the map lock is released before any I/O.
    pub fn mints(&self) -> Vec<String> {
        self.positions.read().keys().cloned().collect()
    }

    /// Clone of a single position.
    pub fn get(&self, mint: &str) -> Option<Position> {
        self.positions.read().get(mint).cloned()
    }

    /// Full snapshot for the API and portfolio logging.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Apply a closure to one position under the write lock. Returns the
    /// closure's result, or `None` when the mint is gone.
    pub fn with_position_mut<T>(&self, mint: &str, f: impl FnOnce(&mut Position) -> T) -> Option<T> {
        self.positions.write().get_mut(mint).map(f)
    }

    /// Sum of mark-to-market USD value across the book, priced at each
    /// position's peak (conservative account-value estimate).
    pub fn mark_to_market_usd(&self) -> f64 {
        self.positions
            .read()
            .values()
            .map(|p| {
                let price = if p.peak_price > 0.0 {
                    p.peak_price
                } else {
                    p.entry_price
                };
                p.remaining_ui() * price
            })
            .sum()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open_positions", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionStatus;
    use std::collections::BTreeSet;

    fn position(mint: &str) -> Position {
        Position {
            mint: mint.into(),
            signal_id: format!("{mint}:1"),
            entry_price: 1.0,
            entry_time: 0.0,
            size_usd: 10.0,
            size_tokens: 1_000_000,
            remaining_tokens: 500_000,
            token_decimals: 6,
            entry_tx_id: "tx".into(),
            rugcheck_score: "7".into(),
            rugcheck_risks: String::new(),
            lp_locked: true,
            stop_loss_price: 0.5,
            peak_price: 2.0,
            peak_multiple: 2.0,
            is_derisked: false,
            derisked_price: 0.0,
            runner_peak_price: 0.0,
            tiers_hit: BTreeSet::new(),
            last_partial_sell_ts: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Active,
        }
    }

    #[test]
    fn insert_contains_remove_roundtrip() {
        let book = PositionBook::new();
        assert!(book.is_empty());

        book.insert(position("MintA"));
        assert!(book.contains("MintA"));
        assert_eq!(book.len(), 1);

        let removed = book.remove("MintA").unwrap();
        assert_eq!(removed.mint, "MintA");
        assert!(book.is_empty());
        assert!(book.remove("MintA").is_none());
    }

    #[test]
    fn with_position_mut_applies_updates() {
        let book = PositionBook::new();
        book.insert(position("MintA"));

        let new_remaining = book
            .with_position_mut("MintA", |p| {
                p.remaining_tokens = 100;
                p.remaining_tokens
            })
            .unwrap();
        assert_eq!(new_remaining, 100);
        assert_eq!(book.get("MintA").unwrap().remaining_tokens, 100);

        assert!(book.with_position_mut("Missing", |_| ()).is_none());
    }

    #[test]
    fn mark_to_market_uses_peak_price() {
        let book = PositionBook::new();
        book.insert(position("MintA")); // 0.5 UI tokens at peak 2.0 = 1.0 USD
        book.insert(position("MintB"));
        assert!((book.mark_to_market_usd() - 2.0).abs() < 1e-9);
    }
}
