// =============================================================================
// Idempotency & State Store — embedded SQLite (single writer)
// =============================================================================
//
// Sole source of truth for crash recovery. Four relations:
//
//   processed_signals — at-most-once guard per signal_id
//   order_transitions — one row per (signal_id, state) of the order FSM
//   exits             — append-only exit fills, fractions per signal_id
//   positions         — open-position snapshots for startup recovery
//
// Durability: WAL journal with full synchronous mode; every write completes
// before the caller takes the dependent external action (ack, submit).
// Callers serialize through the single-connection pool; cross-process use is
// not supported.
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::types::now_ts;

/// Persisted snapshot of a position row. Optional columns keep upsert
/// COALESCE semantics: `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct PositionRow {
    pub signal_id: String,
    pub mint: String,
    pub entry_tx_id: Option<String>,
    pub entry_time: Option<f64>,
    pub size_usd: Option<f64>,
    pub size_tokens: Option<i64>,
    pub token_decimals: Option<i64>,
    pub entry_price: Option<f64>,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if missing) the database at `db_path`. `":memory:"`
    /// yields an in-memory store for tests.
    pub async fn open(db_path: &str) -> Result<Self> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create database directory")?;
                }
            }
            format!("sqlite://{db_path}")
        };

        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);

        // Single connection: the store is a single writer per process and the
        // pool's checkout queue doubles as the internal async lock.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open state database")?;

        let store = Self { pool };
        store.init().await?;
        info!(path = db_path, "state store ready");
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_signals (
                signal_id    TEXT PRIMARY KEY,
                processed_at REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create processed_signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_transitions (
                signal_id TEXT NOT NULL,
                mint      TEXT NOT NULL,
                state     TEXT NOT NULL,
                ts        REAL NOT NULL,
                PRIMARY KEY (signal_id, state)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create order_transitions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exits (
                signal_id TEXT NOT NULL,
                mint      TEXT NOT NULL,
                pct       REAL NOT NULL,
                ts        REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create exits table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                signal_id      TEXT PRIMARY KEY,
                mint           TEXT NOT NULL,
                entry_tx_id    TEXT,
                entry_time     REAL,
                size_usd       REAL,
                size_tokens    INTEGER,
                token_decimals INTEGER,
                entry_price    REAL,
                status         TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create positions table")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Idempotency
    // -------------------------------------------------------------------------

    pub async fn has_processed(&self, signal_id: &str) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM processed_signals WHERE signal_id = ?")
                .bind(signal_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn mark_processed(&self, signal_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO processed_signals (signal_id, processed_at) VALUES (?, ?)",
        )
        .bind(signal_id)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order FSM transitions
    // -------------------------------------------------------------------------

    pub async fn record_transition(&self, signal_id: &str, mint: &str, state: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO order_transitions (signal_id, mint, state, ts) VALUES (?, ?, ?, ?)",
        )
        .bind(signal_id)
        .bind(mint)
        .bind(state)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent recorded state for an order, if any.
    pub async fn last_state(&self, signal_id: &str) -> Result<Option<String>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT state FROM order_transitions WHERE signal_id = ? ORDER BY ts DESC, rowid DESC LIMIT 1",
        )
        .bind(signal_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    // -------------------------------------------------------------------------
    // Exit fills
    // -------------------------------------------------------------------------

    pub async fn record_exit(&self, signal_id: &str, mint: &str, fraction: f64) -> Result<()> {
        sqlx::query("INSERT INTO exits (signal_id, mint, pct, ts) VALUES (?, ?, ?, ?)")
            .bind(signal_id)
            .bind(mint)
            .bind(fraction)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sum of recorded exit fractions for a signal (≤ 1.0 by construction).
    pub async fn sum_exit_fractions(&self, signal_id: &str) -> Result<f64> {
        let sum: f64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(pct), 0.0) FROM exits WHERE signal_id = ?")
                .bind(signal_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(sum)
    }

    // -------------------------------------------------------------------------
    // Position snapshots
    // -------------------------------------------------------------------------

    /// Insert or merge a position snapshot. `None` fields keep whatever is
    /// already stored for that column.
    pub async fn upsert_position(&self, row: &PositionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (signal_id, mint, entry_tx_id, entry_time, size_usd, size_tokens, token_decimals, entry_price, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(signal_id) DO UPDATE SET
                mint           = excluded.mint,
                entry_tx_id    = COALESCE(excluded.entry_tx_id, positions.entry_tx_id),
                entry_time     = COALESCE(excluded.entry_time, positions.entry_time),
                size_usd       = COALESCE(excluded.size_usd, positions.size_usd),
                size_tokens    = COALESCE(excluded.size_tokens, positions.size_tokens),
                token_decimals = COALESCE(excluded.token_decimals, positions.token_decimals),
                entry_price    = COALESCE(excluded.entry_price, positions.entry_price),
                status         = COALESCE(excluded.status, positions.status)
            "#,
        )
        .bind(&row.signal_id)
        .bind(&row.mint)
        .bind(&row.entry_tx_id)
        .bind(row.entry_time)
        .bind(row.size_usd)
        .bind(row.size_tokens)
        .bind(row.token_decimals)
        .bind(row.entry_price)
        .bind(&row.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_positions_by_status(&self, status: &str) -> Result<Vec<PositionRow>> {
        let rows: Vec<PositionRow> =
            sqlx::query_as("SELECT * FROM positions WHERE status = ?")
                .bind(status)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> StateStore {
        StateStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn processed_marker_is_idempotent() {
        let s = store().await;
        assert!(!s.has_processed("sig-1").await.unwrap());

        s.mark_processed("sig-1").await.unwrap();
        assert!(s.has_processed("sig-1").await.unwrap());

        // Re-marking the same id is a no-op, not an error.
        s.mark_processed("sig-1").await.unwrap();
        assert!(s.has_processed("sig-1").await.unwrap());
        assert!(!s.has_processed("sig-2").await.unwrap());
    }

    #[tokio::test]
    async fn transitions_track_the_latest_state() {
        let s = store().await;
        assert_eq!(s.last_state("sig-1").await.unwrap(), None);

        for state in ["pending", "quoted", "signed"] {
            s.record_transition("sig-1", "MintA", state).await.unwrap();
        }
        assert_eq!(s.last_state("sig-1").await.unwrap().as_deref(), Some("signed"));

        // A replayed transition for the same state updates in place; one row
        // per (signal, state).
        s.record_transition("sig-1", "MintA", "signed").await.unwrap();
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_transitions WHERE signal_id = 'sig-1'")
                .fetch_one(&s.pool)
                .await
                .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn exit_fractions_accumulate() {
        let s = store().await;
        assert!((s.sum_exit_fractions("sig-1").await.unwrap()).abs() < f64::EPSILON);

        s.record_exit("sig-1", "MintA", 0.33).await.unwrap();
        s.record_exit("sig-1", "MintA", 0.10).await.unwrap();
        s.record_exit("sig-2", "MintB", 1.0).await.unwrap();

        let sum = s.sum_exit_fractions("sig-1").await.unwrap();
        assert!((sum - 0.43).abs() < 1e-9);
    }

    #[tokio::test]
    async fn position_upsert_merges_with_coalesce() {
        let s = store().await;

        s.upsert_position(&PositionRow {
            signal_id: "sig-1".into(),
            mint: "MintA".into(),
            entry_tx_id: Some("tx-1".into()),
            entry_time: Some(1000.0),
            size_usd: Some(10.0),
            size_tokens: Some(5_000_000),
            token_decimals: Some(9),
            entry_price: Some(0.0001),
            status: Some("active".into()),
        })
        .await
        .unwrap();

        // Status-only update must not wipe the entry data.
        s.upsert_position(&PositionRow {
            signal_id: "sig-1".into(),
            mint: "MintA".into(),
            status: Some("completed".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let active = s.load_positions_by_status("active").await.unwrap();
        assert!(active.is_empty());

        let done = s.load_positions_by_status("completed").await.unwrap();
        assert_eq!(done.len(), 1);
        let row = &done[0];
        assert_eq!(row.entry_tx_id.as_deref(), Some("tx-1"));
        assert_eq!(row.size_tokens, Some(5_000_000));
        assert!((row.entry_price.unwrap() - 0.0001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn recovery_loads_only_active_positions() {
        let s = store().await;
        for (sig, mint, status) in [
            ("sig-1", "MintA", "active"),
            ("sig-2", "MintB", "completed"),
            ("sig-3", "MintC", "active"),
            ("sig-4", "MintD", "failed"),
        ] {
            s.upsert_position(&PositionRow {
                signal_id: sig.into(),
                mint: mint.into(),
                status: Some(status.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let active = s.load_positions_by_status("active").await.unwrap();
        let mut mints: Vec<_> = active.iter().map(|r| r.mint.clone()).collect();
        mints.sort();
        assert_eq!(mints, vec!["MintA", "MintC"]);
    }
}
