// =============================================================================
// Executor Settings — environment-sourced configuration
// =============================================================================
//
// Every tunable lives here. Values come from the process environment (a .env
// file is loaded first when present); each field falls back to a documented
// default so that a bare environment still yields a runnable demo
// configuration. Ladders (profit tiers, trailing zones) are CSV-encoded as
// "multiple:fraction,multiple:fraction,...".
// =============================================================================

use anyhow::{Context, Result};
use tracing::warn;

/// Wrapped SOL mint, the native side of every entry and exit swap.
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// What to do when the pre-trade concentration guard cannot answer within
/// its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PretradeFailMode {
    /// Guard timeout is tolerated; the order proceeds.
    Soft,
    /// Guard timeout rejects the order.
    Hard,
}

impl PretradeFailMode {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hard" => Self::Hard,
            _ => Self::Soft,
        }
    }
}

/// Full executor configuration. Built once at startup; shared as `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    // --- Wallet & RPC --------------------------------------------------------
    pub private_key: String,
    pub rpc_url: String,
    pub backup_rpc_url: Option<String>,
    pub bundle_url: Option<String>,

    // --- Router --------------------------------------------------------------
    pub router_api_url: String,
    pub price_api_url: String,

    // --- Signal queue (Redis Streams) ---------------------------------------
    pub redis_url: Option<String>,
    pub redis_stream_key: String,
    pub redis_consumer_group: String,
    pub redis_consumer_name: String,

    // --- Persistence ---------------------------------------------------------
    pub db_path: String,

    // --- Operational API -----------------------------------------------------
    pub bind_addr: String,

    // --- Order sizing & entry risk ------------------------------------------
    pub base_position_size_usd: f64,
    pub max_slippage_bps: u32,
    pub max_impact_bps: u32,
    pub priority_fee_lamports: u64,
    pub stop_loss_base_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub consecutive_loss_limit: u32,

    // --- "Capture the runner" exit strategy ---------------------------------
    pub disaster_stop_pct: f64,
    pub time_stop_minutes: f64,
    pub time_stop_profit_target_pct: f64,
    pub derisking_multiple: f64,
    pub derisking_sell_pct: f64,
    pub runner_trailing_stop_pct: f64,
    /// (multiple, fraction-of-remaining) pairs, sorted ascending by multiple.
    pub profit_tiers: Vec<(f64, f64)>,
    /// (multiple-threshold, trail-pct) pairs, sorted ascending by threshold.
    pub trailing_zones: Vec<(f64, f64)>,
    pub min_runner_pct: f64,
    pub partial_sell_cooldown_sec: f64,

    // --- Monitoring cadence --------------------------------------------------
    pub price_check_interval_ms: u64,
    pub max_concurrent_positions: u32,
    pub near_stop_delta_pct: f64,
    pub near_stop_check_ms: u64,

    // --- Pre-trade on-chain guard -------------------------------------------
    pub pretrade_top1_max_pct: Option<f64>,
    pub pretrade_top10_max_pct: Option<f64>,
    pub pretrade_guard_budget_ms: u64,
    pub pretrade_fail_mode: PretradeFailMode,

    // --- Hot path ------------------------------------------------------------
    /// Budget from signal receipt to submit; orders past it are aborted.
    pub hot_path_budget_ms: f64,
    pub confirm_timeout_secs: u64,
    pub lock_ttl_ms: u64,
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, default, "unparsable float env var — using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, default, "unparsable integer env var — using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_opt_f64(key: &str) -> Option<f64> {
    env_opt(key).and_then(|v| v.trim().parse().ok())
}

/// Parse a "multiple:fraction,multiple:fraction" CSV ladder, sorted ascending
/// by multiple. Malformed items are skipped with a warning rather than
/// failing startup.
pub fn parse_ladder(csv: &str) -> Vec<(f64, f64)> {
    let mut out: Vec<(f64, f64)> = Vec::new();
    for item in csv.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let Some((mul, pct)) = item.split_once(':') else {
            warn!(item, "ladder entry missing ':' — skipping");
            continue;
        };
        match (mul.trim().parse::<f64>(), pct.trim().parse::<f64>()) {
            (Ok(m), Ok(p)) => out.push((m, p)),
            _ => warn!(item, "unparsable ladder entry — skipping"),
        }
    }
    out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    out
}

const DEFAULT_PROFIT_TIERS: &str =
    "5:0.10,8:0.10,13:0.10,21:0.10,34:0.10,55:0.10,89:0.10,144:0.10,233:0.10,377:0.10,610:0.10,987:0.10,1597:0.10";

const DEFAULT_TRAILING_ZONES: &str =
    "0:0.30,5:0.25,10:0.22,20:0.20,50:0.15,100:0.12,500:0.10,3000:0.08";

impl Settings {
    /// Build settings from the process environment.
    ///
    /// Only `EXECUTOR_PRIVATE_KEY` and `EXECUTOR_RPC_URL` are required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        let private_key =
            std::env::var("EXECUTOR_PRIVATE_KEY").context("EXECUTOR_PRIVATE_KEY is required")?;
        let rpc_url =
            std::env::var("EXECUTOR_RPC_URL").context("EXECUTOR_RPC_URL is required")?;

        Ok(Self {
            private_key,
            rpc_url,
            backup_rpc_url: env_opt("EXECUTOR_BACKUP_RPC_URL"),
            bundle_url: env_opt("JITO_BUNDLE_URL"),

            router_api_url: env_str("JUPITER_API_URL", "https://quote-api.jup.ag/v6"),
            price_api_url: env_str("JUPITER_PRICE_API_URL", "https://api.jup.ag/price/v2"),

            redis_url: env_opt("REDIS_URL"),
            redis_stream_key: env_str("REDIS_STREAM_KEY", "exec_signals"),
            redis_consumer_group: env_str("REDIS_CONSUMER_GROUP", "executor"),
            redis_consumer_name: std::env::var("REDIS_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),

            db_path: env_str("EXECUTOR_DB_PATH", "data/executor_state.db"),
            bind_addr: env_str("EXECUTOR_BIND_ADDR", "0.0.0.0:9109"),

            base_position_size_usd: env_f64("BASE_POSITION_SIZE_USD", 10.0),
            max_slippage_bps: env_u64("MAX_SLIPPAGE_BPS", 150) as u32,
            max_impact_bps: env_u64("MAX_IMPACT_BPS", 250) as u32,
            priority_fee_lamports: env_u64("PRIORITY_FEE_LAMPORTS", 1000),
            stop_loss_base_pct: env_f64("STOP_LOSS_BASE_PCT", 0.50),
            daily_loss_limit_pct: env_f64("DAILY_LOSS_LIMIT_PCT", 0.04),
            consecutive_loss_limit: env_u64("CONSECUTIVE_LOSS_LIMIT", 4) as u32,

            disaster_stop_pct: env_f64("DISASTER_STOP_PCT", 0.80),
            time_stop_minutes: env_f64("TIME_STOP_MINUTES", 60.0),
            time_stop_profit_target_pct: env_f64("TIME_STOP_PROFIT_TARGET_PCT", 0.50),
            derisking_multiple: env_f64("DERISKING_MULTIPLE", 3.0),
            derisking_sell_pct: env_f64("DERISKING_SELL_PCT", 0.33),
            runner_trailing_stop_pct: env_f64("RUNNER_TRAILING_STOP_PCT", 0.30),
            profit_tiers: parse_ladder(&env_str("PROFIT_TIERS_CSV", DEFAULT_PROFIT_TIERS)),
            trailing_zones: parse_ladder(&env_str("TRAILING_ZONES_CSV", DEFAULT_TRAILING_ZONES)),
            min_runner_pct: env_f64("MIN_RUNNER_PCT", 0.07),
            partial_sell_cooldown_sec: env_f64("PARTIAL_SELL_COOLDOWN_SEC", 180.0),

            price_check_interval_ms: env_u64("PRICE_CHECK_INTERVAL_MS", 5000),
            max_concurrent_positions: env_u64("MAX_CONCURRENT_POSITIONS", 8) as u32,
            near_stop_delta_pct: env_f64("NEAR_STOP_DELTA_PCT", 0.03),
            near_stop_check_ms: env_u64("NEAR_STOP_CHECK_MS", 150),

            pretrade_top1_max_pct: env_opt_f64("PRETRADE_TOP1_MAX_PCT"),
            pretrade_top10_max_pct: env_opt_f64("PRETRADE_TOP10_MAX_PCT"),
            pretrade_guard_budget_ms: env_u64("PRETRADE_GUARD_BUDGET_MS", 150),
            pretrade_fail_mode: PretradeFailMode::parse(&env_str("PRETRADE_FAIL_MODE", "soft")),

            hot_path_budget_ms: env_f64("HOT_PATH_BUDGET_MS", 100.0),
            confirm_timeout_secs: env_u64("CONFIRM_TIMEOUT_SECS", 30),
            lock_ttl_ms: env_u64("LOCK_TTL_MS", 120_000),
        })
    }

    /// Defaults without touching the environment. Used by tests and by the
    /// demo configuration path.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            private_key: String::new(),
            rpc_url: "http://localhost:8899".into(),
            backup_rpc_url: None,
            bundle_url: None,
            router_api_url: "http://localhost:8080".into(),
            price_api_url: "http://localhost:8080/price/v2".into(),
            redis_url: None,
            redis_stream_key: "exec_signals".into(),
            redis_consumer_group: "executor".into(),
            redis_consumer_name: "worker-test".into(),
            db_path: ":memory:".into(),
            bind_addr: "127.0.0.1:0".into(),
            base_position_size_usd: 10.0,
            max_slippage_bps: 150,
            max_impact_bps: 250,
            priority_fee_lamports: 1000,
            stop_loss_base_pct: 0.50,
            daily_loss_limit_pct: 0.04,
            consecutive_loss_limit: 4,
            disaster_stop_pct: 0.80,
            time_stop_minutes: 60.0,
            time_stop_profit_target_pct: 0.50,
            derisking_multiple: 3.0,
            derisking_sell_pct: 0.33,
            runner_trailing_stop_pct: 0.30,
            profit_tiers: parse_ladder(DEFAULT_PROFIT_TIERS),
            trailing_zones: parse_ladder(DEFAULT_TRAILING_ZONES),
            min_runner_pct: 0.07,
            partial_sell_cooldown_sec: 180.0,
            price_check_interval_ms: 5000,
            max_concurrent_positions: 8,
            near_stop_delta_pct: 0.03,
            near_stop_check_ms: 150,
            pretrade_top1_max_pct: None,
            pretrade_top10_max_pct: None,
            pretrade_guard_budget_ms: 150,
            pretrade_fail_mode: PretradeFailMode::Soft,
            hot_path_budget_ms: 100.0,
            confirm_timeout_secs: 30,
            lock_ttl_ms: 120_000,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_parses_and_sorts() {
        let tiers = parse_ladder("8:0.10,5:0.10,13:0.20");
        assert_eq!(tiers, vec![(5.0, 0.10), (8.0, 0.10), (13.0, 0.20)]);
    }

    #[test]
    fn ladder_skips_malformed_entries() {
        let tiers = parse_ladder("5:0.10,garbage,8:,:0.3,13:0.10");
        assert_eq!(tiers, vec![(5.0, 0.10), (13.0, 0.10)]);
    }

    #[test]
    fn ladder_empty_input_yields_empty() {
        assert!(parse_ladder("").is_empty());
        assert!(parse_ladder(" , ,").is_empty());
    }

    #[test]
    fn default_profit_tiers_cover_fibonacci_ladder() {
        let tiers = parse_ladder(DEFAULT_PROFIT_TIERS);
        assert_eq!(tiers.len(), 13);
        assert_eq!(tiers.first(), Some(&(5.0, 0.10)));
        assert_eq!(tiers.last(), Some(&(1597.0, 0.10)));
        // Monotonic multiples.
        assert!(tiers.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn default_trailing_zones_tighten_with_height() {
        let zones = parse_ladder(DEFAULT_TRAILING_ZONES);
        assert_eq!(zones.first(), Some(&(0.0, 0.30)));
        assert_eq!(zones.last(), Some(&(3000.0, 0.08)));
        // Trail pct shrinks as the multiple grows.
        assert!(zones.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn fail_mode_parsing() {
        assert_eq!(PretradeFailMode::parse("hard"), PretradeFailMode::Hard);
        assert_eq!(PretradeFailMode::parse("HARD"), PretradeFailMode::Hard);
        assert_eq!(PretradeFailMode::parse("soft"), PretradeFailMode::Soft);
        assert_eq!(PretradeFailMode::parse("anything"), PretradeFailMode::Soft);
    }

    #[test]
    fn test_settings_match_documented_defaults() {
        let s = Settings::for_tests();
        assert!((s.base_position_size_usd - 10.0).abs() < f64::EPSILON);
        assert_eq!(s.max_slippage_bps, 150);
        assert_eq!(s.max_impact_bps, 250);
        assert!((s.stop_loss_base_pct - 0.50).abs() < f64::EPSILON);
        assert!((s.disaster_stop_pct - 0.80).abs() < f64::EPSILON);
        assert_eq!(s.consecutive_loss_limit, 4);
        assert_eq!(s.max_concurrent_positions, 8);
        assert!((s.min_runner_pct - 0.07).abs() < f64::EPSILON);
    }
}
