// =============================================================================
// Pre-trade concentration guard — holder concentration via token RPC
// =============================================================================
//
// Best-effort micro-guard on the entry path: fetch total supply and the
// largest accounts, estimate top-1 / top-10 holder share, and reject entries
// into obviously whale-owned tokens. The engine wraps `analyze` in a hard
// time budget; behaviour on timeout follows `pretrade_fail_mode`.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::rpc::RpcGateway;

/// Holder concentration relative to total supply, in percent (0–100).
#[derive(Debug, Clone, Copy)]
pub struct Concentration {
    pub top1_pct: f64,
    pub top10_pct: f64,
    pub holders_sampled: usize,
}

pub struct ConcentrationGuard {
    rpc: Arc<RpcGateway>,
}

impl ConcentrationGuard {
    pub fn new(rpc: Arc<RpcGateway>) -> Self {
        Self { rpc }
    }

    /// Combined analysis for a mint. `None` when the chain data is missing
    /// or unusable; the caller decides how strict to be about that.
    pub async fn analyze(&self, mint: &str) -> Result<Option<Concentration>> {
        let (supply, decimals) = match self.fetch_token_supply(mint).await? {
            Some(v) => v,
            None => return Ok(None),
        };
        if supply <= 0.0 {
            return Ok(None);
        }

        let amounts = self.fetch_largest_amounts(mint, decimals).await?;
        if amounts.is_empty() {
            return Ok(None);
        }

        Ok(Some(concentration_from(&amounts, supply)))
    }

    async fn fetch_token_supply(&self, mint: &str) -> Result<Option<(f64, u8)>> {
        let result = self
            .rpc
            .call("getTokenSupply", json!([mint]))
            .await
            .context("getTokenSupply failed")?;
        let value = result.get("value").cloned().unwrap_or(Value::Null);

        let decimals = value.get("decimals").and_then(Value::as_u64).unwrap_or(0) as u8;
        let supply = value
            .get("amount")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u128>().ok())
            .map(|raw| raw as f64 / 10f64.powi(decimals as i32));

        Ok(supply.map(|s| (s, decimals)))
    }

    async fn fetch_largest_amounts(&self, mint: &str, decimals: u8) -> Result<Vec<f64>> {
        let result = self
            .rpc
            .call(
                "getTokenLargestAccounts",
                json!([mint, { "commitment": "confirmed" }]),
            )
            .await
            .context("getTokenLargestAccounts failed")?;

        let amounts: Vec<f64> = result
            .get("value")
            .and_then(Value::as_array)
            .map(|accounts| {
                accounts
                    .iter()
                    .filter_map(|a| a.get("amount").and_then(Value::as_str))
                    .filter_map(|s| s.parse::<u128>().ok())
                    .map(|raw| raw as f64 / 10f64.powi(decimals as i32))
                    .collect()
            })
            .unwrap_or_default();

        debug!(mint, count = amounts.len(), "largest accounts fetched");
        Ok(amounts)
    }
}

/// Pure concentration math over UI-unit holder amounts.
fn concentration_from(amounts: &[f64], supply: f64) -> Concentration {
    let top1 = amounts.iter().cloned().fold(0.0f64, f64::max);
    let mut sorted: Vec<f64> = amounts.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top10: f64 = sorted.iter().take(10).sum();

    Concentration {
        top1_pct: (top1 / supply * 100.0).clamp(0.0, 100.0),
        top10_pct: (top10 / supply * 100.0).clamp(0.0, 100.0),
        holders_sampled: amounts.len(),
    }
}

impl std::fmt::Debug for ConcentrationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcentrationGuard").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concentration_percentages() {
        let c = concentration_from(&[50.0, 30.0, 10.0, 5.0], 1000.0);
        assert!((c.top1_pct - 5.0).abs() < 1e-9);
        assert!((c.top10_pct - 9.5).abs() < 1e-9);
        assert_eq!(c.holders_sampled, 4);
    }

    #[test]
    fn top10_takes_the_ten_largest_of_many() {
        let amounts: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        let c = concentration_from(&amounts, 1000.0);
        // 11 + 12 + ... + 20 = 155.
        assert!((c.top10_pct - 15.5).abs() < 1e-9);
        assert!((c.top1_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn percentages_are_clamped() {
        // Sampled holders exceeding the reported supply clamp at 100.
        let c = concentration_from(&[2000.0], 1000.0);
        assert!((c.top1_pct - 100.0).abs() < 1e-9);
        assert!((c.top10_pct - 100.0).abs() < 1e-9);
    }
}
