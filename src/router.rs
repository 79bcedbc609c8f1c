// =============================================================================
// Router Client — quote, swap-build, and spot-price API
// =============================================================================
//
// Off-chain route-quoting service client (Jupiter v6 surface). Entry and exit
// orders both go through the two-stage quote (direct routes first, any route
// second), quote validation with sanity bounds, and the swap builder which
// returns an unsigned serialized transaction.
//
// Spot prices feed the position monitor through a 5-second TTL cache; the
// near-stop turbo check bypasses the cache.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

/// TTL for cached token prices.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Upper sanity bound on the out/in exchange rate of a quote.
const MAX_EXCHANGE_RATE: f64 = 1e12;

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

/// A single route quote. The raw JSON is retained because the swap builder
/// posts it back verbatim as `quoteResponse`.
#[derive(Debug, Clone)]
pub struct Quote {
    pub raw: Value,
    pub in_amount: f64,
    pub out_amount: f64,
    pub price_impact_pct: f64,
    /// Output token decimals when the router includes token metadata.
    pub out_decimals: Option<u8>,
}

/// Parse a JSON number that may arrive as a string (the router encodes
/// atomic amounts as strings).
fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

impl Quote {
    /// Build from one entry of the router's `data` array. Returns `None`
    /// when the route is structurally unusable.
    pub fn from_route(route: Value) -> Option<Self> {
        let in_amount = value_to_f64(route.get("inAmount")?)?;
        let out_amount = value_to_f64(route.get("outAmount")?)?;
        let price_impact_pct = route
            .get("priceImpactPct")
            .and_then(value_to_f64)
            .unwrap_or(0.0);
        let out_decimals = route
            .get("outToken")
            .and_then(|t| t.get("decimals"))
            .and_then(Value::as_u64)
            .map(|d| d as u8);

        Some(Self {
            raw: route,
            in_amount,
            out_amount,
            price_impact_pct,
            out_decimals,
        })
    }

    /// Validate the quote for thin-liquidity token trading.
    pub fn validate(&self, max_impact_pct: f64) -> std::result::Result<(), String> {
        if self.out_amount <= 0.0 {
            return Err("no output tokens".into());
        }
        if self.price_impact_pct > max_impact_pct {
            return Err(format!(
                "price impact too high: {:.2}%",
                self.price_impact_pct
            ));
        }
        if self.in_amount <= 0.0 {
            return Err("invalid input amount".into());
        }
        let rate = self.out_amount / self.in_amount;
        if rate <= 0.0 || rate > MAX_EXCHANGE_RATE {
            return Err(format!("unreasonable exchange rate: {rate}"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RouterClient {
    api_url: String,
    price_api_url: String,
    client: reqwest::Client,
    price_cache: Mutex<HashMap<String, (f64, Instant)>>,
}

impl RouterClient {
    pub fn new(api_url: String, price_api_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(2))
            .read_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(50)
            .build()
            .context("failed to build router http client")?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            price_api_url,
            client,
            price_cache: Mutex::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Fetch a quote. `Ok(None)` means the router answered but has no route.
    #[instrument(skip(self), name = "router::quote")]
    pub async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u32,
        only_direct: bool,
    ) -> Result<Option<Quote>> {
        let url = format!("{}/quote", self.api_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("inputMint", input_mint),
                ("outputMint", output_mint),
                ("amount", &amount.to_string()),
                ("slippageBps", &slippage_bps.to_string()),
                ("onlyDirectRoutes", if only_direct { "true" } else { "false" }),
                ("asLegacyTransaction", "false"),
            ])
            .send()
            .await
            .context("quote request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse quote response")?;

        if !status.is_success() {
            anyhow::bail!("quote returned HTTP {status}: {body}");
        }

        let route = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|routes| routes.first().cloned());

        match route {
            Some(r) => Ok(Quote::from_route(r)),
            None => {
                debug!(output_mint, only_direct, "quote response has no routes");
                Ok(None)
            }
        }
    }

    /// Two-stage quote: direct routes first, then any route. A transport
    /// error on the direct leg still allows the fallback leg to answer.
    pub async fn quote_with_fallback(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u32,
    ) -> Result<Option<Quote>> {
        match self
            .quote(input_mint, output_mint, amount, slippage_bps, true)
            .await
        {
            Ok(Some(q)) => return Ok(Some(q)),
            Ok(None) => {}
            Err(e) => warn!(output_mint, error = %e, "direct quote failed — trying all routes"),
        }
        self.quote(input_mint, output_mint, amount, slippage_bps, false)
            .await
    }

    // -------------------------------------------------------------------------
    // Swap build
    // -------------------------------------------------------------------------

    /// Build the unsigned swap transaction for a validated quote. Returns the
    /// base64-encoded serialized transaction.
    ///
    /// `dynamicSlippage.maxBps` is pinned at 300 by the router contract,
    /// independent of the configured quote slippage.
    #[instrument(skip(self, quote), name = "router::build_swap")]
    pub async fn build_swap(
        &self,
        quote: &Quote,
        user_public_key: &str,
        priority_fee_lamports: u64,
    ) -> Result<String> {
        let url = format!("{}/swap", self.api_url);
        let payload = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user_public_key,
            "prioritizationFeeLamports": priority_fee_lamports,
            "asLegacyTransaction": false,
            "dynamicComputeUnitLimit": true,
            "dynamicSlippage": { "maxBps": 300 },
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("swap build request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse swap response")?;

        if !status.is_success() {
            anyhow::bail!("swap build returned HTTP {status}: {body}");
        }

        body.get("swapTransaction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("swap response missing 'swapTransaction'")
    }

    // -------------------------------------------------------------------------
    // Spot prices
    // -------------------------------------------------------------------------

    /// Current USD price of a mint, served from a 5-second cache.
    pub async fn spot_price(&self, mint: &str) -> Result<Option<f64>> {
        if let Some(price) = self.cached_price(mint) {
            return Ok(Some(price));
        }
        self.spot_price_uncached(mint).await
    }

    /// Fetch a fresh price, bypassing (but refreshing) the cache. Used by the
    /// near-stop turbo re-check.
    #[instrument(skip(self), name = "router::spot_price")]
    pub async fn spot_price_uncached(&self, mint: &str) -> Result<Option<f64>> {
        let resp = self
            .client
            .get(&self.price_api_url)
            .query(&[("mints", mint)])
            .send()
            .await
            .context("price request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse price response")?;

        if !status.is_success() {
            anyhow::bail!("price endpoint returned HTTP {status}: {body}");
        }

        let price = body
            .get("data")
            .and_then(|d| d.get(mint))
            .and_then(|p| p.get("price"))
            .and_then(value_to_f64);

        if let Some(p) = price {
            self.price_cache
                .lock()
                .insert(mint.to_string(), (p, Instant::now()));
        }
        Ok(price)
    }

    fn cached_price(&self, mint: &str) -> Option<f64> {
        let cache = self.price_cache.lock();
        cache.get(mint).and_then(|(price, at)| {
            (at.elapsed() < PRICE_CACHE_TTL).then_some(*price)
        })
    }

    /// Drop all cached prices (maintenance loop).
    pub fn clear_price_cache(&self) {
        self.price_cache.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Native-token price cache
// ---------------------------------------------------------------------------

/// Dedicated SOL/USD cache with a longer TTL than the per-mint cache; entry
/// sizing and PnL conversion both go through here.
pub struct NativePriceCache {
    router: std::sync::Arc<RouterClient>,
    mint: String,
    ttl: Duration,
    cached: Mutex<Option<(f64, Instant)>>,
}

impl NativePriceCache {
    pub fn new(router: std::sync::Arc<RouterClient>, mint: &str) -> Self {
        Self {
            router,
            mint: mint.to_string(),
            ttl: Duration::from_secs(10),
            cached: Mutex::new(None),
        }
    }

    /// Current native-token USD price, at most `ttl` stale.
    pub async fn usd_price(&self) -> Result<Option<f64>> {
        {
            let cached = self.cached.lock();
            if let Some((price, at)) = *cached {
                if at.elapsed() < self.ttl {
                    return Ok(Some(price));
                }
            }
        }
        let fresh = self.router.spot_price_uncached(&self.mint).await?;
        if let Some(price) = fresh {
            *self.cached.lock() = Some((price, Instant::now()));
        }
        Ok(fresh)
    }
}

impl std::fmt::Debug for NativePriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePriceCache")
            .field("mint", &self.mint)
            .finish()
    }
}

impl std::fmt::Debug for RouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterClient")
            .field("api_url", &self.api_url)
            .field("price_api_url", &self.price_api_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn quote(in_amount: &str, out_amount: &str, impact: f64) -> Quote {
        Quote::from_route(json!({
            "inAmount": in_amount,
            "outAmount": out_amount,
            "priceImpactPct": impact,
        }))
        .unwrap()
    }

    #[test]
    fn route_parsing_handles_string_amounts_and_decimals() {
        let q = Quote::from_route(json!({
            "inAmount": "1000000000",
            "outAmount": "123456789",
            "priceImpactPct": "0.42",
            "outToken": { "decimals": 6 },
        }))
        .unwrap();
        assert!((q.in_amount - 1e9).abs() < 1e-3);
        assert!((q.out_amount - 123_456_789.0).abs() < 1e-3);
        assert!((q.price_impact_pct - 0.42).abs() < 1e-9);
        assert_eq!(q.out_decimals, Some(6));
    }

    #[test]
    fn route_without_amounts_is_rejected() {
        assert!(Quote::from_route(json!({ "priceImpactPct": 0.1 })).is_none());
    }

    #[test]
    fn validation_accepts_a_sane_quote() {
        let q = quote("1000000000", "500000000", 0.5);
        assert!(q.validate(2.5).is_ok());
    }

    #[test]
    fn validation_rejects_zero_output() {
        let q = quote("1000000000", "0", 0.1);
        assert!(q.validate(2.5).unwrap_err().contains("no output"));
    }

    #[test]
    fn validation_rejects_excess_impact() {
        let q = quote("1000000000", "500000000", 3.0);
        assert!(q.validate(2.5).unwrap_err().contains("impact"));
    }

    #[test]
    fn validation_rejects_unreasonable_rate() {
        // out/in far beyond the 1e12 sanity bound.
        let q = quote("1", "10000000000000", 0.1);
        assert!(q.validate(2.5).unwrap_err().contains("exchange rate"));
    }

    #[test]
    fn validation_boundary_rate_is_accepted() {
        // Exactly at the bound.
        let q = quote("1", "1000000000000", 0.1);
        assert!(q.validate(2.5).is_ok());
    }
}
