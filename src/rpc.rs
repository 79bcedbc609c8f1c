// =============================================================================
// RPC Gateway — JSON-RPC over HTTP with primary/backup failover
// =============================================================================
//
// Pooled client against the primary endpoint; any transport or RPC-level
// error triggers exactly one retry against the backup (when configured).
// Transaction submission adds its own bounded retry ladder on top, switching
// to the backup after the first failed attempt.
//
// An optional bundle endpoint receives a fire-and-forget copy of every signed
// transaction; its outcome only moves the bundle metrics, never control flow.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::Metrics;

/// Maximum submit attempts before the order is surfaced as failed.
const SUBMIT_MAX_RETRIES: u32 = 3;
/// Interval between confirmation polls.
const CONFIRM_POLL_SECS: u64 = 2;

/// Outcome of a confirmation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    Confirmed,
    Failed,
    Timeout,
}

pub struct RpcGateway {
    rpc_url: String,
    backup_rpc_url: Option<String>,
    bundle_url: Option<String>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl RpcGateway {
    pub fn new(
        rpc_url: String,
        backup_rpc_url: Option<String>,
        bundle_url: Option<String>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(3))
            .read_timeout(Duration::from_secs(25))
            .pool_max_idle_per_host(25)
            .build()
            .context("failed to build RPC http client")?;

        Ok(Self {
            rpc_url,
            backup_rpc_url,
            bundle_url,
            client,
            metrics,
        })
    }

    // -------------------------------------------------------------------------
    // Core JSON-RPC call with failover
    // -------------------------------------------------------------------------

    /// Issue a JSON-RPC call and return the `result` field. On any error from
    /// the primary, retries once against the backup endpoint.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.call_endpoint(&self.rpc_url, method, &params).await {
            Ok(v) => Ok(v),
            Err(primary_err) => {
                let Some(backup) = &self.backup_rpc_url else {
                    return Err(primary_err);
                };
                warn!(method, error = %primary_err, "primary RPC failed — trying backup");
                self.call_endpoint(backup, method, &params)
                    .await
                    .with_context(|| format!("backup RPC also failed for {method}"))
            }
        }
    }

    async fn call_endpoint(&self, url: &str, method: &str, params: &Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("RPC request failed ({method})"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse RPC response ({method})"))?;

        if !status.is_success() {
            anyhow::bail!("RPC {method} returned HTTP {status}: {body}");
        }
        if let Some(err) = body.get("error") {
            anyhow::bail!("RPC {method} returned error: {err}");
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    /// SOL balance of `pubkey` (in SOL, not lamports).
    #[instrument(skip(self), name = "rpc::get_balance")]
    pub async fn get_balance(&self, pubkey: &str) -> Result<f64> {
        let result = self.call("getBalance", json!([pubkey])).await?;
        let lamports = result
            .get("value")
            .and_then(Value::as_u64)
            .context("getBalance response missing 'value'")?;
        Ok(lamports as f64 / 1e9)
    }

    // -------------------------------------------------------------------------
    // Transaction submission
    // -------------------------------------------------------------------------

    /// Submit a signed base64 transaction and return its signature.
    ///
    /// Retries up to [`SUBMIT_MAX_RETRIES`] times with a small growing
    /// backoff; attempts after the first prefer the backup endpoint. The
    /// bundle copy (if configured) is fired before the first attempt.
    #[instrument(skip(self, signed_b64), name = "rpc::submit_signed_tx")]
    pub async fn submit_signed_tx(&self, signed_b64: &str) -> Result<String> {
        self.spawn_bundle_submit(signed_b64.to_string());

        let params = json!([
            signed_b64,
            {
                "skipPreflight": true,
                "preflightCommitment": "processed",
                "encoding": "base64",
                "maxRetries": 0,
            }
        ]);

        let mut last_err = None;
        for attempt in 0..SUBMIT_MAX_RETRIES {
            let result = if attempt == 0 || self.backup_rpc_url.is_none() {
                self.call_endpoint(&self.rpc_url, "sendTransaction", &params)
                    .await
            } else {
                self.call_endpoint(
                    self.backup_rpc_url.as_ref().unwrap(),
                    "sendTransaction",
                    &params,
                )
                .await
            };

            match result {
                Ok(Value::String(signature)) => {
                    info!(%signature, attempt, "transaction sent");
                    return Ok(signature);
                }
                Ok(other) => {
                    last_err = Some(anyhow::anyhow!(
                        "sendTransaction returned non-string result: {other}"
                    ));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "sendTransaction attempt failed");
                    last_err = Some(e);
                }
            }

            if attempt + 1 < SUBMIT_MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("all transaction send attempts failed")))
    }

    // -------------------------------------------------------------------------
    // Confirmation polling
    // -------------------------------------------------------------------------

    /// Poll `getSignatureStatuses` until the transaction confirms, fails, or
    /// the deadline passes. Success requires confirmed/finalized status with
    /// a null `err`.
    #[instrument(skip(self), name = "rpc::confirm")]
    pub async fn confirm(&self, signature: &str, timeout_secs: u64) -> ConfirmStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            match self.call("getSignatureStatuses", json!([[signature]])).await {
                Ok(result) => {
                    let status_info = result
                        .get("value")
                        .and_then(Value::as_array)
                        .and_then(|arr| arr.first())
                        .cloned()
                        .unwrap_or(Value::Null);

                    if !status_info.is_null() {
                        let confirmation = status_info
                            .get("confirmationStatus")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if confirmation == "confirmed" || confirmation == "finalized" {
                            if status_info.get("err").map_or(true, Value::is_null) {
                                info!(%signature, "transaction confirmed");
                                return ConfirmStatus::Confirmed;
                            }
                            error!(%signature, err = %status_info["err"], "transaction failed on chain");
                            return ConfirmStatus::Failed;
                        }
                    }
                }
                Err(e) => {
                    debug!(%signature, error = %e, "confirmation poll error");
                }
            }

            if tokio::time::Instant::now() + Duration::from_secs(CONFIRM_POLL_SECS) > deadline {
                warn!(%signature, timeout_secs, "confirmation timed out");
                return ConfirmStatus::Timeout;
            }
            tokio::time::sleep(Duration::from_secs(CONFIRM_POLL_SECS)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Bundle endpoint (fire-and-forget)
    // -------------------------------------------------------------------------

    /// Post the signed transaction to the bundle endpoint in the background.
    /// The result only moves metrics.
    fn spawn_bundle_submit(&self, signed_b64: String) {
        let Some(url) = self.bundle_url.clone() else {
            return;
        };
        let client = self.client.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let payload = json!({ "transactions": [signed_b64] });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    metrics.bundle_success.inc();
                    debug!("bundle submitted");
                }
                Ok(resp) => {
                    metrics.bundle_fallback.inc();
                    debug!(status = %resp.status(), "bundle submission non-2xx");
                }
                Err(e) => {
                    metrics.bundle_fallback.inc();
                    debug!(error = %e, "bundle submission failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("rpc_url", &self.rpc_url)
            .field("backup_rpc_url", &self.backup_rpc_url)
            .field("bundle_url", &self.bundle_url)
            .finish()
    }
}
