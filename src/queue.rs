// =============================================================================
// Signal Queue — Redis Streams with consumer-group semantics
// =============================================================================
//
// The upstream aggregator XADDs one entry per discovery signal; the executor
// reads through a consumer group so that delivery survives restarts and can
// be shared across workers. Delivery is at-least-once: the engine acks only
// after the durable processed/terminal write, and deduplicates through the
// idempotency store.
//
// Trimming is approximate by length and runs from the maintenance loop.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use crate::types::Signal;

/// Approximate number of entries kept in the stream.
const STREAM_KEEP_LEN: usize = 5000;

pub struct SignalQueue {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

impl SignalQueue {
    /// Connect and make sure the stream + consumer group exist. A
    /// "BUSYGROUP" answer (group already exists) is swallowed.
    pub async fn connect(
        redis_url: &str,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        let queue = Self {
            conn,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        };
        queue.ensure_group().await;
        info!(stream = stream_key, group, consumer, "signal queue ready");
        Ok(queue)
    }

    async fn ensure_group(&self) {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "$")
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                warn!(error = %e, "xgroup create failed (safe to ignore if group exists)");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Consume
    // -------------------------------------------------------------------------

    /// Read up to `count` new entries for this consumer, blocking up to
    /// `block_ms` when the stream is idle. Unparsable entries are acked and
    /// dropped so they cannot wedge the group.
    pub async fn read_new(&self, count: usize, block_ms: u64) -> Result<Vec<(String, Signal)>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .context("xreadgroup failed")?;

        let mut out = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let mut fields: HashMap<String, String> = HashMap::new();
                for key in entry.map.keys() {
                    if let Some(v) = entry.get::<String>(key) {
                        fields.insert(key.clone(), v);
                    }
                }
                match signal_from_fields(&fields) {
                    Some(signal) => out.push((entry.id.clone(), signal)),
                    None => {
                        error!(msg_id = %entry.id, "unparsable signal entry — acking and dropping");
                        self.ack(&entry.id).await;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Acknowledge a processed entry. Best-effort: a lost ack only causes a
    /// redelivery that the idempotency store will skip.
    pub async fn ack(&self, msg_id: &str) {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<i64> = conn.xack(&self.stream_key, &self.group, &[msg_id]).await;
        if let Err(e) = res {
            debug!(msg_id, error = %e, "xack failed");
        }
    }

    /// Approximate length-based trim; called from the maintenance loop.
    pub async fn trim(&self) {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<i64> = conn
            .xtrim(&self.stream_key, StreamMaxlen::Approx(STREAM_KEEP_LEN))
            .await;
        match res {
            Ok(removed) => debug!(removed, "stream trimmed"),
            Err(e) => debug!(error = %e, "xtrim failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Produce (integration tooling and tests)
    // -------------------------------------------------------------------------

    /// Producer helper: append a signal to the stream. The engine itself never
    /// produces; this mirrors what the upstream bridge writes.
    pub async fn publish(&self, signal: &Signal) -> Result<String> {
        let mut conn = self.conn.clone();
        let fields: Vec<(&str, String)> = vec![
            ("ca", signal.mint.clone()),
            ("timestamp", signal.timestamp.to_string()),
            ("kind", signal.kind.clone()),
            ("ug_fast", signal.ug_fast.to_string()),
            ("ug_slow", signal.ug_slow.to_string()),
            ("velocity_mpm", signal.velocity_mpm.to_string()),
            (
                "first_seen_ts",
                signal.first_seen_ts.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("rugcheck_score", signal.rugcheck_score.clone()),
            ("rugcheck_risks", signal.rugcheck_risks.clone()),
            ("rugcheck_lp", signal.rugcheck_lp.clone()),
            ("quality_score", signal.quality_score.to_string()),
            ("signal_id", signal.signal_id.clone()),
        ];
        let id: String = conn
            .xadd(&self.stream_key, "*", &fields)
            .await
            .context("xadd failed")?;
        Ok(id)
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

/// Build a [`Signal`] from the string key/value fields of a stream entry.
///
/// Only `ca` is mandatory. A missing signal id is derived deterministically;
/// a missing or non-positive quality score is reconstructed from the signal
/// features.
pub fn signal_from_fields(fields: &HashMap<String, String>) -> Option<Signal> {
    let mint = fields.get("ca").filter(|v| !v.is_empty())?.clone();

    let get_f64 = |key: &str| -> f64 {
        fields
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0.0)
    };
    let get_u32 = |key: &str| -> u32 {
        fields
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    };
    let get_str = |key: &str, default: &str| -> String {
        fields
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    let timestamp = get_f64("timestamp");
    let first_seen_ts = fields
        .get("first_seen_ts")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0);

    let mut signal = Signal {
        signal_id: get_str("signal_id", ""),
        mint,
        timestamp,
        kind: get_str("kind", "fast"),
        ug_fast: get_u32("ug_fast"),
        ug_slow: get_u32("ug_slow"),
        velocity_mpm: get_f64("velocity_mpm"),
        first_seen_ts,
        rugcheck_score: get_str("rugcheck_score", "pending"),
        rugcheck_risks: get_str("rugcheck_risks", "pending"),
        rugcheck_lp: get_str("rugcheck_lp", ""),
        quality_score: get_f64("quality_score"),
    };

    if signal.signal_id.is_empty() {
        signal.signal_id =
            Signal::derive_signal_id(&signal.mint, signal.first_seen_ts, signal.timestamp);
    }
    if signal.quality_score <= 0.0 {
        signal.quality_score = signal.reconstruct_quality_score();
    }

    Some(signal)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn full_entry_parses_with_provided_score_and_id() {
        let f = fields(&[
            ("ca", "MintA"),
            ("timestamp", "1700000000.5"),
            ("kind", "fast"),
            ("ug_fast", "6"),
            ("ug_slow", "2"),
            ("velocity_mpm", "3.5"),
            ("first_seen_ts", "1699999000"),
            ("rugcheck_score", "7"),
            ("rugcheck_risks", "none"),
            ("rugcheck_lp", "95% locked"),
            ("quality_score", "0.83"),
            ("signal_id", "sig-1"),
        ]);
        let s = signal_from_fields(&f).unwrap();
        assert_eq!(s.signal_id, "sig-1");
        assert_eq!(s.mint, "MintA");
        assert_eq!(s.ug_fast, 6);
        assert_eq!(s.first_seen_ts, Some(1_699_999_000));
        // Provided score accepted unchanged.
        assert!((s.quality_score - 0.83).abs() < 1e-9);
    }

    #[test]
    fn missing_id_is_derived_and_missing_score_reconstructed() {
        let f = fields(&[
            ("ca", "MintB"),
            ("timestamp", "1700000000"),
            ("ug_fast", "4"),
            ("first_seen_ts", "1700000000"),
        ]);
        let s = signal_from_fields(&f).unwrap();
        assert_eq!(s.signal_id, "MintB:1700000000");
        assert!(s.quality_score >= 0.3 && s.quality_score <= 1.0);
    }

    #[test]
    fn entry_without_mint_is_dropped() {
        let f = fields(&[("timestamp", "1700000000")]);
        assert!(signal_from_fields(&f).is_none());
    }

    #[test]
    fn empty_first_seen_becomes_none() {
        let f = fields(&[("ca", "MintC"), ("timestamp", "100"), ("first_seen_ts", "")]);
        let s = signal_from_fields(&f).unwrap();
        assert_eq!(s.first_seen_ts, None);
        // Derivation falls back to the timestamp.
        assert_eq!(s.signal_id, "MintC:100");
    }
}
