// =============================================================================
// Distributed per-asset lock — SET NX PX with TTL
// =============================================================================
//
// Prevents two workers from racing the same (mint, signal) onto the chain.
// The null backend (no Redis configured) acquires unconditionally: a
// single-process deployment is still correct because the execution engine
// also checks the in-memory position book before ordering.
// =============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use tracing::debug;

pub struct AssetLock {
    conn: Option<ConnectionManager>,
}

impl AssetLock {
    pub async fn connect(redis_url: Option<&str>) -> Result<Self> {
        let conn = match redis_url {
            Some(url) => {
                let client = redis::Client::open(url).context("invalid redis url")?;
                Some(
                    ConnectionManager::new(client)
                        .await
                        .context("failed to connect to redis for locks")?,
                )
            }
            None => None,
        };
        Ok(Self { conn })
    }

    /// Try to take the lock. Returns `false` when another holder has it.
    pub async fn acquire(&self, key: &str, ttl_ms: u64) -> bool {
        let Some(conn) = &self.conn else {
            return true;
        };
        let mut conn = conn.clone();
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl_ms as usize));

        let res: redis::RedisResult<redis::Value> =
            conn.set_options(format!("lock:{key}"), 1, opts).await;

        match res {
            Ok(redis::Value::Okay) => true,
            Ok(_) => false,
            Err(e) => {
                debug!(key, error = %e, "lock acquire failed — treating as busy");
                false
            }
        }
    }

    /// Best-effort release; the TTL covers a lost delete.
    pub async fn release(&self, key: &str) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        let res: redis::RedisResult<i64> = conn.del(format!("lock:{key}")).await;
        if let Err(e) = res {
            debug!(key, error = %e, "lock release failed");
        }
    }

    /// Whether a remote backend is configured.
    pub fn is_distributed(&self) -> bool {
        self.conn.is_some()
    }
}

impl std::fmt::Debug for AssetLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLock")
            .field("distributed", &self.is_distributed())
            .finish()
    }
}
