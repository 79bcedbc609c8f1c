// =============================================================================
// Signing Oracle — holds the hot key, signs serialized transactions
// =============================================================================
//
// SECURITY: key material never leaves this module and is never logged or
// serialized. The Debug impl redacts everything but the public key.
//
// The trait boundary exists so a remote HSM/KMS signer can be swapped in with
// the same contract: unsigned base64 in, signed base64 out.
// =============================================================================

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;

/// Contract for anything that can sign a serialized versioned transaction.
#[async_trait::async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Base58 public key of the payer.
    fn pubkey(&self) -> String;

    /// Sign a base64-encoded unsigned transaction and return the signed
    /// transaction, base64-encoded.
    async fn sign_b64(&self, unsigned_b64: &str) -> Result<String>;
}

/// In-process signer over a single hot keypair.
pub struct LocalSigner {
    keypair: Keypair,
    pubkey: String,
}

impl LocalSigner {
    /// Build from a base58-encoded 64-byte secret key.
    pub fn from_base58(private_key_base58: &str) -> Result<Self> {
        let bytes = bs58::decode(private_key_base58.trim())
            .into_vec()
            .context("private key is not valid base58")?;
        let keypair = Keypair::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid keypair bytes: {e}"))?;
        let pubkey = keypair.pubkey().to_string();
        Ok(Self { keypair, pubkey })
    }
}

#[async_trait::async_trait]
impl TransactionSigner for LocalSigner {
    fn pubkey(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign_b64(&self, unsigned_b64: &str) -> Result<String> {
        let raw = BASE64
            .decode(unsigned_b64)
            .context("unsigned transaction is not valid base64")?;

        let tx: VersionedTransaction =
            bincode::deserialize(&raw).context("failed to deserialize versioned transaction")?;

        // Re-sign with the payer key only; router-built swaps require exactly
        // the user signature.
        let signed = VersionedTransaction::try_new(tx.message, &[&self.keypair])
            .map_err(|e| anyhow::anyhow!("signing failed: {e}"))?;

        let bytes =
            bincode::serialize(&signed).context("failed to serialize signed transaction")?;
        Ok(BASE64.encode(bytes))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("keypair", &"<redacted>")
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_base58_rejects_garbage() {
        assert!(LocalSigner::from_base58("not-base58-!!!").is_err());
        // Valid base58 but wrong length.
        assert!(LocalSigner::from_base58("3mJr7AoUXx2Wqd").is_err());
    }

    #[test]
    fn from_base58_accepts_generated_keypair() {
        let kp = Keypair::new();
        let encoded = bs58::encode(kp.to_bytes()).into_string();
        let signer = LocalSigner::from_base58(&encoded).unwrap();
        assert_eq!(signer.pubkey(), kp.pubkey().to_string());
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let kp = Keypair::new();
        let encoded = bs58::encode(kp.to_bytes()).into_string();
        let signer = LocalSigner::from_base58(&encoded).unwrap();
        let debug = format!("{signer:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&encoded));
    }
}
