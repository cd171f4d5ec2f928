//! Transaction signing and submission.
//!
//! A transfer intent is wrapped with a header (validity window, nonce, notary
//! key, tip), BCS-encoded, hashed with Blake2b-256, signed by the custodial
//! ed25519 key acting as notary, and handed to the ledger node as hex.

use blake2::{digest::consts::U32, Blake2b, Digest};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::clients::ledger::{LedgerClient, LedgerError};
use crate::manifest::TransferIntent;
use crate::vault::SecretKey;

type Blake2b256 = Blake2b<U32>;

/// Epochs a signed transaction stays valid for.
const EPOCH_WINDOW: u64 = 10;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing key is not a 32-byte hex ed25519 secret")]
    InvalidKey,
    #[error("quote expired at {0}")]
    QuoteExpired(DateTime<Utc>),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub network_id: u8,
    pub start_epoch_inclusive: u64,
    pub end_epoch_exclusive: u64,
    pub nonce: u32,
    pub notary_public_key: [u8; 32],
    pub notary_is_signatory: bool,
    pub tip_percentage: u16,
}

#[derive(Serialize)]
struct IntentPayload<'a> {
    header: &'a TransactionHeader,
    manifest: &'a str,
}

#[derive(Serialize)]
struct NotarizedPayload<'a> {
    header: &'a TransactionHeader,
    manifest: &'a str,
    notary_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    /// Hex Blake2b-256 of the intent.
    pub intent_hash: String,
    pub payload_hex: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// SIGNING
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransactionSigner {
    network_id: u8,
    tip_percentage: u16,
}

impl TransactionSigner {
    pub fn new(network_id: u8, tip_percentage: u16) -> Self {
        Self {
            network_id,
            tip_percentage,
        }
    }

    pub fn signing_key(key: &SecretKey) -> Result<SigningKey, SignerError> {
        let bytes: [u8; 32] = hex::decode(key.expose().trim())
            .map_err(|_| SignerError::InvalidKey)?
            .try_into()
            .map_err(|_| SignerError::InvalidKey)?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    pub fn sign(
        &self,
        intent: &TransferIntent,
        key: &SecretKey,
        current_epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<SignedTransaction, SignerError> {
        let expires_at = intent.expires_at();
        if let Some(at) = expires_at {
            if now >= at {
                return Err(SignerError::QuoteExpired(at));
            }
        }

        let signing_key = Self::signing_key(key)?;
        let header = TransactionHeader {
            network_id: self.network_id,
            start_epoch_inclusive: current_epoch,
            end_epoch_exclusive: current_epoch.saturating_add(EPOCH_WINDOW),
            nonce: rand::thread_rng().gen(),
            notary_public_key: signing_key.verifying_key().to_bytes(),
            notary_is_signatory: true,
            tip_percentage: self.tip_percentage,
        };

        let manifest = intent.manifest_text();
        let intent_bytes = bcs::to_bytes(&IntentPayload {
            header: &header,
            manifest: &manifest,
        })
        .map_err(|e| SignerError::Encoding(e.to_string()))?;
        let hash = Blake2b256::digest(&intent_bytes);
        let signature = signing_key.sign(&hash);

        let payload = bcs::to_bytes(&NotarizedPayload {
            header: &header,
            manifest: &manifest,
            notary_signature: signature.to_bytes().to_vec(),
        })
        .map_err(|e| SignerError::Encoding(e.to_string()))?;

        Ok(SignedTransaction {
            intent_hash: hex::encode(hash),
            payload_hex: hex::encode(payload),
            expires_at,
        })
    }
}

// ============================================================================
// SUBMISSION
// ============================================================================

pub struct TransactionSubmitter {
    signer: TransactionSigner,
    ledger: Arc<dyn LedgerClient>,
}

impl TransactionSubmitter {
    pub fn new(signer: TransactionSigner, ledger: Arc<dyn LedgerClient>) -> Self {
        Self { signer, ledger }
    }

    /// Signs against the ledger's current epoch.
    pub async fn sign(
        &self,
        intent: &TransferIntent,
        key: &SecretKey,
    ) -> Result<SignedTransaction, SignerError> {
        let epoch = self.ledger.current_epoch().await?;
        self.signer.sign(intent, key, epoch, Utc::now())
    }

    /// Refuses a payload whose quote lapsed after signing.
    pub async fn submit(&self, signed: &SignedTransaction) -> Result<String, SignerError> {
        if let Some(at) = signed.expires_at {
            if Utc::now() >= at {
                return Err(SignerError::QuoteExpired(at));
            }
        }
        let tx_id = self.ledger.submit(&signed.payload_hex).await?;
        info!("Submitted transaction {}", tx_id);
        Ok(tx_id)
    }

    pub async fn sign_and_submit(
        &self,
        intent: &TransferIntent,
        key: &SecretKey,
    ) -> Result<String, SignerError> {
        let signed = self.sign(intent, key).await?;
        self.submit(&signed).await
    }
}
