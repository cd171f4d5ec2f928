// Source ledger node gateway

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("insufficient fee balance: {0}")]
    InsufficientFee(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("malformed node response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}

/// One fungible vault held by an account, amount in smallest units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultBalance {
    pub resource: String,
    pub amount: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTxStatus {
    Pending,
    CommittedSuccess,
    CommittedFailure,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl LedgerTxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerTxStatus::Pending => "pending",
            LedgerTxStatus::CommittedSuccess => "committed_success",
            LedgerTxStatus::CommittedFailure => "committed_failure",
            LedgerTxStatus::Rejected => "rejected",
            LedgerTxStatus::Unknown => "unknown",
        }
    }

    /// The ledger will never apply this transaction.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            LedgerTxStatus::CommittedFailure | LedgerTxStatus::Rejected
        )
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn balances(&self, address: &str) -> Result<Vec<VaultBalance>, LedgerError>;
    async fn current_epoch(&self) -> Result<u64, LedgerError>;
    /// Submits a notarized transaction and returns its intent hash.
    async fn submit(&self, notarized_hex: &str) -> Result<String, LedgerError>;
    async fn transaction_status(&self, intent_hash: &str) -> Result<LedgerTxStatus, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    items: Vec<VaultBalance>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    epoch: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    intent_hash: String,
}

#[derive(Debug, Deserialize)]
struct TransactionStatusResponse {
    status: LedgerTxStatus,
}

/// Maps a refused submission onto the error taxonomy. The node reports a
/// lock-fee failure as a plain message, so fee shortfalls are recognised by
/// their wording.
pub fn classify_rejection(status: u16, body: String) -> LedgerError {
    let lowered = body.to_lowercase();
    if (lowered.contains("insufficient") && lowered.contains("fee"))
        || lowered.contains("lock_fee")
        || lowered.contains("lock fee")
    {
        LedgerError::InsufficientFee(body)
    } else if (400..500).contains(&status) {
        LedgerError::Rejected(body)
    } else {
        LedgerError::Status { status, body }
    }
}

pub struct HttpLedgerClient {
    http_client: HttpClient,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, LedgerError> {
        let resp = self
            .http_client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn balances(&self, address: &str) -> Result<Vec<VaultBalance>, LedgerError> {
        let resp: BalancesResponse = self
            .get_json(&format!("/accounts/{}/balances", address))
            .await?;
        Ok(resp.items)
    }

    async fn current_epoch(&self) -> Result<u64, LedgerError> {
        let resp: StatusResponse = self.get_json("/status").await?;
        Ok(resp.epoch)
    }

    async fn submit(&self, notarized_hex: &str) -> Result<String, LedgerError> {
        let resp = self
            .http_client
            .post(format!("{}/transactions", self.base_url))
            .json(&json!({ "notarized_transaction_hex": notarized_hex }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_rejection(status.as_u16(), body));
        }

        let resp: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))?;
        Ok(resp.intent_hash)
    }

    async fn transaction_status(&self, intent_hash: &str) -> Result<LedgerTxStatus, LedgerError> {
        let resp: TransactionStatusResponse = self
            .get_json(&format!("/transactions/{}", intent_hash))
            .await?;
        Ok(resp.status)
    }
}
