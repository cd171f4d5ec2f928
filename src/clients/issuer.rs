// Card-issuing partner API

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Client as HttpClient;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::retry::{with_backoff, RetryPolicy};
use crate::models::CardForm;

const REQUEST_ID_PREFIX: &str = "CRD";
const REQUEST_ID_SUFFIX_LEN: usize = 29;

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("issuer returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("issuer rejected request ({code}): {msg}")]
    Rejected { code: i64, msg: String },
    #[error("malformed issuer response: {0}")]
    Malformed(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<IssuerError>,
    },
}

impl IssuerError {
    /// Network failures and 5xx responses may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            IssuerError::Transport(_) => true,
            IssuerError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for IssuerError {
    fn from(e: reqwest::Error) -> Self {
        IssuerError::Transport(e.to_string())
    }
}

/// Everything the issuer needs to originate a card once funds have arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardOrder {
    pub customer_id: Uuid,
    pub deposit_address: String,
    pub amount: Decimal,
    #[serde(flatten)]
    pub form: CardForm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerCard {
    pub card_code: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerCardTransaction {
    pub id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[async_trait]
pub trait CardIssuer: Send + Sync {
    async fn create_deposit_address(&self, customer_id: Uuid) -> Result<String, IssuerError>;
    async fn create_card(&self, order: &CreateCardOrder) -> Result<(), IssuerError>;
    async fn top_up(&self, card_code: &str, amount: Decimal) -> Result<(), IssuerError>;
    async fn freeze(&self, card_code: &str) -> Result<(), IssuerError>;
    async fn unfreeze(&self, card_code: &str) -> Result<(), IssuerError>;
    async fn card(&self, card_code: &str) -> Result<IssuerCard, IssuerError>;
    async fn card_transactions(
        &self,
        card_code: &str,
    ) -> Result<Vec<IssuerCardTransaction>, IssuerError>;
}

/// Runs an idempotent issuer call under `policy`. Only transient failures are
/// retried; running out of attempts yields [`IssuerError::Exhausted`].
pub async fn retried<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, IssuerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, IssuerError>>,
{
    with_backoff(policy, label, IssuerError::is_transient, op)
        .await
        .map_err(|(attempts, last)| {
            if last.is_transient() {
                IssuerError::Exhausted {
                    attempts,
                    last: Box::new(last),
                }
            } else {
                last
            }
        })
}

pub fn new_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", REQUEST_ID_PREFIX, suffix)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositAddressData {
    deposit_address: String,
}

#[derive(Debug, Deserialize)]
struct CardTransactionsData {
    items: Vec<IssuerCardTransaction>,
}

pub struct HttpCardIssuer {
    http_client: HttpClient,
    base_url: String,
    app_id: String,
    business_id: String,
    api_key: String,
}

impl HttpCardIssuer {
    pub fn new(base_url: String, app_id: String, business_id: String, api_key: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            business_id,
            api_key,
        }
    }

    async fn call(&self, path: &str, data: Value) -> Result<Value, IssuerError> {
        let payload = json!({
            "requestId": new_request_id(),
            "appId": self.app_id,
            "businessId": self.business_id,
            "data": data,
        });

        let resp = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(IssuerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|e| IssuerError::Malformed(e.to_string()))?;
        if envelope.code != 0 {
            return Err(IssuerError::Rejected {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope.data)
    }

    async fn call_as<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        data: Value,
    ) -> Result<T, IssuerError> {
        let value = self.call(path, data).await?;
        serde_json::from_value(value).map_err(|e| IssuerError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl CardIssuer for HttpCardIssuer {
    async fn create_deposit_address(&self, customer_id: Uuid) -> Result<String, IssuerError> {
        let data: DepositAddressData = self
            .call_as("/card/deposit-address", json!({ "customerId": customer_id }))
            .await?;
        Ok(data.deposit_address)
    }

    async fn create_card(&self, order: &CreateCardOrder) -> Result<(), IssuerError> {
        let data = serde_json::to_value(order).map_err(|e| IssuerError::Malformed(e.to_string()))?;
        self.call("/card/create", data).await?;
        Ok(())
    }

    async fn top_up(&self, card_code: &str, amount: Decimal) -> Result<(), IssuerError> {
        self.call(
            "/card/top-up",
            json!({ "cardCode": card_code, "amount": amount.to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn freeze(&self, card_code: &str) -> Result<(), IssuerError> {
        self.call("/card/freeze", json!({ "cardCode": card_code }))
            .await?;
        Ok(())
    }

    async fn unfreeze(&self, card_code: &str) -> Result<(), IssuerError> {
        self.call("/card/unfreeze", json!({ "cardCode": card_code }))
            .await?;
        Ok(())
    }

    async fn card(&self, card_code: &str) -> Result<IssuerCard, IssuerError> {
        self.call_as("/card/detail", json!({ "cardCode": card_code }))
            .await
    }

    async fn card_transactions(
        &self,
        card_code: &str,
    ) -> Result<Vec<IssuerCardTransaction>, IssuerError> {
        let data: CardTransactionsData = self
            .call_as("/card/transactions", json!({ "cardCode": card_code }))
            .await?;
        Ok(data.items)
    }
}
