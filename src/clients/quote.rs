// Cross-ledger quote broker

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client as HttpClient;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("routing service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed quote: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for QuoteError {
    fn from(e: reqwest::Error) -> Self {
        QuoteError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRequest {
    pub amount: Decimal,
    pub from_address: String,
    pub to_address: String,
}

/// A routed transfer intent that is only valid until `expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub intent: String,
    pub fee_total_usd: Decimal,
    pub expires_at: DateTime<Utc>,
}

impl Quote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait QuoteBroker: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote, QuoteError>;
}

// ============================================================================
// ROUTING SERVICE RESPONSE
// ============================================================================

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    route: Route,
}

#[derive(Debug, Deserialize)]
struct Route {
    tx: RouteTx,
    fees: RouteFees,
    expiration: Expiration,
}

#[derive(Debug, Deserialize)]
struct RouteTx {
    manifest: String,
}

#[derive(Debug, Deserialize)]
struct RouteFees {
    total: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expiration {
    Unix(i64),
    Text(String),
}

/// Timestamps past this are milliseconds, not seconds.
const MILLIS_CUTOFF: i64 = 100_000_000_000;

impl Expiration {
    fn to_datetime(&self) -> Result<DateTime<Utc>, QuoteError> {
        match self {
            Expiration::Unix(n) => from_unix(*n),
            Expiration::Text(s) => {
                if let Ok(n) = s.trim().parse::<i64>() {
                    return from_unix(n);
                }
                DateTime::parse_from_rfc3339(s.trim())
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| QuoteError::Malformed(format!("expiration '{}'", s)))
            }
        }
    }
}

fn from_unix(n: i64) -> Result<DateTime<Utc>, QuoteError> {
    let parsed = if n.abs() >= MILLIS_CUTOFF {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    };
    parsed.ok_or_else(|| QuoteError::Malformed(format!("expiration {}", n)))
}

/// Parses the routing service's JSON body into a [`Quote`].
pub fn parse_quote(body: &str) -> Result<Quote, QuoteError> {
    let resp: QuoteResponse =
        serde_json::from_str(body).map_err(|e| QuoteError::Malformed(e.to_string()))?;
    if resp.route.tx.manifest.trim().is_empty() {
        return Err(QuoteError::Malformed("empty manifest".to_string()));
    }
    Ok(Quote {
        expires_at: resp.route.expiration.to_datetime()?,
        intent: resp.route.tx.manifest,
        fee_total_usd: resp.route.fees.total,
    })
}

pub struct HttpQuoteBroker {
    http_client: HttpClient,
    url: String,
    input_token: String,
    output_token: String,
    slippage_bps: u32,
}

impl HttpQuoteBroker {
    pub fn new(url: String, input_token: String, output_token: String, slippage_bps: u32) -> Self {
        Self {
            http_client: HttpClient::new(),
            url,
            input_token,
            output_token,
            slippage_bps,
        }
    }
}

#[async_trait]
impl QuoteBroker for HttpQuoteBroker {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote, QuoteError> {
        let payload = json!({
            "inputAmount": request.amount.to_string(),
            "inputToken": self.input_token,
            "outputToken": self.output_token,
            "fromAddress": request.from_address,
            "toAddress": request.to_address,
            "slippageBps": self.slippage_bps,
            "includeStreaming": false,
            "includeTx": true,
        });

        let resp = self.http_client.post(&self.url).json(&payload).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(QuoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_quote(&body)
    }
}
