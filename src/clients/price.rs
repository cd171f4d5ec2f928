// Fee token USD price feed

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("price feed returned {0}")]
    Status(u16),
    #[error("malformed price: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for PriceError {
    fn from(e: reqwest::Error) -> Self {
        PriceError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current USD price of one whole fee token.
    async fn fee_token_usd(&self) -> Result<Decimal, PriceError>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    usd: Decimal,
}

pub struct HttpPriceFeed {
    http_client: HttpClient,
    url: String,
}

impl HttpPriceFeed {
    pub fn new(url: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            url,
        }
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn fee_token_usd(&self) -> Result<Decimal, PriceError> {
        let resp = self.http_client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(PriceError::Status(resp.status().as_u16()));
        }
        let price: PriceResponse = resp
            .json()
            .await
            .map_err(|e| PriceError::Malformed(e.to_string()))?;
        if price.usd <= Decimal::ZERO {
            return Err(PriceError::Malformed(format!("non-positive price {}", price.usd)));
        }
        Ok(price.usd)
    }
}
