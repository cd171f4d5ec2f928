// Process configuration and business constants

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::time::Duration;

use crate::clients::retry::RetryPolicy;
use crate::tokens::TokenSpec;

/// Fixed business rules of the funding workflows.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingPolicy {
    pub min_card_funding: Decimal,
    pub min_top_up: Decimal,
    pub insurance_fee: Decimal,
    /// Deducted by the issuer from every arrival before it reaches the card.
    pub issuer_fee: Decimal,
    pub max_cards: usize,
    pub min_transfer_fee_usd: Decimal,
    /// Fee tokens a bridge needs for destination execution plus bridge fee.
    pub bridge_fee_native: Decimal,
    /// Fee tokens locked by plain transfers.
    pub transfer_lock_fee: Decimal,
    pub referral_reward: Decimal,
    pub high_value_threshold: Decimal,
    pub fallback_fee_token_price: Decimal,
    pub max_requotes: u32,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        Self {
            min_card_funding: dec!(15),
            min_top_up: dec!(10),
            insurance_fee: dec!(10),
            issuer_fee: dec!(2.5),
            max_cards: 4,
            min_transfer_fee_usd: dec!(0.5),
            bridge_fee_native: dec!(60),
            transfer_lock_fee: dec!(5),
            referral_reward: dec!(5),
            high_value_threshold: dec!(500),
            fallback_fee_token_price: dec!(0.02),
            max_requotes: 2,
        }
    }
}

/// Platform-owned accounts on the source ledger.
#[derive(Debug, Clone)]
pub struct PlatformAccounts {
    pub treasury_address: String,
    pub referral_wallet_address: String,
    /// Vault ciphertext of the referral payout key.
    pub referral_wallet_key: String,
}

/// Everything the funding workflows need from configuration.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub value_token: TokenSpec,
    pub fee_token: TokenSpec,
    pub network_id: u8,
    pub tip_percentage: u16,
    pub accounts: PlatformAccounts,
    pub policy: FundingPolicy,
    pub issuer_retry: RetryPolicy,
    /// How long a webhook delivery may hold its event before another
    /// delivery can take it over.
    pub webhook_claim_lease: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub port: u16,
    pub vault_key: String,
    pub ledger_url: String,
    pub quote_url: String,
    pub price_url: String,
    pub issuer_url: String,
    pub issuer_app_id: String,
    pub issuer_business_id: String,
    pub issuer_api_key: String,
    pub network_id: u8,
    pub tip_percentage: u16,
    pub value_token: TokenSpec,
    pub fee_token: TokenSpec,
    /// Token the quote broker should deliver on the destination ledger.
    pub destination_token: String,
    pub slippage_bps: u32,
    pub issuer_retry: RetryPolicy,
    pub webhook_claim_lease: Duration,
    pub accounts: PlatformAccounts,
    pub policy: FundingPolicy,
    pub json_logs: bool,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("{} must be set in environment", name))
}

fn optional<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

fn positive(name: &str, value: Decimal) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(anyhow!("{} must be greater than zero, got {}", name, value));
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let value_resource = required("VALUE_TOKEN")?;
        let fee_resource = required("FEE_TOKEN")?;

        let defaults = FundingPolicy::default();
        let policy = FundingPolicy {
            high_value_threshold: optional("HIGH_VALUE_THRESHOLD", defaults.high_value_threshold)?,
            fallback_fee_token_price: positive(
                "FALLBACK_FEE_TOKEN_PRICE",
                optional("FALLBACK_FEE_TOKEN_PRICE", defaults.fallback_fee_token_price)?,
            )?,
            ..defaults
        };

        let vault_key = required("VAULT_KEY")?;
        if vault_key.trim().len() != 64 {
            return Err(anyhow!("VAULT_KEY must be 64 hex characters"));
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            port: optional("PORT", 4000)?,
            vault_key,
            ledger_url: required("LEDGER_URL")?,
            quote_url: required("QUOTE_URL")?,
            price_url: required("PRICE_URL")?,
            issuer_url: required("ISSUER_URL")?,
            issuer_app_id: required("ISSUER_APP_ID")?,
            issuer_business_id: required("ISSUER_BUSINESS_ID")?,
            issuer_api_key: required("ISSUER_API_KEY")?,
            network_id: optional("NETWORK_ID", 1)?,
            tip_percentage: optional("TIP_PERCENTAGE", 0)?,
            destination_token: std::env::var("DESTINATION_TOKEN")
                .unwrap_or_else(|_| value_resource.clone()),
            value_token: TokenSpec::new(
                optional("VALUE_TOKEN_SYMBOL", "USDC".to_string())?,
                value_resource,
                optional("VALUE_TOKEN_DECIMALS", 18)?,
            ),
            fee_token: TokenSpec::new(
                optional("FEE_TOKEN_SYMBOL", "XRD".to_string())?,
                fee_resource,
                optional("FEE_TOKEN_DECIMALS", 18)?,
            ),
            slippage_bps: optional("SLIPPAGE_BPS", 100)?,
            issuer_retry: RetryPolicy::new(
                optional("ISSUER_RETRY_ATTEMPTS", 3)?,
                Duration::from_millis(optional("ISSUER_RETRY_BASE_MS", 500)?),
            ),
            webhook_claim_lease: Duration::from_secs(optional("WEBHOOK_CLAIM_LEASE_SECS", 300)?),
            accounts: PlatformAccounts {
                treasury_address: required("TREASURY_ADDRESS")?,
                referral_wallet_address: required("REFERRAL_WALLET_ADDRESS")?,
                referral_wallet_key: required("REFERRAL_WALLET_KEY")
                    .context("referral payouts need the sealed payout key")?,
            },
            policy,
            json_logs: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            value_token: self.value_token.clone(),
            fee_token: self.fee_token.clone(),
            network_id: self.network_id,
            tip_percentage: self.tip_percentage,
            accounts: self.accounts.clone(),
            policy: self.policy.clone(),
            issuer_retry: self.issuer_retry,
            webhook_claim_lease: self.webhook_claim_lease,
        }
    }
}
