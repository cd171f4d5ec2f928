// Error taxonomy for funding workflows

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::clients::{issuer::IssuerError, ledger::LedgerError, quote::QuoteError};
use crate::database::StoreError;
use crate::signer::SignerError;
use crate::tokens::AmountError;
use crate::vault::VaultError;

/// Every way a funding workflow or a reconciliation can fail.
#[derive(Debug, Error)]
pub enum FundingError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid caller identity")]
    Unauthenticated,

    #[error("insufficient {asset} balance: required {required}, available {available}")]
    Precondition {
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("card limit reached: at most {max} cards per user")]
    CardLimit { max: usize },

    /// The issuer stayed unreachable through the retry budget.
    #[error("card issuer unavailable: {0}")]
    UpstreamTransient(IssuerError),

    #[error("upstream service failed: {0}")]
    UpstreamFatal(String),

    #[error("fee token balance too low at submission: {0}")]
    FeeShortfall(String),

    #[error("quote expired at {0} and could not be refreshed")]
    QuoteExpired(DateTime<Utc>),

    #[error("secret vault failure: {0}")]
    Vault(#[from] VaultError),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

impl FundingError {
    pub fn kind(&self) -> &'static str {
        match self {
            FundingError::Validation(_) => "validation",
            FundingError::Unauthenticated => "unauthenticated",
            FundingError::Precondition { .. } => "precondition",
            FundingError::NotFound(_) => "not_found",
            FundingError::CardLimit { .. } => "card_limit",
            FundingError::UpstreamTransient(_) => "upstream_transient",
            FundingError::UpstreamFatal(_) => "upstream_fatal",
            FundingError::FeeShortfall(_) => "fee_shortfall",
            FundingError::QuoteExpired(_) => "quote_expired",
            FundingError::Vault(_) => "vault",
            FundingError::Signing(_) => "signing",
            FundingError::Reconciliation(_) => "reconciliation",
            FundingError::Store(_) => "store",
        }
    }

    /// Whether the caller may re-run the same request unchanged. Issuer
    /// outages already went through the retry budget and are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FundingError::FeeShortfall(_) | FundingError::QuoteExpired(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            FundingError::Validation(_) => StatusCode::BAD_REQUEST,
            FundingError::Unauthenticated => StatusCode::UNAUTHORIZED,
            FundingError::Precondition { .. } => StatusCode::PAYMENT_REQUIRED,
            FundingError::NotFound(_) => StatusCode::NOT_FOUND,
            FundingError::CardLimit { .. } => StatusCode::CONFLICT,
            FundingError::UpstreamTransient(_)
            | FundingError::FeeShortfall(_)
            | FundingError::QuoteExpired(_) => StatusCode::SERVICE_UNAVAILABLE,
            FundingError::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            FundingError::Reconciliation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FundingError::Vault(_) | FundingError::Signing(_) | FundingError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<IssuerError> for FundingError {
    fn from(err: IssuerError) -> Self {
        match err {
            IssuerError::Exhausted { .. } => FundingError::UpstreamTransient(err),
            transient if transient.is_transient() => FundingError::UpstreamTransient(transient),
            other => FundingError::UpstreamFatal(format!("card issuer: {}", other)),
        }
    }
}

impl From<QuoteError> for FundingError {
    fn from(err: QuoteError) -> Self {
        FundingError::UpstreamFatal(format!("quote service: {}", err))
    }
}

impl From<LedgerError> for FundingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFee(reason) => FundingError::FeeShortfall(reason),
            other => FundingError::UpstreamFatal(format!("ledger node: {}", other)),
        }
    }
}

impl From<SignerError> for FundingError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::QuoteExpired(at) => FundingError::QuoteExpired(at),
            SignerError::Ledger(e) => e.into(),
            other => FundingError::Signing(other.to_string()),
        }
    }
}

impl From<AmountError> for FundingError {
    fn from(err: AmountError) -> Self {
        FundingError::Validation(err.to_string())
    }
}

impl IntoResponse for FundingError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });

        if let FundingError::Precondition {
            required,
            available,
            ..
        } = &self
        {
            body["required"] = json!(required.to_string());
            body["available"] = json!(available.to_string());
            body["shortfall"] = json!((*required - *available).max(Decimal::ZERO).to_string());
        }

        // Internal details stay in the logs
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            body["message"] = json!("internal error");
        }

        (status, Json(body)).into_response()
    }
}
