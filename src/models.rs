// Persisted records and request/response types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::FundingError;

/// Custodial wallet, one per user. The key is vault ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub address: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Processing,
    Active,
    Frozen,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Processing => "processing",
            CardStatus::Active => "active",
            CardStatus::Frozen => "frozen",
        }
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(CardStatus::Processing),
            "active" => Ok(CardStatus::Active),
            "frozen" => Ok(CardStatus::Frozen),
            other => Err(format!("unknown card status '{}'", other)),
        }
    }
}

/// Origination form captured when a card is requested. The issuer only sees
/// it once funds land on the card's deposit address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub date_of_birth: String,
    pub address_line: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

impl CardForm {
    pub fn validate(&self) -> Result<(), FundingError> {
        let required = [
            ("firstName", &self.first_name),
            ("lastName", &self.last_name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("dateOfBirth", &self.date_of_birth),
            ("addressLine", &self.address_line),
            ("city", &self.city),
            ("postalCode", &self.postal_code),
            ("country", &self.country),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(FundingError::Validation(format!("{} is required", field)));
        }
        if !self.email.contains('@') {
            return Err(FundingError::Validation("email is invalid".to_string()));
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(FundingError::Validation(
                "country must be a two-letter ISO code".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub deposit_address: String,
    pub card_code: Option<String>,
    pub status: CardStatus,
    /// Issuer-reported, advisory only.
    pub balance: Decimal,
    #[serde(skip_serializing)]
    pub form_snapshot: Option<CardForm>,
    pub last4: Option<String>,
    pub expiry: Option<String>,
    #[serde(skip_serializing)]
    pub creation_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl Card {
    pub fn new_pending(user_id: Uuid, deposit_address: String, form: CardForm) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            deposit_address,
            card_code: None,
            status: CardStatus::Processing,
            balance: Decimal::ZERO,
            form_snapshot: Some(form),
            last4: None,
            expiry: None,
            creation_requested: false,
            created_at: Utc::now(),
        }
    }

    /// Waiting on the issuer: no code yet, still processing.
    pub fn is_pending(&self) -> bool {
        self.status == CardStatus::Processing && self.card_code.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.status == CardStatus::Active && self.card_code.is_some()
    }
}

/// Issuer-reported fields applied when a card goes live.
#[derive(Debug, Clone, PartialEq)]
pub struct CardActivation {
    pub card_code: String,
    pub balance: Decimal,
    pub last4: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    InsuranceFee,
    Bridge,
    TopUp,
    Send,
    ReferralClaim,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::InsuranceFee => "insurance_fee",
            TransactionKind::Bridge => "bridge",
            TransactionKind::TopUp => "top_up",
            TransactionKind::Send => "send",
            TransactionKind::ReferralClaim => "referral_claim",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insurance_fee" => Ok(TransactionKind::InsuranceFee),
            "bridge" => Ok(TransactionKind::Bridge),
            "top_up" => Ok(TransactionKind::TopUp),
            "send" => Ok(TransactionKind::Send),
            "referral_claim" => Ok(TransactionKind::ReferralClaim),
            other => Err(format!("unknown transaction kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

/// Audit record of one value movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub hash: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(
        user_id: Uuid,
        card_id: Option<Uuid>,
        kind: TransactionKind,
        amount: Decimal,
        status: TransactionStatus,
        hash: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            card_id,
            kind,
            amount,
            status,
            hash: hash.into(),
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// Raw inbound partner callback plus its processing flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub idempotency_key: String,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub in_flight: bool,
    /// When the current processing lease was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    pub effect_applied: bool,
    pub error: Option<String>,
    pub deliveries: i32,
    pub received_at: DateTime<Utc>,
}

impl WebhookEventRecord {
    pub fn received(idempotency_key: String, event_type: String, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key,
            event_type,
            payload,
            processed: false,
            in_flight: false,
            claimed_at: None,
            effect_applied: false,
            error: None,
            deliveries: 1,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub card_id: Option<Uuid>,
    pub credited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralEarnings {
    pub user_id: Uuid,
    pub weekly: Decimal,
    pub lifetime: Decimal,
}

impl ReferralEarnings {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            weekly: Decimal::ZERO,
            lifetime: Decimal::ZERO,
        }
    }
}

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardRequest {
    pub amount: Decimal,
    pub form: CardForm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopUpRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub to_address: String,
    pub amount: Decimal,
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// Where a workflow instance currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Validated,
    FundsChecked,
    Prepared,
    Signed,
    Submitted,
    PendingConfirmation,
    Completed,
    Failed,
}

/// Returned by every funding workflow. A `pending_confirmation` stage means
/// the caller has to poll for the outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingReceipt {
    pub card_id: Option<Uuid>,
    pub stage: WorkflowStage,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBalance {
    pub symbol: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalances {
    pub address: String,
    pub value: TokenBalance,
    pub fee: TokenBalance,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub ledger_status: Option<String>,
}
