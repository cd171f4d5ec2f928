#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use card_funding_backend::clients::issuer::{
    CardIssuer, CreateCardOrder, IssuerCard, IssuerCardTransaction, IssuerError,
};
use card_funding_backend::clients::ledger::{
    LedgerClient, LedgerError, LedgerTxStatus, VaultBalance,
};
use card_funding_backend::clients::price::{PriceError, PriceFeed};
use card_funding_backend::clients::quote::{Quote, QuoteBroker, QuoteError, QuoteRequest};
use card_funding_backend::clients::retry::RetryPolicy;
use card_funding_backend::clients::Collaborators;
use card_funding_backend::config::{FundingPolicy, PlatformAccounts, WorkflowSettings};
use card_funding_backend::database::Store;
use card_funding_backend::memory::MemoryStore;
use card_funding_backend::models::{Card, CardForm, CreateCardRequest, Wallet};
use card_funding_backend::orchestrator::FundingOrchestrator;
use card_funding_backend::reconciler::{Reconciler, WebhookOutcome};
use card_funding_backend::tokens::{to_native_units, TokenSpec};
use card_funding_backend::vault::Vault;
use card_funding_backend::AppState;

pub const VALUE_RESOURCE: &str = "resource_usdc";
pub const FEE_RESOURCE: &str = "resource_xrd";
pub const VALUE_DECIMALS: u32 = 6;
pub const FEE_DECIMALS: u32 = 18;
pub const TREASURY: &str = "account_treasury";
pub const REFERRAL_WALLET: &str = "account_referral";
/// Short enough for tests to outwait an abandoned webhook delivery.
pub const CLAIM_LEASE: Duration = Duration::from_millis(50);

const USER_KEY_HEX: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
const REFERRAL_KEY_HEX: &str = "4ccd089b28ff96da9db6c346ec114e0f5b8a319f35aba624da8cf6ed4fb8a6fb";

// ============================================================================
// STUB COLLABORATORS
// ============================================================================

#[derive(Default)]
pub struct StubLedger {
    balances: Mutex<HashMap<String, (Decimal, Decimal)>>,
    statuses: Mutex<HashMap<String, LedgerTxStatus>>,
    pub balance_calls: AtomicUsize,
    /// Fee balance reads as zero once this many balance queries were made.
    pub drain_fee_after: AtomicUsize,
    pub submits: AtomicUsize,
    pub submit_error: Mutex<Option<String>>,
}

impl StubLedger {
    pub fn new() -> Self {
        let ledger = Self::default();
        ledger.drain_fee_after.store(usize::MAX, Ordering::SeqCst);
        ledger
    }

    pub fn set_balances(&self, address: &str, value: Decimal, fee: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), (value, fee));
    }

    pub fn set_status(&self, hash: &str, status: LedgerTxStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(hash.to_string(), status);
    }
}

#[async_trait]
impl LedgerClient for StubLedger {
    async fn balances(&self, address: &str) -> Result<Vec<VaultBalance>, LedgerError> {
        let call = self.balance_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (value, mut fee) = self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        if call > self.drain_fee_after.load(Ordering::SeqCst) {
            fee = Decimal::ZERO;
        }
        Ok(vec![
            VaultBalance {
                resource: VALUE_RESOURCE.to_string(),
                amount: to_native_units(value, VALUE_DECIMALS).unwrap().to_string(),
            },
            VaultBalance {
                resource: FEE_RESOURCE.to_string(),
                amount: to_native_units(fee, FEE_DECIMALS).unwrap().to_string(),
            },
        ])
    }

    async fn current_epoch(&self) -> Result<u64, LedgerError> {
        Ok(1_000)
    }

    async fn submit(&self, _notarized_hex: &str) -> Result<String, LedgerError> {
        if let Some(reason) = self.submit_error.lock().unwrap().clone() {
            return Err(LedgerError::InsufficientFee(reason));
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("txid_{}", n))
    }

    async fn transaction_status(&self, intent_hash: &str) -> Result<LedgerTxStatus, LedgerError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(intent_hash)
            .copied()
            .unwrap_or(LedgerTxStatus::Pending))
    }
}

#[derive(Default)]
pub struct StubQuotes {
    pub calls: AtomicUsize,
    /// How many already-expired quotes to hand out before fresh ones.
    pub expired_first: AtomicUsize,
}

#[async_trait]
impl QuoteBroker for StubQuotes {
    async fn quote(&self, request: &QuoteRequest) -> Result<Quote, QuoteError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let expires_at = if call < self.expired_first.load(Ordering::SeqCst) {
            chrono::Utc::now() - chrono::Duration::seconds(1)
        } else {
            chrono::Utc::now() + chrono::Duration::minutes(5)
        };
        Ok(Quote {
            intent: format!(
                "BRIDGE {} FROM {} TO {}",
                request.amount, request.from_address, request.to_address
            ),
            fee_total_usd: dec!(0.75),
            expires_at,
        })
    }
}

#[derive(Default)]
pub struct StubIssuer {
    pub deposit_calls: AtomicUsize,
    pub orders: Mutex<Vec<CreateCardOrder>>,
    pub top_ups: Mutex<Vec<(String, Decimal)>>,
    pub freezes: AtomicUsize,
    pub unfreezes: AtomicUsize,
    /// Transient failures to return before freeze calls succeed.
    pub freeze_failures: AtomicUsize,
    pub fail_create_card: Mutex<bool>,
    /// Top-up calls that never complete, as if the issuer hung.
    pub hang_top_ups: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CardIssuer for StubIssuer {
    async fn create_deposit_address(&self, _customer_id: Uuid) -> Result<String, IssuerError> {
        let n = self.deposit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Lets concurrent workflows interleave here
        tokio::task::yield_now().await;
        Ok(format!("0xdeposit{}", n))
    }

    async fn create_card(&self, order: &CreateCardOrder) -> Result<(), IssuerError> {
        if *self.fail_create_card.lock().unwrap() {
            return Err(IssuerError::Rejected {
                code: 5001,
                msg: "kyc pending".into(),
            });
        }
        self.orders.lock().unwrap().push(order.clone());
        Ok(())
    }

    async fn top_up(&self, card_code: &str, amount: Decimal) -> Result<(), IssuerError> {
        if take_one(&self.hang_top_ups) {
            std::future::pending::<()>().await;
        }
        self.top_ups
            .lock()
            .unwrap()
            .push((card_code.to_string(), amount));
        Ok(())
    }

    async fn freeze(&self, _card_code: &str) -> Result<(), IssuerError> {
        self.freezes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.freeze_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.freeze_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(IssuerError::Status {
                status: 503,
                body: "try later".into(),
            });
        }
        Ok(())
    }

    async fn unfreeze(&self, _card_code: &str) -> Result<(), IssuerError> {
        self.unfreezes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn card(&self, card_code: &str) -> Result<IssuerCard, IssuerError> {
        Ok(IssuerCard {
            card_code: card_code.to_string(),
            status: Some("ACTIVE".into()),
            balance: dec!(12.5),
            last4: Some("4242".into()),
            expiry: Some("12/29".into()),
        })
    }

    async fn card_transactions(
        &self,
        _card_code: &str,
    ) -> Result<Vec<IssuerCardTransaction>, IssuerError> {
        Ok(vec![])
    }
}

pub struct StubPrices(pub Decimal);

#[async_trait]
impl PriceFeed for StubPrices {
    async fn fee_token_usd(&self) -> Result<Decimal, PriceError> {
        Ok(self.0)
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<StubLedger>,
    pub quotes: Arc<StubQuotes>,
    pub issuer: Arc<StubIssuer>,
    pub vault: Arc<Vault>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(StubLedger::new());
        let quotes = Arc::new(StubQuotes::default());
        let issuer = Arc::new(StubIssuer::default());
        let vault = Arc::new(Vault::new(&[42u8; 32]).unwrap());

        let collaborators = Collaborators {
            ledger: ledger.clone(),
            quotes: quotes.clone(),
            issuer: issuer.clone(),
            // 0.5 USD minimum transfer fee is 10 fee tokens at this price
            prices: Arc::new(StubPrices(dec!(0.05))),
        };
        let settings = WorkflowSettings {
            value_token: TokenSpec::new("USDC", VALUE_RESOURCE, VALUE_DECIMALS),
            fee_token: TokenSpec::new("XRD", FEE_RESOURCE, FEE_DECIMALS),
            network_id: 1,
            tip_percentage: 0,
            accounts: PlatformAccounts {
                treasury_address: TREASURY.to_string(),
                referral_wallet_address: REFERRAL_WALLET.to_string(),
                referral_wallet_key: vault.encrypt(REFERRAL_KEY_HEX).unwrap(),
            },
            policy: FundingPolicy::default(),
            issuer_retry: RetryPolicy::new(3, Duration::from_millis(1)),
            webhook_claim_lease: CLAIM_LEASE,
        };
        let dyn_store: Arc<dyn Store> = store.clone();
        let state = Arc::new(AppState::new(
            dyn_store,
            vault.clone(),
            &collaborators,
            settings,
        ));

        Self {
            store,
            ledger,
            quotes,
            issuer,
            vault,
            state,
        }
    }

    pub fn orchestrator(&self) -> &FundingOrchestrator {
        &self.state.orchestrator
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.state.reconciler
    }

    /// Registers a user with a custodial wallet holding the given balances.
    pub async fn user_with_balance(&self, value: Decimal, fee: Decimal) -> Uuid {
        let user_id = Uuid::new_v4();
        let address = format!("account_{}", user_id.simple());
        self.store
            .insert_wallet(&Wallet {
                user_id,
                address: address.clone(),
                encrypted_key: self.vault.encrypt(USER_KEY_HEX).unwrap(),
            })
            .await
            .unwrap();
        self.ledger.set_balances(&address, value, fee);
        user_id
    }

    pub async fn wallet_address(&self, user_id: Uuid) -> String {
        self.store
            .get_wallet(user_id)
            .await
            .unwrap()
            .unwrap()
            .address
    }

    /// Runs the create-card workflow and returns the pending card.
    pub async fn pending_card(&self, user_id: Uuid, amount: Decimal) -> Card {
        let receipt = self
            .orchestrator()
            .create_card(
                user_id,
                CreateCardRequest {
                    amount,
                    form: sample_form(),
                },
            )
            .await
            .unwrap();
        self.store
            .get_card(receipt.card_id.unwrap())
            .await
            .unwrap()
            .unwrap()
    }

    /// Drives a card through funding, first deposit and issuer activation.
    pub async fn active_card(&self, user_id: Uuid, card_code: &str) -> Card {
        let card = self.pending_card(user_id, dec!(15)).await;
        let outcome = self
            .reconciler()
            .handle(&deposit_event(None, &card.deposit_address, dec!(15)))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        let outcome = self
            .reconciler()
            .handle(&card_created_event(user_id, card_code))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        self.store.get_card(card.id).await.unwrap().unwrap()
    }
}

pub fn sample_form() -> CardForm {
    CardForm {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "ada@example.com".into(),
        phone: "+4420000000".into(),
        date_of_birth: "1990-12-10".into(),
        address_line: "1 Analytical St".into(),
        city: "London".into(),
        postal_code: "N1 1AA".into(),
        country: "GB".into(),
    }
}

pub fn deposit_event(event_id: Option<&str>, deposit_address: &str, amount: Decimal) -> String {
    let mut body = json!({
        "eventType": "deposit.received",
        "eventData": {
            "depositAddress": deposit_address,
            "amount": amount.to_string(),
        },
    });
    if let Some(id) = event_id {
        body["eventId"] = json!(id);
    }
    body.to_string()
}

pub fn card_created_event(user_id: Uuid, card_code: &str) -> String {
    json!({
        "eventType": "card.create.success",
        "eventData": {
            "cardCode": card_code,
            "customerId": user_id.to_string(),
            "balance": "12.5",
            "last4": "4242",
            "expiry": "12/29",
        },
    })
    .to_string()
}
