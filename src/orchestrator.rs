//! Funding workflows.
//!
//! Every workflow runs validation and balance preconditions before its first
//! side effect, then prepares, signs and submits ledger transactions and
//! persists the provisional records. Legs that depend on the card issuer
//! noticing the funds stay `pending` until the reconciler settles them.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::balance::BalanceChecker;
use crate::clients::issuer::{retried, CardIssuer, IssuerCard, IssuerCardTransaction};
use crate::clients::ledger::LedgerClient;
use crate::clients::quote::{QuoteBroker, QuoteRequest};
use crate::clients::retry::RetryPolicy;
use crate::clients::Collaborators;
use crate::config::{FundingPolicy, WorkflowSettings};
use crate::database::Store;
use crate::error::FundingError;
use crate::manifest::{Manifest, TransferIntent};
use crate::models::{
    AccountBalances, Card, CardStatus, CreateCardRequest, FundingReceipt, SendRequest,
    TokenBalance, TransactionKind, TransactionRecord, TransactionStatus, TransactionView, Wallet,
    WorkflowStage,
};
use crate::signer::{SignerError, TransactionSigner, TransactionSubmitter};
use crate::tokens::TokenSpec;
use crate::vault::{SecretKey, Vault};

/// Logs each stage a workflow instance reaches.
struct WorkflowTrace {
    workflow: &'static str,
    user_id: Uuid,
    stage: Option<WorkflowStage>,
}

impl WorkflowTrace {
    fn start(workflow: &'static str, user_id: Uuid) -> Self {
        Self {
            workflow,
            user_id,
            stage: None,
        }
    }

    fn advance(&mut self, stage: WorkflowStage) {
        self.stage = Some(stage);
        info!("{} [{}] -> {:?}", self.workflow, self.user_id, stage);
    }

    fn finish<T>(&self, result: &Result<T, FundingError>) {
        if let Err(e) = result {
            warn!(
                "{} [{}] failed after {:?}: {}",
                self.workflow, self.user_id, self.stage, e
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FeeRequirement {
    Bridge,
    Transfer,
}

pub struct FundingOrchestrator {
    store: Arc<dyn Store>,
    vault: Arc<Vault>,
    balances: BalanceChecker,
    submitter: TransactionSubmitter,
    quotes: Arc<dyn QuoteBroker>,
    issuer: Arc<dyn CardIssuer>,
    ledger: Arc<dyn LedgerClient>,
    settings: WorkflowSettings,
}

impl FundingOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        collaborators: &Collaborators,
        settings: WorkflowSettings,
    ) -> Self {
        let balances = BalanceChecker::new(
            collaborators.ledger.clone(),
            collaborators.prices.clone(),
            settings.value_token.clone(),
            settings.fee_token.clone(),
            &settings.policy,
        );
        let submitter = TransactionSubmitter::new(
            TransactionSigner::new(settings.network_id, settings.tip_percentage),
            collaborators.ledger.clone(),
        );
        Self {
            store,
            vault,
            balances,
            submitter,
            quotes: collaborators.quotes.clone(),
            issuer: collaborators.issuer.clone(),
            ledger: collaborators.ledger.clone(),
            settings,
        }
    }

    fn policy(&self) -> &FundingPolicy {
        &self.settings.policy
    }

    fn retry(&self) -> &RetryPolicy {
        &self.settings.issuer_retry
    }

    fn value_token(&self) -> &TokenSpec {
        &self.settings.value_token
    }

    // ========================================================================
    // CARD PROVISIONING
    // ========================================================================

    /// Funds a new card: the bridge leg moves `amount` to a fresh issuer
    /// deposit address and a plain leg pays the insurance fee to the treasury.
    /// The card itself is only created by the issuer once the bridged funds
    /// arrive, so the receipt ends at `pending_confirmation`.
    pub async fn create_card(
        &self,
        user_id: Uuid,
        request: CreateCardRequest,
    ) -> Result<FundingReceipt, FundingError> {
        let mut trace = WorkflowTrace::start("create_card", user_id);
        let result = self.run_create_card(user_id, request, &mut trace).await;
        trace.finish(&result);
        result
    }

    async fn run_create_card(
        &self,
        user_id: Uuid,
        request: CreateCardRequest,
        trace: &mut WorkflowTrace,
    ) -> Result<FundingReceipt, FundingError> {
        let policy = self.policy();
        if request.amount < policy.min_card_funding {
            return Err(FundingError::Validation(format!(
                "minimum card funding is {}",
                policy.min_card_funding
            )));
        }
        self.check_precision(request.amount)?;
        request.form.validate()?;
        let wallet = self.wallet(user_id).await?;
        if self.store.count_cards(user_id).await? >= policy.max_cards as i64 {
            return Err(FundingError::CardLimit {
                max: policy.max_cards,
            });
        }
        trace.advance(WorkflowStage::Validated);

        let balances = self.balances.balances(&wallet.address).await?;
        self.balances.check_value(&balances, request.amount).ensure()?;
        self.balances.check_bridge_fee(&balances).ensure()?;
        trace.advance(WorkflowStage::FundsChecked);

        let deposit_address = retried(self.retry(), "create deposit address", || {
            self.issuer.create_deposit_address(user_id)
        })
        .await?;
        let insurance = self.plain_transfer(
            &wallet.address,
            &self.settings.accounts.treasury_address,
            policy.insurance_fee,
        )?;
        // Claims the card slot before any value moves
        let card = Card::new_pending(user_id, deposit_address, request.form);
        if !self.store.reserve_card(&card, policy.max_cards).await? {
            return Err(FundingError::CardLimit {
                max: policy.max_cards,
            });
        }
        trace.advance(WorkflowStage::Prepared);

        let records = match self
            .fund_card(&wallet, &card, request.amount, &insurance, trace)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                match self.store.release_card(card.id).await {
                    Ok(true) => info!("Released card slot {} of user {}", card.id, user_id),
                    Ok(false) => warn!("Card slot {} of user {} was kept", card.id, user_id),
                    Err(release) => warn!("Could not release card slot {}: {}", card.id, release),
                }
                return Err(e);
            }
        };

        self.store.record_funding_legs(&records).await?;
        if self.store.attach_referral_card(user_id, card.id).await? {
            info!("Linked card {} to referral of user {}", card.id, user_id);
        }
        trace.advance(WorkflowStage::PendingConfirmation);

        Ok(FundingReceipt {
            card_id: Some(card.id),
            stage: WorkflowStage::PendingConfirmation,
            transactions: records,
        })
    }

    /// Signs and submits both legs for a reserved card. Nothing here is
    /// persisted; an error means the bridge never reached the ledger.
    async fn fund_card(
        &self,
        wallet: &Wallet,
        card: &Card,
        amount: Decimal,
        insurance: &TransferIntent,
        trace: &mut WorkflowTrace,
    ) -> Result<Vec<TransactionRecord>, FundingError> {
        let policy = self.policy();
        let key = self.vault.decrypt(&wallet.encrypted_key)?;
        if amount >= policy.high_value_threshold {
            self.recheck_fee(&wallet.address, FeeRequirement::Bridge)
                .await?;
        }
        let insurance_signed = self.submitter.sign(insurance, &key).await?;
        let bridge_hash = self
            .bridge(&wallet.address, &card.deposit_address, amount, &key, trace)
            .await?;
        trace.advance(WorkflowStage::Submitted);

        let mut records = vec![TransactionRecord::new(
            card.user_id,
            Some(card.id),
            TransactionKind::Bridge,
            amount,
            TransactionStatus::Pending,
            bridge_hash,
            format!("Card funding bridged to {}", card.deposit_address),
        )];

        // The bridge is already irreversible, so an insurance failure does not
        // abort the card. It leaves no row and needs operator follow-up.
        match self.submitter.submit(&insurance_signed).await {
            Ok(hash) => records.push(TransactionRecord::new(
                card.user_id,
                Some(card.id),
                TransactionKind::InsuranceFee,
                policy.insurance_fee,
                TransactionStatus::Success,
                hash,
                "Card insurance fee",
            )),
            Err(e) => warn!(
                "Insurance fee for card {} of user {} was not submitted: {}",
                card.id, card.user_id, e
            ),
        }
        Ok(records)
    }

    // ========================================================================
    // TOP-UP AND TRANSFERS
    // ========================================================================

    pub async fn top_up(
        &self,
        user_id: Uuid,
        card_id: Uuid,
        amount: Decimal,
    ) -> Result<FundingReceipt, FundingError> {
        let mut trace = WorkflowTrace::start("top_up", user_id);
        let result = self.run_top_up(user_id, card_id, amount, &mut trace).await;
        trace.finish(&result);
        result
    }

    async fn run_top_up(
        &self,
        user_id: Uuid,
        card_id: Uuid,
        amount: Decimal,
        trace: &mut WorkflowTrace,
    ) -> Result<FundingReceipt, FundingError> {
        let policy = self.policy();
        if amount < policy.min_top_up {
            return Err(FundingError::Validation(format!(
                "minimum top-up is {}",
                policy.min_top_up
            )));
        }
        self.check_precision(amount)?;
        let card = self.owned_card(user_id, card_id).await?;
        if !card.is_active() {
            return Err(FundingError::Validation(format!(
                "card {} is not active",
                card_id
            )));
        }
        let wallet = self.wallet(user_id).await?;
        trace.advance(WorkflowStage::Validated);

        let balances = self.balances.balances(&wallet.address).await?;
        self.balances.check_value(&balances, amount).ensure()?;
        self.balances.check_bridge_fee(&balances).ensure()?;
        trace.advance(WorkflowStage::FundsChecked);

        let key = self.vault.decrypt(&wallet.encrypted_key)?;
        if amount >= policy.high_value_threshold {
            self.recheck_fee(&wallet.address, FeeRequirement::Bridge)
                .await?;
        }
        let hash = self
            .bridge(&wallet.address, &card.deposit_address, amount, &key, trace)
            .await?;
        trace.advance(WorkflowStage::Submitted);

        let record = TransactionRecord::new(
            user_id,
            Some(card.id),
            TransactionKind::TopUp,
            amount,
            TransactionStatus::Pending,
            hash,
            format!("Top-up bridged to {}", card.deposit_address),
        );
        self.store.insert_transaction(&record).await?;
        trace.advance(WorkflowStage::PendingConfirmation);

        Ok(FundingReceipt {
            card_id: Some(card.id),
            stage: WorkflowStage::PendingConfirmation,
            transactions: vec![record],
        })
    }

    /// Same-ledger transfer from the caller's wallet. Final on submission.
    pub async fn send_funds(
        &self,
        user_id: Uuid,
        request: SendRequest,
    ) -> Result<FundingReceipt, FundingError> {
        let mut trace = WorkflowTrace::start("send_funds", user_id);
        let result = self.run_send_funds(user_id, request, &mut trace).await;
        trace.finish(&result);
        result
    }

    async fn run_send_funds(
        &self,
        user_id: Uuid,
        request: SendRequest,
        trace: &mut WorkflowTrace,
    ) -> Result<FundingReceipt, FundingError> {
        if request.amount <= Decimal::ZERO {
            return Err(FundingError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        self.check_precision(request.amount)?;
        if request.to_address.trim().is_empty() {
            return Err(FundingError::Validation(
                "toAddress is required".to_string(),
            ));
        }
        let wallet = self.wallet(user_id).await?;
        trace.advance(WorkflowStage::Validated);

        let balances = self.balances.balances(&wallet.address).await?;
        self.balances.check_value(&balances, request.amount).ensure()?;
        self.balances.check_transfer_fee(&balances).await.ensure()?;
        trace.advance(WorkflowStage::FundsChecked);

        let intent = self.plain_transfer(&wallet.address, &request.to_address, request.amount)?;
        trace.advance(WorkflowStage::Prepared);

        let key = self.vault.decrypt(&wallet.encrypted_key)?;
        if request.amount >= self.policy().high_value_threshold {
            self.recheck_fee(&wallet.address, FeeRequirement::Transfer)
                .await?;
        }
        let hash = self.submitter.sign_and_submit(&intent, &key).await?;
        trace.advance(WorkflowStage::Submitted);

        let record = TransactionRecord::new(
            user_id,
            None,
            TransactionKind::Send,
            request.amount,
            TransactionStatus::Success,
            hash,
            format!("Sent to {}", request.to_address),
        );
        self.store.insert_transaction(&record).await?;
        trace.advance(WorkflowStage::Completed);

        Ok(FundingReceipt {
            card_id: None,
            stage: WorkflowStage::Completed,
            transactions: vec![record],
        })
    }

    /// Pays the caller's weekly referral earnings from the platform referral
    /// wallet. The bucket is zeroed before signing so a concurrent claim
    /// cannot pay twice, and restored if the payout never reaches the ledger.
    pub async fn claim_referral_earnings(
        &self,
        user_id: Uuid,
    ) -> Result<FundingReceipt, FundingError> {
        let mut trace = WorkflowTrace::start("claim_referral_earnings", user_id);
        let result = self.run_claim(user_id, &mut trace).await;
        trace.finish(&result);
        result
    }

    async fn run_claim(
        &self,
        user_id: Uuid,
        trace: &mut WorkflowTrace,
    ) -> Result<FundingReceipt, FundingError> {
        let wallet = self.wallet(user_id).await?;
        let weekly = self.store.earnings(user_id).await?.weekly;
        if weekly <= Decimal::ZERO {
            return Err(FundingError::Validation(
                "no referral earnings to claim".to_string(),
            ));
        }
        trace.advance(WorkflowStage::Validated);

        let payer = self.settings.accounts.referral_wallet_address.clone();
        let balances = self.balances.balances(&payer).await?;
        self.balances.check_value(&balances, weekly).ensure()?;
        self.balances.check_transfer_fee(&balances).await.ensure()?;
        trace.advance(WorkflowStage::FundsChecked);

        let intent = self.plain_transfer(&payer, &wallet.address, weekly)?;
        if !self.store.reset_weekly_earnings(user_id, weekly).await? {
            return Err(FundingError::Validation(
                "referral earnings changed while claiming, try again".to_string(),
            ));
        }
        trace.advance(WorkflowStage::Prepared);

        let payout = match self.vault.decrypt(&self.settings.accounts.referral_wallet_key) {
            Ok(key) => self
                .submitter
                .sign_and_submit(&intent, &key)
                .await
                .map_err(FundingError::from),
            Err(e) => Err(e.into()),
        };
        let hash = match payout {
            Ok(hash) => hash,
            Err(e) => {
                self.store.restore_weekly_earnings(user_id, weekly).await?;
                return Err(e);
            }
        };
        trace.advance(WorkflowStage::Submitted);

        let record = TransactionRecord::new(
            user_id,
            None,
            TransactionKind::ReferralClaim,
            weekly,
            TransactionStatus::Success,
            hash,
            "Weekly referral earnings",
        );
        self.store.insert_transaction(&record).await?;
        trace.advance(WorkflowStage::Completed);

        Ok(FundingReceipt {
            card_id: None,
            stage: WorkflowStage::Completed,
            transactions: vec![record],
        })
    }

    // ========================================================================
    // CARD MANAGEMENT
    // ========================================================================

    pub async fn freeze_card(&self, user_id: Uuid, card_id: Uuid) -> Result<Card, FundingError> {
        let card = self.owned_card(user_id, card_id).await?;
        if card.status != CardStatus::Active {
            return Err(FundingError::Validation(format!(
                "card {} is not active",
                card_id
            )));
        }
        let code = issuer_code(&card)?;
        retried(self.retry(), "freeze card", || self.issuer.freeze(code)).await?;
        if !self
            .store
            .transition_card_status(card.id, CardStatus::Active, CardStatus::Frozen)
            .await?
        {
            warn!("Card {} changed status while freezing", card.id);
        }
        info!("Card {} frozen", card.id);
        self.owned_card(user_id, card_id).await
    }

    pub async fn unfreeze_card(&self, user_id: Uuid, card_id: Uuid) -> Result<Card, FundingError> {
        let card = self.owned_card(user_id, card_id).await?;
        if card.status != CardStatus::Frozen {
            return Err(FundingError::Validation(format!(
                "card {} is not frozen",
                card_id
            )));
        }
        let code = issuer_code(&card)?;
        retried(self.retry(), "unfreeze card", || self.issuer.unfreeze(code)).await?;
        if !self
            .store
            .transition_card_status(card.id, CardStatus::Frozen, CardStatus::Active)
            .await?
        {
            warn!("Card {} changed status while unfreezing", card.id);
        }
        info!("Card {} unfrozen", card.id);
        self.owned_card(user_id, card_id).await
    }

    pub async fn card_details(
        &self,
        user_id: Uuid,
        card_id: Uuid,
    ) -> Result<IssuerCard, FundingError> {
        let card = self.owned_card(user_id, card_id).await?;
        let code = issuer_code(&card)?;
        Ok(retried(self.retry(), "fetch card", || self.issuer.card(code)).await?)
    }

    pub async fn card_transactions(
        &self,
        user_id: Uuid,
        card_id: Uuid,
    ) -> Result<Vec<IssuerCardTransaction>, FundingError> {
        let card = self.owned_card(user_id, card_id).await?;
        let code = issuer_code(&card)?;
        Ok(retried(self.retry(), "fetch card transactions", || {
            self.issuer.card_transactions(code)
        })
        .await?)
    }

    pub async fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, FundingError> {
        Ok(self.store.list_cards(user_id).await?)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub async fn balances(&self, user_id: Uuid) -> Result<AccountBalances, FundingError> {
        let wallet = self.wallet(user_id).await?;
        let balances = self.balances.balances(&wallet.address).await?;
        Ok(AccountBalances {
            address: wallet.address,
            value: TokenBalance {
                symbol: self.settings.value_token.symbol.clone(),
                amount: balances.value,
            },
            fee: TokenBalance {
                symbol: self.settings.fee_token.symbol.clone(),
                amount: balances.fee,
            },
        })
    }

    /// The stored record plus, when it has a ledger hash, what the ledger
    /// currently says about it.
    pub async fn transaction_status(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionView, FundingError> {
        let record = match self.store.get_transaction(transaction_id).await? {
            Some(record) if record.user_id == user_id => record,
            _ => {
                return Err(FundingError::NotFound(format!(
                    "transaction {}",
                    transaction_id
                )))
            }
        };

        let ledger_status = if record.hash.is_empty() {
            None
        } else {
            match self.ledger.transaction_status(&record.hash).await {
                Ok(status) => Some(status.as_str().to_string()),
                Err(e) => {
                    warn!("Ledger status for {} unavailable: {}", record.hash, e);
                    None
                }
            }
        };

        Ok(TransactionView {
            record,
            ledger_status,
        })
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn wallet(&self, user_id: Uuid) -> Result<Wallet, FundingError> {
        self.store
            .get_wallet(user_id)
            .await?
            .ok_or_else(|| FundingError::NotFound(format!("wallet for user {}", user_id)))
    }

    /// Cards owned by someone else are reported as missing.
    async fn owned_card(&self, user_id: Uuid, card_id: Uuid) -> Result<Card, FundingError> {
        match self.store.get_card(card_id).await? {
            Some(card) if card.user_id == user_id => Ok(card),
            _ => Err(FundingError::NotFound(format!("card {}", card_id))),
        }
    }

    /// Amounts the value token cannot represent exactly are refused up front.
    fn check_precision(&self, amount: Decimal) -> Result<(), FundingError> {
        self.value_token().to_native(amount)?;
        Ok(())
    }

    fn plain_transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransferIntent, FundingError> {
        let manifest = Manifest::transfer(from, to, self.value_token(), amount)?.with_fee_lock(
            from,
            &self.settings.fee_token,
            self.policy().transfer_lock_fee,
        )?;
        Ok(TransferIntent::Plain(manifest))
    }

    /// Quote, sign and submit a cross-ledger move. An expired quote is
    /// replaced up to `max_requotes` times.
    async fn bridge(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        key: &SecretKey,
        trace: &mut WorkflowTrace,
    ) -> Result<String, FundingError> {
        let request = QuoteRequest {
            amount,
            from_address: from.to_string(),
            to_address: to.to_string(),
        };

        let mut requotes = 0;
        loop {
            let quote = self.quotes.quote(&request).await?;
            if quote.is_expired(Utc::now()) && requotes < self.policy().max_requotes {
                requotes += 1;
                warn!("Quote expired on arrival, re-quoting ({})", requotes);
                continue;
            }
            let intent = TransferIntent::Quoted(quote);

            let attempt = match self.submitter.sign(&intent, key).await {
                Ok(signed) => {
                    trace.advance(WorkflowStage::Signed);
                    self.submitter.submit(&signed).await
                }
                Err(e) => Err(e),
            };

            match attempt {
                Ok(hash) => return Ok(hash),
                Err(SignerError::QuoteExpired(at)) if requotes < self.policy().max_requotes => {
                    requotes += 1;
                    warn!("Quote expired at {}, re-quoting ({})", at, requotes);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Balances can move between the precondition check and signing; large
    /// operations look at the fee token again right before the key is used.
    async fn recheck_fee(
        &self,
        address: &str,
        requirement: FeeRequirement,
    ) -> Result<(), FundingError> {
        let balances = self.balances.balances(address).await?;
        let check = match requirement {
            FeeRequirement::Bridge => self.balances.check_bridge_fee(&balances),
            FeeRequirement::Transfer => self.balances.check_transfer_fee(&balances).await,
        };
        if check.has_enough {
            Ok(())
        } else {
            Err(FundingError::FeeShortfall(format!(
                "{} balance {} is below the required {}",
                check.asset, check.balance, check.required
            )))
        }
    }
}

fn issuer_code(card: &Card) -> Result<&str, FundingError> {
    card.card_code
        .as_deref()
        .ok_or_else(|| FundingError::Validation(format!("card {} is not issued yet", card.id)))
}
