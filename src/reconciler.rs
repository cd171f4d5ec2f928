//! Webhook reconciliation.
//!
//! Every delivery is recorded before it is interpreted. Side effects run at
//! most once per idempotency key: a delivery must claim its event row before
//! dispatch, and a processed event is never dispatched again. A claim is a
//! lease; one held past `claim_lease` belongs to a delivery that died and the
//! next redelivery takes it over. Failures leave the event unprocessed with
//! the error attached so a later redelivery can retry it. Ledger value
//! already moved is never reversed from here.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::issuer::{CardIssuer, CreateCardOrder};
use crate::config::FundingPolicy;
use crate::database::Store;
use crate::error::FundingError;
use crate::events::{CardCreated, FundsReceived, InboundEvent, IssuerEvent};
use crate::models::{Card, CardActivation, TransactionKind, TransactionStatus, WebhookEventRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Unrecognised(String),
    Failed(String),
}

/// What actually reaches the card once the issuer has taken its fee.
pub fn post_fee_amount(amount: Decimal, fee: Decimal) -> Decimal {
    (amount - fee).max(Decimal::ZERO)
}

const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

pub struct Reconciler {
    store: Arc<dyn Store>,
    issuer: Arc<dyn CardIssuer>,
    policy: FundingPolicy,
    claim_lease: chrono::Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, issuer: Arc<dyn CardIssuer>, policy: FundingPolicy) -> Self {
        Self {
            store,
            issuer,
            policy,
            claim_lease: chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        if let Ok(lease) = chrono::Duration::from_std(claim_lease) {
            self.claim_lease = lease;
        }
        self
    }

    pub async fn handle(&self, body: &str) -> Result<WebhookOutcome, FundingError> {
        let inbound = InboundEvent::from_body(body);
        let key = inbound.idempotency_key.clone();

        let stored = self
            .store
            .record_webhook_event(&WebhookEventRecord::received(
                key.clone(),
                inbound.event_type.clone(),
                inbound.payload.clone(),
            ))
            .await?;
        if stored.processed {
            info!(
                "Webhook {} already processed (delivery {})",
                key, stored.deliveries
            );
            return Ok(WebhookOutcome::Duplicate);
        }
        if !self
            .store
            .claim_webhook_event(&key, Utc::now() - self.claim_lease)
            .await?
        {
            info!("Webhook {} is being processed by another delivery", key);
            return Ok(WebhookOutcome::Duplicate);
        }
        if stored.in_flight {
            warn!("Webhook {} took over an expired processing lease", key);
        }

        let (outcome, error) = match IssuerEvent::parse(&inbound.event_type, &inbound.data) {
            Ok(IssuerEvent::Unrecognised(event_type)) => {
                let message = format!("unrecognised event type '{}'", event_type);
                (WebhookOutcome::Unrecognised(event_type), Some(message))
            }
            Ok(event) => match self.dispatch(event, &stored).await {
                Ok(()) => (WebhookOutcome::Processed, None),
                Err(e) => (WebhookOutcome::Failed(e.to_string()), Some(e.to_string())),
            },
            Err(message) => (WebhookOutcome::Failed(message.clone()), Some(message)),
        };

        match &error {
            None => info!("Webhook {} ({}) processed", key, inbound.event_type),
            Some(message) => warn!(
                "Webhook {} ({}) left unprocessed: {}",
                key, inbound.event_type, message
            ),
        }
        self.store
            .finish_webhook_event(&key, error.as_deref())
            .await?;
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        event: IssuerEvent,
        stored: &WebhookEventRecord,
    ) -> Result<(), FundingError> {
        match event {
            IssuerEvent::CardCreated(created) => self.card_created(created).await,
            IssuerEvent::FundsReceived(funds) => self.funds_received(funds, stored).await,
            IssuerEvent::Unrecognised(event_type) => Err(FundingError::Reconciliation(format!(
                "unrecognised event type '{}'",
                event_type
            ))),
        }
    }

    // ========================================================================
    // CARD CREATED
    // ========================================================================

    async fn card_created(&self, event: CardCreated) -> Result<(), FundingError> {
        let user_id = Uuid::parse_str(event.customer_id.trim()).map_err(|_| {
            FundingError::Reconciliation(format!("unknown customer '{}'", event.customer_id))
        })?;
        if self.store.get_wallet(user_id).await?.is_none() {
            return Err(FundingError::Reconciliation(format!(
                "no user {}",
                user_id
            )));
        }
        if self.store.count_active_cards(user_id).await? >= self.policy.max_cards as i64 {
            return Err(FundingError::Reconciliation(format!(
                "user {} already holds {} active cards",
                user_id, self.policy.max_cards
            )));
        }
        let card = self
            .store
            .newest_pending_card(user_id)
            .await?
            .ok_or_else(|| {
                FundingError::Reconciliation(format!("no pending card for user {}", user_id))
            })?;

        let activation = CardActivation {
            card_code: event.card_code,
            balance: event.balance,
            last4: event.last4,
            expiry: event.expiry,
        };
        if !self.store.activate_card(card.id, &activation).await? {
            return Err(FundingError::Reconciliation(format!(
                "card {} was activated concurrently",
                card.id
            )));
        }
        info!("Card {} active as {}", card.id, activation.card_code);

        if let Some(referrer) = self
            .store
            .credit_referral(card.id, self.policy.referral_reward)
            .await?
        {
            info!(
                "Credited {} referral reward to {}",
                self.policy.referral_reward, referrer
            );
        }
        Ok(())
    }

    // ========================================================================
    // FUNDS RECEIVED
    // ========================================================================

    async fn funds_received(
        &self,
        event: FundsReceived,
        stored: &WebhookEventRecord,
    ) -> Result<(), FundingError> {
        let card = self
            .store
            .find_card_by_deposit_address(&event.deposit_address)
            .await?
            .ok_or_else(|| {
                FundingError::Reconciliation(format!(
                    "no card for deposit address {}",
                    event.deposit_address
                ))
            })?;

        let net = post_fee_amount(event.amount, self.policy.issuer_fee);
        if net.is_zero() {
            return Err(FundingError::Reconciliation(format!(
                "deposit of {} does not cover the {} issuer fee",
                event.amount, self.policy.issuer_fee
            )));
        }

        match card.card_code.clone() {
            Some(code) => self.top_up_card(&card, &code, net, stored).await,
            None if card.is_pending() => self.request_card(&card, net).await,
            None => Err(FundingError::Reconciliation(format!(
                "card {} has no code but is {}",
                card.id,
                card.status.as_str()
            ))),
        }
    }

    /// The issuer call is remembered on the event, so a redelivery after a
    /// failed store write only repeats the store write.
    async fn top_up_card(
        &self,
        card: &Card,
        code: &str,
        net: Decimal,
        stored: &WebhookEventRecord,
    ) -> Result<(), FundingError> {
        if stored.effect_applied {
            info!(
                "Issuer already topped up card {} for webhook {}",
                card.id, stored.idempotency_key
            );
        } else {
            self.issuer.top_up(code, net).await.map_err(|e| {
                FundingError::Reconciliation(format!(
                    "issuer top-up for card {} failed: {}",
                    card.id, e
                ))
            })?;
            self.store
                .mark_webhook_effect_applied(&stored.idempotency_key)
                .await?;
        }

        let pending = self
            .store
            .latest_pending_transaction(card.id, TransactionKind::TopUp)
            .await?;
        let pending_id = pending.as_ref().map(|tx| tx.id);
        let settled = self.store.apply_top_up(card.id, net, pending_id).await?;
        match pending_id {
            Some(id) if settled => info!("Top-up {} settled at {}", id, net),
            Some(id) => warn!("Top-up {} was settled concurrently", id),
            None => warn!("No pending top-up recorded for card {}", card.id),
        }
        Ok(())
    }

    /// First arrival on a pending card: the issuer only creates the card now.
    async fn request_card(&self, card: &Card, net: Decimal) -> Result<(), FundingError> {
        let form = card.form_snapshot.clone().ok_or_else(|| {
            FundingError::Reconciliation(format!("pending card {} has no form snapshot", card.id))
        })?;
        if !self
            .store
            .set_card_creation_requested(card.id, false, true)
            .await?
        {
            return Err(FundingError::Reconciliation(format!(
                "card {} creation already requested",
                card.id
            )));
        }

        let order = CreateCardOrder {
            customer_id: card.user_id,
            deposit_address: card.deposit_address.clone(),
            amount: net,
            form,
        };
        if let Err(e) = self.issuer.create_card(&order).await {
            self.store
                .set_card_creation_requested(card.id, true, false)
                .await?;
            return Err(FundingError::Reconciliation(format!(
                "issuer create-card for card {} failed: {}",
                card.id, e
            )));
        }
        info!("Requested issuer card for {} with {}", card.id, net);

        if let Some(tx) = self
            .store
            .latest_pending_transaction(card.id, TransactionKind::Bridge)
            .await?
        {
            if !self
                .store
                .settle_transaction(tx.id, TransactionStatus::Success, None)
                .await?
            {
                warn!("Bridge {} was settled concurrently", tx.id);
            }
        }
        Ok(())
    }
}
