use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::{Store, StoreError};
use crate::models::{
    Card, CardActivation, CardStatus, Referral, ReferralEarnings, TransactionKind,
    TransactionRecord, TransactionStatus, Wallet, WebhookEventRecord,
};

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<Uuid, Wallet>,
    cards: Vec<Card>,
    transactions: Vec<TransactionRecord>,
    ledger_checked: HashMap<Uuid, DateTime<Utc>>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    referrals: Vec<Referral>,
    earnings: HashMap<Uuid, ReferralEarnings>,
}

/// A thread-safe in-memory store.
///
/// One `RwLock` guards every table, so each trait method (including the
/// conditional updates) is atomic with respect to the others. Used by the
/// test suite and when no `DATABASE_URL` is configured.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All transactions ever written, oldest first.
    pub async fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.read().await.transactions.clone()
    }

    pub async fn webhook_events(&self) -> Vec<WebhookEventRecord> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state.webhook_events.values().cloned().collect();
        events.sort_by_key(|e| e.received_at);
        events
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.wallets.insert(wallet.user_id, wallet.clone());
        Ok(())
    }

    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        Ok(self.state.read().await.wallets.get(&user_id).cloned())
    }

    async fn count_cards(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state.cards.iter().filter(|c| c.user_id == user_id).count() as i64)
    }

    async fn count_active_cards(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .iter()
            .filter(|c| c.user_id == user_id && c.card_code.is_some())
            .count() as i64)
    }

    async fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>, StoreError> {
        let state = self.state.read().await;
        Ok(state.cards.iter().find(|c| c.id == card_id).cloned())
    }

    async fn find_card_by_deposit_address(
        &self,
        deposit_address: &str,
    ) -> Result<Option<Card>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .iter()
            .rev()
            .find(|c| c.deposit_address == deposit_address)
            .cloned())
    }

    async fn newest_pending_card(&self, user_id: Uuid) -> Result<Option<Card>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .iter()
            .rev()
            .find(|c| c.user_id == user_id && c.is_pending())
            .cloned())
    }

    async fn reserve_card(&self, card: &Card, max_cards: usize) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let held = state.cards.iter().filter(|c| c.user_id == card.user_id).count();
        if held >= max_cards {
            return Ok(false);
        }
        state.cards.push(card.clone());
        Ok(true)
    }

    async fn release_card(&self, card_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.transactions.iter().any(|t| t.card_id == Some(card_id)) {
            return Ok(false);
        }
        let before = state.cards.len();
        state
            .cards
            .retain(|c| c.id != card_id || c.card_code.is_some());
        Ok(state.cards.len() < before)
    }

    async fn record_funding_legs(
        &self,
        transactions: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.transactions.extend(transactions.iter().cloned());
        Ok(())
    }

    async fn set_card_creation_requested(
        &self,
        card_id: Uuid,
        expected: bool,
        requested: bool,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.cards.iter_mut().find(|c| {
            c.id == card_id && c.creation_requested == expected && c.card_code.is_none()
        }) {
            Some(card) => {
                card.creation_requested = requested;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn activate_card(
        &self,
        card_id: Uuid,
        activation: &CardActivation,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .cards
            .iter_mut()
            .find(|c| c.id == card_id && c.is_pending())
        {
            Some(card) => {
                card.card_code = Some(activation.card_code.clone());
                card.status = CardStatus::Active;
                card.balance = activation.balance;
                card.last4 = activation.last4.clone();
                card.expiry = activation.expiry.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_top_up(
        &self,
        card_id: Uuid,
        amount: Decimal,
        pending: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if let Some(card) = state.cards.iter_mut().find(|c| c.id == card_id) {
            card.balance += amount;
        }
        let Some(id) = pending else {
            return Ok(false);
        };
        match state
            .transactions
            .iter_mut()
            .find(|t| t.id == id && t.status == TransactionStatus::Pending)
        {
            Some(tx) => {
                tx.status = TransactionStatus::Success;
                tx.amount = amount;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition_card_status(
        &self,
        card_id: Uuid,
        from: CardStatus,
        to: CardStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .cards
            .iter_mut()
            .find(|c| c.id == card_id && c.status == from)
        {
            Some(card) => {
                card.status = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError> {
        self.state.write().await.transactions.push(tx.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<TransactionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn latest_pending_transaction(
        &self,
        card_id: Uuid,
        kind: TransactionKind,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .find(|t| {
                t.card_id == Some(card_id)
                    && t.kind == kind
                    && t.status == TransactionStatus::Pending
            })
            .cloned())
    }

    async fn pending_transactions(
        &self,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Pending)
            .collect();
        // Never checked first, then least recently checked
        pending.sort_by_key(|t| (state.ledger_checked.get(&t.id).copied(), t.created_at));
        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_ledger_checked(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.ledger_checked.insert(id, Utc::now());
        Ok(())
    }

    async fn settle_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        amount: Option<Decimal>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .transactions
            .iter_mut()
            .find(|t| t.id == id && t.status == TransactionStatus::Pending)
        {
            Some(tx) => {
                tx.status = status;
                if let Some(amount) = amount {
                    tx.amount = amount;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_webhook_event(
        &self,
        event: &WebhookEventRecord,
    ) -> Result<WebhookEventRecord, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .webhook_events
            .entry(event.idempotency_key.clone())
            .and_modify(|existing| existing.deliveries += 1)
            .or_insert_with(|| event.clone());
        Ok(stored.clone())
    }

    async fn claim_webhook_event(
        &self,
        idempotency_key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.webhook_events.get_mut(idempotency_key) {
            Some(event) if !event.processed => {
                let abandoned = event.claimed_at.map_or(true, |at| at < stale_before);
                if event.in_flight && !abandoned {
                    return Ok(false);
                }
                event.in_flight = true;
                event.claimed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_webhook_effect_applied(&self, idempotency_key: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(event) = state.webhook_events.get_mut(idempotency_key) {
            event.effect_applied = true;
        }
        Ok(())
    }

    async fn finish_webhook_event(
        &self,
        idempotency_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(event) = state.webhook_events.get_mut(idempotency_key) {
            event.in_flight = false;
            event.claimed_at = None;
            event.processed = error.is_none();
            event.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError> {
        self.state.write().await.referrals.push(referral.clone());
        Ok(())
    }

    async fn referral_for(&self, referred_id: Uuid) -> Result<Option<Referral>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .referrals
            .iter()
            .find(|r| r.referred_id == referred_id)
            .cloned())
    }

    async fn attach_referral_card(
        &self,
        referred_id: Uuid,
        card_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state
            .referrals
            .iter_mut()
            .find(|r| r.referred_id == referred_id && r.card_id.is_none())
        {
            Some(referral) => {
                referral.card_id = Some(card_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn credit_referral(
        &self,
        card_id: Uuid,
        reward: Decimal,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.write().await;
        let referrer = match state
            .referrals
            .iter_mut()
            .find(|r| r.card_id == Some(card_id) && !r.credited)
        {
            Some(referral) => {
                referral.credited = true;
                referral.referrer_id
            }
            None => return Ok(None),
        };

        let earnings = state
            .earnings
            .entry(referrer)
            .or_insert_with(|| ReferralEarnings::empty(referrer));
        earnings.weekly += reward;
        earnings.lifetime += reward;
        Ok(Some(referrer))
    }

    async fn earnings(&self, user_id: Uuid) -> Result<ReferralEarnings, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .earnings
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| ReferralEarnings::empty(user_id)))
    }

    async fn reset_weekly_earnings(
        &self,
        user_id: Uuid,
        expected: Decimal,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.earnings.get_mut(&user_id) {
            Some(earnings) if earnings.weekly == expected => {
                earnings.weekly = Decimal::ZERO;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore_weekly_earnings(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(earnings) = state.earnings.get_mut(&user_id) {
            earnings.weekly += amount;
        }
        Ok(())
    }
}
