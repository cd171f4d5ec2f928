// Database layer for the funding backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    Pool, Postgres, Row,
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    Card, CardActivation, CardForm, CardStatus, Referral, ReferralEarnings, TransactionKind,
    TransactionRecord, TransactionStatus, Wallet, WebhookEventRecord,
};

pub type DbPool = Pool<Postgres>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Storage port shared by the orchestrator (creates rows) and the reconciler
/// (finalises them). Every method returning `bool` is a conditional update
/// that reports whether the row actually moved.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), StoreError>;
    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError>;

    async fn count_cards(&self, user_id: Uuid) -> Result<i64, StoreError>;
    async fn count_active_cards(&self, user_id: Uuid) -> Result<i64, StoreError>;
    async fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StoreError>;
    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>, StoreError>;
    /// Newest card provisioned against a deposit address.
    async fn find_card_by_deposit_address(
        &self,
        deposit_address: &str,
    ) -> Result<Option<Card>, StoreError>;
    /// Newest card of the user still waiting for its card code.
    async fn newest_pending_card(&self, user_id: Uuid) -> Result<Option<Card>, StoreError>;
    /// Inserts a pending card unless the user already holds `max_cards`.
    /// The count and the insert are atomic per user.
    async fn reserve_card(&self, card: &Card, max_cards: usize) -> Result<bool, StoreError>;
    /// Drops a reserved card that never got a funding leg or a card code.
    async fn release_card(&self, card_id: Uuid) -> Result<bool, StoreError>;
    /// Persists the transaction legs of one funding operation atomically.
    async fn record_funding_legs(&self, transactions: &[TransactionRecord])
        -> Result<(), StoreError>;
    async fn set_card_creation_requested(
        &self,
        card_id: Uuid,
        expected: bool,
        requested: bool,
    ) -> Result<bool, StoreError>;
    async fn activate_card(
        &self,
        card_id: Uuid,
        activation: &CardActivation,
    ) -> Result<bool, StoreError>;
    /// Credits a settled top-up to the card and, when one was recorded,
    /// settles its pending transaction in the same write.
    async fn apply_top_up(
        &self,
        card_id: Uuid,
        amount: Decimal,
        pending: Option<Uuid>,
    ) -> Result<bool, StoreError>;
    async fn transition_card_status(
        &self,
        card_id: Uuid,
        from: CardStatus,
        to: CardStatus,
    ) -> Result<bool, StoreError>;

    async fn insert_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError>;
    async fn get_transaction(&self, id: Uuid) -> Result<Option<TransactionRecord>, StoreError>;
    async fn latest_pending_transaction(
        &self,
        card_id: Uuid,
        kind: TransactionKind,
    ) -> Result<Option<TransactionRecord>, StoreError>;
    /// Pending transactions, least recently checked against the ledger first.
    async fn pending_transactions(&self, limit: i64)
        -> Result<Vec<TransactionRecord>, StoreError>;
    async fn mark_ledger_checked(&self, id: Uuid) -> Result<(), StoreError>;
    /// Moves a transaction out of `pending`; a no-op if someone else already did.
    async fn settle_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        amount: Option<Decimal>,
    ) -> Result<bool, StoreError>;

    /// Appends the event, or counts another delivery of an already known one.
    /// Returns the stored row either way.
    async fn record_webhook_event(
        &self,
        event: &WebhookEventRecord,
    ) -> Result<WebhookEventRecord, StoreError>;
    /// Takes the processing lease on an unprocessed event. A lease taken
    /// before `stale_before` is considered abandoned and can be taken over.
    async fn claim_webhook_event(
        &self,
        idempotency_key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Notes that the event's issuer side effect went through.
    async fn mark_webhook_effect_applied(&self, idempotency_key: &str) -> Result<(), StoreError>;
    async fn finish_webhook_event(
        &self,
        idempotency_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError>;
    async fn referral_for(&self, referred_id: Uuid) -> Result<Option<Referral>, StoreError>;
    async fn attach_referral_card(
        &self,
        referred_id: Uuid,
        card_id: Uuid,
    ) -> Result<bool, StoreError>;
    /// Credits the referrer of `card_id` once; returns the referrer if credited.
    async fn credit_referral(
        &self,
        card_id: Uuid,
        reward: Decimal,
    ) -> Result<Option<Uuid>, StoreError>;
    async fn earnings(&self, user_id: Uuid) -> Result<ReferralEarnings, StoreError>;
    async fn reset_weekly_earnings(
        &self,
        user_id: Uuid,
        expected: Decimal,
    ) -> Result<bool, StoreError>;
    async fn restore_weekly_earnings(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    /// Initialize database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }
}

const CARD_COLUMNS: &str = "id, user_id, deposit_address, card_code, status, balance, \
     form_snapshot, last4, expiry, creation_requested, created_at";

const TX_COLUMNS: &str =
    "id, user_id, card_id, kind, amount, status, hash, description, created_at";

const EVENT_COLUMNS: &str = "id, idempotency_key, event_type, payload, processed, in_flight, \
     claimed_at, effect_applied, error, deliveries, received_at";

fn card_from_row(row: &PgRow) -> Result<Card, StoreError> {
    let status: String = row.try_get("status")?;
    let form: Option<Json<CardForm>> = row.try_get("form_snapshot")?;
    Ok(Card {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        deposit_address: row.try_get("deposit_address")?,
        card_code: row.try_get("card_code")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        balance: row.try_get("balance")?,
        form_snapshot: form.map(|f| f.0),
        last4: row.try_get("last4")?,
        expiry: row.try_get("expiry")?,
        creation_requested: row.try_get("creation_requested")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(TransactionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        card_id: row.try_get("card_id")?,
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        amount: row.try_get("amount")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        hash: row.try_get("hash")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<WebhookEventRecord, StoreError> {
    Ok(WebhookEventRecord {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        processed: row.try_get("processed")?,
        in_flight: row.try_get("in_flight")?,
        claimed_at: row.try_get("claimed_at")?,
        effect_applied: row.try_get("effect_applied")?,
        error: row.try_get("error")?,
        deliveries: row.try_get("deliveries")?,
        received_at: row.try_get("received_at")?,
    })
}

async fn insert_card_with<'e, E>(executor: E, card: &Card) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO cards (
            id, user_id, deposit_address, card_code, status, balance,
            form_snapshot, last4, expiry, creation_requested, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(card.id)
    .bind(card.user_id)
    .bind(&card.deposit_address)
    .bind(&card.card_code)
    .bind(card.status.as_str())
    .bind(card.balance)
    .bind(card.form_snapshot.as_ref().map(Json))
    .bind(&card.last4)
    .bind(&card.expiry)
    .bind(card.creation_requested)
    .bind(card.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_transaction_with<'e, E>(executor: E, tx: &TransactionRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, user_id, card_id, kind, amount, status, hash, description, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(tx.id)
    .bind(tx.user_id)
    .bind(tx.card_id)
    .bind(tx.kind.as_str())
    .bind(tx.amount)
    .bind(tx.status.as_str())
    .bind(&tx.hash)
    .bind(&tx.description)
    .bind(tx.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO wallets (user_id, address, encrypted_key) VALUES ($1, $2, $3)",
        )
        .bind(wallet.user_id)
        .bind(&wallet.address)
        .bind(&wallet.encrypted_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, address, encrypted_key FROM wallets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Wallet, StoreError> {
            Ok(Wallet {
                user_id: row.try_get("user_id")?,
                address: row.try_get("address")?,
                encrypted_key: row.try_get("encrypted_key")?,
            })
        })
        .transpose()
    }

    async fn count_cards(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cards WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_active_cards(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM cards WHERE user_id = $1 AND card_code IS NOT NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cards WHERE user_id = $1 ORDER BY created_at DESC",
            CARD_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(card_from_row).collect()
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM cards WHERE id = $1", CARD_COLUMNS))
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn find_card_by_deposit_address(
        &self,
        deposit_address: &str,
    ) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM cards WHERE deposit_address = $1 ORDER BY created_at DESC LIMIT 1",
            CARD_COLUMNS
        ))
        .bind(deposit_address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn newest_pending_card(&self, user_id: Uuid) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM cards \
             WHERE user_id = $1 AND status = 'processing' AND card_code IS NULL \
             ORDER BY created_at DESC LIMIT 1",
            CARD_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn reserve_card(&self, card: &Card, max_cards: usize) -> Result<bool, StoreError> {
        let mut db_tx = self.pool.begin().await?;

        // Serialises card creation per user
        sqlx::query("SELECT user_id FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(card.user_id)
            .fetch_optional(&mut *db_tx)
            .await?;
        let held = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cards WHERE user_id = $1")
            .bind(card.user_id)
            .fetch_one(&mut *db_tx)
            .await?;
        if held >= max_cards as i64 {
            db_tx.rollback().await?;
            return Ok(false);
        }

        insert_card_with(&mut *db_tx, card).await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn release_card(&self, card_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM cards WHERE id = $1 AND card_code IS NULL \
             AND NOT EXISTS (SELECT 1 FROM transactions WHERE card_id = $1)",
        )
        .bind(card_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_funding_legs(
        &self,
        transactions: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        let mut db_tx = self.pool.begin().await?;
        for tx in transactions {
            insert_transaction_with(&mut *db_tx, tx).await?;
        }
        db_tx.commit().await?;
        Ok(())
    }

    async fn set_card_creation_requested(
        &self,
        card_id: Uuid,
        expected: bool,
        requested: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cards SET creation_requested = $3 \
             WHERE id = $1 AND creation_requested = $2 AND card_code IS NULL",
        )
        .bind(card_id)
        .bind(expected)
        .bind(requested)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn activate_card(
        &self,
        card_id: Uuid,
        activation: &CardActivation,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cards
            SET card_code = $2, status = 'active', balance = $3, last4 = $4, expiry = $5
            WHERE id = $1 AND status = 'processing' AND card_code IS NULL
            "#,
        )
        .bind(card_id)
        .bind(&activation.card_code)
        .bind(activation.balance)
        .bind(&activation.last4)
        .bind(&activation.expiry)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_top_up(
        &self,
        card_id: Uuid,
        amount: Decimal,
        pending: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query("UPDATE cards SET balance = balance + $2 WHERE id = $1")
            .bind(card_id)
            .bind(amount)
            .execute(&mut *db_tx)
            .await?;

        let settled = match pending {
            Some(id) => {
                sqlx::query(
                    "UPDATE transactions SET status = 'success', amount = $2 \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(id)
                .bind(amount)
                .execute(&mut *db_tx)
                .await?
                .rows_affected()
                    == 1
            }
            None => false,
        };

        db_tx.commit().await?;
        Ok(settled)
    }

    async fn transition_card_status(
        &self,
        card_id: Uuid,
        from: CardStatus,
        to: CardStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE cards SET status = $3 WHERE id = $1 AND status = $2")
            .bind(card_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError> {
        insert_transaction_with(&self.pool, tx).await
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn latest_pending_transaction(
        &self,
        card_id: Uuid,
        kind: TransactionKind,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions \
             WHERE card_id = $1 AND kind = $2 AND status = 'pending' \
             ORDER BY created_at DESC LIMIT 1",
            TX_COLUMNS
        ))
        .bind(card_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn pending_transactions(
        &self,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE status = 'pending' \
             ORDER BY ledger_checked_at ASC NULLS FIRST, created_at ASC LIMIT $1",
            TX_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn mark_ledger_checked(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE transactions SET ledger_checked_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settle_transaction(
        &self,
        id: Uuid,
        status: TransactionStatus,
        amount: Option<Decimal>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE transactions SET status = $2, amount = COALESCE($3, amount) \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_webhook_event(
        &self,
        event: &WebhookEventRecord,
    ) -> Result<WebhookEventRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_events (
                id, idempotency_key, event_type, payload, processed, in_flight,
                claimed_at, effect_applied, error, deliveries, received_at
            ) VALUES ($1, $2, $3, $4, FALSE, FALSE, NULL, FALSE, NULL, 1, $5)
            ON CONFLICT (idempotency_key)
                DO UPDATE SET deliveries = webhook_events.deliveries + 1
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(event.id)
        .bind(&event.idempotency_key)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .fetch_one(&self.pool)
        .await?;
        event_from_row(&row)
    }

    async fn claim_webhook_event(
        &self,
        idempotency_key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_events SET in_flight = TRUE, claimed_at = NOW() \
             WHERE idempotency_key = $1 AND processed = FALSE \
             AND (in_flight = FALSE OR claimed_at IS NULL OR claimed_at < $2)",
        )
        .bind(idempotency_key)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_webhook_effect_applied(&self, idempotency_key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_events SET effect_applied = TRUE WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_webhook_event(
        &self,
        idempotency_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET in_flight = FALSE, claimed_at = NULL, processed = $2, error = $3 \
             WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .bind(error.is_none())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO referrals (referrer_id, referred_id, card_id, credited) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(referral.referrer_id)
        .bind(referral.referred_id)
        .bind(referral.card_id)
        .bind(referral.credited)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn referral_for(&self, referred_id: Uuid) -> Result<Option<Referral>, StoreError> {
        let row = sqlx::query(
            "SELECT referrer_id, referred_id, card_id, credited FROM referrals \
             WHERE referred_id = $1",
        )
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Referral, StoreError> {
            Ok(Referral {
                referrer_id: row.try_get("referrer_id")?,
                referred_id: row.try_get("referred_id")?,
                card_id: row.try_get("card_id")?,
                credited: row.try_get("credited")?,
            })
        })
        .transpose()
    }

    async fn attach_referral_card(
        &self,
        referred_id: Uuid,
        card_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE referrals SET card_id = $2 WHERE referred_id = $1 AND card_id IS NULL",
        )
        .bind(referred_id)
        .bind(card_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn credit_referral(
        &self,
        card_id: Uuid,
        reward: Decimal,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut db_tx = self.pool.begin().await?;

        let referrer = sqlx::query_scalar::<_, Uuid>(
            "UPDATE referrals SET credited = TRUE \
             WHERE card_id = $1 AND credited = FALSE RETURNING referrer_id",
        )
        .bind(card_id)
        .fetch_optional(&mut *db_tx)
        .await?;

        if let Some(referrer_id) = referrer {
            sqlx::query(
                r#"
                INSERT INTO referral_earnings (user_id, weekly, lifetime)
                VALUES ($1, $2, $2)
                ON CONFLICT (user_id) DO UPDATE
                    SET weekly = referral_earnings.weekly + $2,
                        lifetime = referral_earnings.lifetime + $2
                "#,
            )
            .bind(referrer_id)
            .bind(reward)
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(referrer)
    }

    async fn earnings(&self, user_id: Uuid) -> Result<ReferralEarnings, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, weekly, lifetime FROM referral_earnings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ReferralEarnings {
                user_id: row.try_get("user_id")?,
                weekly: row.try_get("weekly")?,
                lifetime: row.try_get("lifetime")?,
            }),
            None => Ok(ReferralEarnings::empty(user_id)),
        }
    }

    async fn reset_weekly_earnings(
        &self,
        user_id: Uuid,
        expected: Decimal,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE referral_earnings SET weekly = 0 WHERE user_id = $1 AND weekly = $2",
        )
        .bind(user_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn restore_weekly_earnings(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE referral_earnings SET weekly = weekly + $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
