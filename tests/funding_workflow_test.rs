mod common;

use common::*;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use card_funding_backend::database::Store;
use card_funding_backend::clients::ledger::LedgerTxStatus;
use card_funding_backend::error::FundingError;
use card_funding_backend::models::{
    CardStatus, CreateCardRequest, SendRequest, TransactionKind, TransactionStatus, WorkflowStage,
};

fn card_request(amount: rust_decimal::Decimal) -> CreateCardRequest {
    CreateCardRequest {
        amount,
        form: sample_form(),
    }
}

#[tokio::test]
async fn test_amounts_below_minimum_create_nothing() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(1000), dec!(500)).await;

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(14.99)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Validation(_)));

    let card = h.active_card(user, "CARD-1").await;
    let before = h.store.transactions().await.len();
    let err = h
        .orchestrator()
        .top_up(user, card.id, dec!(9.99))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Validation(_)));
    assert_eq!(h.store.transactions().await.len(), before);
}

#[tokio::test]
async fn test_create_card_end_to_end() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(20), dec!(100)).await;

    let receipt = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap();
    assert_eq!(receipt.stage, WorkflowStage::PendingConfirmation);

    let txs = h.store.transactions().await;
    assert_eq!(txs.len(), 2);
    let bridge = txs
        .iter()
        .find(|t| t.kind == TransactionKind::Bridge)
        .unwrap();
    assert_eq!(bridge.amount, dec!(15));
    assert_eq!(bridge.status, TransactionStatus::Pending);
    let insurance = txs
        .iter()
        .find(|t| t.kind == TransactionKind::InsuranceFee)
        .unwrap();
    assert_eq!(insurance.amount, dec!(10));
    assert_eq!(insurance.status, TransactionStatus::Success);

    let cards = h.orchestrator().list_cards(user).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].status, CardStatus::Processing);
    assert!(cards[0].card_code.is_none());
    assert!(cards[0].form_snapshot.is_some());
    assert_eq!(Some(cards[0].id), receipt.card_id);

    // The issuer is never asked to create the card directly
    assert!(h.issuer.orders.lock().unwrap().is_empty());
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_card_limit() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(1000), dec!(500)).await;

    for _ in 0..3 {
        h.pending_card(user, dec!(15)).await;
    }
    // Three existing cards: the fourth still succeeds
    h.pending_card(user, dec!(15)).await;

    let submits = h.ledger.submits.load(Ordering::SeqCst);
    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::CardLimit { max: 4 }));
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), submits);
    assert_eq!(h.orchestrator().list_cards(user).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_insufficient_value_balance_makes_no_external_calls() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(14), dec!(100)).await;

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap_err();
    match err {
        FundingError::Precondition {
            asset,
            required,
            available,
        } => {
            assert_eq!(asset, "USDC");
            assert_eq!(required, dec!(15));
            assert_eq!(available, dec!(14));
        }
        other => panic!("expected precondition failure, got {:?}", other),
    }

    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
    assert_eq!(h.issuer.deposit_calls.load(Ordering::SeqCst), 0);
    assert!(h.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_insufficient_bridge_fee_is_rejected() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(59)).await;

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Precondition { ref asset, .. } if asset == "XRD"));
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expired_quote_is_requoted() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(20), dec!(100)).await;
    h.quotes.expired_first.store(1, Ordering::SeqCst);

    h.orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap();
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_quotes_that_keep_expiring_are_never_submitted() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(20), dec!(100)).await;
    h.quotes.expired_first.store(10, Ordering::SeqCst);

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::QuoteExpired(_)));
    assert!(err.is_retryable());
    // Initial quote plus two re-quotes
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
    assert!(h.store.transactions().await.is_empty());
    assert!(h.orchestrator().list_cards(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_high_value_operation_rechecks_fee_before_signing() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(1000), dec!(100)).await;
    // The precondition check sees the fee balance, the re-check does not
    h.ledger.drain_fee_after.store(1, Ordering::SeqCst);

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(600)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::FeeShortfall(_)));
    assert!(err.is_retryable());
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
    assert!(h.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_fee_shortfall_at_submission_is_retryable() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    *h.ledger.submit_error.lock().unwrap() = Some("lock_fee failed".into());

    let err = h
        .orchestrator()
        .send_funds(
            user,
            SendRequest {
                to_address: "account_friend".into(),
                amount: dec!(5),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::FeeShortfall(_)));
    assert!(h.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_top_up_requires_active_card() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.pending_card(user, dec!(15)).await;

    let err = h
        .orchestrator()
        .top_up(user, card.id, dec!(10))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Validation(_)));
}

#[tokio::test]
async fn test_top_up_records_pending_leg() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.active_card(user, "CARD-1").await;

    let receipt = h
        .orchestrator()
        .top_up(user, card.id, dec!(10))
        .await
        .unwrap();
    assert_eq!(receipt.stage, WorkflowStage::PendingConfirmation);
    assert_eq!(receipt.transactions.len(), 1);
    assert_eq!(receipt.transactions[0].kind, TransactionKind::TopUp);
    assert_eq!(receipt.transactions[0].status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_send_funds_is_final_on_submission() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(50), dec!(20)).await;

    let receipt = h
        .orchestrator()
        .send_funds(
            user,
            SendRequest {
                to_address: "account_friend".into(),
                amount: dec!(5),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.stage, WorkflowStage::Completed);
    assert_eq!(receipt.transactions[0].kind, TransactionKind::Send);
    assert_eq!(receipt.transactions[0].status, TransactionStatus::Success);
    assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_send_funds_needs_transfer_fee() {
    let h = Harness::new();
    // 0.5 USD at 0.05 is 10 fee tokens
    let user = h.user_with_balance(dec!(50), dec!(9)).await;

    let err = h
        .orchestrator()
        .send_funds(
            user,
            SendRequest {
                to_address: "account_friend".into(),
                amount: dec!(5),
            },
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, FundingError::Precondition { required, available, .. } if required == dec!(10) && available == dec!(9))
    );
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_wallet_is_not_found() {
    let h = Harness::new();
    let err = h
        .orchestrator()
        .create_card(Uuid::new_v4(), card_request(dec!(15)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::NotFound(_)));
}

#[tokio::test]
async fn test_freeze_card_of_another_user_is_not_found() {
    let h = Harness::new();
    let owner = h.user_with_balance(dec!(100), dec!(100)).await;
    let intruder = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.active_card(owner, "CARD-1").await;

    let err = h
        .orchestrator()
        .freeze_card(intruder, card.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::NotFound(_)));
    assert_eq!(h.issuer.freezes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_freeze_and_unfreeze() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.active_card(user, "CARD-1").await;
    h.issuer.freeze_failures.store(1, Ordering::SeqCst);

    let frozen = h.orchestrator().freeze_card(user, card.id).await.unwrap();
    assert_eq!(frozen.status, CardStatus::Frozen);
    // One transient failure, then success
    assert_eq!(h.issuer.freezes.load(Ordering::SeqCst), 2);

    let active = h.orchestrator().unfreeze_card(user, card.id).await.unwrap();
    assert_eq!(active.status, CardStatus::Active);
    assert_eq!(h.issuer.unfreezes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_issuer_retries_are_bounded() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.active_card(user, "CARD-1").await;
    h.issuer.freeze_failures.store(10, Ordering::SeqCst);

    let err = h
        .orchestrator()
        .freeze_card(user, card.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::UpstreamTransient(_)));
    // The retry budget is spent; the failure is final for this request
    assert!(!err.is_retryable());
    assert_eq!(h.issuer.freezes.load(Ordering::SeqCst), 3);

    let card = h.store.get_card(card.id).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Active);
}

#[tokio::test]
async fn test_card_details_come_from_issuer() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(100), dec!(100)).await;
    let card = h.active_card(user, "CARD-7").await;

    let details = h.orchestrator().card_details(user, card.id).await.unwrap();
    assert_eq!(details.card_code, "CARD-7");
    assert!(h
        .orchestrator()
        .card_transactions(user, card.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_transaction_status_is_owner_scoped() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(20), dec!(100)).await;
    let other = h.user_with_balance(dec!(20), dec!(100)).await;
    let receipt = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap();
    let bridge = receipt
        .transactions
        .iter()
        .find(|t| t.kind == TransactionKind::Bridge)
        .unwrap();
    h.ledger
        .set_status(&bridge.hash, LedgerTxStatus::CommittedSuccess);

    let view = h
        .orchestrator()
        .transaction_status(user, bridge.id)
        .await
        .unwrap();
    assert_eq!(view.record.status, TransactionStatus::Pending);
    assert_eq!(view.ledger_status.as_deref(), Some("committed_success"));

    let err = h
        .orchestrator()
        .transaction_status(other, bridge.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::NotFound(_)));
}

#[tokio::test]
async fn test_balances_are_reported_in_whole_tokens() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(20.5), dec!(75)).await;

    let balances = h.orchestrator().balances(user).await.unwrap();
    assert_eq!(balances.value.symbol, "USDC");
    assert_eq!(balances.value.amount, dec!(20.5));
    assert_eq!(balances.fee.amount, dec!(75));
}

#[tokio::test]
async fn test_concurrent_card_requests_cannot_pass_the_limit() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(1000), dec!(500)).await;
    for _ in 0..3 {
        h.pending_card(user, dec!(15)).await;
    }
    let submits = h.ledger.submits.load(Ordering::SeqCst);

    let (a, b) = tokio::join!(
        h.orchestrator().create_card(user, card_request(dec!(15))),
        h.orchestrator().create_card(user, card_request(dec!(15))),
    );
    let limited = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(FundingError::CardLimit { max: 4 })))
        .count();
    assert_eq!(limited, 1);
    assert!(a.is_ok() || b.is_ok());

    assert_eq!(h.orchestrator().list_cards(user).await.unwrap().len(), 4);
    // Only the winner's bridge and insurance legs reached the ledger
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), submits + 2);
}

#[tokio::test]
async fn test_failed_funding_releases_the_card_slot() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(1000), dec!(500)).await;
    for _ in 0..3 {
        h.pending_card(user, dec!(15)).await;
    }
    h.quotes.expired_first.store(10, Ordering::SeqCst);
    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::QuoteExpired(_)));
    assert_eq!(h.orchestrator().list_cards(user).await.unwrap().len(), 3);

    h.quotes.expired_first.store(0, Ordering::SeqCst);
    h.orchestrator()
        .create_card(user, card_request(dec!(15)))
        .await
        .unwrap();
    assert_eq!(h.orchestrator().list_cards(user).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_send_below_token_precision_is_rejected() {
    let h = Harness::new();
    let user = h.user_with_balance(dec!(50), dec!(20)).await;

    let err = h
        .orchestrator()
        .send_funds(
            user,
            SendRequest {
                to_address: "account_friend".into(),
                amount: dec!(0.0000001),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Validation(ref m) if m.contains("decimals")));
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
    assert!(h.store.transactions().await.is_empty());

    let err = h
        .orchestrator()
        .create_card(user, card_request(dec!(15.0000001)))
        .await
        .unwrap_err();
    assert!(matches!(err, FundingError::Validation(_)));
    assert_eq!(h.issuer.deposit_calls.load(Ordering::SeqCst), 0);
}
