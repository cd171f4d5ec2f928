// HTTP surface: user-facing funding routes and the issuer webhook

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::clients::issuer::{IssuerCard, IssuerCardTransaction};
use crate::error::FundingError;
use crate::models::{
    AccountBalances, Card, CreateCardRequest, FundingReceipt, SendRequest, TopUpRequest,
    TransactionView,
};
use crate::reconciler::WebhookOutcome;
use crate::AppState;

/// Header the upstream gateway sets after authenticating the caller.
pub const USER_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct CallerId(pub Uuid);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = FundingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(CallerId)
            .ok_or(FundingError::Unauthenticated)
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, FundingError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| FundingError::Validation(e.body_text()))
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/cards", post(create_card).get(list_cards))
        .route("/api/cards/:id", get(card_details))
        .route("/api/cards/:id/transactions", get(card_transactions))
        .route("/api/cards/:id/top-up", post(top_up))
        .route("/api/cards/:id/freeze", post(freeze_card))
        .route("/api/cards/:id/unfreeze", post(unfreeze_card))
        .route("/api/send", post(send_funds))
        .route("/api/referrals/claim", post(claim_referral_earnings))
        .route("/api/transactions/:id", get(transaction_status))
        .route("/api/balances", get(balances))
        .route("/webhooks/issuer", post(issuer_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.ping().await.is_ok();
    let ledger_ok = state.ledger.current_epoch().await.is_ok();

    let status = if store_ok && ledger_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "degraded" },
            "store": store_ok,
            "ledger": ledger_ok,
        })),
    )
}

// ============================================================================
// CARDS
// ============================================================================

pub async fn create_card(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    payload: Result<Json<CreateCardRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FundingReceipt>), FundingError> {
    let request = body(payload)?;
    info!("Card creation requested by {} for {}", user_id, request.amount);
    let receipt = state.orchestrator.create_card(user_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn list_cards(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> Result<Json<Vec<Card>>, FundingError> {
    Ok(Json(state.orchestrator.list_cards(user_id).await?))
}

pub async fn card_details(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(card_id): Path<Uuid>,
) -> Result<Json<IssuerCard>, FundingError> {
    Ok(Json(state.orchestrator.card_details(user_id, card_id).await?))
}

pub async fn card_transactions(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(card_id): Path<Uuid>,
) -> Result<Json<Vec<IssuerCardTransaction>>, FundingError> {
    Ok(Json(
        state
            .orchestrator
            .card_transactions(user_id, card_id)
            .await?,
    ))
}

pub async fn top_up(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(card_id): Path<Uuid>,
    payload: Result<Json<TopUpRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FundingReceipt>), FundingError> {
    let request = body(payload)?;
    let receipt = state
        .orchestrator
        .top_up(user_id, card_id, request.amount)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn freeze_card(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(card_id): Path<Uuid>,
) -> Result<Json<Card>, FundingError> {
    Ok(Json(state.orchestrator.freeze_card(user_id, card_id).await?))
}

pub async fn unfreeze_card(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(card_id): Path<Uuid>,
) -> Result<Json<Card>, FundingError> {
    Ok(Json(
        state.orchestrator.unfreeze_card(user_id, card_id).await?,
    ))
}

// ============================================================================
// TRANSFERS AND QUERIES
// ============================================================================

pub async fn send_funds(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<FundingReceipt>, FundingError> {
    let request = body(payload)?;
    Ok(Json(state.orchestrator.send_funds(user_id, request).await?))
}

pub async fn claim_referral_earnings(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> Result<Json<FundingReceipt>, FundingError> {
    Ok(Json(
        state
            .orchestrator
            .claim_referral_earnings(user_id)
            .await?,
    ))
}

pub async fn transaction_status(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<TransactionView>, FundingError> {
    Ok(Json(
        state
            .orchestrator
            .transaction_status(user_id, transaction_id)
            .await?,
    ))
}

pub async fn balances(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> Result<Json<AccountBalances>, FundingError> {
    Ok(Json(state.orchestrator.balances(user_id).await?))
}

// ============================================================================
// WEBHOOK
// ============================================================================

/// Answers 200 once the delivery is recorded, whatever the processing
/// outcome. Only a storage failure asks the partner to redeliver. Processing
/// runs on its own task so a partner hanging up does not abandon it halfway.
pub async fn issuer_webhook(
    State(state): State<Arc<AppState>>,
    raw: String,
) -> Result<Json<WebhookOutcome>, FundingError> {
    let reconciler = state.reconciler.clone();
    let outcome = tokio::spawn(async move { reconciler.handle(&raw).await })
        .await
        .map_err(|e| FundingError::Reconciliation(format!("webhook task aborted: {}", e)))??;
    Ok(Json(outcome))
}
