// Card Funding Backend Server
// Funding workflows, issuer webhook reconciliation and a ledger watcher

use anyhow::Result;
use card_funding_backend::{
    api,
    clients::{
        issuer::HttpCardIssuer, ledger::HttpLedgerClient, price::HttpPriceFeed,
        quote::HttpQuoteBroker, Collaborators,
    },
    config::Config,
    database::{PgStore, Store},
    memory::MemoryStore,
    sweeper::LedgerWatcher,
    vault::Vault,
    AppState,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    // Initialize logging
    let filter = EnvFilter::from_default_env()
        .add_directive("card_funding_backend=info".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("tower_http=info".parse()?);
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .with_env_filter(filter)
            .init();
    }

    info!("Starting Card Funding Backend");
    info!("Configuration:");
    info!("  Ledger node: {}", config.ledger_url);
    info!("  Quote service: {}", config.quote_url);
    info!("  Card issuer: {}", config.issuer_url);
    info!(
        "  Value token: {} ({})",
        config.value_token.symbol, config.value_token.resource
    );
    info!(
        "  Fee token: {} ({})",
        config.fee_token.symbol, config.fee_token.resource
    );
    info!("  Server Port: {}", config.port);

    // Initialize storage
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, using in-memory store; nothing will persist");
            Arc::new(MemoryStore::new())
        }
    };

    let vault = Arc::new(Vault::from_hex(&config.vault_key)?);
    let collaborators = Collaborators {
        ledger: Arc::new(HttpLedgerClient::new(config.ledger_url.clone())),
        quotes: Arc::new(HttpQuoteBroker::new(
            config.quote_url.clone(),
            config.value_token.resource.clone(),
            config.destination_token.clone(),
            config.slippage_bps,
        )),
        issuer: Arc::new(HttpCardIssuer::new(
            config.issuer_url.clone(),
            config.issuer_app_id.clone(),
            config.issuer_business_id.clone(),
            config.issuer_api_key.clone(),
        )),
        prices: Arc::new(HttpPriceFeed::new(config.price_url.clone())),
    };

    // Create app state
    let state = Arc::new(AppState::new(
        store.clone(),
        vault,
        &collaborators,
        config.workflow_settings(),
    ));

    // Start ledger watcher in background
    let watcher = LedgerWatcher::new(store, collaborators.ledger.clone());
    tokio::spawn(async move {
        watcher.run().await;
    });

    let app = api::router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Card Funding Backend listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}
