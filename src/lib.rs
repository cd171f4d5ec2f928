// Card funding backend
// Orchestrates custodial wallet transfers into card-issuer deposit addresses
// and reconciles the issuer's asynchronous webhooks.

pub mod api;
pub mod balance;
pub mod clients;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod manifest;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod reconciler;
pub mod signer;
pub mod sweeper;
pub mod tokens;
pub mod vault;

use std::sync::Arc;

use clients::{ledger::LedgerClient, Collaborators};
use config::WorkflowSettings;
use database::Store;
use orchestrator::FundingOrchestrator;
use reconciler::Reconciler;
use vault::Vault;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<dyn LedgerClient>,
    pub orchestrator: FundingOrchestrator,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        collaborators: &Collaborators,
        settings: WorkflowSettings,
    ) -> Self {
        let reconciler = Reconciler::new(
            store.clone(),
            collaborators.issuer.clone(),
            settings.policy.clone(),
        )
        .with_claim_lease(settings.webhook_claim_lease);
        Self {
            ledger: collaborators.ledger.clone(),
            orchestrator: FundingOrchestrator::new(store.clone(), vault, collaborators, settings),
            reconciler: Arc::new(reconciler),
            store,
        }
    }
}
