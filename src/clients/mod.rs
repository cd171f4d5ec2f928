//! Gateways to the services the backend orchestrates but does not own.
//!
//! Each service sits behind a trait so workflows receive explicit handles and
//! tests can substitute fakes.

pub mod issuer;
pub mod ledger;
pub mod price;
pub mod quote;
pub mod retry;

use std::sync::Arc;

use issuer::CardIssuer;
use ledger::LedgerClient;
use price::PriceFeed;
use quote::QuoteBroker;

/// The external collaborators shared by the orchestrator and reconciler.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub quotes: Arc<dyn QuoteBroker>,
    pub issuer: Arc<dyn CardIssuer>,
    pub prices: Arc<dyn PriceFeed>,
}
