// Background watcher that fails pending transactions the ledger rejected

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clients::ledger::LedgerClient;
use crate::database::Store;
use crate::error::FundingError;
use crate::models::TransactionStatus;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const BATCH_SIZE: i64 = 50;

pub struct LedgerWatcher {
    store: Arc<dyn Store>,
    ledger: Arc<dyn LedgerClient>,
}

impl LedgerWatcher {
    pub fn new(store: Arc<dyn Store>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self { store, ledger }
    }

    pub async fn run(&self) {
        info!("Starting ledger watcher");
        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(failed) => info!("Marked {} pending transactions failed", failed),
                Err(e) => error!("Ledger sweep failed: {}", e),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One pass over the pending transactions checked least recently. Only
    /// ledger-failed transactions are settled here; successes wait for the
    /// issuer webhook. Every visited row goes to the back of the rotation, so
    /// a backlog of committed rows cannot hide newer rejections.
    pub async fn sweep(&self) -> Result<usize, FundingError> {
        let mut failed = 0;
        for tx in self.store.pending_transactions(BATCH_SIZE).await? {
            if !tx.hash.is_empty() {
                match self.ledger.transaction_status(&tx.hash).await {
                    Ok(status) if status.is_failed() => {
                        if self
                            .store
                            .settle_transaction(tx.id, TransactionStatus::Failed, None)
                            .await?
                        {
                            warn!(
                                "{} transaction {} ({}) failed on ledger: {}",
                                tx.kind.as_str(),
                                tx.id,
                                tx.hash,
                                status.as_str()
                            );
                            failed += 1;
                            continue;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Ledger status for {} unavailable: {}", tx.hash, e),
                }
            }
            self.store.mark_ledger_checked(tx.id).await?;
        }
        Ok(failed)
    }
}
