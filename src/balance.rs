//! Balance preconditions checked before any irreversible action.
//!
//! Checks are advisory: balances can move between the check and the
//! submission. The orchestrator re-checks the fee token right before signing
//! high-value operations.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::clients::{ledger::LedgerClient, price::PriceFeed};
use crate::config::FundingPolicy;
use crate::error::FundingError;
use crate::tokens::TokenSpec;

const PRICE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Value and fee token holdings of one address, in whole tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalletBalances {
    pub value: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceCheck {
    pub asset: String,
    pub has_enough: bool,
    pub balance: Decimal,
    pub required: Decimal,
}

impl BalanceCheck {
    fn evaluate(asset: &str, balance: Decimal, required: Decimal) -> Self {
        Self {
            asset: asset.to_string(),
            has_enough: balance >= required,
            balance,
            required,
        }
    }

    pub fn shortfall(&self) -> Decimal {
        (self.required - self.balance).max(Decimal::ZERO)
    }

    pub fn ensure(&self) -> Result<(), FundingError> {
        if self.has_enough {
            Ok(())
        } else {
            Err(FundingError::Precondition {
                asset: self.asset.clone(),
                required: self.required,
                available: self.balance,
            })
        }
    }
}

pub struct BalanceChecker {
    ledger: Arc<dyn LedgerClient>,
    prices: Arc<dyn PriceFeed>,
    value_token: TokenSpec,
    fee_token: TokenSpec,
    min_transfer_fee_usd: Decimal,
    bridge_fee_native: Decimal,
    fallback_price: Decimal,
    price_cache: Mutex<Option<(Instant, Decimal)>>,
}

impl BalanceChecker {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        prices: Arc<dyn PriceFeed>,
        value_token: TokenSpec,
        fee_token: TokenSpec,
        policy: &FundingPolicy,
    ) -> Self {
        Self {
            ledger,
            prices,
            value_token,
            fee_token,
            min_transfer_fee_usd: policy.min_transfer_fee_usd,
            bridge_fee_native: policy.bridge_fee_native,
            fallback_price: policy.fallback_fee_token_price,
            price_cache: Mutex::new(None),
        }
    }

    pub async fn balances(&self, address: &str) -> Result<WalletBalances, FundingError> {
        let vaults = self.ledger.balances(address).await?;

        let mut balances = WalletBalances {
            value: Decimal::ZERO,
            fee: Decimal::ZERO,
        };
        for vault in &vaults {
            let token = if vault.resource == self.value_token.resource {
                &self.value_token
            } else if vault.resource == self.fee_token.resource {
                &self.fee_token
            } else {
                continue;
            };
            let amount = token.from_native(&vault.amount).map_err(|e| {
                FundingError::UpstreamFatal(format!("ledger balance for {}: {}", token.symbol, e))
            })?;
            if token.resource == self.value_token.resource {
                balances.value += amount;
            } else {
                balances.fee += amount;
            }
        }
        Ok(balances)
    }

    pub fn check_value(&self, balances: &WalletBalances, required: Decimal) -> BalanceCheck {
        BalanceCheck::evaluate(&self.value_token.symbol, balances.value, required)
    }

    /// Fee sufficiency for a same-ledger transfer: a USD minimum converted to
    /// fee tokens at the current price.
    pub async fn check_transfer_fee(&self, balances: &WalletBalances) -> BalanceCheck {
        let price = self.fee_token_price().await;
        let required = (self.min_transfer_fee_usd / price).round_dp(self.fee_token.decimals);
        BalanceCheck::evaluate(&self.fee_token.symbol, balances.fee, required)
    }

    /// Fee sufficiency for a cross-ledger bridge: a fixed native amount.
    pub fn check_bridge_fee(&self, balances: &WalletBalances) -> BalanceCheck {
        BalanceCheck::evaluate(&self.fee_token.symbol, balances.fee, self.bridge_fee_native)
    }

    /// Cached price, refreshed at most once per TTL. Falls back to the
    /// configured price when the feed is down so transfers keep flowing.
    pub async fn fee_token_price(&self) -> Decimal {
        let mut cache = self.price_cache.lock().await;
        if let Some((fetched_at, price)) = *cache {
            if fetched_at.elapsed() < PRICE_CACHE_TTL {
                return price;
            }
        }

        match self.prices.fee_token_usd().await {
            Ok(price) if price > Decimal::ZERO => {
                *cache = Some((Instant::now(), price));
                price
            }
            Ok(price) => {
                warn!(
                    "Price feed returned {}, using fallback {} USD",
                    price, self.fallback_price
                );
                self.fallback_price
            }
            Err(e) => {
                warn!(
                    "Price feed unavailable ({}), using fallback {} USD",
                    e, self.fallback_price
                );
                self.fallback_price
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ledger::{LedgerError, LedgerTxStatus, VaultBalance};
    use crate::clients::price::PriceError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLedger(Vec<VaultBalance>);

    #[async_trait]
    impl LedgerClient for FixedLedger {
        async fn balances(&self, _address: &str) -> Result<Vec<VaultBalance>, LedgerError> {
            Ok(self.0.clone())
        }
        async fn current_epoch(&self) -> Result<u64, LedgerError> {
            Ok(1)
        }
        async fn submit(&self, _notarized_hex: &str) -> Result<String, LedgerError> {
            Ok("txid".into())
        }
        async fn transaction_status(&self, _id: &str) -> Result<LedgerTxStatus, LedgerError> {
            Ok(LedgerTxStatus::Pending)
        }
    }

    struct CountingPrices {
        price: Option<Decimal>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceFeed for CountingPrices {
        async fn fee_token_usd(&self) -> Result<Decimal, PriceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.price.ok_or(PriceError::Status(503))
        }
    }

    fn checker(price: Option<Decimal>) -> (BalanceChecker, Arc<CountingPrices>) {
        let ledger = Arc::new(FixedLedger(vec![
            VaultBalance {
                resource: "resource_usdc".into(),
                amount: "20000000".into(),
            },
            VaultBalance {
                resource: "resource_xrd".into(),
                amount: "75000000000000000000".into(),
            },
            VaultBalance {
                resource: "resource_other".into(),
                amount: "1".into(),
            },
        ]));
        let prices = Arc::new(CountingPrices {
            price,
            calls: AtomicUsize::new(0),
        });
        let checker = BalanceChecker::new(
            ledger,
            prices.clone(),
            TokenSpec::new("USDC", "resource_usdc", 6),
            TokenSpec::new("XRD", "resource_xrd", 18),
            &FundingPolicy::default(),
        );
        (checker, prices)
    }

    #[tokio::test]
    async fn test_balances_convert_native_units() {
        let (checker, _) = checker(Some(dec!(0.05)));
        let balances = checker.balances("account_1").await.unwrap();
        assert_eq!(balances.value, dec!(20));
        assert_eq!(balances.fee, dec!(75));
    }

    #[tokio::test]
    async fn test_value_check_reports_shortfall() {
        let (checker, _) = checker(Some(dec!(0.05)));
        let balances = WalletBalances {
            value: dec!(9.5),
            fee: dec!(0),
        };
        let check = checker.check_value(&balances, dec!(15));
        assert!(!check.has_enough);
        assert_eq!(check.shortfall(), dec!(5.5));
        assert!(matches!(
            check.ensure(),
            Err(FundingError::Precondition { required, .. }) if required == dec!(15)
        ));
    }

    #[tokio::test]
    async fn test_transfer_fee_uses_cached_price() {
        let (checker, prices) = checker(Some(dec!(0.05)));
        let balances = WalletBalances {
            value: dec!(0),
            fee: dec!(10),
        };

        let check = checker.check_transfer_fee(&balances).await;
        assert_eq!(check.required, dec!(10));
        assert!(check.has_enough);

        checker.check_transfer_fee(&balances).await;
        assert_eq!(prices.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transfer_fee_falls_back_when_feed_is_down() {
        let (checker, _) = checker(None);
        let balances = WalletBalances {
            value: dec!(0),
            fee: dec!(20),
        };
        // 0.5 USD at the 0.02 fallback price
        let check = checker.check_transfer_fee(&balances).await;
        assert_eq!(check.required, dec!(25));
        assert!(!check.has_enough);
    }

    #[tokio::test]
    async fn test_zero_price_from_feed_uses_fallback() {
        let (checker, _) = checker(Some(Decimal::ZERO));
        let balances = WalletBalances {
            value: dec!(0),
            fee: dec!(25),
        };
        let check = checker.check_transfer_fee(&balances).await;
        assert_eq!(check.required, dec!(25));
        assert!(check.has_enough);
    }

    #[tokio::test]
    async fn test_bridge_fee_is_fixed() {
        let (checker, _) = checker(Some(dec!(0.05)));
        let balances = WalletBalances {
            value: dec!(0),
            fee: dec!(60),
        };
        let check = checker.check_bridge_fee(&balances);
        assert!(check.has_enough);
        assert_eq!(check.required, dec!(60));
    }
}
