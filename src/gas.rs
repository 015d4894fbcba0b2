//! Gas pricing: the legacy/EIP-1559 sum type, bump arithmetic and the
//! gas-price oracle
//!
//! The oracle produces the current recommended price from one of three
//! sources (fixed, zero, node-derived). Node-derived prices are cached with
//! a TTL; concurrent callers during a refresh coalesce behind a single
//! upstream call, and on upstream failure the last known value is served.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerRpc;

/// Gas pricing for a submission, carrying either a legacy single price or
/// the EIP-1559 fee pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GasPricing {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPricing {
    pub fn zero() -> Self {
        GasPricing::Legacy(U256::zero())
    }

    /// The per-gas amount charged against the sender's balance in the worst
    /// case: the legacy price, or `maxFeePerGas`.
    pub fn max_cost_per_gas(&self) -> U256 {
        match self {
            GasPricing::Legacy(price) => *price,
            GasPricing::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Worst-case total cost of a submission.
    pub fn max_cost(&self, gas_limit: U256, value: U256) -> U256 {
        gas_limit
            .checked_mul(self.max_cost_per_gas())
            .and_then(|gas_cost| gas_cost.checked_add(value))
            .unwrap_or(U256::MAX)
    }

    /// Compute the replacement price for a stuck submission.
    ///
    /// The new price is `max(prev * (100 + percent) / 100, prev + absolute)`,
    /// capped at `cap`. Returns `None` when no further bump is possible, i.e.
    /// the previous price already reached the cap. The result is always
    /// strictly greater than the previous price.
    pub fn bumped(&self, percent: u64, absolute: U256, cap: U256) -> Option<GasPricing> {
        let prev = self.max_cost_per_gas();
        let next = Self::bump_value(prev, percent, absolute, cap)?;
        match self {
            GasPricing::Legacy(_) => Some(GasPricing::Legacy(next)),
            GasPricing::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => {
                // Priority fee follows the same escalation but can never
                // exceed the max fee.
                let priority =
                    Self::bump_value(*max_priority_fee_per_gas, percent, absolute, next)
                        .unwrap_or(*max_priority_fee_per_gas)
                        .min(next);
                Some(GasPricing::Eip1559 {
                    max_fee_per_gas: next,
                    max_priority_fee_per_gas: priority,
                })
            }
        }
    }

    fn bump_value(prev: U256, percent: u64, absolute: U256, cap: U256) -> Option<U256> {
        if prev >= cap {
            return None;
        }
        let by_percent = prev
            .checked_mul(U256::from(100 + percent))
            .map(|scaled| scaled / 100)
            .unwrap_or(cap);
        let by_absolute = prev.checked_add(absolute).unwrap_or(cap);
        let candidate = by_percent.max(by_absolute).min(cap);
        if candidate > prev {
            Some(candidate)
        } else {
            None
        }
    }

    /// Whether the current market price exceeds this (submitted) price by at
    /// least `margin_percent`.
    pub fn market_exceeds(&self, market: &GasPricing, margin_percent: u64) -> bool {
        let submitted = self.max_cost_per_gas();
        let threshold = submitted
            .checked_mul(U256::from(100 + margin_percent))
            .map(|scaled| scaled / 100)
            .unwrap_or(U256::MAX);
        market.max_cost_per_gas() >= threshold
    }
}

impl std::fmt::Display for GasPricing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GasPricing::Legacy(price) => write!(f, "gasPrice={}", price),
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "maxFeePerGas={} maxPriorityFeePerGas={}",
                max_fee_per_gas, max_priority_fee_per_gas
            ),
        }
    }
}

/// Where the oracle obtains its price.
#[derive(Debug, Clone)]
pub enum GasPriceSource {
    /// A configured constant
    Fixed(GasPricing),
    /// Chains with no gas market
    Zero,
    /// Queried from the ledger RPC, cached with a TTL
    Node,
}

struct CacheSlot {
    price: GasPricing,
    fetched_at: Instant,
}

/// Produces the current recommended gas price.
pub struct GasPriceOracle {
    source: GasPriceSource,
    ledger: Arc<dyn LedgerRpc>,
    ttl: Duration,
    // Held across the upstream refresh so concurrent callers coalesce to one
    // RPC and then read the fresh slot.
    cache: Mutex<Option<CacheSlot>>,
}

impl GasPriceOracle {
    pub fn new(source: GasPriceSource, ledger: Arc<dyn LedgerRpc>, ttl: Duration) -> Self {
        Self {
            source,
            ledger,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// The configured price source. Callers use this to decide whether
    /// pricing is known up front (zero-gas chains) or deferred to
    /// submission time.
    pub fn source(&self) -> &GasPriceSource {
        &self.source
    }

    /// Current recommended price for a new submission.
    pub async fn get_gas_price(&self) -> EngineResult<GasPricing> {
        match &self.source {
            GasPriceSource::Fixed(pricing) => Ok(pricing.clone()),
            GasPriceSource::Zero => Ok(GasPricing::zero()),
            GasPriceSource::Node => self.node_price().await,
        }
    }

    async fn node_price(&self) -> EngineResult<GasPricing> {
        let mut slot = self.cache.lock().await;

        if let Some(cached) = slot.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.price.clone());
            }
        }

        match self.ledger.gas_price().await {
            Ok(price) => {
                let pricing = GasPricing::Legacy(price);
                debug!(%pricing, "refreshed node gas price");
                *slot = Some(CacheSlot {
                    price: pricing.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(pricing)
            }
            Err(err) => match slot.as_ref() {
                Some(cached) => {
                    warn!(error = %err, "gas price refresh failed, serving last known value");
                    Ok(cached.price.clone())
                }
                None => Err(EngineError::GasPriceUnavailable(err.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockLedger;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    #[test]
    fn test_bump_takes_larger_of_percent_and_absolute() {
        let cap = gwei(1000);

        // 10% of 100 gwei = 10 gwei > 1 gwei absolute
        let bumped = GasPricing::Legacy(gwei(100)).bumped(10, gwei(1), cap);
        assert_eq!(bumped, Some(GasPricing::Legacy(gwei(110))));

        // 10% of 5 gwei < 2 gwei absolute
        let bumped = GasPricing::Legacy(gwei(5)).bumped(10, gwei(2), cap);
        assert_eq!(bumped, Some(GasPricing::Legacy(gwei(7))));
    }

    #[test]
    fn test_bump_capped_and_suppressed() {
        let cap = gwei(105);

        // Clamped to the cap but still an increase
        let bumped = GasPricing::Legacy(gwei(100)).bumped(10, U256::zero(), cap);
        assert_eq!(bumped, Some(GasPricing::Legacy(gwei(105))));

        // At the cap: no further bump
        assert_eq!(GasPricing::Legacy(gwei(105)).bumped(10, gwei(1), cap), None);
        assert_eq!(GasPricing::Legacy(gwei(200)).bumped(10, gwei(1), cap), None);
    }

    #[test]
    fn test_bump_always_strictly_increases() {
        let cap = gwei(1000);
        let prev = GasPricing::Legacy(U256::from(3u64));
        // 10% of 3 wei truncates to 0, absolute of 0: suppressed rather than
        // re-submitting at the same price
        assert_eq!(prev.bumped(10, U256::zero(), cap), None);
        // The absolute floor rescues tiny prices
        assert_eq!(
            prev.bumped(10, U256::from(1u64), cap),
            Some(GasPricing::Legacy(U256::from(4u64)))
        );
    }

    #[test]
    fn test_bump_eip1559_priority_never_exceeds_max_fee() {
        let cap = gwei(120);
        let prev = GasPricing::Eip1559 {
            max_fee_per_gas: gwei(100),
            max_priority_fee_per_gas: gwei(100),
        };
        let bumped = prev.bumped(25, U256::zero(), cap).unwrap();
        match bumped {
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, gwei(120));
                assert!(max_priority_fee_per_gas <= max_fee_per_gas);
            }
            other => panic!("expected EIP-1559 pricing, got {other}"),
        }
    }

    #[test]
    fn test_market_exceeds_margin() {
        let submitted = GasPricing::Legacy(gwei(100));
        assert!(submitted.market_exceeds(&GasPricing::Legacy(gwei(120)), 20));
        assert!(!submitted.market_exceeds(&GasPricing::Legacy(gwei(119)), 20));
    }

    #[test]
    fn test_max_cost_saturates() {
        let pricing = GasPricing::Legacy(U256::MAX);
        assert_eq!(pricing.max_cost(U256::from(2u64), U256::zero()), U256::MAX);
    }

    #[tokio::test]
    async fn test_fixed_and_zero_sources_never_touch_the_ledger() {
        let ledger = Arc::new(MockLedger::new());

        let oracle = GasPriceOracle::new(
            GasPriceSource::Fixed(GasPricing::Legacy(gwei(7))),
            ledger.clone(),
            Duration::from_secs(1),
        );
        assert_eq!(
            oracle.get_gas_price().await.unwrap(),
            GasPricing::Legacy(gwei(7))
        );

        let oracle =
            GasPriceOracle::new(GasPriceSource::Zero, ledger.clone(), Duration::from_secs(1));
        assert_eq!(oracle.get_gas_price().await.unwrap(), GasPricing::zero());
        assert_eq!(ledger.gas_price_calls(), 0);
    }

    #[tokio::test]
    async fn test_node_source_caches_within_ttl() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_gas_price(gwei(12));

        let oracle = GasPriceOracle::new(
            GasPriceSource::Node,
            ledger.clone(),
            Duration::from_secs(3600),
        );
        assert_eq!(
            oracle.get_gas_price().await.unwrap(),
            GasPricing::Legacy(gwei(12))
        );
        ledger.set_gas_price(gwei(99));
        // Within the TTL, the cached value is served
        assert_eq!(
            oracle.get_gas_price().await.unwrap(),
            GasPricing::Legacy(gwei(12))
        );
        assert_eq!(ledger.gas_price_calls(), 1);
    }

    #[tokio::test]
    async fn test_node_source_falls_back_to_last_known() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_gas_price(gwei(12));

        let oracle =
            GasPriceOracle::new(GasPriceSource::Node, ledger.clone(), Duration::ZERO);
        assert_eq!(
            oracle.get_gas_price().await.unwrap(),
            GasPricing::Legacy(gwei(12))
        );

        // TTL of zero forces a refresh; the refresh fails and the last known
        // value is returned
        ledger.fail_gas_price("node down");
        assert_eq!(
            oracle.get_gas_price().await.unwrap(),
            GasPricing::Legacy(gwei(12))
        );
    }

    #[tokio::test]
    async fn test_node_source_unavailable_with_no_cache() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fail_gas_price("node down");

        let oracle =
            GasPriceOracle::new(GasPriceSource::Node, ledger, Duration::from_secs(1));
        let err = oracle.get_gas_price().await.unwrap_err();
        assert_eq!(err.code(), "GasPriceUnavailable");
    }
}
