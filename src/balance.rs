//! Balance tracking and treasury auto-fueling
//!
//! The balance manager answers two questions for the engine: can this signer
//! afford its next submission, and if not, should the treasury top it up.
//! Fueling transfers are ordinary public transactions submitted on the
//! treasury signer's orchestrator through the [`TransferSubmitter`]
//! capability; only one transfer per destination is in flight at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutoFuelingPolicy;
use crate::error::{EngineError, EngineResult};
use crate::gas::GasPricing;
use crate::ledger::LedgerRpc;

/// Capability to submit a fueling transfer as a normal public transaction.
///
/// Implemented by the engine; kept narrow so the balance manager does not
/// hold a back-pointer to it.
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    async fn submit_fueling_transfer(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> EngineResult<Uuid>;
}

struct CachedBalance {
    balance: U256,
    fetched_at: Instant,
}

/// Tracks signer balances and drives auto-fueling.
pub struct BalanceManager {
    ledger: Arc<dyn LedgerRpc>,
    cache: DashMap<Address, CachedBalance>,
    cache_ttl: Duration,
    fueling: Option<AutoFuelingPolicy>,
    submitter: RwLock<Option<Arc<dyn TransferSubmitter>>>,
    // dest -> outstanding fueling transfer; entries cleared on confirmation
    inflight_fueling: DashMap<Address, Uuid>,
}

impl BalanceManager {
    pub fn new(
        ledger: Arc<dyn LedgerRpc>,
        cache_ttl: Duration,
        fueling: Option<AutoFuelingPolicy>,
    ) -> Self {
        Self {
            ledger,
            cache: DashMap::new(),
            cache_ttl,
            fueling,
            submitter: RwLock::new(None),
            inflight_fueling: DashMap::new(),
        }
    }

    /// Wire the transfer-submission capability; called once at engine start.
    pub async fn set_transfer_submitter(&self, submitter: Arc<dyn TransferSubmitter>) {
        *self.submitter.write().await = Some(submitter);
    }

    /// Current balance for an address, cached with a short TTL.
    pub async fn get_balance(&self, addr: Address) -> EngineResult<U256> {
        if let Some(cached) = self.cache.get(&addr) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.balance);
            }
        }
        let balance = self.ledger.get_balance(addr).await?;
        self.cache.insert(
            addr,
            CachedBalance {
                balance,
                fetched_at: Instant::now(),
            },
        );
        Ok(balance)
    }

    pub fn invalidate(&self, addr: Address) {
        self.cache.remove(&addr);
    }

    /// Whether `signer` can cover `gas_limit * maxFee + value` right now.
    pub async fn check_affordable(
        &self,
        signer: Address,
        gas_limit: U256,
        pricing: &GasPricing,
        value: U256,
    ) -> EngineResult<bool> {
        let required = pricing.max_cost(gas_limit, value);
        let balance = self.get_balance(signer).await?;
        if balance < required {
            debug!(
                ?signer,
                %balance,
                %required,
                "signer cannot afford submission"
            );
        }
        Ok(balance >= required)
    }

    pub fn auto_fueling_enabled(&self) -> bool {
        self.fueling.is_some()
    }

    /// Called when a fueling transfer for `dest` reaches a terminal status.
    pub fn fueling_complete(&self, dest: Address) {
        if self.inflight_fueling.remove(&dest).is_some() {
            self.invalidate(dest);
        }
    }

    /// Top `dest` up from the treasury if it has dipped below the configured
    /// minimum.
    ///
    /// Returns the id of the fueling transfer covering `dest` (a new one, or
    /// the outstanding one when fueling is already in flight), or `None`
    /// when no fueling is needed or configured. `is_fueling_tx` marks calls
    /// on behalf of a fueling transfer itself; these never fuel recursively.
    pub async fn ensure_fueled(
        &self,
        dest: Address,
        is_fueling_tx: bool,
    ) -> EngineResult<Option<Uuid>> {
        let Some(policy) = &self.fueling else {
            return Ok(None);
        };
        if is_fueling_tx {
            return Ok(None);
        }

        // Attach to the outstanding transfer rather than stacking another
        if let Some(outstanding) = self.inflight_fueling.get(&dest) {
            return Ok(Some(*outstanding));
        }

        self.invalidate(dest);
        let balance = self.get_balance(dest).await?;
        if balance >= policy.min_dest_balance {
            return Ok(None);
        }
        let top_up = policy.target_dest_balance.saturating_sub(balance);

        self.invalidate(policy.source);
        let source_balance = self.get_balance(policy.source).await?;
        let retained = source_balance.saturating_sub(top_up);
        if source_balance < top_up || retained < policy.source_min_balance {
            warn!(
                source = ?policy.source,
                %source_balance,
                %top_up,
                "refusing fueling transfer: source would fall below minimum"
            );
            return Err(EngineError::FuelingSourceBelowMinimum {
                fueling_source: format!("{:?}", policy.source),
                balance: source_balance.to_string(),
                minimum: policy.source_min_balance.to_string(),
            });
        }

        let submitter = self
            .submitter
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::Internal("transfer submitter not wired".to_string()))?;
        let id = submitter
            .submit_fueling_transfer(policy.source, dest, top_up)
            .await?;
        info!(?dest, %top_up, fueling_tx = %id, "submitted fueling transfer");
        self.inflight_fueling.insert(dest, id);
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockLedger, RecordingSubmitter};

    fn policy(source: Address) -> AutoFuelingPolicy {
        AutoFuelingPolicy {
            source,
            source_min_balance: U256::from(1_000u64),
            min_dest_balance: U256::from(100u64),
            target_dest_balance: U256::from(500u64),
        }
    }

    async fn manager_with(
        ledger: Arc<MockLedger>,
        source: Address,
    ) -> (BalanceManager, Arc<RecordingSubmitter>) {
        let manager = BalanceManager::new(ledger, Duration::from_secs(60), Some(policy(source)));
        let submitter = Arc::new(RecordingSubmitter::new());
        manager.set_transfer_submitter(submitter.clone()).await;
        (manager, submitter)
    }

    #[tokio::test]
    async fn test_balance_cache_hit_skips_rpc() {
        let ledger = Arc::new(MockLedger::new());
        let addr = Address::random();
        ledger.set_balance(addr, U256::from(42u64));

        let manager = BalanceManager::new(ledger.clone(), Duration::from_secs(60), None);
        assert_eq!(manager.get_balance(addr).await.unwrap(), U256::from(42u64));
        ledger.set_balance(addr, U256::from(99u64));
        assert_eq!(manager.get_balance(addr).await.unwrap(), U256::from(42u64));
        assert_eq!(ledger.balance_calls(), 1);

        manager.invalidate(addr);
        assert_eq!(manager.get_balance(addr).await.unwrap(), U256::from(99u64));
    }

    #[tokio::test]
    async fn test_fueling_tops_up_to_target() {
        let ledger = Arc::new(MockLedger::new());
        let source = Address::random();
        let dest = Address::random();
        ledger.set_balance(source, U256::from(10_000u64));
        ledger.set_balance(dest, U256::from(60u64));

        let (manager, submitter) = manager_with(ledger, source).await;
        let id = manager.ensure_fueled(dest, false).await.unwrap();
        assert!(id.is_some());

        let submitted = submitter.submitted();
        assert_eq!(submitted.len(), 1);
        // Top up to the target, not just past the trigger
        assert_eq!(submitted[0], (source, dest, U256::from(440u64)));
    }

    #[tokio::test]
    async fn test_fueling_skipped_above_trigger() {
        let ledger = Arc::new(MockLedger::new());
        let source = Address::random();
        let dest = Address::random();
        ledger.set_balance(source, U256::from(10_000u64));
        ledger.set_balance(dest, U256::from(100u64));

        let (manager, submitter) = manager_with(ledger, source).await;
        assert!(manager.ensure_fueled(dest, false).await.unwrap().is_none());
        assert!(submitter.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_fueling_deduplicates_per_destination() {
        let ledger = Arc::new(MockLedger::new());
        let source = Address::random();
        let dest = Address::random();
        ledger.set_balance(source, U256::from(10_000u64));
        ledger.set_balance(dest, U256::zero());

        let (manager, submitter) = manager_with(ledger, source).await;
        let first = manager.ensure_fueled(dest, false).await.unwrap().unwrap();
        let second = manager.ensure_fueled(dest, false).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(submitter.submitted().len(), 1);

        // After confirmation, a new shortfall starts a new transfer
        manager.fueling_complete(dest);
        let third = manager.ensure_fueled(dest, false).await.unwrap().unwrap();
        assert_ne!(first, third);
        assert_eq!(submitter.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_fueling_refused_below_source_minimum() {
        let ledger = Arc::new(MockLedger::new());
        let source = Address::random();
        let dest = Address::random();
        // 500 top-up would leave the source below its 1000 minimum
        ledger.set_balance(source, U256::from(1_200u64));
        ledger.set_balance(dest, U256::zero());

        let (manager, submitter) = manager_with(ledger, source).await;
        let err = manager.ensure_fueled(dest, false).await.unwrap_err();
        assert_eq!(err.code(), "FuelingSourceBelowMinimum");
        assert!(err.is_stalled());
        assert!(submitter.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_fueling_never_recurses() {
        let ledger = Arc::new(MockLedger::new());
        let source = Address::random();
        ledger.set_balance(source, U256::zero());

        let (manager, submitter) = manager_with(ledger, source).await;
        // The treasury itself is broke, but a fueling tx never fuels
        assert!(manager.ensure_fueled(source, true).await.unwrap().is_none());
        assert!(submitter.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_fueling_disabled_is_noop() {
        let ledger = Arc::new(MockLedger::new());
        let manager = BalanceManager::new(ledger, Duration::from_secs(60), None);
        assert!(manager
            .ensure_fueled(Address::random(), false)
            .await
            .unwrap()
            .is_none());
    }
}
