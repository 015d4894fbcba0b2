//! Ledger RPC interface and the EVM client with multi-RPC failover

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::error::{EngineError, EngineResult};

/// Everything the engine consumes from the ledger node.
///
/// Implementations classify "execution reverted" estimate failures as
/// [`EngineError::ExecutionReverted`] so policy can branch on them without
/// message matching.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256>;

    /// Transaction count for an address; `pending` includes mempool
    /// transactions and is what nonce assignment uses.
    async fn get_transaction_count(&self, addr: Address, pending: bool) -> EngineResult<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256>;

    async fn get_transaction_receipt(&self, hash: H256)
        -> EngineResult<Option<TransactionReceipt>>;

    async fn get_balance(&self, addr: Address) -> EngineResult<U256>;

    async fn gas_price(&self) -> EngineResult<U256>;

    fn chain_id(&self) -> u64;
}

/// Multi-provider EVM client with automatic round-robin failover.
pub struct EvmLedgerClient {
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    chain_id: u64,
    request_timeout: Duration,
}

impl EvmLedgerClient {
    pub fn new(config: &LedgerConfig) -> EngineResult<Self> {
        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!(%url, "added ledger RPC provider");
                }
                Err(err) => {
                    warn!(%url, error = %err, "skipping invalid ledger RPC url");
                }
            }
        }
        if providers.is_empty() {
            return Err(EngineError::Config(
                "no valid ledger RPC providers configured".to_string(),
            ));
        }
        Ok(Self {
            providers,
            current_provider: AtomicUsize::new(0),
            chain_id: config.chain_id,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn active(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(provider = next, "ledger RPC failover");
    }

    /// Run `op` against the active provider, rotating through the remaining
    /// providers on error. The last error is surfaced when all fail.
    async fn with_failover<T, F, Fut>(&self, operation: &str, op: F) -> EngineResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last_err = None;
        for _ in 0..self.providers.len() {
            let provider = self.active().clone();
            match timeout(self.request_timeout, op(provider)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let classified = classify_provider_error(&err);
                    // Node-side rejections are not cured by another provider
                    if !matches!(classified, EngineError::Rpc(_)) {
                        return Err(classified);
                    }
                    last_err = Some(classified);
                    self.failover();
                }
                Err(_) => {
                    last_err = Some(EngineError::Timeout {
                        operation: operation.to_string(),
                    });
                    self.failover();
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Rpc("all providers failed".to_string())))
    }
}

/// Map a provider error onto the engine taxonomy, recognizing reverts.
fn classify_provider_error(err: &ProviderError) -> EngineError {
    let message = err.to_string();
    if message.contains("execution reverted") {
        EngineError::ExecutionReverted(message)
    } else {
        EngineError::Rpc(message)
    }
}

#[async_trait]
impl LedgerRpc for EvmLedgerClient {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256> {
        let tx = tx.clone();
        self.with_failover("estimate_gas", move |provider| {
            let tx = tx.clone();
            async move { provider.estimate_gas(&tx, None).await }
        })
        .await
        .map_err(|err| match err {
            EngineError::ExecutionReverted(_) => err,
            EngineError::Timeout { .. } => err,
            other => EngineError::GasEstimation(other.to_string()),
        })
    }

    async fn get_transaction_count(&self, addr: Address, pending: bool) -> EngineResult<u64> {
        let block = if pending {
            Some(BlockNumber::Pending.into())
        } else {
            None
        };
        let count = self
            .with_failover("get_transaction_count", move |provider| async move {
                provider.get_transaction_count(addr, block).await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256> {
        let raw = raw.clone();
        self.with_failover("send_raw_transaction", move |provider| {
            let raw = raw.clone();
            async move {
                let pending = provider.send_raw_transaction(raw).await?;
                Ok(pending.tx_hash())
            }
        })
        .await
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> EngineResult<Option<TransactionReceipt>> {
        self.with_failover("get_transaction_receipt", move |provider| async move {
            provider.get_transaction_receipt(hash).await
        })
        .await
    }

    async fn get_balance(&self, addr: Address) -> EngineResult<U256> {
        self.with_failover("get_balance", move |provider| async move {
            provider.get_balance(addr, None).await
        })
        .await
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        self.with_failover("gas_price", move |provider| async move {
            provider.get_gas_price().await
        })
        .await
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }
}
