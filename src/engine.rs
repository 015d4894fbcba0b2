//! Process-wide public transaction engine
//!
//! The engine is the front door for ledger-bound transaction requests. It
//! validates and materializes each request into a persisted, nonce-assigned
//! public transaction, routes it to the signing address's orchestrator
//! (spawning one when under the global bound), fans block-indexer
//! confirmations out to the owning orchestrators, services suspend/resume
//! requests, and reaps orchestrators that have gone idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::{BalanceManager, TransferSubmitter};
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::events::EventNotifier;
use crate::gas::{GasPriceOracle, GasPriceSource, GasPricing};
use crate::indexer::BlockIndexer;
use crate::inflight::{StageContext, SubmissionPolicy};
use crate::keys::{KeyManager, ALGORITHM_ECDSA_SECP256K1};
use crate::ledger::LedgerRpc;
use crate::metrics;
use crate::orchestrator::{
    NonceAllocator, Orchestrator, OrchestratorCommand, OrchestratorHandle,
};
use crate::payload::TxPayload;
use crate::store::TransactionStore;
use crate::types::{
    IndexedTransaction, PtxStatus, PtxUpdate, PublicTx, SubStatus, SubStatusAction, TxFilter,
};

/// Options accompanying a new transaction request.
#[derive(Debug, Clone, Default)]
pub struct TxRequest {
    /// Caller-supplied unique id; required
    pub id: Option<Uuid>,
    /// Signer identifier resolved through the key manager
    pub signer: String,
    /// Skips gas estimation when provided
    pub gas_limit: Option<U256>,
}

/// Process-wide engine coordinating one orchestrator per signing address.
pub struct Engine {
    engine_interval: Duration,
    max_orchestrator_idle: Duration,
    orchestrator_cap: Option<usize>,
    orchestrator_interval: Duration,
    transaction_cap: Option<usize>,
    policy: SubmissionPolicy,

    ledger: Arc<dyn LedgerRpc>,
    keys: Arc<dyn KeyManager>,
    store: Arc<dyn TransactionStore>,
    oracle: Arc<GasPriceOracle>,
    balance: Arc<BalanceManager>,
    notifier: Arc<dyn EventNotifier>,
    indexer: Arc<dyn BlockIndexer>,

    // Guarded for map edits only; commands are sent after the lock drops
    orchestrators: Mutex<HashMap<Address, OrchestratorHandle>>,
    // One nonce cursor per signer, shared with its orchestrator and kept
    // across orchestrator reaping
    nonce_allocators: DashMap<Address, Arc<NonceAllocator>>,
    shutdown: RwLock<bool>,
}

impl Engine {
    /// Build an engine from validated settings. Fails fast on any
    /// unparseable gas or fueling configuration.
    pub fn new(
        settings: &Settings,
        ledger: Arc<dyn LedgerRpc>,
        keys: Arc<dyn KeyManager>,
        store: Arc<dyn TransactionStore>,
        indexer: Arc<dyn BlockIndexer>,
        notifier: Arc<dyn EventNotifier>,
    ) -> EngineResult<Arc<Self>> {
        let policy = SubmissionPolicy {
            chain_id: settings.ledger.chain_id,
            submission_retry_count: settings.orchestrator.submission_retry_count,
            resubmit_staleness: settings.orchestrator.resubmit_staleness(),
            resubmit_price_margin_percent: settings.orchestrator.resubmit_price_margin_percent,
            gas_price_increase_percent: settings.orchestrator.gas_price_increase_percent,
            gas_price_increase_absolute: settings.orchestrator.gas_price_increase_absolute()?,
            gas_price_increase_max: settings.orchestrator.gas_price_increase_max()?,
        };
        let oracle = Arc::new(GasPriceOracle::new(
            settings.gas.resolve_source()?,
            ledger.clone(),
            settings.gas.cache_ttl(),
        ));
        let balance = Arc::new(BalanceManager::new(
            ledger.clone(),
            settings.balance_manager.cache_ttl(),
            settings.balance_manager.auto_fueling.resolve()?,
        ));

        Ok(Arc::new(Self {
            engine_interval: settings.engine.interval(),
            max_orchestrator_idle: settings.engine.max_orchestrator_idle(),
            orchestrator_cap: settings.engine.orchestrator_cap(),
            orchestrator_interval: settings.orchestrator.interval(),
            transaction_cap: settings.orchestrator.transaction_cap(),
            policy,
            ledger,
            keys,
            store,
            oracle,
            balance,
            notifier,
            indexer,
            orchestrators: Mutex::new(HashMap::new()),
            nonce_allocators: DashMap::new(),
            shutdown: RwLock::new(false),
        }))
    }

    /// Register with the block indexer, recover open transactions from the
    /// store, and start the engine poll loop.
    pub async fn start(self: &Arc<Self>) -> EngineResult<JoinHandle<()>> {
        let engine = self.clone();
        self.indexer
            .register_indexed_transaction_handler(Arc::new(move |batch| {
                let engine = engine.clone();
                Box::pin(async move { engine.handle_confirmed_transactions(batch).await })
            }))
            .await?;

        self.balance
            .set_transfer_submitter(self.clone() as Arc<dyn TransferSubmitter>)
            .await;

        match self.store.list_transactions(&TxFilter::open()).await {
            Ok(open) => {
                info!(count = open.len(), "recovering open transactions");
                for tx in open {
                    self.route(tx).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "recovery listing failed; poll loop will retry")
            }
        }

        info!("public transaction engine started");
        Ok(tokio::spawn(self.clone().run_poll_loop()))
    }

    /// Signal shutdown and stop all orchestrators.
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        let mut orchestrators = self.orchestrators.lock().await;
        for (_, handle) in orchestrators.drain() {
            handle.stop();
        }
        info!("public transaction engine stopped");
    }

    async fn ensure_active(&self) -> EngineResult<()> {
        if *self.shutdown.read().await {
            Err(EngineError::ContextCancelled)
        } else {
            Ok(())
        }
    }

    /// Accept a new transaction request with an untyped payload.
    ///
    /// Classification of the returned error distinguishes payload-fatal
    /// rejections ([`EngineError::submission_rejected`] = true) from
    /// transient infrastructure failures the caller may retry.
    pub async fn handle_new_transaction(
        &self,
        req: TxRequest,
        payload: &serde_json::Value,
    ) -> EngineResult<PublicTx> {
        let payload = TxPayload::from_value(payload)?;
        self.submit_transaction(req, payload, false).await
    }

    async fn submit_transaction(
        &self,
        req: TxRequest,
        payload: TxPayload,
        fueling: bool,
    ) -> EngineResult<PublicTx> {
        self.ensure_active().await?;
        let id = req.id.ok_or(EngineError::TransactionIdMissing)?;

        let (_key_handle, from) = self
            .keys
            .resolve_key(&req.signer, ALGORITHM_ECDSA_SECP256K1)
            .await?;

        let built = payload.build()?;

        let gas_limit = match req.gas_limit {
            Some(limit) => limit,
            None => {
                let unsigned = estimate_request(
                    from,
                    built.to,
                    built.data.clone(),
                    built.value,
                    self.policy.chain_id,
                );
                self.ledger.estimate_gas(&unsigned).await?
            }
        };

        let allocator = self.allocator(from);
        let nonce = allocator.assign().await?;

        let mut ptx = PublicTx::new(id, from);
        ptx.to = built.to;
        ptx.data = built.data;
        ptx.value = built.value;
        ptx.gas_limit = Some(gas_limit);
        ptx.nonce = Some(nonce);
        ptx.fueling = fueling;
        // Chains with no gas market are priced at zero up front; node and
        // fixed sources defer pricing to submission time
        if matches!(self.oracle.source(), GasPriceSource::Zero) {
            ptx.gas_pricing = Some(GasPricing::zero());
        }

        if let Err(err) = self.store.insert_transaction(&ptx).await {
            // Roll the cursor back so the nonce is not burned
            allocator.release(nonce).await;
            return Err(err);
        }
        let _ = self
            .store
            .update_sub_status(
                id,
                SubStatus::Received,
                SubStatusAction::AssignNonce,
                Some(serde_json::json!({ "nonce": nonce })),
                None,
                None,
            )
            .await;

        metrics::record_tx_accepted(fueling);
        info!(%id, ?from, nonce, "accepted public transaction");
        self.route(ptx.clone()).await;
        Ok(ptx)
    }

    fn allocator(&self, signer: Address) -> Arc<NonceAllocator> {
        self.nonce_allocators
            .entry(signer)
            .or_insert_with(|| Arc::new(NonceAllocator::new(signer, self.ledger.clone())))
            .clone()
    }

    fn stage_context(&self) -> StageContext {
        StageContext {
            ledger: self.ledger.clone(),
            keys: self.keys.clone(),
            store: self.store.clone(),
            oracle: self.oracle.clone(),
            balance: self.balance.clone(),
            notifier: self.notifier.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Route a transaction to its signer's orchestrator, spawning one when
    /// under the global bound. At the bound, the transaction stays in the
    /// store and is picked up once capacity frees.
    async fn route(&self, ptx: PublicTx) {
        match self.orchestrator_sender(ptx.from, true).await {
            Some(sender) => {
                let _ = sender.send(OrchestratorCommand::Add(Box::new(ptx)));
            }
            None => {
                debug!(
                    signer = ?ptx.from,
                    id = %ptx.id,
                    "orchestrator bound reached; transaction deferred"
                );
            }
        }
    }

    /// Command sender for a signer's orchestrator. Spawns the orchestrator
    /// when absent (and allowed); the map lock is never held while sending.
    async fn orchestrator_sender(
        &self,
        signer: Address,
        spawn_if_missing: bool,
    ) -> Option<tokio::sync::mpsc::UnboundedSender<OrchestratorCommand>> {
        let mut orchestrators = self.orchestrators.lock().await;
        if let Some(handle) = orchestrators.get(&signer) {
            return Some(handle.command_sender());
        }
        if !spawn_if_missing {
            return None;
        }
        if let Some(cap) = self.orchestrator_cap {
            if orchestrators.len() >= cap {
                return None;
            }
        }
        let handle = Orchestrator::spawn(
            signer,
            self.stage_context(),
            self.orchestrator_interval,
            self.transaction_cap,
            self.allocator(signer),
        );
        let sender = handle.command_sender();
        orchestrators.insert(signer, handle);
        metrics::record_orchestrators(orchestrators.len());
        Some(sender)
    }

    /// Suspend a pending transaction.
    pub async fn handle_suspend_transaction(&self, id: Uuid) -> EngineResult<PublicTx> {
        self.request_status_change(id, PtxStatus::Suspended).await
    }

    /// Resume a suspended transaction.
    pub async fn handle_resume_transaction(&self, id: Uuid) -> EngineResult<PublicTx> {
        self.request_status_change(id, PtxStatus::Pending).await
    }

    async fn request_status_change(
        &self,
        id: Uuid,
        target: PtxStatus,
    ) -> EngineResult<PublicTx> {
        self.ensure_active().await?;
        let tx = self
            .store
            .get_transaction_by_id(id)
            .await?
            .ok_or(EngineError::TransactionNotFound { id })?;
        self.ensure_active().await?;

        if tx.status.is_terminal() {
            return Err(EngineError::TerminalStatusUpdate {
                id,
                status: tx.status.to_string(),
            });
        }
        if tx.status == target {
            // Second application of the same change is a no-op
            return Ok(tx);
        }

        match self.orchestrator_sender(tx.from, false).await {
            Some(sender) => {
                // The in-flight controller observes the change on its next
                // advance and persists it; the caller sees the prior status
                let _ = sender.send(OrchestratorCommand::StatusChange { id, target });
                Ok(tx)
            }
            None => {
                self.store
                    .update_transaction(id, &PtxUpdate::status(target))
                    .await?;
                let mut tx = tx;
                tx.status = target;
                Ok(tx)
            }
        }
    }

    /// Dispatch a batch of confirmed transactions from the block indexer.
    ///
    /// Confirmations are grouped by signer in arrival (receipt) order;
    /// orchestrators missing for a signer are spawned up to the global
    /// bound so reconciliation can proceed.
    pub async fn handle_confirmed_transactions(
        &self,
        batch: Vec<IndexedTransaction>,
    ) -> EngineResult<()> {
        let mut grouped: Vec<(Address, Vec<IndexedTransaction>)> = Vec::new();
        for itx in batch {
            match grouped.iter_mut().find(|(from, _)| *from == itx.from) {
                Some((_, list)) => list.push(itx),
                None => grouped.push((itx.from, vec![itx])),
            }
        }

        for (from, confirmations) in grouped {
            self.ensure_active().await?;
            match self.orchestrator_sender(from, true).await {
                Some(sender) => {
                    metrics::record_confirmations(confirmations.len());
                    let _ = sender.send(OrchestratorCommand::Confirmed(confirmations));
                }
                None => {
                    debug!(
                        signer = ?from,
                        count = confirmations.len(),
                        "orchestrator bound reached; confirmations deferred"
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.engine_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            self.reap_idle_orchestrators().await;
            self.reconcile_open_transactions().await;
        }
    }

    /// Remove orchestrators that have been idle with no work for longer
    /// than the configured maximum.
    async fn reap_idle_orchestrators(&self) {
        let mut orchestrators = self.orchestrators.lock().await;
        let reapable: Vec<Address> = orchestrators
            .iter()
            .filter(|(_, handle)| handle.reapable(self.max_orchestrator_idle))
            .map(|(signer, _)| *signer)
            .collect();
        for signer in reapable {
            if let Some(handle) = orchestrators.remove(&signer) {
                handle.stop();
                info!(?signer, "reaped idle orchestrator");
            }
        }
        metrics::record_orchestrators(orchestrators.len());
    }

    /// Re-route open transactions so work deferred at the orchestrator
    /// bound (or left over from a crash) is picked up as capacity frees.
    /// Orchestrators de-duplicate by transaction id, so re-routing is
    /// idempotent.
    async fn reconcile_open_transactions(&self) {
        let open = match self.store.list_transactions(&TxFilter::open()).await {
            Ok(open) => open,
            Err(err) => {
                warn!(error = %err, "reconciliation listing failed");
                return;
            }
        };
        for tx in open {
            self.route(tx).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn orchestrator_count(&self) -> usize {
        self.orchestrators.lock().await.len()
    }
}

#[async_trait]
impl TransferSubmitter for Engine {
    async fn submit_fueling_transfer(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> EngineResult<Uuid> {
        let req = TxRequest {
            id: Some(Uuid::new_v4()),
            signer: format!("{from:?}"),
            // Plain value transfer
            gas_limit: Some(U256::from(21_000u64)),
        };
        let ptx = self
            .submit_transaction(req, TxPayload::Transfer { to, value }, true)
            .await?;
        metrics::record_fueling_transfer();
        Ok(ptx.id)
    }
}

/// Unsigned transaction shape used for gas estimation.
fn estimate_request(
    from: Address,
    to: Option<Address>,
    data: Bytes,
    value: U256,
    chain_id: u64,
) -> TypedTransaction {
    let mut request = TransactionRequest::new()
        .from(from)
        .value(value)
        .data(data)
        .chain_id(chain_id);
    if let Some(to) = to {
        request = request.to(to);
    }
    TypedTransaction::Legacy(request)
}
