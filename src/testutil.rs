//! Shared test fixtures: a scripted ledger mock and a wired-up harness

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;
use uuid::Uuid;

use crate::balance::BalanceManager;
use crate::error::{EngineError, EngineResult};
use crate::events::BroadcastNotifier;
use crate::gas::{GasPriceOracle, GasPriceSource};
use crate::inflight::{StageContext, SubmissionPolicy};
use crate::keys::LocalWalletKeyManager;
use crate::ledger::LedgerRpc;
use crate::store::{InMemoryTxStore, TransactionStore};
use crate::types::{PublicTx, TxResult};

pub const TEST_CHAIN_ID: u64 = 1337;

/// Ledger mock with per-call scripting.
///
/// Defaults are permissive: rich balances, a 1 gwei gas price, a 21000 gas
/// estimate, successful sends. Tests script the failure they exercise.
pub struct MockLedger {
    balances: DashMap<Address, U256>,
    balance_calls: AtomicUsize,
    gas_price: Mutex<Result<U256, String>>,
    gas_price_calls: AtomicUsize,
    nonces: DashMap<Address, u64>,
    nonce_fail_once: Mutex<Option<String>>,
    nonce_calls: AtomicUsize,
    estimate: Mutex<Result<U256, String>>,
    estimate_calls: AtomicUsize,
    send_errors: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<Bytes>>,
    receipts: DashMap<H256, TransactionReceipt>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            balance_calls: AtomicUsize::new(0),
            gas_price: Mutex::new(Ok(U256::from(1_000_000_000u64))),
            gas_price_calls: AtomicUsize::new(0),
            nonces: DashMap::new(),
            nonce_fail_once: Mutex::new(None),
            nonce_calls: AtomicUsize::new(0),
            estimate: Mutex::new(Ok(U256::from(21_000u64))),
            estimate_calls: AtomicUsize::new(0),
            send_errors: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            receipts: DashMap::new(),
        }
    }

    pub fn set_balance(&self, addr: Address, balance: U256) {
        self.balances.insert(addr, balance);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn set_gas_price(&self, price: U256) {
        *self.gas_price.lock().unwrap() = Ok(price);
    }

    pub fn fail_gas_price(&self, message: &str) {
        *self.gas_price.lock().unwrap() = Err(message.to_string());
    }

    pub fn gas_price_calls(&self) -> usize {
        self.gas_price_calls.load(Ordering::SeqCst)
    }

    pub fn set_nonce(&self, addr: Address, nonce: u64) {
        self.nonces.insert(addr, nonce);
    }

    /// The next `get_transaction_count` call fails with this message.
    pub fn fail_next_nonce(&self, message: &str) {
        *self.nonce_fail_once.lock().unwrap() = Some(message.to_string());
    }

    pub fn nonce_calls(&self) -> usize {
        self.nonce_calls.load(Ordering::SeqCst)
    }

    pub fn set_estimate(&self, estimate: U256) {
        *self.estimate.lock().unwrap() = Ok(estimate);
    }

    pub fn fail_estimate(&self, message: &str) {
        *self.estimate.lock().unwrap() = Err(message.to_string());
    }

    pub fn estimate_calls(&self) -> usize {
        self.estimate_calls.load(Ordering::SeqCst)
    }

    /// Queue an error for the next `send_raw_transaction` call; once the
    /// queue drains, sends succeed again.
    pub fn push_send_error(&self, message: &str) {
        self.send_errors.lock().unwrap().push_back(message.to_string());
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_receipt(&self, hash: H256, receipt: TransactionReceipt) {
        self.receipts.insert(hash, receipt);
    }
}

fn classify(message: String) -> EngineError {
    if message.contains("execution reverted") {
        EngineError::ExecutionReverted(message)
    } else {
        EngineError::Rpc(message)
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn estimate_gas(&self, _tx: &TypedTransaction) -> EngineResult<U256> {
        self.estimate_calls.fetch_add(1, Ordering::SeqCst);
        match self.estimate.lock().unwrap().clone() {
            Ok(estimate) => Ok(estimate),
            Err(message) => match classify(message) {
                EngineError::Rpc(msg) => Err(EngineError::GasEstimation(msg)),
                other => Err(other),
            },
        }
    }

    async fn get_transaction_count(&self, addr: Address, _pending: bool) -> EngineResult<u64> {
        self.nonce_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.nonce_fail_once.lock().unwrap().take() {
            return Err(EngineError::Rpc(message));
        }
        Ok(self.nonces.get(&addr).map(|nonce| *nonce).unwrap_or(0))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256> {
        if let Some(message) = self.send_errors.lock().unwrap().pop_front() {
            return Err(EngineError::Rpc(message));
        }
        let hash = H256::from(ethers::utils::keccak256(&raw));
        self.sent.lock().unwrap().push(raw);
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> EngineResult<Option<TransactionReceipt>> {
        Ok(self.receipts.get(&hash).map(|receipt| receipt.clone()))
    }

    async fn get_balance(&self, addr: Address) -> EngineResult<U256> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .balances
            .get(&addr)
            .map(|balance| *balance)
            .unwrap_or(U256::MAX))
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        self.gas_price_calls.fetch_add(1, Ordering::SeqCst);
        self.gas_price
            .lock()
            .unwrap()
            .clone()
            .map_err(EngineError::Rpc)
    }

    fn chain_id(&self) -> u64 {
        TEST_CHAIN_ID
    }
}

/// Fully wired set of engine collaborators over mocks.
pub struct TestHarness {
    pub ledger: Arc<MockLedger>,
    pub keys: Arc<LocalWalletKeyManager>,
    pub signer: Address,
    pub store: Arc<InMemoryTxStore>,
    pub notifier: Arc<BroadcastNotifier>,
    pub oracle: Arc<GasPriceOracle>,
    pub balance: Arc<BalanceManager>,
}

impl TestHarness {
    pub fn new() -> Self {
        let ledger = Arc::new(MockLedger::new());
        let (keys, signer) = LocalWalletKeyManager::new_random(TEST_CHAIN_ID);
        // Zero TTL: every oracle call sees the latest scripted price
        let oracle = Arc::new(GasPriceOracle::new(
            GasPriceSource::Node,
            ledger.clone(),
            Duration::ZERO,
        ));
        let balance = Arc::new(BalanceManager::new(
            ledger.clone(),
            Duration::ZERO,
            None,
        ));
        Self {
            ledger,
            keys: Arc::new(keys),
            signer,
            store: Arc::new(InMemoryTxStore::new()),
            notifier: Arc::new(BroadcastNotifier::new(64)),
            oracle,
            balance,
        }
    }

    pub fn default_policy() -> SubmissionPolicy {
        SubmissionPolicy {
            chain_id: TEST_CHAIN_ID,
            submission_retry_count: 2,
            // Long staleness: bumping only happens when a test opts in
            resubmit_staleness: Duration::from_secs(3600),
            resubmit_price_margin_percent: 10,
            gas_price_increase_percent: 10,
            gas_price_increase_absolute: U256::zero(),
            gas_price_increase_max: U256::MAX,
        }
    }

    pub fn stage_context(&self) -> StageContext {
        self.stage_context_with(Self::default_policy())
    }

    pub fn stage_context_with(&self, policy: SubmissionPolicy) -> StageContext {
        StageContext {
            ledger: self.ledger.clone(),
            keys: self.keys.clone(),
            store: self.store.clone(),
            oracle: self.oracle.clone(),
            balance: self.balance.clone(),
            notifier: self.notifier.clone(),
            policy,
        }
    }

    /// Insert and return a pending transfer for the harness signer.
    pub async fn pending_transfer(&self, nonce: u64, gas_limit: Option<U256>) -> PublicTx {
        let mut tx = PublicTx::new(Uuid::new_v4(), self.signer);
        tx.to = Some(Address::random());
        tx.value = U256::from(100u64);
        tx.gas_limit = gas_limit;
        tx.nonce = Some(nonce);
        self.store.insert_transaction(&tx).await.unwrap();
        tx
    }
}

/// Transfer submitter that records fueling requests instead of running them.
pub struct RecordingSubmitter {
    submitted: Mutex<Vec<(Address, Address, U256)>>,
}

impl Default for RecordingSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted(&self) -> Vec<(Address, Address, U256)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::balance::TransferSubmitter for RecordingSubmitter {
    async fn submit_fueling_transfer(
        &self,
        from: Address,
        to: Address,
        value: U256,
    ) -> EngineResult<Uuid> {
        self.submitted.lock().unwrap().push((from, to, value));
        Ok(Uuid::new_v4())
    }
}

/// A confirmation matching the given submission.
pub fn confirmation(
    from: Address,
    nonce: u64,
    hash: H256,
    result: TxResult,
) -> crate::types::IndexedTransaction {
    crate::types::IndexedTransaction {
        block_number: 1233,
        tx_index: 23,
        hash,
        result,
        nonce,
        from,
    }
}
