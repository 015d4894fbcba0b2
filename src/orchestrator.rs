//! Per-signer orchestration of in-flight transactions
//!
//! One orchestrator owns the ordered list of in-flight transactions for a
//! single signing address. It is the sole mutator of that list: external
//! add/suspend/resume/confirmation requests arrive over a command channel
//! and are drained at the top of each tick. Each tick admits work up to the
//! in-flight cap, advances every controller one cooperative step, and reaps
//! terminal controllers from the head only while they are contiguous from
//! the nonce cursor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::Address;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::inflight::{InFlightTransaction, StageContext, StepOutcome};
use crate::ledger::LedgerRpc;
use crate::types::{IndexedTransaction, PtxStatus, PublicTx, SubStatus, SubStatusAction};

/// Lifecycle state of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    Stopping,
}

/// External request into an orchestrator, drained at the top of each tick.
#[derive(Debug)]
pub enum OrchestratorCommand {
    Add(Box<PublicTx>),
    StatusChange { id: Uuid, target: PtxStatus },
    Confirmed(Vec<IndexedTransaction>),
}

/// Per-signer nonce cursor.
///
/// The cursor is initialized lazily from the ledger's pending transaction
/// count and only ever advances; `release` rolls back an assignment whose
/// transaction failed to persist, so the nonce is not burned.
pub struct NonceAllocator {
    signer: Address,
    ledger: Arc<dyn LedgerRpc>,
    cursor: Mutex<Option<u64>>,
}

impl NonceAllocator {
    pub fn new(signer: Address, ledger: Arc<dyn LedgerRpc>) -> Self {
        Self {
            signer,
            ledger,
            cursor: Mutex::new(None),
        }
    }

    /// Assign the next nonce, querying the ledger when uninitialized.
    pub async fn assign(&self) -> EngineResult<u64> {
        let mut cursor = self.cursor.lock().await;
        let next = match *cursor {
            Some(next) => next,
            None => {
                let count = self
                    .ledger
                    .get_transaction_count(self.signer, true)
                    .await
                    .map_err(|err| EngineError::NonceQueryFailed {
                        signer: format!("{:?}", self.signer),
                        message: err.to_string(),
                    })?;
                debug!(signer = ?self.signer, nonce = count, "initialized nonce cursor");
                count
            }
        };
        *cursor = Some(next + 1);
        Ok(next)
    }

    /// Roll back the most recent assignment (persist failed).
    pub async fn release(&self, nonce: u64) {
        let mut cursor = self.cursor.lock().await;
        if *cursor == Some(nonce + 1) {
            *cursor = Some(nonce);
        }
    }
}

pub struct SharedState {
    // std lock: reads are sync and never held across an await
    state: std::sync::RwLock<(OrchestratorState, Instant)>,
    inflight_count: AtomicUsize,
    stop: Notify,
}

/// Handle held by the engine for one spawned orchestrator.
pub struct OrchestratorHandle {
    signer: Address,
    cmd_tx: UnboundedSender<OrchestratorCommand>,
    shared: Arc<SharedState>,
    nonce: Arc<NonceAllocator>,
    join: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn send(&self, command: OrchestratorCommand) {
        if self.cmd_tx.send(command).is_err() {
            warn!(signer = ?self.signer, "orchestrator command channel closed");
        }
    }

    pub fn nonce_allocator(&self) -> Arc<NonceAllocator> {
        self.nonce.clone()
    }

    pub fn command_sender(&self) -> UnboundedSender<OrchestratorCommand> {
        self.cmd_tx.clone()
    }

    pub fn state(&self) -> (OrchestratorState, Instant) {
        *self.shared.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inflight_count(&self) -> usize {
        self.shared.inflight_count.load(Ordering::SeqCst)
    }

    /// Whether this orchestrator has been idle with no work for `max_idle`.
    pub fn reapable(&self, max_idle: Duration) -> bool {
        if self.inflight_count() > 0 {
            return false;
        }
        let (state, entered) = self.state();
        state == OrchestratorState::Idle && entered.elapsed() >= max_idle
    }

    pub fn stop(&self) {
        self.shared.stop.notify_one();
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Per-signer transaction orchestrator.
pub struct Orchestrator {
    signer: Address,
    cx: StageContext,
    max_inflight: Option<usize>,
    nonce: Arc<NonceAllocator>,
    shared: Arc<SharedState>,
    cmd_rx: UnboundedReceiver<OrchestratorCommand>,
    // Ascending by nonce; invariant: contiguous from the first unconfirmed
    inflight: Vec<InFlightTransaction>,
    backlog: VecDeque<PublicTx>,
    pending_confirmations: Vec<IndexedTransaction>,
    // Status changes for transactions not (yet) held here; persisted directly
    pending_direct_updates: Vec<(Uuid, PtxStatus)>,
}

impl Orchestrator {
    pub fn new(
        signer: Address,
        cx: StageContext,
        max_inflight: Option<usize>,
        nonce: Arc<NonceAllocator>,
    ) -> (Self, UnboundedSender<OrchestratorCommand>, Arc<SharedState>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            state: std::sync::RwLock::new((OrchestratorState::Idle, Instant::now())),
            inflight_count: AtomicUsize::new(0),
            stop: Notify::new(),
        });
        let orchestrator = Self {
            signer,
            cx,
            max_inflight,
            nonce,
            shared: shared.clone(),
            cmd_rx,
            inflight: Vec::new(),
            backlog: VecDeque::new(),
            pending_confirmations: Vec::new(),
            pending_direct_updates: Vec::new(),
        };
        (orchestrator, cmd_tx, shared)
    }

    /// Spawn an orchestrator task and return the engine-side handle. The
    /// nonce allocator is shared with the engine, which assigns nonces
    /// inline when materializing new requests.
    pub fn spawn(
        signer: Address,
        cx: StageContext,
        interval: Duration,
        max_inflight: Option<usize>,
        nonce: Arc<NonceAllocator>,
    ) -> OrchestratorHandle {
        let (orchestrator, cmd_tx, shared) =
            Self::new(signer, cx, max_inflight, nonce.clone());
        let join = tokio::spawn(orchestrator.run(interval));
        info!(?signer, "orchestrator started");
        OrchestratorHandle {
            signer,
            cmd_tx,
            shared,
            nonce,
            join: Some(join),
        }
    }

    async fn run(mut self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.stop.notified() => break,
                // A command wakes the loop so new work is picked up without
                // waiting out the poll interval
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.enqueue(command),
                    None => break,
                },
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        self.set_state(OrchestratorState::Stopping);
        info!(signer = ?self.signer, "orchestrator stopped");
    }

    fn enqueue(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Add(ptx) => self.enqueue_add(*ptx),
            OrchestratorCommand::StatusChange { id, target } => {
                self.backlog_status_change(id, target)
            }
            OrchestratorCommand::Confirmed(batch) => {
                // Processed in tick(), after remaining commands drain
                self.pending_confirmations.extend(batch);
            }
        }
    }

    fn enqueue_add(&mut self, ptx: PublicTx) {
        let known = self.inflight.iter().any(|ift| ift.id() == ptx.id)
            || self.backlog.iter().any(|queued| queued.id == ptx.id);
        if known {
            return;
        }
        debug!(signer = ?self.signer, id = %ptx.id, "queued transaction");
        self.backlog.push_back(ptx);
    }

    fn backlog_status_change(&mut self, id: Uuid, target: PtxStatus) {
        if let Some(ift) = self.inflight.iter_mut().find(|ift| ift.id() == id) {
            ift.queue_status_change(target);
            return;
        }
        if let Some(queued) = self.backlog.iter_mut().find(|queued| queued.id == id) {
            queued.status = target;
            return;
        }
        // Not routed here yet: persist directly so the change is not lost
        self.pending_direct_updates.push((id, target));
    }

    /// One scheduling pass: drain commands, admit, advance, reap.
    pub async fn tick(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            self.enqueue(command);
        }

        self.apply_direct_updates().await;
        self.admit().await;
        self.dispatch_confirmations().await;
        self.advance_all().await;
        self.reap_contiguous_head();

        self.shared
            .inflight_count
            .store(self.inflight.len() + self.backlog.len(), Ordering::SeqCst);
        let state = if self.inflight.is_empty() && self.backlog.is_empty() {
            OrchestratorState::Idle
        } else {
            OrchestratorState::Running
        };
        self.set_state(state);
    }

    async fn apply_direct_updates(&mut self) {
        for (id, target) in std::mem::take(&mut self.pending_direct_updates) {
            if let Err(err) = self
                .cx
                .store
                .update_transaction(id, &crate::types::PtxUpdate::status(target))
                .await
            {
                warn!(%id, error = %err, "failed to persist queued status change");
            }
        }
    }

    /// Admit backlog transactions up to the in-flight cap, assigning nonces
    /// in strict sequence for transactions recovered without one.
    async fn admit(&mut self) {
        while self
            .max_inflight
            .map_or(true, |cap| self.inflight.len() < cap)
        {
            let Some(mut ptx) = self.backlog.pop_front() else {
                break;
            };
            if ptx.nonce.is_none() {
                match self.nonce.assign().await {
                    Ok(nonce) => {
                        if let Err(err) = self
                            .cx
                            .store
                            .update_transaction(
                                ptx.id,
                                &crate::types::PtxUpdate {
                                    nonce: Some(nonce),
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            warn!(id = %ptx.id, error = %err, "failed to persist recovered nonce");
                            self.nonce.release(nonce).await;
                            self.backlog.push_front(ptx);
                            break;
                        }
                        ptx.nonce = Some(nonce);
                        let _ = self
                            .cx
                            .store
                            .update_sub_status(
                                ptx.id,
                                SubStatus::Received,
                                SubStatusAction::AssignNonce,
                                Some(serde_json::json!({ "nonce": nonce })),
                                None,
                                None,
                            )
                            .await;
                    }
                    Err(err) => {
                        // Transaction stays nonceless and is retried next tick
                        warn!(id = %ptx.id, error = %err, "nonce assignment failed");
                        self.backlog.push_front(ptx);
                        break;
                    }
                }
            }
            match InFlightTransaction::new(ptx) {
                Ok(ift) => {
                    self.inflight.push(ift);
                    self.inflight.sort_by_key(|ift| ift.nonce());
                }
                Err(err) => warn!(error = %err, "dropping unadmittable transaction"),
            }
        }
    }

    async fn dispatch_confirmations(&mut self) {
        let batch = std::mem::take(&mut self.pending_confirmations);
        for itx in batch {
            match self
                .inflight
                .iter_mut()
                .find(|ift| ift.nonce() == itx.nonce)
            {
                Some(ift) => ift.on_confirmed(&self.cx, &itx).await,
                None => {
                    debug!(
                        signer = ?self.signer,
                        nonce = itx.nonce,
                        "confirmation with no matching in-flight transaction"
                    );
                }
            }
        }
    }

    async fn advance_all(&mut self) {
        let mut stalled_head = false;
        for (index, ift) in self.inflight.iter_mut().enumerate() {
            let outcome = ift.advance(&self.cx).await;
            if outcome == StepOutcome::StalledForFunds && index == 0 {
                stalled_head = true;
            }
        }

        if stalled_head {
            let is_fueling = self
                .inflight
                .first()
                .map(|ift| ift.is_fueling())
                .unwrap_or(false);
            match self.cx.balance.ensure_fueled(self.signer, is_fueling).await {
                Ok(Some(fueling_tx)) => {
                    debug!(signer = ?self.signer, %fueling_tx, "fueling transfer in flight");
                }
                Ok(None) => {}
                Err(err) => {
                    // Stalled transactions stay at head; the treasury floor
                    // or a future market change reconciles them
                    warn!(signer = ?self.signer, error = %err, "fueling request refused");
                }
            }
        }
    }

    /// Remove terminal controllers from the head only while contiguous, so a
    /// terminal nonce N+1 is never reaped while N is still in flight.
    fn reap_contiguous_head(&mut self) {
        while let Some(head) = self.inflight.first() {
            if !head.is_terminal() {
                break;
            }
            let removed = self.inflight.remove(0);
            debug!(
                signer = ?self.signer,
                id = %removed.id(),
                nonce = removed.nonce(),
                "reaped completed transaction"
            );
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        let mut guard = self
            .shared
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.0 != state {
            *guard = (state, Instant::now());
        }
    }
}

#[cfg(test)]
impl Orchestrator {
    fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn inflight_nonces(&self) -> Vec<u64> {
        self.inflight.iter().map(|ift| ift.nonce()).collect()
    }

    fn attempt_hash(&self, nonce: u64) -> Option<ethers::types::H256> {
        self.inflight
            .iter()
            .find(|ift| ift.nonce() == nonce)
            .and_then(|ift| ift.attempts().last())
            .map(|attempt| attempt.hash)
    }
}
