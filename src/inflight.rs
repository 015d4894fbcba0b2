//! In-flight transaction stage controller
//!
//! One `InFlightTransaction` drives a single public transaction from nonce
//! assignment to confirmation: signing, submission, receipt tracking,
//! gas-price escalation and replacement, suspension and resumption. The
//! controller is advanced cooperatively by its orchestrator, one stage step
//! per tick, and never propagates errors upward; failures are absorbed into
//! the stage state and retried or made terminal locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, TransactionRequest, H256, U256,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::BalanceManager;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventNotifier, PublicTxEvent};
use crate::gas::{GasPriceOracle, GasPricing};
use crate::keys::{KeyManager, ALGORITHM_ECDSA_SECP256K1};
use crate::ledger::LedgerRpc;
use crate::store::TransactionStore;
use crate::types::{
    IndexedTransaction, PtxStatus, PtxUpdate, PublicTx, SubStatus, SubStatusAction,
    SubmissionAttempt, TxResult,
};

/// Lifecycle stage of one in-flight transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    SigningPending,
    Signed,
    SubmissionPending,
    Submitted,
    Tracking,
    RetryGasBump,
    StalledForFunds,
    Suspended,
    Confirmed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Confirmed | Stage::Failed)
    }
}

/// Resolved submission policy shared by all transactions of one signer.
#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    pub chain_id: u64,
    pub submission_retry_count: u32,
    pub resubmit_staleness: Duration,
    pub resubmit_price_margin_percent: u64,
    pub gas_price_increase_percent: u64,
    pub gas_price_increase_absolute: U256,
    pub gas_price_increase_max: U256,
}

/// Shared collaborators handed to the controller on every advance.
#[derive(Clone)]
pub struct StageContext {
    pub ledger: Arc<dyn LedgerRpc>,
    pub keys: Arc<dyn KeyManager>,
    pub store: Arc<dyn TransactionStore>,
    pub oracle: Arc<GasPriceOracle>,
    pub balance: Arc<BalanceManager>,
    pub notifier: Arc<dyn EventNotifier>,
    pub policy: SubmissionPolicy,
}

/// Result of one cooperative stage step, consumed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Moved to a new stage this tick
    Progressed,
    /// Nothing to do yet (tracking, suspended, transient failure)
    Waiting,
    /// Held until the signer is funded
    StalledForFunds,
    /// Reached a terminal status
    Terminal(PtxStatus),
}

struct SignedPayload {
    raw: Bytes,
    hash: H256,
    gas_pricing: GasPricing,
}

/// State machine driving one public transaction.
pub struct InFlightTransaction {
    ptx: PublicTx,
    stage: Stage,
    pre_suspend: Option<Stage>,
    key_handle: Option<String>,
    signed: Option<SignedPayload>,
    attempts: Vec<SubmissionAttempt>,
    last_receipt: Option<TransactionReceipt>,
    last_submission_at: Option<Instant>,
    warned_at_cap: bool,
    last_substatus: Option<(SubStatus, SubStatusAction)>,
    pending_status: Option<PtxStatus>,
}

impl InFlightTransaction {
    /// Wrap a persisted transaction; the nonce must already be assigned.
    pub fn new(ptx: PublicTx) -> EngineResult<Self> {
        if ptx.nonce.is_none() {
            return Err(EngineError::Internal(format!(
                "transaction {} admitted without a nonce",
                ptx.id
            )));
        }
        let stage = match ptx.status {
            PtxStatus::Suspended => Stage::Suspended,
            PtxStatus::Succeeded => Stage::Confirmed,
            PtxStatus::Failed => Stage::Failed,
            PtxStatus::Pending => Stage::Received,
        };
        Ok(Self {
            ptx,
            stage,
            pre_suspend: None,
            key_handle: None,
            signed: None,
            attempts: Vec::new(),
            last_receipt: None,
            last_submission_at: None,
            warned_at_cap: false,
            last_substatus: None,
            pending_status: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.ptx.id
    }

    pub fn signer(&self) -> Address {
        self.ptx.from
    }

    /// Safe after construction: `new` rejects nonceless transactions.
    pub fn nonce(&self) -> u64 {
        self.ptx.nonce.unwrap_or_default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_fueling(&self) -> bool {
        self.ptx.fueling
    }

    pub fn ptx(&self) -> &PublicTx {
        &self.ptx
    }

    pub fn attempts(&self) -> &[SubmissionAttempt] {
        &self.attempts
    }

    /// Most recent receipt observed by the tracker, if any.
    pub fn last_receipt(&self) -> Option<&TransactionReceipt> {
        self.last_receipt.as_ref()
    }

    /// Queue a suspend/resume from outside the orchestrator task; applied at
    /// the top of the next advance.
    pub fn queue_status_change(&mut self, target: PtxStatus) {
        self.pending_status = Some(target);
    }

    /// Advance the controller by at most one stage step.
    pub async fn advance(&mut self, cx: &StageContext) -> StepOutcome {
        if let Some(target) = self.pending_status.take() {
            self.apply_status_change(cx, target).await;
        }

        match self.stage {
            Stage::Received => {
                self.enter_stage(cx, Stage::SigningPending, None).await;
                StepOutcome::Progressed
            }
            Stage::SigningPending => self.step_signing(cx).await,
            Stage::Signed => {
                self.enter_stage(cx, Stage::SubmissionPending, None).await;
                StepOutcome::Progressed
            }
            Stage::SubmissionPending => self.step_submission(cx).await,
            Stage::Submitted => {
                self.enter_stage(cx, Stage::Tracking, None).await;
                StepOutcome::Progressed
            }
            Stage::Tracking => self.step_tracking(cx).await,
            Stage::RetryGasBump => self.step_gas_bump(cx).await,
            Stage::StalledForFunds => self.step_stalled(cx).await,
            Stage::Suspended => StepOutcome::Waiting,
            Stage::Confirmed => StepOutcome::Terminal(PtxStatus::Succeeded),
            Stage::Failed => StepOutcome::Terminal(PtxStatus::Failed),
        }
    }

    async fn step_signing(&mut self, cx: &StageContext) -> StepOutcome {
        // Gas limit: estimate once, with revert classified as fatal
        if self.ptx.gas_limit.is_none() {
            let unsigned = self.build_unsigned(&GasPricing::zero(), None, cx.policy.chain_id);
            match cx.ledger.estimate_gas(&unsigned).await {
                Ok(estimate) => {
                    self.ptx.gas_limit = Some(estimate);
                    if let Err(err) = cx
                        .store
                        .update_transaction(
                            self.ptx.id,
                            &PtxUpdate {
                                gas_limit: Some(estimate),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(id = %self.ptx.id, error = %err, "failed to persist gas estimate");
                        self.ptx.gas_limit = None;
                        return StepOutcome::Waiting;
                    }
                }
                Err(err) if err.is_execution_reverted() => {
                    return self.fail_terminal(cx, &err).await;
                }
                Err(err) => {
                    warn!(id = %self.ptx.id, error = %err, "gas estimate failed, will retry");
                    return StepOutcome::Waiting;
                }
            }
        }

        // Gas pricing: deferred to this point so new submissions track the
        // market at submission time
        if self.ptx.gas_pricing.is_none() {
            match cx.oracle.get_gas_price().await {
                Ok(pricing) => {
                    self.record_substatus(
                        cx,
                        SubStatus::Signing,
                        SubStatusAction::RetrieveGasPrice,
                        Some(serde_json::json!({ "gasPrice": pricing.to_string() })),
                        None,
                    )
                    .await;
                    self.ptx.gas_pricing = Some(pricing);
                }
                Err(err) => {
                    warn!(id = %self.ptx.id, error = %err, "gas price unavailable, will retry");
                    return StepOutcome::Waiting;
                }
            }
        }

        let gas_limit = self.ptx.gas_limit.unwrap_or_default();
        let pricing = match self.ptx.gas_pricing.clone() {
            Some(pricing) => pricing,
            None => return StepOutcome::Waiting,
        };

        match cx
            .balance
            .check_affordable(self.ptx.from, gas_limit, &pricing, self.ptx.value)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.enter_stage(cx, Stage::StalledForFunds, None).await;
                cx.notifier
                    .notify(PublicTxEvent::StalledForFunds { id: self.ptx.id });
                return StepOutcome::StalledForFunds;
            }
            Err(err) => {
                warn!(id = %self.ptx.id, error = %err, "balance check failed, will retry");
                return StepOutcome::Waiting;
            }
        }

        if self.sign_current(cx, &pricing).await {
            self.enter_stage(cx, Stage::Signed, None).await;
            StepOutcome::Progressed
        } else {
            StepOutcome::Waiting
        }
    }

    /// Resolve the key if needed and sign at the given price. Returns false
    /// on a (retryable) failure.
    async fn sign_current(&mut self, cx: &StageContext, pricing: &GasPricing) -> bool {
        if self.key_handle.is_none() {
            let identifier = format!("{:?}", self.ptx.from);
            match cx
                .keys
                .resolve_key(&identifier, ALGORITHM_ECDSA_SECP256K1)
                .await
            {
                Ok((handle, _address)) => self.key_handle = Some(handle),
                Err(err) => {
                    warn!(id = %self.ptx.id, error = %err, "key resolution failed, will retry");
                    return false;
                }
            }
        }
        let handle = match self.key_handle.as_deref() {
            Some(handle) => handle.to_string(),
            None => return false,
        };

        let unsigned = self.build_unsigned(pricing, self.ptx.nonce, cx.policy.chain_id);
        match cx.keys.sign_transaction(&handle, &unsigned).await {
            Ok(raw) => {
                let hash = H256::from(ethers::utils::keccak256(&raw));
                self.signed = Some(SignedPayload {
                    raw,
                    hash,
                    gas_pricing: pricing.clone(),
                });
                true
            }
            Err(err) => {
                warn!(id = %self.ptx.id, error = %err, "signing failed, will retry");
                false
            }
        }
    }

    async fn step_submission(&mut self, cx: &StageContext) -> StepOutcome {
        let (raw, hash, pricing) = match &self.signed {
            Some(signed) => (
                signed.raw.clone(),
                signed.hash,
                signed.gas_pricing.clone(),
            ),
            None => {
                // Lost the payload (resumed mid-flight); go back and re-sign
                self.enter_stage(cx, Stage::SigningPending, None).await;
                return StepOutcome::Progressed;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match cx.ledger.send_raw_transaction(raw.clone()).await {
                Ok(submitted_hash) => {
                    self.record_attempt(submitted_hash, pricing);
                    self.record_substatus(
                        cx,
                        SubStatus::Submitting,
                        SubStatusAction::Submit,
                        Some(serde_json::json!({ "hash": format!("{submitted_hash:?}") })),
                        None,
                    )
                    .await;
                    let nonce = self.nonce();
                    crate::metrics::record_tx_submitted();
                    let event = if self.attempts.len() > 1 {
                        crate::metrics::record_gas_bump();
                        PublicTxEvent::GasBumped {
                            id: self.ptx.id,
                            nonce,
                            hash: submitted_hash,
                        }
                    } else {
                        PublicTxEvent::Submitted {
                            id: self.ptx.id,
                            nonce,
                            hash: submitted_hash,
                        }
                    };
                    cx.notifier.notify(event);
                    self.enter_stage(cx, Stage::Submitted, None).await;
                    return StepOutcome::Progressed;
                }
                Err(err) => {
                    let message = err.to_string();
                    if message.contains("already known")
                        || message.contains("nonce too low")
                        || message.contains("replacement transaction underpriced")
                    {
                        // The ledger already has a transaction at this nonce;
                        // let the tracker work out which one lands
                        debug!(id = %self.ptx.id, error = %message, "submission deferred to tracker");
                        self.record_attempt(hash, pricing);
                        self.enter_stage(cx, Stage::Tracking, None).await;
                        return StepOutcome::Progressed;
                    }
                    if attempt > cx.policy.submission_retry_count {
                        warn!(
                            id = %self.ptx.id,
                            error = %message,
                            attempts = attempt,
                            "submission failed, giving the tick up"
                        );
                        self.record_substatus(
                            cx,
                            SubStatus::Submitting,
                            SubStatusAction::Submit,
                            None,
                            Some(message),
                        )
                        .await;
                        return StepOutcome::Waiting;
                    }
                    debug!(id = %self.ptx.id, error = %message, attempt, "retrying submission");
                }
            }
        }
    }

    async fn step_tracking(&mut self, cx: &StageContext) -> StepOutcome {
        let live = match self.attempts.last() {
            Some(attempt) => attempt.clone(),
            None => {
                self.enter_stage(cx, Stage::SigningPending, None).await;
                return StepOutcome::Progressed;
            }
        };

        match cx.ledger.get_transaction_receipt(live.hash).await {
            Ok(Some(receipt)) => {
                // Confirmation is owned by the block indexer; the receipt is
                // recorded for observability and bump suppression
                self.last_receipt = Some(receipt);
                return StepOutcome::Waiting;
            }
            Ok(None) => {}
            Err(err) => {
                debug!(id = %self.ptx.id, error = %err, "receipt query failed");
                return StepOutcome::Waiting;
            }
        }

        let market = match cx.oracle.get_gas_price().await {
            Ok(market) => market,
            Err(err) => {
                debug!(id = %self.ptx.id, error = %err, "market price unavailable");
                return StepOutcome::Waiting;
            }
        };
        let elapsed = self
            .last_submission_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);

        match plan_tracking(elapsed, &live.gas_pricing, &market, &cx.policy) {
            TrackAction::Wait => StepOutcome::Waiting,
            TrackAction::Bump(bumped) => {
                // Sub-status (with the new price) is appended by the bump
                // step itself
                self.ptx.gas_pricing = Some(bumped);
                self.stage = Stage::RetryGasBump;
                StepOutcome::Progressed
            }
            TrackAction::CapReached => {
                if !self.warned_at_cap {
                    warn!(
                        id = %self.ptx.id,
                        nonce = self.nonce(),
                        cap = %cx.policy.gas_price_increase_max,
                        "gas price cap reached; continuing to track without bumping"
                    );
                    self.warned_at_cap = true;
                }
                StepOutcome::Waiting
            }
        }
    }

    async fn step_gas_bump(&mut self, cx: &StageContext) -> StepOutcome {
        let pricing = match self.ptx.gas_pricing.clone() {
            Some(pricing) => pricing,
            None => {
                self.enter_stage(cx, Stage::SigningPending, None).await;
                return StepOutcome::Progressed;
            }
        };

        if let Err(err) = cx
            .store
            .update_transaction(
                self.ptx.id,
                &PtxUpdate {
                    gas_pricing: Some(pricing.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(id = %self.ptx.id, error = %err, "failed to persist bumped gas price");
            return StepOutcome::Waiting;
        }
        self.record_substatus(
            cx,
            SubStatus::Tracking,
            SubStatusAction::GasBump,
            Some(serde_json::json!({ "gasPrice": pricing.to_string() })),
            None,
        )
        .await;

        if self.sign_current(cx, &pricing).await {
            self.enter_stage(cx, Stage::SubmissionPending, None).await;
            StepOutcome::Progressed
        } else {
            StepOutcome::Waiting
        }
    }

    async fn step_stalled(&mut self, cx: &StageContext) -> StepOutcome {
        let gas_limit = self.ptx.gas_limit.unwrap_or_default();
        let pricing = match self.ptx.gas_pricing.clone() {
            Some(pricing) => pricing,
            None => {
                self.enter_stage(cx, Stage::SigningPending, None).await;
                return StepOutcome::Progressed;
            }
        };

        cx.balance.invalidate(self.ptx.from);
        match cx
            .balance
            .check_affordable(self.ptx.from, gas_limit, &pricing, self.ptx.value)
            .await
        {
            Ok(true) => {
                info!(id = %self.ptx.id, "signer funded, resuming submission");
                self.enter_stage(cx, Stage::SigningPending, None).await;
                StepOutcome::Progressed
            }
            Ok(false) => StepOutcome::StalledForFunds,
            Err(err) => {
                debug!(id = %self.ptx.id, error = %err, "balance check failed while stalled");
                StepOutcome::StalledForFunds
            }
        }
    }

    /// Handle a confirmation delivered by the block indexer. Idempotent:
    /// replaying a confirmation for a terminal transaction is a no-op.
    pub async fn on_confirmed(&mut self, cx: &StageContext, itx: &IndexedTransaction) {
        if self.stage.is_terminal() {
            return;
        }
        if Some(itx.nonce) != self.ptx.nonce {
            return;
        }

        let ours = self.attempts.iter().any(|attempt| attempt.hash == itx.hash);
        let (status, error) = if !ours && !self.attempts.is_empty() {
            // The nonce was consumed by a transaction we did not submit
            let err = EngineError::NonceConsumedOutOfBand {
                nonce: itx.nonce,
                hash: format!("{:?}", itx.hash),
            };
            warn!(id = %self.ptx.id, error = %err, "nonce consumed out of band");
            (PtxStatus::Failed, Some(err.to_string()))
        } else {
            match itx.result {
                TxResult::Success => (PtxStatus::Succeeded, None),
                TxResult::Failed => (PtxStatus::Failed, Some("transaction reverted".to_string())),
            }
        };

        if let Err(err) = cx
            .store
            .update_transaction(self.ptx.id, &PtxUpdate::status(status))
            .await
        {
            // Leave the stage unchanged; the next confirmation replay or
            // reconciliation pass retries the persist
            warn!(id = %self.ptx.id, error = %err, "failed to persist terminal status");
            return;
        }
        self.ptx.status = status;

        let sub_status = match status {
            PtxStatus::Succeeded => SubStatus::Confirmed,
            _ => SubStatus::Failed,
        };
        self.record_substatus(
            cx,
            sub_status,
            SubStatusAction::Confirm,
            Some(serde_json::json!({
                "blockNumber": itx.block_number,
                "hash": format!("{:?}", itx.hash),
            })),
            error,
        )
        .await;

        cx.notifier.notify(PublicTxEvent::Confirmed {
            id: self.ptx.id,
            nonce: itx.nonce,
            result: itx.result,
        });

        if self.ptx.fueling {
            if let Some(dest) = self.ptx.to {
                cx.balance.fueling_complete(dest);
            }
        }

        self.stage = match status {
            PtxStatus::Succeeded => Stage::Confirmed,
            _ => Stage::Failed,
        };
        crate::metrics::record_tx_final(status.as_str());
        let accepted_at = self.ptx.created_at;
        let latency = (Utc::now() - accepted_at).num_milliseconds().max(0) as f64 / 1000.0;
        crate::metrics::record_confirmation_latency(latency);
        info!(id = %self.ptx.id, nonce = itx.nonce, %status, "transaction confirmed");
    }

    async fn apply_status_change(&mut self, cx: &StageContext, target: PtxStatus) {
        match target {
            PtxStatus::Suspended if !self.stage.is_terminal() && self.stage != Stage::Suspended => {
                if let Err(err) = cx
                    .store
                    .update_transaction(self.ptx.id, &PtxUpdate::status(PtxStatus::Suspended))
                    .await
                {
                    warn!(id = %self.ptx.id, error = %err, "failed to persist suspension");
                    self.pending_status = Some(target);
                    return;
                }
                self.ptx.status = PtxStatus::Suspended;
                self.pre_suspend = Some(self.stage);
                self.enter_stage(cx, Stage::Suspended, None).await;
                cx.notifier
                    .notify(PublicTxEvent::Suspended { id: self.ptx.id });
            }
            PtxStatus::Pending if self.stage == Stage::Suspended => {
                if let Err(err) = cx
                    .store
                    .update_transaction(self.ptx.id, &PtxUpdate::status(PtxStatus::Pending))
                    .await
                {
                    warn!(id = %self.ptx.id, error = %err, "failed to persist resume");
                    self.pending_status = Some(target);
                    return;
                }
                self.ptx.status = PtxStatus::Pending;
                let resume_to = self.pre_suspend.take().unwrap_or(Stage::SigningPending);
                self.enter_stage(cx, resume_to, None).await;
                cx.notifier.notify(PublicTxEvent::Resumed { id: self.ptx.id });
            }
            _ => {
                // Already at the target, or terminal: nothing to do
            }
        }
    }

    async fn fail_terminal(&mut self, cx: &StageContext, err: &EngineError) -> StepOutcome {
        if let Err(store_err) = cx
            .store
            .update_transaction(self.ptx.id, &PtxUpdate::status(PtxStatus::Failed))
            .await
        {
            warn!(id = %self.ptx.id, error = %store_err, "failed to persist failure");
            return StepOutcome::Waiting;
        }
        self.ptx.status = PtxStatus::Failed;
        self.record_substatus(
            cx,
            SubStatus::Failed,
            SubStatusAction::Confirm,
            None,
            Some(err.to_string()),
        )
        .await;
        self.stage = Stage::Failed;
        crate::metrics::record_tx_final(PtxStatus::Failed.as_str());
        warn!(id = %self.ptx.id, error = %err, "transaction permanently failed");
        StepOutcome::Terminal(PtxStatus::Failed)
    }

    fn record_attempt(&mut self, hash: H256, gas_pricing: GasPricing) {
        let raw = self
            .signed
            .as_ref()
            .map(|signed| signed.raw.clone())
            .unwrap_or_default();
        self.attempts.push(SubmissionAttempt {
            attempt_id: Uuid::new_v4(),
            nonce: self.nonce(),
            gas_pricing,
            raw,
            hash,
            submitted_at: Utc::now(),
        });
        self.last_submission_at = Some(Instant::now());
    }

    async fn enter_stage(&mut self, cx: &StageContext, stage: Stage, error: Option<String>) {
        self.stage = stage;
        let (sub_status, action) = stage_entry(stage);
        self.record_substatus(cx, sub_status, action, None, error).await;
    }

    /// Append a sub-status, coalescing duplicates within the same stage.
    async fn record_substatus(
        &mut self,
        cx: &StageContext,
        sub_status: SubStatus,
        action: SubStatusAction,
        info: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if error.is_none() && self.last_substatus == Some((sub_status, action)) {
            return;
        }
        if let Err(err) = cx
            .store
            .update_sub_status(self.ptx.id, sub_status, action, info, error, None)
            .await
        {
            warn!(id = %self.ptx.id, error = %err, "failed to append sub-status");
            return;
        }
        self.last_substatus = Some((sub_status, action));
    }

    /// Build the unsigned transaction at the given price. `nonce` is absent
    /// for gas estimation calls.
    fn build_unsigned(
        &self,
        pricing: &GasPricing,
        nonce: Option<u64>,
        chain_id: u64,
    ) -> TypedTransaction {
        match pricing {
            GasPricing::Legacy(price) => {
                let mut request = TransactionRequest::new()
                    .from(self.ptx.from)
                    .value(self.ptx.value)
                    .data(self.ptx.data.clone())
                    .chain_id(chain_id);
                if let Some(to) = self.ptx.to {
                    request = request.to(to);
                }
                if let Some(nonce) = nonce {
                    request = request.nonce(nonce).gas_price(*price);
                }
                if let Some(gas) = self.ptx.gas_limit {
                    request = request.gas(gas);
                }
                TypedTransaction::Legacy(request)
            }
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut request = Eip1559TransactionRequest::new()
                    .from(self.ptx.from)
                    .value(self.ptx.value)
                    .data(self.ptx.data.clone())
                    .chain_id(chain_id);
                if let Some(to) = self.ptx.to {
                    request = request.to(to);
                }
                if let Some(nonce) = nonce {
                    request = request
                        .nonce(nonce)
                        .max_fee_per_gas(*max_fee_per_gas)
                        .max_priority_fee_per_gas(*max_priority_fee_per_gas);
                }
                if let Some(gas) = self.ptx.gas_limit {
                    request = request.gas(gas);
                }
                TypedTransaction::Eip1559(request)
            }
        }
    }
}

/// Replacement decision for a tracked, unconfirmed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackAction {
    /// Not stale enough, or the market has not moved past the margin
    Wait,
    /// Replace at this price, same nonce
    Bump(GasPricing),
    /// The configured ceiling leaves no headroom; keep tracking
    CapReached,
}

/// Pure escalation policy for the tracking stage: a submission is replaced
/// only when it has gone unconfirmed past the staleness threshold AND the
/// market exceeds its price by the configured margin. The driver executes
/// the returned action.
fn plan_tracking(
    elapsed: Duration,
    submitted: &GasPricing,
    market: &GasPricing,
    policy: &SubmissionPolicy,
) -> TrackAction {
    if elapsed < policy.resubmit_staleness {
        return TrackAction::Wait;
    }
    if !submitted.market_exceeds(market, policy.resubmit_price_margin_percent) {
        return TrackAction::Wait;
    }
    match submitted.bumped(
        policy.gas_price_increase_percent,
        policy.gas_price_increase_absolute,
        policy.gas_price_increase_max,
    ) {
        Some(bumped) => TrackAction::Bump(bumped),
        None => TrackAction::CapReached,
    }
}

/// Sub-status appended when a stage is entered.
fn stage_entry(stage: Stage) -> (SubStatus, SubStatusAction) {
    match stage {
        Stage::Received => (SubStatus::Received, SubStatusAction::AssignNonce),
        Stage::SigningPending | Stage::Signed => (SubStatus::Signing, SubStatusAction::Sign),
        Stage::SubmissionPending | Stage::Submitted => {
            (SubStatus::Submitting, SubStatusAction::Submit)
        }
        Stage::Tracking => (SubStatus::Tracking, SubStatusAction::Track),
        Stage::RetryGasBump => (SubStatus::Tracking, SubStatusAction::GasBump),
        Stage::StalledForFunds => (SubStatus::Stalled, SubStatusAction::RequestFueling),
        Stage::Suspended => (SubStatus::Suspended, SubStatusAction::Suspend),
        Stage::Confirmed => (SubStatus::Confirmed, SubStatusAction::Confirm),
        Stage::Failed => (SubStatus::Failed, SubStatusAction::Confirm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{confirmation, TestHarness};

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    async fn advance_until(
        ift: &mut InFlightTransaction,
        cx: &StageContext,
        target: Stage,
        max_steps: usize,
    ) {
        for _ in 0..max_steps {
            if ift.stage() == target {
                return;
            }
            ift.advance(cx).await;
        }
        assert_eq!(ift.stage(), target, "did not reach {target:?}");
    }

    #[tokio::test]
    async fn test_happy_path_reaches_tracking_with_one_attempt() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(1, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        assert_eq!(ift.attempts().len(), 1);
        assert_eq!(ift.attempts()[0].nonce, 1);
        assert_eq!(harness.ledger.sent().len(), 1);
        // Gas limit was provided, so no estimate call happened
        assert_eq!(harness.ledger.estimate_calls(), 0);

        // Tracking with no receipt and fresh submission just waits
        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
    }

    #[tokio::test]
    async fn test_missing_gas_limit_is_estimated_and_persisted() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.set_estimate(U256::from(53_000u64));
        let ptx = harness.pending_transfer(0, None).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        assert_eq!(harness.ledger.estimate_calls(), 1);
        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.gas_limit, Some(U256::from(53_000u64)));
    }

    #[tokio::test]
    async fn test_reverted_estimate_is_terminal() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.fail_estimate("execution reverted: bad input");
        let ptx = harness.pending_transfer(0, None).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        assert_eq!(
            ift.advance(&cx).await,
            StepOutcome::Terminal(PtxStatus::Failed)
        );
        assert_eq!(ift.stage(), Stage::Failed);

        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PtxStatus::Failed);
    }

    #[tokio::test]
    async fn test_transient_estimate_failure_retries() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.fail_estimate("connection refused");
        let ptx = harness.pending_transfer(0, None).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
        assert_eq!(ift.stage(), Stage::SigningPending);

        harness.ledger.set_estimate(U256::from(21_000u64));
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
    }

    #[tokio::test]
    async fn test_unaffordable_submission_stalls_until_funded() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.set_balance(harness.signer, U256::from(1u64));
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        assert_eq!(ift.advance(&cx).await, StepOutcome::StalledForFunds);
        assert_eq!(ift.stage(), Stage::StalledForFunds);
        // Still stalled while the balance stays low
        assert_eq!(ift.advance(&cx).await, StepOutcome::StalledForFunds);

        harness.ledger.set_balance(harness.signer, gwei(1_000_000));
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
    }

    #[tokio::test]
    async fn test_stale_submission_bumps_and_resubmits_same_nonce() {
        let harness = TestHarness::new();
        let mut policy = TestHarness::default_policy();
        policy.resubmit_staleness = Duration::ZERO;
        let cx = harness.stage_context_with(policy);
        let ptx = harness.pending_transfer(5, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
        let first = ift.attempts()[0].clone();

        // Market doubles: margin exceeded, bump fires
        harness.ledger.set_gas_price(gwei(2));
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        assert_eq!(ift.stage(), Stage::RetryGasBump);
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        assert_eq!(ift.attempts().len(), 2);
        let second = ift.attempts()[1].clone();
        assert_eq!(second.nonce, first.nonce);
        assert_ne!(second.hash, first.hash);
        assert!(
            second.gas_pricing.max_cost_per_gas() > first.gas_pricing.max_cost_per_gas()
        );
    }

    #[test]
    fn test_plan_tracking_decision_table() {
        let mut policy = TestHarness::default_policy();
        let submitted = GasPricing::Legacy(gwei(1));

        // Fresh submission: wait, no matter how far the market has moved
        assert_eq!(
            plan_tracking(
                Duration::ZERO,
                &submitted,
                &GasPricing::Legacy(gwei(100)),
                &policy
            ),
            TrackAction::Wait
        );

        // Stale, but the market is within the 10% margin: wait
        policy.resubmit_staleness = Duration::ZERO;
        assert_eq!(
            plan_tracking(
                Duration::ZERO,
                &submitted,
                &GasPricing::Legacy(gwei(1)),
                &policy
            ),
            TrackAction::Wait
        );

        // Stale and the market cleared the margin: bump, strictly upward
        match plan_tracking(
            Duration::ZERO,
            &submitted,
            &GasPricing::Legacy(gwei(2)),
            &policy,
        ) {
            TrackAction::Bump(bumped) => {
                assert!(bumped.max_cost_per_gas() > submitted.max_cost_per_gas());
            }
            other => panic!("expected a bump, got {other:?}"),
        }

        // No headroom under the ceiling: cap reached, keep tracking
        policy.gas_price_increase_max = gwei(1);
        assert_eq!(
            plan_tracking(
                Duration::ZERO,
                &submitted,
                &GasPricing::Legacy(gwei(2)),
                &policy
            ),
            TrackAction::CapReached
        );
    }

    #[tokio::test]
    async fn test_observed_receipt_suppresses_bumping() {
        let harness = TestHarness::new();
        let mut policy = TestHarness::default_policy();
        policy.resubmit_staleness = Duration::ZERO;
        let cx = harness.stage_context_with(policy);
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        // A receipt is visible for the live hash: even with the market well
        // above the submitted price, no replacement is sent
        let hash = ift.attempts()[0].hash;
        harness.ledger.set_receipt(hash, TransactionReceipt::default());
        harness.ledger.set_gas_price(U256::from(10u64) * U256::from(1_000_000_000u64));

        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
        assert_eq!(ift.stage(), Stage::Tracking);
        assert_eq!(ift.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_bump_suppressed_at_cap_keeps_tracking() {
        let harness = TestHarness::new();
        let mut policy = TestHarness::default_policy();
        policy.resubmit_staleness = Duration::ZERO;
        // Cap equals the submitted price: no headroom
        policy.gas_price_increase_max = gwei(1);
        let cx = harness.stage_context_with(policy);
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        harness.ledger.set_gas_price(gwei(10));
        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
        assert_eq!(ift.stage(), Stage::Tracking);
        assert_eq!(ift.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_nonce_too_low_defers_to_tracker() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.push_send_error("nonce too low");
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
        // The attempt is recorded so confirmation matching still works
        assert_eq!(ift.attempts().len(), 1);
        assert!(harness.ledger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transient_send_errors_retried_within_tick() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.push_send_error("connection reset");
        harness.ledger.push_send_error("connection reset");
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        // retry_count = 2: two failures then success inside one tick
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
        assert_eq!(harness.ledger.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_errors_exhausting_retries_wait_for_next_tick() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        for _ in 0..3 {
            harness.ledger.push_send_error("connection reset");
        }
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::SubmissionPending, 10).await;
        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
        assert_eq!(ift.stage(), Stage::SubmissionPending);

        // Queue drained: the next tick submits
        assert_eq!(ift.advance(&cx).await, StepOutcome::Progressed);
        assert_eq!(ift.stage(), Stage::Submitted);
    }

    #[tokio::test]
    async fn test_confirmation_success_is_terminal_and_idempotent() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(3, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;
        let hash = ift.attempts()[0].hash;

        let itx = confirmation(harness.signer, 3, hash, TxResult::Success);
        ift.on_confirmed(&cx, &itx).await;
        assert_eq!(ift.stage(), Stage::Confirmed);
        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PtxStatus::Succeeded);

        // Replaying the confirmation changes nothing
        ift.on_confirmed(&cx, &itx).await;
        assert_eq!(ift.stage(), Stage::Confirmed);
        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PtxStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_confirmation_with_foreign_hash_fails_out_of_band() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(4, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        let foreign = H256::random();
        ift.on_confirmed(
            &cx,
            &confirmation(harness.signer, 4, foreign, TxResult::Success),
        )
        .await;
        assert_eq!(ift.stage(), Stage::Failed);

        let history = harness.store.sub_status_history(ptx.id).await;
        let last = history.last().unwrap();
        assert!(last.error.as_deref().unwrap_or("").contains("out of band"));
    }

    #[tokio::test]
    async fn test_confirmation_for_other_nonce_is_ignored() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(7, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        ift.on_confirmed(
            &cx,
            &confirmation(harness.signer, 8, H256::random(), TxResult::Success),
        )
        .await;
        assert_eq!(ift.stage(), Stage::Tracking);
    }

    #[tokio::test]
    async fn test_suspend_and_resume_return_to_prior_stage() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        ift.queue_status_change(PtxStatus::Suspended);
        assert_eq!(ift.advance(&cx).await, StepOutcome::Waiting);
        assert_eq!(ift.stage(), Stage::Suspended);
        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PtxStatus::Suspended);

        // A suspended transaction still accepts confirmations
        let hash = ift.attempts()[0].hash;
        ift.on_confirmed(
            &cx,
            &confirmation(harness.signer, 0, hash, TxResult::Success),
        )
        .await;
        assert_eq!(ift.stage(), Stage::Confirmed);
    }

    #[tokio::test]
    async fn test_resume_restores_tracking() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        let ptx = harness.pending_transfer(0, Some(U256::from(21_000u64))).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        advance_until(&mut ift, &cx, Stage::Tracking, 10).await;

        ift.queue_status_change(PtxStatus::Suspended);
        ift.advance(&cx).await;
        assert_eq!(ift.stage(), Stage::Suspended);

        ift.queue_status_change(PtxStatus::Pending);
        ift.advance(&cx).await;
        assert_eq!(ift.stage(), Stage::Tracking);
        let stored = harness
            .store
            .get_transaction_by_id(ptx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PtxStatus::Pending);
    }

    #[tokio::test]
    async fn test_substatus_duplicates_coalesced() {
        let harness = TestHarness::new();
        let cx = harness.stage_context();
        harness.ledger.fail_estimate("connection refused");
        let ptx = harness.pending_transfer(0, None).await;

        let mut ift = InFlightTransaction::new(ptx.clone()).unwrap();
        // Several failing ticks in the same stage
        for _ in 0..4 {
            ift.advance(&cx).await;
        }
        let history = harness.store.sub_status_history(ptx.id).await;
        let signing_entries = history
            .iter()
            .filter(|entry| {
                entry.sub_status == SubStatus::Signing && entry.action == SubStatusAction::Sign
            })
            .count();
        assert_eq!(signing_entries, 1);
    }

    #[tokio::test]
    async fn test_nonceless_transaction_rejected() {
        let harness = TestHarness::new();
        let mut ptx = PublicTx::new(Uuid::new_v4(), harness.signer);
        ptx.nonce = None;
        assert!(InFlightTransaction::new(ptx).is_err());
    }
}
