//! Core data model for publicly submitted transactions
//!
//! A `PublicTx` is the durable record of one outbound ledger transaction.
//! It is persisted through the [`crate::store::TransactionStore`] and only
//! mutated via that store's update API; the in-flight working state lives in
//! [`crate::inflight::InFlightTransaction`].

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gas::GasPricing;

/// Durable status of a public transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtxStatus {
    /// In flight or queued for submission
    Pending,
    /// Parked by an operator; will not submit or bump until resumed
    Suspended,
    /// Confirmed with a success result
    Succeeded,
    /// Confirmed with a revert, or permanently rejected
    Failed,
}

impl PtxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PtxStatus::Succeeded | PtxStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PtxStatus::Pending => "pending",
            PtxStatus::Suspended => "suspended",
            PtxStatus::Succeeded => "succeeded",
            PtxStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PtxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress annotation appended to a transaction's history on stage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    Received,
    Signing,
    Submitting,
    Tracking,
    Stalled,
    Suspended,
    Confirmed,
    Failed,
}

impl SubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::Received => "received",
            SubStatus::Signing => "signing",
            SubStatus::Submitting => "submitting",
            SubStatus::Tracking => "tracking",
            SubStatus::Stalled => "stalled",
            SubStatus::Suspended => "suspended",
            SubStatus::Confirmed => "confirmed",
            SubStatus::Failed => "failed",
        }
    }
}

/// The action that produced a sub-status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatusAction {
    AssignNonce,
    RetrieveGasPrice,
    Sign,
    Submit,
    GasBump,
    Track,
    RequestFueling,
    Confirm,
    Suspend,
    Resume,
}

impl SubStatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatusAction::AssignNonce => "assign_nonce",
            SubStatusAction::RetrieveGasPrice => "retrieve_gas_price",
            SubStatusAction::Sign => "sign",
            SubStatusAction::Submit => "submit",
            SubStatusAction::GasBump => "gas_bump",
            SubStatusAction::Track => "track",
            SubStatusAction::RequestFueling => "request_fueling",
            SubStatusAction::Confirm => "confirm",
            SubStatusAction::Suspend => "suspend",
            SubStatusAction::Resume => "resume",
        }
    }
}

/// Durable record of one outbound public transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTx {
    pub id: Uuid,
    pub from: Address,
    /// None for contract deployments
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    /// None until estimated
    pub gas_limit: Option<U256>,
    /// None while deferred to submission time; populated at insert on
    /// zero-gas chains
    pub gas_pricing: Option<GasPricing>,
    /// Assigned exactly once, under the per-signer nonce lock
    pub nonce: Option<u64>,
    pub status: PtxStatus,
    /// Treasury top-up transfers are flagged so they never request fueling
    /// themselves
    pub fueling: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublicTx {
    pub fn new(id: Uuid, from: Address) -> Self {
        let now = Utc::now();
        Self {
            id,
            from,
            to: None,
            data: Bytes::new(),
            value: U256::zero(),
            gas_limit: None,
            gas_pricing: None,
            nonce: None,
            status: PtxStatus::Pending,
            fueling: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied through the store's update API.
///
/// Fields left as `None` are not modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PtxUpdate {
    pub status: Option<PtxStatus>,
    pub nonce: Option<u64>,
    pub gas_limit: Option<U256>,
    pub gas_pricing: Option<GasPricing>,
}

impl PtxUpdate {
    pub fn status(status: PtxStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Filter for listing transactions from the store.
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub from: Option<Address>,
    pub statuses: Vec<PtxStatus>,
    pub limit: Option<usize>,
}

impl TxFilter {
    /// All non-terminal transactions, oldest first.
    pub fn open() -> Self {
        Self {
            statuses: vec![PtxStatus::Pending, PtxStatus::Suspended],
            ..Default::default()
        }
    }
}

/// One signed submission of a transaction to the ledger.
///
/// A transaction accumulates multiple attempts when its gas price is bumped;
/// all attempts share the nonce and the latest one is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub attempt_id: Uuid,
    pub nonce: u64,
    pub gas_pricing: GasPricing,
    pub raw: Bytes,
    pub hash: H256,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of a confirmed transaction as reported by the block indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxResult {
    Success,
    Failed,
}

/// A confirmed transaction delivered by the block indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub block_number: u64,
    pub tx_index: u64,
    pub hash: H256,
    pub result: TxResult,
    pub nonce: u64,
    pub from: Address,
}
