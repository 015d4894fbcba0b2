//! Durable transaction storage
//!
//! The engine persists every public transaction and an append-only
//! sub-status history through the [`TransactionStore`] interface. The
//! Postgres backend is the production path; the in-memory backend backs
//! tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::types::{PtxUpdate, PublicTx, SubStatus, SubStatusAction, TxFilter};

pub mod mem;
pub mod postgres;

pub use mem::InMemoryTxStore;
pub use postgres::PgTxStore;

/// One appended sub-status history entry.
#[derive(Debug, Clone)]
pub struct SubStatusEntry {
    pub tx_id: Uuid,
    pub sub_status: SubStatus,
    pub action: SubStatusAction,
    pub info: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Persistence interface for public transactions.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new transaction. Inserting an id that already exists is a
    /// deterministic `DuplicateID` error.
    async fn insert_transaction(&self, tx: &PublicTx) -> EngineResult<()>;

    /// Apply a partial update; `None` fields are left untouched.
    async fn update_transaction(&self, id: Uuid, updates: &PtxUpdate) -> EngineResult<()>;

    async fn get_transaction_by_id(&self, id: Uuid) -> EngineResult<Option<PublicTx>>;

    /// List transactions matching the filter, oldest first.
    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTx>>;

    /// Append a sub-status history entry.
    async fn update_sub_status(
        &self,
        id: Uuid,
        sub_status: SubStatus,
        action: SubStatusAction,
        info: Option<serde_json::Value>,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<()>;
}
