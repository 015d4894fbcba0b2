//! In-memory transaction store for tests and local development

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{SubStatusEntry, TransactionStore};
use crate::error::{EngineError, EngineResult};
use crate::types::{PtxUpdate, PublicTx, SubStatus, SubStatusAction, TxFilter};

/// Stores transactions and their sub-status history in process memory.
#[derive(Default)]
pub struct InMemoryTxStore {
    transactions: RwLock<HashMap<Uuid, PublicTx>>,
    sub_statuses: RwLock<Vec<SubStatusEntry>>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sub-status history for one transaction, oldest first.
    pub async fn sub_status_history(&self, id: Uuid) -> Vec<SubStatusEntry> {
        self.sub_statuses
            .read()
            .await
            .iter()
            .filter(|entry| entry.tx_id == id)
            .cloned()
            .collect()
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTxStore {
    async fn insert_transaction(&self, tx: &PublicTx) -> EngineResult<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(EngineError::DuplicateTransactionId { id: tx.id });
        }
        transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_transaction(&self, id: Uuid, updates: &PtxUpdate) -> EngineResult<()> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(&id)
            .ok_or(EngineError::TransactionNotFound { id })?;
        if let Some(status) = updates.status {
            tx.status = status;
        }
        if let Some(nonce) = updates.nonce {
            tx.nonce = Some(nonce);
        }
        if let Some(gas_limit) = updates.gas_limit {
            tx.gas_limit = Some(gas_limit);
        }
        if let Some(gas_pricing) = &updates.gas_pricing {
            tx.gas_pricing = Some(gas_pricing.clone());
        }
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn get_transaction_by_id(&self, id: Uuid) -> EngineResult<Option<PublicTx>> {
        Ok(self.transactions.read().await.get(&id).cloned())
    }

    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTx>> {
        let transactions = self.transactions.read().await;
        let mut matched: Vec<PublicTx> = transactions
            .values()
            .filter(|tx| filter.from.map_or(true, |from| tx.from == from))
            .filter(|tx| filter.statuses.is_empty() || filter.statuses.contains(&tx.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.nonce.cmp(&b.nonce))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update_sub_status(
        &self,
        id: Uuid,
        sub_status: SubStatus,
        action: SubStatusAction,
        info: Option<serde_json::Value>,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        self.sub_statuses.write().await.push(SubStatusEntry {
            tx_id: id,
            sub_status,
            action,
            info,
            error,
            metadata,
            occurred_at: Utc::now(),
        });
        Ok(())
    }
}
