//! Block indexer interface
//!
//! The block indexer is an external collaborator: it watches the ledger and
//! delivers batches of confirmed transactions. The engine registers a
//! handler at startup and dispatches each batch to the owning orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::types::IndexedTransaction;

/// Handler invoked with each batch of confirmed transactions.
pub type IndexedTxHandler =
    Arc<dyn Fn(Vec<IndexedTransaction>) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// Registration interface exposed by the block indexer.
#[async_trait]
pub trait BlockIndexer: Send + Sync {
    async fn register_indexed_transaction_handler(
        &self,
        handler: IndexedTxHandler,
    ) -> EngineResult<()>;
}

/// Adapter for processes where confirmations arrive over a channel from a
/// separate indexing subsystem. Producers push batches through
/// [`ChannelBlockIndexer::feed`]; the registered handler receives them.
pub struct ChannelBlockIndexer {
    handler: RwLock<Option<IndexedTxHandler>>,
}

impl Default for ChannelBlockIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBlockIndexer {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }

    /// Deliver one batch to the registered handler.
    pub async fn feed(&self, batch: Vec<IndexedTransaction>) -> EngineResult<()> {
        let handler = self.handler.read().await;
        match handler.as_ref() {
            Some(handler) => handler(batch).await,
            None => {
                warn!("dropping {} confirmations: no handler registered", batch.len());
                Err(EngineError::Internal(
                    "no indexed transaction handler registered".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl BlockIndexer for ChannelBlockIndexer {
    async fn register_indexed_transaction_handler(
        &self,
        handler: IndexedTxHandler,
    ) -> EngineResult<()> {
        *self.handler.write().await = Some(handler);
        Ok(())
    }
}
