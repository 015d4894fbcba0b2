//! User-visible progress events
//!
//! Components fire [`PublicTxEvent`]s as transactions move through their
//! lifecycle; the notifier fans them out to whatever surface the embedding
//! process wires up (RPC subscriptions, logs, tests).

use ethers::types::H256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::TxResult;

/// Progress event for one public transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PublicTxEvent {
    Submitted {
        id: Uuid,
        nonce: u64,
        hash: H256,
    },
    GasBumped {
        id: Uuid,
        nonce: u64,
        hash: H256,
    },
    StalledForFunds {
        id: Uuid,
    },
    Confirmed {
        id: Uuid,
        nonce: u64,
        result: TxResult,
    },
    Suspended {
        id: Uuid,
    },
    Resumed {
        id: Uuid,
    },
}

impl PublicTxEvent {
    /// Event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            PublicTxEvent::Submitted { .. } => "submitted",
            PublicTxEvent::GasBumped { .. } => "gas_bumped",
            PublicTxEvent::StalledForFunds { .. } => "stalled_for_funds",
            PublicTxEvent::Confirmed { .. } => "confirmed",
            PublicTxEvent::Suspended { .. } => "suspended",
            PublicTxEvent::Resumed { .. } => "resumed",
        }
    }
}

/// Receives user-visible progress events.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: PublicTxEvent);
}

/// Notifier that fans events out over a tokio broadcast channel.
pub struct BroadcastNotifier {
    sender: tokio::sync::broadcast::Sender<PublicTxEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PublicTxEvent> {
        self.sender.subscribe()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn notify(&self, event: PublicTxEvent) {
        // No receivers is fine; events are best-effort
        let _ = self.sender.send(event);
    }
}
