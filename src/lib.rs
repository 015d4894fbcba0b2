//! txpilot: public transaction engine for EVM-compatible ledgers
//!
//! txpilot accepts abstract transaction requests (transfers, contract
//! invocations, deployments), materializes them into signed, gas-priced,
//! nonce-ordered submissions, and drives each one through its lifecycle:
//! signing, submission, receipt tracking, gas-price escalation and
//! replacement, and confirmation. One orchestrator per signing address
//! enforces strict nonce ordering and bounded in-flight concurrency; a
//! balance manager auto-fuels signers from a treasury address.
//!
//! The crate is consumed as a library (see [`engine::Engine`]) with traits
//! at every external seam: [`ledger::LedgerRpc`], [`keys::KeyManager`],
//! [`store::TransactionStore`], [`indexer::BlockIndexer`] and
//! [`events::EventNotifier`]. The bundled binary wires the provided
//! implementations (ethers RPC client, local wallets, Postgres store) into
//! a daemon.

pub mod balance;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gas;
pub mod indexer;
pub mod inflight;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod payload;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::{Engine, TxRequest};
pub use error::{EngineError, EngineResult};
pub use types::{PtxStatus, PublicTx};
