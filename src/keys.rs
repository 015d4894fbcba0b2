//! Key resolution and transaction signing
//!
//! The engine resolves a signer identifier to a key handle plus its ledger
//! address before materializing a transaction, then signs each submission
//! attempt through the same interface. The bundled implementation holds
//! local wallets; production deployments substitute a remote key manager.

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use tracing::info;

use crate::config::WalletConfig;
use crate::error::{EngineError, EngineResult};

/// Signing algorithm used for all public transactions.
pub const ALGORITHM_ECDSA_SECP256K1: &str = "ecdsa:secp256k1";

/// Key resolution and signing interface.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Resolve a signer identifier to an opaque key handle and the ledger
    /// address it signs as.
    async fn resolve_key(
        &self,
        identifier: &str,
        algorithm: &str,
    ) -> EngineResult<(String, Address)>;

    /// Sign a transaction, returning the raw signed bytes ready for
    /// submission.
    async fn sign_transaction(&self, key_handle: &str, tx: &TypedTransaction)
        -> EngineResult<Bytes>;
}

/// Key manager backed by in-process wallets.
pub struct LocalWalletKeyManager {
    wallets: DashMap<Address, LocalWallet>,
    chain_id: u64,
}

impl LocalWalletKeyManager {
    /// Load wallets from configuration. The private-key environment variable
    /// is the development path; a keystore is the production path.
    pub fn from_config(config: &WalletConfig, chain_id: u64) -> EngineResult<Self> {
        let manager = Self {
            wallets: DashMap::new(),
            chain_id,
        };

        if let Some(env_name) = &config.private_key_env {
            if let Ok(key) = std::env::var(env_name) {
                manager.add_private_key(&key)?;
                return Ok(manager);
            }
        }

        Err(EngineError::Config(format!(
            "no wallet configured: set {} or configure a keystore",
            config
                .private_key_env
                .as_deref()
                .unwrap_or("the private key environment variable")
        )))
    }

    /// Register a raw private key, returning the derived address.
    pub fn add_private_key(&self, key: &str) -> EngineResult<Address> {
        let wallet: LocalWallet = key
            .parse()
            .map_err(|err| EngineError::KeyResolution(format!("invalid private key: {err}")))?;
        let wallet = wallet.with_chain_id(self.chain_id);
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        info!(?address, "registered signing key");
        Ok(address)
    }

    #[cfg(test)]
    pub fn new_random(chain_id: u64) -> (Self, Address) {
        let manager = Self {
            wallets: DashMap::new(),
            chain_id,
        };
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng())
            .with_chain_id(chain_id);
        let address = wallet.address();
        manager.wallets.insert(address, wallet);
        (manager, address)
    }
}

#[async_trait]
impl KeyManager for LocalWalletKeyManager {
    async fn resolve_key(
        &self,
        identifier: &str,
        algorithm: &str,
    ) -> EngineResult<(String, Address)> {
        if algorithm != ALGORITHM_ECDSA_SECP256K1 {
            return Err(EngineError::KeyResolution(format!(
                "unsupported signing algorithm {algorithm}"
            )));
        }
        let address: Address = identifier.parse().map_err(|_| {
            EngineError::KeyResolution(format!("signer identifier {identifier} is not an address"))
        })?;
        if !self.wallets.contains_key(&address) {
            return Err(EngineError::KeyResolution(format!(
                "no key available for {identifier}"
            )));
        }
        Ok((format!("{address:?}"), address))
    }

    async fn sign_transaction(
        &self,
        key_handle: &str,
        tx: &TypedTransaction,
    ) -> EngineResult<Bytes> {
        let address: Address = key_handle
            .parse()
            .map_err(|_| EngineError::Signing(format!("invalid key handle {key_handle}")))?;
        let wallet = self
            .wallets
            .get(&address)
            .ok_or_else(|| EngineError::Signing(format!("no key available for {key_handle}")))?;
        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|err| EngineError::Signing(err.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}
