//! Error types for the public transaction engine

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the engine and its components.
///
/// Every externally surfaced variant carries a stable string code (see
/// [`EngineError::code`]) so callers and operators can branch on it without
/// parsing messages.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gas price configuration invalid: {0}")]
    GasPriceConfigInvalid(String),

    #[error("Transaction request is missing an ID")]
    TransactionIdMissing,

    #[error("Unsupported payload variant: {0}")]
    UnsupportedPayloadVariant(String),

    #[error("Invalid payload: {0}")]
    PayloadInvalid(String),

    #[error("Transaction {id} already exists")]
    DuplicateTransactionId { id: Uuid },

    #[error("Transaction {id} is in terminal status {status} and cannot be updated")]
    TerminalStatusUpdate { id: Uuid, status: String },

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: Uuid },

    #[error("Context cancelled")]
    ContextCancelled,

    #[error("Gas price unavailable: {0}")]
    GasPriceUnavailable(String),

    #[error("Nonce query failed for signer {signer}: {message}")]
    NonceQueryFailed { signer: String, message: String },

    #[error("Nonce {nonce} consumed out of band by transaction {hash}")]
    NonceConsumedOutOfBand { nonce: u64, hash: String },

    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Fueling source {fueling_source} balance {balance} below configured minimum {minimum}")]
    FuelingSourceBelowMinimum {
        fueling_source: String,
        balance: String,
        minimum: String,
    },

    #[error("Insufficient balance for signer {signer}: have {have}, need {need}")]
    InsufficientBalance {
        signer: String,
        have: String,
        need: String,
    },

    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("Execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Key resolution error: {0}")]
    KeyResolution(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable identifier for external callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "ConfigInvalid",
            EngineError::GasPriceConfigInvalid(_) => "GasPriceConfigInvalid",
            EngineError::TransactionIdMissing => "TransactionIDMissing",
            EngineError::UnsupportedPayloadVariant(_) => "UnsupportedPayloadVariant",
            EngineError::PayloadInvalid(_) => "PayloadInvalid",
            EngineError::DuplicateTransactionId { .. } => "DuplicateID",
            EngineError::TerminalStatusUpdate { .. } => "TerminalStatusUpdate",
            EngineError::TransactionNotFound { .. } => "TransactionNotFound",
            EngineError::ContextCancelled => "ContextCancelled",
            EngineError::GasPriceUnavailable(_) => "GasPriceUnavailable",
            EngineError::NonceQueryFailed { .. } => "NonceQueryFailed",
            EngineError::NonceConsumedOutOfBand { .. } => "NonceConsumedOutOfBand",
            EngineError::SubmissionRejected(_) => "SubmissionRejected",
            EngineError::FuelingSourceBelowMinimum { .. } => "FuelingSourceBelowMinimum",
            EngineError::InsufficientBalance { .. } => "InsufficientBalance",
            EngineError::Rpc(_) => "LedgerRPCFailed",
            EngineError::ExecutionReverted(_) => "ExecutionReverted",
            EngineError::GasEstimation(_) => "GasEstimateFailed",
            EngineError::Signing(_) => "SigningFailed",
            EngineError::KeyResolution(_) => "KeyResolutionFailed",
            EngineError::Database(_) => "DatabaseFailed",
            EngineError::Store(_) => "StoreFailed",
            EngineError::Timeout { .. } => "Timeout",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Whether this failure is fatal for the transaction payload itself.
    ///
    /// A rejected submission must not be retried with the same payload; the
    /// transaction is marked Failed and dropped by its orchestrator.
    pub fn submission_rejected(&self) -> bool {
        match self {
            EngineError::TransactionIdMissing
            | EngineError::UnsupportedPayloadVariant(_)
            | EngineError::PayloadInvalid(_)
            | EngineError::SubmissionRejected(_)
            | EngineError::ExecutionReverted(_)
            | EngineError::TerminalStatusUpdate { .. } => true,
            other => other.is_execution_reverted(),
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        !self.is_execution_reverted()
            && matches!(
                self,
                EngineError::Rpc(_)
                    | EngineError::GasEstimation(_)
                    | EngineError::NonceQueryFailed { .. }
                    | EngineError::KeyResolution(_)
                    | EngineError::Signing(_)
                    | EngineError::Database(_)
                    | EngineError::Store(_)
                    | EngineError::Timeout { .. }
                    | EngineError::GasPriceUnavailable(_)
            )
    }

    /// Non-terminal conditions reconciled by the balance manager or a
    /// future gas-market change.
    pub fn is_stalled(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientBalance { .. } | EngineError::FuelingSourceBelowMinimum { .. }
        )
    }

    /// Recognize an "execution reverted" estimate or call failure.
    ///
    /// Structured classification ([`EngineError::ExecutionReverted`]) is
    /// preferred; matching on the message text is the normative fallback for
    /// ledgers that only surface a string.
    pub fn is_execution_reverted(&self) -> bool {
        match self {
            EngineError::ExecutionReverted(_) => true,
            EngineError::Rpc(msg) | EngineError::GasEstimation(msg) => {
                msg.contains("execution reverted")
            }
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
