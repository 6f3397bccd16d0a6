//! Error types for the wallet ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Amount is zero, negative or not representable
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Account identifier does not normalize to a digit string
    #[error("Invalid account number: {0:?}")]
    InvalidAccountNumber(String),

    /// Currency code is not three ASCII letters
    #[error("Invalid currency: {0:?}")]
    InvalidCurrency(String),

    /// Sender and receiver are the same account
    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(String),

    /// Account number already assigned to a wallet
    #[error("Account number already exists: {0}")]
    DuplicateAccount(String),

    /// Wallet owner is not registered
    #[error("Owner not found: {0}")]
    OwnerNotFound(Uuid),

    /// No wallet for the given account or owner
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Caller does not own the debited wallet
    #[error("User {user} does not own account {account}")]
    NotWalletOwner {
        /// Caller identity
        user: Uuid,
        /// Account the caller tried to debit
        account: String,
    },

    /// Sender balance below the transfer amount
    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        /// Sender account
        account: String,
        /// Requested amount
        required: Decimal,
        /// Balance at lock time
        available: Decimal,
    },

    /// Wallets or request disagree on currency
    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch {
        /// Requested currency
        expected: String,
        /// Currency held by the offending wallet
        found: String,
    },

    /// Webhook payer does not resolve to a user
    #[error("Payer not found: {0}")]
    PayerNotFound(String),

    /// Idempotency key already used by another record
    #[error("Duplicate reference: {0}")]
    DuplicateReference(String),

    /// Transfer rolled back because of a storage-layer failure
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    /// Credit rolled back because of a storage-layer failure
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Lock wait timed out or the store reported contention
    #[error("Store busy: {0}")]
    Busy(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (money conservation, negative balance)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (worker task failed, channel closed)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy used by callers to decide on retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input shape or value, never retried
    Validation,
    /// Explicit business outcome (insufficient funds, duplicates, ...)
    BusinessRule,
    /// Store unavailable or timed out, safe to retry
    Transient,
    /// Must never happen in a correct build
    Integrity,
}

impl Error {
    /// Taxonomy class
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_)
            | Error::InvalidAmount(_)
            | Error::InvalidAccountNumber(_)
            | Error::InvalidCurrency(_)
            | Error::SameAccount(_) => ErrorClass::Validation,

            Error::DuplicateAccount(_)
            | Error::OwnerNotFound(_)
            | Error::WalletNotFound(_)
            | Error::NotWalletOwner { .. }
            | Error::InsufficientFunds { .. }
            | Error::CurrencyMismatch { .. }
            | Error::PayerNotFound(_)
            | Error::DuplicateReference(_) => ErrorClass::BusinessRule,

            Error::TransferAborted(_)
            | Error::StorageFailure(_)
            | Error::Busy(_)
            | Error::Storage(_)
            | Error::Concurrency(_)
            | Error::Io(_) => ErrorClass::Transient,

            Error::Serialization(_) | Error::InvariantViolation(_) | Error::Config(_) => {
                ErrorClass::Integrity
            }
        }
    }

    /// Whether the caller may retry the whole operation
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable machine-readable code
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InvalidAccountNumber(_) => "invalid_account_number",
            Error::InvalidCurrency(_) => "invalid_currency",
            Error::SameAccount(_) => "same_account",
            Error::DuplicateAccount(_) => "duplicate_account",
            Error::OwnerNotFound(_) => "owner_not_found",
            Error::WalletNotFound(_) => "wallet_not_found",
            Error::NotWalletOwner { .. } => "not_wallet_owner",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::CurrencyMismatch { .. } => "currency_mismatch",
            Error::PayerNotFound(_) => "payer_not_found",
            Error::DuplicateReference(_) => "duplicate_reference",
            Error::TransferAborted(_) => "transfer_aborted",
            Error::StorageFailure(_) => "storage_failure",
            Error::Busy(_) => "store_busy",
            Error::Storage(_) => "storage_error",
            Error::Serialization(_) => "serialization_error",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Concurrency(_) => "concurrency_error",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
        }
    }

    /// HTTP status the transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_)
            | Error::InvalidAmount(_)
            | Error::InvalidAccountNumber(_)
            | Error::InvalidCurrency(_)
            | Error::SameAccount(_) => 400,
            Error::NotWalletOwner { .. } => 403,
            Error::OwnerNotFound(_) | Error::WalletNotFound(_) | Error::PayerNotFound(_) => 404,
            Error::DuplicateAccount(_) | Error::DuplicateReference(_) => 409,
            Error::InsufficientFunds { .. } | Error::CurrencyMismatch { .. } => 422,
            Error::TransferAborted(_)
            | Error::StorageFailure(_)
            | Error::Busy(_)
            | Error::Storage(_)
            | Error::Concurrency(_)
            | Error::Io(_) => 503,
            Error::Serialization(_) | Error::InvariantViolation(_) | Error::Config(_) => 500,
        }
    }

    /// Collapse store-level failures into `TransferAborted`
    pub(crate) fn into_transfer_error(self) -> Self {
        match self.class() {
            ErrorClass::Transient => match self {
                Error::TransferAborted(_) => self,
                other => Error::TransferAborted(other.to_string()),
            },
            _ => self,
        }
    }

    /// Collapse store-level failures into `StorageFailure`
    pub(crate) fn into_storage_failure(self) -> Self {
        match self.class() {
            ErrorClass::Transient => match self {
                Error::StorageFailure(_) => self,
                other => Error::StorageFailure(other.to_string()),
            },
            _ => self,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => Error::Busy(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}
