//! Wallet Ledger Core
//!
//! Per-user wallet balances with atomic peer-to-peer transfers and idempotent
//! reconciliation of payment-provider webhooks.
//!
//! # Architecture
//!
//! - **Unit of Work**: Every balance change runs inside one RocksDB transaction
//! - **Ordered Locking**: Wallet rows are locked in account-number order
//! - **Idempotent Credits**: Provider references are unique keys in the store
//! - **Fire-and-Forget Notifications**: Dispatched after commit, never awaited
//!
//! # Invariants
//!
//! - Money conservation: a transfer never changes the sum of the two balances
//! - No negative balance: rejected at lock time and again at write time
//! - At-most-once credit: one success record per provider event or reference

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod reconciliation;
pub mod storage;
pub mod transfer;
pub mod types;
pub mod webhook;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use ledger::WalletLedger;
pub use reconciliation::{ExternalCredit, ReconciliationOutcome};
pub use storage::Storage;
pub use transfer::{TransferRequest, TransferResult};
pub use types::{AccountNumber, Currency, Transaction, TransactionType, User, Wallet};
pub use webhook::WebhookAck;
