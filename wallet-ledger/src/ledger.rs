//! Main ledger orchestration layer
//!
//! This module ties together storage, the wallet directory and both engines
//! into the API the HTTP layer calls.
//!
//! # Example
//!
//! ```no_run
//! use wallet_ledger::{Config, WalletLedger};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = WalletLedger::open(config).await?;
//!
//!     // let wallet = ledger.create_wallet(owner_id, "+2348012345678", None).await?;
//!     // let result = ledger.transfer(request).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    directory::WalletDirectory,
    metrics::Metrics,
    notify::{LogNotifier, NotificationDispatcher, Notifier},
    reconciliation::{
        AuditSink, ExternalCredit, ReconciliationEngine, ReconciliationOutcome, StoreAuditSink,
    },
    storage::{Storage, StorageStats},
    transfer::{TransferEngine, TransferRequest, TransferResult},
    types::{Transaction, User, Wallet, WebhookAttempt},
    webhook::WebhookAck,
    Config, Error, Result,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Main ledger interface
#[derive(Debug)]
pub struct WalletLedger {
    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Wallet lookup and creation
    directory: WalletDirectory,

    /// Wallet-to-wallet transfers
    transfers: TransferEngine,

    /// Webhook credits
    reconciliation: ReconciliationEngine,

    /// Metrics
    metrics: Metrics,

    /// Notification worker
    notifier_task: JoinHandle<()>,
}

impl WalletLedger {
    /// Open ledger with the log notifier and the persistent audit sink
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let audit = Arc::new(StoreAuditSink::new(storage.clone()));
        Self::assemble(config, storage, Arc::new(LogNotifier), audit)
    }

    /// Open ledger with injected collaborators
    pub async fn open_with(
        config: Config,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        Self::assemble(config, storage, notifier, audit)
    }

    fn assemble(
        config: Config,
        storage: Arc<Storage>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;

        let (notifications, notifier_task) = NotificationDispatcher::spawn(
            notifier,
            config.notifications.channel_capacity,
            metrics.clone(),
        );

        let directory = WalletDirectory::new(storage.clone(), &config, metrics.clone())?;
        let transfers = TransferEngine::new(
            storage.clone(),
            directory.clone(),
            metrics.clone(),
            notifications.clone(),
        );
        let reconciliation = ReconciliationEngine::new(
            storage.clone(),
            directory.clone(),
            &config,
            metrics.clone(),
            notifications,
            audit,
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            provider = %config.reconciliation.provider,
            "Wallet ledger ready"
        );

        Ok(Self {
            storage,
            directory,
            transfers,
            reconciliation,
            metrics,
            notifier_task,
        })
    }

    /// Register or update a wallet owner
    pub async fn register_owner(&self, user: User) -> Result<User> {
        self.directory.register_owner(user).await
    }

    /// Create a wallet for the authenticated caller
    pub async fn create_wallet(
        &self,
        owner_id: Uuid,
        account_number: &str,
        currency: Option<&str>,
    ) -> Result<Wallet> {
        self.directory
            .create_wallet(owner_id, account_number, currency)
            .await
    }

    /// Wallets of the authenticated caller
    pub async fn list_wallets(&self, owner_id: Uuid) -> Result<Vec<Wallet>> {
        self.directory.list_by_owner(owner_id).await
    }

    /// Wallet by account number
    pub async fn find_wallet(&self, account_number: &str) -> Result<Wallet> {
        self.directory.find_by_account_number(account_number).await
    }

    /// Move funds between wallets
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        self.transfers.transfer(request).await
    }

    /// Credit a verified external payment at most once
    pub async fn apply_external_credit(
        &self,
        credit: ExternalCredit,
    ) -> Result<ReconciliationOutcome> {
        self.reconciliation.apply_external_credit(credit).await
    }

    /// Process a verified webhook delivery
    pub async fn handle_webhook(&self, provider: &str, payload: &serde_json::Value) -> WebhookAck {
        self.reconciliation.handle_webhook(provider, payload).await
    }

    /// Transaction history of a wallet, newest first
    pub async fn wallet_transactions(
        &self,
        wallet_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.directory.wallet_transactions(wallet_id, limit).await
    }

    /// Latest transactions across all wallets
    pub async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.storage
            .blocking(move |storage| storage.recent_transactions(limit))
            .await
    }

    /// Latest webhook attempts recorded by the store audit sink
    pub async fn recent_webhook_attempts(&self, limit: usize) -> Result<Vec<WebhookAttempt>> {
        self.storage
            .blocking(move |storage| storage.recent_attempts(limit))
            .await
    }

    /// Store statistics
    pub async fn stats(&self) -> Result<StorageStats> {
        self.storage.blocking(|storage| storage.get_stats()).await
    }

    /// Metrics registry owner
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop accepting work and drain pending notifications
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            storage,
            directory,
            transfers,
            reconciliation,
            notifier_task,
            ..
        } = self;

        // The worker stops once every dispatcher handle is gone
        drop(transfers);
        drop(reconciliation);
        drop(directory);

        notifier_task
            .await
            .map_err(|e| Error::Concurrency(format!("notification worker: {}", e)))?;

        tracing::info!(stats = ?storage.get_stats().ok(), "Wallet ledger stopped");
        Ok(())
    }
}
