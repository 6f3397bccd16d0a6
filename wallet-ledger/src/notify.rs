//! Post-commit notifications
//!
//! Committed transfers and credits are announced through a bounded channel to
//! a spawned worker that owns the [`Notifier`]. Sending never waits: a full or
//! closed channel drops the notification and logs it. Ledger outcomes never
//! depend on delivery.
//!
//! ```text
//! TransferEngine / ReconciliationEngine
//!              │ try_send (after commit)
//!              ▼
//!     mpsc::channel (bounded)
//!              │
//!              ▼
//!   notification worker ──► Notifier::notify()
//! ```

use crate::{metrics::Metrics, types::Currency};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Event announced after a ledger mutation commits
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Funds moved between two wallets
    TransferCompleted {
        /// Audit record
        transaction_id: Uuid,
        /// Transfer reference
        reference: String,
        /// Sending owner
        sender_id: Uuid,
        /// Receiving owner
        receiver_id: Uuid,
        /// Debited account
        from_account: String,
        /// Credited account
        to_account: String,
        /// Amount moved
        amount: Decimal,
        /// Currency
        currency: Currency,
    },

    /// A webhook credit landed in a wallet
    WalletCredited {
        /// Audit record
        transaction_id: Uuid,
        /// Provider reference
        reference: String,
        /// Wallet owner
        owner_id: Uuid,
        /// Credited account
        account: String,
        /// Amount credited
        amount: Decimal,
        /// Currency
        currency: Currency,
        /// Balance after the credit
        balance: Decimal,
    },
}

/// Delivery channel (email, push, ...)
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification {
            Notification::TransferCompleted {
                reference,
                from_account,
                to_account,
                amount,
                currency,
                ..
            } => tracing::info!(
                %reference,
                %from_account,
                %to_account,
                %amount,
                %currency,
                "Notify: transfer completed"
            ),
            Notification::WalletCredited {
                reference,
                account,
                amount,
                currency,
                ..
            } => tracing::info!(
                %reference,
                %account,
                %amount,
                %currency,
                "Notify: wallet credited"
            ),
        }
        Ok(())
    }
}

/// Handle used by the engines to hand off notifications
#[derive(Clone, Debug)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
    metrics: Metrics,
}

impl NotificationDispatcher {
    /// Spawn the worker on the current runtime.
    ///
    /// The worker exits once every dispatcher clone is dropped.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        metrics: Metrics,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_worker(notifier, receiver));
        (Self { sender, metrics }, worker)
    }

    /// Queue a notification without waiting
    pub fn dispatch(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.metrics.record_notification_dropped();
                tracing::warn!(notification = ?dropped, "Notification channel full, dropping");
            }
            Err(TrySendError::Closed(dropped)) => {
                self.metrics.record_notification_dropped();
                tracing::warn!(notification = ?dropped, "Notification worker gone, dropping");
            }
        }
    }
}

async fn run_worker(notifier: Arc<dyn Notifier>, mut receiver: mpsc::Receiver<Notification>) {
    while let Some(notification) = receiver.recv().await {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                error = %e,
                notification = ?notification,
                "Notification delivery failed"
            );
        }
    }
    tracing::debug!("Notification worker stopped");
}
