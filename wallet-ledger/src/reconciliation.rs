//! Reconciliation engine
//!
//! Turns an external payment event into at most one wallet credit. The dedup
//! keys (provider event ID and external reference) are locked at the start of
//! the unit and claimed by the credit record at its end, so two concurrent
//! deliveries of one event serialize: the first credits, the second sees the
//! record and resolves to [`ReconciliationOutcome::AlreadyProcessed`].
//!
//! Every attempt, whatever its outcome, is handed to an [`AuditSink`].

use crate::{
    directory::WalletDirectory,
    error::ErrorClass,
    metrics::Metrics,
    notify::{Notification, NotificationDispatcher},
    storage::{ReferenceKey, Storage, UnitOfWork},
    types::{
        AccountNumber, AttemptOutcome, Currency, Metadata, Transaction, TransactionStatus,
        TransactionType, WebhookAttempt,
    },
    Config, Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Verified external payment, already normalized by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCredit {
    /// Provider-side event ID
    pub provider_event_id: Option<String>,
    /// Provider transaction reference (`tx_ref`)
    pub external_reference: String,
    /// Payer identity
    pub payer_email: String,
    /// Payer phone, used to number a lazily created wallet
    #[serde(default)]
    pub payer_phone: Option<String>,
    /// Amount paid
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Provider name; the configured provider when absent
    #[serde(default)]
    pub provider: Option<String>,
    /// Payload metadata
    #[serde(default)]
    pub metadata: Metadata,
}

/// Non-error result of a credit attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// Wallet credited by this call
    Credited {
        /// Credit record
        transaction_id: Uuid,
        /// Credited wallet
        wallet_id: Uuid,
        /// Credited account
        account_number: AccountNumber,
        /// Balance after the credit
        balance: Decimal,
        /// Whether the wallet was created for this credit
        wallet_created: bool,
    },

    /// Event was applied earlier; nothing written
    AlreadyProcessed {
        /// Record of the earlier application
        transaction_id: Uuid,
        /// Reference that matched
        reference: String,
    },
}

/// Receives one event per reconciliation attempt
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Record an attempt; failures stay inside the sink
    async fn record(&self, event: &WebhookAttempt);
}

/// Sink that only emits a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &WebhookAttempt) {
        log_attempt(event);
    }
}

/// Sink that persists attempts in the store, then logs them
#[derive(Debug, Clone)]
pub struct StoreAuditSink {
    storage: Arc<Storage>,
}

impl StoreAuditSink {
    /// Create new sink
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, event: &WebhookAttempt) {
        let attempt = event.clone();
        if let Err(e) = self
            .storage
            .blocking(move |storage| storage.append_attempt(&attempt))
            .await
        {
            tracing::error!(
                error = %e,
                attempt_id = %event.id,
                "Failed to persist webhook attempt"
            );
        }
        log_attempt(event);
    }
}

fn log_attempt(event: &WebhookAttempt) {
    match event.outcome {
        AttemptOutcome::Credited | AttemptOutcome::Duplicate => tracing::info!(
            provider = %event.provider,
            outcome = ?event.outcome,
            reference = ?event.reference,
            provider_event_id = ?event.provider_event_id,
            transaction_id = ?event.transaction_id,
            "{}", event.detail
        ),
        AttemptOutcome::Failed => tracing::error!(
            provider = %event.provider,
            reference = ?event.reference,
            provider_event_id = ?event.provider_event_id,
            "{}", event.detail
        ),
        _ => tracing::warn!(
            provider = %event.provider,
            outcome = ?event.outcome,
            reference = ?event.reference,
            payer_email = ?event.payer_email,
            "{}", event.detail
        ),
    }
}

/// Idempotent ingestion of external credits
#[derive(Clone)]
pub struct ReconciliationEngine {
    storage: Arc<Storage>,
    directory: WalletDirectory,
    metrics: Metrics,
    notifications: NotificationDispatcher,
    audit: Arc<dyn AuditSink>,
    provider: String,
    max_conflict_retries: u32,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("provider", &self.provider)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish_non_exhaustive()
    }
}

struct Applied {
    outcome: ReconciliationOutcome,
    owner_id: Uuid,
    currency: Currency,
}

impl ReconciliationEngine {
    /// Create new engine
    pub fn new(
        storage: Arc<Storage>,
        directory: WalletDirectory,
        config: &Config,
        metrics: Metrics,
        notifications: NotificationDispatcher,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            storage,
            directory,
            metrics,
            notifications,
            audit,
            provider: config.reconciliation.provider.clone(),
            max_conflict_retries: config.reconciliation.max_conflict_retries,
        }
    }

    /// Configured provider name
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Credit the payer's wallet once per external event
    #[tracing::instrument(
        skip(self, credit),
        fields(reference = %credit.external_reference, event_id = ?credit.provider_event_id)
    )]
    pub async fn apply_external_credit(
        &self,
        credit: ExternalCredit,
    ) -> Result<ReconciliationOutcome> {
        let provider = credit
            .provider
            .clone()
            .unwrap_or_else(|| self.provider.clone());

        let result = self.apply_with_retry(&credit, &provider).await;

        let (outcome, transaction_id, detail) = match &result {
            Ok(applied) => match &applied.outcome {
                ReconciliationOutcome::Credited {
                    transaction_id,
                    wallet_id,
                    balance,
                    ..
                } => {
                    self.metrics.record_credit();
                    (
                        AttemptOutcome::Credited,
                        Some(*transaction_id),
                        format!("Credited wallet {} (balance {})", wallet_id, balance),
                    )
                }
                ReconciliationOutcome::AlreadyProcessed { transaction_id, .. } => {
                    self.metrics.record_duplicate();
                    (
                        AttemptOutcome::Duplicate,
                        Some(*transaction_id),
                        "Event already processed".to_string(),
                    )
                }
            },
            Err(Error::PayerNotFound(email)) => (
                AttemptOutcome::PayerNotFound,
                None,
                format!("No user for payer {}", email),
            ),
            Err(e) if e.class() == ErrorClass::Validation => {
                (AttemptOutcome::Malformed, None, e.to_string())
            }
            Err(e) => (AttemptOutcome::Failed, None, e.to_string()),
        };

        if outcome != AttemptOutcome::Credited && outcome != AttemptOutcome::Duplicate {
            self.metrics.record_webhook_rejection(outcome_label(outcome));
        }

        self.audit(WebhookAttempt {
            id: Uuid::now_v7(),
            provider,
            outcome,
            reference: Some(credit.external_reference.clone()),
            provider_event_id: credit.provider_event_id.clone(),
            payer_email: Some(credit.payer_email.clone()),
            amount: Some(credit.amount),
            transaction_id,
            detail,
            recorded_at: Utc::now(),
        })
        .await;

        let applied = result?;
        if let ReconciliationOutcome::Credited {
            transaction_id,
            account_number,
            balance,
            ..
        } = &applied.outcome
        {
            self.notifications.dispatch(Notification::WalletCredited {
                transaction_id: *transaction_id,
                reference: credit.external_reference,
                owner_id: applied.owner_id,
                account: account_number.to_string(),
                amount: credit.amount,
                currency: applied.currency,
                balance: *balance,
            });
        }
        Ok(applied.outcome)
    }

    /// Hand an attempt to the audit sink
    async fn audit(&self, attempt: WebhookAttempt) {
        self.audit.record(&attempt).await;
    }

    /// Count and audit a delivery that never reached the credit path
    pub(crate) async fn audit_rejection(&self, attempt: WebhookAttempt) {
        self.metrics
            .record_webhook_rejection(outcome_label(attempt.outcome));
        self.audit(attempt).await;
    }

    async fn apply_with_retry(&self, credit: &ExternalCredit, provider: &str) -> Result<Applied> {
        if credit.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(credit.amount));
        }
        if credit.external_reference.trim().is_empty() {
            return Err(Error::Validation("external reference is required".to_string()));
        }
        let currency = Currency::parse(&credit.currency)?;

        let mut attempt = 0;
        loop {
            let directory = self.directory.clone();
            let owned = credit.clone();
            let unit_currency = currency.clone();
            let description = format!("Wallet funding via {}", provider);

            let result = self
                .storage
                .atomic("apply_external_credit", move |unit| {
                    credit_once(unit, &directory, &owned, unit_currency, description)
                })
                .await;

            match result {
                Err(Error::Busy(reason)) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, %reason, "Dedup keys busy, retrying credit");
                }
                Err(Error::DuplicateReference(_)) => {
                    return self.already_processed(credit_keys(credit)).await
                }
                Err(e) => return Err(e.into_storage_failure()),
                Ok(applied) => return Ok(applied),
            }
        }
    }

    /// Resolve a lost insert race to the record that won it
    async fn already_processed(&self, keys: Vec<ReferenceKey>) -> Result<Applied> {
        let found = self
            .storage
            .blocking(move |storage| {
                for key in &keys {
                    if let Some(tx) = storage.find_transaction(key)? {
                        return Ok(Some(tx));
                    }
                }
                Ok(None)
            })
            .await
            .map_err(Error::into_storage_failure)?;

        let tx = found.ok_or_else(|| {
            Error::StorageFailure("reference conflict without a holder".to_string())
        })?;
        already_applied(tx)
    }
}

/// Dedup keys of a credit, provider event first
fn credit_keys(credit: &ExternalCredit) -> Vec<ReferenceKey> {
    let mut keys = Vec::with_capacity(2);
    if let Some(event_id) = &credit.provider_event_id {
        keys.push(ReferenceKey::ProviderEvent(event_id.clone()));
    }
    keys.push(ReferenceKey::Reference(credit.external_reference.clone()));
    keys
}

/// Earlier application of a credit; only a CREDIT record may hold its keys
fn already_applied(tx: Transaction) -> Result<Applied> {
    if tx.tx_type != TransactionType::Credit {
        return Err(Error::InvariantViolation(format!(
            "credit reference {} is held by {:?} record {}",
            tx.reference, tx.tx_type, tx.id
        )));
    }
    Ok(Applied {
        owner_id: tx.user_id,
        currency: tx.currency,
        outcome: ReconciliationOutcome::AlreadyProcessed {
            transaction_id: tx.id,
            reference: tx.reference,
        },
    })
}

fn credit_once(
    unit: &UnitOfWork<'_>,
    directory: &WalletDirectory,
    credit: &ExternalCredit,
    currency: Currency,
    description: String,
) -> Result<Applied> {
    for key in credit_keys(credit) {
        if let Some(existing) = unit.lock_reference(&key)? {
            let tx = unit.get_transaction(existing)?.ok_or_else(|| {
                Error::InvariantViolation(format!("reference index points at missing {}", existing))
            })?;
            return already_applied(tx);
        }
    }

    let mut owner = unit
        .find_user_by_email(&credit.payer_email)?
        .ok_or_else(|| Error::PayerNotFound(credit.payer_email.clone()))?;
    if owner.phone_number.is_none() {
        owner.phone_number = credit.payer_phone.clone();
    }

    let (mut wallet, wallet_created) = directory.lock_or_create(unit, &owner, &currency)?;
    wallet.credit(credit.amount)?;
    unit.put_wallet(&wallet)?;

    let record = Transaction {
        id: Uuid::now_v7(),
        wallet_id: wallet.id,
        user_id: owner.id,
        counterparty_wallet_id: None,
        tx_type: TransactionType::Credit,
        amount: credit.amount,
        currency: currency.clone(),
        status: TransactionStatus::Success,
        reference: credit.external_reference.clone(),
        provider_event_id: credit.provider_event_id.clone(),
        description,
        metadata: credit.metadata.clone(),
        created_at: Utc::now(),
    };
    unit.insert_transaction(&record)?;

    Ok(Applied {
        owner_id: owner.id,
        currency,
        outcome: ReconciliationOutcome::Credited {
            transaction_id: record.id,
            wallet_id: wallet.id,
            account_number: wallet.account_number,
            balance: wallet.balance,
            wallet_created,
        },
    })
}

fn outcome_label(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Credited => "credited",
        AttemptOutcome::Duplicate => "duplicate",
        AttemptOutcome::PayerNotFound => "payer_not_found",
        AttemptOutcome::Ignored => "ignored",
        AttemptOutcome::Malformed => "malformed",
        AttemptOutcome::Failed => "failed",
    }
}
