//! Transfer engine
//!
//! Moves funds between two wallets in one unit of work. Both wallet rows are
//! locked in account-number order, the sender balance is re-checked after the
//! lock, and the two balance writes plus the audit record commit together or
//! not at all.

use crate::{
    directory::WalletDirectory,
    metrics::Metrics,
    notify::{Notification, NotificationDispatcher},
    storage::{ReferenceKey, Storage, UnitOfWork},
    types::{AccountNumber, Currency, Transaction, TransactionStatus, TransactionType, Wallet},
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Prefix of engine-generated transfer references
pub const TRANSFER_REFERENCE_PREFIX: &str = "TRF-";

/// Caller request to move funds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Authenticated caller; must own the sending wallet
    pub initiator: Uuid,
    /// Sending account (raw or normalized)
    pub from_account: String,
    /// Receiving account (raw or normalized)
    pub to_account: String,
    /// Amount to move
    pub amount: Decimal,
    /// Currency both wallets must hold
    pub currency: String,
    /// Client idempotency key
    #[serde(default)]
    pub reference: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

/// Outcome of a committed (or replayed) transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Audit record shared by both legs
    pub transaction_id: Uuid,
    /// Transfer reference
    pub reference: String,
    /// Debited account
    pub from_account: AccountNumber,
    /// Credited account
    pub to_account: AccountNumber,
    /// Amount moved
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Sender balance after the transfer
    pub sender_balance: Decimal,
    /// Receiver balance after the transfer
    pub receiver_balance: Decimal,
    /// True when the reference had already been applied
    pub replayed: bool,
}

/// Atomic wallet-to-wallet transfers
#[derive(Clone, Debug)]
pub struct TransferEngine {
    storage: Arc<Storage>,
    directory: WalletDirectory,
    metrics: Metrics,
    notifications: NotificationDispatcher,
}

struct Prepared {
    from: AccountNumber,
    to: AccountNumber,
    amount: Decimal,
    currency: Currency,
    reference: String,
    caller_reference: bool,
    description: String,
}

struct Committed {
    result: TransferResult,
    sender_id: Uuid,
    receiver_id: Uuid,
}

impl TransferEngine {
    /// Create new engine
    pub fn new(
        storage: Arc<Storage>,
        directory: WalletDirectory,
        metrics: Metrics,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            storage,
            directory,
            metrics,
            notifications,
        }
    }

    /// Move `request.amount` from one wallet to another
    #[tracing::instrument(
        skip(self, request),
        fields(from = %request.from_account, to = %request.to_account, amount = %request.amount)
    )]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        let started = Instant::now();
        let initiator = request.initiator;

        let outcome = match self.prepare(request) {
            Ok(prepared) => self
                .storage
                .atomic("transfer", move |unit| execute(unit, initiator, prepared))
                .await
                .map_err(Error::into_transfer_error),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(committed) => {
                let result = committed.result;
                if result.replayed {
                    tracing::info!(reference = %result.reference, "Transfer replayed");
                    return Ok(result);
                }

                self.metrics
                    .record_transfer(started.elapsed().as_secs_f64());
                tracing::info!(
                    transaction_id = %result.transaction_id,
                    reference = %result.reference,
                    sender_balance = %result.sender_balance,
                    receiver_balance = %result.receiver_balance,
                    "Transfer committed"
                );

                self.notifications.dispatch(Notification::TransferCompleted {
                    transaction_id: result.transaction_id,
                    reference: result.reference.clone(),
                    sender_id: committed.sender_id,
                    receiver_id: committed.receiver_id,
                    from_account: result.from_account.to_string(),
                    to_account: result.to_account.to_string(),
                    amount: result.amount,
                    currency: result.currency.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_transfer_failure(e.error_type());
                match &e {
                    Error::InvariantViolation(_) => {
                        tracing::error!(error = %e, "Transfer violated a ledger invariant")
                    }
                    e if e.is_transient() => tracing::warn!(error = %e, "Transfer aborted"),
                    e => tracing::warn!(error = %e, kind = e.error_type(), "Transfer rejected"),
                }
                Err(e)
            }
        }
    }

    /// Input checks that need no store access
    fn prepare(&self, request: TransferRequest) -> Result<Prepared> {
        if request.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(request.amount));
        }

        let from = self.directory.normalize(&request.from_account)?;
        let to = self.directory.normalize(&request.to_account)?;
        if from == to {
            return Err(Error::SameAccount(from.to_string()));
        }

        let currency = Currency::parse(&request.currency)?;

        let (reference, caller_reference) = match request.reference {
            Some(r) if r.trim().is_empty() => {
                return Err(Error::Validation("reference must not be blank".to_string()))
            }
            Some(r) => (r.trim().to_string(), true),
            None => (
                format!("{}{}", TRANSFER_REFERENCE_PREFIX, Uuid::now_v7()),
                false,
            ),
        };

        let description = request
            .description
            .unwrap_or_else(|| format!("Transfer from {} to {}", from, to));

        Ok(Prepared {
            from,
            to,
            amount: request.amount,
            currency,
            reference,
            caller_reference,
            description,
        })
    }
}

fn execute(unit: &UnitOfWork<'_>, initiator: Uuid, p: Prepared) -> Result<Committed> {
    // Reference first, so a retried request observes its earlier commit
    let key = ReferenceKey::Transfer(p.reference.clone());
    if let Some(existing) = unit.lock_reference(&key)? {
        if p.caller_reference {
            return replay(unit, existing, initiator, &p);
        }
        return Err(Error::DuplicateReference(p.reference));
    }

    let from_id = unit
        .wallet_id_for_account(&p.from)?
        .ok_or_else(|| Error::WalletNotFound(p.from.to_string()))?;
    let to_id = unit
        .wallet_id_for_account(&p.to)?
        .ok_or_else(|| Error::WalletNotFound(p.to.to_string()))?;

    let (mut sender, mut receiver) = if p.from < p.to {
        let sender = unit.lock_wallet(from_id)?;
        (sender, unit.lock_wallet(to_id)?)
    } else {
        let receiver = unit.lock_wallet(to_id)?;
        (unit.lock_wallet(from_id)?, receiver)
    };

    if sender.owner_id != initiator {
        return Err(Error::NotWalletOwner {
            user: initiator,
            account: sender.account_number.to_string(),
        });
    }
    for wallet in [&sender, &receiver] {
        if wallet.currency != p.currency {
            return Err(Error::CurrencyMismatch {
                expected: p.currency.to_string(),
                found: wallet.currency.to_string(),
            });
        }
    }

    let total_before = sender.balance + receiver.balance;
    sender.debit(p.amount)?;
    receiver.credit(p.amount)?;
    if sender.balance + receiver.balance != total_before {
        return Err(Error::InvariantViolation(format!(
            "transfer {} changed the pair total from {} to {}",
            p.reference,
            total_before,
            sender.balance + receiver.balance
        )));
    }

    unit.put_wallet(&sender)?;
    unit.put_wallet(&receiver)?;

    let record = Transaction {
        id: Uuid::now_v7(),
        wallet_id: sender.id,
        user_id: initiator,
        counterparty_wallet_id: Some(receiver.id),
        tx_type: TransactionType::Transfer,
        amount: p.amount,
        currency: p.currency.clone(),
        status: TransactionStatus::Success,
        reference: p.reference.clone(),
        provider_event_id: None,
        description: p.description,
        metadata: Default::default(),
        created_at: Utc::now(),
    };
    unit.insert_transaction(&record)?;

    Ok(Committed {
        sender_id: sender.owner_id,
        receiver_id: receiver.owner_id,
        result: TransferResult {
            transaction_id: record.id,
            reference: p.reference,
            from_account: p.from,
            to_account: p.to,
            amount: p.amount,
            currency: p.currency,
            sender_balance: sender.balance,
            receiver_balance: receiver.balance,
            replayed: false,
        },
    })
}

/// Return the stored outcome of an already-applied transfer reference
fn replay(
    unit: &UnitOfWork<'_>,
    existing: Uuid,
    initiator: Uuid,
    p: &Prepared,
) -> Result<Committed> {
    let duplicate = || Error::DuplicateReference(p.reference.clone());

    let record = unit.get_transaction(existing)?.ok_or_else(|| {
        Error::InvariantViolation(format!("reference {} points at nothing", p.reference))
    })?;
    if record.tx_type != TransactionType::Transfer || record.user_id != initiator {
        return Err(duplicate());
    }

    let receiver_id = record.counterparty_wallet_id.ok_or_else(duplicate)?;
    let sender = stored_wallet(unit, record.wallet_id)?;
    let receiver = stored_wallet(unit, receiver_id)?;
    if sender.account_number != p.from
        || receiver.account_number != p.to
        || record.amount != p.amount
        || record.currency != p.currency
    {
        return Err(duplicate());
    }

    Ok(Committed {
        sender_id: sender.owner_id,
        receiver_id: receiver.owner_id,
        result: TransferResult {
            transaction_id: record.id,
            reference: record.reference,
            from_account: sender.account_number,
            to_account: receiver.account_number,
            amount: record.amount,
            currency: record.currency,
            sender_balance: sender.balance,
            receiver_balance: receiver.balance,
            replayed: true,
        },
    })
}

fn stored_wallet(unit: &UnitOfWork<'_>, wallet_id: Uuid) -> Result<Wallet> {
    unit.get_wallet(wallet_id)?.ok_or_else(|| {
        Error::InvariantViolation(format!("transfer points at missing wallet {}", wallet_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{notify::LogNotifier, types::User, Config};
    use rust_decimal_macros::dec;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        engine: TransferEngine,
        directory: WalletDirectory,
        storage: Arc<Storage>,
        metrics: Metrics,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tune: impl FnOnce(&mut Config)) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.data_dir = temp.path().to_path_buf();
        tune(&mut config);
        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let directory = WalletDirectory::new(storage.clone(), &config, metrics.clone()).unwrap();
        let (notifications, _worker) =
            NotificationDispatcher::spawn(Arc::new(LogNotifier), 16, metrics.clone());
        let engine = TransferEngine::new(
            storage.clone(),
            directory.clone(),
            metrics.clone(),
            notifications,
        );
        Fixture {
            engine,
            directory,
            storage,
            metrics,
            _temp: temp,
        }
    }

    impl Fixture {
        async fn wallet(
            &self,
            email: &str,
            account: &str,
            currency: &str,
            balance: Decimal,
        ) -> Wallet {
            let owner = self.directory.register_owner(User::new(email, email)).await.unwrap();
            let mut wallet = self
                .directory
                .create_wallet(owner.id, account, Some(currency))
                .await
                .unwrap();
            wallet.balance = balance;
            let funded = wallet.clone();
            self.storage
                .atomic("fund", move |unit| unit.put_wallet(&funded))
                .await
                .unwrap();
            wallet
        }

        async fn balance(&self, wallet: &Wallet) -> Decimal {
            self.directory.get_wallet(wallet.id).await.unwrap().balance
        }
    }

    fn request(from: &Wallet, to: &Wallet, amount: Decimal, currency: &str) -> TransferRequest {
        TransferRequest {
            initiator: from.owner_id,
            from_account: from.account_number.to_string(),
            to_account: to.account_number.to_string(),
            amount,
            currency: currency.to_string(),
            reference: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_happy_path_transfer() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(1000)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let result = f.engine.transfer(request(&x, &y, dec!(400), "NGN")).await.unwrap();
        assert_eq!(result.sender_balance, dec!(600));
        assert_eq!(result.receiver_balance, dec!(400));
        assert!(result.reference.starts_with(TRANSFER_REFERENCE_PREFIX));
        assert!(!result.replayed);

        assert_eq!(f.balance(&x).await, dec!(600));
        assert_eq!(f.balance(&y).await, dec!(400));

        // One record, visible from both wallets
        let sent = f.directory.wallet_transactions(x.id, 10).await.unwrap();
        let received = f.directory.wallet_transactions(y.id, 10).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent, received);
        assert_eq!(sent[0].tx_type, TransactionType::Transfer);
        assert_eq!(sent[0].counterparty_wallet_id, Some(y.id));
        assert_eq!(f.metrics.transfers_total.get(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_changes_nothing() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(100)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let err = f.engine.transfer(request(&x, &y, dec!(500), "NGN")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { required, available, .. }
                if required == dec!(500) && available == dec!(100)
        ));
        assert_eq!(f.balance(&x).await, dec!(100));
        assert_eq!(f.balance(&y).await, dec!(0));
        assert!(f.directory.wallet_transactions(x.id, 10).await.unwrap().is_empty());
        assert_eq!(
            f.metrics
                .transfer_failures
                .with_label_values(&["insufficient_funds"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_currency_mismatch() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(100)).await;
        let y = f.wallet("y@test.io", "08022222222", "USD", dec!(0)).await;

        let err = f.engine.transfer(request(&x, &y, dec!(10), "NGN")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CurrencyMismatch { ref expected, ref found }
                if expected == "NGN" && found == "USD"
        ));
        assert_eq!(f.balance(&x).await, dec!(100));
        assert_eq!(f.balance(&y).await, dec!(0));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(100)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let err = f.engine.transfer(request(&x, &y, dec!(0), "NGN")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        let err = f.engine.transfer(request(&x, &y, dec!(-5), "NGN")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        let mut same = request(&x, &y, dec!(5), "NGN");
        same.to_account = "+2348011111111".into();
        let err = f.engine.transfer(same).await.unwrap_err();
        assert!(matches!(err, Error::SameAccount(_)));

        let mut missing = request(&x, &y, dec!(5), "NGN");
        missing.to_account = "08099999999".into();
        let err = f.engine.transfer(missing).await.unwrap_err();
        assert!(matches!(err, Error::WalletNotFound(a) if a == "8099999999"));
    }

    #[tokio::test]
    async fn test_initiator_must_own_sender() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(100)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let mut stolen = request(&x, &y, dec!(50), "NGN");
        stolen.initiator = y.owner_id;
        let err = f.engine.transfer(stolen).await.unwrap_err();
        assert!(matches!(err, Error::NotWalletOwner { .. }));
        assert_eq!(f.balance(&x).await, dec!(100));
    }

    #[tokio::test]
    async fn test_caller_reference_replays() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(1000)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let mut req = request(&x, &y, dec!(250), "NGN");
        req.reference = Some("client-42".into());

        let first = f.engine.transfer(req.clone()).await.unwrap();
        let second = f.engine.transfer(req.clone()).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert_eq!(f.balance(&x).await, dec!(750));
        assert_eq!(f.balance(&y).await, dec!(250));

        // Same key, different intent
        req.amount = dec!(300);
        let err = f.engine.transfer(req).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateReference(r) if r == "client-42"));
        assert_eq!(f.balance(&x).await, dec!(750));
    }

    #[tokio::test]
    async fn test_lock_timeout_aborts_without_changes() {
        let f = fixture_with(|config| config.store.lock_timeout_ms = 50);
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(500)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        // Another unit keeps the sender row locked
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let storage = f.storage.clone();
        let sender_id = x.id;
        let holder = thread::spawn(move || {
            storage
                .atomic_blocking("hold_wallet", |unit| {
                    unit.lock_wallet(sender_id)?;
                    locked_tx.send(()).unwrap();
                    let _ = release_rx.recv();
                    Ok(())
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();

        let err = f.engine.transfer(request(&x, &y, dec!(200), "NGN")).await.unwrap_err();
        assert!(matches!(err, Error::TransferAborted(_)));
        assert_eq!(err.status_code(), 503);
        assert_eq!(
            f.metrics
                .transfer_failures
                .with_label_values(&["transfer_aborted"])
                .get(),
            1
        );

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(f.balance(&x).await, dec!(500));
        assert_eq!(f.balance(&y).await, dec!(0));
        assert!(f.directory.wallet_transactions(x.id, 10).await.unwrap().is_empty());

        let result = f.engine.transfer(request(&x, &y, dec!(200), "NGN")).await.unwrap();
        assert_eq!(result.sender_balance, dec!(300));
    }

    #[tokio::test]
    async fn test_transfer_reference_does_not_claim_credit_reference() {
        let f = fixture();
        let x = f.wallet("x@test.io", "08011111111", "NGN", dec!(100)).await;
        let y = f.wallet("y@test.io", "08022222222", "NGN", dec!(0)).await;

        let mut req = request(&x, &y, dec!(10), "NGN");
        req.reference = Some("TX-B".into());
        let result = f.engine.transfer(req).await.unwrap();

        let transfer_holder = f
            .storage
            .blocking(|storage| storage.find_transaction(&ReferenceKey::Transfer("TX-B".into())))
            .await
            .unwrap();
        assert_eq!(transfer_holder.map(|tx| tx.id), Some(result.transaction_id));

        let credit_holder = f
            .storage
            .blocking(|storage| storage.find_transaction(&ReferenceKey::Reference("TX-B".into())))
            .await
            .unwrap();
        assert!(credit_holder.is_none());
    }
}
