//! Storage layer using RocksDB
//!
//! The store is a pessimistic `TransactionDB`: every read that feeds a
//! mutation goes through [`UnitOfWork`] and takes an exclusive row lock with
//! `get_for_update`, so concurrent units touching the same rows serialize.
//!
//! # Column Families
//!
//! - `wallets` - Wallet records (key: wallet_id)
//! - `accounts` - Unique index (key: account_number -> wallet_id)
//! - `owner_wallets` - Listing index (key: owner_id || currency || wallet_id)
//! - `owner_primary` - Find-or-create key (key: owner_id || currency -> wallet_id)
//! - `transactions` - Append-only audit records (key: transaction_id, UUIDv7)
//! - `references` - Unique index (key: `ref|..` / `event|..` / `transfer|..` -> transaction_id)
//! - `wallet_transactions` - History index (key: wallet_id || transaction_id)
//! - `users` - Owners (key: user_id)
//! - `user_emails` - Owner lookup (key: lowercased email -> user_id)
//! - `attempts` - Webhook delivery audit (key: attempt_id, UUIDv7)
//!
//! # Lock order
//!
//! Units acquire keys in one global order: reference keys, user rows,
//! owner/currency keys, account slots, then wallet rows sorted by account
//! number. Opposite-direction transfers therefore never deadlock.

use crate::{
    error::{Error, Result},
    types::{AccountNumber, Currency, Transaction, TransactionType, User, Wallet, WebhookAttempt},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options,
    Transaction as DbTransaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_ACCOUNTS: &str = "accounts";
const CF_OWNER_WALLETS: &str = "owner_wallets";
const CF_OWNER_PRIMARY: &str = "owner_primary";
const CF_TRANSACTIONS: &str = "transactions";
const CF_REFERENCES: &str = "references";
const CF_WALLET_TRANSACTIONS: &str = "wallet_transactions";
const CF_USERS: &str = "users";
const CF_USER_EMAILS: &str = "user_emails";
const CF_ATTEMPTS: &str = "attempts";

const ALL_CFS: [&str; 10] = [
    CF_WALLETS,
    CF_ACCOUNTS,
    CF_OWNER_WALLETS,
    CF_OWNER_PRIMARY,
    CF_TRANSACTIONS,
    CF_REFERENCES,
    CF_WALLET_TRANSACTIONS,
    CF_USERS,
    CF_USER_EMAILS,
    CF_ATTEMPTS,
];

/// Key in the `references` index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKey {
    /// Provider transaction reference (`tx_ref`)
    Reference(String),
    /// Provider event ID
    ProviderEvent(String),
    /// Transfer reference, chosen by the caller or generated
    Transfer(String),
}

impl ReferenceKey {
    fn to_bytes(&self) -> Vec<u8> {
        let (tag, value): (&[u8], &str) = match self {
            ReferenceKey::Reference(r) => (b"ref|", r),
            ReferenceKey::ProviderEvent(e) => (b"event|", e),
            ReferenceKey::Transfer(t) => (b"transfer|", t),
        };
        let mut key = tag.to_vec();
        key.extend_from_slice(value.as_bytes());
        key
    }

    /// Value the key was built from
    pub fn value(&self) -> &str {
        match self {
            ReferenceKey::Reference(v)
            | ReferenceKey::ProviderEvent(v)
            | ReferenceKey::Transfer(v) => v,
        }
    }

    /// Keys a transaction record occupies
    pub fn for_transaction(tx: &Transaction) -> Vec<ReferenceKey> {
        let reference = match tx.tx_type {
            TransactionType::Transfer => ReferenceKey::Transfer(tx.reference.clone()),
            _ => ReferenceKey::Reference(tx.reference.clone()),
        };
        let mut keys = vec![reference];
        if let Some(event_id) = &tx.provider_event_id {
            keys.push(ReferenceKey::ProviderEvent(event_id.clone()));
        }
        keys
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: TransactionDB,
    lock_timeout_ms: i64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.store.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.store.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.store.max_background_jobs);

        if config.store.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.store.lock_timeout_ms);

        let db: TransactionDB =
            TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            lock_timeout_ms = config.store.lock_timeout_ms,
            "Opened RocksDB transaction store"
        );

        Ok(Self {
            db,
            lock_timeout_ms: config.store.lock_timeout_ms,
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        if matches!(name, CF_ACCOUNTS | CF_REFERENCES | CF_USER_EMAILS) {
            // Point lookups on unique indices
            let mut block_opts = rocksdb::BlockBasedOptions::default();
            block_opts.set_bloom_filter(10.0, false);
            opts.set_block_based_table_factory(&block_opts);
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Units of work

    /// Run `f` as one atomic unit on a blocking thread.
    ///
    /// `Ok` commits, `Err` rolls back every write made through the unit.
    pub async fn atomic<T, F>(self: &Arc<Self>, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || storage.atomic_blocking(op, f))
            .await
            .map_err(|e| Error::Concurrency(format!("{} worker failed: {}", op, e)))?
    }

    /// Run store calls that need no shared unit on a blocking thread.
    ///
    /// Writers such as [`Storage::put_user`] open their own unit.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| Error::Concurrency(format!("store worker failed: {}", e)))?
    }

    /// Blocking variant of [`Storage::atomic`]
    pub fn atomic_blocking<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T>,
    {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(true);

        let unit = UnitOfWork {
            storage: self,
            txn: self.db.transaction_opt(&WriteOptions::default(), &txn_opts),
        };

        match f(&unit) {
            Ok(value) => {
                unit.txn.commit()?;
                tracing::trace!(op, "Unit of work committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.txn.rollback() {
                    tracing::error!(op, error = %rollback_err, "Rollback failed");
                }
                tracing::debug!(op, error = %err, "Unit of work rolled back");
                Err(err)
            }
        }
    }

    // Wallet reads

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        self.get_decoded(CF_WALLETS, wallet_id.as_bytes())
    }

    /// Get wallet by account number
    pub fn find_wallet_by_account(&self, account: &AccountNumber) -> Result<Option<Wallet>> {
        match self.get_id(CF_ACCOUNTS, account.as_str().as_bytes())? {
            Some(wallet_id) => self.get_wallet(wallet_id),
            None => Ok(None),
        }
    }

    /// Get the primary wallet an owner holds in `currency`
    pub fn find_wallet_by_owner_and_currency(
        &self,
        owner_id: Uuid,
        currency: &Currency,
    ) -> Result<Option<Wallet>> {
        match self.get_id(CF_OWNER_PRIMARY, &owner_currency_key(owner_id, currency))? {
            Some(wallet_id) => self.get_wallet(wallet_id),
            None => Ok(None),
        }
    }

    /// All wallets of an owner, ordered by currency then creation
    pub fn list_wallets_by_owner(&self, owner_id: Uuid) -> Result<Vec<Wallet>> {
        let prefix = owner_id.as_bytes().to_vec();
        let mut wallets = Vec::new();
        for wallet_id in self.scan_suffix_ids(CF_OWNER_WALLETS, &prefix, usize::MAX, false)? {
            let wallet = self.get_wallet(wallet_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "owner index points at missing wallet {}",
                    wallet_id
                ))
            })?;
            wallets.push(wallet);
        }
        Ok(wallets)
    }

    // Transaction reads

    /// Get transaction by ID
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        self.get_decoded(CF_TRANSACTIONS, transaction_id.as_bytes())
    }

    /// Find the transaction holding a reference key
    pub fn find_transaction(&self, key: &ReferenceKey) -> Result<Option<Transaction>> {
        match self.get_id(CF_REFERENCES, &key.to_bytes())? {
            Some(id) => self.get_transaction(id),
            None => Ok(None),
        }
    }

    /// Transactions touching a wallet, newest first
    pub fn wallet_transactions(&self, wallet_id: Uuid, limit: usize) -> Result<Vec<Transaction>> {
        let prefix = wallet_id.as_bytes().to_vec();
        let mut out = Vec::new();
        for id in self.scan_suffix_ids(CF_WALLET_TRANSACTIONS, &prefix, limit, true)? {
            if let Some(tx) = self.get_transaction(id)? {
                out.push(tx);
            }
        }
        Ok(out)
    }

    /// Most recent transactions across all wallets
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.scan_latest(CF_TRANSACTIONS, limit)
    }

    /// Most recent webhook attempts
    pub fn recent_attempts(&self, limit: usize) -> Result<Vec<WebhookAttempt>> {
        self.scan_latest(CF_ATTEMPTS, limit)
    }

    // Users

    /// Get user by ID
    pub fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        self.get_decoded(CF_USERS, user_id.as_bytes())
    }

    /// Get user by email (case-insensitive)
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        match self.get_id(CF_USER_EMAILS, email_key(email).as_bytes())? {
            Some(user_id) => self.get_user(user_id),
            None => Ok(None),
        }
    }

    /// Insert or replace a user, keeping the email index unique
    pub fn put_user(&self, user: &User) -> Result<()> {
        self.atomic_blocking("put_user", |unit| {
            let email = email_key(&user.email);
            if let Some(holder) = unit.lock_id(CF_USER_EMAILS, email.as_bytes())? {
                if holder != user.id {
                    return Err(Error::Validation(format!(
                        "email {} already registered",
                        user.email
                    )));
                }
            }
            if let Some(previous) = unit.lock_user(user.id)? {
                let previous_email = email_key(&previous.email);
                if previous_email != email {
                    unit.txn
                        .delete_cf(unit.cf(CF_USER_EMAILS)?, previous_email.as_bytes())?;
                }
            }
            unit.put_user(user)?;
            unit.txn
                .put_cf(unit.cf(CF_USER_EMAILS)?, email.as_bytes(), user.id.as_bytes())?;
            Ok(())
        })
    }

    // Audit

    /// Persist a webhook attempt
    pub fn append_attempt(&self, attempt: &WebhookAttempt) -> Result<()> {
        self.atomic_blocking("append_attempt", |unit| {
            let value = encode(attempt)?;
            unit.txn
                .put_cf(unit.cf(CF_ATTEMPTS)?, attempt.id.as_bytes(), value)?;
            Ok(())
        })
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_wallets: self.count_keys(CF_WALLETS)?,
            total_transactions: self.count_keys(CF_TRANSACTIONS)?,
            total_users: self.count_keys(CF_USERS)?,
            total_attempts: self.count_keys(CF_ATTEMPTS)?,
        })
    }

    // Helpers

    fn get_decoded<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_id(&self, cf: &str, key: &[u8]) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(cf)?;
        self.db.get_cf(cf, key)?.map(|bytes| decode_id(&bytes)).transpose()
    }

    /// IDs stored as the trailing 16 bytes of keys under `prefix`
    fn scan_suffix_ids(
        &self,
        cf: &str,
        prefix: &[u8],
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<Uuid>> {
        let cf = self.cf_handle(cf)?;
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xff; 32]);

        let iter = if newest_first {
            self.db
                .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse))
        } else {
            self.db
                .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        };

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) || ids.len() >= limit {
                break;
            }
            if key.len() >= prefix.len() + 16 {
                ids.push(decode_id(&key[key.len() - 16..])?);
            }
        }
        Ok(ids)
    }

    fn scan_latest<T: DeserializeOwned>(&self, cf: &str, limit: usize) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn count_keys(&self, cf: &str) -> Result<u64> {
        let cf = self.cf_handle(cf)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// One atomic unit of work against the store
pub struct UnitOfWork<'a> {
    storage: &'a Storage,
    txn: DbTransaction<'a, TransactionDB>,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork").finish_non_exhaustive()
    }
}

impl UnitOfWork<'_> {
    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.storage.cf_handle(name)
    }

    fn lock_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.txn.get_for_update_cf(self.cf(cf)?, key, true)?)
    }

    fn lock_id(&self, cf: &str, key: &[u8]) -> Result<Option<Uuid>> {
        self.lock_raw(cf, key)?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    // Wallets

    /// Resolve an account number without locking (index rows never change)
    pub fn wallet_id_for_account(&self, account: &AccountNumber) -> Result<Option<Uuid>> {
        self.txn
            .get_cf(self.cf(CF_ACCOUNTS)?, account.as_str().as_bytes())?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    /// Lock an account number slot; `Some` means it is taken
    pub fn lock_account(&self, account: &AccountNumber) -> Result<Option<Uuid>> {
        self.lock_id(CF_ACCOUNTS, account.as_str().as_bytes())
    }

    /// Lock the find-or-create slot of `(owner, currency)`
    pub fn lock_owner_primary(&self, owner_id: Uuid, currency: &Currency) -> Result<Option<Uuid>> {
        self.lock_id(CF_OWNER_PRIMARY, &owner_currency_key(owner_id, currency))
    }

    /// Lock a wallet row for mutation
    pub fn lock_wallet(&self, wallet_id: Uuid) -> Result<Wallet> {
        let bytes = self
            .lock_raw(CF_WALLETS, wallet_id.as_bytes())?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
        decode(&bytes)
    }

    /// Read a wallet row without locking it
    pub fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        self.txn
            .get_cf(self.cf(CF_WALLETS)?, wallet_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Insert a new wallet and its indices.
    ///
    /// The caller must hold the account slot (see [`UnitOfWork::lock_account`])
    /// and the owner/currency slot.
    pub fn insert_wallet(&self, wallet: &Wallet, make_primary: bool) -> Result<()> {
        self.put_wallet(wallet)?;
        self.txn.put_cf(
            self.cf(CF_ACCOUNTS)?,
            wallet.account_number.as_str().as_bytes(),
            wallet.id.as_bytes(),
        )?;

        let mut owner_key = owner_currency_key(wallet.owner_id, &wallet.currency);
        if make_primary {
            self.txn
                .put_cf(self.cf(CF_OWNER_PRIMARY)?, &owner_key, wallet.id.as_bytes())?;
        }
        owner_key.extend_from_slice(wallet.id.as_bytes());
        self.txn.put_cf(self.cf(CF_OWNER_WALLETS)?, &owner_key, b"")?;
        Ok(())
    }

    /// Write a wallet row (caller holds its lock)
    pub fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
        if wallet.balance < rust_decimal::Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "negative balance {} on {}",
                wallet.balance, wallet.account_number
            )));
        }
        self.txn
            .put_cf(self.cf(CF_WALLETS)?, wallet.id.as_bytes(), encode(wallet)?)?;
        Ok(())
    }

    // Transactions

    /// Lock a reference slot; `Some` is the transaction already holding it
    pub fn lock_reference(&self, key: &ReferenceKey) -> Result<Option<Uuid>> {
        self.lock_id(CF_REFERENCES, &key.to_bytes())
    }

    /// Read a transaction inside the unit
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        self.txn
            .get_cf(self.cf(CF_TRANSACTIONS)?, transaction_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Append a transaction record and claim its reference keys.
    ///
    /// Fails with [`Error::DuplicateReference`] if any key is already held.
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        let cf_refs = self.cf(CF_REFERENCES)?;
        for key in ReferenceKey::for_transaction(tx) {
            let key_bytes = key.to_bytes();
            if self.txn.get_for_update_cf(cf_refs, &key_bytes, true)?.is_some() {
                return Err(Error::DuplicateReference(key.value().to_string()));
            }
            self.txn.put_cf(cf_refs, &key_bytes, tx.id.as_bytes())?;
        }

        self.txn
            .put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(tx)?)?;

        let cf_history = self.cf(CF_WALLET_TRANSACTIONS)?;
        for wallet_id in std::iter::once(tx.wallet_id).chain(tx.counterparty_wallet_id) {
            let mut key = wallet_id.as_bytes().to_vec();
            key.extend_from_slice(tx.id.as_bytes());
            self.txn.put_cf(cf_history, &key, b"")?;
        }
        Ok(())
    }

    // Users

    /// Lock a user row
    pub fn lock_user(&self, user_id: Uuid) -> Result<Option<User>> {
        self.lock_raw(CF_USERS, user_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Resolve a user by email inside the unit, without locking
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user_id = match self
            .txn
            .get_cf(self.cf(CF_USER_EMAILS)?, email_key(email).as_bytes())?
        {
            Some(bytes) => decode_id(&bytes)?,
            None => return Ok(None),
        };
        self.txn
            .get_cf(self.cf(CF_USERS)?, user_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Write a user row (caller holds its lock)
    pub fn put_user(&self, user: &User) -> Result<()> {
        self.txn
            .put_cf(self.cf(CF_USERS)?, user.id.as_bytes(), encode(user)?)?;
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StorageStats {
    /// Wallet records
    pub total_wallets: u64,
    /// Transaction records
    pub total_transactions: u64,
    /// Registered owners
    pub total_users: u64,
    /// Webhook attempts
    pub total_attempts: u64,
}

// Key and value helpers

fn owner_currency_key(owner_id: Uuid, currency: &Currency) -> Vec<u8> {
    let mut key = owner_id.as_bytes().to_vec();
    key.extend_from_slice(currency.code().as_bytes());
    key
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_id(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("corrupt id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.data_dir = temp_dir.path().to_path_buf();
        config.store.lock_timeout_ms = 200;
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_wallet(owner_id: Uuid, account: &str) -> Wallet {
        Wallet::new(
            owner_id,
            AccountNumber::normalize(account, "+234").unwrap(),
            Currency::parse("NGN").unwrap(),
        )
    }

    fn test_credit(wallet: &Wallet, reference: &str) -> Transaction {
        Transaction {
            id: Uuid::now_v7(),
            wallet_id: wallet.id,
            user_id: wallet.owner_id,
            counterparty_wallet_id: None,
            tx_type: TransactionType::Credit,
            amount: dec!(10),
            currency: wallet.currency.clone(),
            status: TransactionStatus::Success,
            reference: reference.to_string(),
            provider_event_id: None,
            description: String::new(),
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for name in ALL_CFS {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_insert_and_find_wallet() {
        let (storage, _temp) = test_storage();
        let owner = Uuid::new_v4();
        let wallet = test_wallet(owner, "08012345678");

        storage
            .atomic_blocking("test", |unit| unit.insert_wallet(&wallet, true))
            .unwrap();

        let by_account = storage
            .find_wallet_by_account(&wallet.account_number)
            .unwrap()
            .unwrap();
        assert_eq!(by_account.id, wallet.id);

        let by_owner = storage
            .find_wallet_by_owner_and_currency(owner, &wallet.currency)
            .unwrap()
            .unwrap();
        assert_eq!(by_owner.id, wallet.id);

        let listed = storage.list_wallets_by_owner(owner).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(storage.list_wallets_by_owner(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_unit_rolls_back() {
        let (storage, _temp) = test_storage();
        let wallet = test_wallet(Uuid::new_v4(), "08012345678");

        let result: Result<()> = storage.atomic_blocking("test", |unit| {
            unit.insert_wallet(&wallet, true)?;
            Err(Error::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert!(storage.get_wallet(wallet.id).unwrap().is_none());
        assert!(storage
            .find_wallet_by_account(&wallet.account_number)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reference_is_unique() {
        let (storage, _temp) = test_storage();
        let wallet = test_wallet(Uuid::new_v4(), "08012345678");

        storage
            .atomic_blocking("test", |unit| {
                unit.insert_wallet(&wallet, true)?;
                unit.insert_transaction(&test_credit(&wallet, "tx-1"))
            })
            .unwrap();

        let err = storage
            .atomic_blocking("test", |unit| {
                unit.insert_transaction(&test_credit(&wallet, "tx-1"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReference(r) if r == "tx-1"));

        let found = storage
            .find_transaction(&ReferenceKey::Reference("tx-1".into()))
            .unwrap();
        assert!(found.is_some());
        assert_eq!(storage.wallet_transactions(wallet.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_and_credit_references_are_separate() {
        let (storage, _temp) = test_storage();
        let wallet = test_wallet(Uuid::new_v4(), "08012345678");
        let mut transfer = test_credit(&wallet, "shared-1");
        transfer.tx_type = TransactionType::Transfer;
        let credit = test_credit(&wallet, "shared-1");

        storage
            .atomic_blocking("test", |unit| {
                unit.insert_wallet(&wallet, true)?;
                unit.insert_transaction(&transfer)?;
                unit.insert_transaction(&credit)
            })
            .unwrap();

        let by_transfer = storage
            .find_transaction(&ReferenceKey::Transfer("shared-1".into()))
            .unwrap()
            .unwrap();
        let by_reference = storage
            .find_transaction(&ReferenceKey::Reference("shared-1".into()))
            .unwrap()
            .unwrap();
        assert_eq!(by_transfer.id, transfer.id);
        assert_eq!(by_reference.id, credit.id);
    }

    #[test]
    fn test_put_wallet_rejects_negative_balance() {
        let (storage, _temp) = test_storage();
        let mut wallet = test_wallet(Uuid::new_v4(), "08012345678");
        wallet.balance = dec!(-1);

        let err = storage
            .atomic_blocking("test", |unit| unit.put_wallet(&wallet))
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_user_email_index() {
        let (storage, _temp) = test_storage();
        let mut user = User::new("Ada@Example.com", "Ada");
        storage.put_user(&user).unwrap();

        let found = storage.find_user_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(found.id, user.id);

        user.email = "ada@ledger.test".into();
        storage.put_user(&user).unwrap();
        assert!(storage.find_user_by_email("ada@example.com").unwrap().is_none());

        let other = User::new("ada@ledger.test", "Impostor");
        assert!(storage.put_user(&other).is_err());
    }

    #[test]
    fn test_stats() {
        let (storage, _temp) = test_storage();
        storage.put_user(&User::new("a@b.test", "A")).unwrap();
        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_users, 1);
        assert_eq!(stats.total_wallets, 0);
    }
}
