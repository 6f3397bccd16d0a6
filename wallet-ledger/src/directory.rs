//! Wallet directory
//!
//! Creates wallets with normalized account numbers and resolves them by
//! account number or by owner. Also holds the find-or-create primitive the
//! reconciliation engine uses inside its unit of work.

use crate::{
    metrics::Metrics,
    storage::{Storage, UnitOfWork},
    types::{AccountNumber, Currency, Transaction, User, Wallet},
    Config, Error, Result,
};
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

/// Attempts at drawing a free generated account number
const ACCOUNT_ALLOCATION_ATTEMPTS: usize = 16;

/// Wallet lookup and creation
#[derive(Clone, Debug)]
pub struct WalletDirectory {
    storage: Arc<Storage>,
    country_prefix: String,
    default_currency: Currency,
    metrics: Metrics,
}

impl WalletDirectory {
    /// Create new directory
    pub fn new(storage: Arc<Storage>, config: &Config, metrics: Metrics) -> Result<Self> {
        Ok(Self {
            storage,
            country_prefix: config.accounts.country_prefix.clone(),
            default_currency: Currency::parse(&config.accounts.default_currency)?,
            metrics,
        })
    }

    /// Normalize a raw phone/account identifier
    pub fn normalize(&self, raw: &str) -> Result<AccountNumber> {
        AccountNumber::normalize(raw, &self.country_prefix)
    }

    /// Parse a currency, falling back to the configured default
    pub fn currency_or_default(&self, code: Option<&str>) -> Result<Currency> {
        match code {
            Some(code) => Currency::parse(code),
            None => Ok(self.default_currency.clone()),
        }
    }

    /// Register or update a wallet owner
    pub async fn register_owner(&self, user: User) -> Result<User> {
        if !user.email.contains('@') {
            return Err(Error::Validation(format!("invalid email {:?}", user.email)));
        }
        self.storage
            .blocking(move |storage| {
                storage.put_user(&user)?;
                Ok(user)
            })
            .await
    }

    /// Create a wallet for `owner_id`.
    ///
    /// The owner's stored phone number is updated in the same unit, so either
    /// both writes land or neither does.
    pub async fn create_wallet(
        &self,
        owner_id: Uuid,
        raw_account: &str,
        currency: Option<&str>,
    ) -> Result<Wallet> {
        let account = self.normalize(raw_account)?;
        let currency = self.currency_or_default(currency)?;
        let contact = raw_account.trim().to_string();

        let wallet = self
            .storage
            .atomic("create_wallet", move |unit| {
                let mut owner = unit
                    .lock_user(owner_id)?
                    .ok_or(Error::OwnerNotFound(owner_id))?;

                let primary = unit.lock_owner_primary(owner_id, &currency)?;
                if unit.lock_account(&account)?.is_some() {
                    return Err(Error::DuplicateAccount(account.to_string()));
                }

                let wallet = Wallet::new(owner_id, account, currency);
                unit.insert_wallet(&wallet, primary.is_none())?;

                owner.phone_number = Some(contact);
                unit.put_user(&owner)?;

                Ok(wallet)
            })
            .await?;

        self.metrics.record_wallet_created();
        tracing::info!(
            wallet_id = %wallet.id,
            owner_id = %wallet.owner_id,
            account = %wallet.account_number,
            currency = %wallet.currency,
            "Wallet created"
        );

        Ok(wallet)
    }

    /// Get wallet by ID
    pub async fn get_wallet(&self, wallet_id: Uuid) -> Result<Wallet> {
        self.storage
            .blocking(move |storage| storage.get_wallet(wallet_id))
            .await?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))
    }

    /// Get wallet by (raw or normalized) account number
    pub async fn find_by_account_number(&self, account: &str) -> Result<Wallet> {
        let account = self.normalize(account)?;
        let label = account.to_string();
        self.storage
            .blocking(move |storage| storage.find_wallet_by_account(&account))
            .await?
            .ok_or(Error::WalletNotFound(label))
    }

    /// Get the primary wallet of an owner in a currency
    pub async fn find_by_owner_and_currency(
        &self,
        owner_id: Uuid,
        currency: &str,
    ) -> Result<Wallet> {
        let currency = Currency::parse(currency)?;
        let label = format!("{}/{}", owner_id, currency);
        self.storage
            .blocking(move |storage| storage.find_wallet_by_owner_and_currency(owner_id, &currency))
            .await?
            .ok_or(Error::WalletNotFound(label))
    }

    /// Snapshot of every wallet an owner holds
    pub async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<Wallet>> {
        self.storage
            .blocking(move |storage| storage.list_wallets_by_owner(owner_id))
            .await
    }

    /// Transaction history of a wallet, newest first
    pub async fn wallet_transactions(
        &self,
        wallet_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.storage
            .blocking(move |storage| storage.wallet_transactions(wallet_id, limit))
            .await
    }

    /// Lock the primary `(owner, currency)` wallet, creating it if missing.
    ///
    /// Returns the locked wallet and whether it was created by this unit.
    pub(crate) fn lock_or_create(
        &self,
        unit: &UnitOfWork<'_>,
        owner: &User,
        currency: &Currency,
    ) -> Result<(Wallet, bool)> {
        if let Some(wallet_id) = unit.lock_owner_primary(owner.id, currency)? {
            return Ok((unit.lock_wallet(wallet_id)?, false));
        }

        let account = self.allocate_account_number(unit, owner.phone_number.as_deref())?;
        let wallet = Wallet::new(owner.id, account, currency.clone());
        unit.insert_wallet(&wallet, true)?;
        Ok((wallet, true))
    }

    /// Prefer the owner's phone number, else draw a random 10-digit number
    fn allocate_account_number(
        &self,
        unit: &UnitOfWork<'_>,
        phone: Option<&str>,
    ) -> Result<AccountNumber> {
        if let Some(account) = phone.and_then(|p| self.normalize(p).ok()) {
            if unit.lock_account(&account)?.is_none() {
                return Ok(account);
            }
        }

        let mut rng = rand::thread_rng();
        for _ in 0..ACCOUNT_ALLOCATION_ATTEMPTS {
            let candidate = rng.gen_range(1_000_000_000u64..=9_999_999_999u64).to_string();
            let account = AccountNumber::normalize(&candidate, &self.country_prefix)?;
            if unit.lock_account(&account)?.is_none() {
                return Ok(account);
            }
        }

        Err(Error::Storage(
            "could not allocate a free account number".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_directory() -> (WalletDirectory, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let directory = WalletDirectory::new(storage, &config, Metrics::new().unwrap()).unwrap();
        (directory, temp_dir)
    }

    #[tokio::test]
    async fn test_create_wallet_normalizes_and_updates_contact() {
        let (directory, _temp) = test_directory();
        let owner = directory
            .register_owner(User::new("ada@example.com", "Ada"))
            .await
            .unwrap();

        let wallet = directory
            .create_wallet(owner.id, "+2348012345678", Some("ngn"))
            .await
            .unwrap();
        assert_eq!(wallet.account_number.as_str(), "8012345678");
        assert_eq!(wallet.currency.code(), "NGN");
        assert!(wallet.balance.is_zero());

        let found = directory.find_by_account_number("08012345678").await.unwrap();
        assert_eq!(found.id, wallet.id);

        let stored_owner = directory.storage.get_user(owner.id).unwrap().unwrap();
        assert_eq!(stored_owner.phone_number.as_deref(), Some("+2348012345678"));
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let (directory, _temp) = test_directory();
        let owner = directory
            .register_owner(User::new("ada@example.com", "Ada"))
            .await
            .unwrap();

        directory
            .create_wallet(owner.id, "08012345678", None)
            .await
            .unwrap();
        let err = directory
            .create_wallet(owner.id, "+2348012345678", Some("USD"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAccount(a) if a == "8012345678"));
        assert_eq!(directory.list_by_owner(owner.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_owner_leaves_no_trace() {
        let (directory, _temp) = test_directory();
        let ghost = Uuid::new_v4();

        let err = directory
            .create_wallet(ghost, "08012345678", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnerNotFound(id) if id == ghost));
        assert!(matches!(
            directory.find_by_account_number("08012345678").await,
            Err(Error::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wallets_per_currency() {
        let (directory, _temp) = test_directory();
        let owner = directory
            .register_owner(User::new("ada@example.com", "Ada"))
            .await
            .unwrap();

        let ngn = directory
            .create_wallet(owner.id, "08012345678", Some("NGN"))
            .await
            .unwrap();
        let usd = directory
            .create_wallet(owner.id, "08087654321", Some("USD"))
            .await
            .unwrap();

        let wallets = directory.list_by_owner(owner.id).await.unwrap();
        assert_eq!(wallets.len(), 2);

        let found = directory
            .find_by_owner_and_currency(owner.id, "usd")
            .await
            .unwrap();
        assert_eq!(found.id, usd.id);
        assert_ne!(found.id, ngn.id);

        assert!(matches!(
            directory.find_by_owner_and_currency(owner.id, "EUR").await,
            Err(Error::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_or_create_reuses_primary() {
        let (directory, _temp) = test_directory();
        let mut owner = User::new("ada@example.com", "Ada");
        owner.phone_number = Some("08012345678".into());
        let owner = directory.register_owner(owner).await.unwrap();
        let ngn = Currency::parse("NGN").unwrap();

        let (created, was_created) = directory
            .storage
            .atomic_blocking("test", |unit| directory.lock_or_create(unit, &owner, &ngn))
            .unwrap();
        assert!(was_created);
        assert_eq!(created.account_number.as_str(), "8012345678");

        let (again, was_created) = directory
            .storage
            .atomic_blocking("test", |unit| directory.lock_or_create(unit, &owner, &ngn))
            .unwrap();
        assert!(!was_created);
        assert_eq!(again.id, created.id);
    }

    #[tokio::test]
    async fn test_generated_account_when_phone_taken() {
        let (directory, _temp) = test_directory();
        let first = directory
            .register_owner(User::new("ada@example.com", "Ada"))
            .await
            .unwrap();
        directory
            .create_wallet(first.id, "08012345678", None)
            .await
            .unwrap();

        let mut second = User::new("bob@example.com", "Bob");
        second.phone_number = Some("08012345678".into());
        let second = directory.register_owner(second).await.unwrap();
        let ngn = Currency::parse("NGN").unwrap();

        let (wallet, _) = directory
            .storage
            .atomic_blocking("test", |unit| directory.lock_or_create(unit, &second, &ngn))
            .unwrap();
        assert_ne!(wallet.account_number.as_str(), "8012345678");
        assert_eq!(wallet.account_number.as_str().len(), 10);
    }
}
