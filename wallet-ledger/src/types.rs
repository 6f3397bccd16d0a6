//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, never floats)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Opaque key/value metadata attached to transactions
pub type Metadata = BTreeMap<String, String>;

/// Externally addressable wallet identifier (normalized phone/account digits)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountNumber(String);

impl AccountNumber {
    /// Normalize a raw identifier.
    ///
    /// Strips surrounding whitespace, then one leading `country_prefix`
    /// (e.g. `+234`) or one leading `0`. What remains must be ASCII digits.
    pub fn normalize(raw: &str, country_prefix: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let stripped = if !country_prefix.is_empty() && trimmed.starts_with(country_prefix) {
            &trimmed[country_prefix.len()..]
        } else if let Some(rest) = trimmed.strip_prefix('0') {
            rest
        } else {
            trimmed
        };

        if stripped.is_empty() || !stripped.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidAccountNumber(raw.to_string()));
        }

        Ok(Self(stripped.to_string()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217-style currency code (three uppercase letters)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Parse and uppercase a currency code
    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(Error::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// ISO 4217 code
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance-holding account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: Uuid,

    /// Owning user
    pub owner_id: Uuid,

    /// Globally unique account number
    pub account_number: AccountNumber,

    /// Currency, fixed at creation
    pub currency: Currency,

    /// Non-negative balance
    pub balance: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last balance change
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// New empty wallet
    pub fn new(owner_id: Uuid, account_number: AccountNumber, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            account_number,
            currency,
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add `amount` to the balance
    pub fn credit(&mut self, amount: Decimal) -> Result<()> {
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            Error::InvariantViolation(format!("balance overflow on {}", self.account_number))
        })?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Remove `amount` from the balance, refusing to go negative
    pub fn debit(&mut self, amount: Decimal) -> Result<()> {
        if self.balance < amount {
            return Err(Error::InsufficientFunds {
                account: self.account_number.to_string(),
                required: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Money in from outside the ledger
    Credit,
    /// Money out of the ledger
    Debit,
    /// Wallet-to-wallet move
    Transfer,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Not yet applied
    Pending,
    /// Applied
    Success,
    /// Rejected
    Failed,
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Wallet the record belongs to (sender for transfers)
    pub wallet_id: Uuid,

    /// Acting user
    pub user_id: Uuid,

    /// Receiving wallet of a transfer
    pub counterparty_wallet_id: Option<Uuid>,

    /// Type
    pub tx_type: TransactionType,

    /// Always positive; direction implied by `tx_type`
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Status
    pub status: TransactionStatus,

    /// Idempotency key, unique across records
    pub reference: String,

    /// Provider-side event identifier, unique when present
    pub provider_event_id: Option<String>,

    /// Description
    pub description: String,

    /// Additional metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Wallet owner, managed by the authentication layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: Uuid,

    /// Login email
    pub email: String,

    /// Display name
    pub name: String,

    /// Contact number as last supplied
    pub phone_number: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl User {
    /// New user with a fresh ID
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: name.into(),
            phone_number: None,
            created_at: Utc::now(),
        }
    }
}

/// How a webhook delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Wallet credited
    Credited,
    /// Event already applied
    Duplicate,
    /// Payer email unknown
    PayerNotFound,
    /// Non-success status
    Ignored,
    /// Required fields missing or invalid
    Malformed,
    /// Storage failure, provider should retry
    Failed,
}

/// Persisted record of one webhook delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAttempt {
    /// Attempt ID (UUIDv7)
    pub id: Uuid,

    /// Payment provider
    pub provider: String,

    /// Outcome
    pub outcome: AttemptOutcome,

    /// External reference (`tx_ref`)
    pub reference: Option<String>,

    /// Provider event ID
    pub provider_event_id: Option<String>,

    /// Payer email
    pub payer_email: Option<String>,

    /// Amount, if parsed
    pub amount: Option<Decimal>,

    /// Credit transaction, if one was written
    pub transaction_id: Option<Uuid>,

    /// Human-readable detail
    pub detail: String,

    /// Recorded timestamp
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_strips_country_prefix_or_zero() {
        let intl = AccountNumber::normalize("+2348012345678", "+234").unwrap();
        let local = AccountNumber::normalize("08012345678", "+234").unwrap();
        assert_eq!(intl.as_str(), "8012345678");
        assert_eq!(intl, local);
    }

    #[test]
    fn test_normalize_strips_only_one_prefix() {
        let account = AccountNumber::normalize("008012345678", "+234").unwrap();
        assert_eq!(account.as_str(), "08012345678");

        let account = AccountNumber::normalize(" 8012345678 ", "+234").unwrap();
        assert_eq!(account.as_str(), "8012345678");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(AccountNumber::normalize("", "+234").is_err());
        assert!(AccountNumber::normalize("0", "+234").is_err());
        assert!(AccountNumber::normalize("+234", "+234").is_err());
        assert!(AccountNumber::normalize("080-1234", "+234").is_err());
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!(Currency::parse("ngn").unwrap().code(), "NGN");
        assert_eq!(Currency::parse(" USD ").unwrap().code(), "USD");
        assert!(Currency::parse("US").is_err());
        assert!(Currency::parse("U5D").is_err());
    }

    #[test]
    fn test_wallet_debit_never_negative() {
        let mut wallet = Wallet::new(
            Uuid::new_v4(),
            AccountNumber::normalize("08012345678", "+234").unwrap(),
            Currency::parse("NGN").unwrap(),
        );
        wallet.credit(dec!(100)).unwrap();

        let err = wallet.debit(dec!(100.01)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(wallet.balance, dec!(100));

        wallet.debit(dec!(100)).unwrap();
        assert_eq!(wallet.balance, Decimal::ZERO);
    }

    #[test]
    fn test_transaction_type_serializes_upper() {
        let json = serde_json::to_string(&TransactionType::Transfer).unwrap();
        assert_eq!(json, "\"TRANSFER\"");
    }
}
