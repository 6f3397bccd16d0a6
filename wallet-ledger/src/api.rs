//! Request and response bodies for the HTTP layer
//!
//! The transport deserializes these, calls [`crate::WalletLedger`], and maps
//! failures through [`ErrorBody`] and [`Error::status_code`].

use crate::{
    error::ErrorClass,
    reconciliation::{ExternalCredit, ReconciliationOutcome},
    transfer::{TransferRequest, TransferResult},
    types::{Metadata, Wallet},
    Error,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /wallets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWalletRequest {
    /// Phone number or account identifier
    pub account_number: String,
    /// Currency; the configured default when omitted
    #[serde(default)]
    pub currency: Option<String>,
}

/// Wallet as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletView {
    /// Wallet ID
    pub id: Uuid,
    /// Account number
    pub account_number: String,
    /// Currency code
    pub currency: String,
    /// Current balance
    pub balance: Decimal,
}

impl From<Wallet> for WalletView {
    fn from(wallet: Wallet) -> Self {
        Self {
            id: wallet.id,
            account_number: wallet.account_number.to_string(),
            currency: wallet.currency.to_string(),
            balance: wallet.balance,
        }
    }
}

/// `GET /wallets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletList {
    /// Caller's wallets
    pub wallets: Vec<WalletView>,
}

/// `POST /transfers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBody {
    /// Sending account
    pub from_account: String,
    /// Receiving account
    pub to_account: String,
    /// Amount, as a decimal string
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Client idempotency key
    #[serde(default)]
    pub reference: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
}

impl TransferBody {
    /// Attach the authenticated caller
    pub fn into_request(self, initiator: Uuid) -> TransferRequest {
        TransferRequest {
            initiator,
            from_account: self.from_account,
            to_account: self.to_account,
            amount: self.amount,
            currency: self.currency,
            reference: self.reference,
            description: self.description,
        }
    }
}

/// Transfer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResponse {
    /// Audit record
    pub transaction_id: Uuid,
    /// Transfer reference
    pub reference: String,
    /// Sender balance after the transfer
    pub balance: Decimal,
    /// True when served from an earlier commit
    pub replayed: bool,
}

impl From<TransferResult> for TransferResponse {
    fn from(result: TransferResult) -> Self {
        Self {
            transaction_id: result.transaction_id,
            reference: result.reference,
            balance: result.sender_balance,
            replayed: result.replayed,
        }
    }
}

/// `POST /credits`, for providers that call the ledger directly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCreditBody {
    /// Provider event ID
    #[serde(default)]
    pub provider_event_id: Option<String>,
    /// Provider reference
    pub reference: String,
    /// Payer email
    pub customer_email: String,
    /// Amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl From<ExternalCreditBody> for ExternalCredit {
    fn from(body: ExternalCreditBody) -> Self {
        ExternalCredit {
            provider_event_id: body.provider_event_id,
            external_reference: body.reference,
            payer_email: body.customer_email,
            payer_phone: None,
            amount: body.amount,
            currency: body.currency,
            provider: None,
            metadata: body.metadata,
        }
    }
}

/// External credit response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCreditResponse {
    /// `credited` or `already_processed`
    pub status: String,
    /// Credit record
    pub transaction_id: Uuid,
    /// Balance after the credit, when this call applied it
    pub balance: Option<Decimal>,
}

impl From<ReconciliationOutcome> for ExternalCreditResponse {
    fn from(outcome: ReconciliationOutcome) -> Self {
        match outcome {
            ReconciliationOutcome::Credited {
                transaction_id,
                balance,
                ..
            } => Self {
                status: "credited".to_string(),
                transaction_id,
                balance: Some(balance),
            },
            ReconciliationOutcome::AlreadyProcessed { transaction_id, .. } => Self {
                status: "already_processed".to_string(),
                transaction_id,
                balance: None,
            },
        }
    }
}

/// Structured error returned with every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Taxonomy class: `validation`, `business_rule`, `transient`, `integrity`
    pub kind: String,
    /// Stable machine code, e.g. `insufficient_funds`
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let kind = match err.class() {
            ErrorClass::Validation => "validation",
            ErrorClass::BusinessRule => "business_rule",
            ErrorClass::Transient => "transient",
            ErrorClass::Integrity => "integrity",
        };
        // Internal details stay in the logs
        let message = match err.class() {
            ErrorClass::Integrity => "Internal error".to_string(),
            _ => err.to_string(),
        };
        Self {
            kind: kind.to_string(),
            code: err.error_type().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_body() {
        let err = Error::InsufficientFunds {
            account: "8012345678".into(),
            required: dec!(500),
            available: dec!(100),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, "business_rule");
        assert_eq!(body.code, "insufficient_funds");
        assert!(body.message.contains("8012345678"));
        assert_eq!(err.status_code(), 422);

        let body = ErrorBody::from(&Error::InvariantViolation("pair total changed".into()));
        assert_eq!(body.kind, "integrity");
        assert_eq!(body.message, "Internal error");
    }

    #[test]
    fn test_transfer_body_accepts_string_amount() {
        let raw = r#"{
            "from_account": "08011111111",
            "to_account": "08022222222",
            "amount": "400.50",
            "currency": "NGN"
        }"#;
        let body: TransferBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.amount, dec!(400.50));
        assert!(body.reference.is_none());
    }

    #[test]
    fn test_credit_response_shapes() {
        let id = Uuid::now_v7();
        let response = ExternalCreditResponse::from(ReconciliationOutcome::AlreadyProcessed {
            transaction_id: id,
            reference: "evt-1".into(),
        });
        assert_eq!(response.status, "already_processed");
        assert_eq!(response.balance, None);
    }
}
