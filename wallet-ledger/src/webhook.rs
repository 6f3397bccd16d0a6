//! Payment webhook intake
//!
//! Normalizes a verified provider payload and feeds it to the
//! [`ReconciliationEngine`]. Business outcomes are always acknowledged so the
//! provider stops redelivering; only a transient store failure asks for a
//! retry.

use crate::{
    error::ErrorClass,
    reconciliation::{ExternalCredit, ReconciliationEngine, ReconciliationOutcome},
    types::{AttemptOutcome, Metadata, WebhookAttempt},
    Error,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Provider statuses that mean the payment settled
pub const SUCCESS_STATUSES: [&str; 4] = ["successful", "success", "completed", "paid"];

/// Currency assumed when a payload carries none
const DEFAULT_WEBHOOK_CURRENCY: &str = "NGN";

/// Provider payload reduced to the fields the ledger uses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Lowercased provider status
    pub status: String,
    /// `tx_ref` or `reference`
    pub reference: Option<String>,
    /// Amount, parsed exactly
    pub amount: Option<Decimal>,
    /// Currency code
    pub currency: String,
    /// `customer.email`
    pub customer_email: Option<String>,
    /// `customer.phonenumber`
    pub customer_phone: Option<String>,
    /// `id` or `transaction_id`
    pub provider_event_id: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Flattened metadata
    pub metadata: Metadata,
}

impl WebhookPayload {
    /// Read the interesting fields from `data`, falling back to the top level
    /// field by field
    pub fn normalize(payload: &Value) -> Self {
        let data = match payload.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => payload,
        };
        let raw = |name: &str| data.get(name).or_else(|| payload.get(name));
        let field = |name: &str| text(data.get(name)).or_else(|| text(payload.get(name)));
        let customer = raw("customer").filter(|c| c.is_object());

        Self {
            status: field("status")
                .map(|s| s.to_lowercase())
                .unwrap_or_default(),
            reference: field("tx_ref").or_else(|| field("reference")),
            amount: data
                .get("amount")
                .and_then(decimal)
                .or_else(|| payload.get("amount").and_then(decimal)),
            currency: field("currency").unwrap_or_else(|| DEFAULT_WEBHOOK_CURRENCY.to_string()),
            customer_email: customer.and_then(|c| text(c.get("email"))),
            customer_phone: customer.and_then(|c| {
                text(c.get("phonenumber")).or_else(|| text(c.get("phone_number")))
            }),
            provider_event_id: field("id").or_else(|| field("transaction_id")),
            description: field("description"),
            metadata: raw("metadata").map(flatten).unwrap_or_default(),
        }
    }

    /// Whether the status reports a settled payment
    pub fn is_success(&self) -> bool {
        is_success_status(&self.status)
    }

    /// Build a credit; `None` when a required field is missing
    pub fn into_credit(self, provider: &str) -> Option<ExternalCredit> {
        let mut metadata = self.metadata;
        if let Some(description) = self.description {
            metadata.entry("description".to_string()).or_insert(description);
        }
        Some(ExternalCredit {
            provider_event_id: self.provider_event_id,
            external_reference: self.reference?,
            payer_email: self.customer_email?,
            payer_phone: self.customer_phone,
            amount: self.amount?,
            currency: self.currency,
            provider: Some(provider.to_string()),
            metadata,
        })
    }
}

/// Case-insensitive success check
pub fn is_success_status(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    SUCCESS_STATUSES.contains(&status.as_str())
}

/// Transport acknowledgment for one delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAck {
    /// False only when the provider should redeliver
    pub received: bool,
    /// HTTP status for the transport
    pub status_code: u16,
    /// Short human-readable message
    pub message: String,
    /// What actually happened
    pub outcome: AttemptOutcome,
    /// Credit record, if any
    pub transaction_id: Option<Uuid>,
}

impl WebhookAck {
    fn received(outcome: AttemptOutcome, message: &str, transaction_id: Option<Uuid>) -> Self {
        Self {
            received: true,
            status_code: 200,
            message: message.to_string(),
            outcome,
            transaction_id,
        }
    }
}

impl ReconciliationEngine {
    /// Process one verified webhook delivery from `provider`
    pub async fn handle_webhook(&self, provider: &str, payload: &Value) -> WebhookAck {
        let normalized = WebhookPayload::normalize(payload);

        if !normalized.is_success() {
            let detail = format!("Ignored status {:?}", normalized.status);
            self.reject(provider, &normalized, AttemptOutcome::Ignored, &detail)
                .await;
            return WebhookAck::received(AttemptOutcome::Ignored, "Event ignored", None);
        }

        let credit = match normalized.clone().into_credit(provider) {
            Some(credit) => credit,
            None => {
                let detail = "Missing required fields";
                self.reject(provider, &normalized, AttemptOutcome::Malformed, detail)
                    .await;
                return WebhookAck::received(AttemptOutcome::Malformed, detail, None);
            }
        };

        match self.apply_external_credit(credit).await {
            Ok(ReconciliationOutcome::Credited { transaction_id, .. }) => WebhookAck::received(
                AttemptOutcome::Credited,
                "Wallet credited",
                Some(transaction_id),
            ),
            Ok(ReconciliationOutcome::AlreadyProcessed { transaction_id, .. }) => {
                WebhookAck::received(
                    AttemptOutcome::Duplicate,
                    "Already processed",
                    Some(transaction_id),
                )
            }
            Err(Error::PayerNotFound(_)) => {
                WebhookAck::received(AttemptOutcome::PayerNotFound, "Payer not found", None)
            }
            Err(e) if e.is_transient() => WebhookAck {
                received: false,
                status_code: 503,
                message: "Temporary failure, retry later".to_string(),
                outcome: AttemptOutcome::Failed,
                transaction_id: None,
            },
            Err(e) if e.class() == ErrorClass::Validation => {
                WebhookAck::received(AttemptOutcome::Malformed, "Invalid payload", None)
            }
            Err(_) => WebhookAck::received(AttemptOutcome::Failed, "Event recorded", None),
        }
    }

    /// Audit a delivery that never reached the credit path
    async fn reject(
        &self,
        provider: &str,
        payload: &WebhookPayload,
        outcome: AttemptOutcome,
        detail: &str,
    ) {
        self.audit_rejection(WebhookAttempt {
            id: Uuid::now_v7(),
            provider: provider.to_string(),
            outcome,
            reference: payload.reference.clone(),
            provider_event_id: payload.provider_event_id.clone(),
            payer_email: payload.customer_email.clone(),
            amount: payload.amount,
            transaction_id: None,
            detail: detail.to_string(),
            recorded_at: Utc::now(),
        })
        .await;
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn flatten(value: &Value) -> Metadata {
    let Some(object) = value.as_object() else {
        return Metadata::new();
    };
    object
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}
