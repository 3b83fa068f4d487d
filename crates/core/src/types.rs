use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Monetary amount as reported by the gateway.
///
/// The value keeps the gateway's decimal string (`"29.00"`) so no precision is
/// lost between the gateway, the database and outgoing notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: String,
    pub currency: String,
}

impl Amount {
    pub fn new(value: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Fixed set of user notifications the reconciler may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionActivated,
}

impl NotificationKind {
    /// Returns the canonical name used on the wire and as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment-succeeded",
            Self::PaymentFailed => "payment-failed",
            Self::SubscriptionActivated => "subscription-activated",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification requested by a reconciliation plan.
///
/// The recipient's contact details are looked up by `account_id` when the
/// request is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_payment_date: Option<NaiveDate>,
}

impl NotificationRequest {
    /// Produces a JSON view without the account identifier, suitable for logs.
    pub fn redacted(&self) -> Value {
        json!({
            "kind": self.kind.as_str(),
            "payment_id": self.payment_id,
            "subscription_id": self.subscription_id,
            "amount": self.amount,
            "status": self.status,
        })
    }
}

/// Errors produced while planning a merge of gateway state into local state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no owning account could be resolved for {resource} {external_id}")]
    UnresolvedOwner {
        resource: &'static str,
        external_id: String,
    },
}

/// Returned when a status string is outside the gateway's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {entity} status: {value}")]
pub struct UnknownStatus {
    pub entity: &'static str,
    pub value: String,
}
