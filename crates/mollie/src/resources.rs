use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use paysync_core::{
    Amount, PaymentSnapshot, PaymentStatus, PaymentTimeline, SubscriptionSnapshot,
    SubscriptionStatus, UnknownStatus,
};

const OWNER_METADATA_KEY: &str = "user_id";

/// Amount object as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MollieAmount {
    pub currency: String,
    pub value: String,
}

impl From<MollieAmount> for Amount {
    fn from(value: MollieAmount) -> Self {
        Amount::new(value.value, value.currency)
    }
}

impl From<&Amount> for MollieAmount {
    fn from(value: &Amount) -> Self {
        Self {
            currency: value.currency.clone(),
            value: value.value.clone(),
        }
    }
}

/// Payment resource returned by `GET /payments/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MolliePayment {
    pub id: String,
    pub status: String,
    pub amount: MollieAmount,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl MolliePayment {
    pub fn into_snapshot(self) -> Result<PaymentSnapshot, UnknownStatus> {
        Ok(PaymentSnapshot {
            status: self.status.parse::<PaymentStatus>()?,
            owner_hint: owner_from_metadata(self.metadata.as_ref()),
            id: self.id,
            amount: self.amount.into(),
            description: self.description.unwrap_or_default(),
            customer_id: self.customer_id,
            subscription_id: self.subscription_id,
            timeline: PaymentTimeline {
                created_at: self.created_at,
                paid_at: self.paid_at,
                canceled_at: self.canceled_at,
                failed_at: self.failed_at,
                expires_at: self.expires_at,
            },
        })
    }
}

/// Subscription resource nested under a customer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MollieSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub amount: MollieAmount,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub next_payment_date: Option<NaiveDate>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl MollieSubscription {
    pub fn into_snapshot(self) -> Result<SubscriptionSnapshot, UnknownStatus> {
        Ok(SubscriptionSnapshot {
            status: self.status.parse::<SubscriptionStatus>()?,
            owner_hint: owner_from_metadata(self.metadata.as_ref()),
            id: self.id,
            customer_id: self.customer_id,
            amount: self.amount.into(),
            description: self.description.unwrap_or_default(),
            start_date: self.start_date,
            next_payment_date: self.next_payment_date,
        })
    }
}

/// Customer resource; only the identifier is of interest.
#[derive(Debug, Clone, Deserialize)]
pub struct MollieCustomer {
    pub id: String,
}

/// Parameters for creating a gateway customer for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRequest {
    pub account_id: String,
    pub name: Option<String>,
    pub email: String,
}

/// Parameters for creating a recurring subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub account_id: String,
    pub amount: Amount,
    pub interval: String,
    pub description: String,
    pub webhook_url: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct CustomerBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    pub email: &'a str,
    pub metadata: Metadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionBody<'a> {
    pub amount: MollieAmount,
    pub interval: &'a str,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<&'a str>,
    pub metadata: Metadata<'a>,
}

#[derive(Serialize)]
pub(crate) struct Metadata<'a> {
    pub user_id: &'a str,
    pub created_via: &'static str,
}

impl<'a> Metadata<'a> {
    pub fn for_account(account_id: &'a str) -> Self {
        Self {
            user_id: account_id,
            created_via: "paysync",
        }
    }
}

fn owner_from_metadata(metadata: Option<&Value>) -> Option<String> {
    metadata
        .and_then(|value| value.get(OWNER_METADATA_KEY))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
