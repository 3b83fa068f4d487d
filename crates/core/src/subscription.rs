use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Amount, NotificationKind, NotificationRequest, PlanError, UnknownStatus};

/// Lifecycle status of a recurring billing agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Canceled,
    Suspended,
    Completed,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    /// Forward edges of the subscription state machine. `active -> active` is a renewal.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Active),
            Self::Active => matches!(
                next,
                Self::Active | Self::Canceled | Self::Suspended | Self::Completed
            ),
            _ => false,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            other => Err(UnknownStatus {
                entity: "subscription",
                value: other.to_string(),
            }),
        }
    }
}

/// Authoritative subscription state fetched from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub amount: Amount,
    pub description: String,
    pub start_date: Option<NaiveDate>,
    pub next_payment_date: Option<NaiveDate>,
    pub owner_hint: Option<String>,
}

/// The fields of the local record that take part in a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSubscription {
    pub account_id: String,
    pub status: SubscriptionStatus,
    pub next_billing_date: Option<NaiveDate>,
}

/// A subscription row that does not exist locally yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub account_id: String,
    pub external_id: String,
    pub external_customer_id: String,
    pub status: SubscriptionStatus,
    pub start_date: NaiveDate,
    pub next_billing_date: Option<NaiveDate>,
    pub amount: Amount,
}

/// Result of merging a subscription snapshot with the local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPlan {
    Unchanged {
        account_id: String,
        status: SubscriptionStatus,
    },
    Create {
        record: NewSubscription,
        notification: Option<NotificationRequest>,
    },
    Update {
        account_id: String,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        previous_next_billing_date: Option<NaiveDate>,
        next_billing_date: Option<NaiveDate>,
        notification: Option<NotificationRequest>,
    },
}

impl SubscriptionPlan {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged { .. } => "unchanged",
            Self::Create { .. } => "created",
            Self::Update { .. } => "updated",
        }
    }

    pub fn notification(&self) -> Option<&NotificationRequest> {
        match self {
            Self::Unchanged { .. } => None,
            Self::Create { notification, .. } | Self::Update { notification, .. } => {
                notification.as_ref()
            }
        }
    }
}

/// Plans the merge of `snapshot` into the local subscription `current`.
///
/// The owner of a new record comes from the gateway metadata, then from
/// `customer_owner` (the account mapped to the subscription's customer).
/// Status and next-billing date are both compared, so a renewal that only
/// moves the billing date is still a write.
pub fn plan_subscription(
    current: Option<&CurrentSubscription>,
    snapshot: &SubscriptionSnapshot,
    customer_owner: Option<&str>,
    today: NaiveDate,
) -> Result<SubscriptionPlan, PlanError> {
    match current {
        Some(current)
            if current.status == snapshot.status
                && current.next_billing_date == snapshot.next_payment_date =>
        {
            Ok(SubscriptionPlan::Unchanged {
                account_id: current.account_id.clone(),
                status: current.status,
            })
        }
        Some(current) => {
            let notification = (snapshot.status == SubscriptionStatus::Active
                && current.status != SubscriptionStatus::Active)
                .then(|| activation_notice(&current.account_id, snapshot));
            Ok(SubscriptionPlan::Update {
                account_id: current.account_id.clone(),
                from: current.status,
                to: snapshot.status,
                previous_next_billing_date: current.next_billing_date,
                next_billing_date: snapshot.next_payment_date,
                notification,
            })
        }
        None => {
            let account_id = snapshot
                .owner_hint
                .as_deref()
                .filter(|value| !value.is_empty())
                .or(customer_owner)
                .map(str::to_string)
                .ok_or_else(|| PlanError::UnresolvedOwner {
                    resource: "subscription",
                    external_id: snapshot.id.clone(),
                })?;
            let notification = (snapshot.status == SubscriptionStatus::Active)
                .then(|| activation_notice(&account_id, snapshot));
            Ok(SubscriptionPlan::Create {
                record: NewSubscription {
                    account_id,
                    external_id: snapshot.id.clone(),
                    external_customer_id: snapshot.customer_id.clone(),
                    status: snapshot.status,
                    start_date: snapshot.start_date.unwrap_or(today),
                    next_billing_date: snapshot.next_payment_date,
                    amount: snapshot.amount.clone(),
                },
                notification,
            })
        }
    }
}

fn activation_notice(account_id: &str, snapshot: &SubscriptionSnapshot) -> NotificationRequest {
    NotificationRequest {
        kind: NotificationKind::SubscriptionActivated,
        account_id: account_id.to_string(),
        payment_id: None,
        subscription_id: Some(snapshot.id.clone()),
        amount: snapshot.amount.clone(),
        status: Some(snapshot.status.as_str().to_string()),
        next_payment_date: snapshot.next_payment_date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("date")
    }

    fn snapshot(status: SubscriptionStatus, next: Option<&str>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: "sub_1".to_string(),
            customer_id: "cst_1".to_string(),
            status,
            amount: Amount::new("9.99", "EUR"),
            description: "Monthly".to_string(),
            start_date: Some(date("2024-01-01")),
            next_payment_date: next.map(date),
            owner_hint: None,
        }
    }

    fn current(status: SubscriptionStatus, next: Option<&str>) -> CurrentSubscription {
        CurrentSubscription {
            account_id: "acct_1".to_string(),
            status,
            next_billing_date: next.map(date),
        }
    }

    #[test]
    fn state_machine_edges() {
        assert!(SubscriptionStatus::Pending.can_transition_to(SubscriptionStatus::Active));
        assert!(SubscriptionStatus::Active.can_transition_to(SubscriptionStatus::Active));
        assert!(SubscriptionStatus::Active.can_transition_to(SubscriptionStatus::Suspended));
        assert!(!SubscriptionStatus::Canceled.can_transition_to(SubscriptionStatus::Active));
        assert!(!SubscriptionStatus::Pending.can_transition_to(SubscriptionStatus::Completed));
    }

    #[test]
    fn identical_state_is_unchanged() {
        let plan = plan_subscription(
            Some(&current(SubscriptionStatus::Active, Some("2024-02-01"))),
            &snapshot(SubscriptionStatus::Active, Some("2024-02-01")),
            None,
            date("2024-01-15"),
        )
        .expect("plan");
        assert_eq!(plan.label(), "unchanged");
    }

    #[test]
    fn activation_requests_notification_with_next_date() {
        let plan = plan_subscription(
            Some(&current(SubscriptionStatus::Pending, None)),
            &snapshot(SubscriptionStatus::Active, Some("2024-02-01")),
            None,
            date("2024-01-15"),
        )
        .expect("plan");
        let notification = plan.notification().expect("notification");
        assert_eq!(notification.kind, NotificationKind::SubscriptionActivated);
        assert_eq!(notification.next_payment_date, Some(date("2024-02-01")));
        assert_eq!(notification.account_id, "acct_1");
    }

    #[test]
    fn renewal_writes_without_notifying() {
        let plan = plan_subscription(
            Some(&current(SubscriptionStatus::Active, Some("2024-02-01"))),
            &snapshot(SubscriptionStatus::Active, Some("2024-03-01")),
            None,
            date("2024-02-01"),
        )
        .expect("plan");
        match plan {
            SubscriptionPlan::Update {
                from,
                to,
                previous_next_billing_date,
                next_billing_date,
                notification,
                ..
            } => {
                assert_eq!(from, SubscriptionStatus::Active);
                assert_eq!(to, SubscriptionStatus::Active);
                assert_eq!(previous_next_billing_date, Some(date("2024-02-01")));
                assert_eq!(next_billing_date, Some(date("2024-03-01")));
                assert!(notification.is_none());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_is_recorded_silently() {
        let plan = plan_subscription(
            Some(&current(SubscriptionStatus::Active, Some("2024-02-01"))),
            &snapshot(SubscriptionStatus::Canceled, None),
            None,
            date("2024-01-20"),
        )
        .expect("plan");
        assert_eq!(plan.label(), "updated");
        assert!(plan.notification().is_none());
    }

    #[test]
    fn creation_uses_customer_owner_when_metadata_missing() {
        let plan = plan_subscription(
            None,
            &snapshot(SubscriptionStatus::Active, Some("2024-02-01")),
            Some("acct_9"),
            date("2024-01-15"),
        )
        .expect("plan");
        match plan {
            SubscriptionPlan::Create {
                record,
                notification,
            } => {
                assert_eq!(record.account_id, "acct_9");
                assert_eq!(record.external_customer_id, "cst_1");
                assert_eq!(record.start_date, date("2024-01-01"));
                assert!(notification.is_some());
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn creation_without_owner_fails() {
        let err = plan_subscription(
            None,
            &snapshot(SubscriptionStatus::Pending, None),
            None,
            date("2024-01-15"),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnresolvedOwner { resource: "subscription", .. }));
    }
}
