use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Amount, NotificationKind, NotificationRequest, PlanError, UnknownStatus};

const DEFAULT_DESCRIPTION: &str = "Payment";

/// Lifecycle status of a single payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Open,
    Canceled,
    Pending,
    Authorized,
    Expired,
    Failed,
    Paid,
}

impl PaymentStatus {
    /// Returns the canonical database and wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Canceled => "canceled",
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Paid => "paid",
        }
    }

    /// `open` and `authorized` may still move; everything else is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open | Self::Authorized)
    }

    /// Returns `true` for the statuses that end a payment unsuccessfully.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled | Self::Expired)
    }

    /// Forward edges of the payment state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Open => matches!(
                next,
                Self::Canceled
                    | Self::Pending
                    | Self::Authorized
                    | Self::Expired
                    | Self::Failed
                    | Self::Paid
            ),
            Self::Authorized => matches!(
                next,
                Self::Paid | Self::Failed | Self::Canceled | Self::Expired
            ),
            _ => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(Self::Open),
            "canceled" => Ok(Self::Canceled),
            "pending" => Ok(Self::Pending),
            "authorized" => Ok(Self::Authorized),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "paid" => Ok(Self::Paid),
            other => Err(UnknownStatus {
                entity: "payment",
                value: other.to_string(),
            }),
        }
    }
}

/// Gateway-reported timestamps for a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentTimeline {
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Authoritative payment state fetched from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSnapshot {
    pub id: String,
    pub status: PaymentStatus,
    pub amount: Amount,
    pub description: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Owning account carried in the resource metadata, when the payment was created by us.
    pub owner_hint: Option<String>,
    pub timeline: PaymentTimeline,
}

/// The fields of the local record that take part in a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentPayment {
    pub account_id: String,
    pub status: PaymentStatus,
}

/// A payment row that does not exist locally yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub account_id: String,
    pub external_id: String,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub description: String,
    pub timeline: PaymentTimeline,
}

/// Activation of a linked subscription, together with the notification that
/// announces it. The notification is only sent when the activation actually
/// moved the subscription into `active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionActivation {
    pub subscription_id: String,
    pub notification: NotificationRequest,
}

/// Side effects that follow a committed status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentEffects {
    pub activation: Option<SubscriptionActivation>,
    pub notification: Option<NotificationRequest>,
}

impl PaymentEffects {
    pub fn is_empty(&self) -> bool {
        self.activation.is_none() && self.notification.is_none()
    }
}

/// Result of merging a gateway snapshot with the local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentPlan {
    Unchanged {
        account_id: String,
        status: PaymentStatus,
    },
    Create {
        record: NewPayment,
        effects: PaymentEffects,
    },
    Update {
        account_id: String,
        from: PaymentStatus,
        to: PaymentStatus,
        timeline: PaymentTimeline,
        effects: PaymentEffects,
    },
}

impl PaymentPlan {
    /// Returns the metrics label of the plan.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged { .. } => "unchanged",
            Self::Create { .. } => "created",
            Self::Update { .. } => "updated",
        }
    }

    pub fn effects(&self) -> Option<&PaymentEffects> {
        match self {
            Self::Unchanged { .. } => None,
            Self::Create { effects, .. } | Self::Update { effects, .. } => Some(effects),
        }
    }
}

/// Plans the merge of `snapshot` into the local record `current`.
///
/// The gateway is authoritative: its status is written verbatim, even when the
/// edge is outside the forward state machine. A snapshot whose status equals
/// the local one produces [`PaymentPlan::Unchanged`] and no side effects.
pub fn plan_payment(
    current: Option<&CurrentPayment>,
    snapshot: &PaymentSnapshot,
) -> Result<PaymentPlan, PlanError> {
    let owner = snapshot
        .owner_hint
        .as_deref()
        .filter(|value| !value.is_empty())
        .or(current.map(|payment| payment.account_id.as_str()))
        .map(str::to_string);

    match current {
        Some(current) if current.status == snapshot.status => Ok(PaymentPlan::Unchanged {
            account_id: current.account_id.clone(),
            status: current.status,
        }),
        Some(current) => {
            let account_id = owner.unwrap_or_else(|| current.account_id.clone());
            let effects = payment_effects(&account_id, snapshot);
            Ok(PaymentPlan::Update {
                account_id,
                from: current.status,
                to: snapshot.status,
                timeline: snapshot.timeline.clone(),
                effects,
            })
        }
        None => {
            let account_id = owner.ok_or_else(|| PlanError::UnresolvedOwner {
                resource: "payment",
                external_id: snapshot.id.clone(),
            })?;
            let effects = payment_effects(&account_id, snapshot);
            let description = if snapshot.description.trim().is_empty() {
                DEFAULT_DESCRIPTION.to_string()
            } else {
                snapshot.description.clone()
            };
            Ok(PaymentPlan::Create {
                record: NewPayment {
                    account_id,
                    external_id: snapshot.id.clone(),
                    external_subscription_id: snapshot.subscription_id.clone(),
                    external_customer_id: snapshot.customer_id.clone(),
                    amount: snapshot.amount.clone(),
                    status: snapshot.status,
                    description,
                    timeline: snapshot.timeline.clone(),
                },
                effects,
            })
        }
    }
}

fn payment_effects(account_id: &str, snapshot: &PaymentSnapshot) -> PaymentEffects {
    let request = |kind: NotificationKind| NotificationRequest {
        kind,
        account_id: account_id.to_string(),
        payment_id: Some(snapshot.id.clone()),
        subscription_id: snapshot.subscription_id.clone(),
        amount: snapshot.amount.clone(),
        status: Some(snapshot.status.as_str().to_string()),
        next_payment_date: None,
    };

    match (snapshot.status, snapshot.subscription_id.as_deref()) {
        (PaymentStatus::Paid, Some(subscription_id)) => PaymentEffects {
            activation: Some(SubscriptionActivation {
                subscription_id: subscription_id.to_string(),
                notification: request(NotificationKind::SubscriptionActivated),
            }),
            notification: None,
        },
        (PaymentStatus::Paid, None) => PaymentEffects {
            activation: None,
            notification: Some(request(NotificationKind::PaymentSucceeded)),
        },
        (status, _) if status.is_failure() => PaymentEffects {
            activation: None,
            notification: Some(request(NotificationKind::PaymentFailed)),
        },
        _ => PaymentEffects::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: PaymentStatus) -> PaymentSnapshot {
        PaymentSnapshot {
            id: "tr_1".to_string(),
            status,
            amount: Amount::new("29.00", "EUR"),
            description: "Monthly plan".to_string(),
            customer_id: Some("cst_1".to_string()),
            subscription_id: None,
            owner_hint: Some("acct_7".to_string()),
            timeline: PaymentTimeline::default(),
        }
    }

    fn current(status: PaymentStatus) -> CurrentPayment {
        CurrentPayment {
            account_id: "acct_7".to_string(),
            status,
        }
    }

    #[test]
    fn state_machine_allows_forward_edges_only() {
        assert!(PaymentStatus::Open.can_transition_to(PaymentStatus::Paid));
        assert!(PaymentStatus::Open.can_transition_to(PaymentStatus::Authorized));
        assert!(PaymentStatus::Authorized.can_transition_to(PaymentStatus::Expired));
        assert!(!PaymentStatus::Authorized.can_transition_to(PaymentStatus::Pending));
        assert!(!PaymentStatus::Paid.can_transition_to(PaymentStatus::Open));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Paid));
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(!PaymentStatus::Open.is_terminal());
    }

    #[test]
    fn parses_known_statuses() {
        for status in [
            PaymentStatus::Open,
            PaymentStatus::Canceled,
            PaymentStatus::Pending,
            PaymentStatus::Authorized,
            PaymentStatus::Expired,
            PaymentStatus::Failed,
            PaymentStatus::Paid,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>(), Ok(status));
        }
        let err = "refunded".parse::<PaymentStatus>().unwrap_err();
        assert_eq!(err.value, "refunded");
    }

    #[test]
    fn unchanged_status_is_a_no_op() {
        let plan = plan_payment(Some(&current(PaymentStatus::Paid)), &snapshot(PaymentStatus::Paid))
            .expect("plan");
        assert!(matches!(plan, PaymentPlan::Unchanged { .. }));
        assert!(plan.effects().is_none());
    }

    #[test]
    fn absent_record_is_created_with_metadata_owner() {
        let plan = plan_payment(None, &snapshot(PaymentStatus::Paid)).expect("plan");
        match plan {
            PaymentPlan::Create { record, effects } => {
                assert_eq!(record.account_id, "acct_7");
                assert_eq!(record.amount, Amount::new("29.00", "EUR"));
                assert_eq!(record.status, PaymentStatus::Paid);
                let notification = effects.notification.expect("notification");
                assert_eq!(notification.kind, NotificationKind::PaymentSucceeded);
                assert!(effects.activation.is_none());
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn absent_record_without_owner_is_rejected() {
        let mut orphan = snapshot(PaymentStatus::Open);
        orphan.owner_hint = None;
        let err = plan_payment(None, &orphan).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnresolvedOwner {
                resource: "payment",
                external_id: "tr_1".to_string()
            }
        );
    }

    #[test]
    fn local_owner_is_used_when_metadata_missing() {
        let mut remote = snapshot(PaymentStatus::Failed);
        remote.owner_hint = None;
        let plan = plan_payment(Some(&current(PaymentStatus::Open)), &remote).expect("plan");
        match plan {
            PaymentPlan::Update {
                account_id,
                from,
                to,
                effects,
                ..
            } => {
                assert_eq!(account_id, "acct_7");
                assert_eq!(from, PaymentStatus::Open);
                assert_eq!(to, PaymentStatus::Failed);
                assert_eq!(
                    effects.notification.map(|n| n.kind),
                    Some(NotificationKind::PaymentFailed)
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn subscription_payment_activates_instead_of_succeeding() {
        let mut remote = snapshot(PaymentStatus::Paid);
        remote.subscription_id = Some("sub_1".to_string());
        let plan = plan_payment(Some(&current(PaymentStatus::Open)), &remote).expect("plan");
        let effects = plan.effects().expect("effects");
        assert!(effects.notification.is_none());
        let activation = effects.activation.as_ref().expect("activation");
        assert_eq!(activation.subscription_id, "sub_1");
        assert_eq!(
            activation.notification.kind,
            NotificationKind::SubscriptionActivated
        );
    }

    #[test]
    fn intermediate_statuses_have_no_effects() {
        let plan = plan_payment(
            Some(&current(PaymentStatus::Open)),
            &snapshot(PaymentStatus::Authorized),
        )
        .expect("plan");
        assert_eq!(plan.label(), "updated");
        assert!(plan.effects().expect("effects").is_empty());
    }

    #[test]
    fn blank_description_falls_back_to_default() {
        let mut remote = snapshot(PaymentStatus::Open);
        remote.description = "  ".to_string();
        match plan_payment(None, &remote).expect("plan") {
            PaymentPlan::Create { record, .. } => assert_eq!(record.description, "Payment"),
            other => panic!("expected create, got {other:?}"),
        }
    }
}
