//! Domain layer for gateway reconciliation.
//!
//! Everything here is free of I/O: statuses and their state machines, the
//! webhook envelope, signature verification, and the planners that turn a
//! gateway snapshot plus the local record into a write plan and the
//! notifications that follow it.

pub mod envelope;
pub mod payment;
pub mod signature;
pub mod subscription;
pub mod types;

pub use envelope::{EnvelopeError, Resource, WebhookEnvelope};
pub use payment::{
    plan_payment, CurrentPayment, NewPayment, PaymentEffects, PaymentPlan, PaymentSnapshot,
    PaymentStatus, PaymentTimeline, SubscriptionActivation,
};
pub use signature::{sign, verify_signature, SignatureError};
pub use subscription::{
    plan_subscription, CurrentSubscription, NewSubscription, SubscriptionPlan,
    SubscriptionSnapshot, SubscriptionStatus,
};
pub use types::{Amount, NotificationKind, NotificationRequest, PlanError, UnknownStatus};
