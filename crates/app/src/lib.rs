//! HTTP surface and orchestration of the paysync reconciliation service.

pub mod accounts;
pub mod admin;
pub mod notify;
pub mod payments;
pub mod problem;
pub mod reconciler;
pub mod router;
pub mod subscriptions;
pub mod telemetry;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use accounts::{AccountBilling, BillingError, NewSubscriptionRequest};
pub use notify::{HttpNotifier, LogNotifier, Notification, Notifier, NotifyError};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, RetryPolicy};
pub use router::{app_router, AppState};
