//! Converges the local billing mirror with the gateway.
//!
//! The reconciler fetches the authoritative resource, asks the core planner for
//! a write plan, and applies that plan with compare-and-set writes. A write that
//! loses a race re-reads and re-plans, so concurrent deliveries for the same
//! resource apply the transition (and its notification) exactly once.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{error, info, warn};

use paysync_core::{NotificationKind, NotificationRequest, PlanError};
use paysync_mollie::{MollieError, PaymentGateway};
use paysync_storage::{
    AccountError, CustomerError, Database, PaymentError, StorageError, SubscriptionError,
};

use crate::notify::{Notification, Notifier, NotifyError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Attempts at a compare-and-set write before giving up on a contended resource.
pub const MAX_WRITE_ATTEMPTS: usize = 3;

/// Bounded retry schedule for transient gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub factor_ms: u64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            factor_ms: 50,
            max_delay: Duration::from_secs(2),
        }
    }

    /// Retries without sleeping; used where wall-clock delays only slow things down.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            factor_ms: 0,
            max_delay: Duration::ZERO,
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.factor_ms)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// What a successful reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub resource: &'static str,
    pub external_id: String,
    pub action: &'static str,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationKind>,
}

/// Failures of a reconciliation pass. None of these are surfaced to the sender.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("owner could not be resolved: {0}")]
    Resolution(String),
    #[error("{resource} {external_id} does not exist at the gateway")]
    UpstreamNotFound {
        resource: &'static str,
        external_id: String,
    },
    #[error("gateway request failed: {0}")]
    Upstream(#[source] MollieError),
    #[error("datastore failure: {0}")]
    Datastore(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("write for {external_id} kept conflicting after {attempts} attempts")]
    Conflict { external_id: String, attempts: usize },
}

impl ReconcileError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution",
            Self::UpstreamNotFound { .. } => "upstream_not_found",
            Self::Upstream(_) => "upstream",
            Self::Datastore(_) => "datastore",
            Self::Conflict { .. } => "conflict",
        }
    }

    fn datastore(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Datastore(Box::new(err))
    }
}

impl From<PlanError> for ReconcileError {
    fn from(value: PlanError) -> Self {
        Self::Resolution(value.to_string())
    }
}

impl From<PaymentError> for ReconcileError {
    fn from(value: PaymentError) -> Self {
        match value {
            PaymentError::UnknownAccount => {
                Self::Resolution("payment owner is not a known account".to_string())
            }
            other => Self::datastore(other),
        }
    }
}

impl From<SubscriptionError> for ReconcileError {
    fn from(value: SubscriptionError) -> Self {
        match value {
            SubscriptionError::UnknownAccount => {
                Self::Resolution("subscription owner is not a known account".to_string())
            }
            other => Self::datastore(other),
        }
    }
}

impl From<CustomerError> for ReconcileError {
    fn from(value: CustomerError) -> Self {
        Self::datastore(value)
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(value: sqlx::Error) -> Self {
        Self::datastore(StorageError::Database(value))
    }
}

/// Shared machinery of the payment and subscription reconcilers.
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) database: Database,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    clock: Clock,
}

impl Reconciler {
    pub fn new(
        database: Database,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            database,
            gateway,
            notifier,
            retry,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Runs a gateway call, retrying transient failures on the configured schedule.
    /// A gateway 404 maps to [`ReconcileError::UpstreamNotFound`] without retrying.
    pub(crate) async fn fetch<T, F, Fut>(
        &self,
        resource: &'static str,
        external_id: &str,
        call: F,
    ) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MollieError>>,
    {
        let result = RetryIf::spawn(self.retry.backoff(), call, |err: &MollieError| {
            let transient = err.is_transient();
            if transient {
                warn!(
                    stage = resource,
                    external_id,
                    error = %err,
                    "transient gateway failure; retrying"
                );
            }
            transient
        })
        .await;

        result.map_err(|err| match err {
            MollieError::NotFound => ReconcileError::UpstreamNotFound {
                resource,
                external_id: external_id.to_string(),
            },
            other => ReconcileError::Upstream(other),
        })
    }

    /// Records the metrics and log line for a finished pass.
    pub(crate) fn observe(
        &self,
        resource: &'static str,
        external_id: &str,
        result: &Result<ReconcileOutcome, ReconcileError>,
    ) {
        match result {
            Ok(outcome) => {
                counter!(
                    "reconcile_outcomes_total",
                    "resource" => resource,
                    "outcome" => outcome.action
                )
                .increment(1);
                info!(
                    stage = resource,
                    external_id,
                    action = outcome.action,
                    status = %outcome.status,
                    notification = outcome.notification.map(NotificationKind::as_str),
                    "reconciled"
                );
            }
            Err(err) => {
                counter!(
                    "reconcile_failures_total",
                    "resource" => resource,
                    "kind" => err.kind()
                )
                .increment(1);
                error!(
                    stage = resource,
                    external_id,
                    kind = err.kind(),
                    error = %err,
                    "reconciliation failed"
                );
            }
        }
    }

    /// Sends a committed notification. Failures are logged and counted, never returned.
    pub(crate) async fn dispatch(&self, request: &NotificationRequest) {
        let kind = request.kind.as_str();
        let result = self.deliver(request).await;
        let label = if result.is_ok() { "sent" } else { "failed" };
        counter!("notifications_total", "kind" => kind, "result" => label).increment(1);

        match result {
            Ok(()) => info!(
                stage = "notify",
                kind,
                payload = %request.redacted(),
                "notification sent"
            ),
            Err(err) => error!(
                stage = "notify",
                kind,
                error = %err,
                payload = %request.redacted(),
                "notification failed"
            ),
        }
    }

    async fn deliver(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let contact = self
            .database
            .accounts()
            .fetch_contact(&request.account_id)
            .await
            .map_err(|err: AccountError| NotifyError::Lookup(err.to_string()))?
            .ok_or_else(|| NotifyError::UnknownRecipient(request.account_id.clone()))?;
        let notification = Notification::new(request, contact);
        self.notifier.send(&notification).await
    }
}
