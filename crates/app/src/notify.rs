use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use paysync_core::{Amount, NotificationKind, NotificationRequest};
use paysync_storage::AccountContact;

/// Recipient of a user notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Structured notification handed to a [`Notifier`]. Rendering is up to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Recipient,
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

impl Notification {
    pub fn new(request: &NotificationRequest, contact: AccountContact) -> Self {
        Self {
            kind: request.kind,
            recipient: Recipient {
                email: contact.email,
                name: contact.full_name,
            },
            payment_id: request.payment_id.clone(),
            subscription_id: request.subscription_id.clone(),
            amount: request.amount.clone(),
            status: request.status.clone(),
            next_payment_date: request.next_payment_date,
        }
    }
}

/// Outbound channel for user notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no contact details for account {0}")]
    UnknownRecipient(String),
    #[error("failed to load recipient: {0}")]
    Lookup(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay rejected notification with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Writes notifications to the log. Used when no relay is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            stage = "notify",
            kind = notification.kind.as_str(),
            payment_id = notification.payment_id.as_deref(),
            subscription_id = notification.subscription_id.as_deref(),
            amount = %notification.amount,
            "notification emitted to log"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a relay that owns templating and delivery.
#[derive(Clone)]
pub struct HttpNotifier {
    http: Client,
    endpoint: Url,
}

impl HttpNotifier {
    pub fn new(endpoint: Url, http: Client) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(NotifyError::Status { status, body });
        }
        Ok(())
    }
}
