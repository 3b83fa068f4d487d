//! Billing operations started by an account holder rather than by the gateway.

use chrono::Months;
use thiserror::Error;
use tracing::{info, warn};

use paysync_core::{Amount, NewSubscription, SubscriptionStatus};
use paysync_mollie::{CustomerRequest, MollieError, SubscriptionRequest};
use paysync_storage::{
    AccountError, CustomerError, PaymentError, SubscriptionError, SubscriptionRecord,
};

use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};

const STAGE: &str = "account";
const CURRENCY: &str = "EUR";
const INTERVAL: &str = "1 month";

/// What the account holder asks for when subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscriptionRequest {
    pub amount_value: String,
    pub description: String,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("subscription not found")]
    NotFound,
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("account already has an active subscription")]
    ActiveSubscriptionExists,
    #[error("only canceled subscriptions can be deleted")]
    NotCanceled,
    #[error("payment does not belong to this account")]
    AccessDenied,
    #[error("account does not exist")]
    UnknownAccount,
    #[error("gateway request failed: {0}")]
    Gateway(#[from] MollieError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("storage failure: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<AccountError> for BillingError {
    fn from(value: AccountError) -> Self {
        Self::Storage(Box::new(value))
    }
}

impl From<CustomerError> for BillingError {
    fn from(value: CustomerError) -> Self {
        match value {
            CustomerError::UnknownAccount => Self::UnknownAccount,
            other => Self::Storage(Box::new(other)),
        }
    }
}

impl From<SubscriptionError> for BillingError {
    fn from(value: SubscriptionError) -> Self {
        match value {
            SubscriptionError::UnknownAccount => Self::UnknownAccount,
            other => Self::Storage(Box::new(other)),
        }
    }
}

impl From<PaymentError> for BillingError {
    fn from(value: PaymentError) -> Self {
        Self::Storage(Box::new(value))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(value: sqlx::Error) -> Self {
        Self::Storage(Box::new(value))
    }
}

/// Account-facing billing flows. Shares the gateway and storage of the reconciler.
#[derive(Clone)]
pub struct AccountBilling {
    reconciler: Reconciler,
}

impl AccountBilling {
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }

    /// Returns the account's gateway customer, creating it on first use.
    pub async fn ensure_customer(&self, account_id: &str) -> Result<String, BillingError> {
        let database = self.reconciler.database();
        if let Some(existing) = database.customers().find_by_account(account_id).await? {
            return Ok(existing.external_id);
        }

        let contact = database
            .accounts()
            .fetch_contact(account_id)
            .await?
            .ok_or(BillingError::UnknownAccount)?;
        let external_id = self
            .reconciler
            .gateway
            .create_customer(&CustomerRequest {
                account_id: account_id.to_string(),
                name: contact.full_name,
                email: contact.email,
            })
            .await?;

        let outcome = database
            .customers()
            .insert(account_id, &external_id, self.reconciler.now())
            .await?;
        if !outcome.is_duplicate() {
            info!(stage = STAGE, account_id, customer_id = %external_id, "customer created");
            return Ok(external_id);
        }

        // A concurrent request mapped the account first; its customer wins.
        let winner = database
            .customers()
            .find_by_account(account_id)
            .await?
            .ok_or(BillingError::UnknownAccount)?;
        warn!(
            stage = STAGE,
            account_id,
            orphaned = %external_id,
            customer_id = %winner.external_id,
            "customer created concurrently; keeping the stored mapping"
        );
        Ok(winner.external_id)
    }

    /// Starts a monthly subscription. At most one subscription per account may be active.
    pub async fn create_subscription(
        &self,
        account_id: &str,
        request: NewSubscriptionRequest,
    ) -> Result<SubscriptionRecord, BillingError> {
        if request.amount_value.trim().is_empty() {
            return Err(BillingError::InvalidRequest("amount is required"));
        }
        if request.description.trim().is_empty() {
            return Err(BillingError::InvalidRequest("description is required"));
        }

        let database = self.reconciler.database();
        if database
            .subscriptions()
            .find_active_for_account(account_id)
            .await?
            .is_some()
        {
            return Err(BillingError::ActiveSubscriptionExists);
        }

        let customer_id = self.ensure_customer(account_id).await?;
        let snapshot = self
            .reconciler
            .gateway
            .create_subscription(
                &customer_id,
                &SubscriptionRequest {
                    account_id: account_id.to_string(),
                    amount: Amount::new(request.amount_value, CURRENCY),
                    interval: INTERVAL.to_string(),
                    description: request.description,
                    webhook_url: request.webhook_url,
                },
            )
            .await?;

        let now = self.reconciler.now();
        let start_date = snapshot.start_date.unwrap_or_else(|| now.date_naive());
        let next_billing_date = snapshot
            .next_payment_date
            .or_else(|| start_date.checked_add_months(Months::new(1)));
        let record = NewSubscription {
            account_id: account_id.to_string(),
            external_id: snapshot.id.clone(),
            external_customer_id: customer_id,
            status: snapshot.status,
            start_date,
            next_billing_date,
            amount: snapshot.amount.clone(),
        };

        let mut tx = database.begin().await?;
        let inserted = database.subscriptions().insert(&mut tx, &record, now).await?;
        tx.commit().await?;
        if inserted.is_duplicate() {
            info!(stage = STAGE, account_id, subscription_id = %snapshot.id, "subscription already recorded by webhook");
        } else {
            info!(stage = STAGE, account_id, subscription_id = %snapshot.id, "subscription created");
        }

        database
            .subscriptions()
            .find_by_external_id(&snapshot.id)
            .await?
            .ok_or(BillingError::NotFound)
    }

    /// Cancels at the gateway, then records the cancellation locally.
    pub async fn cancel_subscription(
        &self,
        account_id: &str,
        subscription_id: &str,
    ) -> Result<(), BillingError> {
        let subscriptions = self.reconciler.database().subscriptions();
        let record = subscriptions
            .find_for_account(subscription_id, account_id)
            .await?
            .ok_or(BillingError::NotFound)?;

        self.reconciler
            .gateway
            .cancel_subscription(&record.external_customer_id, &record.external_id)
            .await?;
        if !subscriptions
            .mark_canceled(&record.id, account_id, self.reconciler.now())
            .await?
        {
            return Err(BillingError::NotFound);
        }
        info!(stage = STAGE, account_id, subscription_id = %record.external_id, "subscription canceled");
        Ok(())
    }

    /// Removes a subscription row. Only canceled subscriptions may be removed.
    pub async fn delete_subscription(
        &self,
        account_id: &str,
        subscription_id: &str,
    ) -> Result<(), BillingError> {
        let subscriptions = self.reconciler.database().subscriptions();
        let record = subscriptions
            .find_for_account(subscription_id, account_id)
            .await?
            .ok_or(BillingError::NotFound)?;
        if record.status != SubscriptionStatus::Canceled {
            return Err(BillingError::NotCanceled);
        }
        if !subscriptions.delete_canceled(&record.id, account_id).await? {
            return Err(BillingError::NotCanceled);
        }
        info!(stage = STAGE, account_id, subscription_id = %record.external_id, "subscription deleted");
        Ok(())
    }

    /// Re-reads a payment on behalf of its owner and merges it.
    pub async fn refresh_payment(
        &self,
        account_id: &str,
        external_payment_id: &str,
    ) -> Result<ReconcileOutcome, BillingError> {
        let snapshot = self.reconciler.fetch_payment(external_payment_id).await?;
        let local = self
            .reconciler
            .database()
            .payments()
            .find_by_external_id(external_payment_id)
            .await?;

        let owner = snapshot
            .owner_hint
            .as_deref()
            .filter(|value| !value.is_empty())
            .or(local.as_ref().map(|record| record.account_id.as_str()));
        if owner != Some(account_id) {
            warn!(stage = STAGE, account_id, payment_id = external_payment_id, "payment refresh denied");
            return Err(BillingError::AccessDenied);
        }

        Ok(self.reconciler.apply_payment(&snapshot).await?)
    }
}
