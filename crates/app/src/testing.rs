//! In-memory collaborators shared by the app tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::StatusCode;
use tempfile::TempDir;

use paysync_core::{
    Amount, NewSubscription, PaymentSnapshot, PaymentStatus, PaymentTimeline, SubscriptionSnapshot,
    SubscriptionStatus,
};
use paysync_mollie::{CustomerRequest, MollieError, PaymentGateway, SubscriptionRequest};
use paysync_storage::Database;

use crate::{
    notify::{Notification, Notifier, NotifyError},
    reconciler::{Reconciler, RetryPolicy},
};

pub(crate) fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

pub(crate) fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
}

pub(crate) fn transient() -> MollieError {
    MollieError::Status {
        status: StatusCode::SERVICE_UNAVAILABLE,
        body: "maintenance".to_string(),
    }
}

/// Paid-capable one-off payment owned by `acct_7` through metadata.
pub(crate) fn payment(id: &str, status: PaymentStatus) -> PaymentSnapshot {
    PaymentSnapshot {
        id: id.to_string(),
        status,
        amount: Amount::new("29.00", "EUR"),
        description: "Pro plan".to_string(),
        customer_id: Some("cst_1".to_string()),
        subscription_id: None,
        owner_hint: Some("acct_7".to_string()),
        timeline: PaymentTimeline {
            created_at: Some(Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap()),
            paid_at: (status == PaymentStatus::Paid)
                .then(|| Utc.with_ymd_and_hms(2024, 1, 15, 11, 5, 0).unwrap()),
            ..PaymentTimeline::default()
        },
    }
}

pub(crate) fn subscription(
    id: &str,
    status: SubscriptionStatus,
    next: Option<&str>,
) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        id: id.to_string(),
        customer_id: "cst_1".to_string(),
        status,
        amount: Amount::new("9.99", "EUR"),
        description: "Monthly".to_string(),
        start_date: Some(date("2024-01-01")),
        next_payment_date: next.map(date),
        owner_hint: None,
    }
}

/// Gateway double holding snapshots in memory.
#[derive(Default)]
pub(crate) struct StubGateway {
    payments: Mutex<HashMap<String, PaymentSnapshot>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    failures: Mutex<VecDeque<MollieError>>,
    fetches: AtomicUsize,
    customers: Mutex<Vec<CustomerRequest>>,
    created: Mutex<Vec<(String, SubscriptionRequest)>>,
    canceled: Mutex<Vec<(String, String)>>,
}

impl StubGateway {
    pub fn put_payment(&self, snapshot: PaymentSnapshot) {
        self.payments
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn put_subscription(&self, snapshot: SubscriptionSnapshot) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Queues an error returned by the next gateway call.
    pub fn fail_next(&self, err: MollieError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn customers_created(&self) -> Vec<CustomerRequest> {
        self.customers.lock().unwrap().clone()
    }

    pub fn subscriptions_created(&self) -> Vec<(String, SubscriptionRequest)> {
        self.created.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> Vec<(String, String)> {
        self.canceled.lock().unwrap().clone()
    }

    fn take_failure(&self) -> Result<(), MollieError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentSnapshot, MollieError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or(MollieError::NotFound)
    }

    async fn get_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .filter(|snapshot| snapshot.customer_id == customer_id)
            .cloned()
            .ok_or(MollieError::NotFound)
    }

    async fn create_customer(&self, request: &CustomerRequest) -> Result<String, MollieError> {
        self.take_failure()?;
        let mut customers = self.customers.lock().unwrap();
        customers.push(request.clone());
        Ok(format!("cst_new_{}", customers.len()))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        self.take_failure()?;
        let mut created = self.created.lock().unwrap();
        created.push((customer_id.to_string(), request.clone()));
        let snapshot = SubscriptionSnapshot {
            id: format!("sub_new_{}", created.len()),
            customer_id: customer_id.to_string(),
            status: SubscriptionStatus::Pending,
            amount: request.amount.clone(),
            description: request.description.clone(),
            start_date: Some(date("2024-01-15")),
            next_payment_date: None,
            owner_hint: Some(request.account_id.clone()),
        };
        self.put_subscription(snapshot.clone());
        Ok(snapshot)
    }

    async fn cancel_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        self.take_failure()?;
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let snapshot = subscriptions
            .get_mut(subscription_id)
            .filter(|snapshot| snapshot.customer_id == customer_id)
            .ok_or(MollieError::NotFound)?;
        snapshot.status = SubscriptionStatus::Canceled;
        self.canceled
            .lock()
            .unwrap()
            .push((customer_id.to_string(), subscription_id.to_string()));
        Ok(snapshot.clone())
    }
}

/// Notifier double that records what it was asked to send.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Lookup("relay unavailable".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub reconciler: Reconciler,
    pub gateway: Arc<StubGateway>,
    pub notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

impl Harness {
    pub fn database(&self) -> &Database {
        self.reconciler.database()
    }
}

/// A reconciler over a fresh database seeded with `acct_7` (Ada) and `acct_8`.
pub(crate) async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let database = Database::connect(&url).await.unwrap();
    database.run_migrations().await.unwrap();
    sqlx::query(
        "INSERT INTO accounts (id, email, full_name, created_at) VALUES \
         ('acct_7', 'ada@example.com', 'Ada Lovelace', '2024-01-01T00:00:00Z'), \
         ('acct_8', 'bob@example.com', NULL, '2024-01-01T00:00:00Z')",
    )
    .execute(database.pool())
    .await
    .unwrap();

    let gateway = Arc::new(StubGateway::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let reconciler = Reconciler::new(
        database,
        gateway.clone(),
        notifier.clone(),
        RetryPolicy::immediate(3),
    )
    .with_clock(Arc::new(fixed_now));

    Harness {
        reconciler,
        gateway,
        notifier,
        _dir: dir,
    }
}

/// Links `cst_1` to `acct_7`.
pub(crate) async fn link_customer(database: &Database) {
    database
        .customers()
        .insert("acct_7", "cst_1", fixed_now())
        .await
        .unwrap();
}

/// Stores a subscription for `acct_7` under customer `cst_1`.
pub(crate) async fn store_subscription(
    database: &Database,
    external_id: &str,
    status: SubscriptionStatus,
    next: Option<&str>,
) {
    let mut tx = database.begin().await.unwrap();
    database
        .subscriptions()
        .insert(
            &mut tx,
            &NewSubscription {
                account_id: "acct_7".to_string(),
                external_id: external_id.to_string(),
                external_customer_id: "cst_1".to_string(),
                status,
                start_date: date("2024-01-01"),
                next_billing_date: next.map(date),
                amount: Amount::new("9.99", "EUR"),
            },
            fixed_now(),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
}
