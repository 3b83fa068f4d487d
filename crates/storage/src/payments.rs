use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use paysync_core::{Amount, CurrentPayment, NewPayment, PaymentStatus, PaymentTimeline};

use crate::{
    is_foreign_key_violation, parse_optional_timestamp, parse_timestamp, to_rfc3339,
    InsertOutcome,
};

const PAYMENT_COLUMNS: &str = "id, account_id, external_id, external_subscription_id, \
     external_customer_id, amount_value, currency, status, description, created_at, \
     updated_at, paid_at, canceled_at, failed_at, expires_at";

/// Repository for the local mirror of gateway payments.
#[derive(Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentRow::into_record).transpose()
    }

    /// Returns the gateway customer of any local payment linked to the subscription.
    pub async fn find_customer_for_subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<String>, PaymentError> {
        let customer = sqlx::query_scalar::<_, String>(
            "SELECT external_customer_id FROM payments \
             WHERE external_subscription_id = ? AND external_customer_id IS NOT NULL \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    /// Inserts a payment first seen through the gateway. A concurrent insert of
    /// the same external id yields [`InsertOutcome::Duplicate`].
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewPayment,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, PaymentError> {
        let timeline = &record.timeline;
        let result = sqlx::query(
            "INSERT INTO payments \
             (id, account_id, external_id, external_subscription_id, external_customer_id, \
              amount_value, currency, status, description, created_at, updated_at, \
              paid_at, canceled_at, failed_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.account_id)
        .bind(&record.external_id)
        .bind(&record.external_subscription_id)
        .bind(&record.external_customer_id)
        .bind(&record.amount.value)
        .bind(&record.amount.currency)
        .bind(record.status.as_str())
        .bind(&record.description)
        .bind(to_rfc3339(timeline.created_at.unwrap_or(now)))
        .bind(to_rfc3339(now))
        .bind(timeline.paid_at.map(to_rfc3339))
        .bind(timeline.canceled_at.map(to_rfc3339))
        .bind(timeline.failed_at.map(to_rfc3339))
        .bind(timeline.expires_at.map(to_rfc3339))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::Duplicate),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_foreign_key_violation(&err) => Err(PaymentError::UnknownAccount),
            Err(err) => Err(PaymentError::Database(err)),
        }
    }

    /// Moves the payment from `expected` to `next`, stamping the gateway
    /// timestamps that are present. Returns `false` when the stored status no
    /// longer equals `expected`.
    pub async fn compare_and_set_status(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        external_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        timeline: &PaymentTimeline,
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentError> {
        let result = sqlx::query(
            "UPDATE payments \
             SET status = ?, \
                 updated_at = ?, \
                 paid_at = COALESCE(?, paid_at), \
                 canceled_at = COALESCE(?, canceled_at), \
                 failed_at = COALESCE(?, failed_at), \
                 expires_at = COALESCE(?, expires_at) \
             WHERE external_id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(to_rfc3339(now))
        .bind(timeline.paid_at.map(to_rfc3339))
        .bind(timeline.canceled_at.map(to_rfc3339))
        .bind(timeline.failed_at.map(to_rfc3339))
        .bind(timeline.expires_at.map(to_rfc3339))
        .bind(external_id)
        .bind(expected.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// A stored payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// The subset of the record the merge planner compares against.
    pub fn current(&self) -> CurrentPayment {
        CurrentPayment {
            account_id: self.account_id.clone(),
            status: self.status,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    account_id: String,
    external_id: String,
    external_subscription_id: Option<String>,
    external_customer_id: Option<String>,
    amount_value: String,
    currency: String,
    status: String,
    description: String,
    created_at: String,
    updated_at: String,
    paid_at: Option<String>,
    canceled_at: Option<String>,
    failed_at: Option<String>,
    expires_at: Option<String>,
}

impl PaymentRow {
    fn into_record(self) -> Result<PaymentRecord, PaymentError> {
        let status = self
            .status
            .parse::<PaymentStatus>()
            .map_err(|err| PaymentError::Corrupt(err.to_string()))?;
        let corrupt = PaymentError::Corrupt;
        Ok(PaymentRecord {
            id: self.id,
            account_id: self.account_id,
            external_id: self.external_id,
            external_subscription_id: self.external_subscription_id,
            external_customer_id: self.external_customer_id,
            amount: Amount::new(self.amount_value, self.currency),
            status,
            description: self.description,
            created_at: parse_timestamp(&self.created_at).map_err(corrupt)?,
            updated_at: parse_timestamp(&self.updated_at).map_err(corrupt)?,
            paid_at: parse_optional_timestamp(self.paid_at.as_deref()).map_err(corrupt)?,
            canceled_at: parse_optional_timestamp(self.canceled_at.as_deref()).map_err(corrupt)?,
            failed_at: parse_optional_timestamp(self.failed_at.as_deref()).map_err(corrupt)?,
            expires_at: parse_optional_timestamp(self.expires_at.as_deref()).map_err(corrupt)?,
        })
    }
}

/// Errors raised by the payment repository.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("owning account does not exist")]
    UnknownAccount,
    #[error("corrupt payment row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
