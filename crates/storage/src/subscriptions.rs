use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use paysync_core::{Amount, CurrentSubscription, NewSubscription, SubscriptionStatus};

use crate::{
    is_foreign_key_violation, parse_date, parse_timestamp, to_date, to_rfc3339, InsertOutcome,
};

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, external_id, external_customer_id, status, \
     start_date, next_billing_date, amount_value, currency, created_at, updated_at";

/// Repository for the local mirror of gateway subscriptions.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        self.fetch_one_where("external_id = ?", &[external_id]).await
    }

    /// Loads a subscription by local id, scoped to the owning account.
    pub async fn find_for_account(
        &self,
        id: &str,
        account_id: &str,
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        self.fetch_one_where("id = ? AND account_id = ?", &[id, account_id])
            .await
    }

    /// Returns the account's active subscription, if it has one.
    pub async fn find_active_for_account(
        &self,
        account_id: &str,
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        self.fetch_one_where("account_id = ? AND status = 'active'", &[account_id])
            .await
    }

    async fn fetch_one_where(
        &self,
        predicate: &str,
        binds: &[&str],
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {predicate} \
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut query = sqlx::query_as::<_, SubscriptionRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(SubscriptionRow::into_record).transpose()
    }

    /// Inserts a subscription first seen through the gateway or created locally.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, SubscriptionError> {
        let result = sqlx::query(
            "INSERT INTO subscriptions \
             (id, account_id, external_id, external_customer_id, status, start_date, \
              next_billing_date, amount_value, currency, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.account_id)
        .bind(&record.external_id)
        .bind(&record.external_customer_id)
        .bind(record.status.as_str())
        .bind(to_date(record.start_date))
        .bind(record.next_billing_date.map(to_date))
        .bind(&record.amount.value)
        .bind(&record.amount.currency)
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::Duplicate),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_foreign_key_violation(&err) => Err(SubscriptionError::UnknownAccount),
            Err(err) => Err(SubscriptionError::Database(err)),
        }
    }

    /// Writes status and next-billing date if both still equal the expected
    /// values. Returns `false` when another writer got there first.
    #[allow(clippy::too_many_arguments)]
    pub async fn compare_and_set(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        external_id: &str,
        expected_status: SubscriptionStatus,
        expected_next_billing_date: Option<NaiveDate>,
        status: SubscriptionStatus,
        next_billing_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<bool, SubscriptionError> {
        let result = sqlx::query(
            "UPDATE subscriptions \
             SET status = ?, next_billing_date = ?, updated_at = ? \
             WHERE external_id = ? AND status = ? AND next_billing_date IS ?",
        )
        .bind(status.as_str())
        .bind(next_billing_date.map(to_date))
        .bind(to_rfc3339(now))
        .bind(external_id)
        .bind(expected_status.as_str())
        .bind(expected_next_billing_date.map(to_date))
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a pending subscription active as a consequence of a paid payment.
    ///
    /// Rows already past `pending` are left untouched and reported as they are.
    pub async fn activate(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, SubscriptionError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'active', updated_at = ? \
             WHERE external_id = ? AND status = 'pending'",
        )
        .bind(to_rfc3339(now))
        .bind(external_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ActivationOutcome::Activated);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM subscriptions WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&mut **tx)
                .await?;
        let Some(status) = status else {
            return Ok(ActivationOutcome::Missing);
        };
        let status = status
            .parse::<SubscriptionStatus>()
            .map_err(|err| SubscriptionError::Corrupt(err.to_string()))?;
        Ok(match status {
            SubscriptionStatus::Active => ActivationOutcome::AlreadyActive,
            other => ActivationOutcome::Terminal(other),
        })
    }

    /// Records a cancellation initiated by the account holder.
    pub async fn mark_canceled(
        &self,
        id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SubscriptionError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'canceled', updated_at = ? \
             WHERE id = ? AND account_id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes a subscription, but only once it has been canceled.
    pub async fn delete_canceled(
        &self,
        id: &str,
        account_id: &str,
    ) -> Result<bool, SubscriptionError> {
        let result = sqlx::query(
            "DELETE FROM subscriptions WHERE id = ? AND account_id = ? AND status = 'canceled'",
        )
        .bind(id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// What a payment-driven activation did to the subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated,
    AlreadyActive,
    /// The subscription has left the pending state for good.
    Terminal(SubscriptionStatus),
    Missing,
}

/// A stored subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub external_customer_id: String,
    pub status: SubscriptionStatus,
    pub start_date: NaiveDate,
    pub next_billing_date: Option<NaiveDate>,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn current(&self) -> CurrentSubscription {
        CurrentSubscription {
            account_id: self.account_id.clone(),
            status: self.status,
            next_billing_date: self.next_billing_date,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    account_id: String,
    external_id: String,
    external_customer_id: String,
    status: String,
    start_date: String,
    next_billing_date: Option<String>,
    amount_value: String,
    currency: String,
    created_at: String,
    updated_at: String,
}

impl SubscriptionRow {
    fn into_record(self) -> Result<SubscriptionRecord, SubscriptionError> {
        let status = self
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|err| SubscriptionError::Corrupt(err.to_string()))?;
        let corrupt = SubscriptionError::Corrupt;
        Ok(SubscriptionRecord {
            id: self.id,
            account_id: self.account_id,
            external_id: self.external_id,
            external_customer_id: self.external_customer_id,
            status,
            start_date: parse_date(&self.start_date).map_err(corrupt)?,
            next_billing_date: self
                .next_billing_date
                .as_deref()
                .map(parse_date)
                .transpose()
                .map_err(corrupt)?,
            amount: Amount::new(self.amount_value, self.currency),
            created_at: parse_timestamp(&self.created_at).map_err(corrupt)?,
            updated_at: parse_timestamp(&self.updated_at).map_err(corrupt)?,
        })
    }
}

/// Errors raised by the subscription repository.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("owning account does not exist")]
    UnknownAccount,
    #[error("corrupt subscription row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
