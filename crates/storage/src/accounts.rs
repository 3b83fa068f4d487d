use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::{is_foreign_key_violation, parse_timestamp, to_rfc3339, InsertOutcome};

/// Repository for the read-only accounts table.
#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads the contact details used when addressing notifications.
    pub async fn fetch_contact(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountContact>, AccountError> {
        let contact = sqlx::query_as::<_, AccountContact>(
            "SELECT id, email, full_name FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }
}

/// Addressing details of an account.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AccountContact {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the one-to-one mapping between accounts and gateway customers.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<CustomerRecord>, CustomerError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT id, account_id, external_id, created_at FROM customers WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CustomerRow::into_record).transpose()
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<CustomerRecord>, CustomerError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT id, account_id, external_id, created_at FROM customers WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CustomerRow::into_record).transpose()
    }

    /// Records the mapping unless the account (or the customer) is already mapped.
    pub async fn insert(
        &self,
        account_id: &str,
        external_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, CustomerError> {
        let result = sqlx::query(
            "INSERT INTO customers (id, account_id, external_id, created_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(external_id)
        .bind(to_rfc3339(created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::Duplicate),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_foreign_key_violation(&err) => Err(CustomerError::UnknownAccount),
            Err(err) => Err(CustomerError::Database(err)),
        }
    }
}

/// A stored account to customer mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRecord {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: String,
    account_id: String,
    external_id: String,
    created_at: String,
}

impl CustomerRow {
    fn into_record(self) -> Result<CustomerRecord, CustomerError> {
        Ok(CustomerRecord {
            created_at: parse_timestamp(&self.created_at).map_err(CustomerError::Corrupt)?,
            id: self.id,
            account_id: self.account_id,
            external_id: self.external_id,
        })
    }
}

#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("account does not exist")]
    UnknownAccount,
    #[error("corrupt customer row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
