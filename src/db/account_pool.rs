use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::db::StoreError;
use crate::models::account::{Account, AccountKind, Credential};
use crate::services::encryption::CredentialCipher;

/// Persisted pool of automation accounts. Credential blobs are encrypted at
/// rest; the pool opens them on read so callers only ever see `Credential`.
#[derive(Clone)]
pub struct AccountPool {
    pool: SqlitePool,
    cipher: Arc<CredentialCipher>,
}

impl AccountPool {
    pub fn new(pool: SqlitePool, cipher: Arc<CredentialCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Register a new account.
    pub async fn create(
        &self,
        credential: &Credential,
        kind: AccountKind,
        quota_remaining: i64,
    ) -> Result<i64, StoreError> {
        let blob = self.cipher.seal(credential)?;
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (credential, quota_remaining, kind, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(blob)
        .bind(quota_remaining)
        .bind(kind.code())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn get(&self, account_id: i64) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM accounts WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.account_from_row(&r)).transpose()
    }

    /// All non-deleted accounts, oldest first. Cooldown filtering is applied
    /// by the allocator so the policy stays in one testable place.
    pub async fn list(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM accounts WHERE deleted = 0 ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.account_from_row(r)).collect()
    }

    /// Cool the account down: it must not be selected again until tomorrow.
    /// Used when the remote system reports insufficient quota, or when the
    /// observed balance drops below the low-balance floor.
    pub async fn disable_today(&self, account_id: i64) -> Result<(), StoreError> {
        self.disable_until(account_id, Utc::now().date_naive()).await
    }

    pub async fn disable_until(
        &self,
        account_id: i64,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE accounts SET disabled_until = ? WHERE id = ?
            "#,
        )
        .bind(date)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist what a finished browser session learned about the account:
    /// rotated cookies and, when observed, the fresh credit balance.
    pub async fn record_session_result(
        &self,
        account_id: i64,
        credential: Option<&Credential>,
        balance: Option<i64>,
    ) -> Result<(), StoreError> {
        if let Some(credential) = credential {
            let blob = self.cipher.seal(credential)?;
            sqlx::query(
                r#"
                UPDATE accounts SET credential = ? WHERE id = ?
                "#,
            )
            .bind(blob)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        }

        if let Some(balance) = balance {
            sqlx::query(
                r#"
                UPDATE accounts SET quota_remaining = ? WHERE id = ?
                "#,
            )
            .bind(balance)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Soft-delete (administrative).
    pub async fn mark_deleted(&self, account_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET deleted = 1 WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    fn account_from_row(&self, row: &SqliteRow) -> Result<Account, StoreError> {
        let id: i64 = row.try_get("id")?;

        let kind_code: i64 = row.try_get("kind")?;
        let kind = AccountKind::from_code(kind_code).ok_or(StoreError::Corrupt(id, "kind"))?;

        let blob: Vec<u8> = row.try_get("credential")?;
        let credential = self.cipher.open(&blob)?;

        Ok(Account {
            id,
            credential,
            quota_remaining: row.try_get("quota_remaining")?,
            kind,
            disabled_until: row.try_get("disabled_until")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
