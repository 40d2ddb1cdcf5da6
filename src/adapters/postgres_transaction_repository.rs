//! Postgres implementations of `TransactionStore` and `OwnerDirectory`.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Owner, Transaction, TransactionStatus};
use crate::ports::{
    InsertOutcome, OwnerDirectory, RepositoryError, RepositoryResult, StatusSwap,
    TransactionStore,
};

const COLUMNS: &str = "id, owner_id, reference, amount, status, merchant_id, bank_id, created_at, updated_at, compensated_at";

/// Postgres-backed transaction repository.
#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<InsertOutcome> {
        // The partial unique index on (owner_id, reference) arbitrates
        // concurrent duplicates; the loser gets no row back.
        let inserted = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions (
                id, owner_id, reference, amount, status,
                merchant_id, bank_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (owner_id, reference)
                WHERE reference IS NOT NULL AND reference <> ''
                DO NOTHING
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(tx.id)
        .bind(tx.owner_id)
        .bind(&tx.reference)
        .bind(&tx.amount)
        .bind(tx.status.as_str())
        .bind(&tx.merchant_id)
        .bind(&tx.bank_id)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(row.into_domain()?));
        }

        let reference = tx.reference.as_deref().unwrap_or_default();
        let existing = self
            .find_by_owner_and_reference(tx.owner_id, reference)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "conflicting transaction for reference {}",
                    reference
                ))
            })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn find_by_owner_and_reference(
        &self,
        owner_id: Uuid,
        reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE owner_id = $1 AND reference = $2",
            COLUMNS
        ))
        .bind(owner_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE owner_id = $1 ORDER BY created_at DESC",
            COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: TransactionStatus,
        new: TransactionStatus,
    ) -> RepositoryResult<StatusSwap> {
        let updated = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(StatusSwap::Swapped(row.into_domain()?));
        }

        match self.find_by_id(id).await? {
            Some(current) => Ok(StatusSwap::Mismatch(current)),
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    async fn mark_compensated(&self, id: Uuid) -> RepositoryResult<bool> {
        let marked = sqlx::query(
            r#"
            UPDATE transactions
            SET compensated_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND compensated_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if marked > 0 {
            return Ok(true);
        }

        match self.find_by_id(id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Reads owners from the `accounts` table maintained by the account service.
#[derive(Clone)]
pub struct PostgresOwnerDirectory {
    pool: PgPool,
}

impl PostgresOwnerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerDirectory for PostgresOwnerDirectory {
    async fn resolve(&self, owner_id: Uuid) -> RepositoryResult<Option<Owner>> {
        let row = sqlx::query_as::<_, (Uuid, bool, Option<String>, Option<String>)>(
            "SELECT id, enabled, merchant_id, bank_id FROM accounts WHERE id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, enabled, merchant_id, bank_id)| Owner {
            id,
            enabled,
            merchant_id,
            bank_id,
        }))
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    owner_id: Uuid,
    reference: Option<String>,
    amount: bigdecimal::BigDecimal,
    status: String,
    merchant_id: Option<String>,
    bank_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    compensated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        let status = self
            .status
            .parse::<TransactionStatus>()
            .map_err(|e| RepositoryError::Corrupt(format!("transaction {}: {}", self.id, e)))?;

        Ok(Transaction {
            id: self.id,
            owner_id: self.owner_id,
            reference: self.reference,
            amount: self.amount,
            status,
            merchant_id: self.merchant_id,
            bank_id: self.bank_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            compensated_at: self.compensated_at,
        })
    }
}
