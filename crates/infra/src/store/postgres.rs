//! Postgres-backed document store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|-----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key / check violation) | `23503`, `23514` | `Invalid` |
//! | Database (serialization failure / deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (other) | Any other | `Invalid` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `Transport` |
//! | RowNotFound | N/A | `NotFound` |
//! | Other | N/A | `Invalid` |
//!
//! ## Posting
//!
//! `apply_posting` runs in one transaction: the document row is locked with
//! `SELECT ... FOR UPDATE`, balance rows are written conditionally on their
//! version, ledger rows are inserted under the
//! `(reference_id, product_id, warehouse_id, transaction_type)` unique
//! constraint, and the document is moved to `done`. Any failure rolls the
//! whole transaction back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{
    DocumentId, ExpectedVersion, LedgerEntryId, ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    AdjustmentCount, BalanceKey, Document, DocumentLine, DocumentStatus, LedgerEntry, PostingBatch,
    Product, StockBalance, Warehouse,
};

use super::r#trait::{DocumentFilter, DocumentStore, LedgerFilter, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

const DOCUMENT_COLUMNS: &str = "id, kind, document_number, warehouse_id, destination_warehouse_id, \
     status, adjustment, notes, created_by, created_at, validated_by, validated_at, version";

const LEDGER_COLUMNS: &str = "id, product_id, warehouse_id, transaction_type, reference_id, \
     reference_number, quantity_change, balance_after, created_by, created_at";

/// Postgres-backed document store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; the store can be
/// shared across tasks.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub async fn put_product(&self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, name, unit_of_measure, reorder_level)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                sku = EXCLUDED.sku,
                name = EXCLUDED.name,
                unit_of_measure = EXCLUDED.unit_of_measure,
                reorder_level = EXCLUDED.reorder_level
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(&product.unit_of_measure)
        .bind(product.reorder_level)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_product", e))?;
        Ok(())
    }

    pub async fn put_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO warehouses (id, code, name, address, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                address = EXCLUDED.address,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(warehouse.id.as_uuid())
        .bind(&warehouse.code)
        .bind(&warehouse.name)
        .bind(&warehouse.address)
        .bind(warehouse.is_active)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_warehouse", e))?;
        Ok(())
    }

    async fn document_exists(&self, id: DocumentId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM documents WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("document_exists", e))?;
        Ok(row.is_some())
    }

    async fn balance_version(&self, key: BalanceKey) -> Result<u64, StoreError> {
        Ok(self.get_balance(key).await?.map(|b| b.version).unwrap_or(0))
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            "SELECT id, sku, name, unit_of_measure, reorder_level FROM products WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, sku, name, unit_of_measure, reorder_level FROM products ORDER BY sku",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self), fields(warehouse_id = %id), err)]
    async fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        let row =
            sqlx::query("SELECT id, code, name, address, is_active FROM warehouses WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_warehouse", e))?;
        row.as_ref().map(warehouse_from_row).transpose()
    }

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        let rows =
            sqlx::query("SELECT id, code, name, address, is_active FROM warehouses ORDER BY code")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_warehouses", e))?;
        rows.iter().map(warehouse_from_row).collect()
    }

    #[instrument(skip(self), fields(document_id = %id), err)]
    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_document", e))?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS} FROM documents
            WHERE ($1::TEXT IS NULL OR kind = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
            ORDER BY created_at, id
            "#
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(&statuses)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_documents", e))?;
        rows.iter().map(document_from_row).collect()
    }

    #[instrument(skip(self), fields(document_id = %document_id), err)]
    async fn get_lines(&self, document_id: DocumentId) -> Result<Vec<DocumentLine>, StoreError> {
        let rows = sqlx::query(
            "SELECT document_id, product_id, quantity FROM document_lines \
             WHERE document_id = $1 ORDER BY line_no",
        )
        .bind(document_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lines", e))?;
        rows.iter().map(line_from_row).collect()
    }

    #[instrument(
        skip(self, document, lines),
        fields(
            document_id = %document.id,
            document_number = %document.document_number,
            line_count = lines.len()
        ),
        err
    )]
    async fn insert_document(
        &self,
        document: &Document,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let adjustment = document
            .adjustment
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Invalid(format!("adjustment serialization failed: {e}")))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO documents ({DOCUMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1)
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(document.id.as_uuid())
        .bind(document.kind.as_str())
        .bind(&document.document_number)
        .bind(document.warehouse_id.as_uuid())
        .bind(document.destination_warehouse_id.map(Uuid::from))
        .bind(document.status.as_str())
        .bind(adjustment)
        .bind(&document.notes)
        .bind(document.created_by.as_uuid())
        .bind(document.created_at)
        .bind(document.validated_by.map(Uuid::from))
        .bind(document.validated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_document", e))?;
        let stored = document_from_row(&row)?;

        insert_lines(&mut tx, document.id, lines).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(
        skip(self, lines),
        fields(document_id = %document_id, line_count = lines.len()),
        err
    )]
    async fn replace_lines(
        &self,
        document_id: DocumentId,
        expected: ExpectedVersion,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE documents SET version = version + 1
            WHERE id = $1 AND ($2::BIGINT IS NULL OR version = $2)
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(document_id.as_uuid())
        .bind(expected_param(expected))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("bump_document_version", e))?;

        let Some(row) = row else {
            rollback(tx).await?;
            return Err(self.missing_or_conflict(document_id, expected).await);
        };
        let stored = document_from_row(&row)?;

        sqlx::query("DELETE FROM document_lines WHERE document_id = $1")
            .bind(document_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_lines", e))?;
        insert_lines(&mut tx, document_id, lines).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(document_id = %id, status = %status), err)]
    async fn update_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        validated_by: Option<UserId>,
        validated_at: Option<DateTime<Utc>>,
        expected: ExpectedVersion,
    ) -> Result<Document, StoreError> {
        let row = update_status_row(&*self.pool, id, status, validated_by, validated_at, expected)
            .await?;
        match row {
            Some(document) => Ok(document),
            None => Err(self.missing_or_conflict(id, expected).await),
        }
    }

    async fn get_balance(&self, key: BalanceKey) -> Result<Option<StockBalance>, StoreError> {
        let row = sqlx::query(
            "SELECT product_id, warehouse_id, quantity, version, updated_at FROM stock_balances \
             WHERE product_id = $1 AND warehouse_id = $2",
        )
        .bind(key.product_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_balance", e))?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn list_balances(
        &self,
        product_id: Option<ProductId>,
    ) -> Result<Vec<StockBalance>, StoreError> {
        let rows = sqlx::query(
            "SELECT product_id, warehouse_id, quantity, version, updated_at FROM stock_balances \
             WHERE ($1::UUID IS NULL OR product_id = $1) ORDER BY product_id, warehouse_id",
        )
        .bind(product_id.map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_balances", e))?;
        rows.iter().map(balance_from_row).collect()
    }

    #[instrument(skip(self), fields(balance = %key), err)]
    async fn upsert_balance(
        &self,
        key: BalanceKey,
        quantity: i64,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError> {
        match write_balance(&*self.pool, key, quantity, expected, Utc::now()).await? {
            Some(balance) => Ok(balance),
            None => {
                let found = self.balance_version(key).await?;
                Err(StoreError::Conflict(format!(
                    "balance {key} expected {expected:?}, found {found}"
                )))
            }
        }
    }

    #[instrument(skip(self), fields(balance = %key), err)]
    async fn delete_balance(
        &self,
        key: BalanceKey,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let version = match expected {
            ExpectedVersion::Exact(v) => Some(v as i64),
            ExpectedVersion::Any => None,
        };
        let result = sqlx::query(
            r#"
            DELETE FROM stock_balances
            WHERE product_id = $1 AND warehouse_id = $2
              AND ($3::BIGINT IS NULL OR version = $3)
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_balance", e))?;

        if result.rows_affected() == 0 {
            return match self.balance_version(key).await? {
                0 => Err(StoreError::NotFound(format!("balance {key}"))),
                found => Err(StoreError::Conflict(format!(
                    "balance {key} expected {expected:?}, found {found}"
                ))),
            };
        }
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        insert_ledger_row(&*self.pool, entry).await
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM stock_ledger
            WHERE ($1::UUID IS NULL OR product_id = $1)
              AND ($2::UUID IS NULL OR warehouse_id = $2)
              AND ($3::UUID IS NULL OR reference_id = $3)
            ORDER BY seq
            "#
        ))
        .bind(filter.product_id.map(Uuid::from))
        .bind(filter.warehouse_id.map(Uuid::from))
        .bind(filter.reference_id.map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_entries", e))?;
        rows.iter().map(ledger_from_row).collect()
    }

    async fn delete_ledger_entry(&self, id: LedgerEntryId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM stock_ledger WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_ledger_entry", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("ledger entry {id}")));
        }
        Ok(())
    }

    #[instrument(
        skip(self, batch),
        fields(
            document_id = %batch.document_id,
            document_number = %batch.document_number,
            balance_writes = batch.balance_writes.len(),
            ledger_entries = batch.ledger_entries.len()
        ),
        err
    )]
    async fn apply_posting(&self, batch: &PostingBatch) -> Result<Document, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT status, version FROM documents WHERE id = $1 FOR UPDATE")
            .bind(batch.document_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_document", e))?;
        let Some(row) = row else {
            rollback(tx).await?;
            return Err(StoreError::NotFound(format!("document {}", batch.document_id)));
        };
        let status: String = row.try_get("status").map_err(decode_error)?;
        let version: i64 = row.try_get("version").map_err(decode_error)?;
        if status == DocumentStatus::Done.as_str() {
            rollback(tx).await?;
            return Err(StoreError::Conflict(format!(
                "document {} is already done",
                batch.document_number
            )));
        }
        if !batch.expected_document_version.matches(version as u64) {
            rollback(tx).await?;
            return Err(StoreError::Conflict(format!(
                "document {} expected {:?}, found {version}",
                batch.document_number, batch.expected_document_version
            )));
        }

        for write in &batch.balance_writes {
            let written = write_balance(
                &mut *tx,
                write.key,
                write.quantity,
                write.expected,
                batch.validated_at,
            )
            .await;
            match written {
                Ok(Some(_)) => {}
                Ok(None) => {
                    rollback(tx).await?;
                    return Err(StoreError::Conflict(format!(
                        "balance {} expected {:?}",
                        write.key, write.expected
                    )));
                }
                Err(e) => {
                    rollback(tx).await?;
                    return Err(e);
                }
            }
        }

        for entry in &batch.ledger_entries {
            if let Err(e) = insert_ledger_row(&mut *tx, entry).await {
                rollback(tx).await?;
                return Err(e);
            }
        }

        let done = update_status_row(
            &mut *tx,
            batch.document_id,
            DocumentStatus::Done,
            Some(batch.validated_by),
            Some(batch.validated_at),
            ExpectedVersion::Exact(version as u64),
        )
        .await;
        let done = match done {
            Ok(Some(document)) => document,
            Ok(None) => {
                rollback(tx).await?;
                return Err(StoreError::Conflict(format!(
                    "document {} changed during posting",
                    batch.document_number
                )));
            }
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(done)
    }
}

impl PostgresDocumentStore {
    async fn missing_or_conflict(&self, id: DocumentId, expected: ExpectedVersion) -> StoreError {
        match self.document_exists(id).await {
            Ok(true) => StoreError::Conflict(format!("document {id} expected {expected:?}")),
            Ok(false) => StoreError::NotFound(format!("document {id}")),
            Err(e) => e,
        }
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

async fn insert_lines(
    tx: &mut Transaction<'_, Postgres>,
    document_id: DocumentId,
    lines: &[DocumentLine],
) -> Result<(), StoreError> {
    for (line_no, line) in lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO document_lines (document_id, line_no, product_id, quantity) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(document_id.as_uuid())
        .bind(line_no as i32)
        .bind(line.product_id.as_uuid())
        .bind(line.quantity)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_line", e))?;
    }
    Ok(())
}

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

async fn update_status_row<'e, E: PgExecutor<'e>>(
    executor: E,
    id: DocumentId,
    status: DocumentStatus,
    validated_by: Option<UserId>,
    validated_at: Option<DateTime<Utc>>,
    expected: ExpectedVersion,
) -> Result<Option<Document>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE documents SET
            status = $2,
            validated_by = COALESCE($3, validated_by),
            validated_at = COALESCE($4, validated_at),
            version = version + 1
        WHERE id = $1 AND ($5::BIGINT IS NULL OR version = $5)
        RETURNING {DOCUMENT_COLUMNS}
        "#
    ))
    .bind(id.as_uuid())
    .bind(status.as_str())
    .bind(validated_by.map(Uuid::from))
    .bind(validated_at)
    .bind(expected_param(expected))
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("update_status", e))?;
    row.as_ref().map(document_from_row).transpose()
}

/// Conditional balance write. `Ok(None)` means the version check failed.
async fn write_balance<'e, E: PgExecutor<'e>>(
    executor: E,
    key: BalanceKey,
    quantity: i64,
    expected: ExpectedVersion,
    at: DateTime<Utc>,
) -> Result<Option<StockBalance>, StoreError> {
    let sql = match expected {
        ExpectedVersion::Exact(0) => {
            r#"
            INSERT INTO stock_balances (product_id, warehouse_id, quantity, version, updated_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (product_id, warehouse_id) DO NOTHING
            RETURNING product_id, warehouse_id, quantity, version, updated_at
            "#
        }
        ExpectedVersion::Exact(_) => {
            r#"
            UPDATE stock_balances SET quantity = $3, version = version + 1, updated_at = $4
            WHERE product_id = $1 AND warehouse_id = $2 AND version = $5
            RETURNING product_id, warehouse_id, quantity, version, updated_at
            "#
        }
        ExpectedVersion::Any => {
            r#"
            INSERT INTO stock_balances (product_id, warehouse_id, quantity, version, updated_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (product_id, warehouse_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                version = stock_balances.version + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING product_id, warehouse_id, quantity, version, updated_at
            "#
        }
    };

    let mut query = sqlx::query(sql)
        .bind(key.product_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(quantity)
        .bind(at);
    if let ExpectedVersion::Exact(v) = expected {
        if v > 0 {
            query = query.bind(v as i64);
        }
    }

    let row = query
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("write_balance", e))?;
    row.as_ref().map(balance_from_row).transpose()
}

async fn insert_ledger_row<'e, E: PgExecutor<'e>>(
    executor: E,
    entry: &LedgerEntry,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO stock_ledger ({LEDGER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
    ))
    .bind(entry.id.as_uuid())
    .bind(entry.product_id.as_uuid())
    .bind(entry.warehouse_id.as_uuid())
    .bind(entry.transaction_type.as_str())
    .bind(entry.reference_id.as_uuid())
    .bind(&entry.reference_number)
    .bind(entry.quantity_change)
    .bind(entry.balance_after)
    .bind(entry.created_by.as_uuid())
    .bind(entry.created_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!("ledger entry {}", entry.key()))
        } else {
            map_sqlx_error("insert_ledger_entry", e)
        }
    })?;
    Ok(())
}

fn decode_error(e: sqlx::Error) -> StoreError {
    StoreError::Invalid(format!("failed to decode row: {e}"))
}

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = stockledger_core::DomainError>,
{
    value
        .parse()
        .map_err(|e: stockledger_core::DomainError| StoreError::Invalid(e.to_string()))
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: ProductId::from_uuid(row.try_get("id").map_err(decode_error)?),
        sku: row.try_get("sku").map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        unit_of_measure: row.try_get("unit_of_measure").map_err(decode_error)?,
        reorder_level: row.try_get("reorder_level").map_err(decode_error)?,
    })
}

fn warehouse_from_row(row: &PgRow) -> Result<Warehouse, StoreError> {
    Ok(Warehouse {
        id: WarehouseId::from_uuid(row.try_get("id").map_err(decode_error)?),
        code: row.try_get("code").map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        address: row.try_get("address").map_err(decode_error)?,
        is_active: row.try_get("is_active").map_err(decode_error)?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document, StoreError> {
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let adjustment: Option<serde_json::Value> = row.try_get("adjustment").map_err(decode_error)?;
    let adjustment = adjustment
        .map(serde_json::from_value::<AdjustmentCount>)
        .transpose()
        .map_err(|e| StoreError::Invalid(format!("adjustment deserialization failed: {e}")))?;
    let destination: Option<Uuid> = row
        .try_get("destination_warehouse_id")
        .map_err(decode_error)?;
    let validated_by: Option<Uuid> = row.try_get("validated_by").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;

    Ok(Document {
        id: DocumentId::from_uuid(row.try_get("id").map_err(decode_error)?),
        kind: parse_column(&kind)?,
        document_number: row.try_get("document_number").map_err(decode_error)?,
        warehouse_id: WarehouseId::from_uuid(row.try_get("warehouse_id").map_err(decode_error)?),
        destination_warehouse_id: destination.map(WarehouseId::from_uuid),
        status: parse_column(&status)?,
        adjustment,
        notes: row.try_get("notes").map_err(decode_error)?,
        created_by: UserId::from_uuid(row.try_get("created_by").map_err(decode_error)?),
        created_at: row.try_get("created_at").map_err(decode_error)?,
        validated_by: validated_by.map(UserId::from_uuid),
        validated_at: row.try_get("validated_at").map_err(decode_error)?,
        version: version as u64,
    })
}

fn line_from_row(row: &PgRow) -> Result<DocumentLine, StoreError> {
    Ok(DocumentLine {
        document_id: DocumentId::from_uuid(row.try_get("document_id").map_err(decode_error)?),
        product_id: ProductId::from_uuid(row.try_get("product_id").map_err(decode_error)?),
        quantity: row.try_get("quantity").map_err(decode_error)?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<StockBalance, StoreError> {
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(StockBalance {
        product_id: ProductId::from_uuid(row.try_get("product_id").map_err(decode_error)?),
        warehouse_id: WarehouseId::from_uuid(row.try_get("warehouse_id").map_err(decode_error)?),
        quantity: row.try_get("quantity").map_err(decode_error)?,
        version: version as u64,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn ledger_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let transaction_type: String = row.try_get("transaction_type").map_err(decode_error)?;
    Ok(LedgerEntry {
        id: LedgerEntryId::from_uuid(row.try_get("id").map_err(decode_error)?),
        product_id: ProductId::from_uuid(row.try_get("product_id").map_err(decode_error)?),
        warehouse_id: WarehouseId::from_uuid(row.try_get("warehouse_id").map_err(decode_error)?),
        transaction_type: parse_column(&transaction_type)?,
        reference_id: DocumentId::from_uuid(row.try_get("reference_id").map_err(decode_error)?),
        reference_number: row.try_get("reference_number").map_err(decode_error)?,
        quantity_change: row.try_get("quantity_change").map_err(decode_error)?,
        balance_after: row.try_get("balance_after").map_err(decode_error)?,
        created_by: UserId::from_uuid(row.try_get("created_by").map_err(decode_error)?),
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Invalid(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            StoreError::Transport(format!("{operation}: {err}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Invalid(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
