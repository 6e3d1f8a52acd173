use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use stockledger_core::{
    DocumentId, ExpectedVersion, LedgerEntryId, ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    BalanceKey, Document, DocumentKind, DocumentLine, DocumentStatus, LedgerEntry, PostingBatch,
    Product, StockBalance, Warehouse,
};

/// Document store operation error.
///
/// These are **infrastructure errors** (transport, concurrency, storage
/// constraints) as opposed to the business failures the poster reports.
///
/// - `Transport` and `Conflict` are transient: the same call may succeed later.
/// - `Duplicate` means an idempotency key (ledger entry, unique document
///   number) already exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Transport(String),

    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Conflict(_))
    }
}

/// Ledger history query. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub product_id: Option<ProductId>,
    pub warehouse_id: Option<WarehouseId>,
    pub reference_id: Option<DocumentId>,
}

impl LedgerFilter {
    pub fn for_balance(key: BalanceKey) -> Self {
        Self {
            product_id: Some(key.product_id),
            warehouse_id: Some(key.warehouse_id),
            reference_id: None,
        }
    }

    pub fn for_document(document_id: DocumentId) -> Self {
        Self {
            reference_id: Some(document_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.product_id.is_none_or(|p| p == entry.product_id)
            && self.warehouse_id.is_none_or(|w| w == entry.warehouse_id)
            && self.reference_id.is_none_or(|r| r == entry.reference_id)
    }
}

/// Document listing query. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub kind: Option<DocumentKind>,
    pub statuses: Vec<DocumentStatus>,
}

impl DocumentFilter {
    pub fn pending(kind: DocumentKind) -> Self {
        Self {
            kind: Some(kind),
            statuses: vec![
                DocumentStatus::Draft,
                DocumentStatus::Waiting,
                DocumentStatus::Ready,
            ],
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.kind.is_none_or(|k| k == document.kind)
            && (self.statuses.is_empty() || self.statuses.contains(&document.status))
    }
}

/// Hosted document store: documents, lines, balances and the ledger.
///
/// Every call is a remote round-trip and may fail with
/// [`StoreError::Transport`]. Writes to versioned records (documents and
/// balances) are compare-and-swap on the version the caller read.
///
/// ## Posting
///
/// [`DocumentStore::apply_posting`] commits a whole [`PostingBatch`] as one
/// unit: all balance writes, all ledger entries and the status change, or
/// nothing. Stores with transactions override it. The default implementation
/// is for stores without transactions and applies the primitive writes one by
/// one, undoing the applied ones if a later write fails.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;

    async fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError>;

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError>;

    /// Lines of a document, in line order.
    async fn get_lines(&self, document_id: DocumentId) -> Result<Vec<DocumentLine>, StoreError>;

    /// Insert a new document with its lines. Returns the stored document
    /// (version 1).
    async fn insert_document(
        &self,
        document: &Document,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError>;

    /// Delete and reinsert the line set of a document.
    async fn replace_lines(
        &self,
        document_id: DocumentId,
        expected: ExpectedVersion,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError>;

    async fn update_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        validated_by: Option<UserId>,
        validated_at: Option<DateTime<Utc>>,
        expected: ExpectedVersion,
    ) -> Result<Document, StoreError>;

    async fn get_balance(&self, key: BalanceKey) -> Result<Option<StockBalance>, StoreError>;

    /// Balance rows, optionally restricted to one product.
    async fn list_balances(
        &self,
        product_id: Option<ProductId>,
    ) -> Result<Vec<StockBalance>, StoreError>;

    /// Create or update a balance row. `Exact(0)` requires that the row does
    /// not exist yet.
    async fn upsert_balance(
        &self,
        key: BalanceKey,
        quantity: i64,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError>;

    /// Remove a balance row. Only used to undo a row created by a posting
    /// that did not complete.
    async fn delete_balance(
        &self,
        key: BalanceKey,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Append a ledger entry; rejects a second entry with the same
    /// [`stockledger_inventory::LedgerKey`] with [`StoreError::Duplicate`].
    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Ledger entries in the order they were applied.
    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Remove a ledger entry. Only used to undo an entry written by a posting
    /// that did not complete.
    async fn delete_ledger_entry(&self, id: LedgerEntryId) -> Result<(), StoreError>;

    /// Commit a posting as one unit. Returns the document in status `done`.
    async fn apply_posting(&self, batch: &PostingBatch) -> Result<Document, StoreError> {
        apply_with_compensation(self, batch).await
    }
}

#[derive(Debug)]
struct AppliedBalance {
    key: BalanceKey,
    /// `None` when the write created the row.
    previous_quantity: Option<i64>,
    written_version: u64,
}

/// Sequential apply with compensating undo, for stores without transactions.
async fn apply_with_compensation<S>(store: &S, batch: &PostingBatch) -> Result<Document, StoreError>
where
    S: DocumentStore + ?Sized,
{
    let mut balances: Vec<AppliedBalance> = Vec::with_capacity(batch.balance_writes.len());
    let mut entries: Vec<LedgerEntryId> = Vec::with_capacity(batch.ledger_entries.len());

    let outcome: Result<Document, StoreError> = async {
        for write in &batch.balance_writes {
            let previous_quantity = store.get_balance(write.key).await?.map(|b| b.quantity);
            let written = store
                .upsert_balance(write.key, write.quantity, write.expected)
                .await?;
            balances.push(AppliedBalance {
                key: write.key,
                previous_quantity,
                written_version: written.version,
            });
        }

        for entry in &batch.ledger_entries {
            store.insert_ledger_entry(entry).await?;
            entries.push(entry.id);
        }

        store
            .update_status(
                batch.document_id,
                DocumentStatus::Done,
                Some(batch.validated_by),
                Some(batch.validated_at),
                batch.expected_document_version,
            )
            .await
    }
    .await;

    let err = match outcome {
        Ok(document) => return Ok(document),
        Err(err) => err,
    };

    tracing::warn!(
        document_id = %batch.document_id,
        error = %err,
        balances = balances.len(),
        entries = entries.len(),
        "posting failed mid-way; undoing applied writes"
    );

    for id in entries.into_iter().rev() {
        if let Err(undo) = store.delete_ledger_entry(id).await {
            tracing::error!(
                document_id = %batch.document_id,
                entry_id = %id,
                error = %undo,
                "failed to undo ledger entry"
            );
        }
    }
    for applied in balances.into_iter().rev() {
        let expected = ExpectedVersion::Exact(applied.written_version);
        let undone = match applied.previous_quantity {
            Some(quantity) => store
                .upsert_balance(applied.key, quantity, expected)
                .await
                .map(|_| ()),
            None => store.delete_balance(applied.key, expected).await,
        };
        if let Err(undo) = undone {
            tracing::error!(
                document_id = %batch.document_id,
                balance = %applied.key,
                error = %undo,
                "failed to undo balance write"
            );
        }
    }

    Err(err)
}

#[async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).get_product(id).await
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        (**self).list_products().await
    }

    async fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        (**self).get_warehouse(id).await
    }

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        (**self).list_warehouses().await
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        (**self).get_document(id).await
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        (**self).list_documents(filter).await
    }

    async fn get_lines(&self, document_id: DocumentId) -> Result<Vec<DocumentLine>, StoreError> {
        (**self).get_lines(document_id).await
    }

    async fn insert_document(
        &self,
        document: &Document,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        (**self).insert_document(document, lines).await
    }

    async fn replace_lines(
        &self,
        document_id: DocumentId,
        expected: ExpectedVersion,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        (**self).replace_lines(document_id, expected, lines).await
    }

    async fn update_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        validated_by: Option<UserId>,
        validated_at: Option<DateTime<Utc>>,
        expected: ExpectedVersion,
    ) -> Result<Document, StoreError> {
        (**self)
            .update_status(id, status, validated_by, validated_at, expected)
            .await
    }

    async fn get_balance(&self, key: BalanceKey) -> Result<Option<StockBalance>, StoreError> {
        (**self).get_balance(key).await
    }

    async fn list_balances(
        &self,
        product_id: Option<ProductId>,
    ) -> Result<Vec<StockBalance>, StoreError> {
        (**self).list_balances(product_id).await
    }

    async fn upsert_balance(
        &self,
        key: BalanceKey,
        quantity: i64,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError> {
        (**self).upsert_balance(key, quantity, expected).await
    }

    async fn delete_balance(
        &self,
        key: BalanceKey,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        (**self).delete_balance(key, expected).await
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        (**self).insert_ledger_entry(entry).await
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).ledger_entries(filter).await
    }

    async fn delete_ledger_entry(&self, id: LedgerEntryId) -> Result<(), StoreError> {
        (**self).delete_ledger_entry(id).await
    }

    async fn apply_posting(&self, batch: &PostingBatch) -> Result<Document, StoreError> {
        (**self).apply_posting(batch).await
    }
}
