use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stockledger_core::{
    DocumentId, ExpectedVersion, LedgerEntryId, ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    BalanceKey, Document, DocumentLine, DocumentStatus, LedgerEntry, LedgerKey, PostingBatch,
    Product, StockBalance, Warehouse,
};

use super::r#trait::{DocumentFilter, DocumentStore, LedgerFilter, StoreError};

#[derive(Debug, Default)]
struct State {
    products: HashMap<ProductId, Product>,
    warehouses: HashMap<WarehouseId, Warehouse>,
    documents: HashMap<DocumentId, Document>,
    document_numbers: HashSet<String>,
    lines: HashMap<DocumentId, Vec<DocumentLine>>,
    balances: HashMap<BalanceKey, StockBalance>,
    ledger: Vec<LedgerEntry>,
    ledger_keys: HashSet<LedgerKey>,
}

impl State {
    fn document_mut(&mut self, id: DocumentId) -> Result<&mut Document, StoreError> {
        self.documents
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))
    }

    fn balance_version(&self, key: &BalanceKey) -> u64 {
        self.balances.get(key).map(|b| b.version).unwrap_or(0)
    }

    fn write_balance(&mut self, key: BalanceKey, quantity: i64, at: DateTime<Utc>) -> StockBalance {
        let balance = self
            .balances
            .entry(key)
            .or_insert_with(|| StockBalance::absent(key));
        balance.quantity = quantity;
        balance.version += 1;
        balance.updated_at = Some(at);
        balance.clone()
    }
}

/// What an injected commit failure does before reporting the error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitFault {
    /// Nothing is written; the caller sees a transport error.
    Lost,
    /// The batch is committed but the caller still sees a transport error
    /// (the acknowledgement was lost).
    Unacknowledged,
    /// The document is removed just before the commit, which then finds it
    /// missing.
    DocumentRemoved,
}

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance. `apply_posting`
/// validates the whole batch and then applies it under a single write lock, so
/// it is atomic with respect to every other call.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    state: RwLock<State>,
    commit_faults: AtomicU32,
    fault_mode: RwLock<CommitFault>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
            commit_faults: AtomicU32::new(0),
            fault_mode: RwLock::new(CommitFault::Lost),
        }
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Transport("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Transport("lock poisoned".to_string()))
    }

    /// Seed a product (catalog maintenance is outside the ledger).
    pub fn put_product(&self, product: Product) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state
            .products
            .values()
            .any(|p| p.sku == product.sku && p.id != product.id)
        {
            return Err(StoreError::Duplicate(format!("sku {}", product.sku)));
        }
        state.products.insert(product.id, product);
        Ok(())
    }

    /// Seed a warehouse.
    pub fn put_warehouse(&self, warehouse: Warehouse) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state
            .warehouses
            .values()
            .any(|w| w.code == warehouse.code && w.id != warehouse.id)
        {
            return Err(StoreError::Duplicate(format!("warehouse code {}", warehouse.code)));
        }
        state.warehouses.insert(warehouse.id, warehouse);
        Ok(())
    }

    /// Seed an opening balance without a ledger entry.
    pub fn put_balance(&self, key: BalanceKey, quantity: i64) -> Result<StockBalance, StoreError> {
        let mut state = self.write()?;
        Ok(state.write_balance(key, quantity, Utc::now()))
    }

    /// Make the next `count` calls to `apply_posting` fail as `mode` describes.
    pub fn fail_next_commits(&self, count: u32, mode: CommitFault) {
        if let Ok(mut m) = self.fault_mode.write() {
            *m = mode;
        }
        self.commit_faults.store(count, Ordering::SeqCst);
    }

    fn take_fault(&self) -> Option<CommitFault> {
        let took = self
            .commit_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !took {
            return None;
        }
        self.fault_mode.read().ok().map(|m| *m)
    }

    fn commit(&self, batch: &PostingBatch) -> Result<Document, StoreError> {
        let mut state = self.write()?;

        // Validate everything before touching anything.
        let document = state
            .documents
            .get(&batch.document_id)
            .ok_or_else(|| StoreError::NotFound(format!("document {}", batch.document_id)))?;
        if document.status == DocumentStatus::Done {
            return Err(StoreError::Conflict(format!(
                "document {} is already done",
                document.document_number
            )));
        }
        if !batch.expected_document_version.matches(document.version) {
            return Err(StoreError::Conflict(format!(
                "document {} expected {:?}, found {}",
                document.document_number, batch.expected_document_version, document.version
            )));
        }

        for write in &batch.balance_writes {
            let current = state.balance_version(&write.key);
            if !write.expected.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "balance {} expected {:?}, found {}",
                    write.key, write.expected, current
                )));
            }
        }

        let mut batch_keys = HashSet::with_capacity(batch.ledger_entries.len());
        for entry in &batch.ledger_entries {
            let key = entry.key();
            if state.ledger_keys.contains(&key) || !batch_keys.insert(key) {
                return Err(StoreError::Duplicate(format!("ledger entry {key}")));
            }
        }

        // Apply.
        for write in &batch.balance_writes {
            state.write_balance(write.key, write.quantity, batch.validated_at);
        }
        for entry in &batch.ledger_entries {
            state.ledger_keys.insert(entry.key());
            state.ledger.push(entry.clone());
        }
        let document = state.document_mut(batch.document_id)?;
        document.status = DocumentStatus::Done;
        document.validated_by = Some(batch.validated_by);
        document.validated_at = Some(batch.validated_at);
        document.version += 1;
        Ok(document.clone())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.read()?.products.get(&id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let mut products: Vec<Product> = self.read()?.products.values().cloned().collect();
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(products)
    }

    async fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        Ok(self.read()?.warehouses.get(&id).cloned())
    }

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        let mut warehouses: Vec<Warehouse> = self.read()?.warehouses.values().cloned().collect();
        warehouses.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(warehouses)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<Document> = self
            .read()?
            .documents
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        documents.sort_by_key(|d| (d.created_at, d.id));
        Ok(documents)
    }

    async fn get_lines(&self, document_id: DocumentId) -> Result<Vec<DocumentLine>, StoreError> {
        Ok(self
            .read()?
            .lines
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_document(
        &self,
        document: &Document,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        let mut state = self.write()?;
        if state.documents.contains_key(&document.id) {
            return Err(StoreError::Duplicate(format!("document {}", document.id)));
        }
        if !state.document_numbers.insert(document.document_number.clone()) {
            return Err(StoreError::Duplicate(format!(
                "document number {}",
                document.document_number
            )));
        }
        let mut stored = document.clone();
        stored.version = 1;
        state.documents.insert(stored.id, stored.clone());
        state.lines.insert(stored.id, lines.to_vec());
        Ok(stored)
    }

    async fn replace_lines(
        &self,
        document_id: DocumentId,
        expected: ExpectedVersion,
        lines: &[DocumentLine],
    ) -> Result<Document, StoreError> {
        let mut state = self.write()?;
        let document = state.document_mut(document_id)?;
        if !expected.matches(document.version) {
            return Err(StoreError::Conflict(format!(
                "document {} expected {expected:?}, found {}",
                document.document_number, document.version
            )));
        }
        document.version += 1;
        let stored = document.clone();
        state.lines.insert(document_id, lines.to_vec());
        Ok(stored)
    }

    async fn update_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        validated_by: Option<UserId>,
        validated_at: Option<DateTime<Utc>>,
        expected: ExpectedVersion,
    ) -> Result<Document, StoreError> {
        let mut state = self.write()?;
        let document = state.document_mut(id)?;
        if !expected.matches(document.version) {
            return Err(StoreError::Conflict(format!(
                "document {} expected {expected:?}, found {}",
                document.document_number, document.version
            )));
        }
        document.status = status;
        if validated_by.is_some() {
            document.validated_by = validated_by;
        }
        if validated_at.is_some() {
            document.validated_at = validated_at;
        }
        document.version += 1;
        Ok(document.clone())
    }

    async fn get_balance(&self, key: BalanceKey) -> Result<Option<StockBalance>, StoreError> {
        Ok(self.read()?.balances.get(&key).cloned())
    }

    async fn list_balances(
        &self,
        product_id: Option<ProductId>,
    ) -> Result<Vec<StockBalance>, StoreError> {
        let mut balances: Vec<StockBalance> = self
            .read()?
            .balances
            .values()
            .filter(|b| product_id.is_none_or(|p| p == b.product_id))
            .cloned()
            .collect();
        balances.sort_by_key(|b| b.key());
        Ok(balances)
    }

    async fn upsert_balance(
        &self,
        key: BalanceKey,
        quantity: i64,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError> {
        let mut state = self.write()?;
        let current = state.balance_version(&key);
        if !expected.matches(current) {
            return Err(StoreError::Conflict(format!(
                "balance {key} expected {expected:?}, found {current}"
            )));
        }
        Ok(state.write_balance(key, quantity, Utc::now()))
    }

    async fn delete_balance(
        &self,
        key: BalanceKey,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.balance_version(&key) {
            0 => Err(StoreError::NotFound(format!("balance {key}"))),
            current if !expected.matches(current) => Err(StoreError::Conflict(format!(
                "balance {key} expected {expected:?}, found {current}"
            ))),
            _ => {
                state.balances.remove(&key);
                Ok(())
            }
        }
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let key = entry.key();
        if !state.ledger_keys.insert(key) {
            return Err(StoreError::Duplicate(format!("ledger entry {key}")));
        }
        state.ledger.push(entry.clone());
        Ok(())
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .read()?
            .ledger
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn delete_ledger_entry(&self, id: LedgerEntryId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let Some(pos) = state.ledger.iter().position(|e| e.id == id) else {
            return Err(StoreError::NotFound(format!("ledger entry {id}")));
        };
        let removed = state.ledger.remove(pos);
        state.ledger_keys.remove(&removed.key());
        Ok(())
    }

    async fn apply_posting(&self, batch: &PostingBatch) -> Result<Document, StoreError> {
        match self.take_fault() {
            None => self.commit(batch),
            Some(CommitFault::Lost) => Err(StoreError::Transport(
                "connection reset before commit".to_string(),
            )),
            Some(CommitFault::DocumentRemoved) => {
                self.write()?.documents.remove(&batch.document_id);
                self.commit(batch)
            }
            Some(CommitFault::Unacknowledged) => {
                self.commit(batch)?;
                Err(StoreError::Transport(
                    "connection reset after commit".to_string(),
                ))
            }
        }
    }
}
