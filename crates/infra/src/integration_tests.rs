//! Integration tests for the full posting pipeline.
//!
//! Tests: DocumentService → StockLedgerPoster → DocumentStore → StockLevels / Reconciler
//!
//! Verifies:
//! - Receipts, deliveries, transfers and adjustments move stock as expected
//! - Failed postings leave no ledger entries and no balance changes
//! - Posting twice is detected
//! - Concurrent postings never lose an update

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use stockledger_core::{
        DocumentId, ExpectedVersion, LedgerEntryId, ProductId, UserId, WarehouseId,
    };
    use stockledger_inventory::{
        BalanceKey, Document, DocumentLine, DocumentStatus, LedgerEntry, Product, StockBalance,
        TransactionType, Warehouse,
    };

    use crate::documents::{DocumentService, DocumentWithLines, NewLine};
    use crate::identity::StaticIdentity;
    use crate::poster::{MissingReference, PostingError, StockLedgerPoster};
    use crate::projections::StockLevels;
    use crate::reconciliation::Reconciler;
    use crate::retry::RetryPolicy;
    use crate::store::{
        DocumentFilter, DocumentStore, InMemoryDocumentStore, LedgerFilter, StoreError,
    };

    type Store = Arc<InMemoryDocumentStore>;

    struct World {
        store: Store,
        service: DocumentService<Store, StaticIdentity>,
        poster: StockLedgerPoster<Store, StaticIdentity>,
        main: WarehouseId,
        east: WarehouseId,
        widget: ProductId,
        gadget: ProductId,
        bolt: ProductId,
    }

    fn seed(
        store: &InMemoryDocumentStore,
    ) -> (WarehouseId, WarehouseId, ProductId, ProductId, ProductId) {
        let main = Warehouse::new(WarehouseId::new(), "MAIN", "Main warehouse").unwrap();
        let east = Warehouse::new(WarehouseId::new(), "EAST", "East depot")
            .unwrap()
            .with_address("1 Dock Road");
        let widget = Product::new(ProductId::new(), "WID-001", "Widget", "pcs", Some(5)).unwrap();
        let gadget = Product::new(ProductId::new(), "GAD-001", "Gadget", "pcs", None).unwrap();
        let bolt = Product::new(ProductId::new(), "BLT-001", "Bolt", "box", Some(0)).unwrap();
        let ids = (main.id, east.id, widget.id, gadget.id, bolt.id);
        store.put_warehouse(main).unwrap();
        store.put_warehouse(east).unwrap();
        store.put_product(widget).unwrap();
        store.put_product(gadget).unwrap();
        store.put_product(bolt).unwrap();
        ids
    }

    fn world() -> World {
        stockledger_observability::init_for_tests();

        let store: Store = Arc::new(InMemoryDocumentStore::new());
        let (main, east, widget, gadget, bolt) = seed(&store);
        let identity = StaticIdentity::signed_in(UserId::new());
        World {
            service: DocumentService::new(store.clone(), identity),
            poster: StockLedgerPoster::new(store.clone(), identity)
                .with_retry_policy(RetryPolicy::fixed(50, Duration::from_millis(1))),
            store,
            main,
            east,
            widget,
            gadget,
            bolt,
        }
    }

    impl World {
        async fn ready(&self, created: DocumentWithLines) -> DocumentId {
            let id = created.document.id;
            self.service.mark_ready(id).await.unwrap();
            id
        }

        async fn balance(&self, product: ProductId, warehouse: WarehouseId) -> i64 {
            self.store
                .get_balance(BalanceKey::new(product, warehouse))
                .await
                .unwrap()
                .map(|b| b.quantity)
                .unwrap_or(0)
        }

        async fn entries(&self, document: DocumentId) -> Vec<LedgerEntry> {
            self.store
                .ledger_entries(&LedgerFilter::for_document(document))
                .await
                .unwrap()
        }

        async fn status(&self, document: DocumentId) -> DocumentStatus {
            self.store
                .get_document(document)
                .await
                .unwrap()
                .unwrap()
                .status
        }

        async fn receive(&self, product: ProductId, warehouse: WarehouseId, quantity: i64) {
            let created = self
                .service
                .create_receipt(warehouse, &[NewLine::new(product, quantity)])
                .await
                .unwrap();
            let id = self.ready(created).await;
            self.poster.post_document(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn receipt_into_empty_balance_creates_it() {
        let w = world();
        let created = w
            .service
            .create_receipt(w.main, &[NewLine::new(w.widget, 10)])
            .await
            .unwrap();
        let id = w.ready(created).await;

        let receipt = w.poster.post_document(id).await.unwrap();

        assert_eq!(w.balance(w.widget, w.main).await, 10);
        assert_eq!(receipt.entries.len(), 1);
        let entry = &receipt.entries[0];
        assert_eq!(entry.quantity_change, 10);
        assert_eq!(entry.balance_after, 10);
        assert_eq!(entry.transaction_type, TransactionType::Receipt);
        assert_eq!(entry.reference_number, receipt.document.document_number);
        assert_eq!(w.entries(id).await, receipt.entries);
        assert_eq!(receipt.document.status, DocumentStatus::Done);
        assert!(receipt.document.validated_at.is_some());
    }

    #[tokio::test]
    async fn delivery_reduces_balance() {
        let w = world();
        w.receive(w.widget, w.main, 5).await;
        let created = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 3)])
            .await
            .unwrap();
        let id = w.ready(created).await;

        let receipt = w.poster.post_document(id).await.unwrap();

        assert_eq!(w.balance(w.widget, w.main).await, 2);
        assert_eq!(receipt.entries[0].quantity_change, -3);
        assert_eq!(receipt.entries[0].balance_after, 2);
    }

    #[tokio::test]
    async fn delivery_beyond_balance_is_rejected_without_trace() {
        let w = world();
        w.receive(w.widget, w.main, 2).await;
        let created = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 5)])
            .await
            .unwrap();
        let id = w.ready(created).await;

        let err = w.poster.post_document(id).await.unwrap_err();

        assert_eq!(
            err,
            PostingError::InsufficientStock {
                product_id: w.widget,
                warehouse_id: w.main,
                available: 2,
                requested: 5,
            }
        );
        assert_eq!(w.balance(w.widget, w.main).await, 2);
        assert!(w.entries(id).await.is_empty());
        assert_eq!(w.status(id).await, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn delivery_from_warehouse_without_balance_row_is_rejected() {
        let w = world();
        let created = w
            .service
            .create_delivery(w.east, &[NewLine::new(w.gadget, 1)])
            .await
            .unwrap();
        let id = w.ready(created).await;

        let err = w.poster.post_document(id).await.unwrap_err();

        assert!(matches!(
            err,
            PostingError::InsufficientStock { available: 0, requested: 1, .. }
        ));
        assert!(
            w.store
                .get_balance(BalanceKey::new(w.gadget, w.east))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn adjustment_clamps_at_zero_and_records_applied_delta() {
        let w = world();
        w.receive(w.widget, w.main, 10).await;

        // Count says nothing is left: a -10 correction against 10 on hand.
        let adjustment = w
            .service
            .create_adjustment(w.main, w.widget, 0, Some("shrinkage".to_string()))
            .await
            .unwrap();
        assert_eq!(adjustment.lines[0].quantity, -10);

        // Stock moves before the adjustment is posted.
        let delivery = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 6)])
            .await
            .unwrap();
        let delivery = w.ready(delivery).await;
        w.poster.post_document(delivery).await.unwrap();
        assert_eq!(w.balance(w.widget, w.main).await, 4);

        let id = w.ready(adjustment).await;
        let receipt = w.poster.post_document(id).await.unwrap();

        assert_eq!(w.balance(w.widget, w.main).await, 0);
        assert_eq!(receipt.entries.len(), 1);
        assert_eq!(receipt.entries[0].quantity_change, -4);
        assert_eq!(receipt.entries[0].balance_after, 0);
        assert_eq!(receipt.entries[0].transaction_type, TransactionType::Adjustment);
    }

    #[tokio::test]
    async fn positive_adjustment_adds_stock() {
        let w = world();
        w.receive(w.gadget, w.east, 3).await;
        let adjustment = w
            .service
            .create_adjustment(w.east, w.gadget, 8, None)
            .await
            .unwrap();
        let id = w.ready(adjustment).await;

        let receipt = w.poster.post_document(id).await.unwrap();

        assert_eq!(receipt.entries[0].quantity_change, 5);
        assert_eq!(w.balance(w.gadget, w.east).await, 8);
    }

    #[tokio::test]
    async fn transfer_moves_stock_with_outbound_entry_first() {
        let w = world();
        w.receive(w.widget, w.main, 10).await;
        w.receive(w.gadget, w.main, 4).await;
        let created = w
            .service
            .create_transfer(
                w.main,
                w.east,
                &[NewLine::new(w.widget, 7), NewLine::new(w.gadget, 4)],
            )
            .await
            .unwrap();
        let id = w.ready(created).await;

        let receipt = w.poster.post_document(id).await.unwrap();

        assert_eq!(w.balance(w.widget, w.main).await, 3);
        assert_eq!(w.balance(w.widget, w.east).await, 7);
        assert_eq!(w.balance(w.gadget, w.main).await, 0);
        assert_eq!(w.balance(w.gadget, w.east).await, 4);

        let moves: Vec<(ProductId, WarehouseId, i64, i64)> = receipt
            .entries
            .iter()
            .map(|e| (e.product_id, e.warehouse_id, e.quantity_change, e.balance_after))
            .collect();
        assert_eq!(
            moves,
            vec![
                (w.widget, w.main, -7, 3),
                (w.widget, w.east, 7, 7),
                (w.gadget, w.main, -4, 0),
                (w.gadget, w.east, 4, 4),
            ]
        );
        assert!(
            receipt
                .entries
                .iter()
                .all(|e| e.transaction_type == TransactionType::Transfer)
        );
    }

    #[tokio::test]
    async fn posting_requires_ready_status() {
        let w = world();
        let created = w
            .service
            .create_receipt(w.main, &[NewLine::new(w.widget, 1)])
            .await
            .unwrap();
        let id = created.document.id;

        let draft = w.poster.post_document(id).await.unwrap_err();
        assert!(matches!(
            draft,
            PostingError::InvalidTransition {
                from: DocumentStatus::Draft,
                ..
            }
        ));

        w.service.mark_waiting(id).await.unwrap();
        let waiting = w.poster.post_document(id).await.unwrap_err();
        assert!(matches!(
            waiting,
            PostingError::InvalidTransition {
                from: DocumentStatus::Waiting,
                ..
            }
        ));

        w.service.cancel(id).await.unwrap();
        let canceled = w.poster.post_document(id).await.unwrap_err();
        assert!(matches!(
            canceled,
            PostingError::InvalidTransition {
                from: DocumentStatus::Canceled,
                ..
            }
        ));
        assert!(w.entries(id).await.is_empty());
    }

    #[tokio::test]
    async fn second_post_reports_already_posted() {
        let w = world();
        let created = w
            .service
            .create_receipt(w.main, &[NewLine::new(w.widget, 4), NewLine::new(w.gadget, 2)])
            .await
            .unwrap();
        let id = w.ready(created).await;

        w.poster.post_document(id).await.unwrap();
        let err = w.poster.post_document(id).await.unwrap_err();

        assert!(matches!(
            err,
            PostingError::AlreadyPosted { document_id, .. } if document_id == id
        ));
        assert_eq!(w.entries(id).await.len(), 2);
        assert_eq!(w.balance(w.widget, w.main).await, 4);
    }

    #[tokio::test]
    async fn failing_line_leaves_earlier_lines_untouched() {
        let w = world();
        w.receive(w.widget, w.main, 5).await;
        w.receive(w.gadget, w.main, 5).await;
        w.receive(w.bolt, w.main, 1).await;

        let created = w
            .service
            .create_delivery(
                w.main,
                &[
                    NewLine::new(w.widget, 2),
                    NewLine::new(w.gadget, 3),
                    NewLine::new(w.bolt, 2),
                ],
            )
            .await
            .unwrap();
        let id = w.ready(created).await;

        let err = w.poster.post_document(id).await.unwrap_err();

        assert!(matches!(
            err,
            PostingError::InsufficientStock { product_id, .. } if product_id == w.bolt
        ));
        assert!(w.entries(id).await.is_empty());
        assert_eq!(w.balance(w.widget, w.main).await, 5);
        assert_eq!(w.balance(w.gadget, w.main).await, 5);
        assert_eq!(w.balance(w.bolt, w.main).await, 1);
        assert_eq!(w.status(id).await, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn ledger_sums_match_balances_after_mixed_postings() {
        let w = world();
        w.receive(w.widget, w.main, 20).await;
        w.receive(w.gadget, w.east, 6).await;

        let delivery = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 8)])
            .await
            .unwrap();
        let delivery = w.ready(delivery).await;
        w.poster.post_document(delivery).await.unwrap();

        let transfer = w
            .service
            .create_transfer(w.main, w.east, &[NewLine::new(w.widget, 5)])
            .await
            .unwrap();
        let transfer = w.ready(transfer).await;
        w.poster.post_document(transfer).await.unwrap();

        let adjustment = w
            .service
            .create_adjustment(w.east, w.gadget, 2, None)
            .await
            .unwrap();
        let adjustment = w.ready(adjustment).await;
        w.poster.post_document(adjustment).await.unwrap();

        for balance in w.store.list_balances(None).await.unwrap() {
            let sum: i64 = w
                .store
                .ledger_entries(&LedgerFilter::for_balance(balance.key()))
                .await
                .unwrap()
                .iter()
                .map(|e| e.quantity_change)
                .sum();
            assert_eq!(sum, balance.quantity, "balance {}", balance.key());
            assert!(balance.quantity >= 0);
        }

        let reports = Reconciler::new(w.store.clone()).reconcile_all().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.is_consistent() && r.opening_quantity == 0));
    }

    #[tokio::test]
    async fn missing_product_is_reported_before_any_write() {
        let w = world();
        w.store.put_balance(BalanceKey::new(w.widget, w.main), 3).unwrap();
        let ghost = ProductId::new();

        // Written directly: the service would refuse the unknown product.
        let document = Document::new_delivery(w.main, UserId::new(), Utc::now());
        let lines = vec![
            DocumentLine::new(document.id, w.widget, 1),
            DocumentLine::new(document.id, ghost, 1),
        ];
        let stored = w.store.insert_document(&document, &lines).await.unwrap();
        w.store
            .update_status(
                stored.id,
                DocumentStatus::Ready,
                None,
                None,
                ExpectedVersion::Exact(stored.version),
            )
            .await
            .unwrap();

        let err = w.poster.post_document(stored.id).await.unwrap_err();

        assert_eq!(
            err,
            PostingError::MissingReference(MissingReference::Product(ghost))
        );
        assert_eq!(w.balance(w.widget, w.main).await, 3);
    }

    #[tokio::test]
    async fn stock_levels_follow_posted_balances() {
        let w = world();
        w.receive(w.widget, w.main, 4).await;
        w.receive(w.widget, w.east, 4).await;
        w.receive(w.gadget, w.main, 30).await;
        let pending = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.gadget, 1)])
            .await
            .unwrap();

        let levels = StockLevels::new(w.store.clone(), 10);
        let widget = levels.product_stock(w.widget).await.unwrap().unwrap();
        assert_eq!(widget.on_hand, 8);
        assert_eq!(widget.reorder_level, 5);
        assert!(!widget.is_low());

        let low: Vec<ProductId> = levels
            .low_stock()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.product_id)
            .collect();
        assert_eq!(low, vec![w.bolt]);

        let summary = levels.summary().await.unwrap();
        assert_eq!(summary.total_units, 38);
        assert_eq!(summary.pending_deliveries, 1);
        assert_eq!(summary.pending_receipts, 0);
        let pending_docs = w
            .store
            .list_documents(&DocumentFilter::pending(pending.document.kind))
            .await
            .unwrap();
        assert_eq!(pending_docs[0].id, pending.document.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_postings_on_disjoint_balances_both_succeed() {
        let w = world();
        w.receive(w.widget, w.main, 10).await;
        w.receive(w.gadget, w.east, 10).await;

        let a = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 4)])
            .await
            .unwrap();
        let b = w
            .service
            .create_delivery(w.east, &[NewLine::new(w.gadget, 6)])
            .await
            .unwrap();
        let (a, b) = (w.ready(a).await, w.ready(b).await);

        let pa = w.poster.clone();
        let pb = w.poster.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { pa.post_document(a).await }),
            tokio::spawn(async move { pb.post_document(b).await }),
        );

        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());
        assert_eq!(w.balance(w.widget, w.main).await, 6);
        assert_eq!(w.balance(w.gadget, w.east).await, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_postings_on_one_balance_never_lose_updates() {
        let w = world();
        w.receive(w.widget, w.main, 10).await;

        let mut ids = Vec::new();
        for _ in 0..8 {
            let created = w
                .service
                .create_delivery(w.main, &[NewLine::new(w.widget, 1)])
                .await
                .unwrap();
            ids.push(w.ready(created).await);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let poster = w.poster.clone();
                tokio::spawn(async move { poster.post_document(id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(w.balance(w.widget, w.main).await, 2);
        let mut afters: Vec<i64> = w
            .store
            .ledger_entries(&LedgerFilter::for_balance(BalanceKey::new(w.widget, w.main)))
            .await
            .unwrap()
            .iter()
            .skip(1)
            .map(|e| e.balance_after)
            .collect();
        afters.sort_unstable();
        assert_eq!(afters, vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn competing_deliveries_cannot_both_drain_the_same_stock() {
        let w = world();
        w.receive(w.widget, w.main, 5).await;

        let a = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 3)])
            .await
            .unwrap();
        let b = w
            .service
            .create_delivery(w.main, &[NewLine::new(w.widget, 3)])
            .await
            .unwrap();
        let (a, b) = (w.ready(a).await, w.ready(b).await);

        let pa = w.poster.clone();
        let pb = w.poster.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { pa.post_document(a).await }),
            tokio::spawn(async move { pb.post_document(b).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(PostingError::InsufficientStock { available: 2, requested: 3, .. })
        )));
        assert_eq!(w.balance(w.widget, w.main).await, 2);
    }

    /// Document store without transactions: `apply_posting` falls back to the
    /// trait's sequential apply with undo. Fails the n-th ledger insert.
    struct SequentialStore {
        inner: InMemoryDocumentStore,
        ledger_inserts: AtomicU32,
        fail_insert_at: AtomicU32,
    }

    #[async_trait]
    impl DocumentStore for SequentialStore {
        async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
            self.inner.get_product(id).await
        }

        async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
            self.inner.list_products().await
        }

        async fn get_warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
            self.inner.get_warehouse(id).await
        }

        async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
            self.inner.list_warehouses().await
        }

        async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
            self.inner.get_document(id).await
        }

        async fn list_documents(
            &self,
            filter: &DocumentFilter,
        ) -> Result<Vec<Document>, StoreError> {
            self.inner.list_documents(filter).await
        }

        async fn get_lines(
            &self,
            document_id: DocumentId,
        ) -> Result<Vec<DocumentLine>, StoreError> {
            self.inner.get_lines(document_id).await
        }

        async fn insert_document(
            &self,
            document: &Document,
            lines: &[DocumentLine],
        ) -> Result<Document, StoreError> {
            self.inner.insert_document(document, lines).await
        }

        async fn replace_lines(
            &self,
            document_id: DocumentId,
            expected: ExpectedVersion,
            lines: &[DocumentLine],
        ) -> Result<Document, StoreError> {
            self.inner.replace_lines(document_id, expected, lines).await
        }

        async fn update_status(
            &self,
            id: DocumentId,
            status: DocumentStatus,
            validated_by: Option<UserId>,
            validated_at: Option<DateTime<Utc>>,
            expected: ExpectedVersion,
        ) -> Result<Document, StoreError> {
            self.inner
                .update_status(id, status, validated_by, validated_at, expected)
                .await
        }

        async fn get_balance(&self, key: BalanceKey) -> Result<Option<StockBalance>, StoreError> {
            self.inner.get_balance(key).await
        }

        async fn list_balances(
            &self,
            product_id: Option<ProductId>,
        ) -> Result<Vec<StockBalance>, StoreError> {
            self.inner.list_balances(product_id).await
        }

        async fn upsert_balance(
            &self,
            key: BalanceKey,
            quantity: i64,
            expected: ExpectedVersion,
        ) -> Result<StockBalance, StoreError> {
            self.inner.upsert_balance(key, quantity, expected).await
        }

        async fn delete_balance(
            &self,
            key: BalanceKey,
            expected: ExpectedVersion,
        ) -> Result<(), StoreError> {
            self.inner.delete_balance(key, expected).await
        }

        async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
            let n = self.ledger_inserts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_insert_at.load(Ordering::SeqCst) {
                return Err(StoreError::Transport("connection reset".to_string()));
            }
            self.inner.insert_ledger_entry(entry).await
        }

        async fn ledger_entries(
            &self,
            filter: &LedgerFilter,
        ) -> Result<Vec<LedgerEntry>, StoreError> {
            self.inner.ledger_entries(filter).await
        }

        async fn delete_ledger_entry(&self, id: LedgerEntryId) -> Result<(), StoreError> {
            self.inner.delete_ledger_entry(id).await
        }
    }

    fn sequential(inner: InMemoryDocumentStore, fail_insert_at: u32) -> Arc<SequentialStore> {
        Arc::new(SequentialStore {
            inner,
            ledger_inserts: AtomicU32::new(0),
            fail_insert_at: AtomicU32::new(fail_insert_at),
        })
    }

    async fn stored_quantity(store: &Arc<SequentialStore>, key: BalanceKey) -> Option<i64> {
        store.get_balance(key).await.unwrap().map(|b| b.quantity)
    }

    #[tokio::test]
    async fn non_transactional_store_undoes_partial_posting() {
        let inner = InMemoryDocumentStore::new();
        let (main, _east, widget, gadget, _bolt) = seed(&inner);
        inner.put_balance(BalanceKey::new(widget, main), 1).unwrap();
        inner.put_balance(BalanceKey::new(gadget, main), 2).unwrap();
        let store = sequential(inner, 2);

        let identity = StaticIdentity::signed_in(UserId::new());
        let service = DocumentService::new(store.clone(), identity);
        let created = service
            .create_receipt(main, &[NewLine::new(widget, 5), NewLine::new(gadget, 5)])
            .await
            .unwrap();
        let id = created.document.id;
        service.mark_ready(id).await.unwrap();

        let poster = StockLedgerPoster::new(store.clone(), identity)
            .with_retry_policy(RetryPolicy::no_retry());
        let err = poster.post_document(id).await.unwrap_err();
        assert!(matches!(err, PostingError::Transport(_)));

        assert_eq!(stored_quantity(&store, BalanceKey::new(widget, main)).await, Some(1));
        assert_eq!(stored_quantity(&store, BalanceKey::new(gadget, main)).await, Some(2));
        assert!(
            store
                .ledger_entries(&LedgerFilter::for_document(id))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store.get_document(id).await.unwrap().unwrap().status,
            DocumentStatus::Ready
        );

        // The fault was one-off; the next attempt posts cleanly.
        let receipt = poster.post_document(id).await.unwrap();
        assert_eq!(receipt.entries.len(), 2);
        assert_eq!(stored_quantity(&store, BalanceKey::new(widget, main)).await, Some(6));
        assert_eq!(stored_quantity(&store, BalanceKey::new(gadget, main)).await, Some(7));

        let reports = Reconciler::new(store.clone()).reconcile_all().await.unwrap();
        assert!(reports.iter().all(|r| r.is_consistent()));
    }

    #[tokio::test]
    async fn non_transactional_store_removes_rows_created_by_failed_posting() {
        let inner = InMemoryDocumentStore::new();
        let (main, _east, widget, gadget, _bolt) = seed(&inner);
        let store = sequential(inner, 2);

        let identity = StaticIdentity::signed_in(UserId::new());
        let service = DocumentService::new(store.clone(), identity);
        let created = service
            .create_receipt(main, &[NewLine::new(widget, 5), NewLine::new(gadget, 5)])
            .await
            .unwrap();
        let id = created.document.id;
        service.mark_ready(id).await.unwrap();

        let poster = StockLedgerPoster::new(store.clone(), identity)
            .with_retry_policy(RetryPolicy::no_retry());
        let err = poster.post_document(id).await.unwrap_err();
        assert!(matches!(err, PostingError::Transport(_)));

        assert!(store.list_balances(None).await.unwrap().is_empty());
        assert!(
            store
                .ledger_entries(&LedgerFilter::for_document(id))
                .await
                .unwrap()
                .is_empty()
        );

        let receipt = poster.post_document(id).await.unwrap();
        assert_eq!(receipt.entries.len(), 2);
        let widget_row = store
            .get_balance(BalanceKey::new(widget, main))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((widget_row.quantity, widget_row.version), (5, 1));
    }
}
