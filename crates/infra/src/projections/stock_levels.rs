use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use stockledger_core::{ProductId, WarehouseId};
use stockledger_inventory::{DocumentKind, Product, StockBalance};

use crate::store::{DocumentFilter, DocumentStore, StoreError};

/// On-hand quantity of one product at one warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseStock {
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
}

/// Stock of one product across all warehouses.
///
/// `on_hand` is the sum of the product's balance rows; it is derived on every
/// read and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    pub on_hand: i64,
    /// The product's reorder level, or the configured default.
    pub reorder_level: i64,
    pub warehouses: Vec<WarehouseStock>,
}

impl ProductStock {
    pub fn is_low(&self) -> bool {
        self.on_hand <= self.reorder_level
    }
}

/// Dashboard counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub total_products: usize,
    pub low_stock_products: usize,
    /// Units on hand across every product and warehouse.
    pub total_units: i64,
    pub pending_receipts: usize,
    pub pending_deliveries: usize,
    pub pending_transfers: usize,
    pub pending_adjustments: usize,
    pub warehouses: usize,
}

/// Read-time stock projection over the balance rows.
#[derive(Debug, Clone)]
pub struct StockLevels<S> {
    store: S,
    default_reorder_level: i64,
}

impl<S> StockLevels<S>
where
    S: DocumentStore,
{
    pub fn new(store: S, default_reorder_level: i64) -> Self {
        Self {
            store,
            default_reorder_level,
        }
    }

    pub async fn product_stock(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductStock>, StoreError> {
        let Some(product) = self.store.get_product(product_id).await? else {
            return Ok(None);
        };
        let balances = self.store.list_balances(Some(product_id)).await?;
        Ok(Some(self.project(product, &balances)))
    }

    /// Every product, ordered by sku.
    #[instrument(skip(self), err)]
    pub async fn list(&self) -> Result<Vec<ProductStock>, StoreError> {
        let products = self.store.list_products().await?;
        let mut by_product: HashMap<ProductId, Vec<StockBalance>> = HashMap::new();
        for balance in self.store.list_balances(None).await? {
            by_product.entry(balance.product_id).or_default().push(balance);
        }
        Ok(products
            .into_iter()
            .map(|p| {
                let balances = by_product.remove(&p.id).unwrap_or_default();
                self.project(p, &balances)
            })
            .collect())
    }

    /// Products whose on-hand quantity is at or below their reorder level.
    pub async fn low_stock(&self) -> Result<Vec<ProductStock>, StoreError> {
        Ok(self.list().await?.into_iter().filter(|p| p.is_low()).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn summary(&self) -> Result<InventorySummary, StoreError> {
        let stock = self.list().await?;
        let mut summary = InventorySummary {
            total_products: stock.len(),
            low_stock_products: stock.iter().filter(|p| p.is_low()).count(),
            total_units: stock.iter().fold(0i64, |acc, p| acc.saturating_add(p.on_hand)),
            warehouses: self.store.list_warehouses().await?.len(),
            ..InventorySummary::default()
        };
        for kind in [
            DocumentKind::Receipt,
            DocumentKind::Delivery,
            DocumentKind::Transfer,
            DocumentKind::Adjustment,
        ] {
            let pending = self
                .store
                .list_documents(&DocumentFilter::pending(kind))
                .await?
                .len();
            match kind {
                DocumentKind::Receipt => summary.pending_receipts = pending,
                DocumentKind::Delivery => summary.pending_deliveries = pending,
                DocumentKind::Transfer => summary.pending_transfers = pending,
                DocumentKind::Adjustment => summary.pending_adjustments = pending,
            }
        }
        Ok(summary)
    }

    fn project(&self, product: Product, balances: &[StockBalance]) -> ProductStock {
        let mut per_warehouse: BTreeMap<WarehouseId, i64> = BTreeMap::new();
        for balance in balances.iter().filter(|b| b.product_id == product.id) {
            let units = per_warehouse.entry(balance.warehouse_id).or_default();
            *units = units.saturating_add(balance.quantity);
        }
        ProductStock {
            product_id: product.id,
            on_hand: per_warehouse
                .values()
                .fold(0i64, |acc, q| acc.saturating_add(*q)),
            reorder_level: product.reorder_level.unwrap_or(self.default_reorder_level),
            warehouses: per_warehouse
                .into_iter()
                .map(|(warehouse_id, quantity)| WarehouseStock {
                    warehouse_id,
                    quantity,
                })
                .collect(),
            sku: product.sku,
            name: product.name,
            unit_of_measure: product.unit_of_measure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use chrono::Utc;
    use std::sync::Arc;
    use stockledger_core::UserId;
    use stockledger_inventory::{BalanceKey, Document, DocumentLine, Warehouse};

    #[tokio::test]
    async fn on_hand_is_the_sum_of_warehouse_balances() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = Warehouse::new(WarehouseId::new(), "A", "A").unwrap();
        let b = Warehouse::new(WarehouseId::new(), "B", "B").unwrap();
        let widget = Product::new(ProductId::new(), "W", "Widget", "pcs", Some(20)).unwrap();
        let gadget = Product::new(ProductId::new(), "G", "Gadget", "pcs", None).unwrap();
        store.put_balance(BalanceKey::new(widget.id, a.id), 12).unwrap();
        store.put_balance(BalanceKey::new(widget.id, b.id), 30).unwrap();
        store.put_balance(BalanceKey::new(gadget.id, a.id), 10).unwrap();
        let (widget_id, gadget_id) = (widget.id, gadget.id);
        store.put_warehouse(a).unwrap();
        store.put_warehouse(b).unwrap();
        store.put_product(widget).unwrap();
        store.put_product(gadget).unwrap();

        let levels = StockLevels::new(store.clone(), 10);

        let widget = levels.product_stock(widget_id).await.unwrap().unwrap();
        assert_eq!(widget.on_hand, 42);
        assert_eq!(widget.warehouses.len(), 2);
        assert!(!widget.is_low());

        // Falls back to the default reorder level and counts "equal" as low.
        let low = levels.low_stock().await.unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].product_id, gadget_id);
        assert_eq!(low[0].reorder_level, 10);
    }

    #[tokio::test]
    async fn summary_counts_pending_documents_per_kind() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let w = Warehouse::new(WarehouseId::new(), "A", "A").unwrap();
        let p = Product::new(ProductId::new(), "W", "Widget", "pcs", None).unwrap();
        let (w_id, p_id) = (w.id, p.id);
        store.put_warehouse(w).unwrap();
        store.put_product(p).unwrap();

        let user = UserId::new();
        for doc in [
            Document::new_receipt(w_id, user, Utc::now()),
            Document::new_receipt(w_id, user, Utc::now()),
            Document::new_delivery(w_id, user, Utc::now()),
        ] {
            let lines = vec![DocumentLine::new(doc.id, p_id, 1)];
            store.insert_document(&doc, &lines).await.unwrap();
        }

        let summary = StockLevels::new(store.clone(), 10).summary().await.unwrap();
        assert_eq!(summary.total_products, 1);
        assert_eq!(summary.low_stock_products, 1);
        assert_eq!(summary.pending_receipts, 2);
        assert_eq!(summary.pending_deliveries, 1);
        assert_eq!(summary.pending_transfers, 0);
        assert_eq!(summary.warehouses, 1);
    }
}
