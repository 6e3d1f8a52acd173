use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ProductId, WarehouseId};

/// A stocked product.
///
/// Products carry no on-hand counter. The per-warehouse [`StockBalance`] rows
/// are the only source of truth; the product total is projected at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    /// Low-stock threshold. `None` falls back to the configured default.
    pub reorder_level: Option<i64>,
}

impl Product {
    pub fn new(
        id: ProductId,
        sku: impl Into<String>,
        name: impl Into<String>,
        unit_of_measure: impl Into<String>,
        reorder_level: Option<i64>,
    ) -> DomainResult<Self> {
        let sku = sku.into();
        let name = name.into();
        if sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if matches!(reorder_level, Some(level) if level < 0) {
            return Err(DomainError::validation("reorder_level cannot be negative"));
        }
        Ok(Self {
            id,
            sku,
            name,
            unit_of_measure: unit_of_measure.into(),
            reorder_level,
        })
    }
}

/// A physical stock location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub is_active: bool,
}

impl Warehouse {
    pub fn new(
        id: WarehouseId,
        code: impl Into<String>,
        name: impl Into<String>,
    ) -> DomainResult<Self> {
        let code = code.into();
        let name = name.into();
        if code.trim().is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("warehouse name cannot be empty"));
        }
        Ok(Self {
            id,
            code,
            name,
            address: None,
            is_active: true,
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Key of a per-warehouse balance row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
}

impl BalanceKey {
    pub fn new(product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            product_id,
            warehouse_id,
        }
    }
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.product_id, self.warehouse_id)
    }
}

/// On-hand quantity of one product at one warehouse.
///
/// `version` increments on every write; writers must present the version they
/// read (compare-and-swap). A row that does not exist yet has version 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StockBalance {
    /// The implicit balance of a key that has no row yet.
    pub fn absent(key: BalanceKey) -> Self {
        Self {
            product_id: key.product_id,
            warehouse_id: key.warehouse_id,
            quantity: 0,
            version: 0,
            updated_at: None,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.warehouse_id)
    }

    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_requires_sku_and_name() {
        assert!(Product::new(ProductId::new(), " ", "Bolt", "pcs", None).is_err());
        assert!(Product::new(ProductId::new(), "B-1", "", "pcs", None).is_err());
        assert!(Product::new(ProductId::new(), "B-1", "Bolt", "pcs", Some(-1)).is_err());
        assert!(Product::new(ProductId::new(), "B-1", "Bolt", "pcs", Some(5)).is_ok());
    }

    #[test]
    fn absent_balance_is_zero_at_version_zero() {
        let key = BalanceKey::new(ProductId::new(), WarehouseId::new());
        let balance = StockBalance::absent(key);
        assert_eq!(balance.quantity, 0);
        assert!(!balance.exists());
        assert_eq!(balance.key(), key);
    }

    #[test]
    fn new_warehouses_are_active() {
        let w = Warehouse::new(WarehouseId::new(), "WH1", "Main").unwrap();
        assert!(w.is_active);
        assert!(!w.deactivated().is_active);
    }
}
