use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DocumentId, DomainError, LedgerEntryId, ProductId, UserId, WarehouseId};

use crate::catalog::BalanceKey;

/// Source of a ledger movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Receipt,
    Delivery,
    Transfer,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Receipt => "receipt",
            TransactionType::Delivery => "delivery",
            TransactionType::Transfer => "transfer",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl core::str::FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(TransactionType::Receipt),
            "delivery" => Ok(TransactionType::Delivery),
            "transfer" => Ok(TransactionType::Transfer),
            "adjustment" => Ok(TransactionType::Adjustment),
            other => Err(DomainError::validation(format!(
                "unknown transaction type '{other}'"
            ))),
        }
    }
}

/// Immutable audit record of one applied quantity change.
///
/// `quantity_change` is the delta actually applied (after clamping), and
/// `balance_after` the balance it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub transaction_type: TransactionType,
    pub reference_id: DocumentId,
    pub reference_number: String,
    pub quantity_change: i64,
    pub balance_after: i64,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            reference_id: self.reference_id,
            product_id: self.product_id,
            warehouse_id: self.warehouse_id,
            transaction_type: self.transaction_type,
        }
    }

    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.warehouse_id)
    }
}

/// Idempotency key of a ledger entry. Stores reject a second entry with the
/// same key, so a retried posting can never double-count a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub reference_id: DocumentId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub transaction_type: TransactionType,
}

impl core::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.reference_id,
            self.transaction_type.as_str(),
            self.product_id,
            self.warehouse_id
        )
    }
}
