//! Posting planner: the per-line balance algorithm.
//!
//! Given a document, its lines and the balances read for every key the
//! document touches, [`plan_posting`] decides every movement up front. Nothing
//! is written unless the whole document plans cleanly, which is what makes a
//! failed posting leave no trace. The resulting [`PostingBatch`] is committed
//! by the store as one unit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_core::{
    DocumentId, DomainError, ExpectedVersion, LedgerEntryId, ProductId, UserId, WarehouseId,
};

use crate::catalog::{BalanceKey, StockBalance};
use crate::document::{Document, DocumentKind, DocumentLine, DocumentStatus};
use crate::ledger::{LedgerEntry, TransactionType};

/// Business failures detected while planning a posting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("document {document_number} has already been posted")]
    AlreadyPosted {
        document_id: DocumentId,
        document_number: String,
    },

    #[error("document {document_number} is {status}; only ready documents can be posted")]
    NotReady {
        document_id: DocumentId,
        document_number: String,
        status: DocumentStatus,
    },

    #[error(
        "insufficient stock for product {product_id} at warehouse {warehouse_id} (available: {available}, requested: {requested})"
    )]
    InsufficientStock {
        product_id: ProductId,
        warehouse_id: WarehouseId,
        available: i64,
        requested: i64,
    },

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl From<DomainError> for PlanError {
    fn from(value: DomainError) -> Self {
        PlanError::InvalidDocument(value.to_string())
    }
}

/// How a leg treats the balance it touches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LegRule {
    /// Adds stock; a missing balance row starts at zero.
    Inbound,
    /// Removes stock; the balance must cover it.
    Outbound,
    /// Signed correction; a result below zero is clamped to zero.
    Clamp,
}

#[derive(Debug, Copy, Clone)]
struct Leg {
    warehouse_id: WarehouseId,
    delta: i64,
    rule: LegRule,
}

fn legs(document: &Document, line: &DocumentLine) -> Vec<Leg> {
    let at = |warehouse_id, delta, rule| Leg {
        warehouse_id,
        delta,
        rule,
    };
    let outbound = line.quantity.saturating_neg();
    match document.kind {
        DocumentKind::Receipt => vec![at(document.warehouse_id, line.quantity, LegRule::Inbound)],
        DocumentKind::Delivery => vec![at(document.warehouse_id, outbound, LegRule::Outbound)],
        DocumentKind::Transfer => {
            let mut out = vec![at(document.warehouse_id, outbound, LegRule::Outbound)];
            if let Some(to) = document.destination_warehouse_id {
                out.push(at(to, line.quantity, LegRule::Inbound));
            }
            out
        }
        DocumentKind::Adjustment => vec![at(document.warehouse_id, line.quantity, LegRule::Clamp)],
    }
}

/// Every balance key a posting of `document` will read and write, in posting order.
pub fn balance_keys(document: &Document, lines: &[DocumentLine]) -> Vec<BalanceKey> {
    let mut keys = Vec::new();
    for line in lines {
        for leg in legs(document, line) {
            let key = BalanceKey::new(line.product_id, leg.warehouse_id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// One decided movement against one balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMovement {
    pub key: BalanceKey,
    pub transaction_type: TransactionType,
    /// Delta the document asked for.
    pub requested_change: i64,
    /// Delta actually applied (differs from the request only when clamped).
    pub quantity_change: i64,
    pub balance_before: i64,
    pub balance_after: i64,
}

impl PlannedMovement {
    pub fn was_clamped(&self) -> bool {
        self.requested_change != self.quantity_change
    }
}

/// Conditional write of one balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceWrite {
    pub key: BalanceKey,
    pub quantity: i64,
    /// Version the planner read; `Exact(0)` means the row must not exist yet.
    pub expected: ExpectedVersion,
}

/// The full effect of posting one document, decided but not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingPlan {
    pub document_id: DocumentId,
    pub document_number: String,
    pub document_version: u64,
    pub movements: Vec<PlannedMovement>,
    writes: Vec<BalanceWrite>,
}

impl PostingPlan {
    pub fn balance_writes(&self) -> &[BalanceWrite] {
        &self.writes
    }

    /// Attach the actor and time, producing the batch a store commits.
    pub fn into_batch(self, actor: UserId, at: DateTime<Utc>) -> PostingBatch {
        let ledger_entries = self
            .movements
            .iter()
            .map(|m| LedgerEntry {
                id: LedgerEntryId::new(),
                product_id: m.key.product_id,
                warehouse_id: m.key.warehouse_id,
                transaction_type: m.transaction_type,
                reference_id: self.document_id,
                reference_number: self.document_number.clone(),
                quantity_change: m.quantity_change,
                balance_after: m.balance_after,
                created_by: actor,
                created_at: at,
            })
            .collect();

        PostingBatch {
            document_id: self.document_id,
            document_number: self.document_number,
            expected_document_version: ExpectedVersion::Exact(self.document_version),
            validated_by: actor,
            validated_at: at,
            balance_writes: self.writes,
            ledger_entries,
        }
    }
}

/// Everything a store must apply atomically to post a document.
///
/// - every balance write is conditional on its expected version
/// - every ledger entry is unique on its [`crate::LedgerKey`]
/// - the document moves to `done` only if it is still at `expected_document_version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingBatch {
    pub document_id: DocumentId,
    pub document_number: String,
    pub expected_document_version: ExpectedVersion,
    pub validated_by: UserId,
    pub validated_at: DateTime<Utc>,
    pub balance_writes: Vec<BalanceWrite>,
    pub ledger_entries: Vec<LedgerEntry>,
}

#[derive(Debug, Copy, Clone)]
struct Running {
    quantity: i64,
    version_read: u64,
}

/// Posting is legal only from `ready`.
pub fn ensure_postable(document: &Document) -> Result<(), PlanError> {
    match document.status {
        DocumentStatus::Ready => Ok(()),
        DocumentStatus::Done => Err(PlanError::AlreadyPosted {
            document_id: document.id,
            document_number: document.document_number.clone(),
        }),
        status => Err(PlanError::NotReady {
            document_id: document.id,
            document_number: document.document_number.clone(),
            status,
        }),
    }
}

/// Decide the effect of posting `document`.
///
/// `balances` holds the rows read for [`balance_keys`]; a key missing from the
/// map has no row yet. Lines are processed in order, and for transfers the
/// outbound leg precedes the inbound leg, so ledger entry order is
/// deterministic.
pub fn plan_posting(
    document: &Document,
    lines: &[DocumentLine],
    balances: &HashMap<BalanceKey, StockBalance>,
) -> Result<PostingPlan, PlanError> {
    ensure_postable(document)?;
    document.validate_lines(lines)?;

    let transaction_type = document.kind.transaction_type();
    let mut running: HashMap<BalanceKey, Running> = HashMap::new();
    let mut order: Vec<BalanceKey> = Vec::new();
    let mut movements = Vec::new();

    for line in lines {
        for leg in legs(document, line) {
            let key = BalanceKey::new(line.product_id, leg.warehouse_id);
            let state = running.entry(key).or_insert_with(|| {
                order.push(key);
                let read = balances
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| StockBalance::absent(key));
                Running {
                    quantity: read.quantity,
                    version_read: read.version,
                }
            });

            let before = state.quantity;
            let Some(mut after) = before.checked_add(leg.delta) else {
                return Err(PlanError::InvalidDocument(format!(
                    "quantity {} overflows balance {before} of {key}",
                    leg.delta
                )));
            };
            if after < 0 {
                match leg.rule {
                    LegRule::Outbound => {
                        return Err(PlanError::InsufficientStock {
                            product_id: key.product_id,
                            warehouse_id: key.warehouse_id,
                            available: before,
                            requested: leg.delta.saturating_neg(),
                        });
                    }
                    LegRule::Clamp => after = 0,
                    LegRule::Inbound => {
                        return Err(PlanError::InvalidDocument(format!(
                            "balance of {key} is negative ({before})"
                        )));
                    }
                }
            }

            state.quantity = after;
            movements.push(PlannedMovement {
                key,
                transaction_type,
                requested_change: leg.delta,
                quantity_change: after - before,
                balance_before: before,
                balance_after: after,
            });
        }
    }

    let writes = order
        .into_iter()
        .filter_map(|key| {
            running.get(&key).map(|state| BalanceWrite {
                key,
                quantity: state.quantity,
                expected: ExpectedVersion::Exact(state.version_read),
            })
        })
        .collect();

    Ok(PostingPlan {
        document_id: document.id,
        document_number: document.document_number.clone(),
        document_version: document.version,
        movements,
        writes,
    })
}
