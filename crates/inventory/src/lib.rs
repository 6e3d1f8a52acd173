//! Inventory domain module.
//!
//! This crate contains the business rules for stock documents and the stock
//! ledger, implemented purely as deterministic domain logic (no IO, no
//! storage). Infrastructure reads balances, asks the planner what a posting
//! would do, and commits the resulting batch.

pub mod catalog;
pub mod document;
pub mod ledger;
pub mod posting;

pub use catalog::{BalanceKey, Product, StockBalance, Warehouse};
pub use document::{
    AdjustmentCount, Document, DocumentKind, DocumentLine, DocumentStatus, generate_document_number,
};
pub use ledger::{LedgerEntry, LedgerKey, TransactionType};
pub use posting::{
    BalanceWrite, PlanError, PlannedMovement, PostingBatch, PostingPlan, balance_keys,
    ensure_postable, plan_posting,
};
