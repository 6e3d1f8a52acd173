//! Infrastructure layer: document stores, the ledger poster, the document
//! workflow, projections, reconciliation and configuration.

pub mod config;
pub mod documents;
pub mod identity;
pub mod poster;
pub mod projections;
pub mod reconciliation;
pub mod retry;
pub mod store;

mod integration_tests;

pub use config::{ConfigError, LedgerConfig, StoreBackend, build_store};
pub use documents::{DocumentError, DocumentService, DocumentWithLines, NewLine};
pub use identity::{IdentityProvider, StaticIdentity};
pub use poster::{MissingReference, PostingError, PostingReceipt, StockLedgerPoster};
pub use reconciliation::{Discrepancy, ReconciliationReport, Reconciler};
pub use retry::{BackoffStrategy, RetryPolicy};
