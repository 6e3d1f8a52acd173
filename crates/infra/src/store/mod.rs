//! Document store boundary.
//!
//! The poster and the workflow service talk to a hosted store through the
//! [`DocumentStore`] trait. Two implementations ship here: an in-memory store
//! for tests and dev, and a Postgres store.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{CommitFault, InMemoryDocumentStore};
pub use postgres::PostgresDocumentStore;
pub use r#trait::{DocumentFilter, DocumentStore, LedgerFilter, StoreError};
