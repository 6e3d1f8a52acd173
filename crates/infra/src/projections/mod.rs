//! Read-time projections over the document store.
//!
//! Nothing here is persisted; every query is derived from balance rows and
//! documents at the moment it runs.

pub mod stock_levels;

pub use stock_levels::{InventorySummary, ProductStock, StockLevels, WarehouseStock};
