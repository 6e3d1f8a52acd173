//! Balance reconciliation: checks stored balances against the ledger.
//!
//! For every (product, warehouse) the ledger must form an unbroken chain
//! (each entry's `balance_after` equals the previous one plus its
//! `quantity_change`) ending at the stored balance. Balances seeded before the
//! ledger existed show up as a non-zero `opening_quantity`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use stockledger_core::LedgerEntryId;
use stockledger_inventory::BalanceKey;

use crate::store::{DocumentStore, LedgerFilter, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// An entry's `balance_after` does not follow from the entry before it.
    BrokenChain {
        entry_id: LedgerEntryId,
        expected: i64,
        recorded: i64,
    },
    /// The last entry's `balance_after` differs from the stored balance.
    BalanceMismatch { stored: i64, ledger: i64 },
    NegativeBalance { quantity: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub key: BalanceKey,
    pub stored_quantity: i64,
    /// Balance before the first ledger entry.
    pub opening_quantity: i64,
    /// Sum of every `quantity_change`.
    pub ledger_net_change: i64,
    pub entry_count: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler<S> {
    store: S,
}

impl<S> Reconciler<S>
where
    S: DocumentStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(balance = %key), err)]
    pub async fn reconcile(&self, key: BalanceKey) -> Result<ReconciliationReport, StoreError> {
        let stored_quantity = self
            .store
            .get_balance(key)
            .await?
            .map(|b| b.quantity)
            .unwrap_or(0);
        let entries = self
            .store
            .ledger_entries(&LedgerFilter::for_balance(key))
            .await?;

        let mut discrepancies = Vec::new();
        let opening_quantity = entries
            .first()
            .map(|e| e.balance_after.saturating_sub(e.quantity_change))
            .unwrap_or(stored_quantity);

        let mut running = opening_quantity;
        for entry in &entries {
            running = running.saturating_add(entry.quantity_change);
            if entry.balance_after != running {
                discrepancies.push(Discrepancy::BrokenChain {
                    entry_id: entry.id,
                    expected: running,
                    recorded: entry.balance_after,
                });
                running = entry.balance_after;
            }
        }

        match entries.last() {
            Some(last) if last.balance_after != stored_quantity => {
                discrepancies.push(Discrepancy::BalanceMismatch {
                    stored: stored_quantity,
                    ledger: last.balance_after,
                });
            }
            _ => {}
        }
        if stored_quantity < 0 {
            discrepancies.push(Discrepancy::NegativeBalance {
                quantity: stored_quantity,
            });
        }

        let report = ReconciliationReport {
            key,
            stored_quantity,
            opening_quantity,
            ledger_net_change: entries
                .iter()
                .fold(0i64, |acc, e| acc.saturating_add(e.quantity_change)),
            entry_count: entries.len(),
            discrepancies,
        };
        if !report.is_consistent() {
            tracing::warn!(
                balance = %key,
                discrepancies = report.discrepancies.len(),
                "balance does not reconcile with ledger"
            );
        }
        Ok(report)
    }

    /// Reconcile every key that has a balance row or a ledger entry.
    #[instrument(skip(self), err)]
    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>, StoreError> {
        let mut keys: BTreeSet<BalanceKey> = self
            .store
            .list_balances(None)
            .await?
            .iter()
            .map(|b| b.key())
            .collect();
        keys.extend(
            self.store
                .ledger_entries(&LedgerFilter::default())
                .await?
                .iter()
                .map(|e| e.balance_key()),
        );

        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            reports.push(self.reconcile(key).await?);
        }
        Ok(reports)
    }
}
