//! Stock ledger poster.
//!
//! Posts one document: resolves the acting user, re-reads the document, its
//! lines, the referenced products/warehouses and every balance the document
//! touches, asks the pure planner for the batch, and hands the batch to the
//! store to commit as one unit.
//!
//! ## Retries
//!
//! Transport failures and version conflicts are retried with backoff. Every
//! retry starts from a fresh read, so a conflict caused by a concurrent posting
//! is replanned against the balance that posting left behind.
//!
//! If a commit succeeded but its acknowledgement was lost, the retry finds the
//! document already `done`. A document whose `validated_by`/`validated_at`
//! match this call's actor and timestamp was posted by this call, and the
//! retry reports success with the ledger entries already written.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tracing::{Span, instrument};

use stockledger_core::{DocumentId, ProductId, UserId, WarehouseId};
use stockledger_inventory::{
    BalanceKey, Document, DocumentStatus, LedgerEntry, PlanError, balance_keys, ensure_postable,
    plan_posting,
};

use crate::identity::IdentityProvider;
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, LedgerFilter, StoreError};

/// A key the document refers to that the store does not have.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MissingReference {
    #[error("product {0}")]
    Product(ProductId),

    #[error("warehouse {0}")]
    Warehouse(WarehouseId),

    #[error("document {0}")]
    Document(DocumentId),
}

/// Why a posting failed.
///
/// Every failure leaves the document status and every balance as they were
/// before the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostingError {
    #[error(
        "insufficient stock for product {product_id} at warehouse {warehouse_id} (available: {available}, requested: {requested})"
    )]
    InsufficientStock {
        product_id: ProductId,
        warehouse_id: WarehouseId,
        available: i64,
        requested: i64,
    },

    #[error("document {document_number} has already been posted")]
    AlreadyPosted {
        document_id: DocumentId,
        document_number: String,
    },

    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("missing reference: {0}")]
    MissingReference(MissingReference),

    #[error("document {document_number} cannot be posted from status {from}")]
    InvalidTransition {
        document_id: DocumentId,
        document_number: String,
        from: DocumentStatus,
    },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("document store unavailable: {0}")]
    Transport(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
}

impl PostingError {
    /// Whether the poster may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PostingError::Transport(_) | PostingError::ConcurrencyConflict(_)
        )
    }
}

impl From<PlanError> for PostingError {
    fn from(value: PlanError) -> Self {
        match value {
            PlanError::AlreadyPosted {
                document_id,
                document_number,
            } => PostingError::AlreadyPosted {
                document_id,
                document_number,
            },
            PlanError::NotReady {
                document_id,
                document_number,
                status,
            } => PostingError::InvalidTransition {
                document_id,
                document_number,
                from: status,
            },
            PlanError::InsufficientStock {
                product_id,
                warehouse_id,
                available,
                requested,
            } => PostingError::InsufficientStock {
                product_id,
                warehouse_id,
                available,
                requested,
            },
            PlanError::InvalidDocument(msg) => PostingError::InvalidDocument(msg),
        }
    }
}

impl From<StoreError> for PostingError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Transport(msg) => PostingError::Transport(msg),
            // A duplicate ledger key means another posting of the same
            // document got there first; the retry sees the document as done.
            StoreError::Conflict(msg) | StoreError::Duplicate(msg) => {
                PostingError::ConcurrencyConflict(msg)
            }
            StoreError::NotFound(msg) | StoreError::Invalid(msg) => {
                PostingError::InvalidDocument(msg)
            }
        }
    }
}

/// Outcome of a successful posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingReceipt {
    /// The document, now `done`.
    pub document: Document,
    /// Ledger entries written, in posting order.
    pub entries: Vec<LedgerEntry>,
    /// Calls made, including the first.
    pub attempts: u32,
    /// The commit landed on an earlier attempt whose acknowledgement was lost.
    pub recovered: bool,
}

/// Posts stock documents against a [`DocumentStore`].
///
/// Stateless between calls: everything is re-derived from the store.
#[derive(Debug, Clone)]
pub struct StockLedgerPoster<S, I> {
    store: S,
    identity: I,
    retry: RetryPolicy,
}

impl<S, I> StockLedgerPoster<S, I>
where
    S: DocumentStore,
    I: IdentityProvider,
{
    pub fn new(store: S, identity: I) -> Self {
        Self {
            store,
            identity,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Post a document: apply every line to its balance(s), append one ledger
    /// entry per line and warehouse, and mark the document `done`.
    #[instrument(
        skip(self),
        fields(
            document_id = %document_id,
            actor = tracing::field::Empty,
            attempts = tracing::field::Empty
        ),
        err
    )]
    pub async fn post_document(
        &self,
        document_id: DocumentId,
    ) -> Result<PostingReceipt, PostingError> {
        let actor = self.resolve_actor().await?;
        Span::current().record("actor", tracing::field::display(actor));

        // Postgres keeps microseconds; the in-doubt check compares this value.
        let at = Utc::now().trunc_subsecs(6);

        let mut retries: u32 = 0;
        loop {
            let attempt = retries + 1;
            match self.attempt(document_id, actor, at).await {
                Ok(mut receipt) => {
                    receipt.attempts = attempt;
                    Span::current().record("attempts", attempt);
                    tracing::info!(
                        document_id = %document_id,
                        document_number = %receipt.document.document_number,
                        entries = receipt.entries.len(),
                        attempt,
                        recovered = receipt.recovered,
                        "document posted"
                    );
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && self.retry.should_retry(retries) => {
                    retries += 1;
                    let delay = self.retry.delay_for_attempt(retries);
                    tracing::warn!(
                        document_id = %document_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "posting attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    Span::current().record("attempts", attempt);
                    if err.is_retryable() {
                        tracing::error!(
                            document_id = %document_id,
                            attempt,
                            error = %err,
                            "posting retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn resolve_actor(&self) -> Result<UserId, PostingError> {
        let mut retries: u32 = 0;
        loop {
            match self.identity.current_user().await {
                Ok(Some(user)) => return Ok(user),
                Ok(None) => return Err(PostingError::NotAuthenticated),
                Err(err) if err.is_transient() && self.retry.should_retry(retries) => {
                    retries += 1;
                    tokio::time::sleep(self.retry.delay_for_attempt(retries)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn attempt(
        &self,
        document_id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Result<PostingReceipt, PostingError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(PostingError::MissingReference(MissingReference::Document(
                document_id,
            )))?;

        if document.status == DocumentStatus::Done
            && document.validated_by == Some(actor)
            && document.validated_at == Some(at)
        {
            let entries = self
                .store
                .ledger_entries(&LedgerFilter::for_document(document_id))
                .await?;
            tracing::warn!(
                document_id = %document_id,
                document_number = %document.document_number,
                "earlier commit landed after its acknowledgement was lost"
            );
            return Ok(PostingReceipt {
                document,
                entries,
                attempts: 0,
                recovered: true,
            });
        }
        ensure_postable(&document)?;

        let lines = self.store.get_lines(document_id).await?;

        for warehouse_id in document.warehouses() {
            let warehouse = self.store.get_warehouse(warehouse_id).await?.ok_or(
                PostingError::MissingReference(MissingReference::Warehouse(warehouse_id)),
            )?;
            if !warehouse.is_active {
                return Err(PostingError::InvalidDocument(format!(
                    "warehouse {} is inactive",
                    warehouse.code
                )));
            }
        }

        let mut products = HashSet::with_capacity(lines.len());
        for line in &lines {
            if products.insert(line.product_id)
                && self.store.get_product(line.product_id).await?.is_none()
            {
                return Err(PostingError::MissingReference(MissingReference::Product(
                    line.product_id,
                )));
            }
        }

        let mut balances: HashMap<BalanceKey, _> = HashMap::new();
        for key in balance_keys(&document, &lines) {
            if let Some(balance) = self.store.get_balance(key).await? {
                balances.insert(key, balance);
            }
        }

        let plan = plan_posting(&document, &lines, &balances)?;
        for movement in plan.movements.iter().filter(|m| m.was_clamped()) {
            tracing::info!(
                document_id = %document_id,
                balance = %movement.key,
                requested = movement.requested_change,
                applied = movement.quantity_change,
                "adjustment clamped at zero"
            );
        }

        let batch = plan.into_batch(actor, at);
        let posted = self
            .store
            .apply_posting(&batch)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => {
                    PostingError::MissingReference(MissingReference::Document(document_id))
                }
                other => other.into(),
            })?;

        Ok(PostingReceipt {
            document: posted,
            entries: batch.ledger_entries,
            attempts: 0,
            recovered: false,
        })
    }
}
