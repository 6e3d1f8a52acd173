//! Document workflow service: creating documents and moving them through the
//! pre-posting statuses.
//!
//! `done` is not reachable from here; only the poster sets it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use stockledger_core::{DocumentId, DomainError, ExpectedVersion, ProductId, UserId, WarehouseId};
use stockledger_inventory::{
    AdjustmentCount, BalanceKey, Document, DocumentKind, DocumentLine, DocumentStatus,
};

use crate::identity::IdentityProvider;
use crate::poster::MissingReference;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("missing reference: {0}")]
    MissingReference(MissingReference),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("document {document_number} is {status} and can no longer be edited")]
    NotEditable {
        document_number: String,
        status: DocumentStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for DocumentError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::IllegalTransition(msg) => DocumentError::InvalidTransition(msg),
            other => DocumentError::InvalidDocument(other.to_string()),
        }
    }
}

/// A line as entered by the user, before it belongs to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl NewLine {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// A stored document together with its lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentWithLines {
    pub document: Document,
    pub lines: Vec<DocumentLine>,
}

/// Creates and edits stock documents.
#[derive(Debug, Clone)]
pub struct DocumentService<S, I> {
    store: S,
    identity: I,
}

impl<S, I> DocumentService<S, I>
where
    S: DocumentStore,
    I: IdentityProvider,
{
    pub fn new(store: S, identity: I) -> Self {
        Self { store, identity }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(
        skip(self, lines),
        fields(warehouse_id = %warehouse_id, line_count = lines.len()),
        err
    )]
    pub async fn create_receipt(
        &self,
        warehouse_id: WarehouseId,
        lines: &[NewLine],
    ) -> Result<DocumentWithLines, DocumentError> {
        let actor = self.require_user().await?;
        self.create(Document::new_receipt(warehouse_id, actor, Utc::now()), lines)
            .await
    }

    #[instrument(
        skip(self, lines),
        fields(warehouse_id = %warehouse_id, line_count = lines.len()),
        err
    )]
    pub async fn create_delivery(
        &self,
        warehouse_id: WarehouseId,
        lines: &[NewLine],
    ) -> Result<DocumentWithLines, DocumentError> {
        let actor = self.require_user().await?;
        self.create(Document::new_delivery(warehouse_id, actor, Utc::now()), lines)
            .await
    }

    #[instrument(skip(self, lines), fields(from = %from, to = %to, line_count = lines.len()), err)]
    pub async fn create_transfer(
        &self,
        from: WarehouseId,
        to: WarehouseId,
        lines: &[NewLine],
    ) -> Result<DocumentWithLines, DocumentError> {
        let actor = self.require_user().await?;
        let document = Document::new_transfer(from, to, actor, Utc::now())?;
        self.create(document, lines).await
    }

    /// Record a physical count. The line is the difference between the count
    /// and the balance held right now; posting applies that difference to the
    /// balance held at posting time.
    #[instrument(
        skip(self, reason),
        fields(warehouse_id = %warehouse_id, product_id = %product_id),
        err
    )]
    pub async fn create_adjustment(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        counted_quantity: i64,
        reason: Option<String>,
    ) -> Result<DocumentWithLines, DocumentError> {
        let actor = self.require_user().await?;
        self.require_active_warehouse(warehouse_id).await?;
        self.require_product(product_id).await?;

        let system_quantity = self
            .store
            .get_balance(BalanceKey::new(product_id, warehouse_id))
            .await?
            .map(|b| b.quantity)
            .unwrap_or(0);
        let count = AdjustmentCount {
            product_id,
            system_quantity,
            counted_quantity,
            reason,
        };
        let (document, line) = Document::new_adjustment(warehouse_id, count, actor, Utc::now())?;
        let lines = vec![line];
        document.validate_lines(&lines)?;

        let stored = self.store.insert_document(&document, &lines).await?;
        tracing::info!(
            document_id = %stored.id,
            document_number = %stored.document_number,
            "adjustment created"
        );
        Ok(DocumentWithLines {
            document: stored,
            lines,
        })
    }

    /// Replace the whole line set of a document that is still pending.
    #[instrument(
        skip(self, lines),
        fields(document_id = %document_id, line_count = lines.len()),
        err
    )]
    pub async fn replace_lines(
        &self,
        document_id: DocumentId,
        lines: &[NewLine],
    ) -> Result<DocumentWithLines, DocumentError> {
        self.require_user().await?;
        let document = self.load(document_id).await?;
        if !document.is_editable() {
            return Err(DocumentError::NotEditable {
                document_number: document.document_number,
                status: document.status,
            });
        }
        if document.kind == DocumentKind::Adjustment {
            return Err(DocumentError::InvalidDocument(
                "adjustment lines come from the count; create a new adjustment".to_string(),
            ));
        }

        let lines = self.build_lines(&document, lines).await?;
        let stored = self
            .store
            .replace_lines(document_id, ExpectedVersion::current(&document), &lines)
            .await?;
        Ok(DocumentWithLines {
            document: stored,
            lines,
        })
    }

    pub async fn mark_waiting(&self, document_id: DocumentId) -> Result<Document, DocumentError> {
        self.transition(document_id, DocumentStatus::Waiting).await
    }

    pub async fn mark_ready(&self, document_id: DocumentId) -> Result<Document, DocumentError> {
        self.transition(document_id, DocumentStatus::Ready).await
    }

    pub async fn cancel(&self, document_id: DocumentId) -> Result<Document, DocumentError> {
        self.transition(document_id, DocumentStatus::Canceled).await
    }

    #[instrument(skip(self), fields(document_id = %document_id, next = %next), err)]
    async fn transition(
        &self,
        document_id: DocumentId,
        next: DocumentStatus,
    ) -> Result<Document, DocumentError> {
        self.require_user().await?;
        let mut document = self.load(document_id).await?;
        let expected = ExpectedVersion::current(&document);
        document.transition(next)?;

        if next == DocumentStatus::Ready {
            let lines = self.store.get_lines(document_id).await?;
            document.validate_lines(&lines)?;
        }

        Ok(self
            .store
            .update_status(document_id, next, None, None, expected)
            .await?)
    }

    async fn create(
        &self,
        document: Document,
        lines: &[NewLine],
    ) -> Result<DocumentWithLines, DocumentError> {
        let lines = self.build_lines(&document, lines).await?;
        let stored = self.store.insert_document(&document, &lines).await?;
        tracing::info!(
            document_id = %stored.id,
            document_number = %stored.document_number,
            kind = stored.kind.as_str(),
            "document created"
        );
        Ok(DocumentWithLines {
            document: stored,
            lines,
        })
    }

    async fn build_lines(
        &self,
        document: &Document,
        input: &[NewLine],
    ) -> Result<Vec<DocumentLine>, DocumentError> {
        for warehouse_id in document.warehouses() {
            self.require_active_warehouse(warehouse_id).await?;
        }
        for line in input {
            self.require_product(line.product_id).await?;
        }
        let lines: Vec<DocumentLine> = input
            .iter()
            .map(|l| DocumentLine::new(document.id, l.product_id, l.quantity))
            .collect();
        document.validate_lines(&lines)?;
        Ok(lines)
    }

    async fn require_user(&self) -> Result<UserId, DocumentError> {
        self.identity
            .current_user()
            .await?
            .ok_or(DocumentError::NotAuthenticated)
    }

    async fn load(&self, document_id: DocumentId) -> Result<Document, DocumentError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or(DocumentError::MissingReference(MissingReference::Document(
                document_id,
            )))
    }

    async fn require_product(&self, product_id: ProductId) -> Result<(), DocumentError> {
        match self.store.get_product(product_id).await? {
            Some(_) => Ok(()),
            None => Err(DocumentError::MissingReference(MissingReference::Product(
                product_id,
            ))),
        }
    }

    async fn require_active_warehouse(
        &self,
        warehouse_id: WarehouseId,
    ) -> Result<(), DocumentError> {
        match self.store.get_warehouse(warehouse_id).await? {
            Some(w) if w.is_active => Ok(()),
            Some(w) => Err(DocumentError::InvalidDocument(format!(
                "warehouse {} is inactive",
                w.code
            ))),
            None => Err(DocumentError::MissingReference(MissingReference::Warehouse(
                warehouse_id,
            ))),
        }
    }
}
