use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{
    AggregateRoot, DocumentId, DomainError, DomainResult, ProductId, UserId, WarehouseId,
};

use crate::ledger::TransactionType;

/// The kind of stock movement a document describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Receipt,
    Delivery,
    Transfer,
    Adjustment,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Receipt => "receipt",
            DocumentKind::Delivery => "delivery",
            DocumentKind::Transfer => "transfer",
            DocumentKind::Adjustment => "adjustment",
        }
    }

    /// Prefix of generated document numbers.
    pub fn number_prefix(self) -> &'static str {
        match self {
            DocumentKind::Receipt => "REC",
            DocumentKind::Delivery => "DEL",
            DocumentKind::Transfer => "TR",
            DocumentKind::Adjustment => "ADJ",
        }
    }

    pub fn transaction_type(self) -> TransactionType {
        match self {
            DocumentKind::Receipt => TransactionType::Receipt,
            DocumentKind::Delivery => TransactionType::Delivery,
            DocumentKind::Transfer => TransactionType::Transfer,
            DocumentKind::Adjustment => TransactionType::Adjustment,
        }
    }
}

impl core::str::FromStr for DocumentKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(DocumentKind::Receipt),
            "delivery" => Ok(DocumentKind::Delivery),
            "transfer" => Ok(DocumentKind::Transfer),
            "adjustment" => Ok(DocumentKind::Adjustment),
            other => Err(DomainError::validation(format!("unknown document kind '{other}'"))),
        }
    }
}

/// Workflow state of a document.
///
/// `draft → waiting → ready → done`, with `canceled` reachable from every
/// state before `done`. `done` is terminal and only entered by posting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Waiting,
    Ready,
    Done,
    Canceled,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Waiting => "waiting",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Done => "done",
            DocumentStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Done | DocumentStatus::Canceled)
    }

    /// Pending documents (not yet posted or canceled).
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }

    /// Manual workflow transitions. Entering `done` is excluded: only posting
    /// may do that.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Draft, Waiting)
                | (Draft, Ready)
                | (Waiting, Ready)
                | (Draft | Waiting | Ready, Canceled)
        )
    }
}

impl core::str::FromStr for DocumentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DocumentStatus::Draft),
            "waiting" => Ok(DocumentStatus::Waiting),
            "ready" => Ok(DocumentStatus::Ready),
            "done" => Ok(DocumentStatus::Done),
            "canceled" => Ok(DocumentStatus::Canceled),
            other => Err(DomainError::validation(format!("unknown document status '{other}'"))),
        }
    }
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical count recorded on an adjustment document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentCount {
    pub product_id: ProductId,
    /// Balance the system held when the count was entered.
    pub system_quantity: i64,
    pub counted_quantity: i64,
    pub reason: Option<String>,
}

impl AdjustmentCount {
    pub fn difference(&self) -> i64 {
        self.counted_quantity - self.system_quantity
    }
}

/// A stock document: receipt, delivery, transfer or adjustment.
///
/// For transfers `warehouse_id` is the source and `destination_warehouse_id`
/// the destination; every other kind leaves the destination empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub document_number: String,
    pub warehouse_id: WarehouseId,
    pub destination_warehouse_id: Option<WarehouseId>,
    pub status: DocumentStatus,
    pub adjustment: Option<AdjustmentCount>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub validated_by: Option<UserId>,
    pub validated_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl AggregateRoot for Document {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Document {
    fn draft(
        kind: DocumentKind,
        warehouse_id: WarehouseId,
        created_by: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DocumentId::new(),
            kind,
            document_number: generate_document_number(kind, created_at),
            warehouse_id,
            destination_warehouse_id: None,
            status: DocumentStatus::Draft,
            adjustment: None,
            notes: None,
            created_by,
            created_at,
            validated_by: None,
            validated_at: None,
            version: 0,
        }
    }

    pub fn new_receipt(warehouse_id: WarehouseId, created_by: UserId, at: DateTime<Utc>) -> Self {
        Self::draft(DocumentKind::Receipt, warehouse_id, created_by, at)
    }

    pub fn new_delivery(warehouse_id: WarehouseId, created_by: UserId, at: DateTime<Utc>) -> Self {
        Self::draft(DocumentKind::Delivery, warehouse_id, created_by, at)
    }

    pub fn new_transfer(
        from: WarehouseId,
        to: WarehouseId,
        created_by: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if from == to {
            return Err(DomainError::validation(
                "transfer source and destination must differ",
            ));
        }
        let mut doc = Self::draft(DocumentKind::Transfer, from, created_by, at);
        doc.destination_warehouse_id = Some(to);
        Ok(doc)
    }

    /// Adjustment from a physical count. The single line carries the signed
    /// difference between counted and system quantity.
    pub fn new_adjustment(
        warehouse_id: WarehouseId,
        count: AdjustmentCount,
        created_by: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<(Self, DocumentLine)> {
        if count.counted_quantity < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        if count.system_quantity < 0 {
            return Err(DomainError::validation("system quantity cannot be negative"));
        }
        if count.difference() == 0 {
            return Err(DomainError::validation(
                "counted quantity matches system quantity; nothing to adjust",
            ));
        }
        let mut doc = Self::draft(DocumentKind::Adjustment, warehouse_id, created_by, at);
        let line = DocumentLine::new(doc.id, count.product_id, count.difference());
        doc.notes = count.reason.clone();
        doc.adjustment = Some(count);
        Ok((doc, line))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Lines may be replaced while the document has not been posted or canceled.
    pub fn is_editable(&self) -> bool {
        self.status.is_pending()
    }

    /// Warehouses this document touches, source first.
    pub fn warehouses(&self) -> Vec<WarehouseId> {
        let mut out = vec![self.warehouse_id];
        out.extend(self.destination_warehouse_id);
        out
    }

    /// Apply a manual workflow transition.
    pub fn transition(&mut self, next: DocumentStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(format!(
                "cannot move document {} from {} to {}",
                self.document_number, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Check the line set against the document's shape.
    ///
    /// Quantities are positive except for adjustments, whose single line holds
    /// a non-zero signed delta. A product appears at most once per document.
    pub fn validate_lines(&self, lines: &[DocumentLine]) -> DomainResult<()> {
        if lines.is_empty() {
            return Err(DomainError::validation("document has no lines"));
        }

        match self.kind {
            DocumentKind::Transfer => match self.destination_warehouse_id {
                None => return Err(DomainError::validation("transfer has no destination")),
                Some(to) if to == self.warehouse_id => {
                    return Err(DomainError::validation(
                        "transfer source and destination must differ",
                    ));
                }
                Some(_) => {}
            },
            _ if self.destination_warehouse_id.is_some() => {
                return Err(DomainError::validation(format!(
                    "{} cannot have a destination warehouse",
                    self.kind.as_str()
                )));
            }
            _ => {}
        }

        if self.kind == DocumentKind::Adjustment && lines.len() != 1 {
            return Err(DomainError::validation("adjustment must have exactly one line"));
        }

        let mut seen = std::collections::HashSet::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.document_id != self.id {
                return Err(DomainError::validation(format!(
                    "line {idx} belongs to another document"
                )));
            }
            if !seen.insert(line.product_id) {
                return Err(DomainError::validation(format!(
                    "product {} appears more than once",
                    line.product_id
                )));
            }
            match self.kind {
                DocumentKind::Adjustment if line.quantity == 0 => {
                    return Err(DomainError::validation("adjustment delta cannot be zero"));
                }
                DocumentKind::Adjustment => {}
                _ if line.quantity <= 0 => {
                    return Err(DomainError::validation(format!(
                        "line {idx} quantity must be positive"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// One product line of a document.
///
/// `quantity` is the absolute amount moved; direction comes from the document
/// kind. Adjustments are the exception: their quantity is the signed delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub document_id: DocumentId,
    pub product_id: ProductId,
    pub quantity: i64,
}

impl DocumentLine {
    pub fn new(document_id: DocumentId, product_id: ProductId, quantity: i64) -> Self {
        Self {
            document_id,
            product_id,
            quantity,
        }
    }
}

/// Generate a human-facing document number, e.g. `REC-1718000000000-3f9a1c`.
///
/// The timestamp keeps numbers roughly sortable; the suffix comes from the
/// random tail of a UUIDv7 so two documents created in the same millisecond
/// still differ.
pub fn generate_document_number(kind: DocumentKind, at: DateTime<Utc>) -> String {
    let random = Uuid::now_v7().simple().to_string();
    let suffix = &random[random.len() - 6..];
    format!("{}-{}-{}", kind.number_prefix(), at.timestamp_millis(), suffix)
}
