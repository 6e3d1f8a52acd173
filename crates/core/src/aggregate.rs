//! Versioned records and optimistic concurrency expectations.

/// A record whose writes are guarded by a monotonically increasing version.
///
/// Stores reject a write made against a stale read of such a record.
pub trait AggregateRoot {
    /// Strongly-typed identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the identifier.
    fn id(&self) -> &Self::Id;

    /// Version of the record as last persisted (0 = never persisted).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a versioned record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the record to be at an exact version (0 = must not exist yet).
    Exact(u64),
}

impl ExpectedVersion {
    /// Expect the version the record was read at.
    pub fn current<A: AggregateRoot>(record: &A) -> Self {
        ExpectedVersion::Exact(record.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
