// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    // Transient ledger/RPC failure, safe to retry later
    TransientLedger(String),
    // Ledger confirms the entity never existed; never retried
    UnknownEntity(String),
    // Entity not yet materialized in the local registry
    NotFound(String),
    // Persisted snapshot could not be decoded
    Serialization(String),
    // Snapshot store driver failure
    Storage(String),
    // Internal invariant violation
    Internal(String),
}

impl IndexerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            IndexerError::TransientLedger(_) => "transient_ledger",
            IndexerError::UnknownEntity(_) => "unknown_entity",
            IndexerError::NotFound(_) => "not_found",
            IndexerError::Serialization(_) => "serialization",
            IndexerError::Storage(_) => "storage",
            IndexerError::Internal(_) => "internal",
        }
    }

    /// True for failures that a later attempt may not hit again.
    /// `UnknownEntity` and `NotFound` are semantic answers, not failures,
    /// and must never be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IndexerError::TransientLedger(_) | IndexerError::Storage(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexerError::NotFound(_))
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
