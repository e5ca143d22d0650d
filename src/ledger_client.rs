// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only capability the indexer needs from the marketplace ledger.
//!
//! The embedding application supplies the transport (contract bindings,
//! RPC); the indexer only ever talks through this trait, which keeps the
//! ingestion logic testable against a scripted implementation.

use crate::error::IndexerResult;
use crate::events::{EventKind, LedgerEvent};
use crate::types::{BlockPointer, RequestId, RequestState, SlotId, SlotState, StorageRequest};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use tokio::sync::broadcast;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Historical events of one kind, ordered by block then log index.
    /// `from_block` is inclusive; `None` means the full history.
    async fn query_filter(
        &self,
        kind: EventKind,
        from_block: Option<u64>,
    ) -> IndexerResult<Vec<LedgerEvent>>;

    /// Live subscription for one event kind. Every call returns a fresh
    /// receiver; dropping it (with its dispatch task) withdraws the
    /// registration.
    fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<LedgerEvent>;

    /// Current lifecycle state of a request.
    /// Fails with `UnknownEntity` if the ledger never saw the id.
    async fn request_state(&self, request_id: &RequestId) -> IndexerResult<RequestState>;

    /// Current lifecycle state of a slot.
    async fn slot_state(&self, slot_id: &SlotId) -> IndexerResult<SlotState>;

    /// Provider currently filling a slot; `None` when the slot is vacant
    /// (the ledger's zero address decodes to `None`).
    async fn get_host(&self, slot_id: &SlotId) -> IndexerResult<Option<Address>>;

    /// Full on-chain request record.
    async fn get_request(&self, request_id: &RequestId) -> IndexerResult<StorageRequest>;

    /// Number of storage proofs the slot's provider has missed.
    async fn missing_proofs(&self, slot_id: &SlotId) -> IndexerResult<u64>;

    /// Number and timestamp of a block, by hash.
    async fn get_block(&self, block_hash: &H256) -> IndexerResult<BlockPointer>;

    /// Current head block number.
    async fn get_block_number(&self) -> IndexerResult<u64>;
}
