// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! A scripted [`LedgerClient`] for tests.
//!
//! Point queries answer from preset maps; anything not preset fails the way
//! the real transport would (transient for network-backed reads, unknown for
//! semantic lookups), so a test states exactly what the ledger knows. Live
//! events are pushed through [`MockLedger::emit`], history through
//! [`MockLedger::add_history`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use tokio::sync::broadcast;

use crate::error::{IndexerError, IndexerResult};
use crate::events::{EventKind, LedgerEvent};
use crate::ledger_client::LedgerClient;
use crate::types::{BlockPointer, RequestId, RequestState, SlotId, SlotState, StorageRequest};

pub struct MockLedger {
    request_states: Mutex<HashMap<RequestId, IndexerResult<RequestState>>>,
    slot_states: Mutex<HashMap<SlotId, IndexerResult<SlotState>>>,
    hosts: Mutex<HashMap<SlotId, Option<Address>>>,
    requests: Mutex<HashMap<RequestId, StorageRequest>>,
    missing_proofs: Mutex<HashMap<SlotId, u64>>,
    blocks: Mutex<HashMap<H256, BlockPointer>>,
    block_number: AtomicU64,
    history: Mutex<Vec<LedgerEvent>>,
    senders: Mutex<HashMap<EventKind, broadcast::Sender<LedgerEvent>>>,
    fail_next_query_filter: Mutex<Option<IndexerError>>,
    host_failures: AtomicBool,
    get_block_calls: AtomicUsize,
    get_request_calls: AtomicUsize,
    slot_state_calls: AtomicUsize,
    request_state_calls: AtomicUsize,
    query_filter_calls: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            request_states: Mutex::new(HashMap::new()),
            slot_states: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            missing_proofs: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            block_number: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            fail_next_query_filter: Mutex::new(None),
            host_failures: AtomicBool::new(false),
            get_block_calls: AtomicUsize::new(0),
            get_request_calls: AtomicUsize::new(0),
            slot_state_calls: AtomicUsize::new(0),
            request_state_calls: AtomicUsize::new(0),
            query_filter_calls: AtomicUsize::new(0),
        }
    }

    // ==================== presets ====================

    pub fn set_request_state(&self, request_id: RequestId, state: IndexerResult<RequestState>) {
        self.request_states.lock().unwrap().insert(request_id, state);
    }

    pub fn set_slot_state(&self, slot_id: SlotId, state: IndexerResult<SlotState>) {
        self.slot_states.lock().unwrap().insert(slot_id, state);
    }

    pub fn set_host(&self, slot_id: SlotId, host: Option<Address>) {
        self.hosts.lock().unwrap().insert(slot_id, host);
    }

    /// When enabled, every `get_host` fails transiently regardless of presets.
    pub fn set_host_failures(&self, enabled: bool) {
        self.host_failures.store(enabled, Ordering::SeqCst);
    }

    pub fn set_request(&self, request_id: RequestId, request: StorageRequest) {
        self.requests.lock().unwrap().insert(request_id, request);
    }

    pub fn set_missing_proofs(&self, slot_id: SlotId, count: u64) {
        self.missing_proofs.lock().unwrap().insert(slot_id, count);
    }

    pub fn set_block(&self, block_hash: H256, pointer: BlockPointer) {
        self.blocks.lock().unwrap().insert(block_hash, pointer);
    }

    pub fn set_block_number(&self, number: u64) {
        self.block_number.store(number, Ordering::SeqCst);
    }

    pub fn add_history(&self, event: LedgerEvent) {
        self.history.lock().unwrap().push(event);
    }

    /// The next `query_filter` call returns this error, once.
    pub fn fail_next_query_filter(&self, err: IndexerError) {
        *self.fail_next_query_filter.lock().unwrap() = Some(err);
    }

    /// Delivers a live event to current subscribers of its kind. Events
    /// emitted with no subscriber are dropped, as a real transport would.
    pub fn emit(&self, event: LedgerEvent) {
        let sender = self.sender_for(event.event.kind());
        let _ = sender.send(event);
    }

    // ==================== call counters ====================

    pub fn get_block_calls(&self) -> usize {
        self.get_block_calls.load(Ordering::SeqCst)
    }

    pub fn get_request_calls(&self) -> usize {
        self.get_request_calls.load(Ordering::SeqCst)
    }

    pub fn slot_state_calls(&self) -> usize {
        self.slot_state_calls.load(Ordering::SeqCst)
    }

    pub fn request_state_calls(&self) -> usize {
        self.request_state_calls.load(Ordering::SeqCst)
    }

    pub fn query_filter_calls(&self) -> usize {
        self.query_filter_calls.load(Ordering::SeqCst)
    }

    fn sender_for(&self, kind: EventKind) -> broadcast::Sender<LedgerEvent> {
        self.senders
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn query_filter(
        &self,
        kind: EventKind,
        from_block: Option<u64>,
    ) -> IndexerResult<Vec<LedgerEvent>> {
        self.query_filter_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_next_query_filter.lock().unwrap().take() {
            return Err(err);
        }
        let from = from_block.unwrap_or(0);
        let mut events: Vec<LedgerEvent> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event.kind() == kind && e.meta.block_number >= from)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
        Ok(events)
    }

    fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<LedgerEvent> {
        self.sender_for(kind).subscribe()
    }

    async fn request_state(&self, request_id: &RequestId) -> IndexerResult<RequestState> {
        self.request_state_calls.fetch_add(1, Ordering::SeqCst);
        self.request_states
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .unwrap_or_else(|| {
                Err(IndexerError::TransientLedger(
                    "request state not preset".to_string(),
                ))
            })
    }

    async fn slot_state(&self, slot_id: &SlotId) -> IndexerResult<SlotState> {
        self.slot_state_calls.fetch_add(1, Ordering::SeqCst);
        self.slot_states
            .lock()
            .unwrap()
            .get(slot_id)
            .cloned()
            .unwrap_or_else(|| {
                Err(IndexerError::TransientLedger(
                    "slot state not preset".to_string(),
                ))
            })
    }

    async fn get_host(&self, slot_id: &SlotId) -> IndexerResult<Option<Address>> {
        if self.host_failures.load(Ordering::SeqCst) {
            return Err(IndexerError::TransientLedger(
                "host lookup failed".to_string(),
            ));
        }
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(slot_id)
            .cloned()
            .unwrap_or(None))
    }

    async fn get_request(&self, request_id: &RequestId) -> IndexerResult<StorageRequest> {
        self.get_request_calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| IndexerError::UnknownEntity("request not preset".to_string()))
    }

    async fn missing_proofs(&self, slot_id: &SlotId) -> IndexerResult<u64> {
        Ok(self
            .missing_proofs
            .lock()
            .unwrap()
            .get(slot_id)
            .copied()
            .unwrap_or(0))
    }

    async fn get_block(&self, block_hash: &H256) -> IndexerResult<BlockPointer> {
        self.get_block_calls.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .lock()
            .unwrap()
            .get(block_hash)
            .cloned()
            .ok_or_else(|| IndexerError::TransientLedger("block not preset".to_string()))
    }

    async fn get_block_number(&self) -> IndexerResult<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }
}
