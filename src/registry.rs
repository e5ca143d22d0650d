// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Authoritative in-memory store of requests and their slots.
//!
//! Every mutation is existence-checked and merges individual fields, never
//! whole records: event handlers, detail fetches and the completion
//! scheduler all race onto the same entries, and none of them may clobber
//! what another has already learned. The registry never holds its lock
//! across a ledger round-trip.

use crate::block_cache::BlockCache;
use crate::error::{IndexerError, IndexerResult};
use crate::ledger_client::LedgerClient;
use crate::metrics::IndexerMetrics;
use crate::types::{
    slot_id, ModerationStatus, RequestEntry, RequestId, RequestState, SlotState, StorageAsk,
};
use crate::utils::short_id;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of a state-transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The transition was valid and has been applied.
    Applied,
    /// The entity already carries this state; duplicate delivery.
    Unchanged,
    /// The transition violates the lifecycle graph; entity left untouched.
    Rejected,
}

pub struct RequestRegistry {
    requests: RwLock<HashMap<RequestId, RequestEntry>>,
    ledger: Arc<dyn LedgerClient>,
    block_cache: Arc<BlockCache>,
    metrics: Arc<IndexerMetrics>,
}

impl RequestRegistry {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        block_cache: Arc<BlockCache>,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            ledger,
            block_cache,
            metrics,
        }
    }

    /// Materializes a request from its creation event (or merges onto a
    /// record a detail fetch created first). Queries the current state and
    /// resolves the creation block before touching local state, so a
    /// failure leaves neither a partial record nor an advanced watermark.
    /// Idempotent: re-delivery of the creation event is a no-op merge.
    pub async fn create(
        &self,
        request_id: RequestId,
        block_hash: H256,
        ask: Option<StorageAsk>,
        expiry: Option<u64>,
    ) -> IndexerResult<RequestEntry> {
        let result = self.ledger.request_state(&request_id).await;
        self.metrics.note_ledger_query("request_state", &result);
        let state = result?;

        let pointer = self
            .block_cache
            .resolve(self.ledger.as_ref(), block_hash)
            .await?;

        let mut requests = self.requests.write().await;
        let known = requests.contains_key(&request_id);
        let entry = requests
            .entry(request_id)
            .or_insert_with(|| RequestEntry::new(request_id));

        // The fresh ledger answer is authoritative; everything else merges
        // only into unknown fields.
        entry.state = state;
        if entry.ask.is_none() {
            entry.ask = ask;
        }
        if entry.expiry.is_none() {
            entry.expiry = expiry;
        }
        if entry.requested_at.is_none() {
            entry.requested_at = Some(pointer.timestamp);
        }
        if let Some(slot_count) = entry.ask.as_ref().map(|a| a.slot_count) {
            entry.ensure_slots(slot_count);
        }

        if known {
            debug!(
                "[Registry] Merged creation data into {} state={}",
                short_id(&request_id),
                state
            );
        } else {
            info!(
                "[Registry] Tracking request {} state={} requested_at={}",
                short_id(&request_id),
                state,
                pointer.timestamp
            );
        }
        let entry = entry.clone();
        self.metrics.requests_tracked.set(requests.len() as i64);
        Ok(entry)
    }

    /// Full refresh from the ledger: fetches the immutable details once,
    /// then always re-reads the state and every slot. Slot probes run
    /// serially and one failing slot never aborts the rest.
    ///
    /// `UnknownEntity` from the state query propagates before any local
    /// record is created, so asking about a request the ledger never saw
    /// leaves no trace.
    pub async fn fetch_details(&self, request_id: RequestId) -> IndexerResult<RequestEntry> {
        let result = self.ledger.request_state(&request_id).await;
        self.metrics.note_ledger_query("request_state", &result);
        let state = result?;

        let needs_details = {
            let requests = self.requests.read().await;
            requests
                .get(&request_id)
                .map(|e| !e.details_fetched)
                .unwrap_or(true)
        };
        let details = if needs_details {
            let result = self.ledger.get_request(&request_id).await;
            self.metrics.note_ledger_query("get_request", &result);
            Some(result?)
        } else {
            None
        };

        let slot_count = match &details {
            Some(request) => request.ask.slot_count,
            None => {
                let requests = self.requests.read().await;
                requests
                    .get(&request_id)
                    .and_then(|e| e.ask.as_ref())
                    .map(|a| a.slot_count)
                    .unwrap_or(0)
            }
        };

        let mut probes = Vec::with_capacity(slot_count as usize);
        for slot_index in 0..slot_count {
            let id = slot_id(&request_id, slot_index);
            match self.probe_slot(&id).await {
                Ok(probe) => probes.push((slot_index, Some(probe))),
                Err(err) => {
                    warn!(
                        "[Registry] Slot {} of {} probe failed: {:?}",
                        slot_index,
                        short_id(&request_id),
                        err
                    );
                    probes.push((slot_index, None));
                }
            }
        }

        let mut requests = self.requests.write().await;
        let entry = requests
            .entry(request_id)
            .or_insert_with(|| RequestEntry::new(request_id));
        entry.state = state;
        if let Some(request) = details {
            entry.client = Some(request.client);
            entry.content = Some(request.content);
            entry.nonce = Some(request.nonce);
            if entry.expiry.is_none() {
                entry.expiry = Some(request.expiry);
            }
            if entry.ask.is_none() {
                entry.ask = Some(request.ask);
            }
            entry.details_fetched = true;
        }
        entry.ensure_slots(slot_count);
        for (slot_index, probe) in probes {
            if let Some((slot_state, provider, missed_proofs)) = probe {
                let slot = entry.slot_mut(slot_index);
                slot.state = slot_state;
                slot.provider = provider;
                slot.missed_proofs = Some(missed_proofs);
            }
        }
        entry.slots_fetched = true;

        debug!(
            "[Registry] Fetched details for {} state={} slots={}",
            short_id(&request_id),
            entry.state,
            entry.slots.len()
        );
        let entry = entry.clone();
        self.metrics.requests_tracked.set(requests.len() as i64);
        Ok(entry)
    }

    async fn probe_slot(
        &self,
        id: &H256,
    ) -> IndexerResult<(SlotState, Option<Address>, u64)> {
        let result = self.ledger.slot_state(id).await;
        self.metrics.note_ledger_query("slot_state", &result);
        let state = result?;

        let result = self.ledger.get_host(id).await;
        self.metrics.note_ledger_query("get_host", &result);
        let provider = result?;

        let result = self.ledger.missing_proofs(id).await;
        self.metrics.note_ledger_query("missing_proofs", &result);
        let missed_proofs = result?;

        Ok((state, provider, missed_proofs))
    }

    /// Applies a request state transition if the lifecycle graph allows it.
    pub async fn update_request_state(
        &self,
        request_id: &RequestId,
        new_state: RequestState,
    ) -> IndexerResult<StateChange> {
        let mut requests = self.requests.write().await;
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            IndexerError::NotFound(format!("request {} not tracked", short_id(request_id)))
        })?;

        if entry.state == new_state {
            debug!(
                "[Registry] Request {} already {}",
                short_id(request_id),
                new_state
            );
            return Ok(StateChange::Unchanged);
        }
        if !entry.state.can_transition_to(new_state) {
            warn!(
                "[Registry] Rejected transition {} -> {} for {}",
                entry.state,
                new_state,
                short_id(request_id)
            );
            return Ok(StateChange::Rejected);
        }

        info!(
            "[Registry] Request {} {} -> {}",
            short_id(request_id),
            entry.state,
            new_state
        );
        entry.state = new_state;
        Ok(StateChange::Applied)
    }

    pub async fn update_slot_state(
        &self,
        request_id: &RequestId,
        slot_index: u64,
        new_state: SlotState,
    ) -> IndexerResult<StateChange> {
        let mut requests = self.requests.write().await;
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            IndexerError::NotFound(format!("request {} not tracked", short_id(request_id)))
        })?;

        let slot = entry.slot_mut(slot_index);
        if slot.state == new_state {
            return Ok(StateChange::Unchanged);
        }
        debug!(
            "[Registry] Slot {} of {} {} -> {}",
            slot_index,
            short_id(request_id),
            slot.state,
            new_state
        );
        slot.state = new_state;
        Ok(StateChange::Applied)
    }

    pub async fn update_slot_provider(
        &self,
        request_id: &RequestId,
        slot_index: u64,
        provider: Option<Address>,
    ) -> IndexerResult<()> {
        let mut requests = self.requests.write().await;
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            IndexerError::NotFound(format!("request {} not tracked", short_id(request_id)))
        })?;
        entry.slot_mut(slot_index).provider = provider;
        Ok(())
    }

    pub async fn set_moderation(
        &self,
        request_id: &RequestId,
        status: ModerationStatus,
    ) -> IndexerResult<()> {
        let mut requests = self.requests.write().await;
        let entry = requests.get_mut(request_id).ok_or_else(|| {
            IndexerError::NotFound(format!("request {} not tracked", short_id(request_id)))
        })?;
        info!(
            "[Registry] Request {} moderation set to {:?}",
            short_id(request_id),
            status
        );
        entry.moderation = status;
        Ok(())
    }

    pub async fn get(&self, request_id: &RequestId) -> Option<RequestEntry> {
        self.requests.read().await.get(request_id).cloned()
    }

    pub async fn contains(&self, request_id: &RequestId) -> bool {
        self.requests.read().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<RequestEntry> {
        self.requests.read().await.values().cloned().collect()
    }

    /// Requests that may still complete, i.e. candidates for timers.
    pub async fn non_terminal_ids(&self) -> Vec<RequestId> {
        self.requests
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .map(|e| e.request_id)
            .collect()
    }

    pub async fn snapshot(&self) -> HashMap<RequestId, RequestEntry> {
        self.requests.read().await.clone()
    }

    pub async fn restore(&self, requests: HashMap<RequestId, RequestEntry>) {
        let mut guard = self.requests.write().await;
        *guard = requests;
        self.metrics.requests_tracked.set(guard.len() as i64);
    }
}
