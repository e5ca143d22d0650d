// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Append-only audit log of observed marketplace events.
//!
//! Records are kept in arrival order and deduplicated on append by their
//! composite key, so at-least-once delivery (live + backfill racing) leaves
//! exactly one record per ledger event.

use crate::events::{EventKey, EventRecord};
use crate::types::RequestId;
use crate::utils::short_id;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct LogInner {
    records: Vec<EventRecord>,
    keys: HashSet<EventKey>,
}

#[derive(Default)]
pub struct EventLog {
    inner: RwLock<LogInner>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record unless one with the same composite key exists.
    /// Returns whether the record was actually appended.
    pub async fn append(&self, record: EventRecord) -> bool {
        let mut inner = self.inner.write().await;
        let key = record.key();
        if !inner.keys.insert(key) {
            debug!(
                "[EventLog] Skipping duplicate {} for {} at block {}",
                record.kind,
                short_id(&record.request_id),
                record.block_number
            );
            return false;
        }
        debug!(
            "[EventLog] Append {} for {} at block {}",
            record.kind,
            short_id(&record.request_id),
            record.block_number
        );
        inner.records.push(record);
        true
    }

    /// Removes every record matching the key. Returns the removed count;
    /// more than one only happens for logs restored with duplicates.
    pub async fn remove(&self, key: &EventKey) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.key() != *key);
        inner.keys.remove(key);
        before - inner.records.len()
    }

    /// Drops all records of one request, e.g. after a moderation decision.
    /// Entity state is untouched.
    pub async fn clear_request(&self, request_id: &RequestId) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.request_id != *request_id);
        inner.keys.retain(|(_, _, id, _)| id != request_id);
        let removed = before - inner.records.len();
        if removed > 0 {
            info!(
                "[EventLog] Cleared {} records for {}",
                removed,
                short_id(request_id)
            );
        }
        removed
    }

    pub async fn records(&self) -> Vec<EventRecord> {
        self.inner.read().await.records.clone()
    }

    pub async fn for_request(&self, request_id: &RequestId) -> Vec<EventRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .iter()
            .filter(|r| r.request_id == *request_id)
            .cloned()
            .collect()
    }

    /// First-occurrence view with composite-key duplicates removed. Only
    /// differs from `records` when a restored snapshot carried duplicates.
    pub async fn deduped(&self) -> Vec<EventRecord> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        inner
            .records
            .iter()
            .filter(|r| seen.insert(r.key()))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<EventRecord> {
        self.records().await
    }

    /// Replaces the log with persisted records, kept verbatim even if they
    /// contain duplicates. The dedup set is rebuilt so future appends still
    /// dedup against them.
    pub async fn restore(&self, records: Vec<EventRecord>) {
        let mut inner = self.inner.write().await;
        inner.keys = records.iter().map(|r| r.key()).collect();
        inner.records = records;
    }
}
