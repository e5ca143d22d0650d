// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the marketplace indexer.

use serde::{Deserialize, Serialize};

/// Main configuration for the indexer components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Identity of this process, used to fence out self-originated
    /// cross-process sync notifications.
    pub source_id: String,

    /// Safety margin in seconds added to the predicted completion time to
    /// absorb clock and block-time skew.
    #[serde(default = "default_completion_margin_secs")]
    pub completion_margin_secs: u64,

    /// Storage key under which snapshots are persisted
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,

    /// Include the audit event log in snapshots
    #[serde(default = "default_persist_event_log")]
    pub persist_event_log: bool,

    /// Max elapsed seconds when retrying transient failures of the
    /// out-of-band detail fetch
    #[serde(default = "default_detail_fetch_retry_secs")]
    pub detail_fetch_retry_secs: u64,
}

fn default_completion_margin_secs() -> u64 {
    60
}

fn default_snapshot_key() -> String {
    "marketplace-indexer".to_string()
}

fn default_persist_event_log() -> bool {
    true
}

fn default_detail_fetch_retry_secs() -> u64 {
    10
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            source_id: "indexer".to_string(),
            completion_margin_secs: default_completion_margin_secs(),
            snapshot_key: default_snapshot_key(),
            persist_event_log: default_persist_event_log(),
            detail_fetch_retry_secs: default_detail_fetch_retry_secs(),
        }
    }
}

impl IndexerConfig {
    /// Create a config with an explicit process identity
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    /// Set the completion timer safety margin
    pub fn with_completion_margin_secs(mut self, secs: u64) -> Self {
        self.completion_margin_secs = secs;
        self
    }

    /// Set the snapshot storage key
    pub fn with_snapshot_key(mut self, key: &str) -> Self {
        self.snapshot_key = key.to_string();
        self
    }

    /// Include or exclude the audit log from snapshots
    pub fn with_persist_event_log(mut self, persist: bool) -> Self {
        self.persist_event_log = persist;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.source_id.is_empty() {
            return Err("source_id cannot be empty".to_string());
        }
        if self.snapshot_key.is_empty() {
            return Err("snapshot_key cannot be empty".to_string());
        }
        if self.detail_fetch_retry_secs == 0 {
            return Err("detail_fetch_retry_secs must be > 0".to_string());
        }
        Ok(())
    }
}
