// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Snapshot persistence and best-effort cross-process sync.
//!
//! The whole indexer state serializes into one JSON [`Snapshot`] under a
//! single key. A side-channel meta key (`<key>.meta`) carries a
//! `{source, timestamp}` fencing token and is written before every snapshot,
//! so a sibling process notified of a snapshot change can always read a
//! current token: it skips its own writes (same source) and stale ones
//! (timestamp not newer than the last it applied).

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block_cache::BlockCache;
use crate::config::IndexerConfig;
use crate::error::{IndexerError, IndexerResult};
use crate::event_log::EventLog;
use crate::events::EventRecord;
use crate::metrics::IndexerMetrics;
use crate::registry::RequestRegistry;
use crate::scheduler::CompletionScheduler;
use crate::types::{BlockPointer, RequestEntry, RequestId};
use crate::utils::now_millis;

/// Everything the indexer persists, as one value.
///
/// `events` is `None` when the audit log is excluded from persistence
/// (`persist_event_log = false`); a `None` on load leaves the local log
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub requests: HashMap<RequestId, RequestEntry>,
    pub blocks: HashMap<H256, BlockPointer>,
    pub events: Option<Vec<EventRecord>>,
}

/// Fencing token stored under `<snapshot_key>.meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub source: String,
    /// Wall-clock milliseconds at write time.
    pub timestamp: u64,
}

/// Key-value persistence driver.
///
/// String-valued: callers serialize, the store only moves bytes. `watch`
/// surfaces change notifications (the changed key) from any writer sharing
/// the store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> IndexerResult<Option<String>>;
    async fn save(&self, key: &str, value: String) -> IndexerResult<()>;
    async fn remove(&self, key: &str) -> IndexerResult<()>;
    fn watch(&self) -> broadcast::Receiver<String>;
}

/// In-process store for tests and single-process deployments.
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            changes: broadcast::channel(64).0,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, key: &str) -> IndexerResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: String) -> IndexerResult<()> {
        self.values.write().await.insert(key.to_string(), value);
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> IndexerResult<()> {
        self.values.write().await.remove(key);
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// Connects the in-memory components to a [`SnapshotStore`].
pub struct PersistenceBridge {
    inner: SyncState,
    watcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl PersistenceBridge {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        registry: Arc<RequestRegistry>,
        block_cache: Arc<BlockCache>,
        event_log: Arc<EventLog>,
        scheduler: Arc<CompletionScheduler>,
        config: &IndexerConfig,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            inner: SyncState {
                store,
                registry,
                block_cache,
                event_log,
                scheduler,
                metrics,
                source_id: config.source_id.clone(),
                snapshot_key: config.snapshot_key.clone(),
                persist_event_log: config.persist_event_log,
                last_applied: Arc::new(Mutex::new(0)),
            },
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Serializes current state and writes it to the store, meta key first.
    pub async fn save(&self) -> IndexerResult<()> {
        self.inner.save().await
    }

    /// Loads the persisted snapshot into the components.
    ///
    /// A missing snapshot is a normal first run. A snapshot that fails to
    /// parse is logged and skipped so a corrupt store never blocks startup;
    /// the indexer then rebuilds from a full backfill.
    pub async fn load(&self) -> IndexerResult<()> {
        self.inner.load_and_apply().await
    }

    /// Starts the watch task that applies sibling processes' snapshots.
    /// Calling it again replaces the previous task.
    pub async fn start(&self) {
        let mut watcher = self.watcher.lock().await;
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
        let mut rx = self.inner.store.watch();
        let state = self.inner.clone();
        let cancel = self.cancel.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Persistence] Watch task cancelled");
                        break;
                    }
                    received = rx.recv() => match received {
                        Ok(key) => {
                            if key != state.snapshot_key {
                                continue;
                            }
                            state.handle_remote_change().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("[Persistence] Watch lagged, {} notifications skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("[Persistence] Store watch channel closed");
                            break;
                        }
                    }
                }
            }
        }));
        info!("[Persistence] Watching '{}' for sibling updates", self.inner.snapshot_key);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct SyncState {
    store: Arc<dyn SnapshotStore>,
    registry: Arc<RequestRegistry>,
    block_cache: Arc<BlockCache>,
    event_log: Arc<EventLog>,
    scheduler: Arc<CompletionScheduler>,
    metrics: Arc<IndexerMetrics>,
    source_id: String,
    snapshot_key: String,
    persist_event_log: bool,
    /// Timestamp of the last sibling snapshot applied here.
    last_applied: Arc<Mutex<u64>>,
}

impl SyncState {
    fn meta_key(&self) -> String {
        format!("{}.meta", self.snapshot_key)
    }

    async fn save(&self) -> IndexerResult<()> {
        let snapshot = Snapshot {
            requests: self.registry.snapshot().await,
            blocks: self.block_cache.snapshot().await,
            events: if self.persist_event_log {
                Some(self.event_log.snapshot().await)
            } else {
                None
            },
        };
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| IndexerError::Serialization(e.to_string()))?;
        let meta = SyncMeta {
            source: self.source_id.clone(),
            timestamp: now_millis(),
        };
        let meta_payload = serde_json::to_string(&meta)
            .map_err(|e| IndexerError::Serialization(e.to_string()))?;

        // Meta goes first: anyone notified by the snapshot write must find
        // a token at least as new as the snapshot.
        self.store.save(&self.meta_key(), meta_payload).await?;
        self.store.save(&self.snapshot_key, payload).await?;
        self.metrics.snapshot_saves.inc();
        debug!(
            "[Persistence] Saved snapshot '{}' ({} requests)",
            self.snapshot_key,
            self.registry.len().await
        );
        Ok(())
    }

    async fn load_and_apply(&self) -> IndexerResult<()> {
        let Some(payload) = self.store.load(&self.snapshot_key).await? else {
            debug!("[Persistence] No snapshot under '{}'", self.snapshot_key);
            return Ok(());
        };
        let snapshot: Snapshot = match serde_json::from_str(&payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.metrics.snapshot_load_failures.inc();
                error!(
                    "[Persistence] Snapshot '{}' is corrupt, starting empty: {}",
                    self.snapshot_key, err
                );
                return Ok(());
            }
        };
        self.apply(snapshot).await;
        self.metrics.snapshot_loads.inc();
        Ok(())
    }

    async fn apply(&self, snapshot: Snapshot) {
        let request_count = snapshot.requests.len();
        self.block_cache.restore(snapshot.blocks).await;
        if let Some(events) = snapshot.events {
            self.event_log.restore(events).await;
        }
        self.registry.restore(snapshot.requests).await;

        // Timer handles are never persisted; re-arm from restored state.
        for request_id in self.registry.non_terminal_ids().await {
            self.scheduler.arm(request_id).await;
        }
        info!("[Persistence] Applied snapshot with {} requests", request_count);
    }

    /// A sibling (or we ourselves) rewrote the snapshot key.
    async fn handle_remote_change(&self) {
        let meta = match self.read_meta().await {
            Some(meta) => meta,
            None => {
                self.metrics
                    .sync_rejects
                    .with_label_values(&["missing_meta"])
                    .inc();
                warn!(
                    "[Persistence] Snapshot '{}' changed without a readable meta key, ignoring",
                    self.snapshot_key
                );
                return;
            }
        };
        if meta.source == self.source_id {
            self.metrics
                .sync_rejects
                .with_label_values(&["own_source"])
                .inc();
            debug!("[Persistence] Ignoring own snapshot write");
            return;
        }
        {
            let last = self.last_applied.lock().await;
            if meta.timestamp <= *last {
                self.metrics
                    .sync_rejects
                    .with_label_values(&["stale"])
                    .inc();
                debug!(
                    "[Persistence] Ignoring stale snapshot from '{}' ({} <= {})",
                    meta.source, meta.timestamp, *last
                );
                return;
            }
        }

        match self.load_and_apply().await {
            Ok(()) => {
                *self.last_applied.lock().await = meta.timestamp;
                self.metrics.sync_reloads.inc();
                info!(
                    "[Persistence] Reloaded snapshot from sibling '{}'",
                    meta.source
                );
            }
            Err(err) => {
                error!("[Persistence] Sibling snapshot reload failed: {:?}", err);
            }
        }
    }

    async fn read_meta(&self) -> Option<SyncMeta> {
        let payload = match self.store.load(&self.meta_key()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(err) => {
                warn!("[Persistence] Could not read meta key: {:?}", err);
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!("[Persistence] Meta key is corrupt: {}", err);
                None
            }
        }
    }
}
