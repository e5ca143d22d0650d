// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Event ingestion: the one path by which ledger activity reaches the
//! registry.
//!
//! Live subscriptions and historical backfill feed the same per-kind
//! handlers, so an event arriving twice (once replayed, once live) or out of
//! order lands on idempotent registry merges and a deduplicated audit log.
//! An event for a request this process has never seen triggers an out-of-band
//! detail fetch instead of being dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block_cache::BlockCache;
use crate::config::IndexerConfig;
use crate::error::IndexerResult;
use crate::event_log::EventLog;
use crate::events::{
    EventKind, EventRecord, LedgerEvent, MarketplaceEvent, ObservedState, LEDGER_EVENT_KINDS,
};
use crate::ledger_client::LedgerClient;
use crate::metrics::IndexerMetrics;
use crate::registry::RequestRegistry;
use crate::scheduler::CompletionScheduler;
use crate::types::{slot_id, RequestId, RequestState, SlotState};
use crate::utils::short_id;

pub struct EventIngestionPipeline {
    handlers: EventHandlers,
    dispatchers: Mutex<HashMap<EventKind, JoinHandle<()>>>,
    cancel: CancellationToken,
    loading: AtomicBool,
    backfilled: AtomicBool,
}

impl EventIngestionPipeline {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        registry: Arc<RequestRegistry>,
        scheduler: Arc<CompletionScheduler>,
        event_log: Arc<EventLog>,
        block_cache: Arc<BlockCache>,
        config: &IndexerConfig,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            handlers: EventHandlers {
                ledger,
                registry,
                scheduler,
                event_log,
                block_cache,
                metrics,
                detail_fetch_retry: Duration::from_secs(config.detail_fetch_retry_secs),
            },
            dispatchers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            loading: AtomicBool::new(false),
            backfilled: AtomicBool::new(false),
        }
    }

    /// Starts one dispatch task per ledger event kind.
    ///
    /// Calling this again replaces the previous dispatchers: each old task is
    /// aborted before its kind is re-registered, so there is never a window
    /// with two handlers for the same kind.
    pub async fn subscribe(&self) {
        let mut dispatchers = self.dispatchers.lock().await;
        for kind in LEDGER_EVENT_KINDS {
            if let Some(handle) = dispatchers.remove(&kind) {
                handle.abort();
                debug!("[Pipeline] Replacing dispatcher for {}", kind);
            }
            let mut rx = self.handlers.ledger.subscribe(kind);
            let handlers = self.handlers.clone();
            let cancel = self.cancel.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("[Pipeline] Dispatcher for {} cancelled", kind);
                            break;
                        }
                        received = rx.recv() => match received {
                            Ok(event) => {
                                if let Err(err) = handlers.handle_event(&event).await {
                                    handlers
                                        .metrics
                                        .event_handler_failures
                                        .with_label_values(&[kind.as_str(), err.error_type()])
                                        .inc();
                                    error!("[Pipeline] Handler for {} failed: {:?}", kind, err);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(
                                    "[Pipeline] Dispatcher for {} lagged, {} events skipped",
                                    kind, skipped
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("[Pipeline] Event stream for {} closed", kind);
                                break;
                            }
                        }
                    }
                }
            });
            dispatchers.insert(kind, handle);
        }
        info!(
            "[Pipeline] Subscribed to {} ledger event kinds",
            LEDGER_EVENT_KINDS.len()
        );
    }

    /// Replays ledger history through the live handler path.
    ///
    /// Resumes one block past the highest block already memoized in the
    /// BlockCache (full history on first run). All kinds are merged into one
    /// pass ordered by (block number, log index). A failed ledger query or a
    /// transient handler failure abandons the pass without error; the
    /// watermark has not moved past anything unapplied, so the next call
    /// picks up where this one left off.
    pub async fn backfill(&self) -> IndexerResult<()> {
        self.loading.store(true, Ordering::SeqCst);
        let from_block = self.handlers.block_cache.max_block_number().await.map(|n| n + 1);
        info!(
            "[Pipeline] Backfilling ledger history from block {}",
            from_block.unwrap_or(0)
        );

        let mut events = Vec::new();
        for kind in LEDGER_EVENT_KINDS {
            let result = self.handlers.ledger.query_filter(kind, from_block).await;
            self.handlers.metrics.note_ledger_query("query_filter", &result);
            match result {
                Ok(batch) => events.extend(batch),
                Err(err) => {
                    error!("[Pipeline] Backfill query for {} failed: {:?}", kind, err);
                    self.handlers.metrics.backfill_failures.inc();
                    self.loading.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }

        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));

        let mut applied = 0usize;
        let mut abandoned = 0usize;
        for event in &events {
            let kind = event.event.kind();
            match self.handlers.handle_event(event).await {
                Ok(()) => applied += 1,
                Err(err) if err.is_retriable() => {
                    // Stop here: handling later events would advance the
                    // block watermark past this one and the next pass would
                    // never see it again.
                    self.handlers
                        .metrics
                        .event_handler_failures
                        .with_label_values(&[kind.as_str(), err.error_type()])
                        .inc();
                    self.handlers.metrics.backfill_failures.inc();
                    error!(
                        "[Pipeline] Backfill stopped at block {} ({} of {} events applied): {:?}",
                        event.meta.block_number,
                        applied,
                        events.len(),
                        err
                    );
                    self.loading.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => {
                    // Permanent: retrying would fail identically, so the
                    // event is dropped with a trace instead of wedging the
                    // watermark.
                    abandoned += 1;
                    self.handlers
                        .metrics
                        .event_handler_failures
                        .with_label_values(&[kind.as_str(), err.error_type()])
                        .inc();
                    error!(
                        "[Pipeline] Dropping backfill {} for {}: {:?}",
                        kind,
                        short_id(&event.event.request_id()),
                        err
                    );
                }
            }
        }

        self.backfilled.store(true, Ordering::SeqCst);
        self.loading.store(false, Ordering::SeqCst);
        self.handlers.metrics.backfill_runs.inc();
        info!(
            "[Pipeline] Backfill applied {} events ({} dropped)",
            applied, abandoned
        );
        Ok(())
    }

    /// Applies one ledger event. Exposed for callers that hold events from
    /// elsewhere; live dispatch and backfill both funnel through here.
    pub async fn handle_event(&self, event: &LedgerEvent) -> IndexerResult<()> {
        self.handlers.handle_event(event).await
    }

    /// Stops all dispatch tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut dispatchers = self.dispatchers.lock().await;
        for (_, handle) in dispatchers.drain() {
            handle.abort();
        }
        info!("[Pipeline] Shut down");
    }

    /// True while a backfill pass is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// True once a backfill pass has run to completion.
    pub fn is_backfilled(&self) -> bool {
        self.backfilled.load(Ordering::SeqCst)
    }
}

/// Everything a dispatch task needs, cloned into each spawned task.
#[derive(Clone)]
struct EventHandlers {
    ledger: Arc<dyn LedgerClient>,
    registry: Arc<RequestRegistry>,
    scheduler: Arc<CompletionScheduler>,
    event_log: Arc<EventLog>,
    block_cache: Arc<BlockCache>,
    metrics: Arc<IndexerMetrics>,
    detail_fetch_retry: Duration,
}

impl EventHandlers {
    async fn handle_event(&self, event: &LedgerEvent) -> IndexerResult<()> {
        let kind = event.event.kind();
        let request_id = event.event.request_id();
        self.metrics
            .events_received
            .with_label_values(&[kind.as_str()])
            .inc();
        debug!(
            "[Pipeline] {} for {} at block {}",
            kind,
            short_id(&request_id),
            event.meta.block_number
        );

        let observed = match &event.event {
            MarketplaceEvent::StorageRequested {
                request_id,
                ask,
                expiry,
            } => {
                let entry = self
                    .registry
                    .create(
                        *request_id,
                        event.meta.block_hash,
                        Some(ask.clone()),
                        Some(*expiry),
                    )
                    .await?;
                self.scheduler.arm(*request_id).await;
                ObservedState::Request(entry.state)
            }
            MarketplaceEvent::RequestFulfilled { request_id } => {
                self.apply_request_state(request_id, RequestState::Fulfilled)
                    .await?;
                self.scheduler.arm(*request_id).await;
                ObservedState::Request(RequestState::Fulfilled)
            }
            MarketplaceEvent::RequestCancelled { request_id } => {
                self.apply_request_state(request_id, RequestState::Cancelled)
                    .await?;
                self.scheduler.cancel(request_id).await;
                ObservedState::Request(RequestState::Cancelled)
            }
            MarketplaceEvent::RequestFailed { request_id } => {
                self.apply_request_state(request_id, RequestState::Failed)
                    .await?;
                self.scheduler.cancel(request_id).await;
                ObservedState::Request(RequestState::Failed)
            }
            MarketplaceEvent::SlotFilled {
                request_id,
                slot_index,
            } => {
                self.apply_slot_state(request_id, *slot_index, SlotState::Filled)
                    .await?;
                // Best-effort: a failed host lookup leaves the provider
                // unset until the next detail refresh, it does not fail
                // the event.
                let id = slot_id(request_id, *slot_index);
                let result = self.ledger.get_host(&id).await;
                self.metrics.note_ledger_query("get_host", &result);
                match result {
                    Ok(provider) => {
                        let _ = self
                            .registry
                            .update_slot_provider(request_id, *slot_index, provider)
                            .await;
                    }
                    Err(err) => warn!(
                        "[Pipeline] Host lookup failed for slot {} of {}: {:?}",
                        slot_index,
                        short_id(request_id),
                        err
                    ),
                }
                self.scheduler.arm(*request_id).await;
                ObservedState::Slot(SlotState::Filled)
            }
            MarketplaceEvent::SlotFreed {
                request_id,
                slot_index,
            } => {
                self.apply_slot_state(request_id, *slot_index, SlotState::Free)
                    .await?;
                let _ = self
                    .registry
                    .update_slot_provider(request_id, *slot_index, None)
                    .await;
                ObservedState::Slot(SlotState::Free)
            }
        };

        // Memoized only now, after the mutation landed: the backfill
        // watermark must never move past an unapplied event.
        let pointer = self
            .block_cache
            .resolve(self.ledger.as_ref(), event.meta.block_hash)
            .await?;

        let moderation = self
            .registry
            .get(&request_id)
            .await
            .map(|entry| entry.moderation)
            .unwrap_or_default();
        let appended = self
            .event_log
            .append(EventRecord {
                kind,
                block_number: event.meta.block_number,
                request_id,
                slot_index: event.event.slot_index(),
                state: observed,
                timestamp: pointer.timestamp,
                moderation,
            })
            .await;
        if !appended {
            self.metrics
                .events_deduped
                .with_label_values(&[kind.as_str()])
                .inc();
        }
        Ok(())
    }

    async fn apply_request_state(
        &self,
        request_id: &RequestId,
        state: RequestState,
    ) -> IndexerResult<()> {
        match self.registry.update_request_state(request_id, state).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                self.recover_unknown_request(request_id).await?;
                self.registry
                    .update_request_state(request_id, state)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_slot_state(
        &self,
        request_id: &RequestId,
        slot_index: u64,
        state: SlotState,
    ) -> IndexerResult<()> {
        match self
            .registry
            .update_slot_state(request_id, slot_index, state)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                self.recover_unknown_request(request_id).await?;
                self.registry
                    .update_slot_state(request_id, slot_index, state)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// An event referenced a request this process never saw created (gap in
    /// the subscription, pruned history). Materialize it with a full detail
    /// fetch so the event has something to land on.
    async fn recover_unknown_request(&self, request_id: &RequestId) -> IndexerResult<()> {
        info!(
            "[Pipeline] Event for untracked request {}, fetching details",
            short_id(request_id)
        );
        self.metrics
            .detail_fetches
            .with_label_values(&["recovery"])
            .inc();
        let result = crate::retry_transient!(
            self.registry.fetch_details(*request_id),
            self.detail_fetch_retry
        );
        match result {
            Ok(_) => {
                self.scheduler.arm(*request_id).await;
                Ok(())
            }
            Err(err) => {
                error!(
                    "[Pipeline] Could not materialize {}: {:?}",
                    short_id(request_id),
                    err
                );
                Err(err)
            }
        }
    }
}
