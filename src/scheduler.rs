// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Predicts request completion instead of waiting for the ledger to say so.
//!
//! The ledger emits no event when a storage request runs out its clock, so
//! the scheduler arms one process-local timer per tracked request at
//! `requested_at + ask.duration + completion_margin_secs`. When the timer
//! fires, the ledger is asked again: any terminal state it reports wins over
//! the prediction, and only a still-running request is transitioned to
//! `Finished` with a synthetic audit record. Timers do not survive a restart;
//! [`CompletionScheduler::reconcile`] re-arms them from registry state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::event_log::EventLog;
use crate::events::{EventKind, EventRecord, ObservedState};
use crate::ledger_client::LedgerClient;
use crate::metrics::IndexerMetrics;
use crate::registry::{RequestRegistry, StateChange};
use crate::types::{RequestId, RequestState};
use crate::utils::{now_secs, short_id};

pub struct CompletionScheduler {
    registry: Arc<RequestRegistry>,
    ledger: Arc<dyn LedgerClient>,
    event_log: Arc<EventLog>,
    metrics: Arc<IndexerMetrics>,
    completion_margin_secs: u64,
    timers: Arc<Mutex<HashMap<RequestId, JoinHandle<()>>>>,
}

impl CompletionScheduler {
    pub fn new(
        registry: Arc<RequestRegistry>,
        ledger: Arc<dyn LedgerClient>,
        event_log: Arc<EventLog>,
        config: &IndexerConfig,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            registry,
            ledger,
            event_log,
            metrics,
            completion_margin_secs: config.completion_margin_secs,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms the completion timer for a request.
    ///
    /// No-op unless the request is locally known, non-terminal, and carries
    /// enough detail (`requested_at` and the ask duration) to compute a
    /// deadline. At most one timer exists per request; arming an already
    /// armed request does nothing, so callers can arm eagerly on every
    /// event that touches a request.
    pub async fn arm(&self, request_id: RequestId) {
        let Some(entry) = self.registry.get(&request_id).await else {
            debug!(
                "[Scheduler] Not arming {}: request is not tracked",
                short_id(&request_id)
            );
            return;
        };
        if entry.is_terminal() {
            return;
        }
        let Some(completion) = entry.completion_time() else {
            debug!(
                "[Scheduler] Not arming {}: completion time not yet known",
                short_id(&request_id)
            );
            return;
        };
        let scheduled_at = completion + self.completion_margin_secs;

        let mut timers = self.timers.lock().await;
        if timers.contains_key(&request_id) {
            return;
        }

        // Delay is computed once from the wall clock here. The fire handler
        // re-validates against the ledger, so a stale deadline costs one
        // extra query rather than a wrong state.
        let delay = Duration::from_secs(scheduled_at.saturating_sub(now_secs()));

        let registry = self.registry.clone();
        let ledger = self.ledger.clone();
        let event_log = self.event_log.clone();
        let metrics = self.metrics.clone();
        let handles = self.timers.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(
                request_id,
                scheduled_at,
                registry,
                ledger,
                event_log,
                metrics,
                handles,
            )
            .await;
        });
        timers.insert(request_id, handle);
        self.metrics.timers_armed.inc();
        debug!(
            "[Scheduler] Armed completion timer for {} at {}",
            short_id(&request_id),
            scheduled_at
        );
    }

    /// Cancels the pending timer for a request, if any.
    pub async fn cancel(&self, request_id: &RequestId) {
        if let Some(handle) = self.timers.lock().await.remove(request_id) {
            handle.abort();
            self.metrics.timers_cancelled.inc();
            debug!(
                "[Scheduler] Cancelled completion timer for {}",
                short_id(request_id)
            );
        }
    }

    /// Re-arms timers after a restart.
    ///
    /// Sweeps every non-terminal request in the registry, applies whatever
    /// state the ledger reports now (a request may have finished, failed or
    /// been cancelled while the process was down), and arms timers for the
    /// survivors. A ledger failure on one request does not stop the sweep;
    /// that request is armed from local knowledge and the fire handler sorts
    /// it out later.
    pub async fn reconcile(&self) {
        let ids = self.registry.non_terminal_ids().await;
        info!(
            "[Scheduler] Reconciling completion timers for {} running requests",
            ids.len()
        );
        for request_id in ids {
            let result = self.ledger.request_state(&request_id).await;
            self.metrics.note_ledger_query("request_state", &result);
            match result {
                Ok(state) => {
                    if let Err(err) = self.registry.update_request_state(&request_id, state).await {
                        warn!(
                            "[Scheduler] Could not apply reconciled state for {}: {:?}",
                            short_id(&request_id),
                            err
                        );
                    }
                    if state.is_terminal() {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(
                        "[Scheduler] State check failed for {} during reconcile, arming from local state: {:?}",
                        short_id(&request_id),
                        err
                    );
                }
            }
            self.arm(request_id).await;
        }
    }

    /// Aborts all pending timers.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        info!("[Scheduler] Shut down, all completion timers aborted");
    }

    pub async fn is_armed(&self, request_id: &RequestId) -> bool {
        self.timers.lock().await.contains_key(request_id)
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Timer body. The ledger is re-queried before anything changes: the
    /// prediction only lands when the request is still running on-ledger
    /// (or the ledger is briefly unreachable and the local view says
    /// running). The synthetic `RequestFinished` record is appended only
    /// when the transition actually applies, which makes it exactly-once
    /// even if a second timer ever fires for the same request.
    async fn fire(
        request_id: RequestId,
        scheduled_at: u64,
        registry: Arc<RequestRegistry>,
        ledger: Arc<dyn LedgerClient>,
        event_log: Arc<EventLog>,
        metrics: Arc<IndexerMetrics>,
        timers: Arc<Mutex<HashMap<RequestId, JoinHandle<()>>>>,
    ) {
        timers.lock().await.remove(&request_id);
        metrics.timers_fired.inc();

        let result = ledger.request_state(&request_id).await;
        metrics.note_ledger_query("request_state", &result);
        match result {
            Ok(state) if state.is_terminal() => {
                info!(
                    "[Scheduler] Request {} reached {} on its own, skipping completion",
                    short_id(&request_id),
                    state
                );
                if let Err(err) = registry.update_request_state(&request_id, state).await {
                    warn!(
                        "[Scheduler] Could not apply ledger state for {}: {:?}",
                        short_id(&request_id),
                        err
                    );
                }
                return;
            }
            Ok(_) => {}
            Err(err) if err.is_retriable() => {
                warn!(
                    "[Scheduler] State check at completion time failed for {}, trusting local view: {:?}",
                    short_id(&request_id),
                    err
                );
                match registry.get(&request_id).await {
                    Some(entry) if !entry.is_terminal() => {}
                    _ => return,
                }
            }
            Err(err) => {
                warn!(
                    "[Scheduler] Request {} unknown to the ledger at completion time: {:?}",
                    short_id(&request_id),
                    err
                );
                return;
            }
        }

        match registry
            .update_request_state(&request_id, RequestState::Finished)
            .await
        {
            Ok(StateChange::Applied) => {
                let result = ledger.get_block_number().await;
                metrics.note_ledger_query("get_block_number", &result);
                // Synthetic events carry the tip block number so the audit
                // trail stays roughly ordered; 0 marks "unknown".
                let block_number = result.unwrap_or(0);
                let moderation = registry
                    .get(&request_id)
                    .await
                    .map(|entry| entry.moderation)
                    .unwrap_or_default();
                event_log
                    .append(EventRecord {
                        kind: EventKind::RequestFinished,
                        block_number,
                        request_id,
                        slot_index: None,
                        state: ObservedState::Request(RequestState::Finished),
                        timestamp: scheduled_at,
                        moderation,
                    })
                    .await;
                info!(
                    "[Scheduler] Request {} finished at {} (predicted)",
                    short_id(&request_id),
                    scheduled_at
                );
            }
            Ok(change) => {
                debug!(
                    "[Scheduler] No completion transition for {}: {:?}",
                    short_id(&request_id),
                    change
                );
            }
            Err(err) => {
                warn!(
                    "[Scheduler] Completion transition failed for {}: {:?}",
                    short_id(&request_id),
                    err
                );
            }
        }
    }
}
