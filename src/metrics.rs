// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

#[derive(Clone, Debug)]
pub struct IndexerMetrics {
    pub(crate) events_received: IntCounterVec,
    pub(crate) events_deduped: IntCounterVec,
    pub(crate) event_handler_failures: IntCounterVec,

    pub(crate) ledger_queries: IntCounterVec,

    pub(crate) backfill_runs: IntCounter,
    pub(crate) backfill_failures: IntCounter,

    pub(crate) requests_tracked: IntGauge,
    pub(crate) detail_fetches: IntCounterVec,

    pub(crate) timers_armed: IntCounter,
    pub(crate) timers_fired: IntCounter,
    pub(crate) timers_cancelled: IntCounter,

    pub(crate) snapshot_saves: IntCounter,
    pub(crate) snapshot_loads: IntCounter,
    pub(crate) snapshot_load_failures: IntCounter,
    pub(crate) sync_reloads: IntCounter,
    pub(crate) sync_rejects: IntCounterVec,
}

impl IndexerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_received: register_int_counter_vec_with_registry!(
                "indexer_events_received",
                "Total number of ledger events received, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            events_deduped: register_int_counter_vec_with_registry!(
                "indexer_events_deduped",
                "Total number of duplicate ledger events skipped, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            event_handler_failures: register_int_counter_vec_with_registry!(
                "indexer_event_handler_failures",
                "Total number of event handler failures, by event kind and error type",
                &["kind", "error"],
                registry,
            )
            .unwrap(),
            ledger_queries: register_int_counter_vec_with_registry!(
                "indexer_ledger_queries",
                "Total number of point queries issued to the ledger, by method and result",
                &["method", "result"],
                registry,
            )
            .unwrap(),
            backfill_runs: register_int_counter_with_registry!(
                "indexer_backfill_runs",
                "Total number of backfill passes started",
                registry,
            )
            .unwrap(),
            backfill_failures: register_int_counter_with_registry!(
                "indexer_backfill_failures",
                "Total number of backfill passes abandoned on ledger failure",
                registry,
            )
            .unwrap(),
            requests_tracked: register_int_gauge_with_registry!(
                "indexer_requests_tracked",
                "Number of requests currently held in the registry",
                registry,
            )
            .unwrap(),
            detail_fetches: register_int_counter_vec_with_registry!(
                "indexer_detail_fetches",
                "Total number of full detail fetches, by trigger",
                &["trigger"],
                registry,
            )
            .unwrap(),
            timers_armed: register_int_counter_with_registry!(
                "indexer_timers_armed",
                "Total number of completion timers armed",
                registry,
            )
            .unwrap(),
            timers_fired: register_int_counter_with_registry!(
                "indexer_timers_fired",
                "Total number of completion timers that fired",
                registry,
            )
            .unwrap(),
            timers_cancelled: register_int_counter_with_registry!(
                "indexer_timers_cancelled",
                "Total number of completion timers cancelled before firing",
                registry,
            )
            .unwrap(),
            snapshot_saves: register_int_counter_with_registry!(
                "indexer_snapshot_saves",
                "Total number of snapshots written to the store",
                registry,
            )
            .unwrap(),
            snapshot_loads: register_int_counter_with_registry!(
                "indexer_snapshot_loads",
                "Total number of snapshots loaded from the store",
                registry,
            )
            .unwrap(),
            snapshot_load_failures: register_int_counter_with_registry!(
                "indexer_snapshot_load_failures",
                "Total number of snapshot loads that fell back to empty state",
                registry,
            )
            .unwrap(),
            sync_reloads: register_int_counter_with_registry!(
                "indexer_sync_reloads",
                "Total number of cross-process sync notifications applied",
                registry,
            )
            .unwrap(),
            sync_rejects: register_int_counter_vec_with_registry!(
                "indexer_sync_rejects",
                "Total number of cross-process sync notifications rejected, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }

    /// Record the outcome of one ledger point query.
    pub(crate) fn note_ledger_query<T>(
        &self,
        method: &str,
        result: &crate::error::IndexerResult<T>,
    ) {
        let label = match result {
            Ok(_) => "ok",
            Err(e) => e.error_type(),
        };
        self.ledger_queries.with_label_values(&[method, label]).inc();
    }
}
