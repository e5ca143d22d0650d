// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end flows over the full component stack: ingestion pipeline,
//! request registry, completion scheduler, audit log and snapshot
//! persistence, all backed by a mock ledger.
//!
//! Run with:
//!   cargo test --lib e2e_tests -- --nocapture
//!
//! Block timestamps are anchored at the current wall clock so completion
//! timers behave deterministically under paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, H256};
use tokio::time::sleep;

use crate::block_cache::BlockCache;
use crate::config::IndexerConfig;
use crate::event_log::EventLog;
use crate::events::{EventKind, EventMeta, LedgerEvent, MarketplaceEvent, ObservedState};
use crate::metrics::IndexerMetrics;
use crate::mock_ledger::MockLedger;
use crate::persistence::{MemoryStore, PersistenceBridge};
use crate::pipeline::EventIngestionPipeline;
use crate::registry::RequestRegistry;
use crate::scheduler::CompletionScheduler;
use crate::test_utils::{init_tracing, sample_ask};
use crate::types::{slot_id, BlockPointer, RequestId, RequestState, SlotState};
use crate::utils::now_secs;

const MARGIN_SECS: u64 = 60;

struct Stack {
    ledger: Arc<MockLedger>,
    registry: Arc<RequestRegistry>,
    scheduler: Arc<CompletionScheduler>,
    event_log: Arc<EventLog>,
    block_cache: Arc<BlockCache>,
    metrics: Arc<IndexerMetrics>,
    pipeline: EventIngestionPipeline,
}

fn stack(source_id: &str) -> Stack {
    init_tracing();
    let ledger = Arc::new(MockLedger::new());
    let metrics = Arc::new(IndexerMetrics::new_for_testing());
    let block_cache = Arc::new(BlockCache::new());
    let registry = Arc::new(RequestRegistry::new(
        ledger.clone(),
        block_cache.clone(),
        metrics.clone(),
    ));
    let event_log = Arc::new(EventLog::new());
    let config = IndexerConfig::new(source_id).with_completion_margin_secs(MARGIN_SECS);
    let scheduler = Arc::new(CompletionScheduler::new(
        registry.clone(),
        ledger.clone(),
        event_log.clone(),
        &config,
        metrics.clone(),
    ));
    let pipeline = EventIngestionPipeline::new(
        ledger.clone(),
        registry.clone(),
        scheduler.clone(),
        event_log.clone(),
        block_cache.clone(),
        &config,
        metrics.clone(),
    );
    Stack {
        ledger,
        registry,
        scheduler,
        event_log,
        block_cache,
        metrics,
        pipeline,
    }
}

fn bridge(s: &Stack, store: Arc<MemoryStore>, source_id: &str) -> PersistenceBridge {
    let config = IndexerConfig::new(source_id).with_completion_margin_secs(MARGIN_SECS);
    PersistenceBridge::new(
        store,
        s.registry.clone(),
        s.block_cache.clone(),
        s.event_log.clone(),
        s.scheduler.clone(),
        &config,
        s.metrics.clone(),
    )
}

/// Deterministic block hash so two independent stacks agree on pointers.
fn preset_block(s: &Stack, number: u64, timestamp: u64) -> H256 {
    let hash = H256::from_low_u64_be(number);
    s.ledger.set_block(hash, BlockPointer { number, timestamp });
    hash
}

fn requested(request_id: RequestId, block: u64, log_index: u64) -> LedgerEvent {
    LedgerEvent {
        event: MarketplaceEvent::StorageRequested {
            request_id,
            ask: sample_ask(3, 100),
            expiry: 50,
        },
        meta: EventMeta {
            block_number: block,
            block_hash: H256::from_low_u64_be(block),
            log_index,
        },
    }
}

fn request_state_change(kind: EventKind, request_id: RequestId, block: u64) -> LedgerEvent {
    let event = match kind {
        EventKind::RequestFulfilled => MarketplaceEvent::RequestFulfilled { request_id },
        EventKind::RequestCancelled => MarketplaceEvent::RequestCancelled { request_id },
        EventKind::RequestFailed => MarketplaceEvent::RequestFailed { request_id },
        _ => panic!("not a request state event"),
    };
    LedgerEvent {
        event,
        meta: EventMeta {
            block_number: block,
            block_hash: H256::from_low_u64_be(block),
            log_index: 0,
        },
    }
}

fn slot_change(filled: bool, request_id: RequestId, slot_index: u64, block: u64) -> LedgerEvent {
    let event = if filled {
        MarketplaceEvent::SlotFilled {
            request_id,
            slot_index,
        }
    } else {
        MarketplaceEvent::SlotFreed {
            request_id,
            slot_index,
        }
    };
    LedgerEvent {
        event,
        meta: EventMeta {
            block_number: block,
            block_hash: H256::from_low_u64_be(block),
            log_index: 1,
        },
    }
}

fn deduped_total(s: &Stack) -> u64 {
    crate::events::LEDGER_EVENT_KINDS
        .iter()
        .map(|kind| {
            s.metrics
                .events_deduped
                .with_label_values(&[kind.as_str()])
                .get()
        })
        .sum()
}

// ==================== request lifecycle ====================

/// Full happy path: request posted, one slot filled, fulfilled, then
/// finished by the completion timer with exactly one synthetic record.
#[tokio::test(start_paused = true)]
async fn request_lifecycle_ends_in_predicted_finish() {
    let s = stack("node-a");
    let base = now_secs();
    preset_block(&s, 10, base);
    preset_block(&s, 11, base + 10);
    preset_block(&s, 12, base + 20);

    let request_id = H256::repeat_byte(0xaa);
    s.ledger.set_request_state(request_id, Ok(RequestState::New));
    s.ledger.set_block_number(12);

    s.pipeline
        .handle_event(&requested(request_id, 10, 0))
        .await
        .unwrap();
    let entry = s.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.state, RequestState::New);
    assert_eq!(entry.requested_at, Some(base));
    assert_eq!(entry.slots.len(), 3);
    assert!(entry.slots.iter().all(|slot| slot.state == SlotState::Free));

    s.pipeline
        .handle_event(&slot_change(true, request_id, 1, 11))
        .await
        .unwrap();
    let entry = s.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.slots[1].state, SlotState::Filled);
    assert_eq!(entry.slots[0].state, SlotState::Free);

    s.ledger
        .set_request_state(request_id, Ok(RequestState::Fulfilled));
    s.pipeline
        .handle_event(&request_state_change(
            EventKind::RequestFulfilled,
            request_id,
            12,
        ))
        .await
        .unwrap();
    assert!(s.scheduler.is_armed(&request_id).await);

    // Completion is requested_at + duration = base + 100, fire at + margin.
    sleep(Duration::from_secs(300)).await;

    let entry = s.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.state, RequestState::Finished);
    assert!(!s.scheduler.is_armed(&request_id).await);

    let records = s.event_log.records().await;
    assert_eq!(records.len(), 4);
    let finished: Vec<_> = records
        .iter()
        .filter(|r| r.kind == EventKind::RequestFinished)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].timestamp, base + 100 + MARGIN_SECS);
    assert_eq!(finished[0].block_number, 12);
    assert_eq!(
        finished[0].state,
        ObservedState::Request(RequestState::Finished)
    );

    // The fired timer is gone; more time passing adds nothing.
    sleep(Duration::from_secs(300)).await;
    assert_eq!(s.event_log.len().await, 4);
}

// ==================== delivery-path convergence ====================

/// A node that catches up through a backfill pass and a node that saw every
/// event delivered directly end up with identical state and audit logs.
#[tokio::test(start_paused = true)]
async fn backfill_matches_direct_delivery() {
    let base = now_secs();
    let r1 = H256::repeat_byte(0xa1);
    let r2 = H256::repeat_byte(0xa2);
    let host = Address::repeat_byte(0x11);

    let a = stack("node-a");
    let b = stack("node-b");
    for s in [&a, &b] {
        for n in 10..=13 {
            preset_block(s, n, base + (n - 10) * 10);
        }
        s.ledger.set_request_state(r1, Ok(RequestState::New));
        s.ledger.set_request_state(r2, Ok(RequestState::New));
        s.ledger.set_host(slot_id(&r1, 0), Some(host));
    }

    // Canonical (block, log index) order of the shared history.
    let history = vec![
        requested(r1, 10, 0),
        requested(r2, 11, 0),
        slot_change(true, r1, 0, 11),
        request_state_change(EventKind::RequestFulfilled, r1, 12),
    ];

    for event in &history {
        a.ledger.add_history(event.clone());
    }
    a.pipeline.backfill().await.unwrap();

    for event in &history {
        b.pipeline.handle_event(event).await.unwrap();
    }

    // One more event past the backfill, delivered the same way to both.
    let cancel = request_state_change(EventKind::RequestCancelled, r2, 13);
    a.pipeline.handle_event(&cancel).await.unwrap();
    b.pipeline.handle_event(&cancel).await.unwrap();

    assert_eq!(
        a.registry.snapshot().await,
        b.registry.snapshot().await,
        "registries diverged"
    );
    assert_eq!(a.block_cache.snapshot().await, b.block_cache.snapshot().await);
    assert_eq!(a.event_log.records().await, b.event_log.records().await);
    assert_eq!(a.event_log.len().await, 5);

    for s in [&a, &b] {
        let entry = s.registry.get(&r1).await.unwrap();
        assert_eq!(entry.state, RequestState::Fulfilled);
        assert_eq!(entry.slots[0].provider, Some(host));
        assert!(s.scheduler.is_armed(&r1).await);
        assert!(!s.scheduler.is_armed(&r2).await);
    }
}

/// Replaying already-applied events, out of order, changes nothing: the
/// registry merge is idempotent and the audit log dedupes on the event key.
#[tokio::test(start_paused = true)]
async fn replayed_history_converges() {
    let s = stack("node-a");
    let base = now_secs();
    for n in 10..=12 {
        preset_block(&s, n, base + (n - 10) * 10);
    }
    let request_id = H256::repeat_byte(0xbb);
    s.ledger.set_request_state(request_id, Ok(RequestState::New));

    let history = vec![
        requested(request_id, 10, 0),
        slot_change(true, request_id, 0, 11),
        request_state_change(EventKind::RequestFulfilled, request_id, 12),
    ];
    for event in &history {
        s.ledger.add_history(event.clone());
    }
    s.pipeline.backfill().await.unwrap();

    let settled = s.registry.get(&request_id).await.unwrap();
    assert_eq!(s.event_log.len().await, 3);

    // Creation re-consults the ledger, which by now reports Fulfilled.
    s.ledger
        .set_request_state(request_id, Ok(RequestState::Fulfilled));

    // Same events again, newest first.
    for event in history.iter().rev() {
        s.pipeline.handle_event(event).await.unwrap();
    }

    assert_eq!(s.registry.get(&request_id).await.unwrap(), settled);
    assert_eq!(s.event_log.len().await, 3);
    assert_eq!(s.event_log.deduped().await.len(), 3);
    assert_eq!(deduped_total(&s), 3);
    assert!(s.scheduler.is_armed(&request_id).await);
}

// ==================== cancellation ====================

/// A cancellation arriving before the deadline disarms the timer; the
/// request never reaches Finished.
#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_completion_timer() {
    let s = stack("node-a");
    let base = now_secs();
    preset_block(&s, 10, base);
    preset_block(&s, 11, base + 10);

    let request_id = H256::repeat_byte(0xcc);
    s.ledger.set_request_state(request_id, Ok(RequestState::New));

    s.pipeline
        .handle_event(&requested(request_id, 10, 0))
        .await
        .unwrap();
    assert!(s.scheduler.is_armed(&request_id).await);

    sleep(Duration::from_secs(50)).await;
    s.ledger
        .set_request_state(request_id, Ok(RequestState::Cancelled));
    s.pipeline
        .handle_event(&request_state_change(
            EventKind::RequestCancelled,
            request_id,
            11,
        ))
        .await
        .unwrap();
    assert!(!s.scheduler.is_armed(&request_id).await);

    sleep(Duration::from_secs(300)).await;
    let entry = s.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.state, RequestState::Cancelled);
    assert_eq!(s.event_log.len().await, 2);
    assert!(s
        .event_log
        .records()
        .await
        .iter()
        .all(|r| r.kind != EventKind::RequestFinished));
}

// ==================== restart and resume ====================

/// Save on one stack, load on a fresh one: restored state re-arms timers and
/// the next backfill pass resumes past the persisted block watermark.
#[tokio::test(start_paused = true)]
async fn snapshot_restart_resumes_from_watermark() {
    let store = Arc::new(MemoryStore::new());
    let base = now_secs();
    let request_id = H256::repeat_byte(0xdd);
    let host = Address::repeat_byte(0x22);

    let history = vec![
        requested(request_id, 10, 0),
        slot_change(true, request_id, 0, 11),
        request_state_change(EventKind::RequestFulfilled, request_id, 12),
    ];

    let a = stack("node-a");
    for n in 10..=12 {
        preset_block(&a, n, base + (n - 10) * 10);
    }
    a.ledger.set_request_state(request_id, Ok(RequestState::New));
    a.ledger.set_host(slot_id(&request_id, 0), Some(host));
    for event in &history {
        a.ledger.add_history(event.clone());
    }
    a.pipeline.backfill().await.unwrap();
    assert_eq!(a.block_cache.max_block_number().await, Some(12));
    bridge(&a, store.clone(), "node-a").save().await.unwrap();

    // Fresh process over the same store. Its ledger has moved on by a block.
    let b = stack("node-b");
    for n in 10..=13 {
        preset_block(&b, n, base + (n - 10) * 10);
    }
    b.ledger
        .set_request_state(request_id, Ok(RequestState::Fulfilled));
    for event in &history {
        b.ledger.add_history(event.clone());
    }
    b.ledger
        .add_history(slot_change(false, request_id, 0, 13));

    let bridge_b = bridge(&b, store.clone(), "node-b");
    bridge_b.load().await.unwrap();

    let entry = b.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.state, RequestState::Fulfilled);
    assert_eq!(entry.slots[0].provider, Some(host));
    assert_eq!(b.event_log.len().await, 3);
    assert!(b.scheduler.is_armed(&request_id).await);

    b.scheduler.reconcile().await;
    b.pipeline.backfill().await.unwrap();

    // Only the block past the restored watermark was replayed.
    assert_eq!(
        b.metrics
            .events_received
            .with_label_values(&[EventKind::SlotFreed.as_str()])
            .get(),
        1
    );
    assert_eq!(
        b.metrics
            .events_received
            .with_label_values(&[EventKind::StorageRequested.as_str()])
            .get(),
        0
    );
    let entry = b.registry.get(&request_id).await.unwrap();
    assert_eq!(entry.slots[0].state, SlotState::Free);
    assert_eq!(entry.slots[0].provider, None);
    assert_eq!(b.event_log.len().await, 4);
    assert_eq!(b.block_cache.max_block_number().await, Some(13));
    assert!(b.scheduler.is_armed(&request_id).await);
}
