// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Events observed on the marketplace ledger.
//!
//! These are pure data and can be consumed by the ingestion pipeline
//! without coupling to any particular transport.

use crate::types::{ModerationStatus, RequestId, RequestState, SlotState, StorageAsk};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of marketplace events. All but `RequestFinished` are emitted by the
/// ledger; `RequestFinished` only ever originates from the local completion
/// scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StorageRequested,
    RequestFulfilled,
    RequestCancelled,
    RequestFailed,
    SlotFilled,
    SlotFreed,
    RequestFinished,
}

/// The event kinds the ledger actually emits, in subscription order.
pub const LEDGER_EVENT_KINDS: [EventKind; 6] = [
    EventKind::StorageRequested,
    EventKind::RequestFulfilled,
    EventKind::RequestCancelled,
    EventKind::RequestFailed,
    EventKind::SlotFilled,
    EventKind::SlotFreed,
];

impl EventKind {
    /// Stable name, also used as the metric label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StorageRequested => "StorageRequested",
            EventKind::RequestFulfilled => "RequestFulfilled",
            EventKind::RequestCancelled => "RequestCancelled",
            EventKind::RequestFailed => "RequestFailed",
            EventKind::SlotFilled => "SlotFilled",
            EventKind::SlotFreed => "SlotFreed",
            EventKind::RequestFinished => "RequestFinished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decoded ledger event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketplaceEvent {
    /// A client posted a new request. Carries the ask and expiry so the
    /// request can be materialized without an immediate detail fetch.
    StorageRequested {
        request_id: RequestId,
        ask: StorageAsk,
        expiry: u64,
    },
    /// All slots filled; the request is being served.
    RequestFulfilled { request_id: RequestId },
    /// The client cancelled before fulfillment.
    RequestCancelled { request_id: RequestId },
    /// Too many slots were lost; the request failed.
    RequestFailed { request_id: RequestId },
    /// A provider filled one slot.
    SlotFilled { request_id: RequestId, slot_index: u64 },
    /// A previously filled slot was released.
    SlotFreed { request_id: RequestId, slot_index: u64 },
}

impl MarketplaceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MarketplaceEvent::StorageRequested { .. } => EventKind::StorageRequested,
            MarketplaceEvent::RequestFulfilled { .. } => EventKind::RequestFulfilled,
            MarketplaceEvent::RequestCancelled { .. } => EventKind::RequestCancelled,
            MarketplaceEvent::RequestFailed { .. } => EventKind::RequestFailed,
            MarketplaceEvent::SlotFilled { .. } => EventKind::SlotFilled,
            MarketplaceEvent::SlotFreed { .. } => EventKind::SlotFreed,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            MarketplaceEvent::StorageRequested { request_id, .. }
            | MarketplaceEvent::RequestFulfilled { request_id }
            | MarketplaceEvent::RequestCancelled { request_id }
            | MarketplaceEvent::RequestFailed { request_id }
            | MarketplaceEvent::SlotFilled { request_id, .. }
            | MarketplaceEvent::SlotFreed { request_id, .. } => *request_id,
        }
    }

    pub fn slot_index(&self) -> Option<u64> {
        match self {
            MarketplaceEvent::SlotFilled { slot_index, .. }
            | MarketplaceEvent::SlotFreed { slot_index, .. } => Some(*slot_index),
            _ => None,
        }
    }
}

/// Where on the ledger an event was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub block_number: u64,
    pub block_hash: H256,
    /// Log index within the block, used to order events of the same block.
    pub log_index: u64,
}

/// One event as delivered by the ledger: decoded payload plus placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event: MarketplaceEvent,
    pub meta: EventMeta,
}

/// Entity state snapshot carried by an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedState {
    Request(RequestState),
    Slot(SlotState),
}

/// Composite identity of an audit record. Two deliveries of the same ledger
/// event produce the same key.
pub type EventKey = (EventKind, u64, RequestId, Option<u64>);

/// Immutable audit log entry, appended once per observed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub block_number: u64,
    pub request_id: RequestId,
    pub slot_index: Option<u64>,
    pub state: ObservedState,
    /// Block timestamp for ledger events, predicted completion time for
    /// synthetic `RequestFinished` records.
    pub timestamp: u64,
    pub moderation: ModerationStatus,
}

impl EventRecord {
    pub fn key(&self) -> EventKey {
        (self.kind, self.block_number, self.request_id, self.slot_index)
    }
}
