// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

use ethers::abi::Token;
use ethers::types::Address;
use ethers::types::H256;
use ethers::types::U256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Ledger-assigned identifier of a storage request.
pub type RequestId = H256;
/// Derived identifier of one slot of a request, see [`slot_id`].
pub type SlotId = H256;

/// Terms a client attached to a storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAsk {
    pub slot_count: u64,
    pub slot_size: U256,
    /// Requested storage duration in seconds.
    pub duration: u64,
    pub proof_probability: U256,
    /// Reward per slot per second.
    pub reward: U256,
    pub collateral: U256,
    pub max_slot_loss: u64,
}

impl StorageAsk {
    /// Total price of the request over its full duration across all slots.
    pub fn total_price(&self) -> U256 {
        self.reward * U256::from(self.duration) * U256::from(self.slot_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageContent {
    pub cid: String,
    pub merkle_root: H256,
}

/// Full on-chain request record as returned by the ledger's detail query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub client: Address,
    pub ask: StorageAsk,
    pub content: StorageContent,
    pub expiry: u64,
    pub nonce: H256,
}

/// Ledger request lifecycle. Numeric values match the ledger's state index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    New,
    Fulfilled,
    Cancelled,
    Finished,
    Failed,
}

impl RequestState {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(RequestState::New),
            1 => Some(RequestState::Fulfilled),
            2 => Some(RequestState::Cancelled),
            3 => Some(RequestState::Finished),
            4 => Some(RequestState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Cancelled | RequestState::Finished | RequestState::Failed
        )
    }

    /// Allowed transitions: New may be fulfilled, cancelled or failed;
    /// Fulfilled may finish or fail; terminal states absorb.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        match self {
            RequestState::New => matches!(
                next,
                RequestState::Fulfilled | RequestState::Cancelled | RequestState::Failed
            ),
            RequestState::Fulfilled => {
                matches!(next, RequestState::Finished | RequestState::Failed)
            }
            RequestState::Cancelled | RequestState::Finished | RequestState::Failed => false,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::New => "New",
            RequestState::Fulfilled => "Fulfilled",
            RequestState::Cancelled => "Cancelled",
            RequestState::Finished => "Finished",
            RequestState::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Ledger slot lifecycle. Numeric values match the ledger's state index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    Filled,
    Finished,
    Failed,
    Paid,
    Cancelled,
}

impl SlotState {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Filled),
            2 => Some(SlotState::Finished),
            3 => Some(SlotState::Failed),
            4 => Some(SlotState::Paid),
            5 => Some(SlotState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::Free => "Free",
            SlotState::Filled => "Filled",
            SlotState::Finished => "Finished",
            SlotState::Failed => "Failed",
            SlotState::Paid => "Paid",
            SlotState::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Moderation tag decided by an external actor; stored and relayed only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ModerationStatus {
    #[default]
    Pending,
    Approved,
    Banned,
}

/// One capacity unit of a request as known locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub slot_id: SlotId,
    pub slot_index: u64,
    pub state: SlotState,
    pub provider: Option<Address>,
    pub missed_proofs: Option<u64>,
}

impl SlotEntry {
    pub fn new(request_id: &RequestId, slot_index: u64) -> Self {
        Self {
            slot_id: slot_id(request_id, slot_index),
            slot_index,
            state: SlotState::Free,
            provider: None,
            missed_proofs: None,
        }
    }
}

/// Locally cached view of one request. Fields arrive from different sources
/// at different times, so everything beyond the id is optional until learned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub request_id: RequestId,
    pub client: Option<Address>,
    pub ask: Option<StorageAsk>,
    pub content: Option<StorageContent>,
    pub expiry: Option<u64>,
    pub nonce: Option<H256>,
    pub state: RequestState,
    /// Block timestamp of the creation event, once resolved.
    pub requested_at: Option<u64>,
    pub moderation: ModerationStatus,
    pub slots: Vec<SlotEntry>,
    /// True once client/content/nonce were fetched from the ledger.
    pub details_fetched: bool,
    /// True once per-slot ledger state was fetched at least once.
    pub slots_fetched: bool,
}

impl RequestEntry {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            client: None,
            ask: None,
            content: None,
            expiry: None,
            nonce: None,
            state: RequestState::New,
            requested_at: None,
            moderation: ModerationStatus::default(),
            slots: Vec::new(),
            details_fetched: false,
            slots_fetched: false,
        }
    }

    /// Grows the slot list to `slot_count` entries, defaulting new ones to
    /// Free. Existing entries are kept untouched.
    pub fn ensure_slots(&mut self, slot_count: u64) {
        for slot_index in self.slots.len() as u64..slot_count {
            let entry = SlotEntry::new(&self.request_id, slot_index);
            self.slots.push(entry);
        }
    }

    /// Mutable access to a slot, growing the list when the index exceeds
    /// current knowledge (events can reference slots we have not sized yet).
    pub fn slot_mut(&mut self, slot_index: u64) -> &mut SlotEntry {
        if slot_index >= self.slots.len() as u64 {
            self.ensure_slots(slot_index + 1);
        }
        &mut self.slots[slot_index as usize]
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Predicted completion time: creation timestamp plus the asked duration.
    /// None until both are known.
    pub fn completion_time(&self) -> Option<u64> {
        let requested_at = self.requested_at?;
        let ask = self.ask.as_ref()?;
        Some(requested_at + ask.duration)
    }
}

/// Block metadata memoized per block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    pub number: u64,
    pub timestamp: u64,
}

/// Derives the ledger-compatible slot id: keccak256 of the ABI encoding of
/// the static tuple (bytes32 requestId, uint256 slotIndex), i.e. the 32
/// request-id bytes followed by the 32-byte big-endian slot index.
pub fn slot_id(request_id: &RequestId, slot_index: u64) -> SlotId {
    let encoded = ethers::abi::encode(&[Token::Tuple(vec![
        Token::FixedBytes(request_id.as_bytes().to_vec()),
        Token::Uint(U256::from(slot_index)),
    ])]);
    H256(keccak256(encoded))
}
