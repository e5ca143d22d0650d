// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for unit and end-to-end tests.

use std::sync::Once;

use ethers::types::{Address, H256, U256};

use crate::types::{StorageAsk, StorageContent, StorageRequest};

static TRACING: Once = Once::new();

/// Installs a tracing subscriber once per test process. Honors `RUST_LOG`;
/// defaults to `info`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// An ask with plausible terms; only the shape that tests assert on
/// (slot count, duration) is parameterized.
pub fn sample_ask(slot_count: u64, duration: u64) -> StorageAsk {
    StorageAsk {
        slot_count,
        slot_size: U256::from(1u64 << 30),
        duration,
        proof_probability: U256::from(4),
        reward: U256::from(84),
        collateral: U256::from(200),
        max_slot_loss: 2,
    }
}

/// A full on-chain request record around [`sample_ask`].
pub fn sample_request(slot_count: u64, duration: u64) -> StorageRequest {
    StorageRequest {
        client: Address::repeat_byte(0x01),
        ask: sample_ask(slot_count, duration),
        content: StorageContent {
            cid: "zDvZRwzkvvqV".to_string(),
            merkle_root: H256::repeat_byte(0x02),
        },
        expiry: 50,
        nonce: H256::repeat_byte(0x03),
    }
}
