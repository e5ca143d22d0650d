// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

use ethers::types::H256;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shortens a hex string for display: `0x1234...abcd`.
pub fn short_hex(hex: &str) -> String {
    let stripped = hex.strip_prefix("0x").unwrap_or(hex);
    if stripped.len() > 8 {
        format!(
            "0x{}...{}",
            &stripped[..4],
            &stripped[stripped.len() - 4..]
        )
    } else {
        hex.to_string()
    }
}

/// Display form of a request/slot id for logs.
pub fn short_id(id: &H256) -> String {
    short_hex(&format!("{:#x}", id))
}

/// Current wall-clock time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds, used for sync fencing tokens.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
