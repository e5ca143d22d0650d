// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Append-only memo of block metadata to avoid repeated RPC lookups.
//!
//! Block number and timestamp never change for a given hash, so entries
//! are cached forever. The highest memoized block number doubles as the
//! backfill watermark: a block is only inserted after the events it
//! carries were applied.

use crate::error::IndexerResult;
use crate::ledger_client::LedgerClient;
use crate::types::BlockPointer;
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct BlockCache {
    blocks: RwLock<HashMap<H256, BlockPointer>>,
    /// Number of cache hits
    hits: AtomicU64,
    /// Number of cache misses
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached pointer for a block hash, if already memoized.
    pub async fn get(&self, block_hash: &H256) -> Option<BlockPointer> {
        let blocks = self.blocks.read().await;
        match blocks.get(block_hash) {
            Some(pointer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(*pointer)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, block_hash: H256, pointer: BlockPointer) {
        let mut blocks = self.blocks.write().await;
        blocks.insert(block_hash, pointer);
    }

    /// Returns the memoized pointer or fetches it from the ledger and
    /// memoizes it. The insert is what advances the backfill watermark,
    /// so callers resolve only after applying the block's events.
    pub async fn resolve(
        &self,
        ledger: &dyn LedgerClient,
        block_hash: H256,
    ) -> IndexerResult<BlockPointer> {
        if let Some(pointer) = self.get(&block_hash).await {
            return Ok(pointer);
        }
        let pointer = ledger.get_block(&block_hash).await?;
        self.insert(block_hash, pointer).await;
        Ok(pointer)
    }

    /// Highest block number seen so far; `None` when the cache is empty.
    pub async fn max_block_number(&self) -> Option<u64> {
        let blocks = self.blocks.read().await;
        blocks.values().map(|p| p.number).max()
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn snapshot(&self) -> HashMap<H256, BlockPointer> {
        self.blocks.read().await.clone()
    }

    pub async fn restore(&self, blocks: HashMap<H256, BlockPointer>) {
        let mut guard = self.blocks.write().await;
        *guard = blocks;
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
