// Copyright (c) Storage Marketplace Contributors
// SPDX-License-Identifier: Apache-2.0

//! Local view of an on-chain storage marketplace: ingests contract events,
//! maintains per-request and per-slot state, predicts request completion
//! with wall-clock timers and keeps a deduplicated audit log, with snapshot
//! persistence for restarts and multi-process sync.

pub mod block_cache;
pub mod config;
pub mod error;
pub mod event_log;
pub mod events;
pub mod ledger_client;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod mock_ledger;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
pub mod e2e_tests;

#[macro_export]
macro_rules! retry_transient {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retriable() => {
                        tracing::debug!("Retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
