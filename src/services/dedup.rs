//! Deduplicator: time-windowed set of accepted signal hashes, kept in an
//! injected store so every service instance sees the same history.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::constants::keys;
use crate::data::store::KeyValueStore;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
}

/// Capability the pipeline gates on.
pub trait DedupStore: Send + Sync {
    /// Atomically check `signal_hash` and record it if unseen.
    fn check_and_mark(&self, signal_hash: &str) -> Result<DedupOutcome, StoreError>;

    /// Drop entries older than the window. Returns how many were evicted.
    fn sweep(&self) -> Result<usize, StoreError>;
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn KeyValueStore>,
    window: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn KeyValueStore>, window_hours: u64) -> Self {
        Self {
            store,
            window: Duration::hours(window_hours as i64),
        }
    }

    fn key(signal_hash: &str) -> String {
        format!("{}{}", keys::DEDUP, signal_hash)
    }

    fn is_expired(&self, marked_at: &str, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(marked_at.trim()) {
            Ok(ts) => now.signed_duration_since(ts.with_timezone(&Utc)) >= self.window,
            // A half-written entry from a concurrent insert is still live.
            Err(_) => false,
        }
    }

    pub fn check_and_mark_at(&self, signal_hash: &str, now: DateTime<Utc>) -> Result<DedupOutcome, StoreError> {
        let key = Self::key(signal_hash);
        let stamp = now.to_rfc3339();

        if self.store.insert_if_absent(&key, &stamp)? {
            debug!("[DEDUP] Marked {}", &signal_hash[..signal_hash.len().min(12)]);
            return Ok(DedupOutcome { is_duplicate: false });
        }

        // An expired mark is only replaced while it still holds the stamp we
        // read, so two late arrivals cannot both win it.
        match self.store.get(&key)? {
            Some(marked_at) if self.is_expired(&marked_at, now) => {
                if self.store.compare_and_swap(&key, &marked_at, Some(&stamp))? {
                    debug!("[DEDUP] Re-marked expired {}", &signal_hash[..signal_hash.len().min(12)]);
                    return Ok(DedupOutcome { is_duplicate: false });
                }
            }
            Some(_) => {}
            // Swept between our insert and read.
            None => {
                if self.store.insert_if_absent(&key, &stamp)? {
                    return Ok(DedupOutcome { is_duplicate: false });
                }
            }
        }

        warn!("[DEDUP] Duplicate signal {}", &signal_hash[..signal_hash.len().min(12)]);
        Ok(DedupOutcome { is_duplicate: true })
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut evicted = 0;
        for key in self.store.list(keys::DEDUP)? {
            if let Some(marked_at) = self.store.get(&key)? {
                if self.is_expired(&marked_at, now) && self.store.compare_and_swap(&key, &marked_at, None)? {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            info!("[DEDUP] Evicted {} expired hashes", evicted);
        }
        Ok(evicted)
    }
}

impl DedupStore for Deduplicator {
    fn check_and_mark(&self, signal_hash: &str) -> Result<DedupOutcome, StoreError> {
        self.check_and_mark_at(signal_hash, Utc::now())
    }

    fn sweep(&self) -> Result<usize, StoreError> {
        self.sweep_at(Utc::now())
    }
}
