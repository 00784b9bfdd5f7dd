// src/backoff.rs
//
// Short-TTL negative cache of Fingerprints that must not be polled. A
// background sweep every 10s drops expired entries so the map doesn't grow
// unbounded across a long-running process; `get` also lazily treats an
// expired entry as absent without waiting for the sweep.

use crate::model::Fingerprint;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct BackoffCache {
    entries: Mutex<HashMap<Fingerprint, Instant>>,
}

impl BackoffCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn set(&self, key: Fingerprint, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().unwrap().insert(key, expires_at);
    }

    pub fn set_default(&self, key: Fingerprint) {
        self.set(key, DEFAULT_TTL);
    }

    /// True if `key` is present and not yet expired.
    pub fn get(&self, key: &Fingerprint) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(expires_at) => *expires_at > Instant::now(),
            None => false,
        }
    }

    /// Drops every entry whose TTL has elapsed. Intended to run on a
    /// `SWEEP_INTERVAL` tick from a dedicated task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, expires_at| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for BackoffCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `BackoffCache::sweep` on `SWEEP_INTERVAL` until `ctx` is cancelled.
pub async fn run_sweeper(cache: std::sync::Arc<BackoffCache>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => cache.sweep(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
