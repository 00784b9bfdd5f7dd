// src/failures.rs
//
// Per-fingerprint consecutive broker-RPC-failure counter. Grounded on the
// same Mutex-guarded keyed-map shape as `busy.rs`/`backoff.rs`, feeding
// `RunnerError::doubled_broker_backoff`'s exponent (§7: "doubled per
// consecutive failure").

use crate::model::Fingerprint;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct FailureCounter {
    counts: Mutex<HashMap<Fingerprint, u32>>,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self { counts: Mutex::new(HashMap::new()) }
    }

    /// Records one more consecutive failure for `key` and returns how many
    /// had already accumulated before this one (0 on the first failure) —
    /// the exponent `RunnerError::doubled_broker_backoff` expects.
    pub fn record_failure(&self, key: &Fingerprint) -> u32 {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(key.clone()).or_insert(0);
        let prior = *entry;
        *entry = entry.saturating_add(1);
        prior
    }

    /// Clears the streak for `key` after a successful `Work` call.
    pub fn reset(&self, key: &Fingerprint) {
        self.counts.lock().unwrap().remove(key);
    }
}

impl Default for FailureCounter {
    fn default() -> Self {
        Self::new()
    }
}
