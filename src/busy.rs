// src/busy.rs
//
// Mutex-guarded set guaranteeing at-most-one in-flight probe per
// Fingerprint on this node (§3 invariant 1). Grounded on the teacher's
// `NodeGuardian` claim-before-work shape, generalized from a `Semaphore`
// permit to a keyed test-and-set since this system needs per-queue
// exclusivity rather than a single global concurrency limit.

use crate::model::Fingerprint;
use std::collections::HashSet;
use std::sync::Mutex;

pub struct BusySet {
    claimed: Mutex<HashSet<Fingerprint>>,
}

impl BusySet {
    pub fn new() -> Self {
        Self { claimed: Mutex::new(HashSet::new()) }
    }

    /// Test-and-set. Returns `true` if this call claimed the key, `false`
    /// if it was already claimed.
    pub fn try_claim(&self, key: Fingerprint) -> bool {
        self.claimed.lock().unwrap().insert(key)
    }

    /// Unconditional remove; safe to call even if the key was never
    /// claimed (e.g. a defensive release on an early-return path).
    pub fn release(&self, key: &Fingerprint) {
        self.claimed.lock().unwrap().remove(key);
    }

    pub fn is_claimed(&self, key: &Fingerprint) -> bool {
        self.claimed.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.claimed.lock().unwrap().len()
    }
}

impl Default for BusySet {
    fn default() -> Self {
        Self::new()
    }
}
