// src/lifecycle.rs
//
// §4.J Lifecycle Gate: consumes an external `{Running, Drain, Suspended}`
// signal and globally suspends new probes without interrupting in-flight
// work. Grounded on the teacher's `AtomicBool` shutdown-flag pattern in
// `main.rs::run_node_service`, generalized from a binary flag to a
// tri-state `tokio::sync::watch` channel (§9.1: the watch channel stands in
// for whatever transport the external cluster controller actually uses).

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Drain,
    Suspended,
}

pub struct LifecycleGate {
    tx: watch::Sender<LifecycleState>,
}

impl LifecycleGate {
    pub fn new(initial: LifecycleState) -> (Self, watch::Receiver<LifecycleState>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Called by whatever collaborator observes the external controller's
    /// state stream (out of scope here; §9.1).
    pub fn transition(&self, next: LifecycleState) {
        let _ = self.tx.send(next);
    }
}

/// Producer-side check: only `Running` permits a new probe this tick.
pub fn permits_probe(rx: &watch::Receiver<LifecycleState>) -> bool {
    *rx.borrow() == LifecycleState::Running
}
