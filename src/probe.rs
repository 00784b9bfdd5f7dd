// src/probe.rs
//
// The rendezvous channel connecting Producer to Consumer (§4.F/§4.G): one
// unbuffered hop so neither side holds a reference to the other (§9's
// cyclic-reference redesign flag — replace with message-passing). Tokio's
// `mpsc` refuses a zero-capacity buffer, so true rendezvous is modeled as
// a capacity-1 channel paired with an atomic "receiver is parked on recv"
// flag: Stage 1 reads the flag instead of touching the channel at all,
// which is what keeps an unconsumed probe from ever sitting in the buffer.

use crate::model::{Fingerprint, Resource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// A scheduler-internal message asking the Consumer to attempt one `Work`
/// call on a queue (§10 glossary).
pub struct Probe {
    pub fingerprint: Fingerprint,
    pub resource_hint: Option<Resource>,
}

pub struct ProbeSender {
    tx: mpsc::Sender<Probe>,
    consumer_ready: Arc<AtomicBool>,
}

pub struct ProbeReceiver {
    rx: mpsc::Receiver<Probe>,
    consumer_ready: Arc<AtomicBool>,
}

pub fn channel() -> (ProbeSender, ProbeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    let consumer_ready = Arc::new(AtomicBool::new(false));
    (
        ProbeSender { tx, consumer_ready: consumer_ready.clone() },
        ProbeReceiver { rx, consumer_ready },
    )
}

impl ProbeSender {
    /// Stage 1 (§4.F): a non-blocking liveness check. `true` means the
    /// consumer is parked in `recv` and Stage 2 may proceed; `false` means
    /// it is still busy with a prior probe, and this tick should abort
    /// without penalizing an innocent queue.
    pub fn consumer_is_ready(&self) -> bool {
        self.consumer_ready.load(Ordering::SeqCst)
    }

    /// Stage 2: the real probe, bounded by a deadline. `Ok(())` means the
    /// consumer accepted it; `Err(())` (timeout, or the receiver dropped)
    /// means the caller should install a short back-off instead.
    pub async fn send_with_deadline(&self, probe: Probe, deadline: Duration) -> Result<(), ()> {
        match timeout(deadline, self.tx.send(probe)).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(()),
        }
    }
}

impl ProbeReceiver {
    /// Marks this receiver ready-and-waiting for the lifetime of the
    /// `recv` call, so a concurrent Stage 1 check observes it accurately.
    pub async fn recv(&mut self) -> Option<Probe> {
        self.consumer_ready.store(true, Ordering::SeqCst);
        let probe = self.rx.recv().await;
        self.consumer_ready.store(false, Ordering::SeqCst);
        probe
    }
}
