// src/lease.rs
//
// §4.H Lease Extender: a supervised task bound to one `Work` invocation
// that renews a message's visibility/lease at half-period cadence.
// Structured as a child of the call that spawned it (§9 "Lease extender as
// a supervised sub-task") — `LeaseExtender::stop` joins the task so the
// caller knows renewal has fully ceased before it publishes the terminal
// ack, per §4.B's "renewer MUST stop before the handler result is
// published" rule.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type ExtendFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct LeaseExtender {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LeaseExtender {
    /// Spawns a task that calls `extend` every `lease_window / 2` until
    /// stopped or cancelled. A missed extension is logged and non-fatal —
    /// the message simply becomes redeliverable (§4.H).
    pub fn spawn(lease_window: Duration, extend: ExtendFn) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = lease_window / 2;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {
                        if let Err(e) = extend().await {
                            log::warn!("lease extension failed (non-fatal): {}", e);
                        }
                    }
                }
            }
        });
        Self { stop_tx: Some(stop_tx), task }
    }

    /// Signals the renewer to stop and waits for it to actually exit.
    /// Must be awaited before the caller publishes ack/nack (§4.B).
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
