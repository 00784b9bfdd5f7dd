// src/dispatcher.rs
//
// §4.G Consumer / Dispatcher: the single long-lived receiver on the probe
// channel. Wires the Back-off Cache, Busy Set, Resource Ledger, Queue
// Adapter and Processor Facade together for one message. Grounded on the
// teacher's `NodeGuardian` admit-then-run shape in `guardian.rs`: check
// eligibility, claim, execute, always release.
//
// Claiming a fingerprint (Step 2) reserves its Resource Ledger hint (Step 3)
// and marks the Subscription in-flight, both undone in the Step 7 release
// path alongside the Busy Set release; a failed `Work` call tracks its own
// consecutive-failure streak via `FailureCounter` to drive the broker-timeout
// back-off's doubling policy (§7).

use crate::backoff::BackoffCache;
use crate::busy::BusySet;
use crate::errors::RunnerError;
use crate::failures::FailureCounter;
use crate::ledger::Ledger;
use crate::model::{Fingerprint, Request};
use crate::probe::ProbeReceiver;
use crate::processor::{LifecycleSignal, Processor};
use crate::queue::{Credentials, HandlerOutcome, QueueHandler, QueueTask, TaskQueue};
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SUCCESS_DEFENSIVE_BACKOFF: Duration = Duration::from_secs(1);
const RESOURCE_MISMATCH_BACKOFF: Duration = Duration::from_secs(60);
const MALFORMED_BACKOFF: Duration = Duration::from_secs(1);

/// One dedicated task per §5's scheduling model. Generic over the broker
/// adapter so a real deployment wires in whichever `TaskQueue` matches its
/// queue URL's shape (§6) without the Dispatcher itself caring which.
pub struct Dispatcher<Q: TaskQueue> {
    registry: Arc<Registry>,
    backoff: Arc<BackoffCache>,
    busy: Arc<BusySet>,
    ledger: Arc<Ledger>,
    adapter: Arc<Q>,
    processor: Arc<dyn Processor>,
    project: String,
    queue_type: &'static str,
    credentials: Credentials,
    failures: FailureCounter,
}

impl<Q: TaskQueue + 'static> Dispatcher<Q> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        backoff: Arc<BackoffCache>,
        busy: Arc<BusySet>,
        ledger: Arc<Ledger>,
        adapter: Arc<Q>,
        processor: Arc<dyn Processor>,
        project: impl Into<String>,
        queue_type: &'static str,
        credentials: Credentials,
    ) -> Self {
        Self {
            registry,
            backoff,
            busy,
            ledger,
            adapter,
            processor,
            project: project.into(),
            queue_type,
            credentials,
            failures: FailureCounter::new(),
        }
    }

    /// Runs until `shutdown` fires or the Producer's send half is dropped.
    pub async fn run(&self, mut probes: ProbeReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe_probe = probes.recv() => {
                    match maybe_probe {
                        Some(probe) => self.handle(probe.fingerprint).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One probe, §4.G steps 1-7.
    async fn handle(&self, fingerprint: Fingerprint) {
        // Step 1.
        if self.backoff.get(&fingerprint) {
            return;
        }

        // Step 2.
        if !self.busy.try_claim(fingerprint.clone()) {
            return;
        }
        self.registry.set_in_flight(&fingerprint, 1);

        // Step 3: reserve whatever the Subscription's resourceHint asks for
        // against the Resource Ledger. No hint yet (first contact with this
        // queue) reserves nothing, matching the old read-only check's
        // behavior; a hint that no longer fits installs the mismatch
        // back-off and gives back everything Step 2 claimed.
        let need = self
            .registry
            .snapshot()
            .into_iter()
            .find(|s| s.fingerprint == fingerprint)
            .and_then(|s| s.resource_hint);
        let grant = match need {
            Some(need) => match self.ledger.try_reserve(&need) {
                Some(grant) => Some(grant),
                None => {
                    self.backoff.set(fingerprint.clone(), RESOURCE_MISMATCH_BACKOFF);
                    self.registry.set_in_flight(&fingerprint, 0);
                    self.busy.release(&fingerprint);
                    return;
                }
            },
            None => None,
        };

        // Step 4: re-check Back-off per §4.D ("dispatcher consults before
        // invoking Work ... and again after Work returns"); this is the
        // "before" half, closing the race against a concurrent Set.
        if self.backoff.get(&fingerprint) {
            if let Some(grant) = grant {
                self.ledger.release(grant);
            }
            self.registry.set_in_flight(&fingerprint, 0);
            self.busy.release(&fingerprint);
            return;
        }

        let task = QueueTask {
            fq_project: format!("{}/{}", self.project, fingerprint.queue),
            project: self.project.clone(),
            queue_type: self.queue_type,
            subscription: fingerprint.queue.clone(),
            credentials: self.credentials.clone(),
        };

        let handler = self.build_handler(fingerprint.clone());
        if let Err(e) = self.adapter.work(task, handler).await {
            let consecutive = self.failures.record_failure(&fingerprint);
            let backoff_duration = RunnerError::doubled_broker_backoff(consecutive);
            let broker_err = RunnerError::BrokerTimeout(backoff_duration);
            log::warn!("{} for {} (root cause: {})", broker_err, fingerprint, e);
            self.backoff.set(fingerprint.clone(), backoff_duration);
        } else {
            self.failures.reset(&fingerprint);
        }

        // Step 7.
        if let Some(grant) = grant {
            self.ledger.release(grant);
        }
        self.registry.set_in_flight(&fingerprint, 0);
        self.busy.release(&fingerprint);
    }

    /// Builds the closure handed to `TaskQueue::work`, implementing §4.G
    /// steps 5a-5d and the step-6 translation, all of which must land
    /// before `work` can publish its ack/nack.
    fn build_handler(&self, key: Fingerprint) -> QueueHandler {
        let registry = self.registry.clone();
        let processor = self.processor.clone();
        let backoff = self.backoff.clone();

        Box::new(move |body: Vec<u8>| {
            let registry = registry.clone();
            let processor = processor.clone();
            let backoff = backoff.clone();
            let key = key.clone();
            Box::pin(async move {
                // 5a.
                let request = match Request::parse(&body) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("malformed message on {}: {}", key, e);
                        backoff.set(key, MALFORMED_BACKOFF);
                        return HandlerOutcome { resource: None, ack: true };
                    }
                };

                // 5b.
                let resource = request.experiment.resource;
                registry.update_resource_hint(&key, resource);

                // 5c.
                let (_tx, lifecycle_rx) = watch::channel::<Option<LifecycleSignal>>(None);
                let outcome = processor.process(&request, &[], lifecycle_rx).await;

                // 5d, folded together with the step-6 translate so it lands
                // strictly before the adapter's own ack/nack call.
                match outcome.error {
                    None => {
                        backoff.set(key, SUCCESS_DEFENSIVE_BACKOFF);
                        HandlerOutcome { resource: Some(resource), ack: true }
                    }
                    Some(err) => {
                        log::warn!("processing failed for {}: {}", key, err);
                        if let Some(duration) = outcome.backoff {
                            backoff.set(key, duration);
                        }
                        HandlerOutcome { resource: Some(resource), ack: outcome.ack }
                    }
                }
            })
        })
    }
}
