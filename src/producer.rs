// src/producer.rs
//
// §4.F Ranker & Producer: the tick-based queue scheduler. Grounded on the
// teacher's `MarketplaceCoordinator` tick/rank loop in `marketplace.rs`,
// generalized from "rank jobs for worker assignment" to "rank queues for
// probe eligibility" — the Fisher-Yates tie-break borrowed from the same
// fairness concern as `workflow.rs`'s `recalculate_priorities` traversal.

use crate::backoff::BackoffCache;
use crate::lifecycle::{permits_probe, LifecycleState};
use crate::probe::{Probe, ProbeSender};
use crate::registry::Registry;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const TICK_PERIOD: Duration = Duration::from_secs(5);
const STAGE2_DEADLINE: Duration = Duration::from_secs(2);
const STAGE2_TIMEOUT_BACKOFF: Duration = Duration::from_secs(5);
const SILENCE_WARNING_AFTER: Duration = Duration::from_secs(60 * 60);
const SILENCE_REARM: Duration = Duration::from_secs(10 * 60);

/// One dedicated task per §5's scheduling model. Holds no reference to the
/// Consumer beyond the probe channel's send half (§9's cyclic-reference
/// redesign flag).
pub struct Producer {
    registry: Arc<Registry>,
    backoff: Arc<BackoffCache>,
    probes: ProbeSender,
    lifecycle: watch::Receiver<LifecycleState>,
}

impl Producer {
    pub fn new(
        registry: Arc<Registry>,
        backoff: Arc<BackoffCache>,
        probes: ProbeSender,
        lifecycle: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self { registry, backoff, probes, lifecycle }
    }

    /// Ticks every `TICK_PERIOD` until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        let mut warn_deadline = Instant::now() + SILENCE_WARNING_AFTER;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await {
                        warn_deadline = Instant::now() + SILENCE_WARNING_AFTER;
                    } else {
                        self.maybe_warn_silence(&mut warn_deadline);
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

    /// One tick of §4.F. Returns `true` exactly when Stage 2 succeeded, so
    /// `run` can reset the 1-hour silence timer.
    async fn tick(&self) -> bool {
        if !permits_probe(&self.lifecycle) {
            return false;
        }

        // Step 1: snapshot, shuffle, then a stable sort by inFlightCount —
        // the prior shuffle is what makes the sort's tie order effectively
        // uniform random instead of snapshot-insertion order.
        let mut ranked = self.registry.snapshot();
        let mut rng = rand::rng();
        ranked.shuffle(&mut rng);
        ranked.sort_by_key(|s| s.in_flight_count);

        // Step 2.
        let candidate = ranked.into_iter().find(|s| s.is_idle() && !self.backoff.get(&s.fingerprint));
        let Some(candidate) = candidate else {
            return false;
        };

        // Step 3, Stage 1.
        if !self.probes.consumer_is_ready() {
            return false;
        }

        // Step 3, Stage 2.
        let probe = Probe { fingerprint: candidate.fingerprint.clone(), resource_hint: candidate.resource_hint };
        match self.probes.send_with_deadline(probe, STAGE2_DEADLINE).await {
            Ok(()) => true,
            Err(()) => {
                self.backoff.set(candidate.fingerprint, STAGE2_TIMEOUT_BACKOFF);
                false
            }
        }
    }

    fn maybe_warn_silence(&self, warn_deadline: &mut Instant) {
        let now = Instant::now();
        if now >= *warn_deadline {
            log::warn!("no probe has been accepted in over an hour; queues may be starved or brokers unreachable");
            *warn_deadline = now + SILENCE_REARM;
        }
    }
}
