// tests/scheduler_scenarios.rs
//
// End-to-end scheduling scenarios driving the real Producer/Dispatcher pair
// against a fake in-memory `TaskQueue`, built only for these tests. Uses
// `tokio::time::pause` so the Producer's real 5-second tick period advances
// in virtual time instead of real wall-clock time — S6 alone drives 300
// ticks, which would otherwise make this file the slowest thing in the
// suite by a wide margin.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use taskdrain::backoff::BackoffCache;
use taskdrain::busy::BusySet;
use taskdrain::lifecycle::{LifecycleGate, LifecycleState};
use taskdrain::model::{Config, Experiment, Fingerprint, Request, Resource};
use taskdrain::processor::{LifecycleSignal, ProcessOutcome, Processor};
use taskdrain::queue::{Credentials, HandlerOutcome, QueueHandler, QueueTask, TaskQueue, WorkResult};
use taskdrain::registry::Registry;
use taskdrain::{Dispatcher, Ledger, Producer};

const TICK_PERIOD: Duration = taskdrain::producer::TICK_PERIOD;

/// Drives `TaskQueue::work` from an in-memory queue of message bodies. Each
/// call to `work` pops the front of the queue (if any) and hands it to the
/// caller-supplied handler, recording the outcome's ack flag and which
/// subscription was touched.
struct FakeAdapter {
    names: Mutex<Vec<String>>,
    bodies: Mutex<VecDeque<Vec<u8>>>,
    calls: AtomicUsize,
    acks: Mutex<Vec<bool>>,
    calls_by_queue: Mutex<HashMap<String, u32>>,
}

impl FakeAdapter {
    fn new(names: &[&str]) -> Self {
        Self {
            names: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
            bodies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            acks: Mutex::new(Vec::new()),
            calls_by_queue: Mutex::new(HashMap::new()),
        }
    }

    fn push_body(&self, body: Vec<u8>) {
        self.bodies.lock().unwrap().push_back(body);
    }

    fn set_names(&self, names: &[&str]) {
        *self.names.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for FakeAdapter {
    async fn refresh(&self, _name_pattern: &regex::Regex) -> anyhow::Result<HashMap<String, Credentials>> {
        Ok(self
            .names
            .lock()
            .unwrap()
            .iter()
            .map(|n| (n.clone(), Credentials::CredentialFiles(vec![])))
            .collect())
    }

    async fn exists(&self, _subscription: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn work(&self, task: QueueTask, handler: QueueHandler) -> anyhow::Result<WorkResult> {
        let body = self.bodies.lock().unwrap().pop_front();
        let Some(body) = body else {
            return Ok(WorkResult { consumed_count: 0, observed_resource: None });
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_queue.lock().unwrap().entry(task.subscription.clone()).or_insert(0) += 1;
        let outcome = handler(body).await;
        self.acks.lock().unwrap().push(outcome.ack);
        Ok(WorkResult { consumed_count: 1, observed_resource: outcome.resource })
    }
}

/// A Processor whose outcome is fixed ahead of time, with an optional
/// rendezvous pair (`started`/`proceed`) for scenarios that need to observe
/// or control exactly when one `process` call is in flight.
struct ScriptedProcessor {
    outcome: Mutex<Option<ProcessOutcome>>,
    started: Notify,
    proceed: Option<Notify>,
}

impl ScriptedProcessor {
    fn immediate(outcome: ProcessOutcome) -> Self {
        Self { outcome: Mutex::new(Some(outcome)), started: Notify::new(), proceed: None }
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(
        &self,
        _request: &Request,
        _credentials: &[u8],
        _lifecycle: watch::Receiver<Option<LifecycleSignal>>,
    ) -> ProcessOutcome {
        self.started.notify_one();
        if let Some(proceed) = &self.proceed {
            proceed.notified().await;
        }
        self.outcome.lock().unwrap().take().expect("ScriptedProcessor invoked more than once")
    }
}

/// Blocks its first call until released, then always succeeds — including
/// on every call after the first, which returns immediately. Used by
/// scenarios that need to observe a handler mid-flight and later let a
/// second message through without re-blocking.
struct GateOnFirstCall {
    started: Notify,
    proceed: Notify,
    gated: std::sync::atomic::AtomicBool,
}

impl GateOnFirstCall {
    fn new() -> Arc<Self> {
        Arc::new(Self { started: Notify::new(), proceed: Notify::new(), gated: std::sync::atomic::AtomicBool::new(true) })
    }
}

#[async_trait]
impl Processor for GateOnFirstCall {
    async fn process(
        &self,
        _request: &Request,
        _credentials: &[u8],
        _lifecycle: watch::Receiver<Option<LifecycleSignal>>,
    ) -> ProcessOutcome {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.started.notify_one();
            self.proceed.notified().await;
        }
        ProcessOutcome::success()
    }
}

fn success() -> ProcessOutcome {
    ProcessOutcome::success()
}

fn failure_with_backoff(secs: u64) -> ProcessOutcome {
    ProcessOutcome::failure(Duration::from_secs(secs), false, anyhow::anyhow!("scenario failure"))
}

fn request_bytes(resource: Resource) -> Vec<u8> {
    let request = Request {
        config: Config { env: HashMap::new(), pip: Vec::new(), lifetime_duration: None, notification_url: None, opaque: HashMap::new() },
        experiment: Experiment {
            key: "scenario".to_string(),
            filename: "run.py".to_string(),
            args: Vec::new(),
            pythonver: "3.11".to_string(),
            resource,
            artifacts: HashMap::new(),
            opaque: HashMap::new(),
        },
        opaque: HashMap::new(),
    };
    request.serialize().unwrap()
}

async fn seeded_registry(project: &str, names: &[&str]) -> (Arc<Registry>, Arc<FakeAdapter>) {
    let adapter = Arc::new(FakeAdapter::new(names));
    let registry = Arc::new(Registry::new(project));
    let pattern = regex::Regex::new(".*").unwrap();
    registry.refresh_once(adapter.as_ref(), &pattern).await.unwrap();
    (registry, adapter)
}

/// S1 — Resource starvation back-off: the Subscription's hint never fits
/// the ledger's availability, so the very first tick installs a 60 s
/// back-off and `Work` is never called, including across every following
/// tick for the rest of that window.
#[tokio::test(start_paused = true)]
async fn s1_resource_starvation_backoff() {
    let (registry, adapter) = seeded_registry("s1", &["q1"]).await;
    let fingerprint = Fingerprint::new("s1", "q1");
    registry.update_resource_hint(&fingerprint, Resource::new(4, 0, 0, 8_000_000_000, 0));

    let ledger = Arc::new(Ledger::new(1, 1_000_000_000));
    let backoff = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let processor = Arc::new(ScriptedProcessor::immediate(success()));
    let (gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff.clone(), probe_tx, lifecycle_rx);
    let dispatcher = Dispatcher::new(
        registry,
        backoff.clone(),
        busy.clone(),
        ledger,
        adapter.clone(),
        processor,
        "s1",
        "sqs",
        Credentials::CredentialFiles(vec![]),
    );

    let producer_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { producer.run(shutdown).await }
    });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(probe_rx, shutdown_rx).await });

    tokio::time::sleep(TICK_PERIOD * 13).await;

    assert_eq!(adapter.call_count(), 0, "Work must never be called on a resource mismatch");
    assert!(backoff.get(&fingerprint), "60s back-off must remain installed across the window");
    assert!(!busy.is_claimed(&fingerprint), "Busy Set must be released after the mismatch");
    let _ = gate;

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    dispatcher_task.await.unwrap();
}

/// S2 — Successful dispatch: a fitting message is acked, a short defensive
/// back-off is installed, and the Busy Set is released.
#[tokio::test(start_paused = true)]
async fn s2_successful_dispatch() {
    let (registry, adapter) = seeded_registry("s2", &["q1"]).await;
    let fingerprint = Fingerprint::new("s2", "q1");
    adapter.push_body(request_bytes(Resource::new(1, 0, 0, 0, 0)));

    let ledger = Arc::new(Ledger::new(4, 8_000_000_000));
    let backoff = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let processor = Arc::new(ScriptedProcessor::immediate(success()));
    let (_gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff.clone(), probe_tx, lifecycle_rx);
    let dispatcher = Dispatcher::new(
        registry.clone(),
        backoff.clone(),
        busy.clone(),
        ledger,
        adapter.clone(),
        processor,
        "s2",
        "sqs",
        Credentials::CredentialFiles(vec![]),
    );

    let producer_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { producer.run(shutdown).await }
    });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(probe_rx, shutdown_rx).await });

    tokio::time::sleep(TICK_PERIOD + Duration::from_millis(1)).await;

    assert_eq!(adapter.call_count(), 1, "Work must be called exactly once");
    assert!(backoff.get(&fingerprint), "1s defensive back-off must be installed after success");
    assert!(!busy.is_claimed(&fingerprint));
    let sub = registry.snapshot().into_iter().find(|s| s.fingerprint == fingerprint).unwrap();
    assert_eq!(sub.resource_hint, Some(Resource::new(1, 0, 0, 0, 0)));

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    dispatcher_task.await.unwrap();
}

/// S3 — Processor failure with redelivery: the adapter nacks, and a 30 s
/// back-off is installed so this node does not immediately re-probe.
#[tokio::test(start_paused = true)]
async fn s3_processor_failure_with_redelivery() {
    let (registry, adapter) = seeded_registry("s3", &["q1"]).await;
    let fingerprint = Fingerprint::new("s3", "q1");
    adapter.push_body(request_bytes(Resource::new(1, 0, 0, 0, 0)));

    let ledger = Arc::new(Ledger::new(4, 8_000_000_000));
    let backoff = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let processor = Arc::new(ScriptedProcessor::immediate(failure_with_backoff(30)));
    let (_gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff.clone(), probe_tx, lifecycle_rx);
    let dispatcher = Dispatcher::new(
        registry,
        backoff.clone(),
        busy.clone(),
        ledger,
        adapter.clone(),
        processor,
        "s3",
        "sqs",
        Credentials::CredentialFiles(vec![]),
    );

    let producer_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { producer.run(shutdown).await }
    });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(probe_rx, shutdown_rx).await });

    tokio::time::sleep(TICK_PERIOD + Duration::from_millis(1)).await;

    assert_eq!(adapter.call_count(), 1);
    assert_eq!(adapter.acks.lock().unwrap().as_slice(), &[false], "message must be nack'd, not ack'd");
    assert!(backoff.get(&fingerprint), "30s back-off must be installed after the failure");
    assert!(!busy.is_claimed(&fingerprint));

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    dispatcher_task.await.unwrap();
}

/// S4 — Queue vanished mid-flight: the Registry drops `q1` while its
/// handler is still running. The handler completes and ack/nacks normally;
/// the Registry no longer contains the fingerprint afterward.
#[tokio::test(start_paused = true)]
async fn s4_queue_vanished_mid_flight() {
    let (registry, adapter) = seeded_registry("s4", &["q1"]).await;
    let fingerprint = Fingerprint::new("s4", "q1");
    adapter.push_body(request_bytes(Resource::new(1, 0, 0, 0, 0)));

    let ledger = Arc::new(Ledger::new(4, 8_000_000_000));
    let backoff = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let processor = GateOnFirstCall::new();
    let (_gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff.clone(), probe_tx, lifecycle_rx);
    let dispatcher = Dispatcher::new(
        registry.clone(),
        backoff.clone(),
        busy.clone(),
        ledger,
        adapter.clone(),
        processor.clone(),
        "s4",
        "sqs",
        Credentials::CredentialFiles(vec![]),
    );

    let producer_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { producer.run(shutdown).await }
    });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(probe_rx, shutdown_rx).await });

    tokio::time::sleep(TICK_PERIOD + Duration::from_millis(1)).await;
    processor.started.notified().await;

    // The handler is now blocked mid-flight; remove q1 from what the
    // broker reports on the next refresh (S4).
    adapter.set_names(&[]);
    let pattern = regex::Regex::new(".*").unwrap();
    let diff = registry.refresh_once(adapter.as_ref(), &pattern).await.unwrap();
    assert_eq!(diff.removed, vec![fingerprint.clone()]);
    assert!(!registry.contains(&fingerprint));

    processor.proceed.notify_one();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(adapter.call_count(), 1, "the in-flight handler must still complete");
    assert_eq!(adapter.acks.lock().unwrap().as_slice(), &[true]);
    assert!(!busy.is_claimed(&fingerprint));
    assert!(!registry.contains(&fingerprint), "q1 must stay absent after the handler settles");

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    dispatcher_task.await.unwrap();
}

/// S5 — Drain signal: a handler already running when Drain is signalled
/// finishes unaffected; no further probes are issued while draining; probing
/// resumes within one tick period once Lifecycle returns to Running.
#[tokio::test(start_paused = true)]
async fn s5_drain_signal() {
    let (registry, adapter) = seeded_registry("s5", &["q1"]).await;
    adapter.push_body(request_bytes(Resource::new(1, 0, 0, 0, 0)));
    adapter.push_body(request_bytes(Resource::new(1, 0, 0, 0, 0)));

    let ledger = Arc::new(Ledger::new(4, 8_000_000_000));
    let backoff = Arc::new(BackoffCache::new());
    let busy = Arc::new(BusySet::new());
    let processor = GateOnFirstCall::new();
    let (gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff.clone(), probe_tx, lifecycle_rx);
    let dispatcher = Dispatcher::new(
        registry,
        backoff,
        busy,
        ledger,
        adapter.clone(),
        processor.clone(),
        "s5",
        "sqs",
        Credentials::CredentialFiles(vec![]),
    );

    let producer_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { producer.run(shutdown).await }
    });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(probe_rx, shutdown_rx).await });

    tokio::time::sleep(TICK_PERIOD + Duration::from_millis(1)).await;
    processor.started.notified().await;

    // Drain while the first handler is still mid-flight.
    gate.transition(LifecycleState::Drain);
    tokio::time::sleep(TICK_PERIOD * 3).await;
    assert_eq!(adapter.call_count(), 1, "no second probe may be issued while the first is still in flight");

    processor.proceed.notify_one();
    tokio::time::sleep(TICK_PERIOD * 2).await;
    assert_eq!(adapter.call_count(), 1, "the running handler finishes, but Drain admits no new probe");

    gate.transition(LifecycleState::Running);
    tokio::time::sleep(TICK_PERIOD + Duration::from_millis(1)).await;
    assert_eq!(adapter.call_count(), 2, "probing must resume within one tick period of Drain->Running");

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    dispatcher_task.await.unwrap();
}

/// S6 — Parallel fairness: over many ticks, each of three idle queues is
/// selected roughly uniformly. Wired straight against the Producer and a
/// manual probe receiver, bypassing the Dispatcher entirely: a real
/// Dispatcher installs a 1s defensive back-off per success (§4.D), measured
/// against real wall-clock time even under `tokio::time::pause`, which
/// would silently exclude a queue from every later tick within this fast
/// virtual-time test. The Producer's RNG is process-global (`rand::rng()`)
/// and not seedable through its public API, so this uses a wide fixed tick
/// count and a generous tolerance band rather than a fixed seed.
#[tokio::test(start_paused = true)]
async fn s6_parallel_fairness() {
    let (registry, _adapter) = seeded_registry("s6", &["q1", "q2", "q3"]).await;

    let backoff = Arc::new(BackoffCache::new());
    let (_gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, mut probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry, backoff, probe_tx, lifecycle_rx);
    let producer_task = tokio::spawn(async move { producer.run(shutdown_rx).await });

    let counts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let counts_for_consumer = counts.clone();
    let consumer_task = tokio::spawn(async move {
        while let Some(probe) = probe_rx.recv().await {
            *counts_for_consumer.lock().unwrap().entry(probe.fingerprint.queue).or_insert(0) += 1;
        }
    });

    tokio::time::sleep(TICK_PERIOD * 300 + Duration::from_millis(1)).await;

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    consumer_task.await.unwrap();

    let counts = counts.lock().unwrap().clone();
    assert_eq!(counts.len(), 3, "all three queues must have been selected at least once");
    for (queue, count) in &counts {
        assert!(
            (85..=115).contains(count),
            "queue {} selected {} times, expected within +-15% of 100",
            queue,
            count
        );
    }
}

/// S6b — Occupancy exclusion: a queue marked in-flight is never selected,
/// no matter how many ticks run, while its idle sibling keeps being probed.
/// Same Producer-only wiring as S6, for the same reason (a real Dispatcher's
/// defensive back-off is wall-clock-timed).
#[tokio::test(start_paused = true)]
async fn s6b_occupied_queue_is_excluded_until_released() {
    let (registry, _adapter) = seeded_registry("s6b", &["q1", "q2"]).await;
    let occupied = Fingerprint::new("s6b", "q1");
    registry.set_in_flight(&occupied, 1);

    let backoff = Arc::new(BackoffCache::new());
    let (_gate, lifecycle_rx) = LifecycleGate::new(LifecycleState::Running);
    let (probe_tx, mut probe_rx) = taskdrain::probe::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(registry.clone(), backoff, probe_tx, lifecycle_rx);
    let producer_task = tokio::spawn(async move { producer.run(shutdown_rx).await });

    let queues_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let queues_for_consumer = queues_seen.clone();
    let consumer_task = tokio::spawn(async move {
        while let Some(probe) = probe_rx.recv().await {
            queues_for_consumer.lock().unwrap().push(probe.fingerprint.queue);
        }
    });

    tokio::time::sleep(TICK_PERIOD * 20 + Duration::from_millis(1)).await;

    shutdown_tx.send(true).unwrap();
    producer_task.await.unwrap();
    consumer_task.await.unwrap();

    let seen = queues_seen.lock().unwrap().clone();
    assert!(!seen.is_empty(), "the idle sibling must still be probed");
    assert!(seen.iter().all(|q| q == "q2"), "an in-flight queue must never be selected: saw {:?}", seen);

    registry.set_in_flight(&occupied, 0);
    let sub = registry.snapshot().into_iter().find(|s| s.fingerprint == occupied).unwrap();
    assert!(sub.is_idle(), "clearing in-flight must re-admit the queue as idle");
}
