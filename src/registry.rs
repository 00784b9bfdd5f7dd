// src/registry.rs
//
// §4.C Queue Registry: aligns the in-memory Subscription set to whatever
// the broker reports on each refresh tick. Grounded on the teacher's
// `MarketplaceCoordinator::tick` shape in `marketplace.rs` — list, diff
// against the held state, mutate under one lock, log only if something
// changed.

use crate::model::{Fingerprint, Subscription};
use crate::queue::{Credentials, TaskQueue};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const FIRST_TICK_DELAY: Duration = Duration::from_secs(1);
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct RefreshDiff {
    pub added: Vec<Fingerprint>,
    pub removed: Vec<Fingerprint>,
}

impl RefreshDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Process-wide singleton holding the live Subscription set. §3 invariant 3:
/// a Subscription absent from the latest refresh is removed before the next
/// tick completes — `refresh_once` enforces this atomically under one lock.
pub struct Registry {
    project: String,
    subscriptions: Mutex<HashMap<Fingerprint, Subscription>>,
}

impl Registry {
    pub fn new(project: impl Into<String>) -> Self {
        Self { project: project.into(), subscriptions: Mutex::new(HashMap::new()) }
    }

    /// One `Refresh()` tick (§4.C): call the adapter's listing, diff
    /// against the current map, mutate under the lock, and return a
    /// summary the caller can choose to log only if non-empty.
    pub async fn refresh_once(
        &self,
        adapter: &dyn TaskQueue,
        name_pattern: &regex::Regex,
    ) -> anyhow::Result<RefreshDiff> {
        let discovered: HashMap<String, Credentials> = adapter.refresh(name_pattern).await?;
        let discovered_keys: std::collections::HashSet<Fingerprint> = discovered
            .keys()
            .map(|name| Fingerprint::new(self.project.clone(), name.clone()))
            .collect();

        let mut subs = self.subscriptions.lock().unwrap();
        let existing_keys: std::collections::HashSet<Fingerprint> = subs.keys().cloned().collect();

        let added: Vec<Fingerprint> = discovered_keys.difference(&existing_keys).cloned().collect();
        let removed: Vec<Fingerprint> = existing_keys.difference(&discovered_keys).cloned().collect();

        for key in &added {
            subs.insert(key.clone(), Subscription::new(key.clone()));
        }
        for key in &removed {
            subs.remove(key);
        }

        Ok(RefreshDiff { added, removed })
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.lock().unwrap().values().cloned().collect()
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.subscriptions.lock().unwrap().contains_key(key)
    }

    pub fn update_resource_hint(&self, key: &Fingerprint, resource: crate::model::Resource) {
        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(key) {
            sub.resource_hint = Some(resource);
        }
    }

    pub fn set_in_flight(&self, key: &Fingerprint, count: u32) {
        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(key) {
            sub.in_flight_count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueHandler, QueueTask, WorkResult};
    use async_trait::async_trait;

    struct FakeAdapter {
        names: Mutex<Vec<String>>,
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
        async fn work(&self, _task: QueueTask, _handler: QueueHandler) -> anyhow::Result<WorkResult> {
            Ok(WorkResult { consumed_count: 0, observed_resource: None })
        }
    }

    #[tokio::test]
    async fn refresh_convergence_property() {
        let adapter = FakeAdapter { names: Mutex::new(vec!["q1".into(), "q2".into()]) };
        let registry = Registry::new("proj");
        let pattern = regex::Regex::new(".*").unwrap();

        let diff1 = registry.refresh_once(&adapter, &pattern).await.unwrap();
        assert_eq!(diff1.added.len(), 2);
        assert!(diff1.removed.is_empty());

        // Same set reported twice in a row -> registry set equals it, no further diff.
        let diff2 = registry.refresh_once(&adapter, &pattern).await.unwrap();
        assert!(diff2.is_empty());

        let mut names = registry.snapshot().into_iter().map(|s| s.fingerprint.queue).collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["q1".to_string(), "q2".to_string()]);
    }

    #[tokio::test]
    async fn removal_takes_effect_before_next_tick() {
        let adapter = FakeAdapter { names: Mutex::new(vec!["q1".into()]) };
        let registry = Registry::new("proj");
        let pattern = regex::Regex::new(".*").unwrap();
        registry.refresh_once(&adapter, &pattern).await.unwrap();
        assert!(registry.contains(&Fingerprint::new("proj", "q1")));

        adapter.names.lock().unwrap().clear();
        let diff = registry.refresh_once(&adapter, &pattern).await.unwrap();
        assert_eq!(diff.removed, vec![Fingerprint::new("proj", "q1")]);
        assert!(!registry.contains(&Fingerprint::new("proj", "q1")));
    }
}
