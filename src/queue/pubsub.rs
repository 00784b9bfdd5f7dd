// src/queue/pubsub.rs
//
// PubSub variant: queue URLs ending in `.json` select a service-account
// file. Enumerates `subscriptions` and uses streaming receive in the real
// SDK (out of scope here — only the typed `BrokerBackend` seam is owned by
// this crate); extension is capped at a 12-hour ceiling per §4.B.

use super::{BrokerBackend, Credentials, LeaseHandle, ReceivedMessage, WorkTiming, DEFAULT_WORK_TIMING};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub const MAX_EXTENSION_CEILING: Duration = Duration::from_secs(12 * 60 * 60);

pub struct PubSubBackend {
    pub service_account_file: String,
    pub timeout: Duration,
}

impl PubSubBackend {
    pub fn new(service_account_file: impl Into<String>, timeout: Duration) -> Self {
        Self { service_account_file: service_account_file.into(), timeout }
    }
}

#[async_trait]
impl BrokerBackend for PubSubBackend {
    async fn list(&self, name_pattern: &regex::Regex) -> Result<HashMap<String, Credentials>> {
        // Real implementation enumerates `subscriptions` via the GCP SDK
        // using `self.service_account_file`, filtering names by `name_pattern`.
        let _ = name_pattern;
        Ok(HashMap::new())
    }

    async fn exists(&self, _subscription: &str) -> Result<bool> {
        Ok(true)
    }

    async fn receive(&self, _subscription: &str, _poll_wait: Duration) -> Result<Option<ReceivedMessage>> {
        // Real implementation issues a streaming-pull receive bounded by
        // `poll_wait`, capping lease extension at `MAX_EXTENSION_CEILING`.
        Ok(None)
    }

    async fn extend_lease(&self, _subscription: &str, _handle: &LeaseHandle) -> Result<()> {
        Ok(())
    }

    async fn ack(&self, _subscription: &str, _handle: LeaseHandle) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _subscription: &str, _handle: LeaseHandle) -> Result<()> {
        Ok(())
    }

    fn timing(&self) -> WorkTiming {
        WorkTiming { poll_wait: self.timeout, ..DEFAULT_WORK_TIMING }
    }

    fn queue_type(&self) -> &'static str {
        "pubsub"
    }
}
