// src/queue/sqs.rs
//
// SQS variant: queue URLs that are neither `.json` nor `amqp://` are a
// comma-separated list of credential files, each of which must `stat()`
// successfully at selection time (see `queue::select_adapter`). Uses
// long-poll receive + visibility-timeout renewal in the real SDK.

use super::{BrokerBackend, Credentials, LeaseHandle, ReceivedMessage, WorkTiming, DEFAULT_WORK_TIMING};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub struct SqsBackend {
    pub credential_files: Vec<String>,
    pub timeout: Duration,
}

impl SqsBackend {
    pub fn new(credential_files: Vec<String>, timeout: Duration) -> Self {
        Self { credential_files, timeout }
    }
}

#[async_trait]
impl BrokerBackend for SqsBackend {
    async fn list(&self, name_pattern: &regex::Regex) -> Result<HashMap<String, Credentials>> {
        let _ = name_pattern;
        Ok(HashMap::new())
    }

    async fn exists(&self, _subscription: &str) -> Result<bool> {
        Ok(true)
    }

    async fn receive(&self, _subscription: &str, _poll_wait: Duration) -> Result<Option<ReceivedMessage>> {
        // Real implementation long-polls ReceiveMessage bounded by poll_wait.
        Ok(None)
    }

    async fn extend_lease(&self, _subscription: &str, _handle: &LeaseHandle) -> Result<()> {
        // Real implementation calls ChangeMessageVisibility.
        Ok(())
    }

    async fn ack(&self, _subscription: &str, _handle: LeaseHandle) -> Result<()> {
        // Real implementation calls DeleteMessage.
        Ok(())
    }

    async fn nack(&self, _subscription: &str, _handle: LeaseHandle) -> Result<()> {
        // Real implementation shortens visibility timeout to 0 so the
        // message becomes immediately redeliverable.
        Ok(())
    }

    fn timing(&self) -> WorkTiming {
        WorkTiming { poll_wait: self.timeout, ..DEFAULT_WORK_TIMING }
    }

    fn queue_type(&self) -> &'static str {
        "sqs"
    }
}
