// src/model.rs
//
// =============================================================================
// TASKDRAIN: CORE SCHEMA (v 0.1)
// =============================================================================
//
// The wire-level and in-memory data contracts shared by every component:
// the Resource spec and its Fit relation, the Request a queue message
// decodes into, the Artifact map it carries, and the bookkeeping types
// (Subscription, Reservation, back-off/busy keys) the scheduler mutates.
//
// Design Principles:
// 1. Lossless round-trip: unknown JSON fields never get coerced away.
// 2. Byte sizes are always normalized to u64 at the model boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// 1. RESOURCE SPEC & FIT
// ============================================================================

/// A resource need or a resource availability snapshot.
///
/// `gpu_mem` of `0` is treated as "unspecified" by `Fits` — an empty or
/// missing GPU memory requirement matches any availability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub cpus: u64,
    pub gpus: u64,
    pub hdd: u64,
    pub ram: u64,
    pub gpu_mem: u64,
}

impl Resource {
    pub fn new(cpus: u64, gpus: u64, hdd: u64, ram: u64, gpu_mem: u64) -> Self {
        Self { cpus, gpus, hdd, ram, gpu_mem }
    }

    /// Conjunctive componentwise `need <= have`. An unspecified (zero)
    /// `gpu_mem` need is satisfied by any availability.
    pub fn fits(need: &Resource, have: &Resource) -> bool {
        need.cpus <= have.cpus
            && need.gpus <= have.gpus
            && need.hdd <= have.hdd
            && need.ram <= have.ram
            && (need.gpu_mem == 0 || need.gpu_mem <= have.gpu_mem)
    }
}

/// Parses a human byte string ("4Gb", "500Mb", "2GiB", "", "0") into bytes.
///
/// Accepts SI (kB/MB/GB/TB, 1000-based) and IEC (KiB/MiB/GiB/TiB, 1024-based)
/// suffixes, case-insensitively, with or without a trailing 'B'. An empty
/// string parses as zero (the fixed reading of the GPU-memory open question;
/// applied uniformly to every byte field for consistency).
pub fn parse_bytes(raw: &str) -> Result<u64, ByteParseError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let lower = s.to_ascii_lowercase();
    let split_at = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (num_part, unit_part) = lower.split_at(split_at);

    let value: f64 = num_part
        .parse()
        .map_err(|_| ByteParseError::InvalidNumber(raw.to_string()))?;

    let multiplier: u64 = match unit_part.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "ki" | "kib" => 1_024,
        "m" | "mb" => 1_000_000,
        "mi" | "mib" => 1_024 * 1_024,
        "g" | "gb" => 1_000_000_000,
        "gi" | "gib" => 1_024 * 1_024 * 1_024,
        "t" | "tb" => 1_000_000_000_000,
        "ti" | "tib" => 1_024_u64.pow(4),
        other => return Err(ByteParseError::UnknownUnit(other.to_string())),
    };

    let bytes = value * multiplier as f64;
    if bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(ByteParseError::Overflow(raw.to_string()));
    }
    Ok(bytes as u64)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ByteParseError {
    #[error("invalid numeric portion in byte string: {0:?}")]
    InvalidNumber(String),
    #[error("unrecognized byte unit in: {0:?}")]
    UnknownUnit(String),
    #[error("byte string overflowed u64: {0:?}")]
    Overflow(String),
}

// ============================================================================
// 2. REQUEST (the parsed message)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub key: String,
    pub filename: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub pythonver: String,
    pub resource: Resource,
    #[serde(default)]
    pub artifacts: HashMap<String, Artifact>,
    /// Fields present on the wire that this scheduler does not interpret,
    /// preserved verbatim for lossless round-trip serialization.
    #[serde(flatten)]
    pub opaque: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pip: Vec<String>,
    pub lifetime_duration: Option<String>,
    pub notification_url: Option<String>,
    #[serde(flatten)]
    pub opaque: HashMap<String, Value>,
}

/// Immutable per-message bundle. Round-trips losslessly: any top-level JSON
/// key beyond `config`/`experiment` is retained in `opaque` and re-emitted
/// verbatim on serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub config: Config,
    pub experiment: Experiment,
    #[serde(flatten)]
    pub opaque: HashMap<String, Value>,
}

impl Request {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub local: Option<String>,
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub unpack: bool,
    #[serde(default)]
    pub qualified: bool,
}

// ============================================================================
// 3. SCHEDULER BOOKKEEPING TYPES
// ============================================================================

/// `(project, queue)` — the key used for Busy Set and Back-off Cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub project: String,
    pub queue: String,
}

impl Fingerprint {
    pub fn new(project: impl Into<String>, queue: impl Into<String>) -> Self {
        Self { project: project.into(), queue: queue.into() }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.queue)
    }
}

/// In-memory view of a broker queue this node has discovered.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub fingerprint: Fingerprint,
    pub resource_hint: Option<Resource>,
    pub in_flight_count: u32,
}

impl Subscription {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self { fingerprint, resource_hint: None, in_flight_count: 0 }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight_count == 0
    }
}

/// A granted allocation against one Ledger device. `device` lets `Release`
/// reject a reservation whose device has since been swapped out from under
/// it (see `Ledger::set_limits`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub device: String,
    pub size: u64,
}
