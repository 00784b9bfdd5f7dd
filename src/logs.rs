// src/logs.rs
//
// §2.1 / component M: `log` facade + `env_logger`-compatible init, driven
// by the `LOGXI`/`LOGXI_FORMAT` equivalents from §6.1. Grounded on the
// teacher's `log`/`env_logger` pairing in `main.rs`; the TUI path's
// in-memory ring-buffer logger (`TuiLogger`) is dropped since this system
// has no TUI, but the underlying `log::Log`-impl idiom is kept as
// `TailLogger` for a daemonized path that still wants an in-process tail
// of recent log lines (e.g. for a future health endpoint).

use anyhow::Result;
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Thread-safe circular buffer of recent formatted log lines.
#[derive(Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))), capacity }
    }

    pub fn push(&self, msg: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(msg);
    }

    pub fn get_lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// A `log::Log` implementation that tees every record into a `LogBuffer`
/// in addition to stderr, for callers that want an in-process tail (e.g.
/// a `/debug/logs` endpoint) without spinning up a separate aggregator.
pub struct TailLogger {
    buffer: LogBuffer,
    level: LevelFilter,
}

impl TailLogger {
    pub fn init(buffer: LogBuffer, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        let logger = Box::new(TailLogger { buffer, level });
        log::set_logger(Box::leak(logger)).map(|()| log::set_max_level(level))
    }
}

impl log::Log for TailLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = Local::now().format("%H:%M:%S");
        let target_full = record.target();
        let target = target_full.split("::").last().unwrap_or(target_full);
        let line = format!("[{} {} {}] {}", timestamp, record.level(), target, record.args());
        eprintln!("{}", line);
        self.buffer.push(line);
    }

    fn flush(&self) {}
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Initializes the global logger from the `LOGXI`/`LOGXI_FORMAT`-derived
/// configuration (§6.1). `format == "json"` emits one JSON object per line
/// (for log-shipping); anything else falls back to `env_logger`'s default
/// human-readable layout.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = parse_level(level);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);

    if format.eq_ignore_ascii_case("json") {
        builder.format(|buf, record| {
            writeln!(
                buf,
                r#"{{"ts":"{}","level":"{}","target":"{}","message":{}}}"#,
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                serde_json::to_string(&record.args().to_string()).unwrap_or_else(|_| "\"\"".to_string()),
            )
        });
    }

    builder.try_init().map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))
}
