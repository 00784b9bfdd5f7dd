// src/processor.rs
//
// §4.I Processor Facade: an interface-only boundary. Parses the message
// payload into a Request, drives the external Task Runtime (out of scope:
// the script generator itself; §1), and returns `(backoff, ack, err)`.
// Narrowed from the teacher's `CodeDriver` trait in `drivers.rs`, which
// plays the analogous role of "the thing that actually runs the payload".

use crate::model::Request;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of processing one message, per §4.I / §7.
pub struct ProcessOutcome {
    pub backoff: Option<Duration>,
    pub ack: bool,
    pub error: Option<anyhow::Error>,
}

impl ProcessOutcome {
    pub fn success() -> Self {
        Self { backoff: None, ack: true, error: None }
    }

    pub fn failure(backoff: Duration, ack: bool, error: anyhow::Error) -> Self {
        Self { backoff: Some(backoff), ack, error: Some(error) }
    }
}

/// A lifecycle signal the Processor should observe mid-run (e.g. to cancel
/// a subprocess on a Drain-triggered shutdown grace-period expiry).
pub enum LifecycleSignal {
    Cancel,
}

/// Drives the external Task Runtime for one parsed Request. Implementors
/// own everything §1 calls "external collaborator": workspace staging,
/// script generation, interpreter invocation, artifact transport.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        request: &Request,
        credentials: &[u8],
        lifecycle: tokio::sync::watch::Receiver<Option<LifecycleSignal>>,
    ) -> ProcessOutcome;
}

// ============================================================================
// EXTERNAL PROCESSOR (a concrete Task Runtime collaborator)
// ============================================================================
//
// Stages a workspace, shells out to the requested interpreter, and maps the
// exit code onto §7's error taxonomy. Grounded on the teacher's
// `ExternalDriver::run_heavy_compute` subprocess shape in
// `drivers/external.rs` — this narrows that three-phase "write / compute /
// parse" adapter sandwich down to just the compute phase, since the
// write/parse adapter scripts and artifact transport are out-of-scope
// external collaborators (§1). Stdout/stderr draining via a separately
// spawned `BufReader::lines()` task per stream is grounded on the teacher's
// `JanusDriver` daemon plumbing in `drivers/janus.rs`. Mutable artifacts are
// checkpointed back through `ArtifactStore` and the workspace directory is
// removed once status is known, unless `--keep-workspace` is set.

use crate::errors::RunnerError;
use crate::merge;
use crate::workspace::{ArtifactStore, Workspace};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub struct ExternalProcessor {
    root_dir: PathBuf,
    keep_workspace: bool,
}

impl ExternalProcessor {
    pub fn new(root_dir: PathBuf, keep_workspace: bool) -> Self {
        Self { root_dir, keep_workspace }
    }

    /// Checkpoints every mutable artifact with a staged local path back
    /// through the content-addressed store, then removes the workspace
    /// directory unless `--keep-workspace` is set. Called on every exit
    /// path once a workspace has actually been created.
    fn finish(&self, workspace: &Workspace, request: &crate::model::Request, outcome: ProcessOutcome) -> ProcessOutcome {
        self.commit_mutable_artifacts(workspace, request);
        if !self.keep_workspace {
            if let Err(e) = fs::remove_dir_all(&workspace.root) {
                log::warn!("failed to remove workspace {:?}: {}", workspace.root, e);
            }
        }
        outcome
    }

    fn commit_mutable_artifacts(&self, workspace: &Workspace, request: &crate::model::Request) {
        let staged: Vec<_> = request
            .experiment
            .artifacts
            .iter()
            .filter(|(_, artifact)| artifact.mutable && artifact.local.is_some())
            .collect();
        if staged.is_empty() {
            return;
        }

        let store = match ArtifactStore::new(self.root_dir.join("_artifacts")) {
            Ok(store) => store,
            Err(e) => {
                log::warn!("failed to open artifact store: {}", e);
                return;
            }
        };

        let mut committed = Map::new();
        for (name, artifact) in staged {
            let local = artifact.local.as_ref().unwrap();
            let staged_path = workspace.workspace_dir().join(local);
            if !staged_path.is_file() {
                log::warn!("mutable artifact {:?} missing at {:?}, skipping checkpoint", name, staged_path);
                continue;
            }
            let extension = Path::new(local).extension().and_then(|e| e.to_str()).unwrap_or("bin");
            match store.commit(&staged_path, extension) {
                Ok((hash, _path)) => {
                    log::info!("checkpointed mutable artifact {:?} as {}", name, hash);
                    committed.insert(name.clone(), Value::String(hash));
                }
                Err(e) => log::warn!("failed to checkpoint artifact {:?}: {}", name, e),
            }
        }

        if !committed.is_empty() {
            if let Ok(bytes) = serde_json::to_vec(&Value::Object(committed)) {
                let host = hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|_| "localhost".into());
                let _ = workspace.write_metadata("artifacts", &host, "json", &bytes);
            }
        }
    }
}

#[async_trait]
impl Processor for ExternalProcessor {
    async fn process(
        &self,
        request: &Request,
        _credentials: &[u8],
        mut lifecycle: tokio::sync::watch::Receiver<Option<LifecycleSignal>>,
    ) -> ProcessOutcome {
        let workspace = match Workspace::create(&self.root_dir, &request.experiment.key) {
            Ok(w) => w,
            Err(e) => {
                let err = RunnerError::RuntimeUnrecoverable(format!("workspace staging failed: {}", e));
                return ProcessOutcome::failure(
                    err.backoff_hint().unwrap_or_default(),
                    err.ack_policy() == crate::errors::AckPolicy::Ack,
                    err.into(),
                );
            }
        };

        if let Ok(bytes) = serde_json::to_vec(request) {
            let _ = workspace.write_metadata("request", "local", "json", &bytes);
        }

        let mut cmd = Command::new(&request.experiment.pythonver);
        cmd.arg(&request.experiment.filename)
            .args(&request.experiment.args)
            .envs(&request.config.env)
            .current_dir(workspace.workspace_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let err = RunnerError::RuntimeUnrecoverable(format!("failed to spawn task runtime: {}", e));
                let outcome = ProcessOutcome::failure(
                    err.backoff_hint().unwrap_or_default(),
                    err.ack_policy() == crate::errors::AckPolicy::Ack,
                    err.into(),
                );
                return self.finish(&workspace, request, outcome);
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("task runtime stderr: {}", line);
            }
        });

        // Scrapes single-line JSON fragments from stdout and folds them into
        // one metadata document per the checkpoint merge rules (§6): plain
        // objects deep-merge, JSON-Patch arrays apply in order, and once
        // `studioml.status == "completed"` only new top-level keys may land.
        let stdout_task = tokio::spawn(async move {
            let mut doc = Value::Object(Map::new());
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let post_completion = merge::is_completed(&doc);
                match merge::parse_fragment(&line) {
                    Ok(fragment) => {
                        if let Err(e) = merge::apply_fragment(&mut doc, fragment, post_completion) {
                            log::warn!("discarding metadata fragment: {}", e);
                        }
                    }
                    Err(e) => log::warn!("unparseable stdout fragment {:?}: {}", line, e),
                }
            }
            doc
        });

        let status = tokio::select! {
            status = child.wait() => status,
            _ = lifecycle.changed() => {
                if matches!(*lifecycle.borrow(), Some(LifecycleSignal::Cancel)) {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    stdout_task.abort();
                    let err = RunnerError::RuntimeFailed { exit_code: -1 };
                    let outcome = ProcessOutcome::failure(
                        err.backoff_hint().unwrap_or_default(),
                        err.ack_policy() == crate::errors::AckPolicy::Ack,
                        anyhow::anyhow!("task runtime cancelled by drain shutdown"),
                    );
                    return self.finish(&workspace, request, outcome);
                }
                child.wait().await
            }
        };

        let _ = stderr_task.await;
        let doc = stdout_task.await.unwrap_or_else(|_| Value::Object(Map::new()));
        if let Ok(bytes) = serde_json::to_vec(&doc) {
            let host = hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|_| "localhost".into());
            let _ = workspace.write_metadata("scrape", &host, "json", &bytes);
        }

        let outcome = match status {
            Ok(status) if status.success() => ProcessOutcome::success(),
            Ok(status) => {
                let err = RunnerError::RuntimeFailed { exit_code: status.code().unwrap_or(-1) };
                ProcessOutcome::failure(
                    err.backoff_hint().unwrap_or_default(),
                    err.ack_policy() == crate::errors::AckPolicy::Ack,
                    err.into(),
                )
            }
            Err(e) => {
                let err = RunnerError::RuntimeUnrecoverable(format!("failed to await task runtime: {}", e));
                ProcessOutcome::failure(
                    err.backoff_hint().unwrap_or_default(),
                    err.ack_policy() == crate::errors::AckPolicy::Ack,
                    err.into(),
                )
            }
        };
        self.finish(&workspace, request, outcome)
    }
}
