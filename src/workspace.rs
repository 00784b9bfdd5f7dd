// src/workspace.rs
//
// §6.2 Persisted state & artifact store: the on-disk layout a task's
// Processor stages into and publishes from. Grounded on the teacher's
// workdir lifecycle in `guardian.rs` (per-job directory scaffolding) and
// its sharded content-addressable store in `provenance.rs::ArtifactStore`,
// adapted from arbitrary-extension naming to this system's
// `<type>-<host>-<base62-seconds>.<ext>` filename convention.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encodes a non-negative integer in base62, matching the filename
/// convention `<type>-<host>-<base62-seconds>.<ext>`. `0` encodes as `"0"`.
pub fn base62_encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE62_ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base62 alphabet is ASCII")
}

fn seconds_since_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Builds `<type>-<host>-<base62-seconds>.<ext>`. Two calls within the same
/// second for the same `(kind, host, ext)` produce the same name by design
/// — the second write overwrites the first, matching §6's stated rule.
pub fn timestamped_filename(kind: &str, host: &str, ext: &str) -> String {
    format!("{}-{}-{}.{}", kind, host, base62_encode(seconds_since_epoch()), ext)
}

/// The directory scaffold for one task, rooted at `<root>/<expKey>/`.
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    /// Creates the full layout (§6.2): `_metadata/`, `_metrics/`,
    /// `modeldir/`, `output/`, `tb/`, `workspace/`, `_runner/`.
    pub fn create(root_dir: impl AsRef<Path>, exp_key: &str) -> Result<Self> {
        let root = root_dir.as_ref().join(exp_key);
        for subdir in ["_metadata", "_metrics", "modeldir", "output", "tb", "workspace", "_runner"] {
            fs::create_dir_all(root.join(subdir))
                .with_context(|| format!("failed to create workspace subdirectory {:?}", root.join(subdir)))?;
        }
        Ok(Self { root })
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("_metadata")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("_metrics")
    }

    pub fn runner_dir(&self) -> PathBuf {
        self.root.join("_runner")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Writes `content` to `<metadata_dir>/<timestamped filename>`, so two
    /// writes within the same second for the same `kind`/`host` overwrite.
    pub fn write_metadata(&self, kind: &str, host: &str, ext: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.metadata_dir().join(timestamped_filename(kind, host, ext));
        fs::write(&path, content).with_context(|| format!("failed to write metadata file {:?}", path))?;
        Ok(path)
    }
}

/// Sharded content-addressable artifact store, rooted at
/// `<workspace root>/_runner/store/`. Grounded on `ArtifactStore::commit`
/// in `provenance.rs`: hash the content, shard by the first two hex
/// characters, atomic-rename into place (falling back to copy+delete
/// across devices), fsync the shard directory for durability.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Commits a staged temp file into the store. Returns the content hash
    /// and its final path. Idempotent: a hash already present is treated
    /// as a dedup hit and the temp file is discarded.
    pub fn commit(&self, temp_file: impl AsRef<Path>, extension: &str) -> Result<(String, PathBuf)> {
        use sha2::{Digest, Sha256};
        use std::io::Read;

        let temp_path = temp_file.as_ref();
        let mut file = File::open(temp_path)
            .with_context(|| format!("failed to open staged artifact {:?}", temp_path))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 65536];
        loop {
            let count = file.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
        drop(file);
        let hash = hex::encode(hasher.finalize());

        let shard_dir = self.root.join(&hash[0..2]);
        fs::create_dir_all(&shard_dir)?;
        let final_path = shard_dir.join(format!("{}.{}", hash, extension));

        if final_path.exists() {
            fs::remove_file(temp_path).ok();
            return Ok((hash, final_path));
        }

        if fs::rename(temp_path, &final_path).is_err() {
            fs::copy(temp_path, &final_path).context("failed to copy artifact across devices")?;
            fs::remove_file(temp_path)?;
        }

        if let Ok(dir) = File::open(&shard_dir) {
            let _ = dir.sync_all();
        }

        Ok((hash, final_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base62_zero_is_literal_zero() {
        assert_eq!(base62_encode(0), "0");
    }

    #[test]
    fn base62_round_trips_through_radix() {
        assert_eq!(base62_encode(61), "z");
        assert_eq!(base62_encode(62), "10");
    }

    #[test]
    fn workspace_create_scaffolds_every_subdirectory() {
        let tmp = std::env::temp_dir().join(format!("taskdrain-ws-{}", std::process::id()));
        let ws = Workspace::create(&tmp, "exp-key-1").unwrap();
        for subdir in ["_metadata", "_metrics", "modeldir", "output", "tb", "workspace", "_runner"] {
            assert!(ws.root.join(subdir).is_dir());
        }
        fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn commit_dedups_identical_content() {
        let tmp = std::env::temp_dir().join(format!("taskdrain-cas-{}", std::process::id()));
        let store = ArtifactStore::new(&tmp).unwrap();

        let staged1 = tmp.join("staged1.bin");
        fs::write(&staged1, b"same bytes").unwrap();
        let (hash1, path1) = store.commit(&staged1, "bin").unwrap();
        assert!(path1.exists());
        assert!(!staged1.exists(), "temp file should be moved out");

        let staged2 = tmp.join("staged2.bin");
        fs::write(&staged2, b"same bytes").unwrap();
        let (hash2, path2) = store.commit(&staged2, "bin").unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(path1, path2);
        assert!(!staged2.exists(), "dedup hit should discard the duplicate temp file");

        fs::remove_dir_all(&tmp).ok();
    }
}
