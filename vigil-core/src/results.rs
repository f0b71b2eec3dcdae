//! Result sink: timestamped JSON artifacts plus an append-only manifest
//!
//! Artifacts land in `<results_dir>/<compiled_subdir>` as
//! `<prefix>_<type>_<YYYYMMDD_HHMMSS>.json`; every successful artifact write
//! appends one entry to `<results_dir>/<manifest_file>`.
//!
//! All manifest mutations go through a single async mutex owned by the sink,
//! so concurrent `save` calls never lose each other's entries. The manifest
//! itself is rewritten atomically (temp file + rename). A manifest that no
//! longer parses is moved aside to `<manifest_file>.corrupt` the next time it
//! is rewritten; `reconcile` then re-indexes the artifacts on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ResultsConfig;
use crate::error::{Result, VigilError};

/// One manifest line: where an artifact came from and where it lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Source tag, `<prefix>://<type>`
    pub source: String,
    /// Artifact path
    pub compiled: PathBuf,
    /// Artifact size in bytes
    pub size: u64,
    /// When the artifact was written
    pub timestamp: DateTime<Utc>,
}

/// A persisted artifact
#[derive(Debug, Clone)]
pub struct SavedArtifact {
    /// Manifest entry describing the artifact
    pub entry: ManifestEntry,
    /// False when the manifest append failed and was queued for retry
    pub indexed: bool,
}

#[derive(Debug, Default)]
struct ManifestWriter {
    /// Entries whose artifact is on disk but whose manifest append failed
    pending: Vec<ManifestEntry>,
}

/// Durable artifact writer and manifest owner
#[derive(Debug)]
pub struct ResultSink {
    compiled_dir: PathBuf,
    manifest_path: PathBuf,
    prefix: String,
    writer: Mutex<ManifestWriter>,
}

impl ResultSink {
    /// Create the sink, creating the results directories.
    ///
    /// # Errors
    ///
    /// Failing to create the directories is a startup-fatal condition.
    pub fn new(config: &ResultsConfig) -> Result<Self> {
        let compiled_dir = config.results_dir.join(&config.compiled_subdir);
        std::fs::create_dir_all(&compiled_dir).map_err(|e| {
            VigilError::Persistence(format!(
                "cannot create results directory {}: {}",
                compiled_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            compiled_dir,
            manifest_path: config.results_dir.join(&config.manifest_file),
            prefix: config.artifact_prefix.clone(),
            writer: Mutex::new(ManifestWriter::default()),
        })
    }

    /// Directory receiving artifacts
    pub fn compiled_dir(&self) -> &Path {
        &self.compiled_dir
    }

    /// Manifest file path
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Serialize `payload` into a new artifact of type `kind` and index it.
    ///
    /// A failed artifact write is an error. A failed manifest append after a
    /// successful artifact write is not: the entry is queued and retried on
    /// the next `save` or [`flush_pending`](Self::flush_pending).
    pub async fn save<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<SavedArtifact> {
        let bytes = serde_json::to_vec_pretty(payload)?;
        let mut writer = self.writer.lock().await;

        if !writer.pending.is_empty() {
            if let Err(e) = self.append_locked(&mut writer, Vec::new()).await {
                warn!("Pending manifest entries still not written: {}", e);
            }
        }

        let now = Utc::now();
        let path = self.write_artifact(kind, now, &bytes).await?;
        let entry = ManifestEntry {
            source: format!("{}://{}", self.prefix, kind),
            compiled: path,
            size: bytes.len() as u64,
            timestamp: now,
        };

        let indexed = match self.append_locked(&mut writer, vec![entry.clone()]).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    path = %entry.compiled.display(),
                    "Artifact saved but manifest append failed, queued for retry: {}",
                    e
                );
                false
            }
        };

        debug!(path = %entry.compiled.display(), size = entry.size, "Saved artifact");
        Ok(SavedArtifact { entry, indexed })
    }

    /// Retry queued manifest appends; returns how many were written
    pub async fn flush_pending(&self) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let count = writer.pending.len();
        if count == 0 {
            return Ok(0);
        }
        self.append_locked(&mut writer, Vec::new()).await?;
        info!("Flushed {} pending manifest entries", count);
        Ok(count)
    }

    /// Number of manifest appends waiting for a retry
    pub async fn pending_count(&self) -> usize {
        self.writer.lock().await.pending.len()
    }

    /// Current manifest contents
    pub async fn entries(&self) -> Result<Vec<ManifestEntry>> {
        let _writer = self.writer.lock().await;
        read_manifest(&self.manifest_path)
    }

    /// Rebuild the manifest from the artifacts on disk.
    ///
    /// Artifacts missing from the manifest are appended in file-name order,
    /// which is timestamp order. Returns how many entries were added.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let mut manifest = self.load_for_update()?;
        let known: HashSet<PathBuf> = manifest.iter().map(|e| e.compiled.clone()).collect();

        let mut artifacts: Vec<PathBuf> = std::fs::read_dir(&self.compiled_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .filter(|p| !known.contains(p))
            .collect();
        artifacts.sort();

        let mut added = 0;
        for path in artifacts {
            let meta = std::fs::metadata(&path)?;
            let timestamp = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            let kind = artifact_kind(&path, &self.prefix).unwrap_or_else(|| "unknown".to_string());
            manifest.push(ManifestEntry {
                source: format!("{}://{}", self.prefix, kind),
                compiled: path,
                size: meta.len(),
                timestamp,
            });
            added += 1;
        }

        if added > 0 {
            write_manifest(&self.manifest_path, manifest.clone()).await?;
            info!("Reconciled manifest: {} entries added", added);
        }

        let indexed: HashSet<PathBuf> = manifest.into_iter().map(|e| e.compiled).collect();
        writer.pending.retain(|e| !indexed.contains(&e.compiled));
        Ok(added)
    }

    async fn write_artifact(&self, kind: &str, now: DateTime<Utc>, bytes: &[u8]) -> Result<PathBuf> {
        let stem = format!("{}_{}_{}", self.prefix, kind, now.format("%Y%m%d_%H%M%S"));

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}_{}.json", stem, attempt)
            };
            let path = self.compiled_dir.join(name);

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    return Err(VigilError::Persistence(format!(
                        "cannot create artifact {}: {}",
                        path.display(),
                        e
                    )));
                }
            };

            let written = async {
                file.write_all(bytes).await?;
                file.sync_all().await
            }
            .await;
            if let Err(e) = written {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(VigilError::Persistence(format!(
                    "cannot write artifact {}: {}",
                    path.display(),
                    e
                )));
            }
            return Ok(path);
        }
    }

    /// Read the manifest before rewriting it. Caller holds the writer lock.
    fn load_for_update(&self) -> Result<Vec<ManifestEntry>> {
        let bytes = match std::fs::read(&self.manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_error(&self.manifest_path, e)),
        };

        match parse_manifest(&self.manifest_path, &bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let aside = corrupt_path(&self.manifest_path);
                std::fs::rename(&self.manifest_path, &aside).map_err(|err| {
                    VigilError::Persistence(format!(
                        "cannot move corrupt manifest to {}: {}",
                        aside.display(),
                        err
                    ))
                })?;
                error!(
                    moved_to = %aside.display(),
                    "{}; starting a new manifest, reconcile to re-index existing artifacts",
                    e
                );
                Ok(Vec::new())
            }
        }
    }

    /// Append `fresh` plus everything pending. Caller holds the writer lock.
    async fn append_locked(&self, writer: &mut ManifestWriter, fresh: Vec<ManifestEntry>) -> Result<()> {
        writer.pending.extend(fresh);
        let mut manifest = self.load_for_update()?;
        manifest.extend(writer.pending.iter().cloned());
        write_manifest(&self.manifest_path, manifest).await?;
        writer.pending.clear();
        Ok(())
    }
}

/// Read a manifest file; a missing file is an empty manifest
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    match std::fs::read(path) {
        Ok(bytes) => parse_manifest(path, &bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(read_error(path, e)),
    }
}

fn parse_manifest(path: &Path, bytes: &[u8]) -> Result<Vec<ManifestEntry>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| VigilError::Persistence(format!("corrupt manifest {}: {}", path.display(), e)))
}

fn read_error(path: &Path, e: std::io::Error) -> VigilError {
    VigilError::Persistence(format!("cannot read manifest {}: {}", path.display(), e))
}

/// `<manifest>.corrupt`, next to the manifest
fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

async fn write_manifest(path: &Path, manifest: Vec<ManifestEntry>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            VigilError::Persistence(format!("cannot stage manifest in {}: {}", dir.display(), e))
        })?;
        serde_json::to_writer_pretty(&mut tmp, &manifest)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| {
            VigilError::Persistence(format!("cannot replace manifest {}: {}", path.display(), e))
        })?;
        Ok(())
    })
    .await
    .map_err(|e| VigilError::Persistence(format!("manifest writer task failed: {}", e)))?
}

/// Artifact type from `<prefix>_<type>_<YYYYMMDD>_<HHMMSS>[_n].json`
fn artifact_kind(path: &Path, prefix: &str) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(prefix)?.strip_prefix('_')?;
    let parts: Vec<&str> = rest.split('_').collect();
    let date_at = parts
        .iter()
        .position(|p| p.len() == 8 && p.chars().all(|c| c.is_ascii_digit()))?;
    if date_at == 0 {
        return None;
    }
    Some(parts[..date_at].join("_"))
}
