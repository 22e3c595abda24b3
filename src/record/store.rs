//! On-disk layout of one builder
//!
//! ```text
//! <builder dir>/
//!   builder        descriptor (JSON)
//!   <n>            build record n (JSON, versioned)
//!   <n>-<suffix>   log files belonging to build n
//!   .<name>.tmp    in-progress atomic writes
//! ```
//!
//! All writes go through write-temp-then-rename so readers never observe a
//! half-written file. Saves of one build number are serialized. Reads tolerate a file vanishing between listing and
//! opening (the pruner may have removed it).

use super::schema::{self, BuilderDescriptor, DecodeError, Decoded};
use super::{Build, BuildRecord};
use crate::error::{BuildhistError, BuildhistResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::debug;

const DESCRIPTOR_FILE: &str = "builder";

/// Kind of numbered file in a builder directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFileKind {
    Build,
    Log,
}

/// A numbered file found in a builder directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    pub number: u64,
    pub kind: RecordFileKind,
    pub path: PathBuf,
}

impl RecordFile {
    /// Classify a file name: `<n>` is a build, `<n>-<suffix>` a log
    pub fn classify(name: &str) -> Option<(u64, RecordFileKind)> {
        match name.split_once('-') {
            None => all_digits(name).then(|| name.parse().ok()).flatten().map(|n| (n, RecordFileKind::Build)),
            Some((prefix, _)) => all_digits(prefix)
                .then(|| prefix.parse().ok())
                .flatten()
                .map(|n| (n, RecordFileKind::Log)),
        }
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Leading decimal digits of a file name, if any
fn numeric_prefix(name: &str) -> Option<u64> {
    let end = name.bytes().take_while(u8::is_ascii_digit).count();
    if end == 0 {
        return None;
    }
    name[..end].parse().ok()
}

/// File-backed storage for one builder's records
pub struct RecordStore {
    dir: PathBuf,
    io: Semaphore,
    /// Saves queued or in progress, per number
    saving: Mutex<HashMap<u64, usize>>,
    writers: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
    disk_reads: AtomicU64,
}

/// Holds the writer lock of one build number for the length of a save
struct SaveGuard<'a> {
    store: &'a RecordStore,
    number: u64,
    writer: Option<OwnedMutexGuard<()>>,
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        drop(self.writer.take());

        let mut writers = self.store.writers.lock();
        if writers
            .get(&self.number)
            .is_some_and(|w| Arc::strong_count(w) == 1)
        {
            writers.remove(&self.number);
        }
        drop(writers);

        let mut saving = self.store.saving.lock();
        if let Some(count) = saving.get_mut(&self.number) {
            *count -= 1;
            if *count == 0 {
                saving.remove(&self.number);
            }
        }
    }
}

impl RecordStore {
    /// Create a store rooted at `dir`, allowing `io_workers` concurrent disk operations
    pub fn new(dir: impl Into<PathBuf>, io_workers: usize) -> Self {
        Self {
            dir: dir.into(),
            io: Semaphore::new(io_workers.max(1)),
            saving: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            disk_reads: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn build_path(&self, number: u64) -> PathBuf {
        self.dir.join(number.to_string())
    }

    pub fn log_path(&self, number: u64, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}-{}", number, suffix))
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE)
    }

    /// Number of build files read from disk so far
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// Whether a save of this build is currently being written
    pub fn is_saving(&self, number: u64) -> bool {
        self.saving.lock().contains_key(&number)
    }

    /// Ensure the builder directory exists
    pub async fn ensure_dir(&self) -> BuildhistResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BuildhistError::io(format!("creating builder directory {}", self.dir.display()), e))
    }

    /// Load build `number`.
    ///
    /// `Ok(None)` means no file exists. Undecodable files surface as
    /// [`BuildhistError::CorruptedRecord`] or [`BuildhistError::UnsupportedSchema`].
    pub async fn load_build(&self, number: u64) -> BuildhistResult<Option<Decoded>> {
        let path = self.build_path(number);
        let _permit = self.permit().await?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuildhistError::io(format!("reading build file {}", path.display()), e)),
        };
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        debug!("Loaded build #{} from {}", number, path.display());

        match schema::decode_build(&bytes) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(DecodeError::Malformed(reason)) => Err(BuildhistError::corrupted(path, reason)),
            Err(DecodeError::Unsupported(version)) => {
                Err(BuildhistError::UnsupportedSchema { path, version })
            }
        }
    }

    /// Persist a build record atomically
    pub async fn save_build(&self, record: &BuildRecord) -> BuildhistResult<()> {
        let _guard = self.begin_save(record.number).await;
        self.write_build(record).await
    }

    /// Persist a running build unless it has finished by the time its
    /// number's writer lock is held.
    ///
    /// Returns whether a record was written. A finished build is left to
    /// the save that follows its finish.
    pub async fn save_unfinished(&self, build: &Build) -> BuildhistResult<bool> {
        let _guard = self.begin_save(build.number()).await;
        let record = build.snapshot();
        if record.finished {
            debug!("Build #{} finished before it was saved as running", record.number);
            return Ok(false);
        }
        self.write_build(&record).await?;
        Ok(true)
    }

    async fn begin_save(&self, number: u64) -> SaveGuard<'_> {
        *self.saving.lock().entry(number).or_default() += 1;
        let writer = self.writers.lock().entry(number).or_default().clone();
        let mut guard = SaveGuard {
            store: self,
            number,
            writer: None,
        };
        guard.writer = Some(writer.lock_owned().await);
        guard
    }

    async fn write_build(&self, record: &BuildRecord) -> BuildhistResult<()> {
        let bytes = schema::encode_build(record)?;
        let _permit = self.permit().await?;
        self.ensure_dir().await?;
        write_atomic(&self.build_path(record.number), &bytes).await?;
        debug!("Saved build #{} of {}", record.number, record.builder);
        Ok(())
    }

    /// Load the builder descriptor, if one was saved
    pub async fn load_descriptor(&self) -> BuildhistResult<Option<BuilderDescriptor>> {
        let path = self.descriptor_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuildhistError::io(format!("reading descriptor {}", path.display()), e)),
        };
        let descriptor = serde_json::from_str(&content).map_err(|e| BuildhistError::corrupted(&path, e))?;
        Ok(Some(descriptor))
    }

    /// Persist the builder descriptor atomically
    pub async fn save_descriptor(&self, descriptor: &BuilderDescriptor) -> BuildhistResult<()> {
        let bytes = serde_json::to_vec_pretty(descriptor)?;
        let _permit = self.permit().await?;
        self.ensure_dir().await?;
        write_atomic(&self.descriptor_path(), &bytes).await
    }

    /// Every numbered build and log file in the directory.
    ///
    /// A missing directory yields an empty list.
    pub async fn scan(&self) -> BuildhistResult<Vec<RecordFile>> {
        let mut files = vec![];
        for name in self.file_names().await? {
            if let Some((number, kind)) = RecordFile::classify(&name) {
                files.push(RecordFile {
                    number,
                    kind,
                    path: self.dir.join(&name),
                });
            }
        }
        files.sort_by_key(|f| f.number);
        Ok(files)
    }

    /// Highest number any file name starts with
    pub async fn highest_number(&self) -> BuildhistResult<Option<u64>> {
        Ok(self
            .file_names()
            .await?
            .iter()
            .filter_map(|name| numeric_prefix(name))
            .max())
    }

    async fn file_names(&self) -> BuildhistResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(BuildhistError::io(
                    format!("reading builder directory {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut names = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BuildhistError::io("reading builder directory entry", e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn permit(&self) -> BuildhistResult<tokio::sync::SemaphorePermit<'_>> {
        self.io
            .acquire()
            .await
            .map_err(|_| BuildhistError::Internal("record store IO pool closed".into()))
    }
}

/// Write `bytes` to `path` via a temp file and rename
async fn write_atomic(path: &Path, bytes: &[u8]) -> BuildhistResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BuildhistError::Internal(format!("invalid record path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, bytes)
        .await
        .map_err(|e| BuildhistError::io(format!("writing {}", tmp.display()), e))?;

    // Windows cannot rename on top of an existing file
    if cfg!(windows) && fs::try_exists(path).await.unwrap_or(false) {
        fs::remove_file(path)
            .await
            .map_err(|e| BuildhistError::io(format!("replacing {}", path.display()), e))?;
    }

    fs::rename(&tmp, path)
        .await
        .map_err(|e| BuildhistError::io(format!("renaming {} into place", tmp.display()), e))
}
