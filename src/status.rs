/// Status file: writes `.precache-harness.status` as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::season::Season;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Harness states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    Starting,
    Launching,
    Resolving,
    Monitoring,
    Backoff,
    PostProcessing,
    Idle,
    ShuttingDown,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: HarnessState,
    pub work_unit: Option<Season>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_pid: Option<u32>,
    pub progress_entries: u64,
    pub attempt_start: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub completed: Vec<Season>,
    pub failed: Vec<Season>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".harness.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read a status file written by this or another harness.
    pub fn read(path: &Path) -> Result<Option<StatusData>, StatusError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StatusError::Serialize { source: e })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct TrackerState {
    work_unit: Option<Season>,
    attempt: u32,
    max_attempts: u32,
    worker_pid: Option<u32>,
    progress_entries: u64,
    attempt_start: Option<DateTime<Utc>>,
    completed: Vec<Season>,
    failed: Vec<Season>,
}

/// Shared state tracker that builds StatusData for each update.
///
/// Cheap to clone; the supervisor, retry loop and workflow each hold a handle.
#[derive(Clone)]
pub struct StatusTracker {
    file: Option<Arc<StatusFile>>,
    pid: u32,
    state: Arc<Mutex<TrackerState>>,
}

impl StatusTracker {
    /// Create a new tracker writing to `status_path`.
    pub fn new(status_path: PathBuf) -> Self {
        Self::build(Some(StatusFile::new(status_path)))
    }

    /// A tracker that keeps state in memory only.
    pub fn disabled() -> Self {
        Self::build(None)
    }

    fn build(file: Option<StatusFile>) -> Self {
        Self {
            file: file.map(Arc::new),
            pid: std::process::id(),
            state: Arc::new(Mutex::new(TrackerState {
                work_unit: None,
                attempt: 0,
                max_attempts: 0,
                worker_pid: None,
                progress_entries: 0,
                attempt_start: None,
                completed: Vec::new(),
                failed: Vec::new(),
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: HarnessState) {
        let data = self.snapshot(state);
        if let Some(file) = &self.file {
            if let Err(e) = file.write(&data) {
                tracing::warn!(error = %e, "failed to write status file");
            }
        }
    }

    /// Build the payload without writing it.
    pub fn snapshot(&self, state: HarnessState) -> StatusData {
        self.with_state(|s| StatusData {
            pid: self.pid,
            state,
            work_unit: s.work_unit,
            attempt: s.attempt,
            max_attempts: s.max_attempts,
            worker_pid: s.worker_pid,
            progress_entries: s.progress_entries,
            attempt_start: s.attempt_start,
            last_update: Utc::now(),
            completed: s.completed.clone(),
            failed: s.failed.clone(),
        })
    }

    /// Switch to a new work unit.
    pub fn set_work_unit(&self, work_unit: Season, max_attempts: u32) {
        self.with_state(|s| {
            s.work_unit = Some(work_unit);
            s.max_attempts = max_attempts;
            s.attempt = 0;
            s.worker_pid = None;
            s.progress_entries = 0;
        });
    }

    /// Mark the start of a new attempt.
    pub fn set_attempt(&self, attempt: u32) {
        self.with_state(|s| {
            s.attempt = attempt;
            s.attempt_start = Some(Utc::now());
            s.worker_pid = None;
        });
    }

    pub fn set_worker_pid(&self, pid: Option<u32>) {
        self.with_state(|s| s.worker_pid = pid);
    }

    pub fn set_progress_entries(&self, entries: u64) {
        self.with_state(|s| s.progress_entries = entries);
    }

    /// Record a work unit's final result.
    pub fn record_result(&self, work_unit: Season, success: bool) {
        self.with_state(|s| {
            if success {
                s.completed.push(work_unit);
            } else {
                s.failed.push(work_unit);
            }
        });
    }

    /// Remove the status file.
    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to (de)serialize status: {source}")]
    Serialize { source: serde_json::Error },
    #[error("failed to write temp status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read status file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {} -> {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
