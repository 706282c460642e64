/// Progress channel: the `PrecacheGrass.txt` marker file shared with the worker.
///
/// The worker appends one line per finished cell and deletes the file when the
/// whole cache is generated. The harness only ever looks at existence, size and
/// mtime deltas, so reads here are best-effort and never fail.
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// Point-in-time view of the progress file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub exists: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Completed entries (non-empty lines).
    pub entries: u64,
    /// Last non-empty line, usually the most recent cell identifier.
    pub last_entry: Option<String>,
}

impl ProgressSnapshot {
    /// True if size or mtime moved since `previous`.
    pub fn advanced_since(&self, previous: &ProgressSnapshot) -> bool {
        self.exists && (self.size != previous.size || self.modified != previous.modified)
    }
}

#[derive(Debug)]
pub struct ProgressChannel {
    path: PathBuf,
    deleted_by_self: AtomicBool,
}

impl ProgressChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            deleted_by_self: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty progress file if none exists.
    ///
    /// Existing content is left untouched: that is what lets the worker pick
    /// up where an interrupted attempt stopped.
    pub fn ensure_exists(&self) -> std::io::Result<bool> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                tracing::debug!(path = %self.path.display(), "created progress file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stat and line-count the progress file. Missing or unreadable files
    /// produce a zeroed snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return ProgressSnapshot::default(),
        };

        let mut snapshot = ProgressSnapshot {
            exists: true,
            size: meta.len(),
            modified: meta.modified().ok(),
            ..Default::default()
        };

        // The worker may be mid-write; a torn last line is fine.
        if let Ok(file) = std::fs::File::open(&self.path) {
            for line in BufReader::new(file).split(b'\n').map_while(Result::ok) {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                snapshot.entries += 1;
                snapshot.last_entry = Some(trimmed.to_string());
            }
        }

        snapshot
    }

    /// Delete the progress file on the harness's own behalf.
    ///
    /// The ownership flag is raised before the unlink so the monitor never
    /// reads the disappearance as the worker signalling completion.
    pub fn remove_owned(&self) -> std::io::Result<()> {
        self.deleted_by_self.store(true, Ordering::SeqCst);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "removed progress file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the last deletion was initiated by the harness.
    pub fn owns_deletion(&self) -> bool {
        self.deleted_by_self.load(Ordering::SeqCst)
    }

    /// Forget any previous owned deletion (start of a new attempt).
    pub fn reset_ownership(&self) {
        self.deleted_by_self.store(false, Ordering::SeqCst);
    }
}
