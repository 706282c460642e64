/// Progress lock: durable "generation in flight" marker, one per work unit.
///
/// Written before the first attempt of a work unit and removed once the unit
/// reaches a final result. A lock still on disk when the harness starts means
/// the previous run died mid-generation; its progress file must be kept so the
/// worker can resume from it.
///
/// Uses atomic write pattern: write to temp file then rename without clobbering.
use crate::process::pid_is_running;
use crate::season::Season;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// On-disk lock payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressLockRecord {
    pub work_unit: Season,
    pub owner_pid: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{work_unit} generation is already running under pid {owner_pid}")]
    AlreadyLocked { work_unit: Season, owner_pid: u32 },
    #[error("lock file {} kept changing while acquiring it", path.display())]
    Contended { path: PathBuf },
    #[error("lock file I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "progress file {} belongs to the interrupted {holder} generation, \
         finish {holder} first or rerun with --fresh to discard it",
        path.display()
    )]
    ProgressHeld { holder: Season, path: PathBuf },
    #[error("corrupt lock file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProgressLock {
    dir: PathBuf,
}

impl ProgressLock {
    /// Locks live next to the progress file, inside `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, work_unit: Season) -> PathBuf {
        self.dir.join(format!(".precache-{}.lock", work_unit.id()))
    }

    /// Take the lock for `work_unit`.
    ///
    /// A lock whose owner is gone is reclaimed. A lock held by this very
    /// process is returned as-is.
    pub fn acquire(&self, work_unit: Season) -> Result<ProgressLockRecord, LockError> {
        let path = self.path_for(work_unit);
        let own_pid = std::process::id();

        for _ in 0..3 {
            let record = ProgressLockRecord {
                work_unit,
                owner_pid: own_pid,
                created_at: Utc::now(),
            };
            match write_noclobber(&self.dir, &path, &record) {
                Ok(true) => {
                    tracing::debug!(%work_unit, path = %path.display(), "acquired progress lock");
                    return Ok(record);
                }
                Ok(false) => {}
                Err(source) => return Err(LockError::Io { path, source }),
            }

            match self.read(work_unit) {
                Ok(Some(existing)) if existing.owner_pid == own_pid => return Ok(existing),
                Ok(Some(existing)) if pid_is_running(existing.owner_pid) => {
                    return Err(LockError::AlreadyLocked {
                        work_unit,
                        owner_pid: existing.owner_pid,
                    });
                }
                Ok(Some(existing)) => {
                    tracing::info!(
                        %work_unit,
                        stale_pid = existing.owner_pid,
                        since = %existing.created_at,
                        "reclaiming stale progress lock"
                    );
                }
                // Released between our write and our read.
                Ok(None) => continue,
                Err(e) => tracing::warn!(error = %e, "discarding unreadable progress lock"),
            }
            remove_if_present(&path).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        Err(LockError::Contended { path })
    }

    /// Remove the lock. Missing locks are fine.
    pub fn release(&self, work_unit: Season) -> Result<(), LockError> {
        let path = self.path_for(work_unit);
        remove_if_present(&path).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(%work_unit, "released progress lock");
        Ok(())
    }

    pub fn is_locked(&self, work_unit: Season) -> bool {
        self.path_for(work_unit).exists()
    }

    /// The first work unit holding a lock, if any. While one does, the
    /// progress file is its resume point and must stay on disk.
    pub fn holder(&self) -> Option<Season> {
        Season::ALL.into_iter().find(|s| self.is_locked(*s))
    }

    pub fn read(&self, work_unit: Season) -> Result<Option<ProgressLockRecord>, LockError> {
        let path = self.path_for(work_unit);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockError::Io { path, source }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| LockError::Corrupt { path, source })
    }

    /// Locks left behind by a harness that is no longer running.
    pub fn interrupted(&self) -> Vec<ProgressLockRecord> {
        let own_pid = std::process::id();
        Season::ALL
            .iter()
            .filter_map(|s| self.read(*s).ok().flatten())
            .filter(|r| r.owner_pid != own_pid && !pid_is_running(r.owner_pid))
            .collect()
    }
}

/// Write `record` to `path` only if nothing is there yet. Returns false when
/// the path already exists.
fn write_noclobber(dir: &Path, path: &Path, record: &ProgressLockRecord) -> std::io::Result<bool> {
    let json = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const IMPOSSIBLE_PID: u32 = 40_000_000;

    fn plant(lock: &ProgressLock, work_unit: Season, owner_pid: u32) {
        let record = ProgressLockRecord {
            work_unit,
            owner_pid,
            created_at: Utc::now(),
        };
        std::fs::write(
            lock.path_for(work_unit),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_acquire_writes_record() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        let record = lock.acquire(Season::Winter).unwrap();
        assert_eq!(record.owner_pid, std::process::id());
        assert!(lock.is_locked(Season::Winter));
        assert!(!lock.is_locked(Season::Spring));
        assert_eq!(lock.read(Season::Winter).unwrap(), Some(record));
    }

    #[test]
    fn test_acquire_is_reentrant_for_own_process() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        let first = lock.acquire(Season::Summer).unwrap();
        let second = lock.acquire(Season::Summer).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        plant(&lock, Season::Autumn, IMPOSSIBLE_PID);

        let record = lock.acquire(Season::Autumn).unwrap();
        assert_eq!(record.owner_pid, std::process::id());
    }

    #[test]
    fn test_live_owner_rejects_acquire() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        plant(&lock, Season::Winter, other.id());

        let err = lock.acquire(Season::Winter).unwrap_err();
        assert!(matches!(
            err,
            LockError::AlreadyLocked { owner_pid, .. } if owner_pid == other.id()
        ));
        // The other harness's lock is untouched.
        assert_eq!(lock.read(Season::Winter).unwrap().unwrap().owner_pid, other.id());

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_corrupt_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        std::fs::write(lock.path_for(Season::Spring), "{ not json").unwrap();
        assert!(matches!(
            lock.read(Season::Spring),
            Err(LockError::Corrupt { .. })
        ));
        lock.acquire(Season::Spring).unwrap();
        assert!(lock.read(Season::Spring).unwrap().is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        lock.acquire(Season::Universal).unwrap();
        lock.release(Season::Universal).unwrap();
        assert!(!lock.is_locked(Season::Universal));
        lock.release(Season::Universal).unwrap();
    }

    #[test]
    fn test_interrupted_lists_only_dead_owners() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        plant(&lock, Season::Winter, IMPOSSIBLE_PID);
        lock.acquire(Season::Summer).unwrap();

        let stale = lock.interrupted();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].work_unit, Season::Winter);
    }

    #[test]
    fn test_holder_reports_any_locked_unit() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        assert_eq!(lock.holder(), None);
        plant(&lock, Season::Autumn, IMPOSSIBLE_PID);
        assert_eq!(lock.holder(), Some(Season::Autumn));
        lock.release(Season::Autumn).unwrap();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let lock = ProgressLock::new(dir.path());
        lock.acquire(Season::Winter).unwrap();
        lock.acquire(Season::Winter).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".precache-winter.lock".to_string()]);
    }
}
