pub mod grass_files;
pub mod seasons_ini;

use crate::season::Season;
use std::path::{Path, PathBuf};

pub use grass_files::GrassFiles;
pub use seasons_ini::SeasonsIni;

/// Errors produced by adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    /// Post-processing found nothing to work with.
    #[error("no {0} grass cache files found")]
    NoOutputs(Season),
}

/// One file saved aside by [`ConfigMutator::backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub original: PathBuf,
    pub backup: PathBuf,
}

/// Everything needed to undo a run's config changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupHandle {
    pub entries: Vec<BackupEntry>,
}

/// Switches the game's configuration between work units.
pub trait ConfigMutator: Send + Sync {
    /// Copy `paths` aside. Missing files are skipped.
    fn backup(&self, paths: &[PathBuf]) -> Result<BackupHandle, AdapterError>;

    /// Point the configuration at the work unit with `code`.
    fn apply(&self, code: u8) -> Result<(), AdapterError>;

    /// Put every backed-up file back. Safe to call more than once.
    fn restore(&self, handle: &BackupHandle) -> Result<(), AdapterError>;
}

/// Turns a finished generation's raw outputs into the deliverable.
pub trait PostProcessor: Send + Sync {
    /// Give plain outputs in `dir` the work unit's `suffix`. Returns how many
    /// files were renamed.
    fn rename_outputs(&self, dir: &Path, suffix: &str) -> Result<usize, AdapterError>;

    /// Package the work unit's outputs from `dir`. Returns the package path.
    fn archive(&self, dir: &Path, work_unit: Season) -> Result<PathBuf, AdapterError>;

    /// Remove leftovers from `dir`. Returns how many files were removed.
    fn cleanup(&self, dir: &Path) -> Result<usize, AdapterError>;
}

/// Decides whether a work unit needs generating at all.
pub trait CompletionProbe: Send + Sync {
    fn already_complete(&self, work_unit: Season) -> bool;
}
