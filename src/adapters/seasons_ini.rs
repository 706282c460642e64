/// Seasons INI mutator: writes the `Season Type` key before each generation.
///
/// The file is edited line by line so comments, ordering and unrelated keys
/// survive untouched.
use super::{AdapterError, BackupEntry, BackupHandle, ConfigMutator};
use std::io::Write;
use std::path::{Path, PathBuf};

const BACKUP_SUFFIX: &str = ".harness-backup";

/// Key spellings the seasons plugin accepts, lowercased.
const KEY_ALIASES: &[&str] = &["seasontype", "season"];

pub struct SeasonsIni {
    ini_path: PathBuf,
    key: String,
}

impl SeasonsIni {
    pub fn new(ini_path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            ini_path: ini_path.into(),
            key: key.into(),
        }
    }

    pub fn backup_path(original: &Path) -> PathBuf {
        let mut name = original.as_os_str().to_owned();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    fn is_season_key(&self, key: &str) -> bool {
        let key = key.trim().to_ascii_lowercase();
        key == self.key.to_ascii_lowercase() || KEY_ALIASES.contains(&key.as_str())
    }

    /// Rewrite `contents` so the season key holds `code`.
    fn rewrite(&self, contents: &str, code: u8) -> String {
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let mut replaced = false;

        for line in lines.iter_mut() {
            let trimmed = line.trim_start();
            if trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, _)) = trimmed.split_once('=') else {
                continue;
            };
            if self.is_season_key(key) {
                let indent = &line[..line.len() - trimmed.len()];
                *line = format!("{indent}{} = {code}", key.trim_end());
                replaced = true;
            }
        }

        if !replaced {
            match lines
                .iter()
                .position(|l| l.trim().eq_ignore_ascii_case("[settings]"))
            {
                Some(idx) => lines.insert(idx + 1, format!("{} = {code}", self.key)),
                None => {
                    if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                        lines.push(String::new());
                    }
                    lines.push("[Settings]".to_string());
                    lines.push(format!("{} = {code}", self.key));
                }
            }
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

impl ConfigMutator for SeasonsIni {
    fn backup(&self, paths: &[PathBuf]) -> Result<BackupHandle, AdapterError> {
        let mut handle = BackupHandle::default();
        for original in paths {
            if !original.exists() {
                tracing::warn!(path = %original.display(), "config file not found, not backed up");
                continue;
            }
            let backup = Self::backup_path(original);
            if backup.exists() {
                // Left by a run that never restored; it holds the user's
                // real settings, the live file may not.
                tracing::warn!(backup = %backup.display(), "keeping existing config backup");
            } else {
                std::fs::copy(original, &backup)?;
                tracing::debug!(path = %original.display(), backup = %backup.display(), "backed up config");
            }
            handle.entries.push(BackupEntry {
                original: original.clone(),
                backup,
            });
        }
        Ok(handle)
    }

    fn apply(&self, code: u8) -> Result<(), AdapterError> {
        if code == 0 {
            tracing::debug!("season code 0, leaving seasons config as is");
            return Ok(());
        }
        let contents = match std::fs::read(&self.ini_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let updated = self.rewrite(&contents, code);

        let dir = self
            .ini_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(updated.as_bytes())?;
        tmp.persist(&self.ini_path).map_err(|e| e.error)?;

        tracing::info!(path = %self.ini_path.display(), code, "season type set");
        Ok(())
    }

    fn restore(&self, handle: &BackupHandle) -> Result<(), AdapterError> {
        for entry in &handle.entries {
            if !entry.backup.exists() {
                continue;
            }
            std::fs::copy(&entry.backup, &entry.original)?;
            std::fs::remove_file(&entry.backup)?;
            tracing::info!(path = %entry.original.display(), "restored config");
        }
        Ok(())
    }
}
