use crate::config::HarnessConfig;
use std::path::{Path, PathBuf};

/// Resolved file layout of one game installation.
///
/// Every harness artifact lives inside the install directory. Configured
/// paths are taken relative to it unless they are absolute.
#[derive(Debug, Clone)]
pub struct InstallDir {
    root: PathBuf,
    progress_file: PathBuf,
    output_dir: PathBuf,
    archive_dir: PathBuf,
    status_file: PathBuf,
    stop_file: PathBuf,
    seasons_ini: PathBuf,
    extra_backups: Vec<PathBuf>,
}

impl InstallDir {
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        let root = cfg.game.install_dir.clone();
        Self {
            progress_file: resolve(&root, &cfg.paths.progress_file),
            output_dir: resolve(&root, &cfg.paths.output_dir),
            archive_dir: resolve(&root, &cfg.paths.archive_dir),
            status_file: resolve(&root, &cfg.paths.status_file),
            stop_file: resolve(&root, &cfg.shutdown.stop_file),
            seasons_ini: resolve(&root, &cfg.seasons_config.ini_path),
            extra_backups: cfg
                .seasons_config
                .extra_backups
                .iter()
                .map(|p| resolve(&root, p))
                .collect(),
            root,
        }
    }

    /// The game installation root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Progress file the worker appends to and deletes on completion.
    pub fn progress_file(&self) -> &Path {
        &self.progress_file
    }

    /// Directory the worker writes cache files into.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn status_file(&self) -> &Path {
        &self.status_file
    }

    pub fn stop_file(&self) -> &Path {
        &self.stop_file
    }

    pub fn seasons_ini(&self) -> &Path {
        &self.seasons_ini
    }

    /// Config files saved before the run and restored after it.
    pub fn backup_targets(&self) -> Vec<PathBuf> {
        let mut targets = vec![self.seasons_ini.clone()];
        targets.extend(self.extra_backups.iter().cloned());
        targets
    }

    /// Progress locks sit next to the progress file.
    pub fn lock_dir(&self) -> &Path {
        self.progress_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(self.root.as_path())
    }

    /// Path to the whole-run singleton lock.
    pub fn run_lock(&self) -> PathBuf {
        self.root.join(".precache-harness.lock")
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &str) -> HarnessConfig {
        let mut cfg = HarnessConfig::default();
        cfg.game.install_dir = PathBuf::from(root);
        cfg
    }

    #[test]
    fn test_relative_paths_resolve_under_root() {
        let dirs = InstallDir::from_config(&config("/games/skyrim"));
        assert_eq!(dirs.root(), Path::new("/games/skyrim"));
        assert_eq!(
            dirs.progress_file(),
            Path::new("/games/skyrim/PrecacheGrass.txt")
        );
        assert_eq!(dirs.output_dir(), Path::new("/games/skyrim/Data/Grass"));
        assert_eq!(dirs.stop_file(), Path::new("/games/skyrim/STOP"));
        assert_eq!(
            dirs.seasons_ini(),
            Path::new("/games/skyrim/Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini")
        );
        assert_eq!(
            dirs.run_lock(),
            PathBuf::from("/games/skyrim/.precache-harness.lock")
        );
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let mut cfg = config("/games/skyrim");
        cfg.paths.archive_dir = PathBuf::from("/mnt/mods");
        cfg.seasons_config.extra_backups = vec![PathBuf::from("/etc/GrassControl.ini")];
        let dirs = InstallDir::from_config(&cfg);
        assert_eq!(dirs.archive_dir(), Path::new("/mnt/mods"));
        assert_eq!(
            dirs.backup_targets(),
            vec![
                PathBuf::from("/games/skyrim/Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini"),
                PathBuf::from("/etc/GrassControl.ini"),
            ]
        );
    }

    #[test]
    fn test_lock_dir_is_progress_file_parent() {
        let mut cfg = config("/games/skyrim");
        cfg.paths.progress_file = PathBuf::from("Data/PrecacheGrass.txt");
        let dirs = InstallDir::from_config(&cfg);
        assert_eq!(dirs.lock_dir(), Path::new("/games/skyrim/Data"));
    }
}
