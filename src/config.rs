use crate::season::Season;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub game: GameConfig,
    pub paths: PathsConfig,
    pub watchdog: WatchdogConfig,
    pub retry: RetryConfig,
    pub backoff: BackoffConfig,
    pub workflow: WorkflowConfig,
    pub seasons_config: SeasonsIniConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub install_dir: PathBuf,
    /// Explicit executable. When unset, the first existing launcher, then
    /// the first existing game binary, in `install_dir`.
    pub executable: Option<PathBuf>,
    /// File names treated as indirect launchers.
    pub launcher_pattern: String,
    pub launchers: Vec<String>,
    /// Names the real game process may run under.
    pub worker_names: Vec<String>,
}

/// File locations. Relative paths resolve against the install dir.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub progress_file: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub stale_timeout_mins: u64,
    pub max_attempt_mins: u64,
    pub resolve_grace_secs: u64,
    pub exit_grace_secs: u64,
    pub kill_grace_secs: u64,
    /// How long a leftover game instance gets to close before it is killed.
    pub stray_close_wait_secs: u64,
    /// Pause after stopping a leftover instance, before relaunching.
    pub relaunch_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub seasons: Vec<Season>,
    /// Package each finished season as a mod folder.
    pub archive: bool,
    pub backup_configs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeasonsIniConfig {
    pub ini_path: PathBuf,
    pub season_key: String,
    /// More files to back up and restore around the run.
    pub extra_backups: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_file: PathBuf,
}

// --- Default implementations ---

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("."),
            executable: None,
            launcher_pattern: r"(?i)^skse(64|vr)?_loader(\.exe)?$".to_string(),
            launchers: vec![
                "skse64_loader.exe".to_string(),
                "sksevr_loader.exe".to_string(),
                "skse_loader.exe".to_string(),
            ],
            worker_names: vec![
                "SkyrimSE.exe".to_string(),
                "SkyrimAE.exe".to_string(),
                "SkyrimVR.exe".to_string(),
                "Skyrim.exe".to_string(),
            ],
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            progress_file: PathBuf::from("PrecacheGrass.txt"),
            output_dir: PathBuf::from("Data/Grass"),
            archive_dir: PathBuf::from("GrassCacheArchives"),
            status_file: PathBuf::from(".precache-harness.status"),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            stale_timeout_mins: 15,
            max_attempt_mins: 480,
            resolve_grace_secs: 5,
            exit_grace_secs: 30,
            kill_grace_secs: 10,
            stray_close_wait_secs: 120,
            relaunch_cooldown_secs: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 120,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            seasons: Season::SEASONAL.to_vec(),
            archive: true,
            backup_configs: true,
        }
    }
}

impl Default for SeasonsIniConfig {
    fn default() -> Self {
        Self {
            ini_path: PathBuf::from("Data/SKSE/Plugins/po3_SeasonsOfSkyrim.ini"),
            season_key: "Season Type".to_string(),
            extra_backups: Vec::new(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("STOP"),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub seasons: Vec<Season>,
    pub install_dir: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    pub stale_timeout_mins: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl HarnessConfig {
    /// Load `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if !overrides.seasons.is_empty() {
            self.workflow.seasons = overrides.seasons;
        }
        if let Some(dir) = overrides.install_dir {
            self.game.install_dir = dir;
        }
        if let Some(exe) = overrides.executable {
            self.game.executable = Some(exe);
        }
        if let Some(mins) = overrides.stale_timeout_mins {
            self.watchdog.stale_timeout_mins = mins;
        }
        if let Some(n) = overrides.max_attempts {
            self.retry.max_attempts = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.check_interval_secs must be > 0".into(),
            ));
        }
        if self.watchdog.stale_timeout_mins == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.stale_timeout_mins must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.backoff.initial_delay_secs > self.backoff.max_delay_secs {
            return Err(ConfigError::Invalid(
                "backoff.initial_delay_secs exceeds backoff.max_delay_secs".into(),
            ));
        }
        if self.workflow.seasons.is_empty() {
            return Err(ConfigError::Invalid("no seasons selected".into()));
        }
        self.launcher_regex()?;
        if !self.game.install_dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "install dir {} does not exist",
                self.game.install_dir.display()
            )));
        }
        Ok(())
    }

    pub fn launcher_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.game.launcher_pattern).map_err(|e| {
            ConfigError::Invalid(format!(
                "game.launcher_pattern {:?}: {e}",
                self.game.launcher_pattern
            ))
        })
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.watchdog.check_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog.stale_timeout_mins * 60)
    }

    pub fn max_attempt_duration(&self) -> Duration {
        Duration::from_secs(self.watchdog.max_attempt_mins * 60)
    }
}
