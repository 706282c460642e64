mod adapters;
mod config;
mod install_dir;
mod lock;
mod process;
mod progress;
mod retry;
mod season;
mod signals;
mod status;
mod supervisor;
#[cfg(test)]
mod testing;
mod watchdog;
mod workflow;

use adapters::{GrassFiles, SeasonsIni};
use clap::Parser;
use config::{HarnessConfig, Overrides};
use install_dir::InstallDir;
use lock::ProgressLock;
use process::{HandleSettings, ProcessHandle};
use progress::ProgressChannel;
use retry::{BackoffSchedule, RetryController};
use season::Season;
use signals::SignalHandler;
use status::{StatusFile, StatusTracker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{GenerationSupervisor, SupervisorSettings};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use watchdog::WatchdogSettings;
use workflow::{WorkflowOrchestrator, WorkflowSettings};

/// Unattended grass cache pre-generation: launches the game once per season,
/// watches its progress file, restarts it when it crashes or hangs, and
/// packages the results.
#[derive(Parser, Debug)]
#[command(name = "precache-harness", version, about)]
pub struct Cli {
    /// Seasons to generate (winter, spring, summer, autumn, universal).
    /// Default: from config
    #[arg(value_name = "SEASON")]
    seasons: Vec<Season>,

    /// Config file path
    #[arg(short, long, default_value = "harness.toml")]
    config: PathBuf,

    /// Game installation directory (overrides config)
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Executable to launch (overrides config and auto-detection)
    #[arg(long)]
    executable: Option<PathBuf>,

    /// No-activity timeout in minutes (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Max attempts per season (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Discard interrupted progress instead of resuming it
    #[arg(long)]
    fresh: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog checks, retry decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings, errors and the summary
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print current harness state and interrupted generations, then exit
    #[arg(long)]
    status: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            seasons: self.seasons.clone(),
            install_dir: self.install_dir.clone(),
            executable: self.executable.clone(),
            stale_timeout_mins: self.timeout,
            max_attempts: self.retries,
        }
    }

    fn log_filter(&self) -> EnvFilter {
        let level = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut cfg = match HarnessConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    cfg.apply_overrides(cli.overrides());
    let install = InstallDir::from_config(&cfg);

    if cli.status {
        print_status(&install);
        return;
    }

    if let Err(e) = cfg.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let Some(executable) = resolve_executable(&cfg, &install) else {
        tracing::error!(
            install_dir = %install.root().display(),
            "no game executable or script extender loader found"
        );
        std::process::exit(1);
    };

    if cli.dry_run {
        print_dry_run(&cfg, &install, &executable);
        return;
    }

    let code = run(&cli, &cfg, &install, executable).await;
    std::process::exit(code);
}

async fn run(cli: &Cli, cfg: &HarnessConfig, install: &InstallDir, executable: PathBuf) -> i32 {
    let launcher_pattern = match cfg.launcher_regex() {
        Ok(re) => re,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    tracing::info!(
        install_dir = %install.root().display(),
        executable = %executable.display(),
        seasons = ?cfg.workflow.seasons,
        "precache-harness starting"
    );

    let cancel = CancellationToken::new();
    let _signals = match SignalHandler::install(cancel.clone(), install.stop_file().to_path_buf()) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return 1;
        }
    };

    let status = StatusTracker::new(install.status_file().to_path_buf());
    let process = ProcessHandle::new(HandleSettings {
        install_dir: install.root().to_path_buf(),
        launcher_pattern,
        worker_names: cfg.game.worker_names.clone(),
        resolve_grace: Duration::from_secs(cfg.watchdog.resolve_grace_secs),
        resolve_poll: Duration::from_millis(250),
        kill_grace: Duration::from_secs(cfg.watchdog.kill_grace_secs),
        stray_close_wait: Duration::from_secs(cfg.watchdog.stray_close_wait_secs),
        relaunch_cooldown: Duration::from_secs(cfg.watchdog.relaunch_cooldown_secs),
    });
    let supervisor = GenerationSupervisor::new(
        process,
        Arc::new(ProgressChannel::new(install.progress_file())),
        SupervisorSettings {
            executable,
            tick: cfg.tick(),
            watchdog: WatchdogSettings {
                stale_timeout: cfg.stale_timeout(),
                max_duration: cfg.max_attempt_duration(),
            },
            exit_grace: Duration::from_secs(cfg.watchdog.exit_grace_secs),
        },
        status.clone(),
    );

    let grass = Arc::new(GrassFiles::new(
        install.output_dir(),
        install.progress_file(),
        install.archive_dir(),
    ));
    let lock = ProgressLock::new(install.lock_dir());
    let retry = RetryController::new(supervisor, lock.clone(), grass.clone(), status.clone());
    let mutator = Arc::new(SeasonsIni::new(
        install.seasons_ini(),
        cfg.seasons_config.season_key.clone(),
    ));

    let mut orchestrator = WorkflowOrchestrator::new(
        retry,
        lock,
        mutator,
        grass,
        WorkflowSettings {
            seasons: cfg.workflow.seasons.clone(),
            max_attempts: cfg.retry.max_attempts,
            backoff: BackoffSchedule::new(
                Duration::from_secs(cfg.backoff.initial_delay_secs),
                Duration::from_secs(cfg.backoff.max_delay_secs),
            ),
            output_dir: install.output_dir().to_path_buf(),
            run_lock: install.run_lock(),
            backup_targets: install.backup_targets(),
            archive: cfg.workflow.archive,
            backup_configs: cfg.workflow.backup_configs,
            fresh: cli.fresh,
        },
        status.clone(),
    );

    let code = match orchestrator.run(&cancel).await {
        Ok(report) => {
            for line in report.summary_lines() {
                println!("{line}");
            }
            report.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            1
        }
    };
    status.remove();
    tracing::info!(exit_code = code, "precache-harness finished");
    code
}

fn resolve_executable(cfg: &HarnessConfig, install: &InstallDir) -> Option<PathBuf> {
    match &cfg.game.executable {
        Some(exe) if exe.is_absolute() => Some(exe.clone()),
        Some(exe) => Some(install.root().join(exe)),
        None => process::locate_executable(
            install.root(),
            &cfg.game.launchers,
            &cfg.game.worker_names,
        ),
    }
}

fn print_dry_run(cfg: &HarnessConfig, install: &InstallDir, executable: &std::path::Path) {
    println!("precache-harness v{}", env!("CARGO_PKG_VERSION"));
    println!("Install dir:    {}", install.root().display());
    println!("Executable:     {}", executable.display());
    println!("Progress file:  {}", install.progress_file().display());
    println!("Output dir:     {}", install.output_dir().display());
    println!("Seasons config: {}", install.seasons_ini().display());
    let seasons: Vec<String> = cfg.workflow.seasons.iter().map(|s| s.to_string()).collect();
    println!("Seasons:        {}", seasons.join(", "));
    println!(
        "Watchdog:       tick {}s, no-activity {}m, ceiling {}m",
        cfg.watchdog.check_interval_secs,
        cfg.watchdog.stale_timeout_mins,
        cfg.watchdog.max_attempt_mins
    );
    println!(
        "Retries:        {} attempts, backoff {}s..{}s",
        cfg.retry.max_attempts, cfg.backoff.initial_delay_secs, cfg.backoff.max_delay_secs
    );
    println!("Dry run: config validated, not running.");
}

fn print_status(install: &InstallDir) {
    match StatusFile::read(install.status_file()) {
        Ok(Some(data)) => match serde_json::to_string_pretty(&data) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "failed to format status"),
        },
        Ok(None) => println!("No harness running."),
        Err(e) => tracing::error!(error = %e, "failed to read status file"),
    }

    let interrupted = ProgressLock::new(install.lock_dir()).interrupted();
    if interrupted.is_empty() {
        return;
    }
    let entries = ProgressChannel::new(install.progress_file()).snapshot().entries;
    for record in interrupted {
        println!(
            "Interrupted: {} (started {}, pid {}), {} entries recorded; next run resumes it",
            record.work_unit, record.created_at, record.owner_pid, entries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_seasons_and_overrides() {
        let cli = Cli::try_parse_from([
            "precache-harness",
            "winter",
            "AUT",
            "--install-dir",
            "/games/skyrim",
            "--timeout",
            "30",
            "--retries",
            "3",
            "--fresh",
        ])
        .unwrap();
        let o = cli.overrides();
        assert_eq!(o.seasons, vec![Season::Winter, Season::Autumn]);
        assert_eq!(o.install_dir, Some(PathBuf::from("/games/skyrim")));
        assert_eq!(o.stale_timeout_mins, Some(30));
        assert_eq!(o.max_attempts, Some(3));
        assert!(cli.fresh);
        assert_eq!(cli.config, PathBuf::from("harness.toml"));
    }

    #[test]
    fn test_cli_rejects_unknown_season() {
        assert!(Cli::try_parse_from(["precache-harness", "monsoon"]).is_err());
    }

    #[test]
    fn test_cli_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["precache-harness", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_explicit_relative_executable_resolves_under_install_dir() {
        let mut cfg = HarnessConfig::default();
        cfg.game.install_dir = PathBuf::from("/games/skyrim");
        cfg.game.executable = Some(PathBuf::from("SkyrimSE.exe"));
        let install = InstallDir::from_config(&cfg);
        assert_eq!(
            resolve_executable(&cfg, &install),
            Some(PathBuf::from("/games/skyrim/SkyrimSE.exe"))
        );
    }

    #[test]
    fn test_executable_autodetects_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SkyrimSE.exe"), b"").unwrap();
        std::fs::write(dir.path().join("skse64_loader.exe"), b"").unwrap();
        let mut cfg = HarnessConfig::default();
        cfg.game.install_dir = dir.path().to_path_buf();
        let install = InstallDir::from_config(&cfg);
        assert_eq!(
            resolve_executable(&cfg, &install),
            Some(dir.path().join("skse64_loader.exe"))
        );
    }
}
