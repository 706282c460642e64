/// Worker process identity: launch, indirect-launcher handoff, liveness, kill.
///
/// The game is usually started through a script-extender loader that spawns the
/// real game process and exits. Watching the loader's pid would report a crash
/// the moment the handoff succeeds, so every attempt resolves the effective
/// worker before liveness polling begins.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Identity of the process currently being supervised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub command_line: Vec<String>,
    /// True when this is the child an indirect launcher handed off to.
    pub is_indirect: bool,
}

/// Errors from launching or resolving the worker.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no worker process matching {names:?} appeared within {grace:?} of launching {launcher}")]
    WorkerNotFound {
        launcher: String,
        names: Vec<String>,
        grace: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited but not yet reaped. Counts as dead.
    Zombie,
    Missing,
}

/// One row of the OS process table.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub command_line: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Start time in clock ticks since boot; only used for ordering.
    pub start_ticks: u64,
    pub state: ProcessState,
}

impl ProcessEntry {
    /// Case-insensitive match against the kernel name or the basename of
    /// argv[0]. Windows-style paths (under Wine/Proton) are split on `\` too.
    pub fn matches_any(&self, names: &[String]) -> bool {
        let argv0 = self
            .command_line
            .first()
            .and_then(|a| a.rsplit(['/', '\\']).next())
            .unwrap_or_default();
        names.iter().any(|want| {
            let want = want.to_ascii_lowercase();
            // The kernel truncates comm to 15 bytes.
            let truncated: String = want.chars().take(15).collect();
            let comm = self.name.to_ascii_lowercase();
            comm == want || comm == truncated || argv0.to_ascii_lowercase() == want
        })
    }
}

/// Read-only view of the OS process table.
pub trait ProcessTable: Send + Sync {
    fn state(&self, pid: u32) -> ProcessState;
    fn entries(&self) -> Vec<ProcessEntry>;
}

/// `ProcessTable` backed by procfs, falling back to a null signal probe where
/// procfs has nothing to say.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcFs {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_entry(&self, pid: u32) -> Option<ProcessEntry> {
        let dir = self.root.join(pid.to_string());
        let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
        let fields = parse_stat(&stat)?;
        let command_line = std::fs::read(dir.join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        Some(ProcessEntry {
            pid,
            name: fields.comm,
            command_line,
            cwd: std::fs::read_link(dir.join("cwd")).ok(),
            start_ticks: fields.start_ticks,
            state: fields.state,
        })
    }
}

impl ProcessTable for ProcFs {
    fn state(&self, pid: u32) -> ProcessState {
        match self.read_entry(pid) {
            Some(entry) => entry.state,
            None => signal_probe(pid),
        }
    }

    fn entries(&self) -> Vec<ProcessEntry> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, root = %self.root.display(), "failed to list process table");
                return Vec::new();
            }
        };
        dir.flatten()
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| self.read_entry(pid))
            .collect()
    }
}

pub(crate) struct StatFields {
    pub comm: String,
    pub state: ProcessState,
    pub start_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The comm field may itself contain spaces and
/// parentheses, so it is delimited by the first `(` and the last `)`.
pub(crate) fn parse_stat(stat: &str) -> Option<StatFields> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is field 3 (state); starttime is field 22.
    let state = match rest.first()?.chars().next()? {
        'Z' | 'X' | 'x' => ProcessState::Zombie,
        _ => ProcessState::Running,
    };
    let start_ticks = rest.get(19)?.parse().ok()?;
    Some(StatFields {
        comm,
        state,
        start_ticks,
    })
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative pids address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Existence check via signal 0.
pub fn signal_probe(pid: u32) -> ProcessState {
    let Some(pid) = to_pid(pid) else {
        return ProcessState::Missing;
    };
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => ProcessState::Running,
        Err(_) => ProcessState::Missing,
    }
}

/// Whether `pid` refers to a live (non-zombie) process.
pub fn pid_is_running(pid: u32) -> bool {
    ProcFs::default().state(pid) == ProcessState::Running
}

fn send_signal(pid: u32, signal: Signal, group: bool) {
    let Some(target) = to_pid(pid) else {
        return;
    };
    let result = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, ?signal, error = %e, "failed to signal process"),
    }
}

/// Pick the executable to launch: the first script-extender loader present,
/// else the first direct game executable.
pub fn locate_executable(
    install_dir: &Path,
    launchers: &[String],
    direct: &[String],
) -> Option<PathBuf> {
    if let Some(path) = launchers
        .iter()
        .map(|name| install_dir.join(name))
        .find(|p| p.is_file())
    {
        return Some(path);
    }
    let path = direct
        .iter()
        .map(|name| install_dir.join(name))
        .find(|p| p.is_file())?;
    tracing::warn!(
        executable = %path.display(),
        "no script extender loader found, launching the game directly"
    );
    Some(path)
}

/// Operations the supervisor needs from a worker process.
#[async_trait]
pub trait ProcessControl: Send {
    async fn launch(&mut self, executable: &Path) -> Result<ProcessRecord, ProcessError>;
    async fn resolve_effective_worker(
        &mut self,
        record: ProcessRecord,
    ) -> Result<ProcessRecord, ProcessError>;
    fn is_alive(&mut self, record: &ProcessRecord) -> bool;
    /// Exit code of the launched process, once it has been observed.
    fn exit_code(&self) -> Option<i32>;
    /// Best-effort stop. Never fails.
    async fn terminate(&mut self, record: &ProcessRecord);
}

/// Settings for [`ProcessHandle`].
#[derive(Debug, Clone)]
pub struct HandleSettings {
    pub install_dir: PathBuf,
    pub launcher_pattern: Regex,
    pub worker_names: Vec<String>,
    pub resolve_grace: Duration,
    pub resolve_poll: Duration,
    pub kill_grace: Duration,
    pub stray_close_wait: Duration,
    pub relaunch_cooldown: Duration,
}

pub struct ProcessHandle<T: ProcessTable = ProcFs> {
    table: T,
    settings: HandleSettings,
    child: Option<Child>,
    baseline: HashSet<u32>,
    launched_indirect: bool,
    exit_code: Option<i32>,
}

impl ProcessHandle<ProcFs> {
    pub fn new(settings: HandleSettings) -> Self {
        Self::with_table(ProcFs::default(), settings)
    }
}

impl<T: ProcessTable> ProcessHandle<T> {
    pub fn with_table(table: T, settings: HandleSettings) -> Self {
        Self {
            table,
            settings,
            child: None,
            baseline: HashSet::new(),
            launched_indirect: false,
            exit_code: None,
        }
    }

    pub fn is_indirect_launcher(&self, executable: &Path) -> bool {
        executable
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.settings.launcher_pattern.is_match(n))
    }

    fn in_install_dir(&self, entry: &ProcessEntry) -> bool {
        let Some(cwd) = entry.cwd.as_deref() else {
            // cwd unreadable (other user); the name match has to do.
            return true;
        };
        let want = self
            .settings
            .install_dir
            .canonicalize()
            .unwrap_or_else(|_| self.settings.install_dir.clone());
        cwd == want || cwd == self.settings.install_dir
    }

    fn matching_workers(&self) -> Vec<ProcessEntry> {
        self.table
            .entries()
            .into_iter()
            .filter(|e| e.state == ProcessState::Running)
            .filter(|e| e.matches_any(&self.settings.worker_names))
            .filter(|e| self.in_install_dir(e))
            .collect()
    }

    /// Game instances in the install dir other than this process.
    fn strays(&self) -> Vec<ProcessEntry> {
        let own = std::process::id();
        self.matching_workers()
            .into_iter()
            .filter(|e| e.pid != own)
            .collect()
    }

    /// Let an instance left over from an earlier attempt close on its own,
    /// stop it if it overstays, then cool down before the next launch.
    async fn stop_strays(&mut self) {
        let mut strays = self.strays();
        if strays.is_empty() {
            return;
        }
        tracing::warn!(
            count = strays.len(),
            wait_secs = self.settings.stray_close_wait.as_secs(),
            "previous game instance still running, waiting for it to close"
        );

        let deadline = Instant::now() + self.settings.stray_close_wait;
        while !strays.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(self.settings.resolve_poll).await;
            strays = self.strays();
        }

        for stray in &strays {
            tracing::warn!(pid = stray.pid, name = %stray.name, "stopping leftover worker process");
            self.stop_pid(stray.pid, false).await;
        }
        tokio::time::sleep(self.settings.relaunch_cooldown).await;
    }

    async fn stop_pid(&mut self, pid: u32, group: bool) {
        send_signal(pid, Signal::SIGTERM, group);
        let deadline = Instant::now() + self.settings.kill_grace;
        while Instant::now() < deadline {
            if self.table.state(pid) != ProcessState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        send_signal(pid, Signal::SIGKILL, group);
    }
}

#[async_trait]
impl<T: ProcessTable> ProcessControl for ProcessHandle<T> {
    async fn launch(&mut self, executable: &Path) -> Result<ProcessRecord, ProcessError> {
        std::fs::metadata(executable).map_err(|e| ProcessError::Launch {
            path: executable.to_path_buf(),
            source: e,
        })?;

        self.stop_strays().await;
        self.baseline = self.table.entries().iter().map(|e| e.pid).collect();
        self.exit_code = None;
        self.launched_indirect = self.is_indirect_launcher(executable);

        tracing::info!(
            executable = %executable.display(),
            cwd = %self.settings.install_dir.display(),
            indirect = self.launched_indirect,
            "launching worker"
        );

        let child = Command::new(executable)
            .current_dir(&self.settings.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0) // New process group for clean kill
            .spawn()
            .map_err(|e| ProcessError::Launch {
                path: executable.to_path_buf(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        self.child = Some(child);
        tracing::info!(pid, "worker process started");

        Ok(ProcessRecord {
            pid,
            name: executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            started_at: Utc::now(),
            command_line: vec![executable.display().to_string()],
            is_indirect: false,
        })
    }

    async fn resolve_effective_worker(
        &mut self,
        record: ProcessRecord,
    ) -> Result<ProcessRecord, ProcessError> {
        if !self.launched_indirect {
            return Ok(record);
        }

        tracing::info!(launcher_pid = record.pid, "waiting for launcher to hand off to worker");
        let deadline = Instant::now() + self.settings.resolve_grace;
        loop {
            // Reap the launcher once it exits so it never lingers as a zombie.
            if let Some(child) = self.child.as_mut() {
                let _ = child.try_wait();
            }

            let found = self
                .matching_workers()
                .into_iter()
                .filter(|e| e.pid != record.pid && !self.baseline.contains(&e.pid))
                .max_by_key(|e| e.start_ticks);

            if let Some(worker) = found {
                tracing::info!(
                    launcher_pid = record.pid,
                    worker_pid = worker.pid,
                    name = %worker.name,
                    "resolved effective worker"
                );
                return Ok(ProcessRecord {
                    pid: worker.pid,
                    name: worker.name,
                    started_at: Utc::now(),
                    command_line: worker.command_line,
                    is_indirect: true,
                });
            }

            if Instant::now() >= deadline {
                return Err(ProcessError::WorkerNotFound {
                    launcher: record.name,
                    names: self.settings.worker_names.clone(),
                    grace: self.settings.resolve_grace,
                });
            }
            tokio::time::sleep(self.settings.resolve_poll).await;
        }
    }

    fn is_alive(&mut self, record: &ProcessRecord) -> bool {
        if !record.is_indirect {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.exit_code = status.code();
                        return false;
                    }
                    Ok(None) => return true,
                    Err(e) => {
                        tracing::debug!(error = %e, pid = record.pid, "try_wait failed, checking process table");
                    }
                }
            }
        }
        self.table.state(record.pid) == ProcessState::Running
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    async fn terminate(&mut self, record: &ProcessRecord) {
        if record.pid == 0 {
            return;
        }
        tracing::info!(pid = record.pid, indirect = record.is_indirect, "terminating worker");

        if record.is_indirect {
            self.stop_pid(record.pid, false).await;
            if let Some(child) = self.child.as_mut() {
                let _ = child.try_wait();
            }
            return;
        }

        let Some(mut child) = self.child.take() else {
            self.stop_pid(record.pid, true).await;
            return;
        };
        send_signal(record.pid, Signal::SIGTERM, true);
        match tokio::time::timeout(self.settings.kill_grace, child.wait()).await {
            Ok(Ok(status)) => self.exit_code = status.code(),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to wait for worker"),
            Err(_) => {
                tracing::warn!(pid = record.pid, "worker ignored SIGTERM, sending SIGKILL");
                send_signal(record.pid, Signal::SIGKILL, true);
                let _ = child.wait().await;
            }
        }
        self.child = Some(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    // Far above any kernel pid_max, so signal 0 always reports ESRCH.
    const IMPOSSIBLE_PID: u32 = 40_000_000;

    fn settings(dir: &Path, names: &[&str]) -> HandleSettings {
        HandleSettings {
            install_dir: dir.to_path_buf(),
            launcher_pattern: Regex::new(r"(?i)^skse(64|vr)?_loader(\.exe)?$").unwrap(),
            worker_names: names.iter().map(|n| n.to_string()).collect(),
            resolve_grace: Duration::from_secs(3),
            resolve_poll: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
            stray_close_wait: Duration::from_secs(5),
            relaunch_cooldown: Duration::from_millis(10),
        }
    }

    /// Process table holding one game instance that exits after `lifetime`
    /// calls to `entries`.
    struct ClosingTable {
        install_dir: PathBuf,
        lifetime: u32,
        listed: std::sync::atomic::AtomicU32,
    }

    impl ClosingTable {
        fn gone(&self) -> bool {
            self.listed.load(std::sync::atomic::Ordering::SeqCst) > self.lifetime
        }
    }

    impl ProcessTable for ClosingTable {
        fn state(&self, _pid: u32) -> ProcessState {
            if self.gone() {
                ProcessState::Missing
            } else {
                ProcessState::Running
            }
        }

        fn entries(&self) -> Vec<ProcessEntry> {
            self.listed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.gone() {
                return Vec::new();
            }
            vec![ProcessEntry {
                pid: IMPOSSIBLE_PID,
                name: "SkyrimSE.exe".to_string(),
                command_line: vec!["SkyrimSE.exe".to_string()],
                cwd: Some(self.install_dir.clone()),
                start_ticks: 1,
                state: ProcessState::Running,
            }]
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fake_proc(root: &Path, pid: u32, comm: &str, state: char) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        // Everything after the state field; starttime (field 22) = 4242.
        let mut fields = vec!["0".to_string(); 49];
        fields[18] = "4242".to_string();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) {state} {}", fields.join(" ")),
        )
        .unwrap();
        std::fs::write(dir.join("cmdline"), format!("C:\\Games\\Skyrim\\{comm}\0-flag\0")).unwrap();
    }

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let line = "1234 (Skyrim (SE).exe) S 1 1234 1234 0 -1 4194560 0 0 0 0 5 2 0 0 20 0 1 0 98765 0 0";
        let parsed = parse_stat(line).unwrap();
        assert_eq!(parsed.comm, "Skyrim (SE).exe");
        assert_eq!(parsed.state, ProcessState::Running);
        assert_eq!(parsed.start_ticks, 98765);
    }

    #[test]
    fn test_parse_stat_zombie_state() {
        let line = "77 (SkyrimSE.exe) Z 1 77 77 0 -1 4194560 0 0 0 0 5 2 0 0 20 0 1 0 555 0 0";
        assert_eq!(parse_stat(line).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("not a stat line").is_none());
    }

    #[test]
    fn test_procfs_reports_zombie_as_not_running() {
        let root = tempdir().unwrap();
        fake_proc(root.path(), 4321, "SkyrimSE.exe", 'Z');
        fake_proc(root.path(), 4322, "SkyrimSE.exe", 'S');
        let table = ProcFs::with_root(root.path());
        assert_eq!(table.state(4321), ProcessState::Zombie);
        assert_eq!(table.state(4322), ProcessState::Running);
        assert_eq!(table.state(IMPOSSIBLE_PID), ProcessState::Missing);
    }

    #[test]
    fn test_procfs_entries_read_cmdline() {
        let root = tempdir().unwrap();
        fake_proc(root.path(), 10, "SkyrimSE.exe", 'R');
        std::fs::create_dir_all(root.path().join("self")).unwrap();
        let entries = ProcFs::with_root(root.path()).entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command_line[1], "-flag");
        assert_eq!(entries[0].start_ticks, 4242);
    }

    #[test]
    fn test_matches_any_by_windows_argv0() {
        let entry = ProcessEntry {
            pid: 1,
            name: "wine64-preloade".to_string(),
            command_line: vec!["C:\\Games\\Skyrim\\SkyrimSE.exe".to_string()],
            cwd: None,
            start_ticks: 0,
            state: ProcessState::Running,
        };
        assert!(entry.matches_any(&["skyrimse.exe".to_string()]));
        assert!(!entry.matches_any(&["SkyrimVR.exe".to_string()]));
    }

    #[test]
    fn test_matches_any_truncated_comm() {
        let entry = ProcessEntry {
            pid: 1,
            name: "SkyrimSpecialEd".to_string(),
            command_line: vec![],
            cwd: None,
            start_ticks: 0,
            state: ProcessState::Running,
        };
        assert!(entry.matches_any(&["SkyrimSpecialEdition.exe".to_string()]));
    }

    #[test]
    fn test_signal_probe_never_targets_groups() {
        assert_eq!(signal_probe(0), ProcessState::Missing);
        assert_eq!(signal_probe(IMPOSSIBLE_PID), ProcessState::Missing);
        assert_eq!(signal_probe(std::process::id()), ProcessState::Running);
    }

    #[test]
    fn test_locate_executable_prefers_loader() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("SkyrimSE.exe"), "").unwrap();
        std::fs::write(dir.path().join("skse64_loader.exe"), "").unwrap();
        let found = locate_executable(
            dir.path(),
            &["skse64_loader.exe".to_string()],
            &["SkyrimSE.exe".to_string()],
        )
        .unwrap();
        assert!(found.ends_with("skse64_loader.exe"));
    }

    #[test]
    fn test_locate_executable_falls_back_to_direct() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("SkyrimSE.exe"), "").unwrap();
        let found = locate_executable(
            dir.path(),
            &["skse64_loader.exe".to_string()],
            &["SkyrimSE.exe".to_string()],
        )
        .unwrap();
        assert!(found.ends_with("SkyrimSE.exe"));
        assert!(locate_executable(dir.path(), &[], &[]).is_none());
    }

    #[test]
    fn test_indirect_launcher_detection() {
        let dir = tempdir().unwrap();
        let handle = ProcessHandle::new(settings(dir.path(), &["SkyrimSE.exe"]));
        assert!(handle.is_indirect_launcher(Path::new("/games/skse64_loader.exe")));
        assert!(handle.is_indirect_launcher(Path::new("SKSE_LOADER.EXE")));
        assert!(!handle.is_indirect_launcher(Path::new("/games/SkyrimSE.exe")));
    }

    #[tokio::test]
    async fn test_launch_missing_executable_fails() {
        let dir = tempdir().unwrap();
        let mut handle = ProcessHandle::new(settings(dir.path(), &["nothing-matches"]));
        let err = handle
            .launch(&dir.path().join("SkyrimSE.exe"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Launch { .. }));
        assert!(err.to_string().contains("failed to launch"));
    }

    #[tokio::test]
    async fn test_launch_non_executable_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game");
        std::fs::write(&path, "not a program").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let mut handle = ProcessHandle::new(settings(dir.path(), &["nothing-matches"]));
        assert!(matches!(
            handle.launch(&path).await.unwrap_err(),
            ProcessError::Launch { .. }
        ));
    }

    #[tokio::test]
    async fn test_direct_launch_alive_then_terminated() {
        let dir = tempdir().unwrap();
        let exe = write_script(dir.path(), "game", "sleep 30");
        let mut handle = ProcessHandle::new(settings(dir.path(), &["nothing-matches"]));

        let record = handle.launch(&exe).await.unwrap();
        let record = handle.resolve_effective_worker(record).await.unwrap();
        assert!(!record.is_indirect);
        assert!(record.pid > 0);
        assert!(handle.is_alive(&record));

        handle.terminate(&record).await;
        assert!(!handle.is_alive(&record));
        // Terminating twice is harmless.
        handle.terminate(&record).await;
    }

    #[tokio::test]
    async fn test_exit_code_observed_after_crash() {
        let dir = tempdir().unwrap();
        let exe = write_script(dir.path(), "game", "exit 3");
        let mut handle = ProcessHandle::new(settings(dir.path(), &["nothing-matches"]));
        let record = handle.launch(&exe).await.unwrap();

        for _ in 0..50 {
            if !handle.is_alive(&record) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!handle.is_alive(&record));
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_resolve_follows_launcher_handoff() {
        let dir = tempdir().unwrap();
        let exe = write_script(dir.path(), "skse64_loader", "sleep 30 &\nexit 0");
        let mut handle = ProcessHandle::new(settings(dir.path(), &["sleep"]));

        let launcher = handle.launch(&exe).await.unwrap();
        let worker = handle.resolve_effective_worker(launcher.clone()).await.unwrap();
        assert!(worker.is_indirect);
        assert_ne!(worker.pid, launcher.pid);
        assert_eq!(worker.name, "sleep");
        assert!(handle.is_alive(&worker));

        handle.terminate(&worker).await;
        for _ in 0..20 {
            if !handle.is_alive(&worker) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!handle.is_alive(&worker));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_resolve_fails_when_launcher_spawns_nothing() {
        let dir = tempdir().unwrap();
        let exe = write_script(dir.path(), "skse64_loader", "exit 0");
        let mut s = settings(dir.path(), &["SkyrimSE.exe"]);
        s.resolve_grace = Duration::from_millis(300);
        let mut handle = ProcessHandle::new(s);

        let launcher = handle.launch(&exe).await.unwrap();
        let err = handle.resolve_effective_worker(launcher).await.unwrap_err();
        assert!(matches!(err, ProcessError::WorkerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stray_instance_closing_on_its_own_is_waited_for() {
        let dir = tempdir().unwrap();
        let table = ClosingTable {
            install_dir: dir.path().to_path_buf(),
            lifetime: 3,
            listed: std::sync::atomic::AtomicU32::new(0),
        };
        let mut s = settings(dir.path(), &["SkyrimSE.exe"]);
        s.relaunch_cooldown = Duration::from_millis(100);
        let mut handle = ProcessHandle::with_table(table, s);

        let started = Instant::now();
        handle.stop_strays().await;
        let waited = started.elapsed();

        assert!(handle.table.gone());
        assert!(handle.strays().is_empty());
        // Polled until it closed, well short of the close-wait, then cooled down.
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_strays_means_no_wait() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path(), &["nothing-matches"]);
        s.relaunch_cooldown = Duration::from_secs(5);
        let mut handle = ProcessHandle::new(s);

        let started = Instant::now();
        handle.stop_strays().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stray_instance_outstaying_close_wait_is_killed() {
        let dir = tempdir().unwrap();
        let mut stray = std::process::Command::new("sleep")
            .arg("30")
            .current_dir(dir.path())
            .spawn()
            .unwrap();
        let mut s = settings(dir.path(), &["sleep"]);
        s.stray_close_wait = Duration::from_millis(200);
        s.relaunch_cooldown = Duration::from_millis(50);
        let mut handle = ProcessHandle::new(s);

        let started = Instant::now();
        handle.stop_strays().await;
        assert!(started.elapsed() >= Duration::from_millis(250));

        let mut exited = None;
        for _ in 0..50 {
            exited = stray.try_wait().unwrap();
            if exited.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(exited.is_some(), "stray instance still running");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreaped_child_is_a_zombie() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let mut state = ProcessState::Running;
        for _ in 0..50 {
            state = ProcFs::default().state(pid);
            if state != ProcessState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(state, ProcessState::Zombie);
        assert!(!pid_is_running(pid));
        child.wait().unwrap();
    }
}
