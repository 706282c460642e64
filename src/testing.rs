//! Test doubles shared by the supervisor, retry and workflow tests.
use crate::adapters::CompletionProbe;
use crate::process::{ProcessControl, ProcessError, ProcessRecord};
use crate::season::Season;
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Script = Box<dyn FnMut(u32, u32) -> bool + Send>;

/// Counters that stay readable after the fake has been moved into a supervisor.
#[derive(Debug, Default)]
pub struct ScriptCounters {
    pub launches: AtomicU32,
    pub polls: AtomicU32,
    pub terminated: AtomicU32,
}

/// Fake worker driven by a closure.
///
/// The script is called on every liveness poll with `(attempt, poll)`, both
/// 1-based, and returns whether the worker is still alive. It may touch the
/// progress file to simulate the worker's side of the protocol.
pub struct ScriptedProcess {
    script: Script,
    attempt: u32,
    poll: u32,
    exit_code: Option<i32>,
    fail_launch: bool,
    fail_resolve: bool,
    counters: Arc<ScriptCounters>,
}

impl ScriptedProcess {
    pub fn new(script: impl FnMut(u32, u32) -> bool + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            attempt: 0,
            poll: 0,
            exit_code: None,
            fail_launch: false,
            fail_resolve: false,
            counters: Arc::new(ScriptCounters::default()),
        }
    }

    pub fn always_alive() -> Self {
        Self::new(|_, _| true)
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn failing_resolve(mut self) -> Self {
        self.fail_resolve = true;
        self
    }

    pub fn counters(&self) -> Arc<ScriptCounters> {
        Arc::clone(&self.counters)
    }

    pub fn polls(&self) -> u32 {
        self.counters.polls.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> u32 {
        self.counters.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for ScriptedProcess {
    async fn launch(&mut self, executable: &Path) -> Result<ProcessRecord, ProcessError> {
        if self.fail_launch {
            return Err(ProcessError::Launch {
                path: executable.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.attempt += 1;
        self.poll = 0;
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessRecord {
            pid: 1000 + self.attempt,
            name: executable.display().to_string(),
            started_at: Utc::now(),
            command_line: vec![executable.display().to_string()],
            is_indirect: false,
        })
    }

    async fn resolve_effective_worker(
        &mut self,
        record: ProcessRecord,
    ) -> Result<ProcessRecord, ProcessError> {
        if self.fail_resolve {
            return Err(ProcessError::WorkerNotFound {
                launcher: record.name,
                names: vec!["SkyrimSE.exe".to_string()],
                grace: Duration::from_millis(1),
            });
        }
        Ok(ProcessRecord {
            pid: record.pid + 10_000,
            is_indirect: true,
            ..record
        })
    }

    fn is_alive(&mut self, _record: &ProcessRecord) -> bool {
        self.poll += 1;
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        (self.script)(self.attempt, self.poll)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    async fn terminate(&mut self, _record: &ProcessRecord) {
        self.counters.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Append `count` cell lines starting at index `start`.
pub fn append_lines(path: &Path, start: u64, count: u64) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for i in start..start + count {
        writeln!(file, "Tamriel {} {}", i / 64, i % 64).unwrap();
    }
}

pub fn progress_path(dir: &Path) -> PathBuf {
    dir.join("PrecacheGrass.txt")
}

/// Completion probe with a settable answer.
#[derive(Debug, Default)]
pub struct FixedProbe {
    complete: AtomicBool,
}

impl FixedProbe {
    pub fn new(complete: bool) -> Self {
        Self {
            complete: AtomicBool::new(complete),
        }
    }
}

impl CompletionProbe for FixedProbe {
    fn already_complete(&self, _work_unit: Season) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}
