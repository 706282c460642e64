/// Workflow orchestrator: generates every selected season in turn.
///
/// Per run: take the install-wide run lock, put interrupted generations first,
/// back up configs once. Per season: switch the seasons config, run the retry
/// controller, post-process on success. Configs are restored on every exit
/// path, including cancellation and fatal errors.
use crate::adapters::{AdapterError, BackupHandle, ConfigMutator, PostProcessor};
use crate::lock::{LockError, ProgressLock};
use crate::process::ProcessControl;
use crate::retry::{BackoffSchedule, FinalResult, RetryController};
use crate::season::Season;
use crate::signals::EXIT_INTERRUPTED;
use crate::status::{HarnessState, StatusTracker};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("another harness is already running against this installation ({})", path.display())]
    RunLocked { path: PathBuf },
    #[error(transparent)]
    AlreadyLocked(#[from] LockError),
    #[error("adapter failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub seasons: Vec<Season>,
    pub max_attempts: u32,
    pub backoff: BackoffSchedule,
    pub output_dir: PathBuf,
    pub run_lock: PathBuf,
    pub backup_targets: Vec<PathBuf>,
    pub archive: bool,
    pub backup_configs: bool,
    /// Throw away interrupted progress instead of resuming it.
    pub fresh: bool,
}

/// What happened to one season.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub work_unit: Season,
    pub result: FinalResult,
    pub backoff_slept: Vec<Duration>,
    pub renamed: usize,
    pub archive: Option<PathBuf>,
    /// Post-processing failure after a successful generation.
    pub post_error: Option<String>,
}

impl UnitReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_success() && self.post_error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowReport {
    pub units: Vec<UnitReport>,
    /// Seasons that were never started because the run was cancelled.
    pub skipped: Vec<Season>,
    pub cancelled: bool,
}

impl WorkflowReport {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.skipped.is_empty() && self.units.iter().all(UnitReport::succeeded)
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_INTERRUPTED
        } else if self.all_succeeded() {
            0
        } else {
            1
        }
    }

    /// One line per season, for the end-of-run summary.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .units
            .iter()
            .map(|u| {
                let outcome = match &u.result {
                    FinalResult::Success { attempts: 0 } => "already generated".to_string(),
                    FinalResult::Success { attempts } => {
                        format!("generated in {attempts} attempt(s), {} file(s)", u.renamed)
                    }
                    FinalResult::ExhaustedRetries {
                        abandoned: true, ..
                    } => "interrupted, will resume on next run".to_string(),
                    FinalResult::ExhaustedRetries {
                        attempts,
                        last_reason,
                        ..
                    } => format!("FAILED after {attempts} attempt(s): {last_reason}"),
                };
                match &u.post_error {
                    Some(e) => format!("{}: {outcome}; post-processing failed: {e}", u.work_unit),
                    None => format!("{}: {outcome}", u.work_unit),
                }
            })
            .collect();
        lines.extend(self.skipped.iter().map(|s| format!("{s}: not started")));
        lines
    }
}

pub struct WorkflowOrchestrator<P: ProcessControl> {
    retry: RetryController<P>,
    lock: ProgressLock,
    mutator: Arc<dyn ConfigMutator>,
    post: Arc<dyn PostProcessor>,
    settings: WorkflowSettings,
    status: StatusTracker,
}

impl<P: ProcessControl> WorkflowOrchestrator<P> {
    pub fn new(
        retry: RetryController<P>,
        lock: ProgressLock,
        mutator: Arc<dyn ConfigMutator>,
        post: Arc<dyn PostProcessor>,
        settings: WorkflowSettings,
        status: StatusTracker,
    ) -> Self {
        Self {
            retry,
            lock,
            mutator,
            post,
            settings,
            status,
        }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<WorkflowReport, WorkflowError> {
        let _run_lock = acquire_run_lock(&self.settings.run_lock)?;
        self.status.update(HarnessState::Starting);

        let queue = self.plan()?;

        let backup = if self.settings.backup_configs {
            self.mutator.backup(&self.settings.backup_targets)?
        } else {
            BackupHandle::default()
        };

        let result = self.run_units(&queue, cancel).await;

        self.status.update(HarnessState::ShuttingDown);
        if let Err(e) = self.mutator.restore(&backup) {
            tracing::error!(error = %e, "failed to restore config backups");
            if result.is_ok() {
                return Err(e.into());
            }
        }
        result
    }

    /// Order the selected seasons, interrupted generations first.
    fn plan(&mut self) -> Result<Vec<Season>, WorkflowError> {
        let interrupted = self.lock.interrupted();
        let channel = Arc::clone(self.retry.supervisor().channel());

        if self.settings.fresh {
            for record in &interrupted {
                tracing::warn!(work_unit = %record.work_unit, "discarding interrupted generation");
                self.lock.release(record.work_unit)?;
            }
            if let Some(holder) = self.lock.holder() {
                tracing::warn!(%holder, "progress file is still locked, not discarding it");
            } else if channel.snapshot().exists {
                channel.remove_owned().map_err(|source| WorkflowError::Io {
                    path: channel.path().to_path_buf(),
                    source,
                })?;
            }
            return Ok(self.settings.seasons.clone());
        }

        let mut queue = Vec::with_capacity(self.settings.seasons.len());
        for record in &interrupted {
            if !self.settings.seasons.contains(&record.work_unit) {
                // The progress file on disk belongs to this season; nothing
                // else can run until it is finished or discarded.
                tracing::warn!(
                    work_unit = %record.work_unit,
                    "interrupted generation is not selected this run, finishing it first"
                );
            }
            let snapshot = channel.snapshot();
            tracing::info!(
                work_unit = %record.work_unit,
                since = %record.created_at,
                entries = snapshot.entries,
                "resuming interrupted generation"
            );
            if !queue.contains(&record.work_unit) {
                queue.push(record.work_unit);
            }
        }
        for season in &self.settings.seasons {
            if !queue.contains(season) {
                queue.push(*season);
            }
        }
        Ok(queue)
    }

    async fn run_units(
        &mut self,
        queue: &[Season],
        cancel: &CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        let mut report = WorkflowReport::default();

        for (idx, &work_unit) in queue.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.extend_from_slice(&queue[idx..]);
                break;
            }

            tracing::info!(%work_unit, position = idx + 1, total = queue.len(), "generating season");
            self.mutator.apply(work_unit.config_code())?;

            let retry = self
                .retry
                .run(
                    work_unit,
                    self.settings.max_attempts,
                    &self.settings.backoff,
                    cancel,
                )
                .await?;

            let mut unit = UnitReport {
                work_unit,
                result: retry.result,
                backoff_slept: retry.backoff_slept,
                renamed: 0,
                archive: None,
                post_error: None,
            };

            match &unit.result {
                FinalResult::Success { attempts } if *attempts > 0 => {
                    self.status.update(HarnessState::PostProcessing);
                    if let Err(e) = self.post_process(&mut unit) {
                        tracing::error!(%work_unit, error = %e, "post-processing failed");
                        unit.post_error = Some(e.to_string());
                    }
                }
                FinalResult::Success { .. } => {}
                FinalResult::ExhaustedRetries { abandoned: true, .. } => {
                    report.cancelled = true;
                }
                FinalResult::ExhaustedRetries { last_reason, .. } => {
                    tracing::error!(%work_unit, reason = %last_reason, "season failed, moving on");
                }
            }

            self.status.record_result(work_unit, unit.succeeded());
            self.status.update(HarnessState::Idle);
            let stop = report.cancelled;
            report.units.push(unit);
            if stop {
                report.skipped.extend_from_slice(&queue[idx + 1..]);
                break;
            }
        }

        Ok(report)
    }

    fn post_process(&self, unit: &mut UnitReport) -> Result<(), AdapterError> {
        let dir = self.settings.output_dir.as_path();
        unit.renamed = self.post.rename_outputs(dir, unit.work_unit.suffix())?;
        if self.settings.archive {
            unit.archive = Some(self.post.archive(dir, unit.work_unit)?);
        }
        self.post.cleanup(dir)?;
        Ok(())
    }
}

/// Exclusive advisory lock on `path`, held for as long as the file is open.
fn acquire_run_lock(path: &Path) -> Result<File, WorkflowError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.try_lock_exclusive()
        .map_err(|_| WorkflowError::RunLocked {
            path: path.to_path_buf(),
        })?;
    Ok(file)
}
