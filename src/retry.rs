use crate::adapters::CompletionProbe;
use crate::lock::{LockError, ProgressLock};
use crate::process::ProcessControl;
use crate::season::Season;
use crate::status::{HarnessState, StatusTracker};
use crate::supervisor::{GenerationSupervisor, OutcomeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capped exponential backoff between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay after the `failures`-th consecutive failure (1-based):
    /// initial * 2^(failures-1), capped at max.
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial.saturating_mul(shift).min(self.max)
    }
}

/// Terminal result for one work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    /// Generation finished. `attempts` is 0 when the outputs already existed.
    Success { attempts: u32 },
    /// Gave up. `abandoned` means the user cancelled; the progress lock was
    /// left in place so the next run resumes.
    ExhaustedRetries {
        attempts: u32,
        last_reason: String,
        abandoned: bool,
    },
}

impl FinalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalResult::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub work_unit: Season,
    pub result: FinalResult,
    /// Backoff delays actually slept, in order.
    pub backoff_slept: Vec<Duration>,
}

/// Runs supervised attempts for a work unit until one completes, retries run
/// out, or the user cancels.
///
/// Owns the progress lock for the unit: taken before the first attempt,
/// released only on a final result, kept on cancellation.
pub struct RetryController<P: ProcessControl> {
    supervisor: GenerationSupervisor<P>,
    lock: ProgressLock,
    probe: Arc<dyn CompletionProbe>,
    status: StatusTracker,
}

impl<P: ProcessControl> RetryController<P> {
    pub fn new(
        supervisor: GenerationSupervisor<P>,
        lock: ProgressLock,
        probe: Arc<dyn CompletionProbe>,
        status: StatusTracker,
    ) -> Self {
        Self {
            supervisor,
            lock,
            probe,
            status,
        }
    }

    pub fn supervisor(&self) -> &GenerationSupervisor<P> {
        &self.supervisor
    }

    pub async fn run(
        &mut self,
        work_unit: Season,
        max_attempts: u32,
        backoff: &BackoffSchedule,
        cancel: &CancellationToken,
    ) -> Result<RetryReport, LockError> {
        let mut report = RetryReport {
            work_unit,
            result: FinalResult::Success { attempts: 0 },
            backoff_slept: Vec::new(),
        };

        // Only a unit resuming its own lock may pick up an existing progress
        // file; anything else on disk would make the worker skip cells.
        if !self.lock.is_locked(work_unit) {
            self.discard_unowned_progress(work_unit)?;
            if self.probe.already_complete(work_unit) {
                info!(%work_unit, "outputs already present, skipping generation");
                return Ok(report);
            }
        }

        self.lock.acquire(work_unit)?;
        self.status.set_work_unit(work_unit, max_attempts);

        let mut last_reason = String::new();
        let mut attempts = 0;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                report.result = abandoned(attempts, "cancelled before attempt");
                return Ok(report);
            }

            attempts = attempt;
            info!(%work_unit, attempt, max_attempts, "starting attempt");
            let outcome = self.supervisor.run_attempt(work_unit, attempt, cancel).await;

            if outcome.kind == OutcomeKind::Completed {
                self.lock.release(work_unit)?;
                report.result = FinalResult::Success { attempts };
                return Ok(report);
            }
            if !outcome.is_retryable() {
                report.result = abandoned(attempts, &outcome.reason);
                return Ok(report);
            }
            last_reason = outcome.reason;

            if attempt == max_attempts {
                break;
            }

            let delay = backoff.delay(attempt);
            warn!(
                %work_unit,
                attempt,
                max_attempts,
                delay_secs = delay.as_secs_f64(),
                reason = %last_reason,
                "attempt failed, backing off"
            );
            self.status.update(HarnessState::Backoff);
            tokio::select! {
                _ = cancel.cancelled() => {
                    report.result = abandoned(attempts, "cancelled during backoff");
                    return Ok(report);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            report.backoff_slept.push(delay);
        }

        warn!(%work_unit, attempts, reason = %last_reason, "retries exhausted");
        self.lock.release(work_unit)?;
        self.discard_released_progress(work_unit);
        report.result = FinalResult::ExhaustedRetries {
            attempts,
            last_reason,
            abandoned: false,
        };
        Ok(report)
    }

    /// Remove a progress file that no lock ties to a work unit. Fails when
    /// another unit's lock claims it.
    fn discard_unowned_progress(&self, work_unit: Season) -> Result<(), LockError> {
        let channel = self.supervisor.channel();
        let snapshot = channel.snapshot();
        if !snapshot.exists {
            return Ok(());
        }
        if let Some(holder) = self.lock.holder() {
            return Err(LockError::ProgressHeld {
                holder,
                path: channel.path().to_path_buf(),
            });
        }
        if snapshot.entries > 0 {
            warn!(
                %work_unit,
                entries = snapshot.entries,
                path = %channel.path().display(),
                "discarding progress left without a lock"
            );
        }
        channel.remove_owned().map_err(|source| LockError::Io {
            path: channel.path().to_path_buf(),
            source,
        })
    }

    /// Once the lock is gone the partial progress belongs to no unit, so it
    /// goes too, unless some other unit still holds a lock.
    fn discard_released_progress(&self, work_unit: Season) {
        let channel = self.supervisor.channel();
        let snapshot = channel.snapshot();
        if !snapshot.exists {
            return;
        }
        if let Some(holder) = self.lock.holder() {
            info!(%work_unit, %holder, "progress file still locked, keeping it");
            return;
        }
        match channel.remove_owned() {
            Ok(()) => info!(
                %work_unit,
                entries = snapshot.entries,
                "discarded partial progress of failed generation"
            ),
            Err(e) => warn!(error = %e, "failed to remove progress file"),
        }
    }
}

fn abandoned(attempts: u32, reason: &str) -> FinalResult {
    FinalResult::ExhaustedRetries {
        attempts,
        last_reason: reason.to_string(),
        abandoned: true,
    }
}
