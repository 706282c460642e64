/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// First SIGINT: cancel the run; the current worker is stopped, its progress
/// lock kept and config restored before exit.
/// Second SIGINT (within 3s): exit immediately with status 130.
/// SIGTERM and the STOP file: same as a single SIGINT.
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FORCE_WINDOW: Duration = Duration::from_secs(3);
const STOP_FILE_POLL: Duration = Duration::from_secs(1);

/// Exit status for an interrupted run.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Detects a second press inside the force window.
#[derive(Debug)]
struct DoubleTap {
    window: Duration,
    last: Option<Instant>,
}

impl DoubleTap {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record a press. True when it follows the previous one within the window.
    fn press(&mut self, now: Instant) -> bool {
        let forced = self
            .last
            .is_some_and(|prev| now.saturating_duration_since(prev) <= self.window);
        self.last = Some(now);
        forced
    }
}

pub struct SignalHandler {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalHandler {
    /// Install handlers that cancel `cancel`. Must be called inside a tokio
    /// runtime.
    pub fn install(cancel: CancellationToken, stop_file: PathBuf) -> std::io::Result<Self> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let token = cancel.clone();
        let signals = tokio::spawn(async move {
            let mut taps = DoubleTap::new(FORCE_WINDOW);
            loop {
                tokio::select! {
                    received = sigint.recv() => {
                        if received.is_none() {
                            break;
                        }
                        if taps.press(Instant::now()) {
                            tracing::error!("second interrupt, exiting immediately");
                            std::process::exit(EXIT_INTERRUPTED);
                        }
                        tracing::warn!("interrupt received, stopping (press Ctrl-C again to force)");
                        token.cancel();
                    }
                    received = sigterm.recv() => {
                        if received.is_none() {
                            break;
                        }
                        tracing::warn!("SIGTERM received, stopping");
                        token.cancel();
                    }
                }
            }
        });

        let stop = tokio::spawn(watch_stop_file(stop_file, cancel, STOP_FILE_POLL));

        Ok(Self {
            tasks: vec![signals, stop],
        })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Cancel once `path` appears. The file is consumed so the next run starts
/// normally.
async fn watch_stop_file(path: PathBuf, cancel: CancellationToken, every: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        if path.exists() {
            tracing::warn!(path = %path.display(), "STOP file found, stopping");
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(error = %e, "failed to remove STOP file");
            }
            cancel.cancel();
            return;
        }
    }
}
