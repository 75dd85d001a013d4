//! Display Control module for switching the screen resolution.
//!
//! Resolution changes go through an external helper program. The command line
//! is configurable and `{width}`/`{height}` placeholders are substituted per
//! call. [`DisplayManager`] wraps any [`DisplayController`] with retries.

use crate::error::DisplayError;
use crate::resolution::Resolution;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Attempts made for one resolution change.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Pause between failed attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Boxed future returned by [`DisplayController::apply`].
pub type DisplayFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DisplayError>> + Send + 'a>>;

/// Anything able to put the display into a given resolution.
pub trait DisplayController: Send + Sync {
    fn apply(&self, resolution: Resolution) -> DisplayFuture<'_>;
}

/// External command line used to change the resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayCommand {
    pub program: String,
    /// Arguments; `{width}` and `{height}` are replaced per call.
    #[serde(default)]
    pub args: Vec<String>,
}

impl DisplayCommand {
    /// Arguments with the placeholders filled in.
    pub fn render_args(&self, resolution: Resolution) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{width}", &resolution.width().to_string())
                    .replace("{height}", &resolution.height().to_string())
            })
            .collect()
    }
}

impl Default for DisplayCommand {
    #[cfg(windows)]
    fn default() -> Self {
        Self {
            program: "nircmd.exe".to_string(),
            args: ["setdisplay", "{width}", "{height}", "32"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    #[cfg(not(windows))]
    fn default() -> Self {
        Self {
            program: "xrandr".to_string(),
            args: vec!["-s".to_string(), "{width}x{height}".to_string()],
        }
    }
}

/// Runs a [`DisplayCommand`] as a child process.
pub struct CommandDisplayController {
    command: DisplayCommand,
    timeout: Duration,
}

impl CommandDisplayController {
    pub fn new(command: DisplayCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, resolution: Resolution) -> Result<(), DisplayError> {
        let args = self.command.render_args(resolution);
        debug!(program = %self.command.program, ?args, "Running display command");

        let child = Command::new(&self.command.program)
            .args(&args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| DisplayError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DisplayError::CommandNotFound(self.command.program.clone())
                } else {
                    DisplayError::ExecutionFailed(e)
                }
            })?;

        if !output.status.success() {
            return Err(DisplayError::CommandFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl DisplayController for CommandDisplayController {
    fn apply(&self, resolution: Resolution) -> DisplayFuture<'_> {
        Box::pin(self.run(resolution))
    }
}

/// Applies resolutions with bounded retries and remembers the last success.
pub struct DisplayManager {
    controller: Arc<dyn DisplayController>,
    attempts: u32,
    backoff: Duration,
    /// Last resolution applied successfully.
    last_applied: Mutex<Option<Resolution>>,
}

impl DisplayManager {
    pub fn new(controller: Arc<dyn DisplayController>) -> Self {
        Self::with_retry(controller, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF)
    }

    pub fn with_retry(controller: Arc<dyn DisplayController>, attempts: u32, backoff: Duration) -> Self {
        Self {
            controller,
            attempts: attempts.max(1),
            backoff,
            last_applied: Mutex::new(None),
        }
    }

    /// Apply `resolution`, retrying failed attempts after a short pause.
    ///
    /// A missing helper program is not retried.
    pub async fn apply(&self, resolution: Resolution) -> Result<(), DisplayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.controller.apply(resolution).await {
                Ok(()) => {
                    info!(%resolution, attempt, "Resolution applied");
                    self.record_success(resolution);
                    return Ok(());
                }
                Err(e @ DisplayError::CommandNotFound(_)) => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    return Err(DisplayError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(%resolution, attempt, error = %e, "Resolution change failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    fn record_success(&self, resolution: Resolution) {
        if let Ok(mut last) = self.last_applied.lock() {
            *last = Some(resolution);
        }
    }

    /// Last resolution applied successfully, if any.
    pub fn last_applied(&self) -> Option<Resolution> {
        self.last_applied.lock().ok().and_then(|guard| *guard)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording display used by the engine tests.

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub struct FakeDisplay {
        calls: Mutex<Vec<Resolution>>,
        failures_left: AtomicU32,
    }

    impl FakeDisplay {
        /// Fail the next `n` calls.
        pub fn fail_next(&self, n: u32) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        /// Every resolution requested so far, failed attempts included.
        pub fn calls(&self) -> Vec<Resolution> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DisplayController for FakeDisplay {
        fn apply(&self, resolution: Resolution) -> DisplayFuture<'_> {
            self.calls.lock().unwrap().push(resolution);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if fail {
                    Err(DisplayError::CommandFailed {
                        exit_code: Some(1),
                        stderr: "scripted failure".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
        }
    }
}
