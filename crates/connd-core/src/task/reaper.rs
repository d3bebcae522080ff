//! Child supervision: waiting, graceful stop and SIGKILL escalation

use super::{ExitReport, TaskInner, TaskState};
use chrono::Utc;
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(super) type ExitCallback = Box<dyn FnOnce(ExitReport) + Send + 'static>;

pub(super) struct Reaper {
    pub(super) path: String,
    pub(super) inner: Arc<Mutex<TaskInner>>,
    pub(super) stop: Arc<Notify>,
    pub(super) stop_timeout: Duration,
}

impl Reaper {
    /// Wait for `child` to exit, then publish the exit and run `on_exit`
    ///
    /// This is the only place the exit callback is invoked, which makes
    /// it fire exactly once per successful spawn.
    pub(super) async fn reap(self, mut child: Child, on_exit: ExitCallback) {
        let pid = child.id();
        let mut deadline: Option<Instant> = None;
        let mut killed = false;
        let mut signalled = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,

                _ = self.stop.notified(), if deadline.is_none() && !killed => {
                    // the child may have exited before the stop request reached us
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            debug!(path = %self.path, ?pid, "stop requested after exit");
                            break Ok(status);
                        }
                        Ok(None) => {}
                        Err(e) => debug!(path = %self.path, "try_wait failed: {}", e),
                    }

                    signalled = true;
                    if self.stop_timeout.is_zero() {
                        self.kill(&mut child);
                        killed = true;
                    } else {
                        debug!(path = %self.path, ?pid, "sending SIGTERM");
                        terminate(&mut child, pid);
                        deadline = Some(Instant::now() + self.stop_timeout);
                    }
                }

                _ = sleep_until(deadline), if deadline.is_some() && !killed => {
                    warn!(
                        path = %self.path,
                        ?pid,
                        timeout_ms = self.stop_timeout.as_millis() as u64,
                        "task ignored SIGTERM, escalating to SIGKILL"
                    );
                    self.kill(&mut child);
                    killed = true;
                }
            }
        };

        let mut report = match status {
            Ok(status) => exit_report(status),
            Err(e) => {
                error!(path = %self.path, "failed to wait for task: {}", e);
                ExitReport {
                    code: -1,
                    signal: None,
                    stopped: false,
                    exited_at: Utc::now(),
                }
            }
        };

        {
            let mut inner = self.inner.lock();
            report.stopped = signalled;
            inner.state = if signalled {
                TaskState::Stopped
            } else {
                TaskState::Exited
            };
            inner.pid = None;
            inner.exit = Some(report.clone());
        }

        info!(
            path = %self.path,
            code = report.code,
            signal = report.signal,
            stopped = report.stopped,
            "task exited"
        );
        on_exit(report);
    }

    fn kill(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            // already reaped; wait() returns the status on the next turn
            debug!(path = %self.path, "SIGKILL failed: {}", e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: pid belongs to a child we have not reaped yet, so it cannot
    // have been recycled for another process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_report(status: ExitStatus) -> ExitReport {
    use std::os::unix::process::ExitStatusExt;

    ExitReport {
        code: status.code().unwrap_or(-1),
        signal: status.signal(),
        stopped: false,
        exited_at: Utc::now(),
    }
}

#[cfg(not(unix))]
fn exit_report(status: ExitStatus) -> ExitReport {
    ExitReport {
        code: status.code().unwrap_or(-1),
        signal: None,
        stopped: false,
        exited_at: Utc::now(),
    }
}
