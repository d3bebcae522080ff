//! Helper process supervision
//!
//! A [`Task`] is one external helper program (a DHCP client, a VPN
//! daemon, a DNS proxy...) that the daemon launches and supervises. The
//! caller configures arguments and environment, starts it, optionally
//! talks to it through the IPC handlers, and receives exactly one exit
//! notification.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──run()──► Running ──exit──► Exited
//!                       │
//!                    stop()
//!                       ▼
//!                    Stopped ──exit──► Stopped (callback fires)
//! ```
//!
//! A stop request that races with a natural exit is not counted: the
//! task ends `Exited` and its report has `stopped == false`.
//!
//! A failed spawn leaves the task in `Created` and never invokes the
//! exit callback.

mod manager;
mod reaper;

pub use manager::TaskManager;

use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::traits::TaskHandler;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reaper::Reaper;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Environment variable carrying the daemon's bus name
pub const ENV_BUSNAME: &str = "CONND_BUSNAME";
/// Environment variable carrying the task IPC interface name
pub const ENV_INTERFACE: &str = "CONND_INTERFACE";
/// Environment variable carrying the task's object path
pub const ENV_PATH: &str = "CONND_PATH";

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Configurable, not yet started
    Created,
    /// Child process alive
    Running,
    /// Stop requested; the exit is still reported
    Stopped,
    /// Child exited on its own
    Exited,
}

impl TaskState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task's process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    /// Exit code, or -1 if the process was killed by a signal
    pub code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Whether the process was terminated by a `stop()` request
    ///
    /// `false` if it had already exited on its own when the request was
    /// handled, even though `stop()` returned `true`.
    pub stopped: bool,
    /// When the exit was observed
    pub exited_at: DateTime<Utc>,
}

impl ExitReport {
    /// Exited on its own with status 0
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

/// Which standard streams `run_with` should capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioRequest {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioRequest {
    /// Capture nothing; every stream goes to /dev/null
    pub fn none() -> Self {
        Self::default()
    }

    /// Capture all three streams
    pub fn all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

/// Captured standard streams of a started task
///
/// A stream is `Some` only if it was requested.
#[derive(Debug, Default)]
pub struct TaskStdio {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

pub(crate) struct TaskInner {
    pub(crate) state: TaskState,
    arguments: Vec<String>,
    variables: Vec<(String, String)>,
    pub(crate) pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    pub(crate) exit: Option<ExitReport>,
}

/// One supervised helper process
///
/// Created through [`TaskManager::create`]. Dropping the last handle to
/// a running task requests a graceful stop.
pub struct Task {
    path: String,
    program: String,
    config: Arc<TaskConfig>,
    inner: Arc<Mutex<TaskInner>>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stop: Arc<Notify>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("path", &self.path)
            .field("program", &self.program)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(path: String, program: String, config: Arc<TaskConfig>) -> Self {
        Self {
            path,
            program,
            config,
            inner: Arc::new(Mutex::new(TaskInner {
                state: TaskState::Created,
                arguments: Vec::new(),
                variables: Vec::new(),
                pid: None,
                started_at: None,
                exit: None,
            })),
            handlers: RwLock::new(HashMap::new()),
            stop: Arc::new(Notify::new()),
        }
    }

    /// Object path, unique for the daemon's lifetime
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Program the task runs
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Process id while the child is alive
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    /// Exit report, once the child has been reaped
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.inner.lock().exit.clone()
    }

    /// Arguments in the order they will be passed
    pub fn arguments(&self) -> Vec<String> {
        self.inner.lock().arguments.clone()
    }

    /// Environment overrides in insertion order
    pub fn variables(&self) -> Vec<(String, String)> {
        self.inner.lock().variables.clone()
    }

    /// Append an argument, followed by its value if one is given
    ///
    /// # Errors
    ///
    /// [`Error::TaskState`] once the task has been started.
    pub fn add_argument(&self, name: &str, value: Option<&str>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_input("Argument name cannot be empty"));
        }

        let mut inner = self.inner.lock();
        self.ensure_created(&inner, "add argument")?;
        inner.arguments.push(name.to_string());
        if let Some(value) = value {
            inner.arguments.push(value.to_string());
        }
        Ok(())
    }

    /// Set an environment variable for the child
    ///
    /// Setting the same key again replaces the earlier value.
    ///
    /// # Errors
    ///
    /// [`Error::TaskState`] once the task has been started.
    pub fn add_variable(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.contains('=') {
            return Err(Error::invalid_input(format!(
                "Invalid environment variable name '{}'",
                key
            )));
        }

        let mut inner = self.inner.lock();
        self.ensure_created(&inner, "add variable")?;
        match inner.variables.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => inner.variables.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Register the handler for IPC member `member`
    ///
    /// Replaces any handler previously registered for the same member.
    pub fn set_notify(&self, member: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if member.is_empty() {
            return Err(Error::invalid_input("IPC member name cannot be empty"));
        }
        if self
            .handlers
            .write()
            .insert(member.to_string(), handler)
            .is_some()
        {
            debug!(path = %self.path, member, "replaced task handler");
        }
        Ok(())
    }

    /// Remove the handler for `member`
    pub fn remove_notify(&self, member: &str) -> bool {
        self.handlers.write().remove(member).is_some()
    }

    /// Route one IPC request to the handler for `member`
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no handler is registered for `member`
    /// - [`Error::Ipc`] if the handler fails
    pub async fn handle(&self, member: &str, request: serde_json::Value) -> Result<serde_json::Value> {
        let handler = self.handlers.read().get(member).cloned().ok_or_else(|| {
            Error::not_found(format!("{} has no handler for '{}'", self.path, member))
        })?;

        handler.handle(self, request).await.map_err(|e| match e {
            Error::Ipc { .. } => e,
            other => Error::ipc(&self.path, member, other.to_string()),
        })
    }

    /// Start the program with all three standard streams captured
    ///
    /// See [`run_with`](Self::run_with).
    pub fn run<F>(&self, on_exit: F) -> Result<TaskStdio>
    where
        F: FnOnce(ExitReport) + Send + 'static,
    {
        self.run_with(StdioRequest::all(), on_exit)
    }

    /// Start the program
    ///
    /// The child gets the configured arguments and an environment made
    /// of the overrides plus `CONND_BUSNAME`, `CONND_INTERFACE` and
    /// `CONND_PATH`. Streams not requested in `stdio` are connected to
    /// /dev/null. `on_exit` is invoked exactly once, after the child has
    /// been reaped. A caller that captures stdout or stderr must keep
    /// reading it, or the child may block on a full pipe.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::TaskState`] if the task was already started
    /// - [`Error::Spawn`] if the program could not be started; the task
    ///   stays `Created` and `on_exit` is dropped without being called
    pub fn run_with<F>(&self, stdio: StdioRequest, on_exit: F) -> Result<TaskStdio>
    where
        F: FnOnce(ExitReport) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        self.ensure_created(&inner, "run")?;

        let mut command = Command::new(&self.program);
        command.args(&inner.arguments);
        if self.config.clear_environment {
            command.env_clear();
        }
        command
            .envs(inner.variables.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_BUSNAME, &self.config.bus_name)
            .env(ENV_INTERFACE, self.config.interface_name())
            .env(ENV_PATH, &self.path)
            .stdin(pipe_or_null(stdio.stdin))
            .stdout(pipe_or_null(stdio.stdout))
            .stderr(pipe_or_null(stdio.stderr));

        let mut child = command.spawn().map_err(|source| {
            warn!(path = %self.path, program = %self.program, "spawn failed: {}", source);
            Error::Spawn {
                program: self.program.clone(),
                source,
            }
        })?;

        let streams = TaskStdio {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        inner.state = TaskState::Running;
        inner.pid = child.id();
        inner.started_at = Some(Utc::now());
        info!(path = %self.path, program = %self.program, pid = inner.pid, "task started");
        drop(inner);

        let reaper = Reaper {
            path: self.path.clone(),
            inner: Arc::clone(&self.inner),
            stop: Arc::clone(&self.stop),
            stop_timeout: Duration::from_millis(self.config.stop_timeout_ms),
        };
        tokio::spawn(reaper.reap(child, Box::new(on_exit)));

        Ok(streams)
    }

    /// Request termination of the running program
    ///
    /// Sends SIGTERM, and SIGKILL if the program is still alive after
    /// the configured stop timeout. The exit callback still fires, with
    /// [`ExitReport::stopped`] set. Calling this when the task is not
    /// running, or a second time, does nothing.
    ///
    /// Returns whether a termination request was issued. The request is
    /// dropped if the child turns out to have exited already.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Running {
            debug!(path = %self.path, state = %inner.state, "stop ignored");
            return false;
        }
        inner.state = TaskState::Stopped;
        drop(inner);

        info!(path = %self.path, "stopping task");
        self.stop.notify_one();
        true
    }

    fn ensure_created(&self, inner: &TaskInner, operation: &str) -> Result<()> {
        if inner.state == TaskState::Created {
            Ok(())
        } else {
            Err(Error::task_state(&self.path, inner.state.as_str(), operation))
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.stop() {
            debug!(path = %self.path, "task dropped while running");
        }
    }
}

fn pipe_or_null(capture: bool) -> Stdio {
    if capture { Stdio::piped() } else { Stdio::null() }
}
