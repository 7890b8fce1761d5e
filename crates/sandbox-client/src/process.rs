//! Command execution: start, run, list, kill, signal, stdin, reattach.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use sandbox_proto::{ProcessInfo, Request, Response, StreamEvent};

use crate::error::{Error, Result};
use crate::session::{Session, expect_bool, expect_ok};

/// SIGTERM, the default signal for [`Commands::send_signal`] callers.
pub const SIGTERM: i32 = 15;
/// SIGKILL.
pub const SIGKILL: i32 = 9;

/// Options for starting a command.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    cmd: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    cwd: Option<String>,
    user: Option<String>,
    tag: Option<String>,
}

impl StartOptions {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn into_request(self) -> (Request, Option<String>) {
        let tag = self.tag.clone();
        (
            Request::ProcessStart {
                cmd: self.cmd,
                args: self.args,
                envs: self.envs,
                cwd: self.cwd,
                user: self.user,
                tag: self.tag,
            },
            tag,
        )
    }
}

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Daemon-side error string, if the process failed to run cleanly.
    pub error: Option<String>,
}

/// Lifecycle of a remote process as seen through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
}

/// An incremental event consumed from a process stream.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit {
        exit_code: Option<i32>,
        error: Option<String>,
    },
}

/// Command controller for one sandbox session.
#[derive(Clone)]
pub struct Commands {
    pub(crate) session: Arc<Session>,
}

impl Commands {
    /// Start a command in the background and return a handle streaming its
    /// output. The handle owns its buffers; dropping it detaches (the
    /// process keeps running).
    pub async fn start(&self, options: StartOptions) -> Result<ProcessHandle> {
        let (request, tag) = options.into_request();
        let opened = self.session.open_stream(request, None).await?;
        let mut handle = ProcessHandle::new(self.session.clone(), opened.id, opened.events, tag);
        handle.await_started(self.session.request_timeout()).await?;
        Ok(handle)
    }

    /// Start a command and drain it to completion or `timeout`.
    ///
    /// A nonzero exit code is an error carrying the captured output; a
    /// timeout kills the process best-effort and surfaces as a request
    /// timeout (or sandbox expiry when attributable).
    pub async fn run(&self, options: StartOptions, timeout: Duration) -> Result<CommandResult> {
        let deadline = Instant::now() + timeout;
        let mut handle = match time::timeout_at(deadline, self.start(options)).await {
            Err(_) => return Err(self.session.timeout_error(timeout)),
            Ok(started) => started?,
        };
        match time::timeout_at(deadline, handle.wait()).await {
            Err(_) => {
                let pid = handle.pid();
                handle.detach();
                let _ = self.kill(pid).await;
                Err(self.session.timeout_error(timeout))
            }
            Ok(result) => {
                let result = result?;
                if result.exit_code != 0 {
                    return Err(Error::CommandExit {
                        exit_code: result.exit_code,
                        stdout: result.stdout,
                        stderr: result.stderr,
                    });
                }
                Ok(result)
            }
        }
    }

    /// List processes currently running in the sandbox.
    pub async fn list(&self) -> Result<Vec<ProcessInfo>> {
        match self.session.call(Request::ProcessList, None).await? {
            Response::Processes(items) => Ok(items),
            other => Err(Error::Sandbox(format!(
                "unexpected response shape: {other:?}"
            ))),
        }
    }

    /// Kill a process. Returns `false` if the pid is already gone: kill is
    /// idempotent from the caller's perspective and never raises not-found.
    pub async fn kill(&self, pid: u32) -> Result<bool> {
        match self.session.call(Request::ProcessKill { pid }, None).await {
            Ok(response) => expect_bool(response),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send a signal to a process.
    pub async fn send_signal(&self, pid: u32, signal: i32) -> Result<()> {
        let response = self
            .session
            .call(Request::ProcessSignal { pid, signal }, None)
            .await?;
        expect_ok(response)
    }

    /// Write to a process's stdin.
    pub async fn send_stdin(&self, pid: u32, data: impl Into<Vec<u8>>) -> Result<()> {
        let response = self
            .session
            .call(
                Request::ProcessStdin {
                    pid,
                    data: data.into(),
                },
                None,
            )
            .await?;
        expect_ok(response)
    }

    /// Reattach to a still-running process by pid.
    ///
    /// The returned handle is new: its buffers start empty and output
    /// emitted while detached is not replayed. Raises not-found if the pid
    /// does not exist.
    pub async fn connect(&self, pid: u32) -> Result<ProcessHandle> {
        let opened = self
            .session
            .open_stream(Request::ProcessConnect { pid }, None)
            .await?;
        let mut handle = ProcessHandle::new(self.session.clone(), opened.id, opened.events, None);
        handle.await_started(self.session.request_timeout()).await?;
        Ok(handle)
    }
}

/// Handle to a running (or finished) remote process.
///
/// Accumulates output as events are consumed; once `Exited` the handle is
/// immutable. Dropping the handle detaches it without killing the process.
pub struct ProcessHandle {
    session: Arc<Session>,
    op_id: u32,
    pid: u32,
    tag: Option<String>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    state: ProcessState,
    exit: Option<(Option<i32>, Option<String>)>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("op_id", &self.op_id)
            .field("pid", &self.pid)
            .field("tag", &self.tag)
            .field("state", &self.state)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    fn new(
        session: Arc<Session>,
        op_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        tag: Option<String>,
    ) -> Self {
        Self {
            session,
            op_id,
            pid: 0,
            tag,
            events,
            stdout: Vec::new(),
            stderr: Vec::new(),
            state: ProcessState::Starting,
            exit: None,
        }
    }

    /// Consume events until the daemon announces the pid.
    async fn await_started(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let event = time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| self.session.timeout_error(timeout))?;
            match event {
                None => {
                    self.state = ProcessState::Exited;
                    return Err(Error::ConnectionLost(
                        "stream ended before start event".to_string(),
                    ));
                }
                Some(StreamEvent::Started { pid }) => {
                    self.pid = pid;
                    self.state = ProcessState::Running;
                    return Ok(());
                }
                Some(StreamEvent::End { exit_code, error }) => {
                    self.state = ProcessState::Exited;
                    self.exit = Some((exit_code, error.clone()));
                    return Err(Error::Sandbox(
                        error.unwrap_or_else(|| "process ended before start event".to_string()),
                    ));
                }
                // Tolerate output racing ahead of the start announcement.
                Some(other) => self.apply(other),
            }
        }
    }

    /// Fold a stream event into the handle's buffers.
    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Stdout(data) | StreamEvent::Output(data) => self.stdout.extend(data),
            StreamEvent::Stderr(data) => self.stderr.extend(data),
            StreamEvent::End { exit_code, error } => {
                self.state = ProcessState::Exited;
                self.exit = Some((exit_code, error));
            }
            StreamEvent::Started { pid } => {
                self.pid = pid;
                self.state = ProcessState::Running;
            }
            StreamEvent::Fs(_) | StreamEvent::Stopped => {
                tracing::debug!(op_id = self.op_id, "ignoring non-process event");
            }
        }
    }

    /// Await the next event, folding it into the buffers.
    ///
    /// Returns `Ok(None)` once the process has exited. A stream that ends
    /// without a terminal event means the connection is gone.
    pub async fn next_event(&mut self) -> Result<Option<ProcessEvent>> {
        loop {
            if self.state == ProcessState::Exited {
                return Ok(None);
            }
            match self.events.recv().await {
                None => {
                    self.state = ProcessState::Exited;
                    return Err(Error::ConnectionLost(
                        "output stream ended before process exit".to_string(),
                    ));
                }
                Some(StreamEvent::Stdout(data)) => {
                    self.stdout.extend(&data);
                    return Ok(Some(ProcessEvent::Stdout(data)));
                }
                Some(StreamEvent::Output(data)) => {
                    self.stdout.extend(&data);
                    return Ok(Some(ProcessEvent::Stdout(data)));
                }
                Some(StreamEvent::Stderr(data)) => {
                    self.stderr.extend(&data);
                    return Ok(Some(ProcessEvent::Stderr(data)));
                }
                Some(StreamEvent::End { exit_code, error }) => {
                    self.state = ProcessState::Exited;
                    self.exit = Some((exit_code, error.clone()));
                    return Ok(Some(ProcessEvent::Exit { exit_code, error }));
                }
                Some(other) => self.apply(other),
            }
        }
    }

    /// Drain the stream to completion and return the accumulated result.
    pub async fn wait(&mut self) -> Result<CommandResult> {
        while self.next_event().await?.is_some() {}
        Ok(self.result())
    }

    fn result(&self) -> CommandResult {
        let (exit_code, error) = match &self.exit {
            Some((code, error)) => (code.unwrap_or(-1), error.clone()),
            None => (-1, None),
        };
        CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            error,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Output accumulated so far.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.as_ref().and_then(|(code, _)| *code)
    }

    /// Stop consuming without killing the process; reattach later with
    /// [`Commands::connect`].
    pub fn detach(self) {
        // Drop unregisters the stream; the remote process keeps running.
    }

    /// Kill the process behind this handle.
    pub async fn kill(&mut self) -> Result<bool> {
        let pid = self.pid;
        match self.session.call(Request::ProcessKill { pid }, None).await {
            Ok(response) => expect_bool(response),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.session.unregister_stream(self.op_id);
    }
}
