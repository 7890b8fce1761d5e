//! Pseudo-terminal sessions: interactive input/output and resize.
//!
//! A PTY follows the same stream lifecycle as a process (`Starting →
//! Running → Exited`, terminal `End` event) but is bidirectional: input goes
//! down as calls, combined output comes back as events.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use sandbox_proto::{Request, StreamEvent};

use crate::error::{Error, Result};
use crate::session::{Session, expect_bool, expect_ok};

/// Terminal dimensions.
#[derive(Debug, Clone, Copy)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

/// Options for creating a PTY.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    size: PtySize,
    envs: HashMap<String, String>,
    cwd: Option<String>,
}

impl PtyOptions {
    pub fn new(size: PtySize) -> Self {
        Self {
            size,
            envs: HashMap::new(),
            cwd: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// PTY controller for one sandbox session.
#[derive(Clone)]
pub struct Pty {
    pub(crate) session: Arc<Session>,
}

impl Pty {
    /// Create a PTY and return a handle streaming its output.
    pub async fn create(&self, options: PtyOptions) -> Result<PtyHandle> {
        let opened = self
            .session
            .open_stream(
                Request::PtyCreate {
                    cols: options.size.cols,
                    rows: options.size.rows,
                    envs: options.envs,
                    cwd: options.cwd,
                },
                None,
            )
            .await?;
        let mut handle = PtyHandle::new(self.session.clone(), opened.id, opened.events);
        handle.await_started().await?;
        Ok(handle)
    }

    /// Reattach to a still-running PTY by pid. Like process reattachment,
    /// the new handle starts with an empty output buffer.
    pub async fn connect(&self, pid: u32) -> Result<PtyHandle> {
        let opened = self
            .session
            .open_stream(Request::ProcessConnect { pid }, None)
            .await?;
        let mut handle = PtyHandle::new(self.session.clone(), opened.id, opened.events);
        handle.await_started().await?;
        Ok(handle)
    }
}

/// Handle to a PTY session.
pub struct PtyHandle {
    session: Arc<Session>,
    op_id: u32,
    pid: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    output: Vec<u8>,
    exited: bool,
    exit_code: Option<i32>,
}

impl PtyHandle {
    fn new(session: Arc<Session>, op_id: u32, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            session,
            op_id,
            pid: 0,
            events,
            output: Vec::new(),
            exited: false,
            exit_code: None,
        }
    }

    async fn await_started(&mut self) -> Result<()> {
        let timeout = self.session.request_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let event = time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| self.session.timeout_error(timeout))?;
            match event {
                None => {
                    self.exited = true;
                    return Err(Error::ConnectionLost(
                        "stream ended before start event".to_string(),
                    ));
                }
                Some(StreamEvent::Started { pid }) => {
                    self.pid = pid;
                    return Ok(());
                }
                Some(StreamEvent::End { error, .. }) => {
                    self.exited = true;
                    return Err(Error::Sandbox(
                        error.unwrap_or_else(|| "pty ended before start event".to_string()),
                    ));
                }
                Some(StreamEvent::Output(data)) | Some(StreamEvent::Stdout(data)) => {
                    self.output.extend(data);
                }
                Some(_) => {}
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Output accumulated so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Await the next chunk of output. Returns `Ok(None)` once the PTY has
    /// exited.
    pub async fn next_output(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.exited {
                return Ok(None);
            }
            match self.events.recv().await {
                None => {
                    self.exited = true;
                    return Err(Error::ConnectionLost(
                        "output stream ended before pty exit".to_string(),
                    ));
                }
                Some(StreamEvent::Output(data)) | Some(StreamEvent::Stdout(data)) => {
                    self.output.extend(&data);
                    return Ok(Some(data));
                }
                Some(StreamEvent::Stderr(data)) => {
                    self.output.extend(&data);
                    return Ok(Some(data));
                }
                Some(StreamEvent::End { exit_code, .. }) => {
                    self.exited = true;
                    self.exit_code = exit_code;
                    return Ok(None);
                }
                Some(_) => {}
            }
        }
    }

    /// Drain output until the PTY exits; returns the exit code if reported.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        while self.next_output().await?.is_some() {}
        Ok(self.exit_code)
    }

    /// Send keystrokes to the PTY.
    pub async fn send_stdin(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let response = self
            .session
            .call(
                Request::ProcessStdin {
                    pid: self.pid,
                    data: data.into(),
                },
                None,
            )
            .await?;
        expect_ok(response)
    }

    /// Resize the terminal.
    pub async fn resize(&self, size: PtySize) -> Result<()> {
        let response = self
            .session
            .call(
                Request::PtyResize {
                    pid: self.pid,
                    cols: size.cols,
                    rows: size.rows,
                },
                None,
            )
            .await?;
        expect_ok(response)
    }

    /// Stop consuming without killing the PTY; reattach later with
    /// [`Pty::connect`].
    pub fn disconnect(self) {
        // Drop unregisters the stream; the remote PTY keeps running.
    }

    /// Kill the PTY process.
    pub async fn kill(&mut self) -> Result<bool> {
        let pid = self.pid;
        match self.session.call(Request::ProcessKill { pid }, None).await {
            Ok(response) => expect_bool(response),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.session.unregister_stream(self.op_id);
    }
}
