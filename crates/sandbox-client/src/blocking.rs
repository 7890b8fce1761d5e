//! Blocking surface over the async core.
//!
//! There is one implementation of the protocol engine; this module wraps it
//! with a private current-thread runtime so the calling thread drives
//! consumption synchronously. Every handle derived from a
//! [`Sandbox`] shares that runtime.
//!
//! Must not be used from inside an async runtime (like `reqwest::blocking`,
//! it would panic on nested `block_on`).

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::api::{SandboxPage, SandboxQuery, SandboxState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filesystem::UrlOptions;
use crate::process::{CommandResult, ProcessEvent, ProcessState, StartOptions};
use crate::pty::{PtyOptions, PtySize};
use crate::watch::FilesystemEvent;
use sandbox_proto::{EntryInfo, ProcessInfo};

fn runtime() -> Result<Arc<Runtime>> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Sandbox(format!("failed to build runtime: {e}")))?;
    Ok(Arc::new(rt))
}

/// Blocking counterpart of [`crate::Sandbox`].
pub struct Sandbox {
    inner: crate::Sandbox,
    rt: Arc<Runtime>,
}

impl Sandbox {
    pub fn create(config: &Config, options: crate::CreateOptions) -> Result<Self> {
        let rt = runtime()?;
        let inner = rt.block_on(crate::Sandbox::create(config, options))?;
        Ok(Self { inner, rt })
    }

    pub fn connect(config: &Config, sandbox_id: &str) -> Result<Self> {
        let rt = runtime()?;
        let inner = rt.block_on(crate::Sandbox::connect(config, sandbox_id))?;
        Ok(Self { inner, rt })
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn state(&self) -> SandboxState {
        self.inner.state()
    }

    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.expires_at()
    }

    pub fn commands(&self) -> Commands {
        Commands {
            inner: self.inner.commands(),
            rt: self.rt.clone(),
        }
    }

    pub fn pty(&self) -> Pty {
        Pty {
            inner: self.inner.pty(),
            rt: self.rt.clone(),
        }
    }

    pub fn files(&self) -> Files {
        Files {
            inner: self.inner.files(),
            rt: self.rt.clone(),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.rt.block_on(self.inner.set_timeout(timeout))
    }

    pub fn pause(&self) -> Result<()> {
        self.rt.block_on(self.inner.pause())
    }

    pub fn kill(self) -> Result<bool> {
        let Self { inner, rt } = self;
        rt.block_on(inner.kill())
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn list(
        config: &Config,
        query: &SandboxQuery,
        page_token: Option<&str>,
    ) -> Result<SandboxPage> {
        runtime()?.block_on(crate::Sandbox::list(config, query, page_token))
    }
}

/// Blocking counterpart of [`crate::Commands`].
pub struct Commands {
    inner: crate::Commands,
    rt: Arc<Runtime>,
}

impl Commands {
    pub fn run(&self, options: StartOptions, timeout: Duration) -> Result<CommandResult> {
        self.rt.block_on(self.inner.run(options, timeout))
    }

    pub fn start(&self, options: StartOptions) -> Result<CommandHandle> {
        Ok(CommandHandle {
            inner: self.rt.block_on(self.inner.start(options))?,
            rt: self.rt.clone(),
        })
    }

    pub fn list(&self) -> Result<Vec<ProcessInfo>> {
        self.rt.block_on(self.inner.list())
    }

    pub fn kill(&self, pid: u32) -> Result<bool> {
        self.rt.block_on(self.inner.kill(pid))
    }

    pub fn send_signal(&self, pid: u32, signal: i32) -> Result<()> {
        self.rt.block_on(self.inner.send_signal(pid, signal))
    }

    pub fn send_stdin(&self, pid: u32, data: impl Into<Vec<u8>>) -> Result<()> {
        self.rt.block_on(self.inner.send_stdin(pid, data))
    }

    pub fn connect(&self, pid: u32) -> Result<CommandHandle> {
        Ok(CommandHandle {
            inner: self.rt.block_on(self.inner.connect(pid))?,
            rt: self.rt.clone(),
        })
    }
}

/// Blocking counterpart of [`crate::ProcessHandle`]. Iterating events blocks
/// the calling thread until the next frame or the terminal exit.
pub struct CommandHandle {
    inner: crate::ProcessHandle,
    rt: Arc<Runtime>,
}

impl CommandHandle {
    pub fn pid(&self) -> u32 {
        self.inner.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state()
    }

    pub fn stdout(&self) -> &[u8] {
        self.inner.stdout()
    }

    pub fn stderr(&self) -> &[u8] {
        self.inner.stderr()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code()
    }

    pub fn next_event(&mut self) -> Result<Option<ProcessEvent>> {
        self.rt.block_on(self.inner.next_event())
    }

    pub fn wait(&mut self) -> Result<CommandResult> {
        self.rt.block_on(self.inner.wait())
    }

    pub fn kill(&mut self) -> Result<bool> {
        self.rt.block_on(self.inner.kill())
    }

    pub fn detach(self) {
        let Self { inner, rt: _rt } = self;
        inner.detach();
    }
}

/// Blocking counterpart of [`crate::Pty`].
pub struct Pty {
    inner: crate::Pty,
    rt: Arc<Runtime>,
}

impl Pty {
    pub fn create(&self, options: PtyOptions) -> Result<PtyHandle> {
        Ok(PtyHandle {
            inner: self.rt.block_on(self.inner.create(options))?,
            rt: self.rt.clone(),
        })
    }

    pub fn connect(&self, pid: u32) -> Result<PtyHandle> {
        Ok(PtyHandle {
            inner: self.rt.block_on(self.inner.connect(pid))?,
            rt: self.rt.clone(),
        })
    }
}

/// Blocking counterpart of [`crate::PtyHandle`].
pub struct PtyHandle {
    inner: crate::PtyHandle,
    rt: Arc<Runtime>,
}

impl PtyHandle {
    pub fn pid(&self) -> u32 {
        self.inner.pid()
    }

    pub fn output(&self) -> &[u8] {
        self.inner.output()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code()
    }

    pub fn send_stdin(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.rt.block_on(self.inner.send_stdin(data))
    }

    pub fn resize(&self, size: PtySize) -> Result<()> {
        self.rt.block_on(self.inner.resize(size))
    }

    pub fn next_output(&mut self) -> Result<Option<Vec<u8>>> {
        self.rt.block_on(self.inner.next_output())
    }

    pub fn wait(&mut self) -> Result<Option<i32>> {
        self.rt.block_on(self.inner.wait())
    }

    pub fn kill(&mut self) -> Result<bool> {
        self.rt.block_on(self.inner.kill())
    }

    pub fn disconnect(self) {
        let Self { inner, rt: _rt } = self;
        inner.disconnect();
    }
}

/// Blocking counterpart of [`crate::Files`].
pub struct Files {
    inner: crate::Files,
    rt: Arc<Runtime>,
}

impl Files {
    pub fn read(&self, path: impl Into<String>) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.read(path))
    }

    pub fn write(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Result<()> {
        self.rt.block_on(self.inner.write(path, data))
    }

    pub fn list(&self, path: impl Into<String>) -> Result<Vec<EntryInfo>> {
        self.rt.block_on(self.inner.list(path))
    }

    pub fn remove(&self, path: impl Into<String>) -> Result<bool> {
        self.rt.block_on(self.inner.remove(path))
    }

    pub fn rename(&self, from: impl Into<String>, to: impl Into<String>) -> Result<()> {
        self.rt.block_on(self.inner.rename(from, to))
    }

    pub fn make_dir(&self, path: impl Into<String>) -> Result<bool> {
        self.rt.block_on(self.inner.make_dir(path))
    }

    pub fn exists(&self, path: impl Into<String>) -> Result<bool> {
        self.rt.block_on(self.inner.exists(path))
    }

    pub fn download_url(&self, path: &str, options: &UrlOptions) -> Result<String> {
        self.inner.download_url(path, options)
    }

    pub fn upload_url(&self, path: &str, options: &UrlOptions) -> Result<String> {
        self.inner.upload_url(path, options)
    }

    pub fn watch_dir(&self, path: impl Into<String>) -> Result<WatchHandle> {
        Ok(WatchHandle {
            inner: self.rt.block_on(self.inner.watch_dir(path))?,
            rt: self.rt.clone(),
        })
    }
}

/// Blocking counterpart of [`crate::WatchHandle`], pull mode only.
pub struct WatchHandle {
    inner: crate::WatchHandle,
    rt: Arc<Runtime>,
}

impl WatchHandle {
    pub fn path(&self) -> &str {
        self.inner.path()
    }

    /// Everything accumulated since the previous call. The runtime is
    /// driven briefly so frames already on the socket are drained first.
    pub fn get_new_events(&mut self) -> Result<Vec<FilesystemEvent>> {
        // Poll the reader so buffered frames reach the watch channel.
        self.rt
            .block_on(tokio::time::sleep(Duration::from_millis(10)));
        self.inner.get_new_events()
    }

    pub fn recv(&mut self) -> Result<Option<FilesystemEvent>> {
        self.rt.block_on(self.inner.recv())
    }

    pub fn recv_timeout(&mut self, deadline: Duration) -> Result<Option<FilesystemEvent>> {
        self.rt.block_on(self.inner.recv_timeout(deadline))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.stop())
    }
}
