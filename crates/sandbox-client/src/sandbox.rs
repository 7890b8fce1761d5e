//! The sandbox facade: control-plane lifecycle bound to one data-plane
//! session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::api::{ApiClient, SandboxInfo, SandboxPage, SandboxQuery, SandboxState};
use crate::config::Config;
use crate::error::Result;
use crate::filesystem::Files;
use crate::process::Commands;
use crate::pty::Pty;
use crate::session::Session;
use crate::transport::{Connection, Dialer, TcpDialer, TransportTiming};

/// Lifetime a sandbox gets when the caller does not specify one.
const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for creating a sandbox.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    template: String,
    timeout: Duration,
    metadata: HashMap<String, String>,
    envs: HashMap<String, String>,
}

impl CreateOptions {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            timeout: DEFAULT_SANDBOX_TIMEOUT,
            metadata: HashMap::new(),
            envs: HashMap::new(),
        }
    }

    /// Lifetime before the sandbox expires (extendable later with
    /// [`Sandbox::set_timeout`]).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

/// A running sandbox with a live data-plane session.
///
/// Controllers ([`commands`](Self::commands), [`pty`](Self::pty),
/// [`files`](Self::files)) share the session; it is safe to use them
/// concurrently. Dropping the sandbox closes the session but leaves the
/// remote sandbox running until it expires or is killed.
pub struct Sandbox {
    id: String,
    info: Mutex<SandboxInfo>,
    api: ApiClient,
    session: Arc<Session>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox from a template and connect to its daemon.
    pub async fn create(config: &Config, options: CreateOptions) -> Result<Sandbox> {
        let api = ApiClient::new(config)?;
        let info = api
            .create_sandbox(
                &options.template,
                options.timeout,
                &options.metadata,
                &options.envs,
            )
            .await?;
        Self::attach(config, api, info).await
    }

    /// Connect to an existing sandbox by id, resuming it first if paused.
    pub async fn connect(config: &Config, sandbox_id: &str) -> Result<Sandbox> {
        let api = ApiClient::new(config)?;
        let mut info = api.get_sandbox(sandbox_id).await?;
        if info.state == SandboxState::Paused {
            info = api.resume_sandbox(sandbox_id).await?;
        }
        Self::attach(config, api, info).await
    }

    async fn attach(config: &Config, api: ApiClient, info: SandboxInfo) -> Result<Sandbox> {
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(&info.daemon_host));
        let timing = TransportTiming {
            connect_timeout: config.connect_timeout,
            ..TransportTiming::default()
        };
        let conn = Connection::connect(dialer, info.access_token.clone(), timing).await?;
        let session = Arc::new(Session::new(
            conn,
            config.request_timeout,
            Some(info.expires_at),
        ));
        Ok(Sandbox {
            id: info.sandbox_id.clone(),
            info: Mutex::new(info),
            api,
            session,
        })
    }

    fn info(&self) -> MutexGuard<'_, SandboxInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SandboxState {
        self.info().state
    }

    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.info().expires_at
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.info().metadata.clone()
    }

    /// Command controller for this session.
    pub fn commands(&self) -> Commands {
        Commands {
            session: self.session.clone(),
        }
    }

    /// PTY controller for this session.
    pub fn pty(&self) -> Pty {
        Pty {
            session: self.session.clone(),
        }
    }

    /// Filesystem controller for this session.
    pub fn files(&self) -> Files {
        let info = self.info();
        Files {
            session: self.session.clone(),
            host: info.daemon_host.clone(),
            token: info.access_token.clone(),
        }
    }

    /// Extend the sandbox's lifetime from now.
    pub async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let info = self.api.set_timeout(&self.id, timeout).await?;
        self.session.set_expires_at(info.expires_at);
        *self.info() = info;
        Ok(())
    }

    /// Pause the sandbox. Closes the data-plane session; resume by
    /// reconnecting with [`Sandbox::connect`].
    pub async fn pause(&self) -> Result<()> {
        self.session.close();
        let info = self.api.pause_sandbox(&self.id).await?;
        *self.info() = info;
        Ok(())
    }

    /// Destroy the sandbox. Returns `false` if it was already gone.
    pub async fn kill(self) -> Result<bool> {
        self.session.close();
        self.api.kill_sandbox(&self.id).await
    }

    /// Close the data-plane session without touching the remote sandbox.
    /// Idempotent.
    pub fn close(&self) {
        self.session.close();
    }

    /// List sandboxes visible to this API key, one page at a time.
    pub async fn list(
        config: &Config,
        query: &SandboxQuery,
        page_token: Option<&str>,
    ) -> Result<SandboxPage> {
        ApiClient::new(config)?.list_sandboxes(query, page_token).await
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.session.close();
    }
}
