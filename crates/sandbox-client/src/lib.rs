//! SDK for remote, programmatic control of ephemeral compute sandboxes.
//!
//! One persistent connection to the sandbox daemon carries many concurrent
//! logical operations: request/response calls and long-lived event streams
//! (process output, PTY output, filesystem watches). A single background
//! reader owns the socket; replies are correlated to callers by id and
//! stream events are demultiplexed to their consumers, so every controller
//! is safe to use from many call sites at once.
//!
//! # Features
//! - Commands: start/run with streamed output, list, kill, signals, stdin,
//!   detach and reattach by pid
//! - PTYs: interactive sessions with resize and keystroke input
//! - Filesystem: read/write/list/remove/rename, directory watching (push or
//!   pull), signed upload/download URLs
//! - Lifecycle: create/connect/pause/resume/kill via the control-plane API,
//!   with sandbox expiry distinguished from network failure
//! - Both async and blocking surfaces over the same engine (see
//!   [`blocking`])
//!
//! # Example
//! ```no_run
//! # async fn example() -> sandbox_client::Result<()> {
//! use std::time::Duration;
//! use sandbox_client::{Config, CreateOptions, Sandbox, StartOptions};
//!
//! let config = Config::from_env()?;
//! let sandbox = Sandbox::create(&config, CreateOptions::new("base")).await?;
//!
//! let result = sandbox
//!     .commands()
//!     .run(
//!         StartOptions::new("echo").arg("Hello, World!"),
//!         Duration::from_secs(10),
//!     )
//!     .await?;
//! assert_eq!(result.stdout, "Hello, World!\n");
//!
//! sandbox.files().write("/home/user/app.py", "print(1)").await?;
//! sandbox.kill().await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod blocking;
mod config;
mod error;
mod filesystem;
mod process;
mod pty;
mod router;
mod sandbox;
mod session;
mod signature;
mod transport;
mod watch;

pub use api::{SandboxInfo, SandboxPage, SandboxQuery, SandboxState};
pub use config::{Config, ENV_API_KEY, ENV_API_URL};
pub use error::{Error, Result};
pub use filesystem::{Files, UrlOptions};
pub use process::{
    CommandResult, Commands, ProcessEvent, ProcessHandle, ProcessState, SIGKILL, SIGTERM,
    StartOptions,
};
pub use pty::{Pty, PtyHandle, PtyOptions, PtySize};
pub use sandbox::{CreateOptions, Sandbox};
pub use watch::{FilesystemEvent, WatchHandle};

pub use sandbox_proto::{EntryInfo, FsEventKind, ProcessInfo};
