//! Payload types carried inside frames (MessagePack via serde).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Numeric status codes carried by [`WireError`].
pub mod status_code {
    pub const INVALID_ARGUMENT: u16 = 1;
    pub const AUTHENTICATION: u16 = 2;
    pub const NOT_FOUND: u16 = 3;
    pub const INVALID_PATH: u16 = 4;
    pub const INVALID_USER: u16 = 5;
    pub const NOT_ENOUGH_DISK_SPACE: u16 = 6;
    pub const SANDBOX_GONE: u16 = 7;
    pub const INTERNAL: u16 = 100;
}

/// Decoded status of a `fail` or `bye` frame.
///
/// Unknown codes are preserved as [`Status::Other`] so the client-side
/// translation can stay an exhaustive match without losing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    InvalidArgument,
    Authentication,
    NotFound,
    InvalidPath,
    InvalidUser,
    NotEnoughDiskSpace,
    /// The sandbox itself is gone: expired, paused, or killed.
    SandboxGone,
    Internal,
    Other(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            status_code::INVALID_ARGUMENT => Status::InvalidArgument,
            status_code::AUTHENTICATION => Status::Authentication,
            status_code::NOT_FOUND => Status::NotFound,
            status_code::INVALID_PATH => Status::InvalidPath,
            status_code::INVALID_USER => Status::InvalidUser,
            status_code::NOT_ENOUGH_DISK_SPACE => Status::NotEnoughDiskSpace,
            status_code::SANDBOX_GONE => Status::SandboxGone,
            status_code::INTERNAL => Status::Internal,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::InvalidArgument => status_code::INVALID_ARGUMENT,
            Status::Authentication => status_code::AUTHENTICATION,
            Status::NotFound => status_code::NOT_FOUND,
            Status::InvalidPath => status_code::INVALID_PATH,
            Status::InvalidUser => status_code::INVALID_USER,
            Status::NotEnoughDiskSpace => status_code::NOT_ENOUGH_DISK_SPACE,
            Status::SandboxGone => status_code::SANDBOX_GONE,
            Status::Internal => status_code::INTERNAL,
            Status::Other(code) => code,
        }
    }
}

/// Error payload of a `fail` or `bye` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl WireError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            code: status.code(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.code)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Payload of the `hello` frame sent by the client after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// Payload of a `call` frame.
///
/// `ProcessStart`, `ProcessConnect`, `PtyCreate`, and `WatchStart` open an
/// event stream whose operation id equals the call id; the rest are plain
/// request/response calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    ProcessStart {
        cmd: String,
        args: Vec<String>,
        envs: HashMap<String, String>,
        cwd: Option<String>,
        user: Option<String>,
        tag: Option<String>,
    },
    ProcessList,
    ProcessKill {
        pid: u32,
    },
    ProcessSignal {
        pid: u32,
        signal: i32,
    },
    ProcessConnect {
        pid: u32,
    },
    ProcessStdin {
        pid: u32,
        data: Vec<u8>,
    },
    PtyCreate {
        cols: u16,
        rows: u16,
        envs: HashMap<String, String>,
        cwd: Option<String>,
    },
    PtyResize {
        pid: u32,
        cols: u16,
        rows: u16,
    },
    WatchStart {
        path: String,
        recursive: bool,
    },
    WatchStop {
        watcher_id: u32,
    },
    FsRead {
        path: String,
    },
    FsWrite {
        path: String,
        data: Vec<u8>,
    },
    FsList {
        path: String,
    },
    FsRemove {
        path: String,
    },
    FsRename {
        from: String,
        to: String,
    },
    FsMakeDir {
        path: String,
    },
    FsExists {
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A process known to the daemon, as returned by `ProcessList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub tag: Option<String>,
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

/// A directory entry, as returned by `FsList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

/// Payload of a `reply` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Generic acknowledgement (signal, stdin, resize, rename, write).
    Ok,
    /// A stream-opening call was accepted; events follow under the call id.
    StreamOpened,
    /// Watch established. The watcher id always equals the call id; it is
    /// echoed so the caller can hold it without tracking the call.
    WatchStarted { watcher_id: u32 },
    Processes(Vec<ProcessInfo>),
    /// Boolean results (kill, remove, make_dir, exists).
    Bool(bool),
    /// File contents (read).
    Data(Vec<u8>),
    Entries(Vec<EntryInfo>),
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Kind of a filesystem change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

/// A single filesystem change under a watched directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsNotification {
    /// Name of the affected entry, relative to the watched directory.
    pub name: String,
    pub kind: FsEventKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Payload of an `event` frame. The frame id identifies the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    /// First event of a process/PTY stream: the daemon-assigned pid.
    Started { pid: u32 },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Combined PTY output.
    Output(Vec<u8>),
    Fs(Vec<FsNotification>),
    /// Terminal event of a process/PTY stream.
    End {
        exit_code: Option<i32>,
        error: Option<String>,
    },
    /// Terminal event of a watch stream.
    Stopped,
}

impl StreamEvent {
    /// Whether this event terminates its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Stopped)
    }
}
