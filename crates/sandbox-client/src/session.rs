//! Logical session: a connection bound to one sandbox's lifetime.
//!
//! Controllers go through [`Session`] rather than the raw connection so that
//! a client-side deadline elapsing *after* the sandbox's own deadline is
//! reported as sandbox expiry, not as a generic timeout.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use sandbox_proto::{Request, Response};

use crate::error::{Error, Result};
use crate::transport::{Connection, OpenedStream};

pub(crate) struct Session {
    conn: Connection,
    request_timeout: Duration,
    expires_at: Mutex<Option<DateTime<Utc>>>,
}

impl Session {
    pub(crate) fn new(
        conn: Connection,
        request_timeout: Duration,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            conn,
            request_timeout,
            expires_at: Mutex::new(expires_at),
        }
    }

    fn expires_at(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.expires_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_expires_at(&self, at: DateTime<Utc>) {
        *self.expires_at() = Some(at);
    }

    /// Whether the sandbox's own deadline has passed.
    pub(crate) fn expired(&self) -> bool {
        self.expires_at().is_some_and(|at| at <= Utc::now())
    }

    /// A timeout observed while the sandbox deadline has already passed is
    /// attributed to the sandbox, not the network.
    pub(crate) fn timeout_error(&self, elapsed: Duration) -> Error {
        if self.expired() {
            Error::SandboxExpired(format!(
                "no response within {elapsed:?} and the sandbox deadline has passed"
            ))
        } else {
            Error::RequestTimeout(elapsed)
        }
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub(crate) async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Response> {
        let deadline = timeout.unwrap_or(self.request_timeout);
        match self.conn.call(request, deadline).await {
            Err(Error::RequestTimeout(elapsed)) => Err(self.timeout_error(elapsed)),
            other => other,
        }
    }

    pub(crate) async fn open_stream(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<OpenedStream> {
        let deadline = timeout.unwrap_or(self.request_timeout);
        match self.conn.open_stream(request, deadline).await {
            Err(Error::RequestTimeout(elapsed)) => Err(self.timeout_error(elapsed)),
            other => other,
        }
    }

    pub(crate) fn unregister_stream(&self, id: u32) {
        self.conn.unregister_stream(id);
    }

    pub(crate) fn close(&self) {
        self.conn.close();
    }
}

// ---------------------------------------------------------------------------
// Reply shape helpers
// ---------------------------------------------------------------------------

pub(crate) fn expect_ok(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_bool(response: Response) -> Result<bool> {
    match response {
        Response::Bool(value) => Ok(value),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_data(response: Response) -> Result<Vec<u8>> {
    match response {
        Response::Data(data) => Ok(data),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Sandbox(format!("unexpected response shape: {response:?}"))
}
