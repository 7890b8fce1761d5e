//! Directory watching: filesystem change events, push or pull.
//!
//! Both consumption modes share one stream registration. Pull mode keeps
//! the event receiver on the handle ([`WatchHandle::get_new_events`] /
//! [`WatchHandle::recv`]); push mode forwards events to a callback from a
//! background task. `stop` is terminal: any later operation on the handle
//! fails with a closed-handle error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use sandbox_proto::{FsEventKind, FsNotification, Request, Response, StreamEvent};

use crate::error::{Error, Result};
use crate::filesystem::Files;
use crate::session::{Session, expect_ok};

/// A filesystem change under a watched directory.
#[derive(Debug, Clone)]
pub struct FilesystemEvent {
    /// Name of the affected entry, relative to the watched directory.
    pub name: String,
    pub kind: FsEventKind,
    pub timestamp: DateTime<Utc>,
}

impl FilesystemEvent {
    fn from_wire(notification: FsNotification) -> Self {
        Self {
            name: notification.name,
            kind: notification.kind,
            timestamp: DateTime::from_timestamp_millis(notification.timestamp_ms)
                .unwrap_or_default(),
        }
    }
}

impl Files {
    /// Watch a directory for changes, consuming events by pull
    /// ([`WatchHandle::get_new_events`]) or await ([`WatchHandle::recv`]).
    /// Only changes made after the watch is established are reported.
    pub async fn watch_dir(&self, path: impl Into<String>) -> Result<WatchHandle> {
        let path = path.into();
        let opened = self
            .session
            .open_stream(
                Request::WatchStart {
                    path: path.clone(),
                    recursive: false,
                },
                None,
            )
            .await?;
        let watcher_id = watcher_id_from(&opened.response, opened.id);
        Ok(WatchHandle {
            session: self.session.clone(),
            watcher_id,
            path,
            events: Some(opened.events),
            pending: VecDeque::new(),
            closed: false,
        })
    }

    /// Watch a directory, invoking `handler` for every event in arrival
    /// order. The returned handle only supports [`WatchHandle::stop`].
    pub async fn watch_dir_with(
        &self,
        path: impl Into<String>,
        handler: impl Fn(FilesystemEvent) + Send + 'static,
    ) -> Result<WatchHandle> {
        let path = path.into();
        let opened = self
            .session
            .open_stream(
                Request::WatchStart {
                    path: path.clone(),
                    recursive: false,
                },
                None,
            )
            .await?;
        let watcher_id = watcher_id_from(&opened.response, opened.id);

        let mut events = opened.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Fs(notifications) => {
                        for notification in notifications {
                            handler(FilesystemEvent::from_wire(notification));
                        }
                    }
                    StreamEvent::Stopped => break,
                    _ => {}
                }
            }
        });

        Ok(WatchHandle {
            session: self.session.clone(),
            watcher_id,
            path,
            events: None,
            pending: VecDeque::new(),
            closed: false,
        })
    }
}

fn push_mode_error() -> Error {
    Error::InvalidArgument("watch handle is in push mode".to_string())
}

/// The daemon echoes the watcher id (it always equals the call id).
fn watcher_id_from(response: &Response, call_id: u32) -> u32 {
    match response {
        Response::WatchStarted { watcher_id } => *watcher_id,
        _ => call_id,
    }
}

/// Handle to an active directory watch.
pub struct WatchHandle {
    session: Arc<Session>,
    watcher_id: u32,
    path: String,
    /// `None` in push mode (a background task owns the receiver).
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    pending: VecDeque<FilesystemEvent>,
    closed: bool,
}

impl WatchHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn watcher_id(&self) -> u32 {
        self.watcher_id
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::HandleClosed("watch"));
        }
        Ok(())
    }

    /// Everything accumulated since the previous call (or since the watch
    /// started, on the first call). Never blocks.
    pub fn get_new_events(&mut self) -> Result<Vec<FilesystemEvent>> {
        self.check_open()?;
        let events = self.events.as_mut().ok_or_else(push_mode_error)?;
        let mut drained: Vec<FilesystemEvent> = self.pending.drain(..).collect();
        loop {
            match events.try_recv() {
                Ok(StreamEvent::Fs(notifications)) => {
                    drained.extend(notifications.into_iter().map(FilesystemEvent::from_wire));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(drained)
    }

    /// Await the next event. Returns `Ok(None)` if the stream has ended
    /// (daemon-side stop or connection close).
    pub async fn recv(&mut self) -> Result<Option<FilesystemEvent>> {
        self.check_open()?;
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let events = self.events.as_mut().ok_or_else(push_mode_error)?;
        loop {
            match events.recv().await {
                None | Some(StreamEvent::Stopped) => return Ok(None),
                Some(StreamEvent::Fs(notifications)) => {
                    self.pending
                        .extend(notifications.into_iter().map(FilesystemEvent::from_wire));
                    if let Some(event) = self.pending.pop_front() {
                        return Ok(Some(event));
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// [`recv`](Self::recv) bounded by an overall deadline; raises
    /// deadline-exceeded when it elapses.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Option<FilesystemEvent>> {
        match tokio::time::timeout(deadline, self.recv()).await {
            Err(_) => Err(Error::DeadlineExceeded(deadline)),
            Ok(result) => result,
        }
    }

    /// Stop the watch. Terminal and irreversible: every subsequent
    /// operation on this handle (including another `stop`) fails with a
    /// closed-handle error.
    pub async fn stop(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        self.session.unregister_stream(self.watcher_id);
        self.events = None;
        self.pending.clear();
        let response = self
            .session
            .call(
                Request::WatchStop {
                    watcher_id: self.watcher_id,
                },
                None,
            )
            .await?;
        expect_ok(response)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.session.unregister_stream(self.watcher_id);
        }
    }
}
