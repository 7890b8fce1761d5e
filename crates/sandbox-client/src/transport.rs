//! Transport: the physical daemon connection and its background reader.
//!
//! Exactly one reader task owns the read half of the socket; every other
//! component consumes in-memory channels fed by it (replies through the
//! router's pending calls, stream events through per-operation channels).
//! That single-reader rule is what makes concurrent logical operations on
//! one connection safe without a lock around the whole connection.
//!
//! ## Connection Flow
//!
//! 1. Dial the daemon (TCP in production, in-memory pairs in tests)
//! 2. Send `hello` with the access token, wait for `welcome`
//! 3. Spawn the reader; callers issue calls / open streams concurrently
//! 4. On read failure: reconnect with bounded exponential backoff; on
//!    budget exhaustion fail every pending call with a connectivity error
//! 5. On `bye` or explicit `close()`: fail pending calls exactly once

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{self, Instant};

use sandbox_proto::{Decoder, Frame, Hello, RawFrame, Request, Response, StreamEvent};

use crate::error::{Error, Result};
use crate::router::Router;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Port the daemon listens on when the control plane reports a bare host.
const DEFAULT_DAEMON_PORT: u16 = 49733;

/// Reconnection and handshake timing. Defaults match production; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub(crate) struct TransportTiming {
    pub(crate) connect_timeout: Duration,
    pub(crate) initial_retry_interval: Duration,
    pub(crate) max_retry_interval: Duration,
    pub(crate) max_reconnect_attempts: u32,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            initial_retry_interval: Duration::from_millis(500),
            max_retry_interval: Duration::from_secs(8),
            max_reconnect_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// A bidirectional byte stream to the daemon.
pub(crate) trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Produces fresh physical connections; the seam between the session engine
/// and the network (and the hook test peers plug into).
#[async_trait]
pub(crate) trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<Box<dyn Conn>>;
}

pub(crate) struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub(crate) fn new(host: &str) -> Self {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{DEFAULT_DAEMON_PORT}")
        };
        Self { addr }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Box<dyn Conn>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

type ConnReader = tokio::io::ReadHalf<Box<dyn Conn>>;
type ConnWriter = tokio::io::WriteHalf<Box<dyn Conn>>;

/// A stream-opening call that was accepted by the daemon.
pub(crate) struct OpenedStream {
    /// Operation id (equals the call id).
    pub(crate) id: u32,
    pub(crate) events: mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) response: Response,
}

struct Shared {
    router: Mutex<Router>,
    /// Write half; `None` while disconnected or after close.
    writer: AsyncMutex<Option<ConnWriter>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    timing: TransportTiming,
}

impl Shared {
    fn router(&self) -> MutexGuard<'_, Router> {
        self.router.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one logical connection. Cheap to clone; all clones share the
/// physical link, the router, and the id allocator.
#[derive(Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial, handshake, and spawn the background reader.
    pub(crate) async fn connect(
        dialer: Arc<dyn Dialer>,
        token: String,
        timing: TransportTiming,
    ) -> Result<Connection> {
        let (reader, writer, decoder, frames) = establish(dialer.as_ref(), &token, &timing).await?;
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            router: Mutex::new(Router::new()),
            writer: AsyncMutex::new(Some(writer)),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            close_tx,
            timing,
        });
        tokio::spawn(run_reader(
            shared.clone(),
            dialer,
            token,
            close_rx,
            reader,
            decoder,
            frames,
        ));
        Ok(Connection { shared })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Strictly increasing id, never 0 (0 marks unsolicited frames).
    fn next_id(&self) -> u32 {
        loop {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let data = frame
            .encode()
            .map_err(|e| Error::Sandbox(format!("encode error: {e}")))?;
        let mut slot = self.shared.writer.lock().await;
        match slot.as_mut() {
            Some(writer) => writer
                .write_all(&data)
                .await
                .map_err(|e| Error::ConnectionLost(e.to_string())),
            None if self.is_closed() => Err(Error::ConnectionClosed),
            None => Err(Error::ConnectionLost("reconnect in progress".to_string())),
        }
    }

    /// Issue a request and await its reply, failure, or the deadline,
    /// whichever comes first. Deadline expiry removes the pending call; a
    /// reply arriving afterwards is dropped by the reader.
    pub(crate) async fn call(&self, request: Request, deadline: Duration) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_id();
        let rx = self.shared.router().register_call(id);
        // A close racing the registration would miss this pending call.
        if self.is_closed() {
            self.shared.router().discard_call(id);
            return Err(Error::ConnectionClosed);
        }
        if let Err(e) = self.write_frame(&Frame::Call { id, request }).await {
            self.shared.router().discard_call(id);
            return Err(e);
        }
        match time::timeout(deadline, rx).await {
            Err(_) => {
                self.shared.router().discard_call(id);
                Err(Error::RequestTimeout(deadline))
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Issue a stream-opening request. The event consumer is registered
    /// before the frame is written, so no early event can be missed.
    pub(crate) async fn open_stream(
        &self,
        request: Request,
        deadline: Duration,
    ) -> Result<OpenedStream> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_id();
        let (events, rx) = {
            let mut router = self.shared.router();
            (router.register_stream(id), router.register_call(id))
        };
        if self.is_closed() {
            let mut router = self.shared.router();
            router.discard_call(id);
            router.unregister_stream(id);
            return Err(Error::ConnectionClosed);
        }
        if let Err(e) = self.write_frame(&Frame::Call { id, request }).await {
            let mut router = self.shared.router();
            router.discard_call(id);
            router.unregister_stream(id);
            return Err(e);
        }
        let result = match time::timeout(deadline, rx).await {
            Err(_) => {
                self.shared.router().discard_call(id);
                Err(Error::RequestTimeout(deadline))
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(result)) => result,
        };
        match result {
            Ok(response) => Ok(OpenedStream {
                id,
                events,
                response,
            }),
            Err(e) => {
                self.shared.router().unregister_stream(id);
                Err(e)
            }
        }
    }

    /// Stop consuming a stream. The operation keeps running remotely;
    /// further events for this id are dropped by the reader.
    pub(crate) fn unregister_stream(&self, id: u32) {
        self.shared.router().unregister_stream(id);
    }

    /// Close the connection. Idempotent and safe from concurrent callers:
    /// the first call cancels the reader and rejects every pending call with
    /// a cancellation error; later calls are no-ops.
    pub(crate) fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.close_tx.send(true);
        self.shared.router().fail_all(|| Error::ConnectionClosed);
    }
}

/// Connection with no live peer, for constructing controllers in unit tests.
#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let (close_tx, _close_rx) = watch::channel(false);
    Connection {
        shared: Arc::new(Shared {
            router: Mutex::new(Router::new()),
            writer: AsyncMutex::new(None),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            close_tx,
            timing: TransportTiming::default(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Dial + handshake
// ---------------------------------------------------------------------------

/// Dial and perform the hello/welcome handshake. Returns the split halves,
/// the decoder (it may hold a partial frame), and any frames that arrived in
/// the same batch as `welcome`.
async fn establish(
    dialer: &dyn Dialer,
    token: &str,
    timing: &TransportTiming,
) -> Result<(ConnReader, ConnWriter, Decoder, Vec<RawFrame>)> {
    let conn = time::timeout(timing.connect_timeout, dialer.dial())
        .await
        .map_err(|_| Error::ConnectionLost("connect timed out".to_string()))?
        .map_err(|e| Error::ConnectionLost(e.to_string()))?;
    let (mut reader, mut writer) = tokio::io::split(conn);

    let hello = Frame::Hello(Hello {
        token: token.to_string(),
    })
    .encode()
    .map_err(|e| Error::Sandbox(format!("encode error: {e}")))?;
    writer
        .write_all(&hello)
        .await
        .map_err(|e| Error::ConnectionLost(e.to_string()))?;

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let deadline = Instant::now() + timing.connect_timeout;
    loop {
        let n = time::timeout_at(deadline, reader.read(&mut buf))
            .await
            .map_err(|_| Error::ConnectionLost("handshake timed out".to_string()))?
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(Error::ConnectionLost(
                "connection closed during handshake".to_string(),
            ));
        }
        let mut frames = decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(|e| Error::Sandbox(format!("protocol error: {e}")))?
            .into_iter();
        if let Some(first) = frames.next() {
            let rest: Vec<RawFrame> = frames.collect();
            return match Frame::decode(&first) {
                Ok(Frame::Welcome) => Ok((reader, writer, decoder, rest)),
                Ok(Frame::Bye(err)) | Ok(Frame::Fail { error: err, .. }) => {
                    Err(Error::from_wire(err))
                }
                Ok(other) => Err(Error::Sandbox(format!(
                    "unexpected handshake frame: {other:?}"
                ))),
                Err(e) => Err(Error::Sandbox(format!("protocol error: {e}"))),
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Background reader
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Fatal,
}

async fn run_reader(
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    token: String,
    mut close_rx: watch::Receiver<bool>,
    mut reader: ConnReader,
    mut decoder: Decoder,
    initial: Vec<RawFrame>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut queue = initial;
    loop {
        for raw in queue.drain(..) {
            if let Flow::Fatal = dispatch(&shared, raw) {
                shared.writer.lock().await.take();
                return;
            }
        }
        tokio::select! {
            _ = close_rx.changed() => {
                shared.writer.lock().await.take();
                return;
            }
            res = reader.read(&mut buf) => {
                let failure = match res {
                    Ok(0) => Some("connection closed by daemon".to_string()),
                    Err(e) => Some(e.to_string()),
                    Ok(n) => match decoder.decode(buf.get(..n).unwrap_or_default()) {
                        Ok(frames) => {
                            queue = frames;
                            None
                        }
                        Err(e) => Some(format!("protocol error: {e}")),
                    },
                };
                if let Some(reason) = failure {
                    tracing::warn!(%reason, "daemon connection failed");
                    match reconnect(&shared, dialer.as_ref(), &token, &mut close_rx).await {
                        Some((r, d, frames)) => {
                            reader = r;
                            decoder = d;
                            queue = frames;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Route one frame. Replies and failures resolve pending calls; events go to
/// their operation's consumer; stale ids are dropped silently.
fn dispatch(shared: &Arc<Shared>, raw: RawFrame) -> Flow {
    let frame = match Frame::decode(&raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(kind = raw.kind, id = raw.id, error = %e, "dropping undecodable frame");
            return Flow::Continue;
        }
    };
    match frame {
        Frame::Reply { id, response } => {
            if !shared.router().resolve(id, Ok(response)) {
                tracing::trace!(id, "dropping reply with no pending call");
            }
            Flow::Continue
        }
        Frame::Fail { id, error } => {
            if !shared.router().resolve(id, Err(Error::from_wire(error))) {
                tracing::trace!(id, "dropping failure with no pending call");
            }
            Flow::Continue
        }
        Frame::Event { id, event } => {
            if !shared.router().route_event(id, event) {
                tracing::trace!(id, "dropping event with no registered consumer");
            }
            Flow::Continue
        }
        Frame::Bye(err) => {
            tracing::warn!(code = err.code, message = %err.message, "daemon sent bye");
            shared.closed.store(true, Ordering::SeqCst);
            shared.router().fail_all(|| Error::from_wire(err.clone()));
            Flow::Fatal
        }
        Frame::Hello(_) | Frame::Welcome | Frame::Call { .. } => {
            tracing::debug!(kind = raw.kind, "ignoring unexpected frame");
            Flow::Continue
        }
    }
}

/// Mark the connection dead and fail everything still pending.
fn fail_fatal(shared: &Arc<Shared>, make_err: impl FnMut() -> Error) {
    shared.closed.store(true, Ordering::SeqCst);
    shared.router().fail_all(make_err);
}

/// Re-establish the physical link with bounded exponential backoff.
///
/// Pending calls survive reconnection attempts (the daemon lost them, so
/// they will hit their own deadlines), but a definitive daemon answer
/// (authentication failure, sandbox gone) or an exhausted budget fails them
/// all immediately.
async fn reconnect(
    shared: &Arc<Shared>,
    dialer: &dyn Dialer,
    token: &str,
    close_rx: &mut watch::Receiver<bool>,
) -> Option<(ConnReader, Decoder, Vec<RawFrame>)> {
    shared.writer.lock().await.take();
    let timing = &shared.timing;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if attempt > timing.max_reconnect_attempts {
            tracing::error!(
                attempts = timing.max_reconnect_attempts,
                "reconnect budget exhausted"
            );
            let attempts = timing.max_reconnect_attempts;
            fail_fatal(shared, || {
                Error::ConnectionLost(format!("reconnect failed after {attempts} attempts"))
            });
            return None;
        }

        // Exponential backoff: initial, 2x, 4x, ... capped at the max interval.
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = timing
            .initial_retry_interval
            .saturating_mul(1u32 << exp)
            .min(timing.max_retry_interval);
        tokio::select! {
            _ = time::sleep(backoff) => {}
            _ = close_rx.changed() => return None,
        }

        match establish(dialer, token, timing).await {
            Ok((reader, writer, decoder, frames)) => {
                *shared.writer.lock().await = Some(writer);
                tracing::info!(attempt, "reconnected to daemon");
                return Some((reader, decoder, frames));
            }
            Err(Error::SandboxExpired(message)) => {
                fail_fatal(shared, || Error::SandboxExpired(message.clone()));
                return None;
            }
            Err(Error::Authentication(message)) => {
                fail_fatal(shared, || Error::Authentication(message.clone()));
                return None;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
