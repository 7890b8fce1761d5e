//! Test support: an in-process daemon speaking the wire protocol over TCP,
//! plus a canned control-plane payload pointing sandboxes at it.
//!
//! The daemon fakes a handful of commands (`echo`, `cat`, `sleep`, `false`)
//! with real stream semantics: start events carry fresh pids, stdin echoes
//! back, kills terminate streams, and filesystem writes fan out to watchers.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable,
    dead_code
)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use sandbox_proto::{
    Decoder, EntryInfo, Frame, FsEventKind, FsNotification, Hello, ProcessInfo, Request, Response,
    Status, StreamEvent, WireError,
};

pub const DAEMON_TOKEN: &str = "daemon-token";

/// Route SDK tracing into test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Tx = mpsc::UnboundedSender<Frame>;

/// An in-process sandbox daemon listening on a loopback TCP port.
pub struct MockDaemon {
    pub addr: String,
    accept_task: JoinHandle<()>,
}

impl MockDaemon {
    pub async fn start() -> Self {
        Self::start_with_token(DAEMON_TOKEN).await
    }

    pub async fn start_with_token(token: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let token = token.to_string();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve(stream, token.clone()));
                    }
                    Err(_) => break,
                }
            }
        });
        Self { addr, accept_task }
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Control-plane JSON for a sandbox served by `daemon`.
pub fn sandbox_json(sandbox_id: &str, state: &str, daemon_addr: &str) -> serde_json::Value {
    serde_json::json!({
        "sandboxId": sandbox_id,
        "templateId": "base",
        "state": state,
        "expiresAt": "2035-01-01T00:00:00Z",
        "metadata": {},
        "daemonHost": daemon_addr,
        "accessToken": DAEMON_TOKEN,
    })
}

// ---------------------------------------------------------------------------
// Daemon internals
// ---------------------------------------------------------------------------

struct Proc {
    info: ProcessInfo,
    /// Operation id of the currently attached stream.
    op_id: u32,
    pty: bool,
    echo_stdin: bool,
    sleeper: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    procs: HashMap<u32, Proc>,
    watchers: HashMap<u32, String>,
    next_pid: u32,
}

fn reply(tx: &Tx, id: u32, response: Response) {
    let _ = tx.send(Frame::Reply { id, response });
}

fn fail(tx: &Tx, id: u32, status: Status, message: &str) {
    let _ = tx.send(Frame::Fail {
        id,
        error: WireError::new(status, message),
    });
}

fn event(tx: &Tx, id: u32, event: StreamEvent) {
    let _ = tx.send(Frame::Event { id, event });
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let data = frame.encode().unwrap();
        if write_half.write_all(&data).await.is_err() {
            break;
        }
    }
}

async fn serve(stream: TcpStream, token: String) {
    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(run_writer(write_half, rx));

    let state = Arc::new(Mutex::new(State {
        next_pid: 1000,
        ..State::default()
    }));
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut authed = false;

    'conn: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let frames = match decoder.decode(&buf[..n]) {
            Ok(frames) => frames,
            Err(_) => break,
        };
        for raw in frames {
            let frame = match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            match frame {
                Frame::Hello(Hello { token: got }) => {
                    if got == token {
                        authed = true;
                        let _ = tx.send(Frame::Welcome);
                    } else {
                        let _ = tx.send(Frame::Bye(WireError::new(
                            Status::Authentication,
                            "invalid access token",
                        )));
                        break 'conn;
                    }
                }
                Frame::Call { id, request } if authed => {
                    handle_request(&state, &tx, id, request).await;
                }
                _ => {}
            }
        }
    }
    drop(tx);
    let _ = writer.await;
}

async fn handle_request(state: &Arc<Mutex<State>>, tx: &Tx, id: u32, request: Request) {
    match request {
        Request::ProcessStart {
            cmd,
            args,
            cwd,
            tag,
            ..
        } => {
            let mut st = state.lock().await;
            let pid = st.next_pid;
            st.next_pid += 1;
            reply(tx, id, Response::StreamOpened);
            event(tx, id, StreamEvent::Started { pid });

            let mut proc = Proc {
                info: ProcessInfo {
                    pid,
                    tag,
                    cmd: cmd.clone(),
                    args: args.clone(),
                    cwd,
                },
                op_id: id,
                pty: false,
                echo_stdin: false,
                sleeper: None,
            };
            let long_lived = match cmd.as_str() {
                "echo" => {
                    let line = format!("{}\n", args.join(" "));
                    event(tx, id, StreamEvent::Stdout(line.into_bytes()));
                    event(
                        tx,
                        id,
                        StreamEvent::End {
                            exit_code: Some(0),
                            error: None,
                        },
                    );
                    false
                }
                "false" => {
                    event(
                        tx,
                        id,
                        StreamEvent::End {
                            exit_code: Some(1),
                            error: None,
                        },
                    );
                    false
                }
                "cat" => {
                    proc.echo_stdin = true;
                    true
                }
                "sleep" => {
                    let secs: f64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0.0);
                    let state = state.clone();
                    let tx = tx.clone();
                    proc.sleeper = Some(tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                        let mut st = state.lock().await;
                        if let Some(p) = st.procs.remove(&pid) {
                            event(
                                &tx,
                                p.op_id,
                                StreamEvent::End {
                                    exit_code: Some(0),
                                    error: None,
                                },
                            );
                        }
                    }));
                    true
                }
                other => {
                    let line = format!("{other}: command not found");
                    event(tx, id, StreamEvent::Stderr(line.into_bytes()));
                    event(
                        tx,
                        id,
                        StreamEvent::End {
                            exit_code: Some(127),
                            error: None,
                        },
                    );
                    false
                }
            };
            if long_lived {
                st.procs.insert(pid, proc);
            }
        }

        Request::ProcessList => {
            let st = state.lock().await;
            let infos = st.procs.values().map(|p| p.info.clone()).collect();
            reply(tx, id, Response::Processes(infos));
        }

        Request::ProcessKill { pid } => {
            let mut st = state.lock().await;
            match st.procs.remove(&pid) {
                Some(p) => {
                    if let Some(sleeper) = &p.sleeper {
                        sleeper.abort();
                    }
                    event(
                        tx,
                        p.op_id,
                        StreamEvent::End {
                            exit_code: Some(137),
                            error: None,
                        },
                    );
                    reply(tx, id, Response::Bool(true));
                }
                None => reply(tx, id, Response::Bool(false)),
            }
        }

        Request::ProcessSignal { pid, .. } => {
            let st = state.lock().await;
            if st.procs.contains_key(&pid) {
                reply(tx, id, Response::Ok);
            } else {
                fail(tx, id, Status::NotFound, &format!("no process with pid {pid}"));
            }
        }

        Request::ProcessStdin { pid, data } => {
            let st = state.lock().await;
            match st.procs.get(&pid) {
                Some(p) => {
                    if p.echo_stdin {
                        let echoed = if p.pty {
                            StreamEvent::Output(data)
                        } else {
                            StreamEvent::Stdout(data)
                        };
                        event(tx, p.op_id, echoed);
                    }
                    reply(tx, id, Response::Ok);
                }
                None => fail(tx, id, Status::NotFound, &format!("no process with pid {pid}")),
            }
        }

        Request::ProcessConnect { pid } => {
            let mut st = state.lock().await;
            match st.procs.get_mut(&pid) {
                Some(p) => {
                    p.op_id = id;
                    reply(tx, id, Response::StreamOpened);
                    event(tx, id, StreamEvent::Started { pid });
                }
                None => fail(tx, id, Status::NotFound, &format!("no process with pid {pid}")),
            }
        }

        Request::PtyCreate { cwd, .. } => {
            let mut st = state.lock().await;
            let pid = st.next_pid;
            st.next_pid += 1;
            reply(tx, id, Response::StreamOpened);
            event(tx, id, StreamEvent::Started { pid });
            st.procs.insert(
                pid,
                Proc {
                    info: ProcessInfo {
                        pid,
                        tag: None,
                        cmd: "sh".to_string(),
                        args: Vec::new(),
                        cwd,
                    },
                    op_id: id,
                    pty: true,
                    echo_stdin: true,
                    sleeper: None,
                },
            );
        }

        Request::PtyResize { pid, .. } => {
            let st = state.lock().await;
            if st.procs.contains_key(&pid) {
                reply(tx, id, Response::Ok);
            } else {
                fail(tx, id, Status::NotFound, &format!("no pty with pid {pid}"));
            }
        }

        Request::WatchStart { path, .. } => {
            let mut st = state.lock().await;
            st.watchers.insert(id, path);
            reply(tx, id, Response::WatchStarted { watcher_id: id });
        }

        Request::WatchStop { watcher_id } => {
            let mut st = state.lock().await;
            if st.watchers.remove(&watcher_id).is_some() {
                event(tx, watcher_id, StreamEvent::Stopped);
                reply(tx, id, Response::Ok);
            } else {
                fail(
                    tx,
                    id,
                    Status::NotFound,
                    &format!("no watcher with id {watcher_id}"),
                );
            }
        }

        Request::FsRead { path } => {
            let st = state.lock().await;
            match st.files.get(&path) {
                Some(data) => reply(tx, id, Response::Data(data.clone())),
                None => fail(tx, id, Status::NotFound, &format!("path not found: {path}")),
            }
        }

        Request::FsWrite { path, data } => {
            let mut st = state.lock().await;
            let existed = st.files.contains_key(&path);
            st.files.insert(path.clone(), data);
            reply(tx, id, Response::Ok);
            let kinds = if existed {
                vec![FsEventKind::Write]
            } else {
                vec![FsEventKind::Create, FsEventKind::Write]
            };
            notify_watchers(&st, tx, &path, &kinds);
        }

        Request::FsList { path } => {
            let st = state.lock().await;
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let mut entries: Vec<EntryInfo> = Vec::new();
            for file in st.files.keys() {
                if let Some(rest) = file.strip_prefix(&prefix)
                    && !rest.contains('/')
                {
                    entries.push(EntryInfo {
                        name: rest.to_string(),
                        path: file.clone(),
                        is_dir: false,
                    });
                }
            }
            for dir in &st.dirs {
                if let Some(rest) = dir.strip_prefix(&prefix)
                    && !rest.is_empty()
                    && !rest.contains('/')
                {
                    entries.push(EntryInfo {
                        name: rest.to_string(),
                        path: dir.clone(),
                        is_dir: true,
                    });
                }
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            reply(tx, id, Response::Entries(entries));
        }

        Request::FsRemove { path } => {
            let mut st = state.lock().await;
            let existed = st.files.remove(&path).is_some() | st.dirs.remove(&path);
            reply(tx, id, Response::Bool(existed));
            if existed {
                notify_watchers(&st, tx, &path, &[FsEventKind::Remove]);
            }
        }

        Request::FsRename { from, to } => {
            let mut st = state.lock().await;
            match st.files.remove(&from) {
                Some(data) => {
                    st.files.insert(to, data);
                    reply(tx, id, Response::Ok);
                    notify_watchers(&st, tx, &from, &[FsEventKind::Rename]);
                }
                None => fail(tx, id, Status::NotFound, &format!("path not found: {from}")),
            }
        }

        Request::FsMakeDir { path } => {
            let mut st = state.lock().await;
            let created = st.dirs.insert(path);
            reply(tx, id, Response::Bool(created));
        }

        Request::FsExists { path } => {
            let st = state.lock().await;
            let exists = st.files.contains_key(&path) || st.dirs.contains(&path);
            reply(tx, id, Response::Bool(exists));
        }
    }
}

fn notify_watchers(st: &State, tx: &Tx, path: &str, kinds: &[FsEventKind]) {
    for (watcher_id, dir) in &st.watchers {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        if let Some(name) = path.strip_prefix(&prefix) {
            let now = Utc::now().timestamp_millis();
            let notifications: Vec<FsNotification> = kinds
                .iter()
                .map(|kind| FsNotification {
                    name: name.to_string(),
                    kind: *kind,
                    timestamp_ms: now,
                })
                .collect();
            event(tx, *watcher_id, StreamEvent::Fs(notifications));
        }
    }
}
