//! The blocking surface, driven from a plain thread with no ambient
//! runtime. The mock daemon lives on its own background runtime.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

mod support;

use std::time::Duration;

use httpmock::prelude::*;

use sandbox_client::{Config, CreateOptions, FsEventKind, StartOptions, blocking};

#[test]
fn blocking_surface_end_to_end() {
    support::init_tracing();
    let bg = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let daemon = bg.block_on(support::MockDaemon::start());

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/sandboxes");
        then.status(201)
            .json_body(support::sandbox_json("sb-blocking", "running", &daemon.addr));
    });

    let config = Config::new("test-key")
        .api_url(server.base_url())
        .request_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(5));
    let sandbox = blocking::Sandbox::create(&config, CreateOptions::new("base")).unwrap();

    // Same external contract as the async surface.
    let result = sandbox
        .commands()
        .run(
            StartOptions::new("echo").arg("Hello, World!"),
            Duration::from_secs(10),
        )
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "Hello, World!\n");

    let files = sandbox.files();
    files.write("/data/blob.bin", vec![0u8, 1, 2, 255]).unwrap();
    assert_eq!(files.read("/data/blob.bin").unwrap(), vec![0u8, 1, 2, 255]);

    let mut watch = files.watch_dir("/data").unwrap();
    files.write("/data/new.txt", "x").unwrap();
    let events = watch.get_new_events().unwrap();
    let kinds: Vec<FsEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![FsEventKind::Create, FsEventKind::Write]);
    assert!(events.iter().all(|e| e.name == "new.txt"));
    watch.stop().unwrap();

    assert!(!sandbox.commands().kill(999_999).unwrap());
    sandbox.close();
}

#[test]
fn blocking_interactive_process() {
    let bg = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let daemon = bg.block_on(support::MockDaemon::start());

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/sandboxes");
        then.status(201)
            .json_body(support::sandbox_json("sb-cat", "running", &daemon.addr));
    });

    let config = Config::new("test-key")
        .api_url(server.base_url())
        .request_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(5));
    let sandbox = blocking::Sandbox::create(&config, CreateOptions::new("base")).unwrap();
    let commands = sandbox.commands();

    let mut handle = commands.start(StartOptions::new("cat")).unwrap();
    commands.send_stdin(handle.pid(), "ping").unwrap();
    handle.next_event().unwrap().unwrap();
    assert_eq!(handle.stdout(), b"ping");

    assert!(commands.kill(handle.pid()).unwrap());
    let result = handle.wait().unwrap();
    assert_eq!(result.exit_code, 137);
    sandbox.close();
}
