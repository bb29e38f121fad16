//! Smoke tests for the io_uring completion backend. The whole suite
//! skips (with a log line) on kernels or sandboxes that refuse
//! `io_uring_setup`.

#![cfg(target_os = "linux")]

use std::io::{Read, Write};
use std::net;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::engine::{Access, AioFile, AioSocket, FileBackend, OpenMode, SocketBackend};
use evio::{AioEngine, EngineConfig, ErrorCode, Family, InetAddress};

mod util;
use util::{init, wait};

fn try_ring_engine() -> Option<AioEngine> {
    init();
    let engine = AioEngine::new(EngineConfig {
        socket_backend: SocketBackend::CompletionPort,
        file_backend: FileBackend::NativeAsync,
        ..EngineConfig::default()
    });
    match engine.start(2) {
        Ok(()) => Some(engine),
        Err(err) => {
            log::warn!("io_uring unavailable, skipping: {}", err);
            None
        }
    }
}

#[test]
fn ring_file_write_then_read() {
    let Some(engine) = try_ring_engine() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let file = Arc::new(AioFile::new());
    file.open(
        &dir.path().join("ring"),
        OpenMode::CreateOrTruncate,
        Access::ReadWrite,
    )
    .unwrap();

    let (tx, rx) = channel();
    engine
        .file_write(&file, 0, b"ring payload".to_vec(), move |_f, _b, n, err| {
            tx.send((n, err)).unwrap();
        })
        .unwrap();
    let (n, err) = wait(&rx);
    assert!(!err.is_set(), "{}", err);
    assert_eq!(n, 12);

    let (tx, rx) = channel();
    engine
        .file_read(&file, 5, vec![0; 7], move |_f, buf, n, err| {
            tx.send((buf, n, err)).unwrap();
        })
        .unwrap();
    let (buf, n, err) = wait(&rx);
    assert!(!err.is_set(), "{}", err);
    assert_eq!(n, 7);
    assert_eq!(&buf[..7], b"payload");

    engine.shutdown();
    assert_eq!(engine.pending(), 0);
}

#[test]
fn ring_accept_read_write_close() {
    let Some(engine) = try_ring_engine() else {
        return;
    };

    let listener = Arc::new(AioSocket::new());
    listener.init(Family::V4).unwrap();
    listener.set_reuse_addr(true).unwrap();
    listener.bind(&InetAddress::loopback(Family::V4), 0).unwrap();
    listener.listen(0).unwrap();
    let (_, port) = listener.local_address().unwrap();

    let accepted = Arc::new(AioSocket::new());
    let (tx, rx) = channel();
    engine
        .socket_accept(&listener, &accepted, move |_l, _a, err| {
            tx.send(err).unwrap();
        })
        .unwrap();

    let mut client = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let err = wait(&rx);
    assert!(!err.is_set(), "{}", err);

    client.write_all(b"over the ring").unwrap();
    let (tx, rx) = channel();
    engine
        .socket_read(&accepted, vec![0; 64], move |_s, buf, n, err| {
            tx.send((buf, n, err)).unwrap();
        })
        .unwrap();
    let (buf, n, err) = wait(&rx);
    assert!(!err.is_set(), "{}", err);
    assert_eq!(&buf[..n], b"over the ring");

    let (tx, rx) = channel();
    engine
        .socket_write(&accepted, b"ack".to_vec(), move |_s, n, err| {
            tx.send((n, err)).unwrap();
        })
        .unwrap();
    let (n, err) = wait(&rx);
    assert!(!err.is_set(), "{}", err);
    assert_eq!(n, 3);

    let mut reply = [0; 3];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ack");

    let (tx, rx) = channel();
    engine
        .socket_close(&accepted, move |_s, err| tx.send(err).unwrap())
        .unwrap();
    assert!(!wait(&rx).is_set());
    assert_eq!(client.read(&mut reply).unwrap(), 0);

    engine.shutdown();
    assert_eq!(engine.pending(), 0);
}

#[test]
fn ring_sendfile_emulation() {
    let Some(engine) = try_ring_engine() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..6000u32).map(|i| (i % 239) as u8).collect();
    std::fs::write(dir.path().join("blob"), &payload).unwrap();
    let file = Arc::new(AioFile::new());
    file.open(&dir.path().join("blob"), OpenMode::OpenOnly, Access::Read)
        .unwrap();

    let listener = Arc::new(AioSocket::new());
    listener.init(Family::V4).unwrap();
    listener.bind(&InetAddress::loopback(Family::V4), 0).unwrap();
    listener.listen(0).unwrap();
    let (_, port) = listener.local_address().unwrap();

    let accepted = Arc::new(AioSocket::new());
    let (tx, rx) = channel();
    engine
        .socket_accept(&listener, &accepted, move |_l, _a, err| {
            tx.send(err).unwrap();
        })
        .unwrap();
    let mut client = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(!wait(&rx).is_set());

    let (tx, rx) = channel();
    engine
        .socket_sendfile(&accepted, &file, 0, 6000, move |_s, n, err| {
            tx.send((n, err)).unwrap();
        })
        .unwrap();

    let reader = thread::spawn(move || {
        let mut data = vec![0; 6000];
        client.read_exact(&mut data).unwrap();
        data
    });

    let (n, err) = wait(&rx);
    assert!(!err.is_set(), "{}", err);
    assert_eq!(n, 6000);
    assert_eq!(reader.join().unwrap(), payload);

    engine.shutdown();
    assert_eq!(engine.pending(), 0);
}

#[test]
fn ring_shutdown_cancels_pending_read() {
    let Some(engine) = try_ring_engine() else {
        return;
    };

    let listener = Arc::new(AioSocket::new());
    listener.init(Family::V4).unwrap();
    listener.bind(&InetAddress::loopback(Family::V4), 0).unwrap();
    listener.listen(0).unwrap();
    let (_, port) = listener.local_address().unwrap();

    let accepted = Arc::new(AioSocket::new());
    let (tx, rx) = channel();
    engine
        .socket_accept(&listener, &accepted, move |_l, _a, err| {
            tx.send(err).unwrap();
        })
        .unwrap();
    let client = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(!wait(&rx).is_set());

    let (tx, rx) = channel();
    engine
        .socket_read(&accepted, vec![0; 32], move |_s, _b, _n, err| {
            tx.send(err).unwrap();
        })
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    engine.shutdown();

    let err = wait(&rx);
    assert_eq!(err.code(), ErrorCode::IoCanceled);
    assert_eq!(engine.pending(), 0);
    drop(client);
}
