//! Transport level tests: framing, descriptor passing, end of stream.

use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;

use serde_json::json;
use varlink_aio::transport::VarlinkTransport;
use varlink_aio::{ErrorKind, Request};

fn raw_pair() -> (VarlinkTransport, StdUnixStream) {
    let (a, b) = StdUnixStream::pair().expect("socketpair");
    let transport = VarlinkTransport::from_socket(a.into()).expect("transport");
    (transport, b)
}

fn pipe_fds() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[tokio::test]
async fn frames_are_minimal_json_with_null_terminator() {
    let (mut transport, mut raw) = raw_pair();
    transport
        .send_message(&Request::create("org.example.Ping", None), vec![])
        .await
        .expect("send");
    let mut buf = [0u8; 128];
    let n = raw.read(&mut buf).expect("read");
    assert_eq!(&buf[..n], b"{\"method\":\"org.example.Ping\"}\0");
}

#[tokio::test]
async fn multiple_frames_in_one_chunk() {
    let (mut transport, mut raw) = raw_pair();
    raw.write_all(b"{\"a\":0}\0{\"b\":0}\0").expect("write");
    let (first, fds) = transport.recv_message().await.expect("recv").expect("frame");
    assert_eq!(first, json!({"a": 0}));
    assert!(fds.is_empty());
    let (second, _) = transport.recv_message().await.expect("recv").expect("frame");
    assert_eq!(second, json!({"b": 0}));
}

#[tokio::test]
async fn partial_frames_complete_later() {
    let (mut transport, mut raw) = raw_pair();
    raw.write_all(b"{\"x\":").expect("write prefix");
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        raw.write_all(b"1}\0").expect("write suffix");
        raw
    });
    let (obj, _) = transport.recv_message().await.expect("recv").expect("frame");
    assert_eq!(obj, json!({"x": 1}));
    writer.join().expect("writer thread");
}

#[tokio::test]
async fn clean_eof_is_none() {
    let (mut transport, raw) = raw_pair();
    drop(raw);
    assert!(transport.recv_message().await.expect("recv").is_none());
}

#[tokio::test]
async fn eof_inside_frame_is_a_violation() {
    let (mut transport, mut raw) = raw_pair();
    raw.write_all(b"{\"method\":\"X.Y\"").expect("write");
    drop(raw);
    let err = transport.recv_message().await.expect_err("violation");
    assert!(matches!(err.kind(), ErrorKind::ProtocolViolation(_)));
}

#[tokio::test]
async fn invalid_json_is_a_violation() {
    let (mut transport, mut raw) = raw_pair();
    raw.write_all(b"not json\0").expect("write");
    let err = transport.recv_message().await.expect_err("violation");
    assert!(matches!(err.kind(), ErrorKind::ProtocolViolation(_)));

    let (mut transport, mut raw) = raw_pair();
    raw.write_all(b"[1, 2]\0").expect("write");
    let err = transport.recv_message().await.expect_err("violation");
    assert!(matches!(err.kind(), ErrorKind::ProtocolViolation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptors_travel_with_their_frame() {
    let (mut sender, mut receiver) = VarlinkTransport::pair().expect("pair");
    let (pipe_r, pipe_w) = pipe_fds();

    sender
        .send_message(&json!({"fd": 0}), vec![pipe_w])
        .await
        .expect("send with fd");
    sender
        .send_message(&json!({"plain": true}), vec![])
        .await
        .expect("send without fd");

    let (obj, mut fds) = receiver.recv_message().await.expect("recv").expect("frame");
    assert_eq!(obj, json!({"fd": 0}));
    assert_eq!(fds.len(), 1);
    let passed = fds.take(0).expect("take passed fd");

    let (obj, fds) = receiver.recv_message().await.expect("recv").expect("frame");
    assert_eq!(obj, json!({"plain": true}));
    assert!(fds.is_empty());

    // the passed descriptor reaches the same pipe
    let mut file = std::fs::File::from(passed);
    file.write_all(b"ping").expect("write through passed fd");
    drop(file);
    let mut reader = std::fs::File::from(pipe_r);
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).expect("read from pipe");
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn received_descriptors_close_on_drop() {
    let (mut sender, mut receiver) = VarlinkTransport::pair().expect("pair");
    let (pipe_r, pipe_w) = pipe_fds();
    drop(pipe_r);
    sender
        .send_message(&json!({"fd": 0}), vec![pipe_w])
        .await
        .expect("send");
    let (_, fds) = receiver.recv_message().await.expect("recv").expect("frame");
    let raw = fds.raw(0).expect("slot");
    assert!(fd_is_open(raw));
    drop(fds);
    assert!(!fd_is_open(raw));
}

#[tokio::test]
async fn pipes_reject_descriptors_but_keep_working() {
    let (r1, w1) = pipe_fds();
    let (r2, w2) = pipe_fds();
    let mut a = VarlinkTransport::new(r1, w2, false).expect("transport a");
    let mut b = VarlinkTransport::new(r2, w1, false).expect("transport b");
    assert!(!a.supports_descriptors());

    let (_, keep) = pipe_fds();
    let err = a
        .enqueue(&json!({"fd": 0}), vec![keep])
        .expect_err("descriptors on a pipe");
    assert!(matches!(err.kind(), ErrorKind::DescriptorsUnsupported));

    // the connection stays usable
    a.send_message(&json!({"ok": true}), vec![]).await.expect("send");
    let (obj, fds) = b.recv_message().await.expect("recv").expect("frame");
    assert_eq!(obj, json!({"ok": true}));
    assert!(fds.is_empty());
}

#[tokio::test]
async fn close_drains_queued_frames() {
    let (mut sender, mut receiver) = VarlinkTransport::pair().expect("pair");
    sender.enqueue(&json!({"last": true}), vec![]).expect("enqueue");
    sender.close().await;
    let (obj, _) = receiver.recv_message().await.expect("recv").expect("frame");
    assert_eq!(obj, json!({"last": true}));
    assert!(receiver.recv_message().await.expect("eof").is_none());
}
