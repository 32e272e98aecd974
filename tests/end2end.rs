//! End to end tests over a socketpair: one task serving, one task calling.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use varlink_aio::client::{VarlinkClient, VarlinkInterfaceProxy};
use varlink_aio::idl::{Interface, Method, VType, VTypeExt};
use varlink_aio::service::{serve_connection, IterSource, VarlinkInterface, VarlinkService};
use varlink_aio::transport::VarlinkTransport;
use varlink_aio::{ErrorKind, Fd, Request, Result, ServiceInfo};

#[derive(Serialize, Deserialize, Debug)]
struct EchoArgs {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct EchoReply {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct RangeArgs {
    count: i64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct RangeReply {
    value: i64,
}

#[derive(Serialize, Deserialize, Debug)]
struct SleepArgs {
    delay: f64,
}

#[derive(Serialize, Deserialize, Debug)]
struct OpenArgs {
    fd: Fd,
}

#[derive(Serialize, Deserialize, Debug)]
struct GiveFdReply {
    fd: Fd,
}

#[derive(Serialize, Deserialize, Debug)]
struct AnswerReply {
    result: i64,
}

#[derive(Serialize, Deserialize, Debug)]
struct AttachReply {
    ok: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct Nothing {}

fn pipe_fds() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn demo_declaration() -> Interface {
    Interface::builder("com.example.demo")
        .method(Method::new("Answer").output("result", VTypeExt::Plain(VType::Int)))
        .method(
            Method::new("Echo")
                .input("message", VTypeExt::Plain(VType::String))
                .output("message", VTypeExt::Plain(VType::String)),
        )
        .method(
            Method::new("Range")
                .input("count", VTypeExt::Plain(VType::Int))
                .output("value", VTypeExt::Plain(VType::Int))
                .more(),
        )
        .method(
            Method::new("Sleep")
                .input("delay", VTypeExt::Plain(VType::Float))
                .oneway(),
        )
        .method(Method::new("Open").input("fd", VTypeExt::Plain(VType::Fd)))
        .method(Method::new("GiveFd").output("fd", VTypeExt::Plain(VType::Fd)))
        .method(Method::new("Slow").output("tag", VTypeExt::Plain(VType::String)))
        .method(
            Method::new("Attach")
                .output("ok", VTypeExt::Plain(VType::Bool))
                .upgrade(),
        )
        .build()
        .expect("demo declaration builds")
}

fn demo_interface() -> VarlinkInterface {
    let mut iface = VarlinkInterface::new(demo_declaration());
    iface
        .on_call("Answer", |mut call| async move {
            call.reply(AnswerReply { result: 42 })
        })
        .unwrap();
    iface
        .on_call("Echo", |mut call| async move {
            let args: EchoArgs = call.parameters()?;
            call.reply(EchoReply {
                message: args.message,
            })
        })
        .unwrap();
    iface
        .on_stream("Range", |call| {
            let args: RangeArgs = call.parameters()?;
            Ok(IterSource((0..args.count).map(|value| RangeReply { value })))
        })
        .unwrap();
    iface
        .on_call("Sleep", |mut call| async move {
            let args: SleepArgs = call.parameters()?;
            tokio::time::sleep(Duration::from_secs_f64(args.delay)).await;
            call.reply(Nothing {})
        })
        .unwrap();
    iface
        .on_call("Open", |mut call| async move {
            let args: OpenArgs = call.parameters()?;
            let fd = call.take_fd(args.fd)?;
            let mut file = std::fs::File::from(fd);
            file.write_all(b"ping").expect("write through passed fd");
            drop(file);
            call.reply(Nothing {})
        })
        .unwrap();
    iface
        .on_call("GiveFd", |mut call| async move {
            let (pipe_r, pipe_w) = pipe_fds();
            let mut file = std::fs::File::from(pipe_w);
            file.write_all(b"from-server").expect("fill pipe");
            drop(file);
            // the reply duplicates the descriptor before pipe_r drops
            call.reply(GiveFdReply {
                fd: Fd(pipe_r.as_raw_fd()),
            })
        })
        .unwrap();
    iface
        .on_call("Slow", |mut call| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            call.reply(json!({"tag": "slow"}))
        })
        .unwrap();
    iface
        .on_call("Attach", |call| async move {
            let connection = call.upgrade(AttachReply { ok: true }).await?;
            let mut file = std::fs::File::from(connection.write_fd);
            file.write_all(b"UPGRADED").expect("raw write after upgrade");
            Ok(())
        })
        .unwrap();
    iface
}

fn start() -> (Arc<VarlinkService>, VarlinkClient, JoinHandle<Result<()>>) {
    let service = Arc::new(
        VarlinkService::new(
            "org.varlink",
            "test service",
            "0.1",
            "http://varlink.org",
            vec![demo_interface()],
        )
        .expect("service builds"),
    );
    let (server_transport, client_transport) = VarlinkTransport::pair().expect("pair");
    let server = tokio::spawn(serve_connection(Arc::clone(&service), server_transport));
    let client = VarlinkClient::new(client_transport);
    (service, client, server)
}

fn proxy(client: &VarlinkClient) -> VarlinkInterfaceProxy {
    VarlinkInterfaceProxy::new(client.clone(), Arc::new(demo_declaration()))
}

#[tokio::test]
async fn get_info_returns_service_metadata() {
    let (_service, client, _server) = start();
    let (reply, _fds) = client
        .call(Request::create("org.varlink.service.GetInfo", None), &[])
        .await
        .expect("GetInfo");
    let info: ServiceInfo = serde_json::from_value(reply.parameters.expect("parameters"))
        .expect("ServiceInfo shape");
    assert_eq!(info.vendor, "org.varlink");
    assert_eq!(info.product, "test service");
    assert_eq!(
        info.interfaces,
        vec!["org.varlink.service".to_string(), "com.example.demo".to_string()]
    );
}

#[tokio::test]
async fn streaming_replies_carry_continues_until_the_last() {
    let (_service, client, _server) = start();
    let mut stream = client
        .call_more(
            Request::create("com.example.demo.Range", Some(json!({"count": 3}))),
            &[],
        )
        .await
        .expect("issue Range");
    let mut values = Vec::new();
    let mut continues = Vec::new();
    while let Some(item) = stream.next().await {
        let (reply, _fds) = item.expect("stream reply");
        continues.push(reply.continues);
        values.push(reply.parameters.expect("parameters")["value"].clone());
    }
    assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(continues, vec![Some(true), Some(true), None]);
}

#[tokio::test]
async fn typed_streaming_through_the_proxy() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    let mut stream = proxy
        .call_more::<_, RangeReply>("Range", &RangeArgs { count: 3 })
        .await
        .expect("issue Range");
    let mut values = Vec::new();
    while let Some(item) = stream.next().await {
        let (reply, _fds) = item.expect("typed reply");
        values.push(reply.value);
    }
    assert_eq!(values, vec![0, 1, 2]);
}

#[tokio::test]
async fn range_without_more_is_an_expected_more_error() {
    let (_service, client, _server) = start();
    let err = client
        .call(
            Request::create("com.example.demo.Range", Some(json!({"count": 1}))),
            &[],
        )
        .await
        .expect_err("needs more");
    assert!(matches!(err.kind(), ErrorKind::ExpectedMore));
}

#[tokio::test]
async fn oneway_produces_no_reply() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    proxy
        .call_oneway("Sleep", &SleepArgs { delay: 0.01 })
        .await
        .expect("oneway resolves on flush");
    // if the server had written a reply for Sleep, it would be
    // misattributed to this call and the assertion below would fail
    let (reply, _fds) = proxy
        .call::<Nothing, AnswerReply>("Answer", &Nothing {})
        .await
        .expect("Answer");
    assert_eq!(reply.result, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptors_pass_to_the_server() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    let (pipe_r, pipe_w) = pipe_fds();
    let _reply: (Nothing, _) = proxy
        .call(
            "Open",
            &OpenArgs {
                fd: Fd(pipe_w.as_raw_fd()),
            },
        )
        .await
        .expect("Open");
    drop(pipe_w);
    let mut buf = Vec::new();
    let mut reader = std::fs::File::from(pipe_r);
    reader.read_to_end(&mut buf).expect("read pipe");
    assert_eq!(buf, b"ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptors_pass_from_the_server() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    let (reply, mut fds): (GiveFdReply, _) =
        proxy.call("GiveFd", &Nothing {}).await.expect("GiveFd");
    let passed = fds.take_fd(reply.fd).expect("take passed fd");
    let raw = passed.as_raw_fd();
    let mut buf = Vec::new();
    let mut reader = std::fs::File::from(passed);
    reader.read_to_end(&mut buf).expect("read passed pipe");
    assert_eq!(buf, b"from-server");
    assert!(unsafe { libc::fcntl(raw, libc::F_GETFD) } == -1);
}

#[tokio::test]
async fn unknown_targets_resolve_to_service_errors() {
    let (_service, client, _server) = start();
    let err = client
        .call(Request::create("com.example.demo.Unknown", None), &[])
        .await
        .expect_err("unknown method");
    match err.kind() {
        ErrorKind::MethodNotFound(m) => assert_eq!(m, "com.example.demo.Unknown"),
        kind => panic!("unexpected error {:?}", kind),
    }

    let err = client
        .call(Request::create("org.unknown.iface.Foo", None), &[])
        .await
        .expect_err("unknown interface");
    match err.kind() {
        ErrorKind::InterfaceNotFound(i) => assert_eq!(i, "org.unknown.iface"),
        kind => panic!("unexpected error {:?}", kind),
    }

    let err = client
        .call(
            Request::create("com.example.demo.Echo", Some(json!({"message": 5}))),
            &[],
        )
        .await
        .expect_err("bad parameter type");
    match err.kind() {
        ErrorKind::InvalidParameter(p) => assert_eq!(p, "message"),
        kind => panic!("unexpected error {:?}", kind),
    }
}

#[tokio::test]
async fn interface_descriptions_come_from_the_schema_engine() {
    let (service, client, _server) = start();
    let (reply, _fds) = client
        .call(
            Request::create(
                "org.varlink.service.GetInterfaceDescription",
                Some(json!({"interface": "com.example.demo"})),
            ),
            &[],
        )
        .await
        .expect("GetInterfaceDescription");
    let description = reply.parameters.expect("parameters")["description"]
        .as_str()
        .expect("description string")
        .to_string();
    assert_eq!(
        description,
        service.description_of("com.example.demo").expect("registered")
    );
    // the published text round-trips through the parser
    let reparsed = Interface::from_description(&description).expect("parses");
    assert_eq!(reparsed.description(), description);

    let err = client
        .call(
            Request::create(
                "org.varlink.service.GetInterfaceDescription",
                Some(json!({"interface": "org.missing"})),
            ),
            &[],
        )
        .await
        .expect_err("unknown interface");
    match err.kind() {
        ErrorKind::InvalidParameter(p) => assert_eq!(p, "interface"),
        kind => panic!("unexpected error {:?}", kind),
    }
}

#[tokio::test]
async fn replies_preserve_call_issue_order() {
    let (_service, client, _server) = start();
    let order = Arc::new(Mutex::new(Vec::new()));

    let slow_client = client.clone();
    let slow_order = Arc::clone(&order);
    let slow = tokio::spawn(async move {
        let res = slow_client
            .call(Request::create("com.example.demo.Slow", None), &[])
            .await;
        slow_order.lock().unwrap().push("slow");
        res
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast_client = client.clone();
    let fast_order = Arc::clone(&order);
    let fast = tokio::spawn(async move {
        let res = fast_client
            .call(Request::create("com.example.demo.Answer", None), &[])
            .await;
        fast_order.lock().unwrap().push("fast");
        res
    });

    slow.await.expect("join").expect("Slow succeeds");
    fast.await.expect("join").expect("Answer succeeds");
    // Answer's handler finished long before Slow's, yet its reply queued
    // behind Slow's in call-arrival order
    assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
}

#[tokio::test]
async fn calls_behind_a_stream_wait_for_its_end() {
    let (_service, client, _server) = start();
    let mut stream = client
        .call_more(
            Request::create("com.example.demo.Range", Some(json!({"count": 5}))),
            &[],
        )
        .await
        .expect("issue Range");
    let answer_client = client.clone();
    let answer = tokio::spawn(async move {
        answer_client
            .call(Request::create("com.example.demo.Answer", None), &[])
            .await
    });
    let mut count = 0;
    while let Some(item) = stream.next().await {
        item.expect("stream reply");
        count += 1;
    }
    assert_eq!(count, 5);
    let (reply, _fds) = answer.await.expect("join").expect("Answer");
    assert_eq!(reply.parameters.expect("parameters")["result"], json!(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_hands_over_the_raw_connection() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    let (reply, _fds, connection) = proxy
        .call_upgrade::<Nothing, AttachReply>("Attach", &Nothing {})
        .await
        .expect("Attach");
    assert!(reply.ok);

    // the server side now writes raw bytes, bypassing the protocol; bytes
    // that raced the reader shutdown are in read_buffer already
    let mut collected = connection.read_buffer.clone();
    let mut buf = [0u8; 8];
    while collected.len() < 8 {
        let n = unsafe {
            libc::read(
                connection.read_fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock, "{}", err);
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        assert!(n > 0, "unexpected eof on upgraded connection");
        collected.extend_from_slice(&buf[..n as usize]);
    }
    assert_eq!(&collected, b"UPGRADED");
}

#[tokio::test]
async fn protocol_violation_closes_the_connection() {
    let service = Arc::new(
        VarlinkService::new(
            "org.varlink",
            "test service",
            "0.1",
            "http://varlink.org",
            vec![demo_interface()],
        )
        .expect("service builds"),
    );

    // unterminated frame, then eof
    let (a, mut raw) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    let transport = VarlinkTransport::from_socket(a.into()).expect("transport");
    let server = tokio::spawn(serve_connection(Arc::clone(&service), transport));
    raw.write_all(b"{\"method\":\"X.Y\"").expect("write");
    drop(raw);
    let err = server.await.expect("join").expect_err("violation");
    assert!(matches!(err.kind(), ErrorKind::ProtocolViolation(_)));

    // unknown top level call fields are a violation too
    let (a, mut raw) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    let transport = VarlinkTransport::from_socket(a.into()).expect("transport");
    let server = tokio::spawn(serve_connection(Arc::clone(&service), transport));
    raw.write_all(b"{\"method\":\"com.example.demo.Answer\",\"id\":7}\0")
        .expect("write");
    let err = server.await.expect("join").expect_err("violation");
    assert!(matches!(err.kind(), ErrorKind::ProtocolViolation(_)));
}

#[tokio::test]
async fn pending_calls_fail_when_the_peer_goes_away() {
    let (a, b) = VarlinkTransport::pair().expect("pair");
    let client = VarlinkClient::new(a);
    drop(b);
    let err = client
        .call(Request::create("com.example.demo.Answer", None), &[])
        .await
        .expect_err("no peer");
    assert!(matches!(err.kind(), ErrorKind::ConnectionClosed));
}

#[tokio::test]
async fn proxy_rejects_wrong_call_modes() {
    let (_service, client, _server) = start();
    let proxy = proxy(&client);
    let err = proxy
        .call::<RangeArgs, RangeReply>("Range", &RangeArgs { count: 1 })
        .await
        .expect_err("Range is a more method");
    assert!(matches!(err.kind(), ErrorKind::CallModeMismatch));
    let err = proxy
        .call_oneway("Answer", &Nothing {})
        .await
        .expect_err("Answer is not oneway");
    assert!(matches!(err.kind(), ErrorKind::CallModeMismatch));
    let err = proxy
        .call::<Nothing, AnswerReply>("Missing", &Nothing {})
        .await
        .expect_err("undeclared method");
    assert!(matches!(err.kind(), ErrorKind::MethodNotFound(_)));
}
