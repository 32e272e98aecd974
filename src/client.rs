//! Client role: issuing calls and demultiplexing replies.
//!
//! Varlink has no call id on the wire; replies on a connection arrive in
//! the order the calls were issued. The client therefore keeps a FIFO of
//! pending reply sinks, never a keyed map. A background reader task feeds
//! arriving replies to the head of the queue and pops it on the terminal
//! reply.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::convert::OutDescriptors;
use crate::error::*;
use crate::fdarray::{dup_raw, FileDescriptorArray};
use crate::idl::{Interface, Method};
use crate::transport::{TransportReader, UpgradedConnection, VarlinkTransport};
use crate::{Reply, Request};

type ClientReply = Result<(Reply, FileDescriptorArray)>;

struct PendingCall {
    sink: mpsc::UnboundedSender<ClientReply>,
    streaming: bool,
}

#[derive(Default)]
struct PendingQueue {
    queue: VecDeque<PendingCall>,
    closed: bool,
}

struct ReaderCtl {
    stop: oneshot::Sender<()>,
    join: JoinHandle<TransportReader>,
}

struct ClientInner {
    writer: tokio::sync::Mutex<Option<crate::transport::TransportWriter>>,
    pending: Arc<Mutex<PendingQueue>>,
    reader: Mutex<Option<ReaderCtl>>,
}

/// A client-role varlink connection. Cheap to clone; calls may be issued
/// concurrently and are pipelined on the connection.
#[derive(Clone)]
pub struct VarlinkClient {
    inner: Arc<ClientInner>,
}

impl VarlinkClient {
    /// Take over a transport. Must be called within a tokio runtime.
    pub fn new(transport: VarlinkTransport) -> Self {
        let (reader, writer) = transport.split();
        let pending = Arc::new(Mutex::new(PendingQueue::default()));
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(reader_task(reader, Arc::clone(&pending), stop_rx));
        VarlinkClient {
            inner: Arc::new(ClientInner {
                writer: tokio::sync::Mutex::new(Some(writer)),
                pending,
                reader: Mutex::new(Some(ReaderCtl {
                    stop: stop_tx,
                    join,
                })),
            }),
        }
    }

    async fn issue(
        &self,
        request: &Request<'_>,
        fds: &[RawFd],
        expect: Option<bool>,
    ) -> Result<Option<mpsc::UnboundedReceiver<ClientReply>>> {
        let mut owned = Vec::with_capacity(fds.len());
        for &fd in fds {
            owned.push(dup_raw(fd).map_err(map_context!())?);
        }
        let mut writer_guard = self.inner.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| context!(ErrorKind::ConnectionClosed))?;
        let rx = match expect {
            Some(streaming) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut pending = self.inner.pending.lock().unwrap();
                if pending.closed {
                    return Err(context!(ErrorKind::ConnectionClosed));
                }
                pending.queue.push_back(PendingCall {
                    sink: tx,
                    streaming,
                });
                Some(rx)
            }
            None => None,
        };
        let sent = match writer.enqueue(request, owned) {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            // nothing went out for this call, so drop the sink registered
            // for it (it is still the newest entry, the writer lock is held)
            if rx.is_some() {
                let mut pending = self.inner.pending.lock().unwrap();
                pending.queue.pop_back();
            }
            return Err(e);
        }
        Ok(rx)
    }

    /// Issue a plain call and wait for its single reply. Returned
    /// descriptors stay owned by the array until taken.
    pub async fn call(
        &self,
        request: Request<'_>,
        fds: &[RawFd],
    ) -> Result<(Reply, FileDescriptorArray)> {
        if request.more == Some(true)
            || request.oneway == Some(true)
            || request.upgrade == Some(true)
        {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        let mut rx = self
            .issue(&request, fds, Some(false))
            .await?
            .expect("plain calls register a sink");
        finish_reply(rx.recv().await)
    }

    /// Issue a call that produces no reply. Resolves once the message
    /// reached the stream.
    pub async fn call_oneway(&self, mut request: Request<'_>, fds: &[RawFd]) -> Result<()> {
        if request.more == Some(true) || request.upgrade == Some(true) {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        request.oneway = Some(true);
        self.issue(&request, fds, None).await?;
        Ok(())
    }

    /// Issue a streaming call. The returned stream ends after the first
    /// reply without `continues: true`; an error reply is terminal
    /// regardless.
    pub async fn call_more(&self, mut request: Request<'_>, fds: &[RawFd]) -> Result<ReplyStream> {
        if request.oneway == Some(true) || request.upgrade == Some(true) {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        request.more = Some(true);
        let rx = self
            .issue(&request, fds, Some(true))
            .await?
            .expect("streaming calls register a sink");
        Ok(ReplyStream { rx, done: false })
    }

    /// Issue an upgrade call. After the first reply the connection leaves
    /// the varlink protocol and the raw endpoints are handed back.
    pub async fn call_upgrade(
        &self,
        mut request: Request<'_>,
        fds: &[RawFd],
    ) -> Result<(Reply, FileDescriptorArray, UpgradedConnection)> {
        if request.more == Some(true) || request.oneway == Some(true) {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        request.upgrade = Some(true);
        let mut rx = self
            .issue(&request, fds, Some(false))
            .await?
            .expect("upgrade calls register a sink");
        let (reply, rfds) = finish_reply(rx.recv().await)?;
        let connection = self.detach().await?;
        Ok((reply, rfds, connection))
    }

    async fn detach(&self) -> Result<UpgradedConnection> {
        let ctl = {
            let mut reader = self.inner.reader.lock().unwrap();
            reader
                .take()
                .ok_or_else(|| context!(ErrorKind::ConnectionClosed))?
        };
        let _ = ctl.stop.send(());
        let reader = ctl
            .join
            .await
            .map_err(|_| context!(ErrorKind::ConnectionClosed))?;
        let mut writer_guard = self.inner.writer.lock().await;
        let mut writer = writer_guard
            .take()
            .ok_or_else(|| context!(ErrorKind::ConnectionClosed))?;
        writer.flush().await?;
        let (read_fd, read_buffer) = reader.into_parts();
        Ok(UpgradedConnection {
            read_fd,
            write_fd: writer.into_inner(),
            read_buffer,
        })
    }

    /// Stop the reader, drain buffered writes and fail any pending calls
    /// with [`ErrorKind::ConnectionClosed`].
    pub async fn close(&self) {
        let ctl = { self.inner.reader.lock().unwrap().take() };
        if let Some(ctl) = ctl {
            let _ = ctl.stop.send(());
            let _ = ctl.join.await;
        }
        let writer = { self.inner.writer.lock().await.take() };
        if let Some(writer) = writer {
            writer.close().await;
        }
        fail_all(&self.inner.pending, ErrorKind::ConnectionClosed);
    }
}

fn finish_reply(received: Option<ClientReply>) -> Result<(Reply, FileDescriptorArray)> {
    match received {
        Some(Ok((reply, fds))) => {
            if reply.error.is_some() {
                Err(context!(ErrorKind::from(reply)))
            } else {
                Ok((reply, fds))
            }
        }
        Some(Err(e)) => Err(e),
        None => Err(context!(ErrorKind::ConnectionClosed)),
    }
}

async fn reader_task(
    mut reader: TransportReader,
    pending: Arc<Mutex<PendingQueue>>,
    mut stop: oneshot::Receiver<()>,
) -> TransportReader {
    loop {
        tokio::select! {
            _ = &mut stop => return reader,
            msg = reader.recv_message() => match msg {
                Ok(Some((obj, fds))) => {
                    if let Err(violation) = deliver(&pending, obj, fds) {
                        debug!("client protocol violation: {}", violation);
                        fail_all(&pending, ErrorKind::ProtocolViolation(violation));
                        return reader;
                    }
                }
                Ok(None) => {
                    fail_all(&pending, ErrorKind::ConnectionClosed);
                    return reader;
                }
                Err(e) => {
                    debug!("client transport error: {}", e);
                    fail_all(&pending, e.kind().clone());
                    return reader;
                }
            }
        }
    }
}

/// Hand a reply to the head of the pending-call FIFO. Returns the violation
/// message if the reply cannot be attributed.
fn deliver(
    pending: &Mutex<PendingQueue>,
    obj: Value,
    fds: FileDescriptorArray,
) -> std::result::Result<(), String> {
    let reply: Reply = serde_json::from_value(obj)
        .map_err(|err| format!("invalid reply object: {}", err))?;
    let mut q = pending.lock().unwrap();
    let Some(head) = q.queue.front() else {
        return Err("reply without a pending call".into());
    };
    let continues = reply.continues == Some(true);
    let terminal = reply.error.is_some() || !(continues && head.streaming);
    // a send error means the call handle was dropped; parse and discard
    let _ = head.sink.send(Ok((reply, fds)));
    if terminal {
        q.queue.pop_front();
    }
    Ok(())
}

fn fail_all(pending: &Mutex<PendingQueue>, kind: ErrorKind) {
    let mut q = pending.lock().unwrap();
    q.closed = true;
    while let Some(p) = q.queue.pop_front() {
        let _ = p.sink.send(Err(context!(kind.clone())));
    }
}

/// Replies of a streaming (`more`) call, in arrival order.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<ClientReply>,
    done: bool,
}

impl ReplyStream {
    /// The next reply, or `None` once a terminal reply was yielded.
    pub async fn next(&mut self) -> Option<Result<(Reply, FileDescriptorArray)>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok((reply, fds))) => {
                if reply.continues != Some(true) {
                    self.done = true;
                }
                if reply.error.is_some() {
                    self.done = true;
                    Some(Err(context!(ErrorKind::from(reply))))
                } else {
                    Some(Ok((reply, fds)))
                }
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                Some(Err(context!(ErrorKind::ConnectionClosed)))
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum CallMode {
    Plain,
    More,
    Oneway,
    Upgrade,
}

/// Typed method handles for one interface over a [`VarlinkClient`].
///
/// The proxy validates calls against the interface declaration, converts
/// parameters to their wire form (extracting referenced descriptors) and
/// converts every reply back.
pub struct VarlinkInterfaceProxy {
    client: VarlinkClient,
    interface: Arc<Interface>,
}

impl VarlinkInterfaceProxy {
    pub fn new(client: VarlinkClient, interface: Arc<Interface>) -> Self {
        VarlinkInterfaceProxy { client, interface }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    fn prepare<I: Serialize>(
        &self,
        method: &str,
        args: &I,
        mode: CallMode,
    ) -> Result<(Request<'static>, OutDescriptors)> {
        let m = self.lookup(method)?;
        let matches = match mode {
            CallMode::Plain => !m.more && !m.oneway && !m.upgrade,
            CallMode::More => m.more,
            CallMode::Oneway => m.oneway,
            CallMode::Upgrade => m.upgrade,
        };
        if !matches {
            return Err(context!(ErrorKind::CallModeMismatch));
        }
        let native = serde_json::to_value(args).map_err(map_context!())?;
        let mut out = OutDescriptors::new();
        let wire = m
            .input
            .to_wire(&native, &self.interface, &mut out)
            .map_err(map_context!())?;
        let parameters = match &wire {
            Value::Object(o) if o.is_empty() => None,
            _ => Some(wire),
        };
        let request = Request::create(
            format!("{}.{}", self.interface.name(), method),
            parameters,
        );
        Ok((request, out))
    }

    fn lookup(&self, method: &str) -> Result<&Method> {
        self.interface.method(method).ok_or_else(|| {
            context!(ErrorKind::MethodNotFound(format!(
                "{}.{}",
                self.interface.name(),
                method
            )))
        })
    }

    pub async fn call<I: Serialize, O: DeserializeOwned>(
        &self,
        method: &str,
        args: &I,
    ) -> Result<(O, FileDescriptorArray)> {
        let (request, out) = self.prepare(method, args, CallMode::Plain)?;
        let (reply, fds) = self.client.call(request, out.as_raw()).await?;
        let m = self.lookup(method)?;
        let decoded = decode_reply(&self.interface, m, &reply, &fds)?;
        Ok((decoded, fds))
    }

    pub async fn call_oneway<I: Serialize>(&self, method: &str, args: &I) -> Result<()> {
        let (request, out) = self.prepare(method, args, CallMode::Oneway)?;
        self.client.call_oneway(request, out.as_raw()).await
    }

    pub async fn call_more<I: Serialize, O: DeserializeOwned>(
        &self,
        method: &str,
        args: &I,
    ) -> Result<TypedReplyStream<O>> {
        let (request, out) = self.prepare(method, args, CallMode::More)?;
        let stream = self.client.call_more(request, out.as_raw()).await?;
        Ok(TypedReplyStream {
            stream,
            interface: Arc::clone(&self.interface),
            method: method.to_string(),
            _reply: PhantomData,
        })
    }

    pub async fn call_upgrade<I: Serialize, O: DeserializeOwned>(
        &self,
        method: &str,
        args: &I,
    ) -> Result<(O, FileDescriptorArray, UpgradedConnection)> {
        let (request, out) = self.prepare(method, args, CallMode::Upgrade)?;
        let (reply, fds, connection) = self.client.call_upgrade(request, out.as_raw()).await?;
        let m = self.lookup(method)?;
        let decoded = decode_reply(&self.interface, m, &reply, &fds)?;
        Ok((decoded, fds, connection))
    }
}

fn decode_reply<O: DeserializeOwned>(
    interface: &Interface,
    method: &Method,
    reply: &Reply,
    fds: &FileDescriptorArray,
) -> Result<O> {
    let params = reply
        .parameters
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let native = method
        .output
        .from_wire(&params, interface, Some(fds))
        .map_err(map_context!())?;
    serde_json::from_value(native).map_err(map_context!())
}

/// Typed replies of a streaming proxy call.
pub struct TypedReplyStream<O> {
    stream: ReplyStream,
    interface: Arc<Interface>,
    method: String,
    _reply: PhantomData<O>,
}

impl<O: DeserializeOwned> TypedReplyStream<O> {
    pub async fn next(&mut self) -> Option<Result<(O, FileDescriptorArray)>> {
        let item = self.stream.next().await?;
        Some(item.and_then(|(reply, fds)| {
            let m = self.interface.method(&self.method).ok_or_else(|| {
                context!(ErrorKind::MethodNotFound(format!(
                    "{}.{}",
                    self.interface.name(),
                    self.method
                )))
            })?;
            let decoded = decode_reply(&self.interface, m, &reply, &fds)?;
            Ok((decoded, fds))
        }))
    }
}
