//! Framed message transport over a pair of file descriptors.
//!
//! A [`VarlinkTransport`] owns a read fd and a write fd, moves whole
//! messages (a JSON object terminated by a single `\0` byte) between byte
//! streams and in-memory queues, and carries file descriptors as `SCM_RIGHTS`
//! ancillary data on socket endpoints. On non-socket endpoints (pipes,
//! stdio) it degrades transparently: sending descriptors fails with
//! [`ErrorKind::DescriptorsUnsupported`] while plain messages keep working.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, warn};

use crate::error::*;
use crate::fdarray::{dup_raw, FileDescriptorArray};

/// The maximum number of file descriptors accepted with a single message
/// (the kernel's `SCM_MAX_FD`).
pub const MAX_MESSAGE_FDS: usize = 253;

/// Queued outgoing bytes above which producers should pause.
pub const HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A connection after the upgrade handshake: the raw nonblocking endpoints
/// and whatever bytes were already buffered on the read side.
#[derive(Debug)]
pub struct UpgradedConnection {
    pub read_fd: OwnedFd,
    pub write_fd: OwnedFd,
    pub read_buffer: Vec<u8>,
}

/// A message framed transport over two file descriptors.
pub struct VarlinkTransport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl VarlinkTransport {
    /// Build a transport from a read fd and a write fd (which may refer to
    /// the same open file description). `socket_endpoints` declares whether
    /// the endpoints can carry ancillary data.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(recvfd: OwnedFd, sendfd: OwnedFd, socket_endpoints: bool) -> Result<Self> {
        set_nonblocking(recvfd.as_raw_fd()).map_err(map_context!())?;
        set_nonblocking(sendfd.as_raw_fd()).map_err(map_context!())?;
        Ok(VarlinkTransport {
            reader: TransportReader {
                fd: AsyncFd::with_interest(recvfd, Interest::READABLE).map_err(map_context!())?,
                buf: Vec::new(),
                pending_fds: Vec::new(),
                socket_endpoints,
                eof: false,
            },
            writer: TransportWriter {
                fd: AsyncFd::with_interest(sendfd, Interest::WRITABLE).map_err(map_context!())?,
                queue: VecDeque::new(),
                backlog: 0,
                socket_endpoints,
                closing: false,
            },
        })
    }

    /// Build a transport reading and writing the same stream socket.
    pub fn from_socket(fd: OwnedFd) -> Result<Self> {
        let sendfd = dup_raw(fd.as_raw_fd()).map_err(map_context!())?;
        Self::new(fd, sendfd, true)
    }

    /// A connected pair of socket transports, mostly useful in tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(io::Error::from)
        .map_err(map_context!())?;
        Ok((Self::from_socket(a)?, Self::from_socket(b)?))
    }

    /// Whether messages on this transport may carry file descriptors.
    pub fn supports_descriptors(&self) -> bool {
        self.writer.socket_endpoints
    }

    pub fn is_closing(&self) -> bool {
        self.writer.closing
    }

    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }

    /// Receive the next whole message. `Ok(None)` signals a clean peer
    /// shutdown.
    pub async fn recv_message(&mut self) -> Result<Option<(Value, FileDescriptorArray)>> {
        self.reader.recv_message().await
    }

    /// Serialize `msg` and queue it for transmission together with the given
    /// descriptors. Use [`VarlinkTransport::flush`] to drive the actual
    /// writes.
    pub fn enqueue<T: Serialize>(&mut self, msg: &T, fds: Vec<OwnedFd>) -> Result<()> {
        self.writer.enqueue(msg, fds)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Send a single message and wait until it reached the stream.
    pub async fn send_message<T: Serialize>(&mut self, msg: &T, fds: Vec<OwnedFd>) -> Result<()> {
        self.writer.enqueue(msg, fds)?;
        self.writer.flush().await
    }

    /// Drain buffered outgoing bytes (bounded) and close both endpoints.
    pub async fn close(self) {
        let VarlinkTransport { reader, writer } = self;
        drop(reader);
        writer.close().await;
    }
}

/// The receiving half of a [`VarlinkTransport`].
pub struct TransportReader {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
    pending_fds: Vec<OwnedFd>,
    socket_endpoints: bool,
    eof: bool,
}

impl TransportReader {
    /// Receive the next whole message together with the descriptors that
    /// arrived for it. Descriptor batches are attributed to the message
    /// under construction at the moment of receipt, or to the next message
    /// to start.
    pub async fn recv_message(&mut self) -> Result<Option<(Value, FileDescriptorArray)>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == 0) {
                let frame: Vec<u8> = self.buf.drain(..=pos).collect();
                let frame = &frame[..frame.len() - 1];
                let fds = FileDescriptorArray::from_fds(std::mem::take(&mut self.pending_fds));
                let obj: Value = serde_json::from_slice(frame).map_err(|err| {
                    context!(ErrorKind::ProtocolViolation(format!(
                        "invalid message '{}': {}",
                        String::from_utf8_lossy(frame),
                        err
                    )))
                })?;
                if !obj.is_object() {
                    return Err(context!(ErrorKind::ProtocolViolation(
                        "message is not a JSON object".into()
                    )));
                }
                return Ok(Some((obj, fds)));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(context!(ErrorKind::ProtocolViolation(
                    "connection closed inside an unterminated message".into()
                )));
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        loop {
            let mut guard = self.fd.readable().await.map_err(map_context!())?;
            let res = if self.socket_endpoints {
                guard.try_io(|inner| {
                    recv_chunk_socket(
                        inner.get_ref().as_raw_fd(),
                        &mut self.buf,
                        &mut self.pending_fds,
                    )
                })
            } else {
                guard.try_io(|inner| recv_chunk_fd(inner.get_ref().as_raw_fd(), &mut self.buf))
            };
            match res {
                Ok(Ok(0)) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => {
                    debug!("reading from transport failed: {}", err);
                    return Err(err).map_err(map_context!());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Dismantle the reader for an upgraded connection. Buffered descriptors
    /// are closed; buffered bytes travel with the fd.
    pub fn into_parts(self) -> (OwnedFd, Vec<u8>) {
        (self.fd.into_inner(), self.buf)
    }
}

fn recv_chunk_socket(
    fd: RawFd,
    buf: &mut Vec<u8>,
    pending: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_MESSAGE_FDS]);
    let mut iov = [io::IoSliceMut::new(&mut chunk)];
    let msg = recvmsg::<UnixAddr>(
        fd,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;
    let mut received: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received.extend(
                fds.into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }
    let n = msg.bytes;
    if n == 0 {
        // descriptors arriving with the EOF report are dropped closed
        return Ok(0);
    }
    pending.extend(received);
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn recv_chunk_fd(fd: RawFd, buf: &mut Vec<u8>) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = n as usize;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

struct OutFrame {
    data: Vec<u8>,
    offset: usize,
    fds: Vec<OwnedFd>,
}

/// The sending half of a [`VarlinkTransport`].
pub struct TransportWriter {
    fd: AsyncFd<OwnedFd>,
    queue: VecDeque<OutFrame>,
    backlog: usize,
    socket_endpoints: bool,
    closing: bool,
}

impl TransportWriter {
    /// Serialize `msg` to its minimal JSON form, append the `\0` frame
    /// terminator and queue it. The descriptors are owned by the queue and
    /// closed after transmission; they accompany the first byte of the
    /// frame as ancillary data.
    pub fn enqueue<T: Serialize>(&mut self, msg: &T, fds: Vec<OwnedFd>) -> Result<()> {
        if self.closing {
            warn!("attempt to write to a closed transport");
            return Err(context!(ErrorKind::ConnectionClosed));
        }
        if !fds.is_empty() && !self.socket_endpoints {
            return Err(context!(ErrorKind::DescriptorsUnsupported));
        }
        if fds.len() > MAX_MESSAGE_FDS {
            return Err(context!(ErrorKind::DescriptorsUnsupported));
        }
        let mut data = serde_json::to_vec(msg).map_err(map_context!())?;
        data.push(0);
        self.backlog += data.len();
        self.queue.push_back(OutFrame {
            data,
            offset: 0,
            fds,
        });
        Ok(())
    }

    /// Bytes queued but not yet written.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn supports_descriptors(&self) -> bool {
        self.socket_endpoints
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Write queued frames until the queue is empty.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.queue.is_empty() {
            let wrote = {
                let socket = self.socket_endpoints;
                let frame = self.queue.front_mut().unwrap();
                loop {
                    let mut guard = self.fd.writable().await.map_err(map_context!())?;
                    match guard.try_io(|inner| {
                        write_frame(inner.get_ref().as_raw_fd(), frame, socket)
                    }) {
                        Ok(Ok(n)) => break n,
                        Ok(Err(err)) => {
                            debug!("writing to transport failed: {}", err);
                            self.closing = true;
                            self.queue.clear();
                            self.backlog = 0;
                            return Err(err).map_err(map_context!());
                        }
                        Err(_would_block) => continue,
                    }
                }
            };
            self.backlog -= wrote;
            let frame = self.queue.front_mut().unwrap();
            frame.offset += wrote;
            if wrote > 0 {
                // the descriptors travelled with the first accepted byte
                frame.fds.clear();
            }
            if frame.offset == frame.data.len() {
                self.queue.pop_front();
            }
        }
        Ok(())
    }

    /// Drain queued frames (bounded by a timeout) and close the endpoint.
    pub async fn close(mut self) {
        self.closing = true;
        if !self.queue.is_empty()
            && tokio::time::timeout(DRAIN_TIMEOUT, self.flush())
                .await
                .is_err()
        {
            debug!("shutdown drain incomplete, discarding buffered messages");
        }
    }

    /// Dismantle the writer for an upgraded connection. The queue must have
    /// been flushed.
    pub fn into_inner(self) -> OwnedFd {
        self.fd.into_inner()
    }
}

fn write_frame(fd: RawFd, frame: &OutFrame, socket: bool) -> io::Result<usize> {
    let data = &frame.data[frame.offset..];
    if socket {
        let iov = [io::IoSlice::new(data)];
        let raw: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();
        let cmsgs = if raw.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&raw)]
        };
        sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
            .map_err(io::Error::from)
    } else {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}
