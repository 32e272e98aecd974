//! Connection helpers: unix socket clients and listeners, systemd socket
//! activation.

use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, process};

use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

use crate::error::*;
use crate::service::{serve_connection, VarlinkService};
use crate::transport::VarlinkTransport;

/// Connect to the unix socket at `path` and return a varlink transport for
/// it.
pub async fn connect_unix<P: AsRef<Path>>(path: P) -> Result<VarlinkTransport> {
    let stream = UnixStream::connect(path.as_ref())
        .await
        .map_err(map_context!())?;
    let stream = stream.into_std().map_err(map_context!())?;
    VarlinkTransport::from_socket(stream.into())
}

/// Configuration for [`listen_unix`].
pub struct ListenConfig {
    /// Return with [`ErrorKind::Timeout`] after this long without a new
    /// connection. Zero (the default) disables the timeout.
    pub idle_timeout: Duration,

    /// When set to `true`, the listener shuts down gracefully.
    pub stop_listening: Option<Arc<AtomicBool>>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            idle_timeout: Duration::ZERO,
            stop_listening: None,
        }
    }
}

/// Listen on a unix socket and serve every connection with `service`. A
/// stale socket file at `path` is removed before binding.
pub async fn listen_unix<P: AsRef<Path>>(
    service: Arc<VarlinkService>,
    path: P,
    config: &ListenConfig,
) -> Result<()> {
    let path = path.as_ref();
    let _ = fs::remove_file(path);
    let listener = UnixListener::bind(path).map_err(map_context!())?;
    listen_on(service, listener, config).await
}

/// Serve connections accepted from an already bound listener, e.g. one
/// obtained through [`get_listen_fd`].
pub async fn listen_on(
    service: Arc<VarlinkService>,
    listener: UnixListener,
    config: &ListenConfig,
) -> Result<()> {
    loop {
        let stream = if config.idle_timeout > Duration::ZERO || config.stop_listening.is_some() {
            let timeout = if config.stop_listening.is_some() {
                Duration::from_millis(100)
            } else {
                config.idle_timeout
            };
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => return Err(e).map_err(map_context!()),
                Err(_) => {
                    if let Some(stop) = &config.stop_listening {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                    }
                    if config.idle_timeout > Duration::ZERO {
                        return Err(context!(ErrorKind::Timeout));
                    }
                    continue;
                }
            }
        } else {
            let (stream, _addr) = listener.accept().await.map_err(map_context!())?;
            stream
        };
        let stream = stream.into_std().map_err(map_context!())?;
        let transport = VarlinkTransport::from_socket(stream.into())?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(service, transport).await {
                match e.kind() {
                    ErrorKind::ConnectionClosed => {}
                    _ => warn!("connection error: {}", e),
                }
            }
        });
    }
}

/// Obtain a listening socket passed via the systemd socket activation
/// protocol (`LISTEN_FDS`, `LISTEN_PID`, `LISTEN_FDNAMES`).
pub fn get_listen_fd(name: &str) -> Option<OwnedFd> {
    let pid: u32 = env::var("LISTEN_PID").ok()?.parse().ok()?;
    let nfds: usize = env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if nfds < 1 || pid != process::id() {
        return None;
    }
    if nfds == 1 {
        if let Ok(fdname) = env::var("LISTEN_FDNAMES") {
            if fdname != name {
                return None;
            }
        }
        return Some(unsafe { OwnedFd::from_raw_fd(3) });
    }
    let names = env::var("LISTEN_FDNAMES").ok()?;
    let names: Vec<&str> = names.split(':').collect();
    if names.len() != nfds {
        return None;
    }
    let index = names.iter().position(|&n| n == name)?;
    Some(unsafe { OwnedFd::from_raw_fd(3 + index as RawFd) })
}

/// Turn an activation fd into a tokio listener.
pub fn listener_from_fd(fd: OwnedFd) -> Result<UnixListener> {
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd.into_raw_fd()) };
    std_listener.set_nonblocking(true).map_err(map_context!())?;
    UnixListener::from_std(std_listener).map_err(map_context!())
}
