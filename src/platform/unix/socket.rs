//! Unix domain socket endpoints.
//!
//! One listening socket is bound per server and shared by every slot
//! instance; each instance holds at most one accepted stream. The socket
//! file is removed when the last instance is dropped.
//!
//! Messages travel as length-prefixed frames (see [`super::frame`]). The
//! kernel queues connections beyond the N accepted ones in the listen
//! backlog, so an extra client connects at once and is served when a slot
//! frees.

// ============================================================================
// Imports
// ============================================================================

use std::fs::{self, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::task::noop_waker_ref;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::server::ServerOptions;
use crate::transport::endpoint::{Endpoint, Submission};

use super::frame::{self, FrameReader, FrameWriter};

// ============================================================================
// Constants
// ============================================================================

/// Delay between connection attempts while the server is not yet listening.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Highest permission bits accepted for the socket file.
const MAX_SOCKET_MODE: u32 = 0o777;

// ============================================================================
// Types
// ============================================================================

/// Slot endpoint instance on Unix.
pub(crate) type PlatformEndpoint = SocketInstance;

// ============================================================================
// AccessDescriptor
// ============================================================================

/// File mode applied to the socket after binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccessDescriptor {
    mode: u32,
}

impl AccessDescriptor {
    /// Builds the descriptor from the server options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessControl`] if `socket_mode` has bits outside
    /// `0o777`.
    pub(crate) fn create(options: &ServerOptions) -> Result<Self> {
        if options.socket_mode > MAX_SOCKET_MODE {
            return Err(Error::access_control(format!(
                "socket mode {:#o} is not a permission mask",
                options.socket_mode
            )));
        }
        Ok(Self {
            mode: options.socket_mode,
        })
    }

    fn apply(&self, path: &Path) -> Result<()> {
        fs::set_permissions(path, Permissions::from_mode(self.mode)).map_err(|e| {
            Error::access_control(format!(
                "cannot set mode {:#o} on {}: {e}",
                self.mode,
                path.display()
            ))
        })
    }
}

// ============================================================================
// SharedListener
// ============================================================================

/// Listening socket plus the file it is bound to.
#[derive(Debug)]
struct SharedListener {
    listener: UnixListener,
    path: PathBuf,
}

impl Drop for SharedListener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Socket file already gone");
        }
    }
}

// ============================================================================
// SocketInstance
// ============================================================================

/// One slot's view of the shared listener.
#[derive(Debug)]
pub(crate) struct SocketInstance {
    listener: Rc<SharedListener>,
    stream: Option<UnixStream>,
    reader: FrameReader,
    writer: FrameWriter,
}

impl SocketInstance {
    fn new(listener: Rc<SharedListener>) -> Self {
        Self {
            listener,
            stream: None,
            reader: FrameReader::default(),
            writer: FrameWriter::default(),
        }
    }
}

fn not_connected() -> io::Error {
    ErrorKind::NotConnected.into()
}

#[async_trait(?Send)]
impl Endpoint for SocketInstance {
    type Client = UnixStream;

    fn submit_accept(&mut self) -> io::Result<Submission> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.listener.listener.poll_accept(&mut cx) {
            Poll::Ready(Ok((stream, _))) => {
                self.stream = Some(stream);
                Ok(Submission::Connected)
            }
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(Submission::Pending),
        }
    }

    async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.listener.accept().await?;
        Ok(stream)
    }

    fn attach(&mut self, client: UnixStream) {
        self.stream = Some(client);
    }

    async fn ready(&self, interest: Interest) -> io::Result<()> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        stream.ready(interest).await?;
        Ok(())
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        self.reader.try_read(stream, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        self.writer.try_write(stream, buf)
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.reader.clear();
        self.writer.clear();
    }
}

// ============================================================================
// Endpoint Creation
// ============================================================================

/// Binds `path` and hands out `options.instances` slot instances.
///
/// Must be called inside a tokio runtime.
///
/// # Errors
///
/// - [`Error::Endpoint`] if the path is served by a live server or cannot
///   be bound
/// - [`Error::AccessControl`] if the socket mode cannot be applied
pub(crate) fn create_endpoints(
    path: &Path,
    options: &ServerOptions,
    access: &mut AccessDescriptor,
) -> Result<Vec<SocketInstance>> {
    let listener = Rc::new(SharedListener {
        listener: bind(path)?,
        path: path.to_path_buf(),
    });
    access.apply(path)?;

    Ok((0..options.instances)
        .map(|_| SocketInstance::new(Rc::clone(&listener)))
        .collect())
}

/// Binds the listener, replacing a stale socket file once.
///
/// Only a socket nobody listens on is replaced; any other file at `path`
/// is left alone.
fn bind(path: &Path) -> Result<UnixListener> {
    let endpoint_error = |e| Error::endpoint(path.display().to_string(), e);

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            let is_socket = fs::symlink_metadata(path)
                .map_err(endpoint_error)?
                .file_type()
                .is_socket();
            if !is_socket || std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(endpoint_error(e));
            }
            warn!(path = %path.display(), "Removing stale socket file");
            fs::remove_file(path).map_err(endpoint_error)?;
            UnixListener::bind(path).map_err(endpoint_error)
        }
        Err(e) => Err(endpoint_error(e)),
    }
}

// ============================================================================
// ClientStream
// ============================================================================

/// Client side of a Unix endpoint.
#[derive(Debug)]
pub(crate) struct ClientStream {
    stream: UnixStream,
}

impl ClientStream {
    /// Sends `payload` as one message.
    pub(crate) async fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        frame::write_frame(&mut self.stream, payload).await
    }

    /// Receives one message of at most `max` bytes, or `None` once the
    /// server has closed the connection.
    pub(crate) async fn recv_message(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        frame::read_frame(&mut self.stream, max).await
    }
}

// ============================================================================
// Client Connect
// ============================================================================

/// Connects to the socket at `path`, retrying while it refuses connections.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if the socket keeps refusing past `timeout`
/// - [`Error::Io`] if the socket does not exist or on any other failure
pub(crate) async fn connect(path: &Path, timeout: Duration) -> Result<ClientStream> {
    let deadline = Instant::now() + timeout;

    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(ClientStream { stream }),
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(Error::connection_timeout(timeout.as_millis() as u64));
                }
                sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options(instances: usize) -> ServerOptions {
        ServerOptions::new().with_instances(instances)
    }

    #[tokio::test]
    async fn test_create_endpoints_shares_one_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shared.sock");
        let mut access = AccessDescriptor::create(&options(3)).expect("access");

        let endpoints = create_endpoints(&path, &options(3), &mut access).expect("bind");
        assert_eq!(endpoints.len(), 3);
        assert!(path.exists());

        drop(endpoints);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_socket_mode_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mode.sock");
        let opts = options(1).with_socket_mode(0o600);
        let mut access = AccessDescriptor::create(&opts).expect("access");

        let _endpoints = create_endpoints(&path, &opts, &mut access).expect("bind");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_access_descriptor_rejects_non_permission_bits() {
        let opts = options(1).with_socket_mode(0o4777);
        let result = AccessDescriptor::create(&opts);
        assert!(matches!(result, Err(Error::AccessControl { .. })));
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).expect("std bind"));
        assert!(path.exists());

        let mut access = AccessDescriptor::create(&options(1)).expect("access");
        let endpoints = create_endpoints(&path, &options(1), &mut access);
        assert!(endpoints.is_ok());
    }

    #[tokio::test]
    async fn test_regular_file_is_not_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.sock");
        fs::write(&path, "user data").expect("write file");

        let mut access = AccessDescriptor::create(&options(1)).expect("access");
        let result = create_endpoints(&path, &options(1), &mut access);

        assert!(matches!(result, Err(Error::Endpoint { .. })));
        assert_eq!(fs::read_to_string(&path).expect("read file"), "user data");
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("live.sock");
        let mut access = AccessDescriptor::create(&options(1)).expect("access");

        let _first = create_endpoints(&path, &options(1), &mut access).expect("first bind");
        let second = create_endpoints(&path, &options(1), &mut access);
        assert!(matches!(second, Err(Error::Endpoint { .. })));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_submit_accept_reports_waiting_client() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("waiting.sock");
        let mut access = AccessDescriptor::create(&options(1)).expect("access");
        let mut endpoints = create_endpoints(&path, &options(1), &mut access).expect("bind");
        let instance = &mut endpoints[0];

        assert_eq!(instance.submit_accept().expect("submit"), Submission::Pending);

        let mut client = connect(&path, Duration::from_secs(1)).await.expect("connect");
        // The listener's readiness is delivered by the runtime driver.
        tokio::task::yield_now().await;
        let mut submission = instance.submit_accept().expect("submit");
        if submission == Submission::Pending {
            let stream = instance.accept().await.expect("accept");
            instance.attach(stream);
            submission = Submission::Connected;
        }
        assert_eq!(submission, Submission::Connected);

        client.send_message(b"ping").await.expect("write");
        instance.ready(Interest::READABLE).await.expect("ready");
        let mut buf = [0u8; 16];
        let n = instance.try_read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");

        assert_eq!(instance.try_write(b"pong").expect("write back"), 4);
        let reply = client.recv_message(16).await.expect("read reply");
        assert_eq!(reply.as_deref(), Some(&b"pong"[..]));

        instance.disconnect();
        assert_eq!(client.recv_message(16).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn test_io_without_client_is_not_connected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("idle.sock");
        let mut access = AccessDescriptor::create(&options(1)).expect("access");
        let mut endpoints = create_endpoints(&path, &options(1), &mut access).expect("bind");

        let err = endpoints[0].try_read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_missing_socket_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.sock");

        let started = std::time::Instant::now();
        let result = connect(&path, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_refused_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("refused.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).expect("std bind"));

        let result = connect(&path, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ConnectionTimeout { timeout_ms: 50 })));
    }
}
