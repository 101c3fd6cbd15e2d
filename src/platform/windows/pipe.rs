//! Message-mode named pipe endpoints.
//!
//! Every slot owns its own server instance of the same pipe name; the OS
//! hands each connecting client to one free instance.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::task::noop_waker_ref;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, PipeMode, ServerOptions as PipeOptions,
};
use tokio::time::{Instant, sleep};
use tracing::debug;
use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

use crate::error::{Error, Result};
use crate::server::ServerOptions;
use crate::transport::endpoint::{Endpoint, Submission};

use super::security::AccessDescriptor;

// ============================================================================
// Constants
// ============================================================================

/// Delay between attempts while every instance is busy.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Largest message the runtime's pipe reader returns in one read.
pub(crate) const MAX_MESSAGE_SIZE: usize = 4096;

// ============================================================================
// Types
// ============================================================================

/// Slot endpoint instance on Windows.
pub(crate) type PlatformEndpoint = PipeInstance;

// ============================================================================
// PipeInstance
// ============================================================================

/// One server instance of the named pipe.
#[derive(Debug)]
pub(crate) struct PipeInstance {
    server: NamedPipeServer,
}

#[async_trait(?Send)]
impl Endpoint for PipeInstance {
    type Client = ();

    fn submit_accept(&mut self) -> io::Result<Submission> {
        let mut cx = Context::from_waker(noop_waker_ref());
        let connect = pin!(self.server.connect());
        match connect.poll(&mut cx) {
            Poll::Ready(Ok(())) => Ok(Submission::Connected),
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(Submission::Pending),
        }
    }

    async fn accept(&self) -> io::Result<()> {
        self.server.connect().await
    }

    fn attach(&mut self, _client: ()) {}

    async fn ready(&self, interest: Interest) -> io::Result<()> {
        self.server.ready(interest).await?;
        Ok(())
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.server.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.server.try_write(buf)
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.server.disconnect() {
            debug!(error = %e, "Pipe disconnect failed");
        }
    }
}

// ============================================================================
// Endpoint Creation
// ============================================================================

/// Creates `options.instances` instances of the pipe at `path`.
///
/// The first instance is created with `first_pipe_instance`, so a name
/// already served by another process is rejected.
///
/// # Errors
///
/// - [`Error::Config`] if the message size does not fit a pipe buffer
/// - [`Error::Endpoint`] if any instance cannot be created
pub(crate) fn create_endpoints(
    path: &Path,
    options: &ServerOptions,
    access: &mut AccessDescriptor,
) -> Result<Vec<PipeInstance>> {
    let buffer_size = u32::try_from(options.max_message_size)
        .map_err(|_| Error::config("maxMessageSize exceeds the pipe buffer limit"))?;

    (0..options.instances)
        .map(|index| {
            let mut pipe_options = PipeOptions::new();
            pipe_options
                .first_pipe_instance(index == 0)
                .max_instances(options.instances)
                .pipe_mode(PipeMode::Message)
                .in_buffer_size(buffer_size)
                .out_buffer_size(buffer_size);

            // SAFETY: the attributes and the descriptor they reference are
            // owned by `access`, which outlives this call.
            let server = unsafe {
                pipe_options.create_with_security_attributes_raw(path, access.attributes().cast())
            }
            .map_err(|e| Error::endpoint(path.display().to_string(), e))?;

            Ok(PipeInstance { server })
        })
        .collect()
}

// ============================================================================
// ClientStream
// ============================================================================

/// Client side of a Windows endpoint.
#[derive(Debug)]
pub(crate) struct ClientStream {
    pipe: NamedPipeClient,
}

impl ClientStream {
    /// Sends `payload` as one pipe message.
    pub(crate) async fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.pipe.write_all(payload).await
    }

    /// Receives one pipe message of at most `max` bytes.
    ///
    /// Returns `None` on a zero-byte read, which is how both a closed pipe
    /// and an empty message surface.
    pub(crate) async fn recv_message(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0; max];
        let n = self.pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

// ============================================================================
// Client Connect
// ============================================================================

/// Opens the pipe at `path`, retrying while every instance is busy.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if no instance frees up within `timeout`
/// - [`Error::Io`] if the pipe does not exist or on any other failure
pub(crate) async fn connect(path: &Path, timeout: Duration) -> Result<ClientStream> {
    let deadline = Instant::now() + timeout;

    loop {
        match ClientOptions::new().pipe_mode(PipeMode::Message).open(path) {
            Ok(pipe) => return Ok(ClientStream { pipe }),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                if Instant::now() >= deadline {
                    return Err(Error::connection_timeout(timeout.as_millis() as u64));
                }
                sleep(BUSY_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
