//! Client side of the transport.
//!
//! A [`PipeClient`] connects to a named endpoint and exchanges raw byte
//! messages with whichever slot accepted it. Each call to
//! [`PipeClient::request`] sends one request and waits for one response.
//!
//! # Framing
//!
//! On Windows the pipe runs in message mode and every write is one message.
//! On Unix every message carries a 4-byte big-endian length prefix, so a
//! request of any size up to the maximum reaches the handler whole.
//!
//! A zero-length request cannot be told apart from a disconnect and is
//! rejected locally. A zero-length response arrives as an empty message on
//! Unix and as [`Error::ConnectionClosed`] on Windows.

// ============================================================================
// Imports
// ============================================================================

use std::io::{self, ErrorKind};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::platform::{self, ClientStream};
use crate::server::ServerOptions;

// ============================================================================
// PipeClient
// ============================================================================

/// Connection to a [`TransportServer`](crate::TransportServer) endpoint.
///
/// # Example
///
/// ```no_run
/// use pipehost::{PipeClient, ServerOptions};
///
/// # async fn example() -> pipehost::Result<()> {
/// let options = ServerOptions::new();
/// let mut client = PipeClient::connect("input-bridge", &options).await?;
///
/// let response = client.request(b"ping").await?;
/// println!("{} bytes back", response.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PipeClient {
    stream: ClientStream,
    max_message_size: usize,
    timeout: Duration,
}

impl PipeClient {
    /// Connects to the endpoint `name` using the server's options.
    ///
    /// `options` must match the server's: they determine the endpoint path,
    /// the maximum message size, and how long to wait for a free instance
    /// and for each response.
    ///
    /// On Windows a connect while every instance is busy waits for one to
    /// free up. On Unix the kernel queues the connection and this returns at
    /// once; the first request is answered when a slot frees, and
    /// [`recv`](Self::recv) times out if none does within the client timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `name` is not a valid endpoint name
    /// - [`Error::ConnectionTimeout`] if no instance becomes available in time
    /// - [`Error::Io`] if the endpoint does not exist
    pub async fn connect(name: &str, options: &ServerOptions) -> Result<Self> {
        platform::validate_name(name)?;
        let path = platform::endpoint_path(name, options);

        let stream = platform::connect(&path, options.client_timeout()).await?;
        debug!(name, path = %path.display(), "Connected to endpoint");

        Ok(Self {
            stream,
            max_message_size: options.max_message_size,
            timeout: options.client_timeout(),
        })
    }

    /// Sends `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Any error from [`send`](Self::send) or [`recv`](Self::recv).
    pub async fn request(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.send(request).await?;
        self.recv().await
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// - [`Error::MessageTooLarge`] if `payload` exceeds the maximum size
    /// - [`Error::Io`] if `payload` is empty or the write fails
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "an empty message cannot be told apart from a disconnect",
            )
            .into());
        }
        if payload.len() > self.max_message_size {
            return Err(Error::message_too_large(
                payload.len(),
                self.max_message_size,
            ));
        }

        self.stream.send_message(payload).await?;
        trace!(bytes = payload.len(), "Request sent");
        Ok(())
    }

    /// Receives one message, waiting at most the client timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing arrives in time
    /// - [`Error::ConnectionClosed`] if the server closed the connection
    /// - [`Error::Io`] if the read fails
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let message = timeout(
            self.timeout,
            self.stream.recv_message(self.max_message_size),
        )
        .await
        .map_err(|_| {
            Error::timeout(
                "waiting for response",
                u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            )
        })??;

        let Some(message) = message else {
            return Err(Error::ConnectionClosed);
        };

        trace!(bytes = message.len(), "Response received");
        Ok(message)
    }

    /// Maximum message size this client accepts and sends.
    #[inline]
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

// ============================================================================
// Tests
// ============================================================================
