//! Connection slot state machine.
//!
//! A slot owns one endpoint instance plus fixed-capacity request and
//! response buffers, and cycles for the life of the server:
//!
//! ```text
//!            accept completes              read > 0 bytes
//! Connecting ────────────────► Reading ─────────────────► Writing
//!     ▲                          │  ▲                        │
//!     │ read 0 / error           │  └────────────────────────┘
//!     └──────────────────────────┘        write completes
//!     ▲                                                       │
//!     └───────────────────────────────────────────────────────┘
//!                   short write / error
//! ```
//!
//! Every entry into `Reading` or `Writing` first tries the transfer without
//! blocking. If it finishes, the slot advances and stays signaled so the
//! reactor services it again on its next wake; if the endpoint reports
//! `WouldBlock`, the slot is marked pending and waits for readiness.
//! Disconnects re-arm the same endpoint instance for a new client.

// ============================================================================
// Imports
// ============================================================================

use std::io::{self, ErrorKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::io::Interest;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::endpoint::{Endpoint, Submission};
use super::stats::Counters;

// ============================================================================
// Types
// ============================================================================

/// Request handler callback type.
///
/// Called on the server's execution context with the request bytes and a
/// response buffer sized to the maximum message size. Returns the number of
/// response bytes written. Every other slot waits while it runs.
pub type RequestHandler = Arc<dyn Fn(&[u8], &mut [u8]) -> usize + Send + Sync>;

/// Lifecycle state of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Waiting for a client to connect.
    Connecting,
    /// Waiting for a request from the connected client.
    Reading,
    /// Sending the handler's response.
    Writing,
}

/// What woke a slot.
pub(crate) enum Signal<C> {
    /// The pending operation can make progress, or nothing was pending.
    Ready,
    /// A deferred accept completed.
    Accepted(C),
    /// The pending operation failed.
    Failed(io::Error),
}

/// Result of completing a pending operation.
enum Progress {
    Advanced,
    StillPending,
    Rearmed,
}

// ============================================================================
// Slot
// ============================================================================

/// One duplex channel of the server's fixed pool.
pub(crate) struct Slot<E: Endpoint> {
    index: usize,
    state: SlotState,
    pending_io: bool,
    request: Box<[u8]>,
    request_len: usize,
    response: Box<[u8]>,
    response_len: usize,
    endpoint: E,
    counters: Arc<Counters>,
}

impl<E: Endpoint> Slot<E> {
    /// Creates an unarmed slot around `endpoint`.
    pub(crate) fn new(
        index: usize,
        endpoint: E,
        max_message_size: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            index,
            state: SlotState::Connecting,
            pending_io: false,
            request: vec![0; max_message_size].into_boxed_slice(),
            request_len: 0,
            response: vec![0; max_message_size].into_boxed_slice(),
            response_len: 0,
            endpoint,
            counters,
        }
    }

    /// Submits the initial accept.
    pub(crate) fn arm(&mut self) -> Result<()> {
        self.connect_to_new_client()
    }

    #[inline]
    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending_io
    }

    /// Completion signal of this slot.
    ///
    /// Resolves immediately when no operation is pending.
    pub(crate) async fn wait(&self) -> Signal<E::Client> {
        if !self.pending_io {
            return Signal::Ready;
        }

        let outcome = match self.state {
            SlotState::Connecting => {
                return match self.endpoint.accept().await {
                    Ok(client) => Signal::Accepted(client),
                    Err(e) => Signal::Failed(e),
                };
            }
            SlotState::Reading => self.endpoint.ready(Interest::READABLE).await,
            SlotState::Writing => self.endpoint.ready(Interest::WRITABLE).await,
        };

        match outcome {
            Ok(()) => Signal::Ready,
            Err(e) => Signal::Failed(e),
        }
    }

    /// Advances the slot after its signal fired.
    ///
    /// Returns an error only for conditions that end the whole server.
    pub(crate) fn advance(&mut self, signal: Signal<E::Client>, handler: &RequestHandler) -> Result<()> {
        if self.pending_io {
            match self.complete(signal)? {
                Progress::Advanced => {}
                Progress::StillPending | Progress::Rearmed => return Ok(()),
            }
        }

        match self.state {
            SlotState::Reading => self.begin_read(),
            SlotState::Writing => self.begin_write(handler),
            SlotState::Connecting => Ok(()),
        }
    }

    /// Finishes the operation that was pending when the signal fired.
    fn complete(&mut self, signal: Signal<E::Client>) -> Result<Progress> {
        match (self.state, signal) {
            (SlotState::Connecting, Signal::Accepted(client)) => {
                self.endpoint.attach(client);
                self.counters.connection();
                debug!(slot = self.index, "Client connected");
                self.state = SlotState::Reading;
                Ok(Progress::Advanced)
            }

            (SlotState::Connecting, Signal::Failed(e)) => Err(Error::accept(self.index, e)),

            (SlotState::Connecting, Signal::Ready) | (_, Signal::Accepted(_)) => {
                Err(Error::protocol(format!(
                    "slot {} signaled a completion that does not match state {:?}",
                    self.index, self.state
                )))
            }

            (SlotState::Reading, Signal::Ready) => match self.endpoint.try_read(&mut self.request) {
                Ok(0) => {
                    self.disconnect_and_reconnect("client closed")?;
                    Ok(Progress::Rearmed)
                }
                Ok(n) => {
                    self.request_len = n;
                    self.state = SlotState::Writing;
                    Ok(Progress::Advanced)
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Progress::StillPending),
                Err(e) => {
                    self.disconnect_and_reconnect(&e.to_string())?;
                    Ok(Progress::Rearmed)
                }
            },

            (SlotState::Writing, Signal::Ready) => {
                let expected = self.response_len;
                match self.endpoint.try_write(&self.response[..expected]) {
                    Ok(n) if n == expected => {
                        self.state = SlotState::Reading;
                        Ok(Progress::Advanced)
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Progress::StillPending),
                    Ok(n) => {
                        self.disconnect_and_reconnect(&format!("short write {n}/{expected}"))?;
                        Ok(Progress::Rearmed)
                    }
                    Err(e) => {
                        self.disconnect_and_reconnect(&e.to_string())?;
                        Ok(Progress::Rearmed)
                    }
                }
            }

            (_, Signal::Failed(e)) => {
                self.disconnect_and_reconnect(&e.to_string())?;
                Ok(Progress::Rearmed)
            }
        }
    }

    /// Entry into `Reading`.
    fn begin_read(&mut self) -> Result<()> {
        match self.endpoint.try_read(&mut self.request) {
            Ok(0) => self.disconnect_and_reconnect("client closed"),
            Ok(n) => {
                trace!(slot = self.index, bytes = n, "Request read");
                self.request_len = n;
                self.pending_io = false;
                self.state = SlotState::Writing;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.pending_io = true;
                Ok(())
            }
            Err(e) => self.disconnect_and_reconnect(&e.to_string()),
        }
    }

    /// Entry into `Writing`: asks the handler for a response and sends it.
    fn begin_write(&mut self, handler: &RequestHandler) -> Result<()> {
        self.response_len = self.produce_response(handler)?;
        self.counters.request();

        let expected = self.response_len;
        match self.endpoint.try_write(&self.response[..expected]) {
            Ok(n) if n == expected => {
                trace!(slot = self.index, bytes = n, "Response written");
                self.pending_io = false;
                self.state = SlotState::Reading;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.pending_io = true;
                Ok(())
            }
            Ok(n) => self.disconnect_and_reconnect(&format!("short write {n}/{expected}")),
            Err(e) => self.disconnect_and_reconnect(&e.to_string()),
        }
    }

    /// Runs the handler inline and checks its reported length.
    fn produce_response(&mut self, handler: &RequestHandler) -> Result<usize> {
        let request = &self.request[..self.request_len];
        let response = &mut self.response[..];
        let capacity = response.len();

        let len = panic::catch_unwind(AssertUnwindSafe(|| handler(request, response)))
            .map_err(|_| Error::HandlerPanicked { slot: self.index })?;

        if len > capacity {
            return Err(Error::response_too_large(len, capacity));
        }
        Ok(len)
    }

    /// Drops the client and listens again on the same instance.
    fn disconnect_and_reconnect(&mut self, reason: &str) -> Result<()> {
        debug!(slot = self.index, reason, "Client disconnected, re-arming slot");
        self.endpoint.disconnect();
        self.request_len = 0;
        self.response_len = 0;
        self.counters.disconnect();
        self.connect_to_new_client()
    }

    fn connect_to_new_client(&mut self) -> Result<()> {
        self.pending_io = true;
        self.state = SlotState::Connecting;

        match self.endpoint.submit_accept() {
            Ok(Submission::Pending) => Ok(()),
            Ok(Submission::Connected) => {
                // Client was already waiting: stay signaled and read next.
                self.counters.connection();
                debug!(slot = self.index, "Client already connected");
                self.pending_io = false;
                self.state = SlotState::Reading;
                Ok(())
            }
            Ok(Submission::Completed) => Err(Error::protocol(format!(
                "accept on slot {} reported synchronous completion",
                self.index
            ))),
            Err(e) => Err(Error::accept(self.index, e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
