//! Endpoint instance abstraction.
//!
//! A connection slot drives exactly one endpoint instance. The platform
//! layer implements [`Endpoint`] for Unix domain sockets and Windows named
//! pipes; tests implement it with a scripted in-memory instance.
//!
//! The contract mirrors overlapped I/O: every operation is first submitted
//! without blocking, and an operation that cannot finish immediately is
//! completed later through one of the `async` waits.

// ============================================================================
// Imports
// ============================================================================

use std::io;

use async_trait::async_trait;
use tokio::io::Interest;

// ============================================================================
// Submission
// ============================================================================

/// Outcome of submitting an accept on an endpoint instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
    /// The accept is queued; completion arrives through [`Endpoint::accept`].
    Pending,
    /// A client connected between arming and submission.
    Connected,
    /// The primitive reported synchronous success for an operation whose
    /// contract is asynchronous.
    Completed,
}

// ============================================================================
// Endpoint
// ============================================================================

/// One instance of a named local endpoint, owned by a single slot.
///
/// All methods are called from the server's single execution context.
/// The `async` methods must be cancellation safe: the reactor rebuilds its
/// wait on every iteration and drops the futures of slots that did not fire.
#[async_trait(?Send)]
pub(crate) trait Endpoint {
    /// Connection produced by a deferred accept.
    type Client;

    /// Submits a non-blocking accept.
    fn submit_accept(&mut self) -> io::Result<Submission>;

    /// Waits for the pending accept to complete.
    async fn accept(&self) -> io::Result<Self::Client>;

    /// Binds a client produced by [`Endpoint::accept`] to this instance.
    fn attach(&mut self, client: Self::Client);

    /// Waits until the connected client is ready for `interest`.
    async fn ready(&self, interest: Interest) -> io::Result<()>;

    /// Reads without blocking. `WouldBlock` means the read is pending.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes without blocking. `WouldBlock` means the write is pending.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Drops the current client, keeping the instance itself alive.
    fn disconnect(&mut self);
}
