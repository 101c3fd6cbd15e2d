//! pipehost - Multi-instance local IPC request/response server.
//!
//! This library serves request/response traffic over a named local endpoint
//! (a Windows named pipe or a Unix domain socket) from a fixed pool of
//! connection slots, all driven by one background thread. It also provides
//! a cross-process boolean used to decide which of several cooperating
//! processes is currently active.
//!
//! # Architecture
//!
//! - **Connection slots**: each owns one endpoint instance and cycles
//!   `Connecting → Reading → Writing → Reading …`, re-arming itself when
//!   its client goes away
//! - **Reactor**: one thread waits on every slot at once and advances
//!   whichever slot is ready
//! - **Request handler**: a synchronous callback run inline on the reactor
//!   thread; it stalls every other slot while it runs
//! - **Host flag**: a shared-memory cell, created by the first process and
//!   attached by the rest
//!
//! # Quick Start
//!
//! ```no_run
//! use pipehost::{PipeClient, Result, ServerOptions, TransportServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = ServerOptions::new().with_instances(4);
//!
//!     let server = TransportServer::builder("input-bridge")
//!         .options(options.clone())
//!         .on_request(|request, response| {
//!             let len = request.len();
//!             for (dst, src) in response.iter_mut().zip(request.iter().rev()) {
//!                 *dst = *src;
//!             }
//!             len
//!         })
//!         .build()?;
//!     server.start()?;
//!
//!     let mut client = PipeClient::connect("input-bridge", &options).await?;
//!     assert_eq!(client.request(b"abc").await?, b"cba");
//!
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`server`] | Server handle, builder, and options |
//! | [`transport`] | Slot state machine, reactor, and client |
//! | [`host_flag`] | Cross-process host-arbitration flag |
//! | [`error`] | Error types and [`Result`] alias |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Cross-process host-arbitration flag.
pub mod host_flag;

/// Per-OS endpoint, access-control, and shared-memory primitives.
mod platform;

/// Transport server handle and configuration.
///
/// Use [`TransportServer::builder()`] to create a configured server.
pub mod server;

/// Local IPC transport layer.
///
/// Slot state machine, reactor, and the async client.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Server types
pub use server::{FatalErrorHandler, ServerBuilder, ServerOptions, TransportServer};

// Transport types
pub use transport::{PipeClient, RequestHandler, ServerStats};

// Host flag
pub use host_flag::{DEFAULT_FLAG_NAME, HostFlag};

// Error types
pub use error::{Error, Result};
