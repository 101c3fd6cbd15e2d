//! Local IPC transport layer.
//!
//! This module implements the slot pool behind a [`TransportServer`]
//! and the client that talks to it.
//!
//! [`TransportServer`]: crate::TransportServer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐                      ┌──────────────────────────────┐
//! │ PipeClient   │◄────────────────────►│ Slot 0  ─┐                   │
//! └──────────────┘                      │ Slot 1  ─┤                   │
//! ┌──────────────┐   named endpoint     │   …      ├─► Reactor (1 thr) │
//! │ PipeClient   │◄────────────────────►│ Slot N-1 ┘        │          │
//! └──────────────┘                      │           RequestHandler     │
//!                                       └──────────────────────────────┘
//! ```
//!
//! # Slot Lifecycle
//!
//! 1. Accept submitted on every slot at startup
//! 2. `Connecting` → `Reading` when a client connects
//! 3. `Reading` → `Writing` when a request arrives; the handler runs
//! 4. `Writing` → `Reading` once the response is fully written
//! 5. Any disconnect returns the slot to `Connecting` on the same instance
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `endpoint` | Non-blocking endpoint instance contract |
//! | `slot` | Per-connection state machine |
//! | `reactor` | Multi-source wait over all slots |
//! | `stats` | Server counters |
//! | `client` | Async request/response client |

// ============================================================================
// Submodules
// ============================================================================

/// Async request/response client.
pub mod client;

/// Endpoint instance contract.
pub(crate) mod endpoint;

/// Single-threaded reactor over the slot pool.
pub(crate) mod reactor;

/// Connection slot state machine.
pub(crate) mod slot;

/// Server counters.
pub mod stats;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::PipeClient;
pub use slot::RequestHandler;
pub use stats::ServerStats;

pub(crate) use reactor::Reactor;
pub(crate) use stats::Counters;
