//! Server counters shared between the reactor and the server handle.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counters
// ============================================================================

/// Live counters updated by the reactor thread.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    connections: AtomicU64,
    disconnects: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot for a server with `instances` slots.
    pub(crate) fn snapshot(&self, instances: usize) -> ServerStats {
        ServerStats {
            instances,
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// ServerStats
// ============================================================================

/// Point-in-time view of a server's activity.
///
/// Counters accumulate across restarts of the same server handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Number of endpoint instances (fixed for the server's lifetime).
    pub instances: usize,
    /// Clients accepted by any slot.
    pub connections: u64,
    /// Slots reset after a client disconnect or transport error.
    pub disconnects: u64,
    /// Requests handed to the request handler.
    pub requests: u64,
}

// ============================================================================
// Tests
// ============================================================================
