//! Error types for pipehost.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use pipehost::{Result, TransportServer};
//!
//! fn example(server: &TransportServer) -> Result<()> {
//!     server.start()?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Surfaced through |
//! |----------|----------|------------------|
//! | Configuration | [`Error::Config`], [`Error::Lifecycle`] | `build()` / `start()` |
//! | Setup | [`Error::AccessControl`], [`Error::Endpoint`], [`Error::ServerThread`] | `start()` |
//! | Protocol | [`Error::Protocol`], [`Error::Accept`], [`Error::ResponseTooLarge`], [`Error::HandlerPanicked`] | fatal-error sink |
//! | Connection | [`Error::ConnectionClosed`], [`Error::ConnectionTimeout`], [`Error::MessageTooLarge`], [`Error::Timeout`] | [`PipeClient`](crate::PipeClient) |
//! | External | [`Error::Io`], [`Error::Json`] | anywhere |
//!
//! Per-connection transport errors on the server side (client disconnects,
//! short writes) never become an [`Error`]; the affected slot is re-armed.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server options or the endpoint name are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Lifecycle misuse.
    ///
    /// Returned when `start()` is called from the server's own execution
    /// context.
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        /// Description of the misuse.
        message: String,
    },

    // ========================================================================
    // Setup Errors
    // ========================================================================
    /// The shared access-control descriptor could not be created.
    #[error("Failed to create access-control descriptor: {message}")]
    AccessControl {
        /// Description of the failure.
        message: String,
    },

    /// An endpoint instance could not be created.
    #[error("Failed to create endpoint {name}: {source}")]
    Endpoint {
        /// Platform path of the endpoint.
        name: String,
        /// Underlying OS error.
        #[source]
        source: IoError,
    },

    /// The background execution context could not be started.
    #[error("Server thread error: {message}")]
    ServerThread {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol invariant violated.
    ///
    /// Fatal for the whole server.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Accepting a client failed on a connection slot.
    #[error("Accept failed on slot {slot}: {source}")]
    Accept {
        /// Index of the failing slot.
        slot: usize,
        /// Underlying OS error.
        #[source]
        source: IoError,
    },

    /// The request handler reported more bytes than the response buffer holds.
    #[error("Handler produced {len} bytes, response capacity is {capacity}")]
    ResponseTooLarge {
        /// Length reported by the handler.
        len: usize,
        /// Capacity of the response buffer.
        capacity: usize,
    },

    /// The request handler panicked.
    #[error("Request handler panicked on slot {slot}")]
    HandlerPanicked {
        /// Index of the slot being served.
        slot: usize,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timed out waiting for a server instance.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Outgoing message exceeds the configured maximum.
    #[error("Message of {len} bytes exceeds maximum of {max}")]
    MessageTooLarge {
        /// Length of the rejected message.
        len: usize,
        /// Configured maximum message size.
        max: usize,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a lifecycle error.
    #[inline]
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Creates an access-control error.
    #[inline]
    pub fn access_control(message: impl Into<String>) -> Self {
        Self::AccessControl {
            message: message.into(),
        }
    }

    /// Creates an endpoint creation error.
    #[inline]
    pub fn endpoint(name: impl Into<String>, source: IoError) -> Self {
        Self::Endpoint {
            name: name.into(),
            source,
        }
    }

    /// Creates a server thread error.
    #[inline]
    pub fn server_thread(message: impl Into<String>) -> Self {
        Self::ServerThread {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an accept error.
    #[inline]
    pub fn accept(slot: usize, source: IoError) -> Self {
        Self::Accept { slot, source }
    }

    /// Creates a response overflow error.
    #[inline]
    pub fn response_too_large(len: usize, capacity: usize) -> Self {
        Self::ResponseTooLarge { len, capacity }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a message size error.
    #[inline]
    pub fn message_too_large(len: usize, max: usize) -> Self {
        Self::MessageTooLarge { len, max }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error aborts server startup.
    #[inline]
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Lifecycle { .. }
                | Self::AccessControl { .. }
                | Self::Endpoint { .. }
                | Self::ServerThread { .. }
        )
    }

    /// Returns `true` if this error ends a running server.
    ///
    /// These are the errors delivered to the fatal-error sink.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Accept { .. }
                | Self::ResponseTooLarge { .. }
                | Self::HandlerPanicked { .. }
        )
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a client connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::ConnectionTimeout { .. } | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
