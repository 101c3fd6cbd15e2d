//! Transport server module.
//!
//! This module provides the public entry point for serving requests.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TransportServer`] | Owns the slot pool and its background thread |
//! | [`ServerBuilder`] | Fluent configuration builder |
//! | [`ServerOptions`] | Instance count, message size, timeouts |
//! | [`FatalErrorHandler`] | Sink for errors that end a run |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for server configuration.
pub mod builder;

/// Server handle and background thread.
pub mod core;

/// Server configuration.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ServerBuilder;
pub use core::{FatalErrorHandler, TransportServer};
pub use options::ServerOptions;
