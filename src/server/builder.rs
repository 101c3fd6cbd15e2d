//! Builder pattern for server configuration.
//!
//! Provides a fluent API for configuring and creating [`TransportServer`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use pipehost::TransportServer;
//!
//! # fn example() -> pipehost::Result<()> {
//! let server = TransportServer::builder("input-bridge")
//!     .instances(4)
//!     .max_message_size(4096)
//!     .on_request(|request, response| {
//!         response[..request.len()].copy_from_slice(request);
//!         request.len()
//!     })
//!     .build()?;
//!
//! server.start()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::RequestHandler;

use super::core::{FatalErrorHandler, TransportServer};
use super::options::ServerOptions;

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`TransportServer`].
///
/// Use [`TransportServer::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ServerBuilder {
    /// Logical endpoint name.
    name: String,
    /// Server options.
    options: ServerOptions,
    /// Request handler (required).
    handler: Option<RequestHandler>,
    /// Fatal-error sink (optional).
    fatal: Option<FatalErrorHandler>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("has_handler", &self.handler.is_some())
            .field("has_fatal_sink", &self.fatal.is_some())
            .finish()
    }
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a builder for the endpoint `name` with default options.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ServerOptions::new(),
            handler: None,
            fatal: None,
        }
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the number of endpoint instances.
    #[inline]
    #[must_use]
    pub fn instances(mut self, instances: usize) -> Self {
        self.options.instances = instances;
        self
    }

    /// Sets the maximum request/response size in bytes.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.options.max_message_size = size;
        self
    }

    /// Sets the client timeout.
    #[inline]
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_client_timeout(timeout);
        self
    }

    /// Sets the directory for Unix socket files.
    #[inline]
    #[must_use]
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.socket_dir = Some(dir.into());
        self
    }

    /// Sets the Unix socket file mode.
    #[inline]
    #[must_use]
    pub fn socket_mode(mut self, mode: u32) -> Self {
        self.options.socket_mode = mode;
        self
    }

    /// Sets the request handler.
    ///
    /// The handler receives the request bytes and a response buffer of
    /// `max_message_size` bytes, and returns how many response bytes it
    /// wrote. It runs on the server thread and blocks every other slot
    /// while it runs.
    ///
    /// # Arguments
    ///
    /// * `handler` - Function from request bytes to response length
    #[inline]
    #[must_use]
    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8], &mut [u8]) -> usize + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets the fatal-error sink.
    ///
    /// Called at most once per run, on the server thread, after the server
    /// has released all of its resources. Defaults to logging the error.
    #[inline]
    #[must_use]
    pub fn on_fatal_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.fatal = Some(Arc::new(sink));
        self
    }

    /// Builds the server with validation. The server is not started.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the name or options are invalid
    /// - [`Error::Config`] if no request handler was set
    pub fn build(self) -> Result<TransportServer> {
        let handler = self.handler.ok_or_else(|| {
            Error::config(
                "Request handler is required. Use .on_request() to set it.\n\
                 Example: TransportServer::builder(\"name\").on_request(|req, resp| 0)",
            )
        })?;

        TransportServer::new(self.name, self.options, handler, self.fatal)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &[u8], _: &mut [u8]) -> usize {
        0
    }

    #[test]
    fn test_new_uses_default_options() {
        let builder = ServerBuilder::new("demo");
        assert_eq!(builder.name, "demo");
        assert_eq!(builder.options, ServerOptions::new());
        assert!(builder.handler.is_none());
        assert!(builder.fatal.is_none());
    }

    #[test]
    fn test_setters_update_options() {
        let builder = ServerBuilder::new("demo")
            .instances(2)
            .max_message_size(512)
            .client_timeout(Duration::from_millis(300))
            .socket_dir("/run/demo")
            .socket_mode(0o660);

        assert_eq!(builder.options.instances, 2);
        assert_eq!(builder.options.max_message_size, 512);
        assert_eq!(builder.options.client_timeout_ms, 300);
        assert_eq!(builder.options.socket_dir, Some(PathBuf::from("/run/demo")));
        assert_eq!(builder.options.socket_mode, 0o660);
    }

    #[test]
    fn test_build_fails_without_handler() {
        let err = ServerBuilder::new("demo").build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("handler"));
    }

    #[test]
    fn test_build_fails_with_invalid_name() {
        let result = ServerBuilder::new("bad/name").on_request(noop).build();
        assert!(matches!(result, Err(Error::Config { .. })));

        let result = ServerBuilder::new("").on_request(noop).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_build_fails_with_invalid_options() {
        let result = ServerBuilder::new("demo")
            .instances(0)
            .on_request(noop)
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_build_does_not_start() {
        let server = ServerBuilder::new("pipehost-builder-idle")
            .on_request(noop)
            .build()
            .expect("valid configuration");
        assert!(!server.is_running());
        assert_eq!(server.name(), "pipehost-builder-idle");
    }

    #[test]
    fn test_debug_hides_callbacks() {
        let builder = ServerBuilder::new("demo").on_request(noop);
        let debug = format!("{builder:?}");
        assert!(debug.contains("has_handler: true"));
        assert!(debug.contains("has_fatal_sink: false"));
    }
}
