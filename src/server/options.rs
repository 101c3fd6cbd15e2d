//! Transport server configuration.
//!
//! All values are fixed for the lifetime of a server.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pipehost::ServerOptions;
//!
//! let options = ServerOptions::new()
//!     .with_instances(8)
//!     .with_max_message_size(2048)
//!     .with_client_timeout(Duration::from_secs(2));
//!
//! assert!(options.validate().is_ok());
//! ```
//!
//! Options also deserialize from camelCase JSON with every field optional:
//!
//! ```
//! use pipehost::ServerOptions;
//!
//! let options = ServerOptions::from_json(r#"{ "instances": 2, "clientTimeoutMs": 250 }"#)?;
//! assert_eq!(options.instances, 2);
//! assert_eq!(options.max_message_size, 4096);
//! # Ok::<(), pipehost::Error>(())
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::platform;

// ============================================================================
// Constants
// ============================================================================

/// Default number of endpoint instances.
pub const DEFAULT_INSTANCES: usize = 4;

/// Upper bound on endpoint instances imposed by the named-pipe primitive.
pub const MAX_INSTANCES: usize = 254;

/// Default maximum request/response size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Largest message the platform endpoint delivers whole: 4096 bytes on
/// Windows, 16 MiB on Unix.
pub const MAX_MESSAGE_SIZE: usize = platform::MAX_MESSAGE_SIZE;

/// Default client timeout in milliseconds.
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 5000;

/// Default Unix socket file mode.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

// ============================================================================
// ServerOptions
// ============================================================================

/// Transport server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    /// Number of endpoint instances (connection slots), `1..=254`.
    pub instances: usize,

    /// Capacity of each request and response buffer in bytes,
    /// `1..=MAX_MESSAGE_SIZE`.
    pub max_message_size: usize,

    /// How long clients wait for a free instance or a response.
    pub client_timeout_ms: u64,

    /// Directory for Unix socket files. Defaults to the system temp dir.
    pub socket_dir: Option<PathBuf>,

    /// Unix socket file mode.
    pub socket_mode: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            instances: DEFAULT_INSTANCES,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            client_timeout_ms: DEFAULT_CLIENT_TIMEOUT_MS,
            socket_dir: None,
            socket_mode: DEFAULT_SOCKET_MODE,
        }
    }

    /// Parses and validates options from JSON.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerOptions {
    /// Sets the number of endpoint instances.
    #[inline]
    #[must_use]
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Sets the maximum message size in bytes.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the client timeout.
    #[inline]
    #[must_use]
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the directory for Unix socket files.
    #[inline]
    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Sets the Unix socket file mode.
    #[inline]
    #[must_use]
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ServerOptions {
    /// Client timeout as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Validates every value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_INSTANCES).contains(&self.instances) {
            return Err(Error::config(format!(
                "instances must be between 1 and {MAX_INSTANCES}, got {}",
                self.instances
            )));
        }

        if self.max_message_size == 0 {
            return Err(Error::config("maxMessageSize must be greater than zero"));
        }

        if self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(Error::config(format!(
                "maxMessageSize must not exceed {MAX_MESSAGE_SIZE} on this platform, got {}",
                self.max_message_size
            )));
        }

        if self.client_timeout_ms == 0 {
            return Err(Error::config("clientTimeoutMs must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
