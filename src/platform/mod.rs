//! Platform primitives behind the transport and the host flag.
//!
//! | Primitive | Unix | Windows |
//! |-----------|------|---------|
//! | Named endpoint | Unix domain socket shared by N slot instances | N message-mode named pipe instances |
//! | Access-control descriptor | socket file mode | null-DACL security descriptor |
//! | Shared cell | POSIX `shm_open` + `mmap` | named file mapping |
//! | Message boundaries | 4-byte length prefix per message | pipe message mode |
//! | Largest message | 16 MiB | 4096 bytes |
//! | Client | `UnixStream` | `NamedPipeClient` (busy-retry) |
//!
//! Both backends expose the same crate-internal surface, re-exported here.

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::atomic::AtomicU32;

use crate::error::{Error, Result};
use crate::server::ServerOptions;

// ============================================================================
// Backends
// ============================================================================

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::{
    AccessDescriptor, ClientStream, MAX_MESSAGE_SIZE, PlatformEndpoint, SharedRegion, connect,
    create_endpoints,
};

#[cfg(windows)]
pub(crate) use windows::{
    AccessDescriptor, ClientStream, MAX_MESSAGE_SIZE, PlatformEndpoint, SharedRegion, connect,
    create_endpoints,
};

#[cfg(not(any(unix, windows)))]
compile_error!("pipehost supports Unix and Windows targets only");

// ============================================================================
// Shared Cell
// ============================================================================

/// Layout of the cross-process host-arbitration record.
///
/// `magic` is stored last by the creating process; attachers must observe it
/// before trusting `active`.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct SharedCell {
    pub magic: AtomicU32,
    pub active: AtomicU32,
}

/// Size of the shared segment in bytes.
pub(crate) const SHARED_CELL_SIZE: usize = std::mem::size_of::<SharedCell>();

/// How a shared segment was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opened {
    /// This process created the segment and must initialize it.
    Created,
    /// The segment already existed.
    Attached,
}

// ============================================================================
// Endpoint Naming
// ============================================================================

/// Checks a logical endpoint name.
///
/// # Errors
///
/// Returns [`Error::Config`] if the name is empty or contains a path
/// separator or NUL.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("endpoint name must not be empty"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(Error::config(format!(
            "endpoint name {name:?} must not contain path separators or NUL"
        )));
    }
    Ok(())
}

/// Maps a logical endpoint name to its platform rendezvous path.
///
/// - Windows: `\\.\pipe\<name>`
/// - Unix: `<socket_dir>/<name>.sock`, `socket_dir` defaulting to the
///   system temp directory
#[must_use]
pub(crate) fn endpoint_path(name: &str, options: &ServerOptions) -> PathBuf {
    if cfg!(windows) {
        let _ = options;
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    } else {
        options
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("{name}.sock"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("pipehost-demo").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn test_shared_cell_size() {
        assert_eq!(SHARED_CELL_SIZE, 8);
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoint_path_uses_socket_dir() {
        let options = ServerOptions::new().with_socket_dir("/run/pipehost");
        assert_eq!(
            endpoint_path("demo", &options),
            PathBuf::from("/run/pipehost/demo.sock")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoint_path_defaults_to_temp_dir() {
        let options = ServerOptions::new();
        assert_eq!(
            endpoint_path("demo", &options),
            std::env::temp_dir().join("demo.sock")
        );
    }

    #[cfg(windows)]
    #[test]
    fn test_endpoint_path_uses_pipe_namespace() {
        let options = ServerOptions::new();
        assert_eq!(
            endpoint_path("demo", &options),
            PathBuf::from(r"\\.\pipe\demo")
        );
    }
}
