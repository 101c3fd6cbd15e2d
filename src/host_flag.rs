//! Cross-process host-arbitration flag.
//!
//! A single boolean shared by every process that opens the same name. The
//! first process to open it creates the shared cell with the flag set;
//! later processes attach and see whatever was last written. Reads and
//! writes are single atomic operations with no further coordination, so
//! the last writer wins.
//!
//! The cell is reclaimed once every handle in every process is released;
//! the next open then creates it afresh with the flag set. While any handle
//! is open, every opener attaches to the same cell.
//!
//! If the shared cell cannot be created or attached, the handle degrades:
//! [`HostFlag::is_active`] always returns `true` and
//! [`HostFlag::set_active`] does nothing.
//!
//! # Example
//!
//! ```no_run
//! use pipehost::HostFlag;
//!
//! let flag = HostFlag::open("my-app-host");
//! if flag.is_active() {
//!     // this process drives the shared device
//! }
//!
//! flag.set_active(false);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::platform::{Opened, SharedCell, SharedRegion};

// ============================================================================
// Constants
// ============================================================================

/// Well-known flag name used by [`HostFlag::new`].
pub const DEFAULT_FLAG_NAME: &str = "PipehostHostFlag";

/// Written last by the creator once the cell is initialized.
const CELL_MAGIC: u32 = 0x5048_464C;

/// Back-off while waiting for the creator to publish the cell.
const PUBLISH_POLL_ATTEMPTS: u32 = 20;
const PUBLISH_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// HostFlag
// ============================================================================

/// Handle to a named cross-process boolean.
pub struct HostFlag {
    name: String,
    region: Option<SharedRegion>,
}

impl fmt::Debug for HostFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFlag")
            .field("name", &self.name)
            .field("degraded", &self.is_degraded())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Default for HostFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFlag {
    /// Opens the flag under [`DEFAULT_FLAG_NAME`].
    #[must_use]
    pub fn new() -> Self {
        Self::open(DEFAULT_FLAG_NAME)
    }

    /// Creates or attaches to the flag `name`.
    ///
    /// Never fails; a flag that cannot be opened is returned degraded.
    #[must_use]
    pub fn open(name: &str) -> Self {
        let region = match attach_or_create(name) {
            Ok(region) => Some(region),
            Err(e) => {
                warn!(name, error = %e, "Host flag unavailable, defaulting to active");
                None
            }
        };

        Self {
            name: name.to_owned(),
            region,
        }
    }

    /// Returns the shared value, or `true` when degraded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cell()
            .is_none_or(|cell| cell.active.load(Ordering::SeqCst) != 0)
    }

    /// Stores `active` for every attached process. No-op when degraded.
    pub fn set_active(&self, active: bool) {
        if let Some(cell) = self.cell() {
            cell.active.store(u32::from(active), Ordering::SeqCst);
        }
    }

    /// Returns `true` if the shared cell could not be opened.
    #[inline]
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.region.is_none()
    }

    /// Name the flag was opened with.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn cell(&self) -> Option<&SharedCell> {
        self.region.as_ref().map(SharedRegion::cell)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Opens the region and either initializes or joins the cell.
fn attach_or_create(name: &str) -> io::Result<SharedRegion> {
    let (region, opened) = SharedRegion::open(name)?;
    let cell = region.cell();

    match opened {
        Opened::Created => {
            cell.active.store(1, Ordering::Relaxed);
            cell.magic.store(CELL_MAGIC, Ordering::Release);
            debug!(name, "Host flag created");
        }
        Opened::Attached => {
            wait_for_publish(cell)?;
            debug!(name, "Host flag attached");
        }
    }

    Ok(region)
}

fn wait_for_publish(cell: &SharedCell) -> io::Result<()> {
    for _ in 0..PUBLISH_POLL_ATTEMPTS {
        if cell.magic.load(Ordering::Acquire) == CELL_MAGIC {
            return Ok(());
        }
        thread::sleep(PUBLISH_POLL_INTERVAL);
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "host flag was never initialized by its creator",
    ))
}

// ============================================================================
// Tests
// ============================================================================
