//! POSIX shared-memory segment holding one [`SharedCell`].
//!
//! Every open region holds a shared `flock` on its descriptor. Releasing a
//! region removes the segment name only if the lock can be upgraded to
//! exclusive, i.e. no other handle in any process is still open. The kernel
//! drops the locks of crashed processes, so their segments are reclaimed by
//! the next release.

// ============================================================================
// Imports
// ============================================================================

use std::ffi::{CStr, CString};
use std::fs::{File, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::{self, NonNull};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::platform::{Opened, SHARED_CELL_SIZE, SharedCell};

// ============================================================================
// Constants
// ============================================================================

/// Mode of a newly created segment: readable and writable by every local user.
const SEGMENT_MODE: u32 = 0o666;

/// Create/attach rounds before giving up on a segment that keeps vanishing.
const OPEN_ATTEMPTS: usize = 3;

/// Polls for the creator to size a freshly created segment.
const SIZE_POLL_ATTEMPTS: usize = 10;
const SIZE_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// SharedRegion
// ============================================================================

/// Mapping of a named POSIX shared-memory segment.
pub(crate) struct SharedRegion {
    cell: NonNull<SharedCell>,
    name: CString,
    file: File,
    /// Whether `file` holds a shared lock. Without one the segment is never
    /// reclaimed.
    locked: bool,
}

impl SharedRegion {
    /// Creates the segment `/<name>`, or attaches to it if it already exists.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `shm_open`, `flock`, `ftruncate`, or
    /// `mmap`, or `InvalidInput` if `name` contains a slash or NUL.
    pub(crate) fn open(name: &str) -> io::Result<(Self, Opened)> {
        let name = segment_name(name)?;

        for _ in 0..OPEN_ATTEMPTS {
            let (file, opened) = match shm_open(&name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
                Ok(file) => (file, Opened::Created),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match shm_open(&name, libc::O_RDWR) {
                    Ok(file) => (file, Opened::Attached),
                    // Last holder unlinked it between our two calls.
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            };

            let locked = lock_shared(&file)?;
            if locked && !names_segment(&name, &file)? {
                debug!(name = ?name, "Shared segment was reclaimed while opening, retrying");
                continue;
            }

            match opened {
                Opened::Created => initialize(&name, &file)?,
                Opened::Attached => wait_for_size(&file)?,
            }

            return Ok((Self::map(file, name, locked)?, opened));
        }

        Err(io::Error::new(
            ErrorKind::Interrupted,
            "shared segment was repeatedly removed while opening",
        ))
    }

    fn map(file: File, name: CString, locked: bool) -> io::Result<Self> {
        // SAFETY: mapping a descriptor we own for a length the segment is
        // known to cover; the result is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SHARED_CELL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let cell = NonNull::new(ptr.cast::<SharedCell>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        Ok(Self {
            cell,
            name,
            file,
            locked,
        })
    }

    /// The mapped cell.
    #[inline]
    pub(crate) fn cell(&self) -> &SharedCell {
        // SAFETY: the mapping is page aligned, at least SHARED_CELL_SIZE
        // bytes, and lives as long as `self`. All fields are atomics.
        unsafe { self.cell.as_ref() }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range mapped in `map`.
        unsafe {
            libc::munmap(self.cell.as_ptr().cast(), SHARED_CELL_SIZE);
        }

        // The exclusive lock is held until `file` closes below, so openers
        // blocked in `lock_shared` see the name gone and start over.
        if self.locked && try_lock_exclusive(&self.file) {
            // SAFETY: `name` is a valid NUL-terminated string.
            if unsafe { libc::shm_unlink(self.name.as_ptr()) } == 0 {
                debug!(name = ?self.name, "Last handle released, shared segment removed");
            }
        }
    }
}

// SAFETY: the mapping is process-shared memory made of atomics and stays
// valid for the lifetime of the region.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

// ============================================================================
// Helpers
// ============================================================================

fn segment_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid shared segment name {name:?}"),
        ));
    }
    CString::new(format!("/{name}")).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))
}

fn shm_open(name: &CStr, flags: libc::c_int) -> io::Result<File> {
    // SAFETY: `name` is NUL-terminated; the mode argument is read only
    // when O_CREAT is set.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, SEGMENT_MODE as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Takes a blocking shared lock.
///
/// Returns `false` where the platform cannot lock shared-memory descriptors.
fn lock_shared(file: &File) -> io::Result<bool> {
    loop {
        // SAFETY: `file` owns a valid descriptor.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) } == 0 {
            return Ok(true);
        }

        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(code) if code == libc::EOPNOTSUPP || code == libc::ENOTSUP || code == libc::EINVAL => {
                debug!(error = %e, "flock unsupported on shared memory, segment will not be reclaimed");
                return Ok(false);
            }
            _ => return Err(e),
        }
    }
}

fn try_lock_exclusive(file: &File) -> bool {
    // SAFETY: `file` owns a valid descriptor.
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

/// Whether `name` still refers to the segment open as `file`.
fn names_segment(name: &CStr, file: &File) -> io::Result<bool> {
    let current = match shm_open(name, libc::O_RDWR) {
        Ok(current) => current,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let (ours, theirs) = (file.metadata()?, current.metadata()?);
    Ok(ours.dev() == theirs.dev() && ours.ino() == theirs.ino())
}

/// Widens the mode and sizes a segment this process created.
fn initialize(name: &CStr, file: &File) -> io::Result<()> {
    // umask may have narrowed the creation mode.
    if let Err(e) = file.set_permissions(Permissions::from_mode(SEGMENT_MODE)) {
        debug!(name = ?name, error = %e, "Cannot widen shared segment mode");
    }

    if let Err(e) = file.set_len(SHARED_CELL_SIZE as u64) {
        // SAFETY: `name` is NUL-terminated.
        unsafe { libc::shm_unlink(name.as_ptr()) };
        return Err(e);
    }
    Ok(())
}

/// Waits for the creator of an existing segment to size it.
fn wait_for_size(file: &File) -> io::Result<()> {
    for _ in 0..SIZE_POLL_ATTEMPTS {
        if file.metadata()?.len() >= SHARED_CELL_SIZE as u64 {
            return Ok(());
        }
        thread::sleep(SIZE_POLL_INTERVAL);
    }

    Err(io::Error::new(
        ErrorKind::TimedOut,
        "shared segment was never sized by its creator",
    ))
}

// ============================================================================
// Tests
// ============================================================================
