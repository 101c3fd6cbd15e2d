//! Named file mapping holding one [`SharedCell`].

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::ptr::NonNull;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    PAGE_READWRITE, UnmapViewOfFile,
};

use crate::platform::{Opened, SHARED_CELL_SIZE, SharedCell};

use super::security::NullDacl;

// ============================================================================
// SharedRegion
// ============================================================================

/// View of a pagefile-backed named mapping.
///
/// The kernel destroys the mapping once the last handle in any process
/// closes.
pub(crate) struct SharedRegion {
    mapping: HANDLE,
    cell: NonNull<SharedCell>,
}

impl SharedRegion {
    /// Creates the mapping `Local\<name>`, or opens it if it already exists.
    ///
    /// A name that already carries a namespace prefix (`Global\…`) is used
    /// as given.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `CreateFileMappingW` or `MapViewOfFile`.
    pub(crate) fn open(name: &str) -> io::Result<(Self, Opened)> {
        let mut dacl = NullDacl::new()?;
        let wide = mapping_name(name);

        // SAFETY: `wide` is NUL-terminated and the attributes outlive the call.
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                dacl.attributes(),
                PAGE_READWRITE,
                0,
                SHARED_CELL_SIZE as u32,
                wide.as_ptr(),
            )
        };
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: reads the calling thread's last error, set by the call above.
        let opened = if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            Opened::Attached
        } else {
            Opened::Created
        };

        // SAFETY: `mapping` is a valid mapping of at least SHARED_CELL_SIZE bytes.
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, SHARED_CELL_SIZE) };
        let Some(cell) = NonNull::new(view.Value.cast::<SharedCell>()) else {
            let e = io::Error::last_os_error();
            // SAFETY: closing the handle created above.
            unsafe { CloseHandle(mapping) };
            return Err(e);
        };

        Ok((Self { mapping, cell }, opened))
    }

    /// The mapped cell.
    #[inline]
    pub(crate) fn cell(&self) -> &SharedCell {
        // SAFETY: the view is allocation-granularity aligned, at least
        // SHARED_CELL_SIZE bytes, and lives as long as `self`.
        unsafe { self.cell.as_ref() }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the view and closing the handle created in `open`.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.cell.as_ptr().cast(),
            });
            CloseHandle(self.mapping);
        }
    }
}

// SAFETY: the view is process-shared memory made of atomics; the handle is
// only closed on drop.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

// ============================================================================
// Helpers
// ============================================================================

fn mapping_name(name: &str) -> Vec<u16> {
    let qualified = if name.contains('\\') {
        name.to_owned()
    } else {
        format!("Local\\{name}")
    };
    qualified.encode_utf16().chain(std::iter::once(0)).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;

    fn unique_name() -> String {
        format!("pipehost-shm-{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_mapping_name_prefix() {
        let local: Vec<u16> = "Local\\flag\0".encode_utf16().collect();
        assert_eq!(mapping_name("flag"), local);

        let global: Vec<u16> = "Global\\flag\0".encode_utf16().collect();
        assert_eq!(mapping_name("Global\\flag"), global);
    }

    #[test]
    fn test_create_then_attach() {
        let name = unique_name();

        let (first, opened) = SharedRegion::open(&name).expect("create");
        assert_eq!(opened, Opened::Created);

        let (second, opened) = SharedRegion::open(&name).expect("attach");
        assert_eq!(opened, Opened::Attached);

        first.cell().active.store(7, Ordering::Release);
        assert_eq!(second.cell().active.load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_mapping_released_with_last_handle() {
        let name = unique_name();

        let (region, _) = SharedRegion::open(&name).expect("create");
        drop(region);

        let (_region, opened) = SharedRegion::open(&name).expect("recreate");
        assert_eq!(opened, Opened::Created);
    }
}
