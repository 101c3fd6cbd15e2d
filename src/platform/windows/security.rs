//! Null-DACL security descriptor shared by pipes and the flag mapping.

// ============================================================================
// Imports
// ============================================================================

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;

use windows_sys::Win32::Security::{
    InitializeSecurityDescriptor, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR,
    SetSecurityDescriptorDacl,
};
use windows_sys::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION;

use crate::error::{Error, Result};
use crate::server::ServerOptions;

// ============================================================================
// NullDacl
// ============================================================================

/// Security descriptor granting every local user full access.
///
/// The descriptor lives in a box so the pointer handed out through
/// [`NullDacl::attributes`] stays valid while `self` moves.
pub(crate) struct NullDacl {
    descriptor: Box<SECURITY_DESCRIPTOR>,
    attributes: SECURITY_ATTRIBUTES,
}

impl NullDacl {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: SECURITY_DESCRIPTOR is plain data; it is initialized below
        // before use.
        let mut descriptor: Box<SECURITY_DESCRIPTOR> = Box::new(unsafe { mem::zeroed() });
        let psd = ptr::from_mut(descriptor.as_mut()).cast::<c_void>();

        // SAFETY: `psd` points to a writable SECURITY_DESCRIPTOR.
        if unsafe { InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION) } == 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; a null DACL with `present = TRUE` allows all access.
        if unsafe { SetSecurityDescriptorDacl(psd, 1, ptr::null(), 0) } == 0 {
            return Err(io::Error::last_os_error());
        }

        let attributes = SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: psd,
            bInheritHandle: 0,
        };

        Ok(Self {
            descriptor,
            attributes,
        })
    }

    /// Attributes referencing the descriptor, valid while `self` lives.
    #[inline]
    pub(crate) fn attributes(&mut self) -> *mut SECURITY_ATTRIBUTES {
        debug_assert_eq!(
            self.attributes.lpSecurityDescriptor,
            ptr::from_mut(self.descriptor.as_mut()).cast::<c_void>()
        );
        ptr::from_mut(&mut self.attributes)
    }
}

// ============================================================================
// AccessDescriptor
// ============================================================================

/// Access-control descriptor shared by every pipe instance of a server.
pub(crate) struct AccessDescriptor {
    dacl: NullDacl,
}

impl AccessDescriptor {
    /// # Errors
    ///
    /// Returns [`Error::AccessControl`] if the descriptor cannot be
    /// initialized.
    pub(crate) fn create(_options: &ServerOptions) -> Result<Self> {
        let dacl = NullDacl::new().map_err(|e| Error::access_control(e.to_string()))?;
        Ok(Self { dacl })
    }

    #[inline]
    pub(crate) fn attributes(&mut self) -> *mut SECURITY_ATTRIBUTES {
        self.dacl.attributes()
    }
}

// ============================================================================
// Tests
// ============================================================================
