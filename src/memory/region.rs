//! Dual Mapping of One Shared Memory Object
//!
//! [`RegionMapper`] creates an anonymous shared memory object and maps it
//! twice: once read-write, once read-execute. Both views are backed by the
//! same physical pages, so bytes stored through the writable view appear at
//! the same offset in the executable view without any single page ever being
//! writable and executable at once.
//!
//! ```text
//!   writable view (RW-)          executable view (R-X)
//!   +------------------+         +------------------+
//!   | offset 0         |  same   | offset 0         |
//!   | ...              | <-----> | ...              |
//!   | offset size - 1  |  pages  | offset size - 1  |
//!   +------------------+         +------------------+
//!              \                     /
//!               shared memory object
//! ```

use std::fmt;
use std::ptr::NonNull;

use tracing::{debug, warn};

use super::translate::AddressTranslator;
use crate::error::{JitMemoryError, JitMemoryResult};

// =============================================================================
// Platform layer
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr::{self, NonNull};

    use crate::error::{JitMemoryError, JitMemoryResult};

    pub const PROT_RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    pub const PROT_RX: libc::c_int = libc::PROT_READ | libc::PROT_EXEC;

    /// Create an anonymous shared memory object (unnamed file descriptor).
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn open_backing() -> JitMemoryResult<libc::c_int> {
        let fd = unsafe { libc::memfd_create(c"dualjit".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(JitMemoryError::last_os_error("memfd_create"));
        }
        Ok(fd)
    }

    /// Create a uniquely named POSIX shared memory object and unlink it
    /// straight away so only the descriptor keeps it alive.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn open_backing() -> JitMemoryResult<libc::c_int> {
        use std::ffi::CString;
        use std::sync::atomic::{AtomicU32, Ordering};

        static SEQUENCE: AtomicU32 = AtomicU32::new(0);

        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!("/dualjit.{}.{}", std::process::id(), seq);
        let name = CString::new(name).map_err(|_| JitMemoryError::ResourceExhausted {
            operation: "shm_open",
            errno: libc::EINVAL,
        })?;
        let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::c_uint) };
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };

        if fd < 0 {
            return Err(JitMemoryError::last_os_error("shm_open"));
        }
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
        Ok(fd)
    }

    /// Create the backing object and size it to exactly `size` bytes.
    pub fn create_backing(size: usize) -> JitMemoryResult<libc::c_int> {
        let fd = open_backing()?;
        let len = libc::off_t::try_from(size).map_err(|_| JitMemoryError::InvalidSize(size))?;
        if unsafe { libc::ftruncate(fd, len) } != 0 {
            let err = JitMemoryError::last_os_error("ftruncate");
            close(fd);
            return Err(err);
        }
        Ok(fd)
    }

    /// Map `size` bytes of `fd` shared with the given protection.
    pub fn map(
        fd: libc::c_int,
        size: usize,
        prot: libc::c_int,
        operation: &'static str,
    ) -> JitMemoryResult<NonNull<u8>> {
        let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, libc::MAP_SHARED, fd, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(JitMemoryError::last_os_error(operation));
        }
        NonNull::new(ptr as *mut u8).ok_or(JitMemoryError::ResourceExhausted {
            operation,
            errno: libc::ENOMEM,
        })
    }

    /// # Safety
    /// `ptr..ptr+size` must be a live mapping created by [`map`].
    pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> bool {
        unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) == 0 }
    }

    pub fn close(fd: libc::c_int) {
        unsafe {
            libc::close(fd);
        }
    }

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::ptr::NonNull;

    use crate::error::{JitMemoryError, JitMemoryResult};

    pub const PROT_RW: i32 = 0;
    pub const PROT_RX: i32 = 0;

    pub fn create_backing(_size: usize) -> JitMemoryResult<i32> {
        Err(JitMemoryError::from_errno("dual mapping", libc::EPERM))
    }

    pub fn map(_fd: i32, _size: usize, _prot: i32, operation: &'static str) -> JitMemoryResult<NonNull<u8>> {
        Err(JitMemoryError::from_errno(operation, libc::EPERM))
    }

    pub unsafe fn unmap(_ptr: NonNull<u8>, _size: usize) -> bool {
        true
    }

    pub fn close(_fd: i32) {}

    pub fn page_size() -> usize {
        4096
    }
}

/// Host page size in bytes.
pub fn page_size() -> usize {
    platform::page_size()
}

// =============================================================================
// MappedRegion
// =============================================================================

/// Identifier of the shared memory object behind a [`MappedRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingHandle(i32);

impl BackingHandle {
    /// Raw descriptor value
    pub fn raw(&self) -> i32 {
        self.0
    }
}

/// One physical region visible through a read-write and a read-execute view.
///
/// Owned exclusively; dropping it unmaps both views and closes the backing
/// object, so destruction happens exactly once.
pub struct MappedRegion {
    writable: NonNull<u8>,
    executable: NonNull<u8>,
    size: usize,
    backing: BackingHandle,
}

// Safety: the region is a plain block of shared memory. The pointers are only
// dereferenced through bounds-checked accessors and `unsafe` write paths whose
// callers own the target range.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Base of the read-write view
    #[inline]
    pub fn writable_base(&self) -> *mut u8 {
        self.writable.as_ptr()
    }

    /// Base of the read-execute view
    #[inline]
    pub fn executable_base(&self) -> *const u8 {
        self.executable.as_ptr()
    }

    /// Length of each view in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn backing_handle(&self) -> BackingHandle {
        self.backing
    }

    /// Address arithmetic between the two views
    #[inline]
    pub fn translator(&self) -> AddressTranslator {
        AddressTranslator::new(
            self.writable.as_ptr() as usize,
            self.executable.as_ptr() as usize,
            self.size,
        )
    }

    /// Pointer into the executable view at `offset`.
    pub fn executable_ptr(&self, offset: usize) -> JitMemoryResult<*const u8> {
        if offset >= self.size {
            return Err(JitMemoryError::InvalidAddress {
                address: (self.executable.as_ptr() as usize).wrapping_add(offset),
            });
        }
        Ok(self.executable.as_ptr().wrapping_add(offset) as *const u8)
    }

    /// Pointer into the writable view at `offset`.
    pub fn writable_ptr(&self, offset: usize) -> JitMemoryResult<*mut u8> {
        if offset >= self.size {
            return Err(JitMemoryError::InvalidAddress {
                address: (self.writable.as_ptr() as usize).wrapping_add(offset),
            });
        }
        Ok(self.writable.as_ptr().wrapping_add(offset))
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("writable", &format!("{:p}", self.writable))
            .field("executable", &format!("{:p}", self.executable))
            .field("size", &self.size)
            .field("backing", &self.backing.0)
            .finish()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            if !platform::unmap(self.writable, self.size) {
                warn!(size = self.size, "munmap of writable view failed");
            }
            if !platform::unmap(self.executable, self.size) {
                warn!(size = self.size, "munmap of executable view failed");
            }
        }
        platform::close(self.backing.0);
        debug!(
            writable = ?self.writable,
            executable = ?self.executable,
            size = self.size,
            "destroyed dual-mapped region"
        );
    }
}

// =============================================================================
// RegionMapper
// =============================================================================

/// Creates and destroys dual-mapped regions. Knows nothing about JIT state.
pub struct RegionMapper;

impl RegionMapper {
    /// Create a region of exactly `size` bytes with a RW view and an RX view.
    ///
    /// Failure to create or size the backing object and failure to map are
    /// reported separately: `ResourceExhausted` for memory/address space,
    /// `PermissionDenied` when the host refuses the mapping.
    pub fn create(size: usize) -> JitMemoryResult<MappedRegion> {
        if size == 0 {
            return Err(JitMemoryError::InvalidSize(size));
        }

        let fd = platform::create_backing(size)?;

        let writable = match platform::map(fd, size, platform::PROT_RW, "mmap(RW)") {
            Ok(ptr) => ptr,
            Err(err) => {
                platform::close(fd);
                return Err(err);
            }
        };

        let executable = match platform::map(fd, size, platform::PROT_RX, "mmap(RX)") {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    platform::unmap(writable, size);
                }
                platform::close(fd);
                return Err(err);
            }
        };

        debug!(
            writable = ?writable,
            executable = ?executable,
            size,
            "created dual-mapped region"
        );

        Ok(MappedRegion {
            writable,
            executable,
            size,
            backing: BackingHandle(fd),
        })
    }

    /// Unmap both views and release the backing object.
    pub fn destroy(region: MappedRegion) {
        drop(region);
    }

    /// Copy `code` into the writable view at `offset`.
    ///
    /// The bytes are not guaranteed to be visible to instruction fetch until
    /// the matching executable range is flushed.
    ///
    /// # Safety
    /// The caller must own `offset..offset+code.len()` (no other thread writes
    /// it or executes it while the copy runs).
    pub unsafe fn write_code(region: &MappedRegion, code: &[u8], offset: usize) -> JitMemoryResult<()> {
        match offset.checked_add(code.len()) {
            Some(end) if end <= region.size => {}
            _ => {
                return Err(JitMemoryError::InvalidAddress {
                    address: (region.writable_base() as usize).wrapping_add(offset),
                })
            }
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                code.as_ptr(),
                region.writable_base().add(offset),
                code.len(),
            );
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TEST_SIZE: usize = 64 * 1024;

    #[test]
    fn test_create_distinct_views() {
        let region = RegionMapper::create(TEST_SIZE).unwrap();
        assert_ne!(region.writable_base() as usize, region.executable_base() as usize);
        assert_eq!(region.size(), TEST_SIZE);
        assert!(region.backing_handle().raw() >= 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_eq!(
            RegionMapper::create(0).unwrap_err(),
            JitMemoryError::InvalidSize(0)
        );
    }

    #[test]
    fn test_views_share_bytes() {
        let region = RegionMapper::create(TEST_SIZE).unwrap();
        let code = [0xAAu8, 0xBB, 0xCC, 0xDD];
        unsafe {
            RegionMapper::write_code(&region, &code, 128).unwrap();
        }

        let exec = region.executable_ptr(128).unwrap();
        let seen = unsafe { std::slice::from_raw_parts(exec, code.len()) };
        assert_eq!(seen, &code);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let region = RegionMapper::create(TEST_SIZE).unwrap();
        let code = [0u8; 8];
        let err = unsafe { RegionMapper::write_code(&region, &code, TEST_SIZE - 4) };
        assert!(matches!(err, Err(JitMemoryError::InvalidAddress { .. })));

        let err = unsafe { RegionMapper::write_code(&region, &code, usize::MAX) };
        assert!(matches!(err, Err(JitMemoryError::InvalidAddress { .. })));
    }

    #[test]
    fn test_offset_pointers() {
        let region = RegionMapper::create(TEST_SIZE).unwrap();
        assert_eq!(region.executable_ptr(0).unwrap(), region.executable_base());
        assert_eq!(region.writable_ptr(16).unwrap(), region.writable_base().wrapping_add(16));
        assert!(region.executable_ptr(TEST_SIZE).is_err());
        assert!(region.writable_ptr(TEST_SIZE).is_err());
    }

    #[test]
    fn test_destroy_releases() {
        let region = RegionMapper::create(TEST_SIZE).unwrap();
        RegionMapper::destroy(region);
        // A fresh region can still be created afterwards
        let again = RegionMapper::create(TEST_SIZE).unwrap();
        assert_eq!(again.size(), TEST_SIZE);
    }

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }
}
