//! Address translation between the writable and executable views
//!
//! Both views cover the same `size` bytes, so translation is a constant
//! offset. Out-of-range addresses are rejected; they are never wrapped into
//! unrelated memory.

use crate::error::{JitMemoryError, JitMemoryResult};

/// Base/size pairs of the two views of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTranslator {
    writable_base: usize,
    executable_base: usize,
    size: usize,
}

impl AddressTranslator {
    pub const fn new(writable_base: usize, executable_base: usize, size: usize) -> Self {
        AddressTranslator {
            writable_base,
            executable_base,
            size,
        }
    }

    #[inline]
    pub fn writable_base(&self) -> usize {
        self.writable_base
    }

    #[inline]
    pub fn executable_base(&self) -> usize {
        self.executable_base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of `addr` inside `[base, base + size)`.
    ///
    /// `wrapping_sub` turns addresses below `base` into huge offsets, so a
    /// single comparison covers both ends.
    #[inline(always)]
    fn offset_in(&self, base: usize, addr: usize) -> JitMemoryResult<usize> {
        let offset = addr.wrapping_sub(base);
        if offset < self.size {
            Ok(offset)
        } else {
            Err(JitMemoryError::InvalidAddress { address: addr })
        }
    }

    /// Offset of an executable-view address
    #[inline]
    pub fn executable_offset(&self, exec: *const u8) -> JitMemoryResult<usize> {
        self.offset_in(self.executable_base, exec as usize)
    }

    /// Offset of a writable-view address
    #[inline]
    pub fn writable_offset(&self, write: *const u8) -> JitMemoryResult<usize> {
        self.offset_in(self.writable_base, write as usize)
    }

    /// Writable counterpart of an executable-view address
    #[inline]
    pub fn to_writable(&self, exec: *const u8) -> JitMemoryResult<*mut u8> {
        let offset = self.executable_offset(exec)?;
        Ok((self.writable_base + offset) as *mut u8)
    }

    /// Executable counterpart of a writable-view address
    #[inline]
    pub fn to_executable(&self, write: *const u8) -> JitMemoryResult<*const u8> {
        let offset = self.writable_offset(write)?;
        Ok((self.executable_base + offset) as *const u8)
    }

    /// Check that `[exec, exec + len)` lies entirely inside the executable view.
    ///
    /// Returns the offset of `exec`. A zero-length range only needs a valid start.
    #[inline]
    pub fn check_executable_range(&self, exec: *const u8, len: usize) -> JitMemoryResult<usize> {
        let offset = self.executable_offset(exec)?;
        if len > self.size - offset {
            return Err(JitMemoryError::InvalidAddress {
                address: (exec as usize).wrapping_add(len),
            });
        }
        Ok(offset)
    }

    /// Writable counterpart of `[exec, exec + len)`, checked as a whole.
    #[inline]
    pub fn to_writable_range(&self, exec: *const u8, len: usize) -> JitMemoryResult<*mut u8> {
        let offset = self.check_executable_range(exec, len)?;
        Ok((self.writable_base + offset) as *mut u8)
    }
}
