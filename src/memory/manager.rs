//! Region Manager
//!
//! Single owner of the process's dual-mapped region. The manager moves from
//! *uninitialized* to *initialized* exactly once: concurrent first callers of
//! [`RegionManager::initialize`] serialize on an init lock and only one of
//! them creates the region. A failed creation leaves the manager
//! uninitialized so a later call may retry.
//!
//! The manager is an ordinary value. Whoever drives the translator constructs
//! it and hands it (or a [`JitRuntime`](crate::runtime::JitRuntime) wrapping
//! it) to the code that needs it.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::icache::CacheSynchronizer;
use super::region::{MappedRegion, RegionMapper};
use super::translate::AddressTranslator;
use crate::error::{JitMemoryError, JitMemoryResult};

/// Owns the single [`MappedRegion`] and exposes write/translate/flush.
pub struct RegionManager {
    /// Write-once; lock-free reads after initialization
    region: OnceLock<MappedRegion>,
    /// Serializes first-time initializers
    init_lock: Mutex<()>,
}

impl RegionManager {
    pub fn new() -> Self {
        RegionManager {
            region: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Create the region if it does not exist yet.
    ///
    /// Returns `Ok` immediately when already initialized, whatever `size` is.
    pub fn initialize(&self, size: usize) -> JitMemoryResult<()> {
        if let Some(region) = self.region.get() {
            trace!(size, existing = region.size(), "region already initialized");
            return Ok(());
        }

        let _guard = self.init_lock.lock();
        if let Some(region) = self.region.get() {
            if region.size() != size {
                debug!(
                    requested = size,
                    existing = region.size(),
                    "initialize raced with another caller; keeping existing region"
                );
            }
            return Ok(());
        }

        match RegionMapper::create(size) {
            Ok(region) => {
                debug!(size, "JIT region initialized");
                // Only this thread can set it while holding the init lock
                let _ = self.region.set(region);
                Ok(())
            }
            Err(err) => {
                warn!(size, error = %err, "JIT region creation failed");
                Err(err)
            }
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.get().is_some()
    }

    /// The owned region, if initialized
    #[inline]
    pub fn region(&self) -> Option<&MappedRegion> {
        self.region.get()
    }

    #[inline]
    fn translator(&self) -> JitMemoryResult<AddressTranslator> {
        self.region
            .get()
            .map(MappedRegion::translator)
            .ok_or(JitMemoryError::NotInitialized)
    }

    /// Base of the executable view, `None` when JIT memory is unavailable.
    #[inline]
    pub fn executable_base(&self) -> Option<*const u8> {
        self.region.get().map(MappedRegion::executable_base)
    }

    /// Base of the writable view, `None` when JIT memory is unavailable.
    #[inline]
    pub fn writable_base(&self) -> Option<*mut u8> {
        self.region.get().map(MappedRegion::writable_base)
    }

    /// Region length, `None` when JIT memory is unavailable.
    #[inline]
    pub fn size(&self) -> Option<usize> {
        self.region.get().map(MappedRegion::size)
    }

    /// Writable counterpart of an executable address.
    #[inline]
    pub fn write_pointer_for(&self, exec: *const u8) -> JitMemoryResult<*mut u8> {
        self.translator()?.to_writable(exec)
    }

    /// Executable counterpart of a writable address.
    #[inline]
    pub fn executable_pointer_for(&self, write: *const u8) -> JitMemoryResult<*const u8> {
        self.translator()?.to_executable(write)
    }

    /// Store `code` at the writable counterpart of `exec`.
    ///
    /// Does not flush; call [`RegionManager::invalidate`] on the same range
    /// before executing it.
    ///
    /// # Safety
    /// The caller must own `[exec, exec + code.len())`: no other thread writes
    /// or executes that range concurrently.
    pub unsafe fn write(&self, exec: *const u8, code: &[u8]) -> JitMemoryResult<()> {
        let dst = self.translator()?.to_writable_range(exec, code.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
        }
        Ok(())
    }

    /// Make `[exec, exec + len)` coherent for instruction fetch.
    ///
    /// The range must lie inside the executable view; it is checked before any
    /// cache maintenance runs.
    pub fn invalidate(&self, exec: *const u8, len: usize) -> JitMemoryResult<()> {
        self.translator()?.check_executable_range(exec, len)?;
        unsafe { CacheSynchronizer::flush(exec, len) };
        Ok(())
    }

    /// Destroy the region (both views unmapped, backing released).
    ///
    /// Exclusive access guarantees no translation is in flight. Returns
    /// whether a region existed.
    pub fn shutdown(&mut self) -> bool {
        match self.region.take() {
            Some(region) => {
                RegionMapper::destroy(region);
                true
            }
            None => false,
        }
    }
}

impl Default for RegionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionManager")
            .field("region", &self.region.get())
            .finish()
    }
}
