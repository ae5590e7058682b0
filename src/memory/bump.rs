//! Bump allocation over the executable view
//!
//! A single monotonically increasing cursor hands out disjoint byte ranges.
//! Nothing is ever freed: translated blocks are discarded wholesale by
//! recreating the region, which also resets the cursor.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{trace, warn};

use super::manager::RegionManager;
use crate::error::{JitMemoryError, JitMemoryResult};

/// Allocation cursor: the next free byte offset within the region.
///
/// The cursor advances with a compare-and-swap loop, so concurrent callers
/// never receive overlapping ranges and the cursor never passes the region
/// size. Code already running at earlier addresses is unaffected.
#[derive(Debug, Default)]
pub struct BumpAllocator {
    offset: AtomicUsize,
}

impl BumpAllocator {
    pub const fn new() -> Self {
        BumpAllocator {
            offset: AtomicUsize::new(0),
        }
    }

    /// Reserve `len` bytes and return their executable-view address.
    #[inline]
    pub fn allocate(&self, manager: &RegionManager, len: usize) -> JitMemoryResult<*const u8> {
        self.allocate_aligned(manager, len, 1)
    }

    /// Reserve `len` bytes starting at a multiple of `align`.
    ///
    /// The region base is page aligned, so aligning the offset aligns the
    /// address for any `align` up to the page size. Padding skipped for
    /// alignment is never handed out.
    pub fn allocate_aligned(
        &self,
        manager: &RegionManager,
        len: usize,
        align: usize,
    ) -> JitMemoryResult<*const u8> {
        if len == 0 {
            return Err(JitMemoryError::InvalidSize(len));
        }
        if !align.is_power_of_two() {
            return Err(JitMemoryError::InvalidSize(align));
        }
        let (base, size) = match (manager.executable_base(), manager.size()) {
            (Some(base), Some(size)) => (base, size),
            _ => return Err(JitMemoryError::NotInitialized),
        };

        let mut start = 0;
        let advanced = self
            .offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                let aligned = offset.checked_add(align - 1)? & !(align - 1);
                let end = aligned.checked_add(len)?;
                if end > size {
                    return None;
                }
                start = aligned;
                Some(end)
            });

        match advanced {
            Ok(_) => {
                trace!(start, len, "bump allocation");
                Ok(base.wrapping_add(start))
            }
            Err(offset) => {
                // The cursor may be past a smaller region it was not advanced in
                let remaining = size.saturating_sub(offset);
                warn!(requested = len, remaining, "JIT region exhausted");
                Err(JitMemoryError::RegionExhausted {
                    requested: len,
                    remaining,
                })
            }
        }
    }

    /// Bytes consumed so far, alignment padding included
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    /// Bytes still available in `manager`'s region (0 when uninitialized)
    #[inline]
    pub fn remaining(&self, manager: &RegionManager) -> usize {
        manager.size().map_or(0, |size| size.saturating_sub(self.used()))
    }

    /// Rewind to offset 0. Only valid once the region has been recreated.
    pub fn reset(&mut self) {
        *self.offset.get_mut() = 0;
    }
}
