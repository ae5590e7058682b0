//! Instruction cache synchronization
//!
//! After code is stored through the writable view, the instruction-fetch
//! path may still hold stale lines for the executable view. [`CacheSynchronizer::flush`]
//! is a synchronous barrier: once it returns, a jump into the flushed range
//! observes exactly the bytes that were written.
//!
//! | Target                  | Mechanism                                        |
//! |-------------------------|--------------------------------------------------|
//! | Apple (any arch)        | `sys_icache_invalidate`                          |
//! | aarch64 (other)         | `dc cvau` / `dsb ish` / `ic ivau` / `dsb ish; isb` |
//! | arm Linux               | `cacheflush` syscall                             |
//! | x86 / x86_64 and others | full fence (coherent instruction cache)          |

use std::sync::atomic::{fence, Ordering};

use tracing::trace;

#[cfg(target_vendor = "apple")]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

/// Makes freshly written code visible to instruction fetch.
pub struct CacheSynchronizer;

impl CacheSynchronizer {
    /// Invalidate the instruction cache for `[exec, exec + len)`.
    ///
    /// # Safety
    /// The whole range must be mapped and readable (the executable view of a
    /// live region qualifies).
    #[inline]
    pub unsafe fn flush(exec: *const u8, len: usize) {
        trace!(target: "dualjit::icache", addr = ?exec, len, "flush");
        // Order the stores through the writable view before any maintenance.
        fence(Ordering::SeqCst);
        if len == 0 {
            return;
        }
        unsafe { invalidate(exec, len) };
    }
}

#[cfg(target_vendor = "apple")]
#[inline]
unsafe fn invalidate(exec: *const u8, len: usize) {
    unsafe { sys_icache_invalidate(exec as *mut libc::c_void, len) };
}

#[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
#[inline]
unsafe fn invalidate(exec: *const u8, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    unsafe {
        asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    }
    // CTR_EL0.DminLine / IminLine are log2 of the line size in words
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);

    let begin = exec as usize;
    let end = begin.saturating_add(len);

    let mut addr = begin & !(dline - 1);
    while addr < end {
        unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags)) };
        addr += dline;
    }
    unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };

    let mut addr = begin & !(iline - 1);
    while addr < end {
        unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags)) };
        addr += iline;
    }
    unsafe { asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
#[inline]
unsafe fn invalidate(exec: *const u8, len: usize) {
    const __ARM_NR_CACHEFLUSH: libc::c_long = 0x0f0002;
    let begin = exec as usize;
    unsafe {
        libc::syscall(__ARM_NR_CACHEFLUSH, begin, begin.saturating_add(len), 0);
    }
}

#[cfg(not(any(
    target_vendor = "apple",
    target_arch = "aarch64",
    all(target_arch = "arm", target_os = "linux")
)))]
#[inline]
unsafe fn invalidate(_exec: *const u8, _len: usize) {
    // Instruction fetch snoops the data cache here; the fence above already
    // ordered the stores.
    fence(Ordering::SeqCst);
}
