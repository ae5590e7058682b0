//! C ABI for translators written in other languages
//!
//! All functions operate on one process-wide [`JitRuntime`] configured from
//! the `DUALJIT_*` environment variables. Failures are reported as `NULL`,
//! `false` or a status code; the error itself is logged.

use std::sync::LazyLock;
use std::time::Duration;

use tracing::warn;

use crate::activation::ActivationState;
use crate::config::JitConfig;
use crate::error::{JitMemoryError, JitMemoryResult};
use crate::runtime::JitRuntime;

/// Returned by [`dualjit_wait_for_activation`] when the wait elapsed before
/// JIT was enabled or failed.
pub const DUALJIT_WAIT_TIMED_OUT: u8 = 0xFF;

static RUNTIME: LazyLock<JitRuntime> = LazyLock::new(|| {
    let config = JitConfig::default()
        .with_env_overrides()
        .unwrap_or_else(|err| {
            warn!(error = %err, "ignoring invalid DUALJIT_* overrides");
            JitConfig::default()
        });
    JitRuntime::new(config)
});

fn report(operation: &'static str, err: &JitMemoryError) {
    if err.is_programming_error() {
        warn!(operation, error = %err, "invalid address passed across FFI");
    } else {
        warn!(operation, error = %err, "JIT memory operation failed");
    }
}

/// Create the JIT region. `size == 0` uses the configured size.
///
/// Returns whether JIT memory is usable. Repeated calls return the cached
/// result of the first success.
#[no_mangle]
pub extern "C" fn dualjit_initialize(size: usize) -> bool {
    let result = if size == 0 {
        RUNTIME.initialize()
    } else {
        RUNTIME.initialize_jit(size)
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            report("initialize", &err);
            false
        }
    }
}

/// Region exists and the host permits JIT
#[no_mangle]
pub extern "C" fn dualjit_is_enabled() -> bool {
    RUNTIME.is_jit_enabled()
}

/// Region exists, regardless of activation
#[no_mangle]
pub extern "C" fn dualjit_is_available() -> bool {
    RUNTIME.is_jit_available()
}

/// Reserve `len` bytes; returns the executable address or `NULL`.
#[no_mangle]
pub extern "C" fn dualjit_allocate(len: usize) -> *mut u8 {
    match RUNTIME.allocate(len) {
        Ok(exec) => exec as *mut u8,
        Err(err) => {
            report("allocate", &err);
            std::ptr::null_mut()
        }
    }
}

/// Writable counterpart of an executable address, or `NULL`.
#[no_mangle]
pub extern "C" fn dualjit_write_pointer_for(exec: *const u8) -> *mut u8 {
    match RUNTIME.write_pointer_for(exec) {
        Ok(write) => write,
        Err(err) => {
            report("write_pointer_for", &err);
            std::ptr::null_mut()
        }
    }
}

/// Executable view base, or `NULL` when JIT memory is unavailable.
#[no_mangle]
pub extern "C" fn dualjit_executable_base() -> *const u8 {
    RUNTIME.executable_base().unwrap_or(std::ptr::null())
}

/// Flush `[exec, exec + len)` for instruction fetch.
#[no_mangle]
pub extern "C" fn dualjit_invalidate(exec: *const u8, len: usize) -> bool {
    match RUNTIME.invalidate(exec, len) {
        Ok(()) => true,
        Err(err) => {
            report("invalidate", &err);
            false
        }
    }
}

/// Ask the host to enable JIT.
#[no_mangle]
pub extern "C" fn dualjit_request_activation() -> bool {
    RUNTIME.request_activation()
}

/// Re-query the host; returns the state as `0..=3`
/// (disabled, pending, enabled, error).
#[no_mangle]
pub extern "C" fn dualjit_check_status() -> u8 {
    RUNTIME.check_status() as u8
}

/// Wait for activation. A negative `timeout_ms` waits without bound.
///
/// Returns the reached state code (as [`dualjit_check_status`]): `2` when JIT
/// is enabled, `3` when it failed. Returns [`DUALJIT_WAIT_TIMED_OUT`] when the
/// host has not answered yet and the caller may retry later.
#[no_mangle]
pub extern "C" fn dualjit_wait_for_activation(timeout_ms: i64) -> u8 {
    let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
    wait_code(RUNTIME.wait_for_activation(timeout))
}

fn wait_code(result: JitMemoryResult<ActivationState>) -> u8 {
    match result {
        Ok(state) => state as u8,
        Err(JitMemoryError::ActivationTimeout { .. }) => DUALJIT_WAIT_TIMED_OUT,
        Err(err) => {
            report("wait_for_activation", &err);
            ActivationState::Error as u8
        }
    }
}

/// Out-of-band grant from the activation controller.
#[no_mangle]
pub extern "C" fn dualjit_notify_activated() {
    RUNTIME.notify_activated()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_ffi_initialize_and_allocate() {
        assert!(dualjit_initialize(0));
        assert!(dualjit_is_available());
        assert!(!dualjit_executable_base().is_null());

        let exec = dualjit_allocate(32);
        assert!(!exec.is_null());
        let write = dualjit_write_pointer_for(exec);
        assert!(!write.is_null());
        assert_ne!(write as usize, exec as usize);

        unsafe { std::ptr::write_bytes(write, 0xAB, 32) };
        assert!(dualjit_invalidate(exec, 32));
        let seen = unsafe { std::slice::from_raw_parts(exec as *const u8, 32) };
        assert!(seen.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_ffi_rejects_foreign_pointer() {
        assert!(dualjit_initialize(0));
        let local = 0u8;
        assert!(dualjit_write_pointer_for(&local).is_null());
        assert!(!dualjit_invalidate(&local, 1));
    }

    #[test]
    fn test_ffi_zero_allocation_is_null() {
        assert!(dualjit_initialize(0));
        assert!(dualjit_allocate(0).is_null());
    }

    #[test]
    fn test_ffi_activation() {
        assert!(dualjit_request_activation() || dualjit_check_status() == 2);
        dualjit_notify_activated();
        assert_eq!(dualjit_check_status(), ActivationState::Enabled as u8);
        assert_eq!(dualjit_wait_for_activation(0), ActivationState::Enabled as u8);
        assert!(dualjit_initialize(0));
        assert!(dualjit_is_enabled());
    }

    #[test]
    fn test_wait_codes_distinguish_timeout_from_failure() {
        let timed_out = wait_code(Err(JitMemoryError::ActivationTimeout {
            waited: Duration::ZERO,
        }));
        assert_eq!(timed_out, DUALJIT_WAIT_TIMED_OUT);
        assert_eq!(wait_code(Ok(ActivationState::Error)), ActivationState::Error as u8);
        assert_eq!(wait_code(Ok(ActivationState::Enabled)), ActivationState::Enabled as u8);
        assert_ne!(timed_out, ActivationState::Error as u8);
        assert_ne!(timed_out, ActivationState::Pending as u8);
    }
}
