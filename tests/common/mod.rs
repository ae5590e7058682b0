//! Shared helpers for dualjit integration tests

use std::sync::{Arc, Once};

use dualjit::{JitConfig, JitRuntime, ManualHost};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (shown for failing tests).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

#[allow(dead_code)]
pub const MIB: usize = 1024 * 1024;

/// Deferred-profile runtime driven by a manual host
#[allow(dead_code)]
pub fn deferred_runtime(size: usize) -> (Arc<ManualHost>, JitRuntime) {
    init_tracing();
    let host = Arc::new(ManualHost::new());
    let runtime = JitRuntime::with_host(JitConfig::default().with_region_size(size), host.clone());
    (host, runtime)
}

/// Immediate-profile runtime, already initialized
#[allow(dead_code)]
pub fn immediate_runtime(size: usize) -> JitRuntime {
    init_tracing();
    let runtime = JitRuntime::with_host(
        JitConfig::immediate().with_region_size(size),
        Arc::new(ManualHost::new()),
    );
    runtime.initialize().expect("dual-mapped region");
    runtime
}

/// Machine code for a function returning 42, for hosts we can run on
#[allow(dead_code)]
pub fn return_42() -> Option<&'static [u8]> {
    if cfg!(target_arch = "x86_64") || cfg!(target_arch = "x86") {
        // mov eax, 42 ; ret
        Some(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
    } else if cfg!(target_arch = "aarch64") {
        // mov w0, #42 ; ret
        Some(&[0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6])
    } else {
        None
    }
}
