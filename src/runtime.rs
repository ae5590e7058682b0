//! Translator-facing JIT runtime
//!
//! [`JitRuntime`] bundles the region manager, the bump allocator and the
//! activation state machine behind the surface a translator uses:
//!
//! ```ignore
//! use dualjit::{JitConfig, JitRuntime};
//!
//! let runtime = JitRuntime::new(JitConfig::immediate());
//! runtime.initialize()?;
//!
//! if runtime.is_jit_enabled() {
//!     let entry = runtime.emit(&machine_code)?;   // allocate + write + flush
//!     // jump to `entry`
//! } else {
//!     // interpret
//! }
//! ```
//!
//! The order allocate -> write through the writable view -> invalidate ->
//! execute is never reordered for a given range.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::activation::{ActivationState, ActivationStateMachine, JitHost, ProcessHost};
use crate::config::{ActivationProfile, JitConfig};
use crate::error::JitMemoryResult;
use crate::memory::{BumpAllocator, RegionManager};

/// Executable code memory plus JIT permission tracking for one translator.
pub struct JitRuntime {
    config: JitConfig,
    manager: RegionManager,
    allocator: BumpAllocator,
    activation: ActivationStateMachine,
}

impl JitRuntime {
    /// Runtime that queries the real process environment
    pub fn new(config: JitConfig) -> Self {
        Self::with_host(config, Arc::new(ProcessHost::new()))
    }

    /// Runtime with a caller-provided host permission mechanism
    pub fn with_host(config: JitConfig, host: Arc<dyn JitHost>) -> Self {
        JitRuntime {
            config,
            manager: RegionManager::new(),
            allocator: BumpAllocator::new(),
            activation: ActivationStateMachine::new(host),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn manager(&self) -> &RegionManager {
        &self.manager
    }

    pub fn allocator(&self) -> &BumpAllocator {
        &self.allocator
    }

    pub fn activation(&self) -> &ActivationStateMachine {
        &self.activation
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Create the region using the configured size.
    pub fn initialize(&self) -> JitMemoryResult<()> {
        self.initialize_jit(self.config.region_size)
    }

    /// Create the region (once) and refresh the activation state.
    ///
    /// With [`ActivationProfile::Immediate`] a usable region means JIT is
    /// enabled. With [`ActivationProfile::Deferred`] the host is queried, so an
    /// enable request already issued to the host moves the state to `Pending`
    /// (and on to `Enabled` if granted). Without a request the state stays
    /// `Disabled`.
    pub fn initialize_jit(&self, size: usize) -> JitMemoryResult<()> {
        if let Err(err) = self.manager.initialize(size) {
            warn!(error = %err, "JIT memory unavailable; interpreter only");
            return Err(err);
        }
        match self.config.profile {
            ActivationProfile::Immediate => self.activation.notify_activated(),
            ActivationProfile::Deferred => {
                self.activation.check_status();
            }
        }
        Ok(())
    }

    /// Region exists (memory usable), regardless of activation
    #[inline]
    pub fn is_jit_available(&self) -> bool {
        self.manager.is_initialized()
    }

    /// Region exists and the host currently permits JIT
    #[inline]
    pub fn is_jit_enabled(&self) -> bool {
        self.manager.is_initialized() && self.activation.is_jit_enabled()
    }

    // =========================================================================
    // Code memory
    // =========================================================================

    /// Reserve `len` bytes of executable address space.
    #[inline]
    pub fn allocate(&self, len: usize) -> JitMemoryResult<*const u8> {
        self.allocator.allocate(&self.manager, len)
    }

    /// Reserve `len` bytes starting at a multiple of `align`.
    #[inline]
    pub fn allocate_aligned(&self, len: usize, align: usize) -> JitMemoryResult<*const u8> {
        self.allocator.allocate_aligned(&self.manager, len, align)
    }

    /// Writable counterpart of an executable address
    #[inline]
    pub fn write_pointer_for(&self, exec: *const u8) -> JitMemoryResult<*mut u8> {
        self.manager.write_pointer_for(exec)
    }

    /// Executable view base, `None` when JIT memory is unavailable
    #[inline]
    pub fn executable_base(&self) -> Option<*const u8> {
        self.manager.executable_base()
    }

    /// Flush `[exec, exec + len)` for instruction fetch.
    #[inline]
    pub fn invalidate(&self, exec: *const u8, len: usize) -> JitMemoryResult<()> {
        self.manager.invalidate(exec, len)
    }

    /// Allocate, copy `code` through the writable view, flush, and return the
    /// executable address of the first byte.
    pub fn emit(&self, code: &[u8]) -> JitMemoryResult<*const u8> {
        self.emit_aligned(code, 1)
    }

    /// [`JitRuntime::emit`] with an alignment for the first byte.
    pub fn emit_aligned(&self, code: &[u8], align: usize) -> JitMemoryResult<*const u8> {
        let exec = self.allocate_aligned(code.len(), align)?;
        // Freshly allocated: no other caller can hold this range.
        unsafe { self.manager.write(exec, code)? };
        self.manager.invalidate(exec, code.len())?;
        Ok(exec)
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.allocator.used()
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.allocator.remaining(&self.manager)
    }

    /// Discard every emitted block: destroy the region, create a fresh one of
    /// the same size and rewind the cursor.
    ///
    /// Addresses handed out before this call must not be used afterwards.
    pub fn recreate(&mut self) -> JitMemoryResult<()> {
        let size = self.manager.size().unwrap_or(self.config.region_size);
        self.manager.shutdown();
        self.allocator.reset();
        debug!(size, "recreating JIT region");
        self.manager.initialize(size)
    }

    /// Destroy the region. JIT memory stays unavailable until re-initialized.
    pub fn shutdown(&mut self) {
        if self.manager.shutdown() {
            self.allocator.reset();
        }
    }

    // =========================================================================
    // Activation
    // =========================================================================

    #[inline]
    pub fn activation_state(&self) -> ActivationState {
        self.activation.state()
    }

    /// Ask the host to enable JIT.
    pub fn request_activation(&self) -> bool {
        self.activation.request_activation()
    }

    /// Re-query the host.
    pub fn check_status(&self) -> ActivationState {
        self.activation.check_status()
    }

    /// Block until JIT is enabled or has failed, bounded by `timeout`.
    pub fn wait_for_activation(&self, timeout: Option<Duration>) -> JitMemoryResult<ActivationState> {
        self.activation.wait_for_activation(timeout)
    }

    /// [`JitRuntime::wait_for_activation`] bounded by the configured timeout
    pub fn wait_for_activation_default(&self) -> JitMemoryResult<ActivationState> {
        self.activation
            .wait_for_activation(self.config.activation_timeout())
    }

    /// Out-of-band grant from the activation controller.
    pub fn notify_activated(&self) {
        self.activation.notify_activated()
    }
}

impl std::fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRuntime")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("used", &self.allocator.used())
            .field("activation", &self.activation.state())
            .finish()
    }
}
