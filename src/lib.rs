//! dualjit - Dual-Mapped Executable Memory for JIT Translators
//!
//! This library provides code memory for a dynamic binary translator running
//! on a host that never lets a page be writable and executable at the same
//! time, and that may only permit JIT after an external activation step.
//!
//! # Architecture
//!
//! The crate is built from the leaves up:
//!
//! 1. **Memory** (`memory` module)
//!    - `RegionMapper`: one shared memory object, mapped RW and RX
//!    - `AddressTranslator`: constant-offset arithmetic between the views
//!    - `CacheSynchronizer`: instruction cache invalidation after writes
//!    - `RegionManager`: single owner of the region, once-only initialization
//!    - `BumpAllocator`: lock-free cursor handing out disjoint ranges
//!
//! 2. **Activation** (`activation` module)
//!    - `ActivationStateMachine`: Disabled / Pending / Enabled / Error
//!    - `JitHost`: host permission query (debugger attach, always-on, manual)
//!
//! 3. **Runtime** (`runtime` module)
//!    - `JitRuntime`: the translator-facing surface tying both together
//!    - `ffi`: the same surface as a C ABI over one process-wide runtime
//!
//! # Example
//!
//! ```rust,no_run
//! use dualjit::{JitConfig, JitRuntime};
//!
//! let runtime = JitRuntime::new(JitConfig::immediate().with_region_size(1 << 20));
//! runtime.initialize().expect("JIT memory");
//!
//! let exec = runtime.allocate(16).unwrap();
//! let write = runtime.write_pointer_for(exec).unwrap();
//! unsafe { std::ptr::write_bytes(write, 0xC3, 16) };
//! runtime.invalidate(exec, 16).unwrap();
//! // `exec` now holds 16 bytes of code ready to run
//! ```
//!
//! # Error Handling
//!
//! Every failure is an explicit `JitMemoryError`. Only `InvalidAddress`
//! indicates a caller bug; all other variants mean "fall back to the
//! interpreter".

pub mod activation;
pub mod config;
pub mod error;
pub mod ffi;
pub mod memory;
pub mod runtime;

pub use activation::{
    ActivationState, ActivationStateMachine, GrantPolicy, HostJitStatus, JitHost, ManualHost,
    ProcessHost,
};
pub use config::{ActivationProfile, JitConfig};
pub use error::{JitMemoryError, JitMemoryResult};
pub use memory::{
    AddressTranslator, BumpAllocator, CacheSynchronizer, MappedRegion, RegionManager,
    RegionMapper, DEFAULT_REGION_SIZE,
};
pub use runtime::JitRuntime;
