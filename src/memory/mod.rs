//! Dual-Mapped Executable Memory
//!
//! Code memory for hosts that never allow a page to be writable and executable
//! at the same time. One shared memory object is mapped twice:
//!
//! ```text
//! ┌──────────────┐  allocate(len)   ┌──────────────────┐
//! │  Translator  │ ───────────────> │  BumpAllocator   │ ── exec addr A
//! └──────────────┘                  └──────────────────┘
//!        │ write_pointer_for(A)     ┌──────────────────┐
//!        └────────────────────────> │  RegionManager   │ ── write addr W
//!                                   │  ├ MappedRegion  │
//!        store code at W            │  ├ translate     │
//!        invalidate(A, len) ──────> │  └ icache flush  │
//!        jump to A                  └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`region`]: shared memory object + RW/RX mappings
//! - [`translate`]: constant-offset translation between the views
//! - [`icache`]: instruction cache synchronization
//! - [`manager`]: single owner of the region, once-only initialization
//! - [`bump`]: lock-free bump cursor over the executable view

pub mod bump;
pub mod icache;
pub mod manager;
pub mod region;
pub mod translate;

pub use bump::BumpAllocator;
pub use icache::CacheSynchronizer;
pub use manager::RegionManager;
pub use region::{page_size, BackingHandle, MappedRegion, RegionMapper};
pub use translate::AddressTranslator;

/// Default region size: 64 MiB
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024 * 1024;
