//! TOS Memory Management
//!
//! Demand-paged virtual memory for the TOS teaching kernel. It includes
//! the physical frame table (core map) with FIFO replacement, the swap
//! store, two-level page tables, region descriptors and the page fault
//! handler that ties them to the hardware TLB.
//!
//! All state lives in one [`VmManager`], built once at boot:
//!
//! ```rust
//! use std::sync::Arc;
//! use tos_memory_management::{FaultType, RegionFlags, VmConfig, VmManager};
//! use tos_api::{MemoryImage, RamDisk, VirtAddr};
//!
//! let vm = VmManager::hosted(VmConfig::small(32, 64), RamDisk::new(64)).unwrap();
//! let image = MemoryImage::two_segment(VirtAddr::new(0x1000), &[0x90; 64], VirtAddr::new(0x2000), &[1; 8]);
//! let id = vm.as_create(Arc::new(image));
//! vm.as_define_region(id, VirtAddr::new(0x1000), 64, RegionFlags::READ | RegionFlags::EXEC).unwrap();
//! vm.as_define_region(id, VirtAddr::new(0x2000), 8, RegionFlags::READ | RegionFlags::WRITE).unwrap();
//! vm.as_define_stack(id).unwrap();
//! vm.as_activate(Some(id)).unwrap();
//!
//! vm.vm_fault(FaultType::Write, VirtAddr::new(0x7fff_fff0)).unwrap();
//! vm.copy_out(b"hello", VirtAddr::new(0x7fff_fff0)).unwrap();
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

use static_assertions::assert_impl_all;

// Memory management modules
pub mod address_space;
pub mod config;
pub mod fault;
pub mod frame_table;
pub mod manager;
pub mod page_table;
pub mod physical;
pub mod region;
pub mod stats;
pub mod swap;
pub mod tlb_sync;
mod user_access;

#[cfg(test)]
mod tests_prop;

// Re-export commonly used types
pub use address_space::{AddressSpace, AddressSpaceId};
pub use config::VmConfig;
pub use fault::FaultType;
pub use frame_table::{AllocKind, FrameEntry, FrameState};
pub use manager::VmManager;
pub use page_table::{PageTableEntry, Permission};
pub use region::{Region, RegionFlags, RegionKind, RegionSet};
pub use stats::VmStats;
pub use swap::SwapSlot;

assert_impl_all!(VmManager: Send, Sync);
