//! TOS API - Shared types and service interfaces for the TOS virtual memory core
//!
//! This crate holds everything the VM core consumes but does not own: the
//! address types and paging constants, the error taxonomy, and the
//! contracts of the external services a fault may touch.
//!
//! # Architecture
//!
//! - **Types**: `VirtAddr`, `PhysAddr`, page constants and the two-level index split
//! - **Error**: the crate-wide `Error` and its recovery `ErrorCategory`
//! - **Block**: page-sized block I/O used by the swap store
//! - **Loader**: executable segment loading for first-touch faults
//! - **Tlb**: hardware TLB primitives
//! - **Sync**: spin locks and interrupt masking
//!
//! Each interface ships with an in-memory implementation (`RamDisk`,
//! `MemoryImage`, `SoftTlb`, `NoopInterrupts`) so the core can run hosted.
//!
//! # Usage
//!
//! ```rust
//! use tos_api::block::{BlockDevice, RamDisk};
//! use tos_api::PAGE_SIZE;
//!
//! let mut disk = RamDisk::new(16);
//! disk.write_block(3, &[0xab; PAGE_SIZE]).unwrap();
//! let mut page = [0u8; PAGE_SIZE];
//! disk.read_block(3, &mut page).unwrap();
//! assert_eq!(page[0], 0xab);
//! ```

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod block;
pub mod error;
pub mod loader;
pub mod sync;
pub mod tlb;
pub mod types;

// Re-export commonly used types
pub use crate::block::{BlockDevice, BlockDeviceProvider, RamDisk, RamDiskProvider};
pub use crate::error::{Error, ErrorCategory, IoErrorKind, Result};
pub use crate::loader::{MemoryImage, ProgramSegment, SegmentLoader, SegmentSlice};
pub use crate::sync::{InterruptControl, IrqGuard, NoopInterrupts};
pub use crate::tlb::{SoftTlb, Tlb, TlbEntry, TlbFlags};
pub use crate::types::*;
