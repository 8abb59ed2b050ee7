//! Machine and policy configuration for the VM core
//!
//! Everything the core needs to know about the machine it runs on is
//! collected in one [`VmConfig`]. It is a plain `Copy` struct so that
//! presets can be `const` and a kernel can keep its configuration in a
//! static.
//!
//! ## Layout of the modelled machine
//!
//! 1. **Physical RAM** runs from 0 to `ram_last_paddr`. The kernel image
//!    occupies everything below `ram_first_paddr`; the frame table and
//!    swap table are placed right after it at bootstrap.
//! 2. **User space** is the low half of the 32-bit address space; the
//!    stack starts at `user_stack_top` and grows down.
//! 3. **Kernel space** starts at `kernel_base`, where physical memory is
//!    direct-mapped (`kvaddr = paddr + kernel_base`).

use tos_api::error::{config_error, Result};
use tos_api::{PhysAddr, VirtAddr, PAGE_SIZE};

/// VM configuration for a specific machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// First physical address not used by the kernel image
    pub ram_first_paddr: usize,

    /// One past the last usable physical address
    pub ram_last_paddr: usize,

    /// Number of page-sized slots in the swap store
    pub swap_slots: usize,

    /// Name of the raw block device used for swap
    pub swap_device: &'static str,

    /// Number of hardware TLB slots
    pub tlb_entries: usize,

    /// Initial stack pointer (exclusive top of the stack region)
    pub user_stack_top: usize,

    /// Largest size the stack may grow to (bytes)
    pub user_stack_max: usize,

    /// Largest size the heap may grow to (bytes)
    pub user_heap_max: usize,

    /// Start of the kernel direct-mapped segment
    pub kernel_base: usize,
}

impl VmConfig {
    /// System/161 defaults: 2MB of RAM, a 64-entry TLB and a 4MB swap disk
    pub const SYS161: VmConfig = VmConfig {
        ram_first_paddr: 0x0004_0000,
        ram_last_paddr: 0x0020_0000,
        swap_slots: 1024,
        swap_device: "lhd0raw:",
        tlb_entries: 64,
        user_stack_top: 0x8000_0000,
        user_stack_max: 0x0010_0000,
        user_heap_max: 0x0010_0000,
        kernel_base: 0x8000_0000,
    };

    /// A tiny machine with `frames` frames of RAM (one of them holding the
    /// kernel image) and `swap_slots` swap slots.
    pub const fn small(frames: usize, swap_slots: usize) -> Self {
        VmConfig {
            ram_first_paddr: PAGE_SIZE,
            ram_last_paddr: frames * PAGE_SIZE,
            swap_slots,
            swap_device: "lhd0raw:",
            tlb_entries: 8,
            user_stack_top: 0x8000_0000,
            user_stack_max: 0x0010_0000,
            user_heap_max: 0x0010_0000,
            kernel_base: 0x8000_0000,
        }
    }

    /// Total number of physical frames, including the kernel's
    #[inline]
    pub const fn total_frames(&self) -> usize {
        self.ram_last_paddr / PAGE_SIZE
    }

    /// Kernel virtual address of a physical address
    #[inline]
    pub const fn kvaddr(&self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::new(paddr.as_usize() + self.kernel_base)
    }

    /// Check if an address is in user space
    #[inline]
    pub const fn is_user_address(&self, addr: VirtAddr) -> bool {
        addr.as_usize() < self.kernel_base
    }

    /// Verify configuration consistency
    pub fn verify(&self) -> Result<()> {
        if self.ram_first_paddr >= self.ram_last_paddr {
            return Err(config_error("RAM range is empty"));
        }
        if self.ram_last_paddr % PAGE_SIZE != 0 {
            return Err(config_error("RAM size is not a multiple of the page size"));
        }
        if self.swap_slots == 0 {
            return Err(config_error("swap store has no slots"));
        }
        if self.tlb_entries == 0 {
            return Err(config_error("TLB has no entries"));
        }
        if self.user_stack_max < PAGE_SIZE {
            return Err(config_error("stack maximum is smaller than one page"));
        }
        if self.kernel_base % PAGE_SIZE != 0 || self.user_stack_top % PAGE_SIZE != 0 {
            return Err(config_error("stack top and kernel base must be page-aligned"));
        }
        if self.user_stack_top > self.kernel_base {
            return Err(config_error("user stack overlaps kernel space"));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::SYS161
    }
}
