//! Address types and paging constants shared by every layer of the VM core
//!
//! The modelled machine has 32-bit virtual addresses split 10/10/12 into a
//! page-directory index, a page-table index and a page offset.

use static_assertions::const_assert;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;
/// Entries in the top-level page directory
pub const DIRECTORY_ENTRIES: usize = 1024;
/// Entries in each second-level page table
pub const TABLE_ENTRIES: usize = 1024;
/// Shift of the directory index inside a virtual address
pub const DIRECTORY_SHIFT: usize = 22;
/// Mask selecting the table-index bits of a virtual address
pub const TABLE_MASK: usize = 0x003f_f000;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(DIRECTORY_SHIFT == PAGE_SHIFT + 10);
const_assert!((TABLE_ENTRIES - 1) << PAGE_SHIFT == TABLE_MASK);
const_assert!(DIRECTORY_ENTRIES as u64 * TABLE_ENTRIES as u64 * PAGE_SIZE as u64 == 1 << 32);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Physical address to page frame number
#[inline]
pub const fn addr_to_pfn(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// Page frame number to physical address
#[inline]
pub const fn pfn_to_addr(pfn: usize) -> usize {
    pfn << PAGE_SHIFT
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Physical address of the first byte of frame `pfn`.
    pub const fn from_pfn(pfn: usize) -> Self {
        Self(pfn_to_addr(pfn))
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the frame number for this physical address.
    pub const fn pfn(self) -> usize {
        addr_to_pfn(self.0)
    }

    /// Checks if the physical address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Rebuilds the page address selected by a directory and table index.
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        Self((directory << DIRECTORY_SHIFT) | (table << PAGE_SHIFT))
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Index into the page directory
    pub const fn directory_index(self) -> usize {
        (self.0 >> DIRECTORY_SHIFT) & (DIRECTORY_ENTRIES - 1)
    }

    /// Index into the second-level page table
    pub const fn table_index(self) -> usize {
        (self.0 & TABLE_MASK) >> PAGE_SHIFT
    }

    /// Address `pages` pages above this one, or `None` on overflow.
    pub const fn checked_add_pages(self, pages: usize) -> Option<Self> {
        let Some(bytes) = pages.checked_mul(PAGE_SIZE) else {
            return None;
        };
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}
