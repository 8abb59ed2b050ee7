//! Two-level page table
//!
//! The top 10 bits of a virtual address index a 1024-entry directory, the
//! next 10 bits index a 1024-entry leaf table. Leaf tables are allocated
//! on demand; a page-table entry exists only for pages that have been
//! touched at least once.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use tos_api::{Error, PhysAddr, Result, VirtAddr, DIRECTORY_ENTRIES, TABLE_ENTRIES};

use crate::swap::SwapSlot;

/// Access rights of a mapped page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Loads only
    ReadOnly,
    /// Loads and stores
    Writeable,
}

impl Permission {
    /// True if stores are permitted
    pub const fn allows_write(self) -> bool {
        matches!(self, Permission::Writeable)
    }
}

/// Per-page mapping state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Backing frame; meaningful only when `valid`
    pub frame: PhysAddr,
    /// Rights derived from the page's region
    pub permission: Permission,
    /// True while the page is resident in `frame`
    pub valid: bool,
    /// Swap copy of the page, if one has ever been written
    pub swap_slot: Option<SwapSlot>,
}

impl PageTableEntry {
    /// A fresh entry: not resident, never swapped
    pub const fn empty(permission: Permission) -> Self {
        Self {
            frame: PhysAddr(0),
            permission,
            valid: false,
            swap_slot: None,
        }
    }

    /// Frame holding the page, if resident
    pub fn resident(&self) -> Option<PhysAddr> {
        self.valid.then_some(self.frame)
    }
}

type LeafTable = Vec<Option<PageTableEntry>>;

/// Per-address-space page table
pub struct PageTable {
    directory: Vec<Option<Box<LeafTable>>>,
    entries: usize,
}

impl PageTable {
    /// Empty page table
    pub fn new() -> Self {
        let mut directory = Vec::with_capacity(DIRECTORY_ENTRIES);
        directory.resize_with(DIRECTORY_ENTRIES, || None);
        Self { directory, entries: 0 }
    }

    /// Entry for the page containing `va`
    pub fn lookup(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        self.directory[va.directory_index()]
            .as_ref()?
            .get(va.table_index())?
            .as_ref()
    }

    /// Mutable entry for the page containing `va`
    pub fn lookup_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        self.directory[va.directory_index()]
            .as_mut()?
            .get_mut(va.table_index())?
            .as_mut()
    }

    /// Make sure the leaf table covering `va` exists.
    ///
    /// Fails with `OutOfMemory` if the leaf cannot be allocated.
    pub fn ensure_table(&mut self, va: VirtAddr) -> Result<()> {
        let slot = &mut self.directory[va.directory_index()];
        if slot.is_none() {
            let mut leaf: LeafTable = Vec::new();
            leaf.try_reserve_exact(TABLE_ENTRIES).map_err(|_| Error::OutOfMemory)?;
            leaf.resize(TABLE_ENTRIES, None);
            *slot = Some(Box::new(leaf));
        }
        Ok(())
    }

    /// Create the entry for the page containing `va` if it does not exist.
    ///
    /// A new entry is non-resident with no swap slot.
    pub fn create_entry(&mut self, va: VirtAddr, permission: Permission) -> Result<&mut PageTableEntry> {
        self.ensure_table(va)?;
        let leaf = self.directory[va.directory_index()]
            .as_mut()
            .ok_or(Error::InvalidState("leaf table missing"))?;
        let slot = &mut leaf[va.table_index()];
        if slot.is_none() {
            self.entries += 1;
        }
        Ok(slot.get_or_insert(PageTableEntry::empty(permission)))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries
    }

    /// True if no page has been touched
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of allocated leaf tables
    pub fn leaf_tables(&self) -> usize {
        self.directory.iter().filter(|l| l.is_some()).count()
    }

    /// Every `(page, entry)` pair in address order
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, &PageTableEntry)> + '_ {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(dir, leaf)| leaf.as_ref().map(|leaf| (dir, leaf)))
            .flat_map(|(dir, leaf)| {
                leaf.iter().enumerate().filter_map(move |(table, entry)| {
                    entry.as_ref().map(|e| (VirtAddr::from_indices(dir, table), e))
                })
            })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_before_and_after_create() {
        let mut pt = PageTable::new();
        let va = VirtAddr::new(0x0040_2abc);
        assert!(pt.lookup(va).is_none());

        let entry = pt.create_entry(va, Permission::Writeable).unwrap();
        assert!(!entry.valid);
        assert_eq!(entry.swap_slot, None);
        entry.frame = PhysAddr::new(0x7000);
        entry.valid = true;

        let found = pt.lookup(VirtAddr::new(0x0040_2000)).unwrap();
        assert_eq!(found.resident(), Some(PhysAddr::new(0x7000)));
        assert_eq!(pt.len(), 1);
        assert_eq!(pt.leaf_tables(), 1);
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut pt = PageTable::new();
        let va = VirtAddr::new(0x1000);
        pt.create_entry(va, Permission::ReadOnly).unwrap().valid = true;
        let again = pt.create_entry(va, Permission::Writeable).unwrap();
        assert!(again.valid);
        assert_eq!(again.permission, Permission::ReadOnly);
        assert_eq!(pt.len(), 1);
    }

    #[test]
    fn test_neighbouring_directories_are_separate() {
        let mut pt = PageTable::new();
        pt.create_entry(VirtAddr::new(0x003f_f000), Permission::Writeable).unwrap();
        pt.create_entry(VirtAddr::new(0x0040_0000), Permission::Writeable).unwrap();
        assert_eq!(pt.leaf_tables(), 2);

        let pages: Vec<usize> = pt.iter().map(|(va, _)| va.as_usize()).collect();
        assert_eq!(pages, [0x003f_f000, 0x0040_0000]);
    }
}
