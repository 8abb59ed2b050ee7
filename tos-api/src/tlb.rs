//! Hardware TLB primitives
//!
//! The modelled TLB is software-refilled and untagged: an entry maps one
//! virtual page to one frame, and carries a VALID bit and a DIRTY bit (the
//! hardware's write-enable). A store through an entry without DIRTY raises
//! a read-only fault.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::types::{PhysAddr, VirtAddr};

bitflags! {
    /// Low-word flags of a TLB entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u32 {
        /// Translation may be used
        const VALID = 0x0000_0200;
        /// Stores are permitted through this translation
        const DIRTY = 0x0000_0400;
    }
}

/// One translation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page (page-aligned)
    pub page: VirtAddr,
    /// Backing frame (page-aligned)
    pub frame: PhysAddr,
    /// Entry flags
    pub flags: TlbFlags,
}

impl TlbEntry {
    /// An empty slot
    pub const INVALID: TlbEntry = TlbEntry {
        page: VirtAddr(0),
        frame: PhysAddr(0),
        flags: TlbFlags::empty(),
    };

    /// Valid translation, writable when `writable` is set
    pub fn new(page: VirtAddr, frame: PhysAddr, writable: bool) -> Self {
        let mut flags = TlbFlags::VALID;
        if writable {
            flags |= TlbFlags::DIRTY;
        }
        Self { page, frame, flags }
    }

    /// True if the slot holds a usable translation
    pub fn is_valid(&self) -> bool {
        self.flags.contains(TlbFlags::VALID)
    }

    /// True if stores through this translation are allowed
    pub fn is_writable(&self) -> bool {
        self.flags.contains(TlbFlags::DIRTY)
    }
}

/// Per-processor translation lookaside buffer
///
/// Callers must keep interrupts disabled across any read-modify-write
/// sequence of these primitives.
pub trait Tlb: Send {
    /// Number of slots
    fn entries(&self) -> usize;

    /// Read slot `slot`
    fn read(&self, slot: usize) -> TlbEntry;

    /// Overwrite slot `slot`
    fn write(&mut self, slot: usize, entry: TlbEntry);

    /// Slot holding a valid translation for `page`, if any
    fn probe(&self, page: VirtAddr) -> Option<usize>;

    /// Slot chosen by the hardware replacement policy
    fn random_slot(&mut self) -> usize;
}

/// Software TLB model with a deterministic pseudo-random replacement policy
#[derive(Debug, Clone)]
pub struct SoftTlb {
    slots: Vec<TlbEntry>,
    seed: u64,
}

impl SoftTlb {
    /// Create a TLB with `entries` empty slots
    pub fn new(entries: usize) -> Self {
        Self::with_seed(entries, 0x9e37_79b9_7f4a_7c15)
    }

    /// Create a TLB whose replacement sequence starts from `seed`
    pub fn with_seed(entries: usize, seed: u64) -> Self {
        Self {
            slots: vec![TlbEntry::INVALID; entries],
            seed: seed | 1,
        }
    }

    /// Number of slots currently holding a valid translation
    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|e| e.is_valid()).count()
    }
}

impl Tlb for SoftTlb {
    fn entries(&self) -> usize {
        self.slots.len()
    }

    fn read(&self, slot: usize) -> TlbEntry {
        self.slots[slot]
    }

    fn write(&mut self, slot: usize, entry: TlbEntry) {
        self.slots[slot] = entry;
    }

    fn probe(&self, page: VirtAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|e| e.is_valid() && e.page == page)
    }

    fn random_slot(&mut self) -> usize {
        // xorshift64
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed = x;
        (x % self.slots.len() as u64) as usize
    }
}
