//! Frame table (core map)
//!
//! One entry per physical frame records who owns the frame, which virtual
//! page it currently backs, and its state. Victim selection is a linear
//! scan: the first Free frame wins, otherwise the non-Fixed frame with the
//! oldest allocation stamp is evicted (FIFO across the whole system).
//!
//! The table itself never touches page tables, swap or the TLB; eviction
//! side effects are delegated to an [`Evict`] implementation supplied by
//! the caller, which is how the manager keeps its lock order.

extern crate alloc;

use alloc::vec::Vec;

use log::debug;
use tos_api::{PhysAddr, Result, VirtAddr};

use crate::address_space::AddressSpaceId;
use crate::config::VmConfig;
use crate::physical::PhysicalMemory;

/// State of a physical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Unused
    Free,
    /// Permanently kernel-owned, never evicted
    Fixed,
    /// User data identical to its swap copy
    Clean,
    /// User data not yet backed by swap
    Dirty,
}

/// Who a frame is being allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Kernel page; becomes Fixed
    Kernel,
    /// User page; becomes Dirty and takes part in replacement
    User,
}

/// Frame table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Owning address space; `None` for free and kernel frames
    pub owner: Option<AddressSpaceId>,
    /// Virtual address mapped to this frame (meaningless if free)
    pub vaddr: VirtAddr,
    /// Current state
    pub state: FrameState,
    /// Allocation stamp; lower is older
    pub stamp: u64,
    /// Length of the kernel allocation starting at this frame
    pub run_length: usize,
}

impl FrameEntry {
    const FREE: FrameEntry = FrameEntry {
        owner: None,
        vaddr: VirtAddr(0),
        state: FrameState::Free,
        stamp: 0,
        run_length: 0,
    };

    /// True if the frame may be chosen for eviction
    pub fn is_evictable(&self) -> bool {
        matches!(self.state, FrameState::Clean | FrameState::Dirty)
    }
}

/// Side effects of reclaiming an occupied frame
pub trait Evict {
    /// Persist the frame if needed and unmap it from its owner.
    ///
    /// `entry` is the frame's entry before eviction; `contents` its bytes.
    /// Returning an error aborts the allocation with the frame untouched.
    fn evict(&mut self, pfn: usize, entry: &FrameEntry, contents: &[u8]) -> Result<()>;
}

/// Frame occupancy counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    /// Free frames
    pub free: usize,
    /// Fixed frames, including the kernel image
    pub fixed: usize,
    /// Clean user frames
    pub clean: usize,
    /// Dirty user frames
    pub dirty: usize,
}

impl FrameCounts {
    /// Frames in any state
    pub fn total(&self) -> usize {
        self.free + self.fixed + self.clean + self.dirty
    }
}

enum Victim {
    Free(usize),
    Occupied(usize),
}

/// Physical frame table together with the RAM it describes
pub struct CoreMap {
    entries: Vec<FrameEntry>,
    memory: PhysicalMemory,
    first_free: usize,
    next_stamp: u64,
    kernel_base: usize,
}

impl CoreMap {
    /// Build the core map for `config`, reserving `metadata_bytes` directly
    /// after the kernel image for the frame and swap tables.
    pub fn bootstrap(config: &VmConfig, metadata_bytes: usize) -> Self {
        let total = config.total_frames();
        let first_free = (config.ram_first_paddr + metadata_bytes).div_ceil(tos_api::PAGE_SIZE);

        let mut entries = Vec::with_capacity(total);
        for pfn in 0..total {
            if pfn < first_free {
                entries.push(FrameEntry {
                    owner: None,
                    vaddr: config.kvaddr(PhysAddr::from_pfn(pfn)),
                    state: FrameState::Fixed,
                    stamp: 0,
                    run_length: 0,
                });
            } else {
                entries.push(FrameEntry::FREE);
            }
        }

        Self {
            entries,
            memory: PhysicalMemory::new(total),
            first_free,
            next_stamp: 0,
            kernel_base: config.kernel_base,
        }
    }

    /// Total number of frames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the machine has no frames at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First frame not occupied by the kernel image or VM metadata
    pub fn first_free(&self) -> usize {
        self.first_free
    }

    /// Entry of frame `pfn`
    pub fn entry(&self, pfn: usize) -> &FrameEntry {
        &self.entries[pfn]
    }

    /// Bytes of frame `pfn`
    pub fn frame(&self, pfn: usize) -> &[u8] {
        self.memory.frame(pfn)
    }

    /// Mutable bytes of frame `pfn`
    pub fn frame_mut(&mut self, pfn: usize) -> &mut [u8] {
        self.memory.frame_mut(pfn)
    }

    /// Occupancy counts over every frame
    pub fn counts(&self) -> FrameCounts {
        let mut counts = FrameCounts::default();
        for entry in &self.entries {
            match entry.state {
                FrameState::Free => counts.free += 1,
                FrameState::Fixed => counts.fixed += 1,
                FrameState::Clean => counts.clean += 1,
                FrameState::Dirty => counts.dirty += 1,
            }
        }
        counts
    }

    /// Frames currently owned by `owner`
    pub fn owned_by(&self, owner: AddressSpaceId) -> impl Iterator<Item = (usize, &FrameEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.owner == Some(owner))
    }

    fn select_victim(&self) -> Victim {
        let mut oldest: Option<(usize, u64)> = None;
        for pfn in self.first_free..self.entries.len() {
            let entry = &self.entries[pfn];
            match entry.state {
                FrameState::Free => return Victim::Free(pfn),
                FrameState::Fixed => continue,
                FrameState::Clean | FrameState::Dirty => {
                    if oldest.is_none_or(|(_, stamp)| entry.stamp < stamp) {
                        oldest = Some((pfn, entry.stamp));
                    }
                }
            }
        }
        match oldest {
            Some((pfn, _)) => Victim::Occupied(pfn),
            None => panic!("vm: every frame is fixed, no memory for user pages"),
        }
    }

    fn reclaim(&mut self, pfn: usize, evictor: &mut dyn Evict) -> Result<()> {
        let entry = self.entries[pfn];
        assert!(entry.is_evictable(), "vm: frame {} chosen for eviction is {:?}", pfn, entry.state);
        debug!(
            "vm: evicting frame {} (va {:#x}, {:?}, stamp {})",
            pfn,
            entry.vaddr.as_usize(),
            entry.state,
            entry.stamp
        );
        evictor.evict(pfn, &entry, self.memory.frame(pfn))?;
        self.free_frame(pfn);
        Ok(())
    }

    /// Allocate one frame, evicting the oldest user frame if none is free.
    ///
    /// User frames are zero-filled, stamped and marked Dirty; kernel frames
    /// are marked Fixed. Fails only if eviction fails.
    pub fn allocate(
        &mut self,
        kind: AllocKind,
        owner: Option<AddressSpaceId>,
        vaddr: VirtAddr,
        evictor: &mut dyn Evict,
    ) -> Result<usize> {
        let pfn = match self.select_victim() {
            Victim::Free(pfn) => pfn,
            Victim::Occupied(pfn) => {
                self.reclaim(pfn, evictor)?;
                pfn
            }
        };

        let paddr = PhysAddr::from_pfn(pfn);
        let entry = &mut self.entries[pfn];
        match kind {
            AllocKind::Kernel => {
                *entry = FrameEntry {
                    owner: None,
                    vaddr: VirtAddr::new(paddr.as_usize() + self.kernel_base),
                    state: FrameState::Fixed,
                    stamp: 0,
                    run_length: 1,
                };
                debug!("vm: frame {} given to kernel", pfn);
            }
            AllocKind::User => {
                assert!(owner.is_some(), "vm: user frame allocated without an owner");
                *entry = FrameEntry {
                    owner,
                    vaddr,
                    state: FrameState::Dirty,
                    stamp: self.next_stamp,
                    run_length: 0,
                };
                self.next_stamp += 1;
                self.memory.zero_frame(pfn);
                debug!("vm: frame {} given to user va {:#x}", pfn, vaddr.as_usize());
            }
        }
        Ok(pfn)
    }

    /// Allocate `npages` physically contiguous Fixed frames for the kernel.
    ///
    /// Windows containing a Fixed frame are skipped; an all-free window is
    /// taken at once, otherwise the window with the smallest combined
    /// stamp is emptied by eviction.
    pub fn allocate_run(&mut self, npages: usize, evictor: &mut dyn Evict) -> Result<usize> {
        assert!(npages > 0);
        let total = self.entries.len();
        let mut chosen: Option<(usize, u64)> = None;
        let mut all_free = false;

        let mut start = self.first_free;
        while npages <= total.saturating_sub(start) {
            let window = &self.entries[start..start + npages];
            if window.iter().any(|e| e.state == FrameState::Fixed) {
                start += 1;
                continue;
            }
            if window.iter().all(|e| e.state == FrameState::Free) {
                chosen = Some((start, 0));
                all_free = true;
                break;
            }
            let combined: u64 = window
                .iter()
                .filter(|e| e.state != FrameState::Free)
                .map(|e| e.stamp)
                .sum();
            if chosen.is_none_or(|(_, best)| combined < best) {
                chosen = Some((start, combined));
            }
            start += 1;
        }

        let Some((start, _)) = chosen else {
            panic!("vm: no run of {} frames without a fixed frame", npages);
        };

        if !all_free {
            for pfn in start..start + npages {
                if self.entries[pfn].state != FrameState::Free {
                    self.reclaim(pfn, evictor)?;
                }
            }
        }

        for (i, pfn) in (start..start + npages).enumerate() {
            self.entries[pfn] = FrameEntry {
                owner: None,
                vaddr: VirtAddr::new(PhysAddr::from_pfn(pfn).as_usize() + self.kernel_base),
                state: FrameState::Fixed,
                stamp: 0,
                run_length: if i == 0 { npages } else { 0 },
            };
        }
        debug!("vm: {} contiguous frames at {} given to kernel", npages, start);
        Ok(start)
    }

    /// Return frame `pfn` to the Free state
    pub fn free_frame(&mut self, pfn: usize) {
        self.entries[pfn] = FrameEntry::FREE;
    }

    /// Free the kernel run that starts at kernel address `vaddr`.
    ///
    /// Boot-time memory and addresses that were never handed out are
    /// ignored. Returns the number of frames freed.
    pub fn free_kernel_run(&mut self, vaddr: VirtAddr) -> usize {
        let boot_end = PhysAddr::from_pfn(self.first_free).as_usize() + self.kernel_base;
        if vaddr.as_usize() < boot_end {
            return 0;
        }
        let Some(start) = (self.first_free..self.entries.len()).find(|&pfn| {
            let e = &self.entries[pfn];
            e.state == FrameState::Fixed && e.vaddr == vaddr && e.run_length > 0
        }) else {
            return 0;
        };
        let run = self.entries[start].run_length;
        for pfn in start..start + run {
            self.free_frame(pfn);
        }
        debug!("vm: freed {} kernel frames at {}", run, start);
        run
    }

    /// Free every user frame owned by `owner`. Returns the number freed.
    pub fn free_all_owned(&mut self, owner: AddressSpaceId) -> usize {
        let mut freed = 0;
        for pfn in self.first_free..self.entries.len() {
            let entry = &self.entries[pfn];
            if entry.owner == Some(owner)
                && entry.vaddr.as_usize() < self.kernel_base
                && entry.state != FrameState::Free
            {
                self.free_frame(pfn);
                freed += 1;
            }
        }
        freed
    }

    /// Mark a user frame as identical to its swap copy
    pub fn mark_clean(&mut self, pfn: usize) {
        let entry = &mut self.entries[pfn];
        assert!(entry.is_evictable(), "vm: marking {:?} frame {} clean", entry.state, pfn);
        entry.state = FrameState::Clean;
    }

    /// Mark a user frame as modified since its last swap write
    pub fn mark_dirty(&mut self, pfn: usize) {
        let entry = &mut self.entries[pfn];
        assert!(entry.is_evictable(), "vm: marking {:?} frame {} dirty", entry.state, pfn);
        entry.state = FrameState::Dirty;
    }
}
