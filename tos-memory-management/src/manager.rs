//! The VM context object
//!
//! `VmManager` owns every piece of global VM state: the address-space
//! registry, the core map, the swap store and the TLB. It is built once at
//! boot and passed by reference to whatever needs frames or faults
//! resolved.
//!
//! Locks are always taken in the order registry, core map, swap store,
//! TLB. Eviction needs all four: it writes the victim to swap, marks the
//! victim's page-table entry non-resident and invalidates its translation.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use log::{debug, info};
use tos_api::error::config_error;
use tos_api::sync::Mutex;
use tos_api::{
    BlockDeviceProvider, Error, InterruptControl, NoopInterrupts, PhysAddr, RamDisk, RamDiskProvider, Result,
    SegmentLoader, SoftTlb, Tlb, VirtAddr, PAGE_SIZE,
};

use crate::address_space::{AddressSpace, AddressSpaceId, SpaceRegistry};
use crate::config::VmConfig;
use crate::frame_table::{AllocKind, CoreMap, Evict, FrameEntry, FrameState};
use crate::page_table::PageTableEntry;
use crate::region::{RegionFlags, RegionSet};
use crate::stats::{VmCounters, VmStats};
use crate::swap::{SwapEntry, SwapStore};
use crate::tlb_sync::TlbSync;

/// Virtual memory manager
pub struct VmManager {
    pub(crate) config: VmConfig,
    pub(crate) spaces: Mutex<SpaceRegistry>,
    pub(crate) core: Mutex<CoreMap>,
    pub(crate) swap: Mutex<SwapStore>,
    pub(crate) tlb: TlbSync,
    pub(crate) counters: VmCounters,
}

/// Reclaims user frames on behalf of the core map
pub(crate) struct Evictor<'a> {
    pub(crate) spaces: &'a mut SpaceRegistry,
    pub(crate) swap: &'a mut SwapStore,
    pub(crate) tlb: &'a TlbSync,
    pub(crate) counters: &'a VmCounters,
}

impl Evict for Evictor<'_> {
    fn evict(&mut self, pfn: usize, entry: &FrameEntry, contents: &[u8]) -> Result<()> {
        let Some(owner) = entry.owner else {
            panic!("vm: frame {} in use without an owner", pfn);
        };
        let current = self.spaces.current();
        let Ok(space) = self.spaces.get_mut(owner) else {
            panic!("vm: frame {} owned by dead address space {:?}", pfn, owner);
        };
        let Some(pte) = space.page_table.lookup_mut(entry.vaddr) else {
            panic!("vm: frame {} maps {:#x} which has no page-table entry", pfn, entry.vaddr.as_usize());
        };
        assert!(
            pte.resident() == Some(PhysAddr::from_pfn(pfn)),
            "vm: page-table entry for {:#x} does not map frame {}",
            entry.vaddr.as_usize(),
            pfn
        );

        let slot = match entry.state {
            FrameState::Dirty => {
                let slot = self.swap.write_out(contents, owner, entry.vaddr)?;
                VmCounters::bump(&self.counters.swap_outs);
                slot
            }
            FrameState::Clean => match pte.swap_slot {
                Some(slot) => slot,
                None => panic!("vm: clean frame {} has no swap copy", pfn),
            },
            FrameState::Free | FrameState::Fixed => {
                panic!("vm: evicting {:?} frame {}", entry.state, pfn)
            }
        };

        pte.valid = false;
        pte.swap_slot = Some(slot);
        if current == Some(owner) {
            self.tlb.invalidate(entry.vaddr);
        }
        VmCounters::bump(&self.counters.evictions);
        debug!(
            "vm: {:?} va {:#x} evicted to slot {}",
            owner,
            entry.vaddr.as_usize(),
            slot.0
        );
        Ok(())
    }
}

impl VmManager {
    /// Bring up the VM system.
    ///
    /// The frame table and swap table are placed directly after the kernel
    /// image; every frame they cover becomes Fixed.
    pub fn bootstrap(
        config: VmConfig,
        provider: Box<dyn BlockDeviceProvider>,
        tlb: Box<dyn Tlb>,
        irq: Box<dyn InterruptControl>,
    ) -> Result<Self> {
        config.verify()?;

        let frames = config.total_frames();
        let metadata = frames * size_of::<FrameEntry>() + config.swap_slots * size_of::<Option<SwapEntry>>();
        let core = CoreMap::bootstrap(&config, metadata);
        if core.first_free() >= frames {
            return Err(config_error("VM metadata does not fit in RAM"));
        }

        let first_free_paddr = PhysAddr::from_pfn(core.first_free());
        info!(
            "vm: {} KiB available, {} frames, first free frame {} at {:#x}",
            (config.ram_last_paddr - first_free_paddr.as_usize()) / 1024,
            frames,
            core.first_free(),
            first_free_paddr.as_usize()
        );

        Ok(Self {
            config,
            spaces: Mutex::new(SpaceRegistry::new()),
            core: Mutex::new(core),
            swap: Mutex::new(SwapStore::new(config.swap_slots, config.swap_device, provider)),
            tlb: TlbSync::new(tlb, irq),
            counters: VmCounters::new(),
        })
    }

    /// VM system with a software TLB and `disk` as the swap device
    pub fn hosted(config: VmConfig, disk: RamDisk) -> Result<Self> {
        Self::bootstrap(
            config,
            Box::new(RamDiskProvider::new(config.swap_device, disk)),
            Box::new(SoftTlb::new(config.tlb_entries)),
            Box::new(NoopInterrupts::new()),
        )
    }

    /// Active configuration
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The TLB
    pub fn tlb(&self) -> &TlbSync {
        &self.tlb
    }

    /// Allocate `npages` contiguous kernel pages.
    ///
    /// Returns the direct-mapped kernel address of the first page.
    pub fn alloc_kpages(&self, npages: usize) -> Result<VirtAddr> {
        if npages == 0 {
            return Err(Error::InvalidArgument("zero-page kernel allocation"));
        }
        if npages > self.config.total_frames() {
            return Err(Error::InvalidArgument("kernel allocation larger than RAM"));
        }
        let mut spaces = self.spaces.lock();
        let mut core = self.core.lock();
        let mut swap = self.swap.lock();
        let mut evictor = Evictor {
            spaces: &mut *spaces,
            swap: &mut *swap,
            tlb: &self.tlb,
            counters: &self.counters,
        };
        let pfn = if npages == 1 {
            core.allocate(AllocKind::Kernel, None, VirtAddr::new(0), &mut evictor)?
        } else {
            core.allocate_run(npages, &mut evictor)?
        };
        Ok(self.config.kvaddr(PhysAddr::from_pfn(pfn)))
    }

    /// Free kernel pages returned by [`alloc_kpages`](Self::alloc_kpages).
    ///
    /// Boot-time memory and unknown addresses are ignored.
    pub fn free_kpages(&self, vaddr: VirtAddr) {
        self.core.lock().free_kernel_run(vaddr);
    }

    /// Create an empty address space for `program`
    pub fn as_create(&self, program: Arc<dyn SegmentLoader>) -> AddressSpaceId {
        let id = self.spaces.lock().insert(AddressSpace::new(program));
        debug!("vm: created {:?}", id);
        id
    }

    /// Define the next program region of `id`: code first, then data.
    ///
    /// Defining data also places an empty heap at its end.
    pub fn as_define_region(&self, id: AddressSpaceId, vaddr: VirtAddr, size: usize, flags: RegionFlags) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let kind = spaces.get_mut(id)?.regions.define(vaddr, size)?;
        debug!("vm: {:?} region of {:?} at {:#x} ({:?})", kind, id, vaddr.as_usize(), flags);
        Ok(())
    }

    /// Define the stack of `id` and return the initial stack pointer
    pub fn as_define_stack(&self, id: AddressSpaceId) -> Result<VirtAddr> {
        let top = VirtAddr::new(self.config.user_stack_top);
        self.spaces.lock().get_mut(id)?.regions.define_stack(top);
        Ok(top)
    }

    /// Called before a program is loaded; pages are loaded on demand
    pub fn as_prepare_load(&self, id: AddressSpaceId) -> Result<()> {
        self.spaces.lock().get(id).map(|_| ())
    }

    /// Called after a program is loaded
    pub fn as_complete_load(&self, id: AddressSpaceId) -> Result<()> {
        self.spaces.lock().get(id).map(|_| ())
    }

    /// Make `id` the active address space and flush the TLB
    pub fn as_activate(&self, id: Option<AddressSpaceId>) -> Result<()> {
        self.spaces.lock().set_current(id)?;
        self.tlb.flush();
        Ok(())
    }

    /// Active address space, if any
    pub fn current(&self) -> Option<AddressSpaceId> {
        self.spaces.lock().current()
    }

    /// Destroy `id`, returning its frames and swap slots
    pub fn as_destroy(&self, id: AddressSpaceId) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let mut core = self.core.lock();
        let mut swap = self.swap.lock();
        Self::teardown(&mut spaces, &mut core, &mut swap, &self.tlb, id)
    }

    fn teardown(
        spaces: &mut SpaceRegistry,
        core: &mut CoreMap,
        swap: &mut SwapStore,
        tlb: &TlbSync,
        id: AddressSpaceId,
    ) -> Result<()> {
        let was_current = spaces.current() == Some(id);
        let space = spaces.remove(id)?;
        let frames = core.free_all_owned(id);
        let slots = swap.release_owned(id);
        drop(space);
        if was_current {
            tlb.flush();
        }
        debug!("vm: destroyed {:?} ({} frames, {} swap slots)", id, frames, slots);
        Ok(())
    }

    /// Deep-copy `id` into a new address space.
    ///
    /// Every page of the parent gets its own frame in the child, filled
    /// from the parent's frame or swap slot.
    pub fn as_copy(&self, id: AddressSpaceId) -> Result<AddressSpaceId> {
        let mut spaces = self.spaces.lock();
        let mut core = self.core.lock();
        let mut swap = self.swap.lock();

        let parent = spaces.get(id)?;
        let regions = parent.regions;
        let program = Arc::clone(&parent.program);
        let pages: Vec<VirtAddr> = parent.page_table.iter().map(|(va, _)| va).collect();

        let mut child = AddressSpace::new(program);
        child.regions = regions;
        let child_id = spaces.insert(child);

        if let Err(err) = self.copy_pages(&mut spaces, &mut core, &mut swap, id, child_id, &pages) {
            Self::teardown(&mut spaces, &mut core, &mut swap, &self.tlb, child_id)?;
            return Err(err);
        }
        debug!("vm: copied {:?} into {:?} ({} pages)", id, child_id, pages.len());
        Ok(child_id)
    }

    fn copy_pages(
        &self,
        spaces: &mut SpaceRegistry,
        core: &mut CoreMap,
        swap: &mut SwapStore,
        parent: AddressSpaceId,
        child: AddressSpaceId,
        pages: &[VirtAddr],
    ) -> Result<()> {
        let mut staging = vec![0u8; PAGE_SIZE];
        for &va in pages {
            // earlier allocations may have evicted this page
            let Some(pte) = spaces.get(parent)?.page_table.lookup(va).copied() else {
                continue;
            };
            match (pte.resident(), pte.swap_slot) {
                (Some(frame), _) => staging.copy_from_slice(core.frame(frame.pfn())),
                (None, Some(slot)) => {
                    swap.read_in(slot, &mut staging)?;
                    VmCounters::bump(&self.counters.swap_ins);
                }
                (None, None) => continue,
            }

            spaces.get_mut(child)?.page_table.ensure_table(va)?;
            let pfn = {
                let mut evictor = Evictor {
                    spaces: &mut *spaces,
                    swap: &mut *swap,
                    tlb: &self.tlb,
                    counters: &self.counters,
                };
                core.allocate(AllocKind::User, Some(child), va, &mut evictor)?
            };
            core.frame_mut(pfn).copy_from_slice(&staging);

            let entry = spaces.get_mut(child)?.page_table.create_entry(va, pte.permission)?;
            entry.frame = PhysAddr::from_pfn(pfn);
            entry.valid = true;
        }
        Ok(())
    }

    /// Copy of the page-table entry for `vaddr` in `id`
    pub fn translate(&self, id: AddressSpaceId, vaddr: VirtAddr) -> Result<Option<PageTableEntry>> {
        Ok(self.spaces.lock().get(id)?.page_table.lookup(vaddr).copied())
    }

    /// Regions of `id`
    pub fn regions(&self, id: AddressSpaceId) -> Result<RegionSet> {
        Ok(self.spaces.lock().get(id)?.regions)
    }

    /// Number of pages of `id` that have a page-table entry
    pub fn page_count(&self, id: AddressSpaceId) -> Result<usize> {
        Ok(self.spaces.lock().get(id)?.page_table.len())
    }

    /// Frame table entry of frame `pfn`
    pub fn frame_entry(&self, pfn: usize) -> Option<FrameEntry> {
        let core = self.core.lock();
        (pfn < core.len()).then(|| *core.entry(pfn))
    }

    /// Owner and user address of frame `pfn`, if it holds a user page
    pub fn frame_owner(&self, pfn: usize) -> Option<(AddressSpaceId, VirtAddr)> {
        let entry = self.frame_entry(pfn)?;
        entry.owner.map(|owner| (owner, entry.vaddr))
    }

    /// Bytes of the resident page `vaddr` of `id`
    pub fn read_frame(&self, id: AddressSpaceId, vaddr: VirtAddr) -> Result<Option<Vec<u8>>> {
        let spaces = self.spaces.lock();
        let core = self.core.lock();
        let frame = spaces.get(id)?.page_table.lookup(vaddr).and_then(|pte| pte.resident());
        Ok(frame.map(|frame| core.frame(frame.pfn()).to_vec()))
    }

    /// Current frame, swap and fault statistics
    pub fn stats(&self) -> VmStats {
        let counts = self.core.lock().counts();
        let used_swap_slots = self.swap.lock().used_slots();
        let mut stats = VmStats {
            total_frames: counts.total(),
            free_frames: counts.free,
            fixed_frames: counts.fixed,
            clean_frames: counts.clean,
            dirty_frames: counts.dirty,
            used_swap_slots,
            tlb_replacements: self.tlb.replacements(),
            ..VmStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_api::MemoryImage;

    fn manager(frames: usize, slots: usize) -> VmManager {
        VmManager::hosted(VmConfig::small(frames, slots), RamDisk::new(slots as u64)).unwrap()
    }

    #[test]
    fn test_bootstrap_accounts_for_metadata() {
        let vm = VmManager::hosted(VmConfig::SYS161, RamDisk::new(1024)).unwrap();
        let stats = vm.stats();
        assert_eq!(stats.total_frames, 512);
        assert!(stats.fixed_frames > 0x40);
        assert_eq!(stats.free_frames + stats.fixed_frames, stats.total_frames);
    }

    #[test]
    fn test_bootstrap_rejects_bad_config() {
        let mut config = VmConfig::small(8, 8);
        config.tlb_entries = 0;
        assert!(matches!(
            VmManager::hosted(config, RamDisk::new(8)),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_kpages_round_trip() {
        let vm = manager(16, 8);
        let before = vm.stats().free_frames;
        let one = vm.alloc_kpages(1).unwrap();
        let run = vm.alloc_kpages(3).unwrap();
        assert!(one.as_usize() >= vm.config().kernel_base);
        assert_eq!(vm.stats().free_frames, before - 4);

        vm.free_kpages(run);
        vm.free_kpages(one);
        assert_eq!(vm.stats().free_frames, before);
        assert!(vm.alloc_kpages(0).is_err());
        assert_eq!(
            vm.alloc_kpages(usize::MAX),
            Err(Error::InvalidArgument("kernel allocation larger than RAM"))
        );
        assert_eq!(vm.stats().free_frames, before);
    }

    #[test]
    fn test_define_regions_and_stack() {
        let vm = manager(16, 8);
        let id = vm.as_create(Arc::new(MemoryImage::default()));
        vm.as_prepare_load(id).unwrap();
        vm.as_define_region(id, VirtAddr::new(0x40_0000), 0x1800, RegionFlags::READ | RegionFlags::EXEC)
            .unwrap();
        vm.as_define_region(id, VirtAddr::new(0x41_0000), 0x100, RegionFlags::READ | RegionFlags::WRITE)
            .unwrap();
        vm.as_complete_load(id).unwrap();
        let sp = vm.as_define_stack(id).unwrap();
        assert_eq!(sp, VirtAddr::new(0x8000_0000));

        let regions = vm.regions(id).unwrap();
        assert_eq!(regions.code.unwrap().top, VirtAddr::new(0x40_2000));
        assert_eq!(regions.heap.unwrap().base, VirtAddr::new(0x41_1000));
        assert!(regions.is_complete());
    }

    #[test]
    fn test_destroyed_space_is_stale() {
        let vm = manager(16, 8);
        let id = vm.as_create(Arc::new(MemoryImage::default()));
        vm.as_activate(Some(id)).unwrap();
        vm.as_destroy(id).unwrap();
        assert_eq!(vm.current(), None);
        assert_eq!(vm.as_destroy(id), Err(Error::StaleAddressSpace));
        assert_eq!(vm.as_activate(Some(id)), Err(Error::StaleAddressSpace));
        assert_eq!(vm.translate(id, VirtAddr::new(0x1000)), Err(Error::StaleAddressSpace));
    }
}
