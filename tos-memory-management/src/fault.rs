//! Page fault handler
//!
//! A fault is resolved in order: classify the address against the
//! regions of the current address space, check permissions, then bring
//! the page in. The page is in one of three states:
//!
//! 1. **Unmapped** - never touched. A zeroed frame is allocated and, for
//!    code and data, filled from the executable. Faults in the gap between
//!    heap and stack grow the corresponding region by one page.
//! 2. **Resident** - only the TLB entry is missing, or a store hit a
//!    read-only translation of a writeable page (the dirty-bit upgrade).
//! 3. **Swapped** - a frame is allocated and the page is read back from
//!    its swap slot. The frame starts Clean unless the fault is a store.
//!
//! The resolved translation is then written to the TLB and the faulting
//! instruction can be retried.

extern crate alloc;

use alloc::sync::Arc;

use log::{debug, trace};
use tos_api::{Error, PhysAddr, Result, SegmentLoader, TlbEntry, VirtAddr};

use crate::address_space::{AddressSpaceId, SpaceRegistry};
use crate::frame_table::{AllocKind, CoreMap, FrameState};
use crate::manager::{Evictor, VmManager};
use crate::page_table::{PageTableEntry, Permission};
use crate::region::{Classification, RegionKind};
use crate::stats::VmCounters;
use crate::swap::{SwapSlot, SwapStore};

/// Hardware fault codes
pub const VM_FAULT_READ: u32 = 0;
/// Store to a page with no translation
pub const VM_FAULT_WRITE: u32 = 1;
/// Store through a translation without the dirty bit
pub const VM_FAULT_READONLY: u32 = 2;

/// Kind of TLB fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Load with no translation
    Read,
    /// Store with no translation
    Write,
    /// Store through a read-only translation
    ReadOnly,
}

impl TryFrom<u32> for FaultType {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            VM_FAULT_READ => Ok(FaultType::Read),
            VM_FAULT_WRITE => Ok(FaultType::Write),
            VM_FAULT_READONLY => Ok(FaultType::ReadOnly),
            _ => Err(Error::InvalidArgument("unknown fault type")),
        }
    }
}

/// Copy the file-backed bytes of `page` into `frame`, which must be zeroed
fn load_page(program: &dyn SegmentLoader, page: VirtAddr, frame: &mut [u8]) -> Result<()> {
    let mut segments = program.segments()?;
    segments.sort_unstable_by_key(|s| s.vaddr);
    for segment in &segments {
        if let Some(slice) = segment.slice_for_page(page) {
            program.load_segment(
                slice.file_offset,
                &mut frame[slice.frame_offset..],
                slice.length_in_file,
                segment.executable,
            )?;
        }
    }
    Ok(())
}

impl VmManager {
    /// Resolve a TLB fault of type `fault_type` at `addr` in the current
    /// address space.
    ///
    /// `InvalidAddress`, `PermissionViolation` and `NoAddressSpace` mean
    /// the faulting process must be killed. Swap and I/O errors leave the
    /// page as it was.
    pub fn vm_fault(&self, fault_type: FaultType, addr: VirtAddr) -> Result<()> {
        VmCounters::bump(&self.counters.faults);
        let page = addr.page_round_down();

        let mut spaces = self.spaces.lock();
        let Some(id) = spaces.current() else {
            return Err(Error::NoAddressSpace);
        };
        if !self.config.is_user_address(page) {
            return Err(Error::InvalidAddress(page));
        }
        let mut core = self.core.lock();
        let mut swap = self.swap.lock();

        let result = self.resolve(&mut spaces, &mut core, &mut swap, id, fault_type, page);
        match &result {
            Ok(()) => trace!("vm: {:?} fault at {:#x} resolved", fault_type, addr.as_usize()),
            Err(err) => debug!("vm: {:?} fault at {:#x} failed: {}", fault_type, addr.as_usize(), err),
        }
        result
    }

    /// Resolve a fault given the raw hardware fault code
    pub fn vm_fault_code(&self, code: u32, addr: VirtAddr) -> Result<()> {
        self.vm_fault(FaultType::try_from(code)?, addr)
    }

    fn resolve(
        &self,
        spaces: &mut SpaceRegistry,
        core: &mut CoreMap,
        swap: &mut SwapStore,
        id: AddressSpaceId,
        fault_type: FaultType,
        page: VirtAddr,
    ) -> Result<()> {
        let space = spaces.get(id)?;
        let class = space.regions.classify(page)?;
        if fault_type == FaultType::ReadOnly && class.permission == Permission::ReadOnly {
            return Err(Error::PermissionViolation(page));
        }

        let existing = space.page_table.lookup(page).copied();
        match existing {
            Some(pte) if pte.valid => self.fault_resident(core, id, fault_type, page, class, pte),
            Some(PageTableEntry {
                swap_slot: Some(slot), ..
            }) => self.fault_swapped(spaces, core, swap, id, fault_type, page, class, slot),
            _ => self.fault_unmapped(spaces, core, swap, id, page, class),
        }
    }

    fn evictor<'a>(&'a self, spaces: &'a mut SpaceRegistry, swap: &'a mut SwapStore) -> Evictor<'a> {
        Evictor {
            spaces,
            swap,
            tlb: &self.tlb,
            counters: &self.counters,
        }
    }

    fn fault_unmapped(
        &self,
        spaces: &mut SpaceRegistry,
        core: &mut CoreMap,
        swap: &mut SwapStore,
        id: AddressSpaceId,
        page: VirtAddr,
        class: Classification,
    ) -> Result<()> {
        let space = spaces.get_mut(id)?;
        let growth = space.regions.plan_growth(class.kind, page, &self.config)?;
        space.page_table.ensure_table(page)?;
        let program = Arc::clone(&space.program);

        let pfn = core.allocate(AllocKind::User, Some(id), page, &mut self.evictor(spaces, swap))?;
        let frame = PhysAddr::from_pfn(pfn);

        let code = class.kind == RegionKind::Code;
        if code {
            // the loader writes through a temporarily writable mapping
            self.tlb.install(TlbEntry::new(page, frame, true));
        }
        if class.kind.is_file_backed() {
            if let Err(err) = load_page(program.as_ref(), page, core.frame_mut(pfn)) {
                if code {
                    self.tlb.invalidate(page);
                }
                core.free_frame(pfn);
                return Err(err);
            }
        }
        if code {
            // next access faults again and gets a read-only translation
            self.tlb.flush();
            debug!("vm: code page {:#x} loaded into frame {}", page.as_usize(), pfn);
        } else {
            self.tlb.install(TlbEntry::new(page, frame, class.permission.allows_write()));
        }

        let space = spaces.get_mut(id)?;
        let pte = space.page_table.create_entry(page, class.permission)?;
        pte.frame = frame;
        pte.valid = true;
        if let Some(growth) = growth {
            space.regions.apply_growth(growth);
        }
        Ok(())
    }

    fn fault_resident(
        &self,
        core: &mut CoreMap,
        id: AddressSpaceId,
        fault_type: FaultType,
        page: VirtAddr,
        class: Classification,
        pte: PageTableEntry,
    ) -> Result<()> {
        let pfn = pte.frame.pfn();
        let entry = *core.entry(pfn);
        assert!(
            entry.owner == Some(id) && entry.vaddr == page && entry.is_evictable(),
            "vm: resident page {:#x} of {:?} maps frame {} held by {:?}",
            page.as_usize(),
            id,
            pfn,
            entry
        );

        let writable = match (fault_type, class.permission) {
            (FaultType::ReadOnly | FaultType::Write, Permission::Writeable) => {
                if entry.state == FrameState::Clean {
                    core.mark_dirty(pfn);
                    trace!("vm: page {:#x} dirtied", page.as_usize());
                }
                true
            }
            (FaultType::Read, Permission::Writeable) => entry.state == FrameState::Dirty,
            (_, Permission::ReadOnly) => false,
        };
        self.tlb.install(TlbEntry::new(page, pte.frame, writable));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fault_swapped(
        &self,
        spaces: &mut SpaceRegistry,
        core: &mut CoreMap,
        swap: &mut SwapStore,
        id: AddressSpaceId,
        fault_type: FaultType,
        page: VirtAddr,
        class: Classification,
        slot: SwapSlot,
    ) -> Result<()> {
        let pfn = core.allocate(AllocKind::User, Some(id), page, &mut self.evictor(spaces, swap))?;
        if let Err(err) = swap.read_in(slot, core.frame_mut(pfn)) {
            core.free_frame(pfn);
            return Err(err);
        }
        VmCounters::bump(&self.counters.swap_ins);

        let writable = fault_type == FaultType::Write && class.permission.allows_write();
        if !writable {
            core.mark_clean(pfn);
        }

        let frame = PhysAddr::from_pfn(pfn);
        let pte = spaces
            .get_mut(id)?
            .page_table
            .lookup_mut(page)
            .ok_or(Error::InvalidState("swapped page lost its page-table entry"))?;
        pte.frame = frame;
        pte.valid = true;
        self.tlb.install(TlbEntry::new(page, frame, writable));
        debug!("vm: page {:#x} swapped in from slot {} to frame {}", page.as_usize(), slot.0, pfn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::region::RegionFlags;
    use alloc::vec;
    use tos_api::{MemoryImage, RamDisk, PAGE_SIZE};

    fn setup(frames: usize) -> (VmManager, AddressSpaceId) {
        let vm = VmManager::hosted(VmConfig::small(frames, 16), RamDisk::new(16)).unwrap();
        let image = MemoryImage::two_segment(
            VirtAddr::new(0x1000),
            &[0xc0u8; PAGE_SIZE],
            VirtAddr::new(0x2000),
            &[0xd0u8; 16],
        );
        let id = vm.as_create(Arc::new(image));
        vm.as_define_region(id, VirtAddr::new(0x1000), PAGE_SIZE, RegionFlags::READ | RegionFlags::EXEC)
            .unwrap();
        vm.as_define_region(id, VirtAddr::new(0x2000), 16, RegionFlags::READ | RegionFlags::WRITE)
            .unwrap();
        vm.as_define_stack(id).unwrap();
        vm.as_activate(Some(id)).unwrap();
        (vm, id)
    }

    #[test]
    fn test_fault_type_codes() {
        assert_eq!(FaultType::try_from(0), Ok(FaultType::Read));
        assert_eq!(FaultType::try_from(1), Ok(FaultType::Write));
        assert_eq!(FaultType::try_from(2), Ok(FaultType::ReadOnly));
        assert!(matches!(FaultType::try_from(3), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_no_current_space() {
        let vm = VmManager::hosted(VmConfig::small(8, 8), RamDisk::new(8)).unwrap();
        assert_eq!(vm.vm_fault(FaultType::Read, VirtAddr::new(0x1000)), Err(Error::NoAddressSpace));
    }

    #[test]
    fn test_data_page_loaded_from_image() {
        let (vm, id) = setup(8);
        vm.vm_fault(FaultType::Read, VirtAddr::new(0x2004)).unwrap();
        let bytes = vm.read_frame(id, VirtAddr::new(0x2000)).unwrap().unwrap();
        assert_eq!(&bytes[..16], &[0xd0u8; 16]);
        assert!(bytes[16..].iter().all(|&b| b == 0));
        assert!(vm.tlb().lookup(VirtAddr::new(0x2000)).unwrap().is_writable());
    }

    #[test]
    fn test_code_page_flushed_after_load() {
        let (vm, id) = setup(8);
        vm.vm_fault(FaultType::Read, VirtAddr::new(0x1000)).unwrap();
        assert!(vm.tlb().lookup(VirtAddr::new(0x1000)).is_none());
        let bytes = vm.read_frame(id, VirtAddr::new(0x1000)).unwrap().unwrap();
        assert!(bytes.iter().all(|&b| b == 0xc0));

        vm.vm_fault(FaultType::Read, VirtAddr::new(0x1000)).unwrap();
        assert!(!vm.tlb().lookup(VirtAddr::new(0x1000)).unwrap().is_writable());
    }

    #[test]
    fn test_outside_regions() {
        let (vm, _id) = setup(8);
        let va = VirtAddr::new(0x10_0000);
        assert_eq!(vm.vm_fault(FaultType::Read, va), Err(Error::InvalidAddress(va)));
        let kernel = VirtAddr::new(0x8000_1000);
        assert_eq!(vm.vm_fault(FaultType::Read, kernel), Err(Error::InvalidAddress(kernel)));
    }

    #[test]
    fn test_swapped_page_comes_back_clean() {
        // frames 0-1 hold the kernel and metadata, 2-3 are usable
        let (vm, id) = setup(4);
        let stack_page = VirtAddr::new(0x7fff_f000);
        vm.vm_fault(FaultType::Write, stack_page).unwrap();
        vm.vm_fault(FaultType::Write, VirtAddr::new(0x3000)).unwrap();
        vm.vm_fault(FaultType::Write, VirtAddr::new(0x4000)).unwrap();

        let pte = vm.translate(id, stack_page).unwrap().unwrap();
        assert!(!pte.valid);
        assert!(pte.swap_slot.is_some());

        vm.vm_fault(FaultType::Read, stack_page).unwrap();
        let pte = vm.translate(id, stack_page).unwrap().unwrap();
        assert!(pte.valid);
        let frame = vm.frame_entry(pte.frame.pfn()).unwrap();
        assert_eq!(frame.state, FrameState::Clean);
        assert!(!vm.tlb().lookup(stack_page).unwrap().is_writable());

        vm.vm_fault(FaultType::ReadOnly, stack_page).unwrap();
        assert_eq!(vm.frame_entry(pte.frame.pfn()).unwrap().state, FrameState::Dirty);
        assert!(vm.tlb().lookup(stack_page).unwrap().is_writable());
    }

    #[test]
    fn test_load_page_spanning_segments() {
        let file = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let segments = vec![
            tos_api::ProgramSegment {
                vaddr: VirtAddr::new(0x1ffc),
                mem_size: 4,
                file_offset: 0,
                file_size: 4,
                executable: true,
            },
            tos_api::ProgramSegment {
                vaddr: VirtAddr::new(0x2000),
                mem_size: 8,
                file_offset: 4,
                file_size: 4,
                executable: false,
            },
        ];
        let image = MemoryImage::new(file, segments);
        let mut frame = vec![0u8; PAGE_SIZE];
        load_page(&image, VirtAddr::new(0x1000), &mut frame).unwrap();
        assert_eq!(&frame[PAGE_SIZE - 4..], &[1, 2, 3, 4]);

        let mut frame = vec![0u8; PAGE_SIZE];
        load_page(&image, VirtAddr::new(0x2000), &mut frame).unwrap();
        assert_eq!(&frame[..8], &[5, 6, 7, 8, 0, 0, 0, 0]);
    }
}
