#![cfg(test)]
//! Property-based tests for the core map and swap path
//!
//! TEST_SCOPE:
//!   - Frame accounting over arbitrary allocate/free sequences
//!   - Fixed frames are never chosen as eviction victims
//!   - Pages written through user memory survive eviction and swap-in

use alloc::sync::Arc;
use alloc::vec::Vec;

use proptest::prelude::*;
use tos_api::{MemoryImage, RamDisk, Result, VirtAddr, PAGE_SIZE};

use crate::address_space::AddressSpaceId;
use crate::config::VmConfig;
use crate::frame_table::{AllocKind, CoreMap, Evict, FrameEntry, FrameState};
use crate::region::RegionFlags;
use crate::VmManager;

#[derive(Default)]
struct VictimLog {
    victims: Vec<(usize, FrameState)>,
}

impl Evict for VictimLog {
    fn evict(&mut self, pfn: usize, entry: &FrameEntry, _contents: &[u8]) -> Result<()> {
        self.victims.push((pfn, entry.state));
        Ok(())
    }
}

fn has_unfixed_run(core: &CoreMap, npages: usize) -> bool {
    (core.first_free()..core.len().saturating_sub(npages - 1))
        .any(|start| (start..start + npages).all(|pfn| core.entry(pfn).state != FrameState::Fixed))
}

#[derive(Debug, Clone)]
enum Op {
    User { owner: u32, page: usize },
    Kernel { npages: usize },
    FreeOwned { owner: u32 },
    FreeKernel,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..3, 0usize..64).prop_map(|(owner, page)| Op::User { owner, page }),
        1 => (1usize..3).prop_map(|npages| Op::Kernel { npages }),
        1 => (0u32..3).prop_map(|owner| Op::FreeOwned { owner }),
        1 => Just(Op::FreeKernel),
    ]
}

proptest! {
    #[test]
    fn frame_accounting_and_fixed_never_evicted(ops in proptest::collection::vec(arb_op(), 1..80)) {
        let mut core = CoreMap::bootstrap(&VmConfig::small(12, 8), 0);
        let total = core.len();
        let mut log = VictimLog::default();
        let mut kernel_runs: Vec<VirtAddr> = Vec::new();

        for op in ops {
            match op {
                Op::User { owner, page } => {
                    let owner = AddressSpaceId::from_raw(owner, 0);
                    let va = VirtAddr::new(page * PAGE_SIZE);
                    let pfn = core.allocate(AllocKind::User, Some(owner), va, &mut log).unwrap();
                    prop_assert_eq!(core.entry(pfn).state, FrameState::Dirty);
                }
                Op::Kernel { npages } => {
                    let counts = core.counts();
                    // leave room for user pages
                    if counts.free + counts.clean + counts.dirty < npages + 2 || !has_unfixed_run(&core, npages) {
                        continue;
                    }
                    let fixed_before: Vec<usize> = (0..total)
                        .filter(|&pfn| core.entry(pfn).state == FrameState::Fixed)
                        .collect();
                    let start = if npages == 1 {
                        core.allocate(AllocKind::Kernel, None, VirtAddr::new(0), &mut log).unwrap()
                    } else {
                        core.allocate_run(npages, &mut log).unwrap()
                    };
                    for pfn in start..start + npages {
                        prop_assert!(!fixed_before.contains(&pfn));
                    }
                    kernel_runs.push(core.entry(start).vaddr);
                }
                Op::FreeOwned { owner } => {
                    let owner = AddressSpaceId::from_raw(owner, 0);
                    core.free_all_owned(owner);
                    prop_assert_eq!(core.owned_by(owner).count(), 0);
                }
                Op::FreeKernel => {
                    if let Some(vaddr) = kernel_runs.pop() {
                        prop_assert!(core.free_kernel_run(vaddr) > 0);
                    }
                }
            }

            let counts = core.counts();
            prop_assert_eq!(counts.total(), total);
            let in_use = counts.fixed + counts.clean + counts.dirty;
            prop_assert_eq!(counts.free + in_use, total);
            for &(pfn, state) in &log.victims {
                prop_assert!(pfn >= core.first_free());
                prop_assert!(matches!(state, FrameState::Clean | FrameState::Dirty));
            }
        }

        // boot frames stay fixed whatever happened
        for pfn in 0..core.first_free() {
            prop_assert_eq!(core.entry(pfn).state, FrameState::Fixed);
        }
    }

    #[test]
    fn user_pages_survive_swapping(
        fills in proptest::collection::vec(any::<u8>(), 2..10),
        order in proptest::collection::vec(any::<prop::sample::Index>(), 1..20),
    ) {
        // four usable frames for up to nine heap pages
        let config = VmConfig::small(6, 32);
        let vm = VmManager::hosted(config, RamDisk::new(32)).unwrap();
        let image = MemoryImage::two_segment(VirtAddr::new(0x1000), &[0u8; 16], VirtAddr::new(0x2000), &[0u8; 16]);
        let id = vm.as_create(Arc::new(image));
        vm.as_define_region(id, VirtAddr::new(0x1000), 16, RegionFlags::READ | RegionFlags::EXEC).unwrap();
        vm.as_define_region(id, VirtAddr::new(0x2000), 16, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        vm.as_define_stack(id).unwrap();
        vm.as_activate(Some(id)).unwrap();

        let heap = 0x3000;
        for (i, &fill) in fills.iter().enumerate() {
            let page = [fill; PAGE_SIZE];
            vm.copy_out(&page, VirtAddr::new(heap + i * PAGE_SIZE)).unwrap();
        }

        for index in order {
            let i = index.index(fills.len());
            let mut page = [0u8; PAGE_SIZE];
            vm.copy_in(VirtAddr::new(heap + i * PAGE_SIZE), &mut page).unwrap();
            prop_assert!(page.iter().all(|&b| b == fills[i]));

            // rewrite it so the page is dirty again
            let fill = fills[i];
            vm.copy_out(&[fill; 8], VirtAddr::new(heap + i * PAGE_SIZE)).unwrap();
        }
    }
}
