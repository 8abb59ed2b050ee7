//! Swap store
//!
//! A table of page-sized slots on a raw block device. Each slot is either
//! free or bound to the `(owner, vaddr)` of the page whose copy it holds.
//! A binding outlives swap-in: the page keeps its slot so a clean frame
//! can be dropped without another write, and a dirty one is rewritten in
//! place.
//!
//! The device is opened on first use, so bootstrap does not depend on
//! block drivers being up.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, info, warn};
use tos_api::{BlockDevice, BlockDeviceProvider, Error, Result, VirtAddr, PAGE_SIZE};

use crate::address_space::AddressSpaceId;

/// Index of a page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// Block number of the slot on the device
    pub const fn block(self) -> u64 {
        self.0 as u64
    }
}

/// Binding of an occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    /// Address space the page belongs to
    pub owner: AddressSpaceId,
    /// Page-aligned user address
    pub vaddr: VirtAddr,
}

/// Page-granular backing store
pub struct SwapStore {
    entries: Vec<Option<SwapEntry>>,
    usable: usize,
    device: Option<Box<dyn BlockDevice>>,
    provider: Box<dyn BlockDeviceProvider>,
    device_name: &'static str,
}

impl SwapStore {
    /// Create a store of `slots` slots on the device called `device_name`
    pub fn new(slots: usize, device_name: &'static str, provider: Box<dyn BlockDeviceProvider>) -> Self {
        Self {
            entries: vec![None; slots],
            usable: slots,
            device: None,
            provider,
            device_name,
        }
    }

    /// Number of slots that can hold pages
    pub fn capacity(&self) -> usize {
        self.usable
    }

    /// Number of occupied slots
    pub fn used_slots(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Binding of `slot`, if occupied
    pub fn entry(&self, slot: SwapSlot) -> Option<SwapEntry> {
        self.entries.get(slot.0).copied().flatten()
    }

    fn ensure_open(&mut self) -> Result<&mut Box<dyn BlockDevice>> {
        if self.device.is_none() {
            let device = self.provider.open(self.device_name).map_err(|err| {
                error!("swap: cannot open {}: {}", self.device_name, err);
                err
            })?;
            let blocks = usize::try_from(device.block_count()).unwrap_or(usize::MAX);
            if blocks < self.entries.len() {
                warn!(
                    "swap: {} has {} blocks, using {} of {} slots",
                    self.device_name,
                    blocks,
                    blocks,
                    self.entries.len()
                );
                self.usable = blocks;
            }
            info!("swap: opened {} ({} slots)", self.device_name, self.usable);
            self.device = Some(device);
        }
        self.device.as_mut().ok_or(Error::InvalidState("swap device not open"))
    }

    /// Slot already bound to `(owner, vaddr)`, if any
    pub fn find(&self, owner: AddressSpaceId, vaddr: VirtAddr) -> Option<SwapSlot> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(b) if b.owner == owner && b.vaddr == vaddr))
            .map(SwapSlot)
    }

    /// Write one page to swap on behalf of `(owner, vaddr)`.
    ///
    /// Reuses the slot already bound to that page, otherwise binds the
    /// first free slot. A slot bound by this call is released again if the
    /// write fails.
    pub fn write_out(&mut self, contents: &[u8], owner: AddressSpaceId, vaddr: VirtAddr) -> Result<SwapSlot> {
        debug_assert_eq!(contents.len(), PAGE_SIZE);
        self.ensure_open()?;

        let (slot, newly_bound) = match self.find(owner, vaddr) {
            Some(slot) => (slot, false),
            None => {
                let Some(index) = self.entries[..self.usable].iter().position(Option::is_none) else {
                    warn!("swap: no free slot for va {:#x}", vaddr.as_usize());
                    return Err(Error::SwapExhausted);
                };
                self.entries[index] = Some(SwapEntry { owner, vaddr });
                (SwapSlot(index), true)
            }
        };

        let device = self.ensure_open()?;
        if let Err(err) = device.write_block(slot.block(), contents) {
            error!("swap: write of slot {} failed: {}", slot.0, err);
            if newly_bound {
                self.entries[slot.0] = None;
            }
            return Err(err);
        }
        debug!("swap: va {:#x} written to slot {}", vaddr.as_usize(), slot.0);
        Ok(slot)
    }

    /// Read `slot` into `dest`. The binding is kept.
    pub fn read_in(&mut self, slot: SwapSlot, dest: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dest.len(), PAGE_SIZE);
        if self.entry(slot).is_none() {
            return Err(Error::InvalidState("swap slot not in use"));
        }
        let device = self.ensure_open()?;
        device.read_block(slot.block(), dest).map_err(|err| {
            error!("swap: read of slot {} failed: {}", slot.0, err);
            err
        })?;
        debug!("swap: slot {} read in", slot.0);
        Ok(())
    }

    /// Free every slot bound to `owner`. Returns the number freed.
    pub fn release_owned(&mut self, owner: AddressSpaceId) -> usize {
        let mut freed = 0;
        for entry in self.entries.iter_mut() {
            if matches!(entry, Some(b) if b.owner == owner) {
                *entry = None;
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_api::{IoErrorKind, RamDisk, RamDiskProvider};

    fn store(slots: usize, blocks: u64) -> (SwapStore, RamDisk) {
        let disk = RamDisk::new(blocks);
        let provider = RamDiskProvider::new("lhd0raw:", disk.clone());
        (SwapStore::new(slots, "lhd0raw:", Box::new(provider)), disk)
    }

    fn owner(index: u32) -> AddressSpaceId {
        AddressSpaceId::from_raw(index, 0)
    }

    #[test]
    fn test_write_then_read_page() {
        let (mut swap, disk) = store(4, 4);
        let page = vec![0x3cu8; PAGE_SIZE];
        let slot = swap.write_out(&page, owner(1), VirtAddr::new(0x5000)).unwrap();
        assert_eq!(slot, SwapSlot(0));
        assert_eq!(disk.written_blocks(), 1);

        let mut buf = vec![0u8; PAGE_SIZE];
        swap.read_in(slot, &mut buf).unwrap();
        assert_eq!(buf, page);
        // binding survives the read
        assert_eq!(swap.find(owner(1), VirtAddr::new(0x5000)), Some(slot));
    }

    #[test]
    fn test_rewrite_reuses_slot() {
        let (mut swap, _disk) = store(4, 4);
        let va = VirtAddr::new(0x5000);
        let first = swap.write_out(&vec![1u8; PAGE_SIZE], owner(1), va).unwrap();
        swap.write_out(&vec![2u8; PAGE_SIZE], owner(2), va).unwrap();
        let again = swap.write_out(&vec![3u8; PAGE_SIZE], owner(1), va).unwrap();
        assert_eq!(first, again);
        assert_eq!(swap.used_slots(), 2);

        let mut buf = vec![0u8; PAGE_SIZE];
        swap.read_in(first, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_exhaustion() {
        let (mut swap, _disk) = store(2, 2);
        let page = vec![0u8; PAGE_SIZE];
        swap.write_out(&page, owner(1), VirtAddr::new(0x1000)).unwrap();
        swap.write_out(&page, owner(1), VirtAddr::new(0x2000)).unwrap();
        assert_eq!(
            swap.write_out(&page, owner(1), VirtAddr::new(0x3000)),
            Err(Error::SwapExhausted)
        );
    }

    #[test]
    fn test_small_device_limits_slots() {
        let (mut swap, _disk) = store(8, 1);
        let page = vec![0u8; PAGE_SIZE];
        swap.write_out(&page, owner(1), VirtAddr::new(0x1000)).unwrap();
        assert_eq!(swap.capacity(), 1);
        assert_eq!(
            swap.write_out(&page, owner(1), VirtAddr::new(0x2000)),
            Err(Error::SwapExhausted)
        );
    }

    #[test]
    fn test_missing_device() {
        let provider = RamDiskProvider::new("lhd1raw:", RamDisk::new(4));
        let mut swap = SwapStore::new(4, "lhd0raw:", Box::new(provider));
        assert_eq!(
            swap.write_out(&vec![0u8; PAGE_SIZE], owner(1), VirtAddr::new(0x1000)),
            Err(Error::Io(IoErrorKind::NoDevice))
        );
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn test_release_owned() {
        let (mut swap, _disk) = store(4, 4);
        let page = vec![0u8; PAGE_SIZE];
        swap.write_out(&page, owner(1), VirtAddr::new(0x1000)).unwrap();
        swap.write_out(&page, owner(1), VirtAddr::new(0x2000)).unwrap();
        let kept = swap.write_out(&page, owner(2), VirtAddr::new(0x1000)).unwrap();

        assert_eq!(swap.release_owned(owner(1)), 2);
        assert_eq!(swap.used_slots(), 1);
        assert!(swap.entry(kept).is_some());

        assert_eq!(swap.release_owned(owner(2)), 1);
        assert_eq!(swap.used_slots(), 0);
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(swap.read_in(kept, &mut buf).is_err());
    }
}
