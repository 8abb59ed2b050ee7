//! Copying between kernel buffers and user memory
//!
//! Accesses go through the TLB the way a user load or store would: a
//! missing translation raises a read or write fault, a store through a
//! translation without the dirty bit raises a read-only fault, and the
//! access is retried once the fault is resolved.

use core::cmp::min;

use tos_api::{Error, PhysAddr, Result, VirtAddr, PAGE_SIZE};

use crate::address_space::AddressSpaceId;
use crate::fault::FaultType;
use crate::frame_table::{FrameEntry, FrameState};
use crate::manager::VmManager;

/// Faults a single page access may take before giving up. A first store
/// to a code page needs three: the load, the refill, and the read-only
/// fault that reports the violation.
const MAX_FAULTS_PER_PAGE: usize = 4;

/// True while `entry` still holds `page` of `owner` in a state that allows
/// the access. A store needs a Dirty frame: a Clean one may be dropped at
/// eviction without being written back.
fn frame_still_maps(entry: &FrameEntry, owner: AddressSpaceId, page: VirtAddr, write: bool) -> bool {
    entry.owner == Some(owner) && entry.vaddr == page && (!write || entry.state == FrameState::Dirty)
}

impl VmManager {
    fn user_frame(&self, page: VirtAddr, write: bool) -> Result<PhysAddr> {
        for _ in 0..MAX_FAULTS_PER_PAGE {
            match self.tlb.lookup(page) {
                None => {
                    let fault = if write { FaultType::Write } else { FaultType::Read };
                    self.vm_fault(fault, page)?;
                }
                Some(entry) if write && !entry.is_writable() => {
                    self.vm_fault(FaultType::ReadOnly, page)?;
                }
                Some(entry) => return Ok(entry.frame),
            }
        }
        Err(Error::InvalidState("translation did not settle"))
    }

    fn access_user(
        &self,
        start: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut [u8], usize, usize),
    ) -> Result<()> {
        let current = self.current().ok_or(Error::NoAddressSpace)?;
        start
            .as_usize()
            .checked_add(len)
            .ok_or(Error::InvalidAddress(start))?;

        let mut done = 0;
        while done < len {
            let va = VirtAddr::new(start.as_usize() + done);
            let page = va.page_round_down();
            let offset = va.page_offset();
            let chunk = min(PAGE_SIZE - offset, len - done);

            let frame = self.user_frame(page, write)?;
            let mut core = self.core.lock();
            if !frame_still_maps(core.entry(frame.pfn()), current, page, write) {
                // evicted, or swapped back in clean, between translation and copy
                drop(core);
                self.tlb.invalidate(page);
                continue;
            }
            let bytes = core.frame_mut(frame.pfn());
            copy(&mut bytes[offset..offset + chunk], done, chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `dest.len()` bytes of user memory at `src` into `dest`
    pub fn copy_in(&self, src: VirtAddr, dest: &mut [u8]) -> Result<()> {
        self.access_user(src, dest.len(), false, |user, at, len| {
            dest[at..at + len].copy_from_slice(user);
        })
    }

    /// Copy `src` into user memory at `dest`
    pub fn copy_out(&self, src: &[u8], dest: VirtAddr) -> Result<()> {
        self.access_user(dest, src.len(), true, |user, at, len| {
            user.copy_from_slice(&src[at..at + len]);
        })
    }
}
