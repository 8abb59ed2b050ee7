//! TLB synchronization
//!
//! The TLB is per-processor hardware state, so every access sequence runs
//! with interrupts disabled as well as under the TLB lock.

extern crate alloc;

use alloc::boxed::Box;

use log::trace;
use tos_api::sync::{AtomicU64, Mutex, Ordering};
use tos_api::{InterruptControl, IrqGuard, Tlb, TlbEntry, VirtAddr};

/// Serialized access to the hardware TLB
pub struct TlbSync {
    tlb: Mutex<Box<dyn Tlb>>,
    irq: Box<dyn InterruptControl>,
    replacements: AtomicU64,
}

impl TlbSync {
    /// Wrap `tlb`, masking interrupts through `irq`
    pub fn new(tlb: Box<dyn Tlb>, irq: Box<dyn InterruptControl>) -> Self {
        Self {
            tlb: Mutex::new(tlb),
            irq,
            replacements: AtomicU64::new(0),
        }
    }

    /// Remove the translation of `page`, if present
    pub fn invalidate(&self, page: VirtAddr) {
        let _irq = IrqGuard::new(self.irq.as_ref());
        let mut tlb = self.tlb.lock();
        if let Some(slot) = tlb.probe(page) {
            tlb.write(slot, TlbEntry::INVALID);
            trace!("tlb: invalidated {:#x} in slot {}", page.as_usize(), slot);
        }
    }

    /// Install `entry`, replacing any stale translation of the same page.
    ///
    /// Prefers an empty slot; otherwise the hardware picks a victim.
    pub fn install(&self, entry: TlbEntry) {
        let _irq = IrqGuard::new(self.irq.as_ref());
        let mut tlb = self.tlb.lock();
        let slot = match tlb.probe(entry.page) {
            Some(slot) => slot,
            None => match (0..tlb.entries()).find(|&i| !tlb.read(i).is_valid()) {
                Some(slot) => slot,
                None => {
                    self.replacements.fetch_add(1, Ordering::Relaxed);
                    tlb.random_slot()
                }
            },
        };
        tlb.write(slot, entry);
        trace!(
            "tlb: {:#x} -> {:#x} in slot {} ({:?})",
            entry.page.as_usize(),
            entry.frame.as_usize(),
            slot,
            entry.flags
        );
    }

    /// Invalidate every slot
    pub fn flush(&self) {
        let _irq = IrqGuard::new(self.irq.as_ref());
        let mut tlb = self.tlb.lock();
        for slot in 0..tlb.entries() {
            tlb.write(slot, TlbEntry::INVALID);
        }
        trace!("tlb: flushed");
    }

    /// Valid translation of `page`, if cached
    pub fn lookup(&self, page: VirtAddr) -> Option<TlbEntry> {
        let _irq = IrqGuard::new(self.irq.as_ref());
        let tlb = self.tlb.lock();
        tlb.probe(page).map(|slot| tlb.read(slot))
    }

    /// Number of valid translations
    pub fn valid_entries(&self) -> usize {
        let _irq = IrqGuard::new(self.irq.as_ref());
        let tlb = self.tlb.lock();
        (0..tlb.entries()).filter(|&i| tlb.read(i).is_valid()).count()
    }

    /// Installs that had to evict a valid translation
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_api::{NoopInterrupts, PhysAddr, SoftTlb};

    fn sync(entries: usize) -> TlbSync {
        TlbSync::new(Box::new(SoftTlb::new(entries)), Box::new(NoopInterrupts::new()))
    }

    fn entry(page: usize, writable: bool) -> TlbEntry {
        TlbEntry::new(VirtAddr::new(page), PhysAddr::new(0x10_0000 + page), writable)
    }

    #[test]
    fn test_invalidate_absent_is_noop() {
        let tlb = sync(4);
        tlb.install(entry(0x1000, false));
        tlb.invalidate(VirtAddr::new(0x2000));
        tlb.invalidate(VirtAddr::new(0x2000));
        assert_eq!(tlb.valid_entries(), 1);
        assert!(tlb.lookup(VirtAddr::new(0x1000)).is_some());
    }

    #[test]
    fn test_install_overwrites_same_page() {
        let tlb = sync(4);
        tlb.install(entry(0x1000, false));
        tlb.install(entry(0x1000, true));
        assert_eq!(tlb.valid_entries(), 1);
        assert!(tlb.lookup(VirtAddr::new(0x1000)).unwrap().is_writable());
    }

    #[test]
    fn test_install_prefers_empty_slots() {
        let tlb = sync(2);
        tlb.install(entry(0x1000, false));
        tlb.install(entry(0x2000, false));
        assert_eq!(tlb.replacements(), 0);
        tlb.install(entry(0x3000, false));
        assert_eq!(tlb.replacements(), 1);
        assert_eq!(tlb.valid_entries(), 2);
        assert!(tlb.lookup(VirtAddr::new(0x3000)).is_some());
    }

    #[test]
    fn test_flush() {
        let tlb = sync(4);
        tlb.install(entry(0x1000, true));
        tlb.install(entry(0x2000, true));
        tlb.flush();
        assert_eq!(tlb.valid_entries(), 0);
    }
}
