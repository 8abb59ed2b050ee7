//! VM statistics

use tos_api::sync::{AtomicU64, Ordering};

/// Snapshot of frame, swap and fault activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Frames in the machine
    pub total_frames: usize,
    /// Free frames
    pub free_frames: usize,
    /// Kernel frames
    pub fixed_frames: usize,
    /// User frames with an up-to-date swap copy
    pub clean_frames: usize,
    /// User frames without an up-to-date swap copy
    pub dirty_frames: usize,
    /// Occupied swap slots
    pub used_swap_slots: usize,
    /// Faults handled, successful or not
    pub faults: u64,
    /// Frames reclaimed from user pages
    pub evictions: u64,
    /// Pages written to swap
    pub swap_outs: u64,
    /// Pages read back from swap
    pub swap_ins: u64,
    /// TLB installs that displaced a valid translation
    pub tlb_replacements: u64,
}

impl VmStats {
    /// Frames holding user pages
    pub fn user_frames(&self) -> usize {
        self.clean_frames + self.dirty_frames
    }
}

/// Event counters updated without taking any VM lock
#[derive(Debug, Default)]
pub struct VmCounters {
    pub(crate) faults: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) swap_outs: AtomicU64,
    pub(crate) swap_ins: AtomicU64,
}

impl VmCounters {
    /// All counters at zero
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut VmStats) {
        stats.faults = self.faults.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.swap_outs = self.swap_outs.load(Ordering::Relaxed);
        stats.swap_ins = self.swap_ins.load(Ordering::Relaxed);
    }
}
