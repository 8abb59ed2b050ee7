//! Physical memory module
//!
//! RAM is modelled as one contiguous byte array indexed by physical
//! address; frames are page-sized windows into it.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

pub use tos_api::{addr_to_pfn, page_round_down, page_round_up, pfn_to_addr, PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// Contents of physical RAM
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    /// Zeroed RAM holding `frames` frames
    pub fn new(frames: usize) -> Self {
        Self { bytes: vec![0u8; frames * PAGE_SIZE] }
    }

    /// Number of frames
    pub fn frames(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    /// Bytes of frame `pfn`
    pub fn frame(&self, pfn: usize) -> &[u8] {
        let start = pfn_to_addr(pfn);
        &self.bytes[start..start + PAGE_SIZE]
    }

    /// Mutable bytes of frame `pfn`
    pub fn frame_mut(&mut self, pfn: usize) -> &mut [u8] {
        let start = pfn_to_addr(pfn);
        &mut self.bytes[start..start + PAGE_SIZE]
    }

    /// Zero frame `pfn`
    pub fn zero_frame(&mut self, pfn: usize) {
        self.frame_mut(pfn).fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_do_not_overlap() {
        let mut ram = PhysicalMemory::new(4);
        assert_eq!(ram.frames(), 4);
        ram.frame_mut(1).fill(0xaa);
        assert!(ram.frame(0).iter().all(|&b| b == 0));
        assert!(ram.frame(1).iter().all(|&b| b == 0xaa));
        assert!(ram.frame(2).iter().all(|&b| b == 0));

        ram.zero_frame(1);
        assert!(ram.frame(1).iter().all(|&b| b == 0));
    }
}
