//! Executable segment loader consumed by first-touch faults
//!
//! Header parsing belongs to the loader; the VM core only asks for the list
//! of loadable segments and for a slice of one of them to be copied into a
//! frame.

use alloc::vec::Vec;

use crate::error::{Error, IoErrorKind, Result};
use crate::types::{VirtAddr, PAGE_SIZE};

/// One loadable program segment, as described by its program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Virtual address of the first byte of the segment
    pub vaddr: VirtAddr,
    /// Size of the segment in memory
    pub mem_size: usize,
    /// Offset of the segment in the executable file
    pub file_offset: usize,
    /// Bytes of the segment present in the file (the rest is zero-filled)
    pub file_size: usize,
    /// Whether the segment holds instructions
    pub executable: bool,
}

impl ProgramSegment {
    /// True when `vaddr` lies within `[vaddr, vaddr + mem_size)`
    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        let start = self.vaddr.as_usize();
        vaddr.as_usize() >= start && vaddr.as_usize() - start < self.mem_size
    }

    /// File-backed part of this segment that falls inside `page`.
    ///
    /// Returns `None` when the page only overlaps the zero-filled tail of
    /// the segment, or does not overlap it at all.
    pub fn slice_for_page(&self, page: VirtAddr) -> Option<SegmentSlice> {
        let page_start = page.page_round_down().as_usize();
        let page_end = page_start.checked_add(PAGE_SIZE)?;
        let seg_start = self.vaddr.as_usize();
        let file_end = seg_start.checked_add(self.file_size.min(self.mem_size))?;

        let start = page_start.max(seg_start);
        let end = page_end.min(file_end);
        if start >= end {
            return None;
        }
        Some(SegmentSlice {
            frame_offset: start - page_start,
            file_offset: self.file_offset + (start - seg_start),
            length_in_file: end - start,
        })
    }
}

/// Portion of a segment to copy into one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSlice {
    /// Offset within the frame of the first copied byte
    pub frame_offset: usize,
    /// Offset in the executable file of the first copied byte
    pub file_offset: usize,
    /// Number of bytes to copy
    pub length_in_file: usize,
}

/// Access to an executable image
pub trait SegmentLoader: Send + Sync {
    /// Loadable segments of the executable
    fn segments(&self) -> Result<Vec<ProgramSegment>>;

    /// Copy `length_in_file` bytes starting at `file_offset` into the start
    /// of `frame` and zero the remainder of the frame.
    fn load_segment(
        &self,
        file_offset: usize,
        frame: &mut [u8],
        length_in_file: usize,
        is_executable: bool,
    ) -> Result<()>;
}

/// Executable held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    file: Vec<u8>,
    segments: Vec<ProgramSegment>,
}

impl MemoryImage {
    /// Build an image from raw file bytes and its segment table
    pub fn new(file: Vec<u8>, segments: Vec<ProgramSegment>) -> Self {
        Self { file, segments }
    }

    /// Image with a code segment followed by a data segment, each fully
    /// present in the file and laid out back to back.
    pub fn two_segment(code_base: VirtAddr, code: &[u8], data_base: VirtAddr, data: &[u8]) -> Self {
        let mut file = Vec::with_capacity(code.len() + data.len());
        file.extend_from_slice(code);
        file.extend_from_slice(data);
        let segments = alloc::vec![
            ProgramSegment {
                vaddr: code_base,
                mem_size: code.len(),
                file_offset: 0,
                file_size: code.len(),
                executable: true,
            },
            ProgramSegment {
                vaddr: data_base,
                mem_size: data.len(),
                file_offset: code.len(),
                file_size: data.len(),
                executable: false,
            },
        ];
        Self { file, segments }
    }
}

impl SegmentLoader for MemoryImage {
    fn segments(&self) -> Result<Vec<ProgramSegment>> {
        Ok(self.segments.clone())
    }

    fn load_segment(
        &self,
        file_offset: usize,
        frame: &mut [u8],
        length_in_file: usize,
        _is_executable: bool,
    ) -> Result<()> {
        if length_in_file > frame.len() {
            return Err(Error::InvalidArgument("segment slice larger than frame"));
        }
        let end = file_offset
            .checked_add(length_in_file)
            .ok_or(Error::Io(IoErrorKind::ShortTransfer))?;
        let src = self
            .file
            .get(file_offset..end)
            .ok_or(Error::Io(IoErrorKind::ShortTransfer))?;
        frame[..length_in_file].copy_from_slice(src);
        frame[length_in_file..].fill(0);
        Ok(())
    }
}
