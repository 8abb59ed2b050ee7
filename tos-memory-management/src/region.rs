//! Region descriptors
//!
//! Every address space has up to four regions: code, data, heap and stack.
//! Regions only classify fault addresses and carry permissions; they are
//! never used for translation. Heap and stack start empty and grow one
//! page per fault in the gap between them.

use bitflags::bitflags;
use log::debug;
use tos_api::{Error, Result, VirtAddr, PAGE_SIZE};

use crate::config::VmConfig;
use crate::page_table::Permission;

bitflags! {
    /// Access bits of an executable segment, as requested by the loader
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Loads allowed
        const READ = 0x4;
        /// Stores allowed
        const WRITE = 0x2;
        /// Instruction fetch allowed
        const EXEC = 0x1;
    }
}

/// Kind of region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Program text
    Code,
    /// Initialised data and bss
    Data,
    /// Heap, directly above data
    Heap,
    /// User stack, growing down from the stack top
    Stack,
}

impl RegionKind {
    /// Permission of every page in a region of this kind
    pub const fn permission(self) -> Permission {
        match self {
            RegionKind::Code => Permission::ReadOnly,
            RegionKind::Data | RegionKind::Heap | RegionKind::Stack => Permission::Writeable,
        }
    }

    /// True for regions whose pages are filled from the executable
    pub const fn is_file_backed(self) -> bool {
        matches!(self, RegionKind::Code | RegionKind::Data)
    }
}

/// Page-aligned span `[base, top)` of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Lowest address
    pub base: VirtAddr,
    /// One past the highest address
    pub top: VirtAddr,
    /// Access rights
    pub permission: Permission,
}

impl Region {
    /// Region covering `[base, top)`
    pub fn new(base: VirtAddr, top: VirtAddr, permission: Permission) -> Self {
        debug_assert!(base <= top);
        debug_assert!(base.is_page_aligned() && top.is_page_aligned());
        Self { base, top, permission }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.top.as_usize() - self.base.as_usize()
    }

    /// True when `va` lies in `[base, top)`
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.base <= va && va < self.top
    }
}

/// Where a fault falls and whether serving it grows a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Region the page belongs to
    pub kind: RegionKind,
    /// Permission of the page
    pub permission: Permission,
}

/// Pending change of the heap top or stack base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Set the heap top
    Heap(VirtAddr),
    /// Set the stack base
    Stack(VirtAddr),
}

/// The regions of one address space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSet {
    /// Program text
    pub code: Option<Region>,
    /// Initialised data
    pub data: Option<Region>,
    /// Heap; empty until the first heap fault
    pub heap: Option<Region>,
    /// Stack; empty until the first stack fault
    pub stack: Option<Region>,
}

impl RegionSet {
    /// No regions
    pub const fn new() -> Self {
        Self {
            code: None,
            data: None,
            heap: None,
            stack: None,
        }
    }

    /// Define the next executable region.
    ///
    /// The first call defines code, the second defines data and places an
    /// empty heap at the end of data. Any further call is rejected. Code is
    /// always read-only and everything else writeable.
    pub fn define(&mut self, vaddr: VirtAddr, size: usize) -> Result<RegionKind> {
        let base = vaddr.page_round_down();
        let end = vaddr
            .as_usize()
            .checked_add(size)
            .ok_or(Error::InvalidArgument("region wraps the address space"))?;
        let top = VirtAddr::new(end).page_round_up();

        if self.code.is_none() {
            self.code = Some(Region::new(base, top, RegionKind::Code.permission()));
            debug!("vm: code region {:#x}-{:#x}", base.as_usize(), top.as_usize());
            Ok(RegionKind::Code)
        } else if self.data.is_none() {
            self.data = Some(Region::new(base, top, RegionKind::Data.permission()));
            self.heap = Some(Region::new(top, top, RegionKind::Heap.permission()));
            debug!("vm: data region {:#x}-{:#x}, heap at {:#x}", base.as_usize(), top.as_usize(), top.as_usize());
            Ok(RegionKind::Data)
        } else {
            Err(Error::NotImplemented("more than two program regions"))
        }
    }

    /// Define an empty stack ending at `stack_top`
    pub fn define_stack(&mut self, stack_top: VirtAddr) {
        let top = stack_top.page_round_down();
        self.stack = Some(Region::new(top, top, RegionKind::Stack.permission()));
    }

    /// True once code, data, heap and stack are all defined
    pub fn is_complete(&self) -> bool {
        self.code.is_some() && self.data.is_some() && self.heap.is_some() && self.stack.is_some()
    }

    /// Classify page `va` (page-aligned).
    ///
    /// Heap accepts its own top page and stack accepts the one page below
    /// its base; those are the growth candidates. A page at the stack base
    /// when the heap has reached it is not part of the heap.
    pub fn classify(&self, va: VirtAddr) -> Result<Classification> {
        let make = |kind: RegionKind, region: &Region| Classification {
            kind,
            permission: region.permission,
        };

        if let Some(code) = self.code.as_ref().filter(|r| r.contains(va)) {
            return Ok(make(RegionKind::Code, code));
        }
        if let Some(data) = self.data.as_ref().filter(|r| r.contains(va)) {
            return Ok(make(RegionKind::Data, data));
        }
        let stack_base = self.stack.map(|s| s.base);
        if let Some(heap) = &self.heap {
            if heap.base <= va && va <= heap.top && Some(va) != stack_base {
                return Ok(make(RegionKind::Heap, heap));
            }
        }
        if let Some(stack) = &self.stack {
            let guard = stack.base.as_usize().saturating_sub(PAGE_SIZE);
            if guard <= va.as_usize() && va < stack.top {
                return Ok(make(RegionKind::Stack, stack));
            }
        }
        Err(Error::InvalidAddress(va))
    }

    /// Lowest address the stack may grow down to: the top of the highest
    /// region below it
    fn stack_floor(&self) -> VirtAddr {
        [self.code, self.data, self.heap]
            .iter()
            .flatten()
            .map(|r| r.top)
            .max()
            .unwrap_or(VirtAddr::new(0))
    }

    /// Growth needed to serve a first-touch fault on `va`.
    ///
    /// Only faults in the gap between the regions below the stack and the
    /// stack base grow a region. Growth past the configured maximum, or a
    /// stack reaching into another region, is an invalid address.
    pub fn plan_growth(&self, kind: RegionKind, va: VirtAddr, config: &VmConfig) -> Result<Option<Growth>> {
        let ceiling = self.stack.map_or(VirtAddr::new(config.user_stack_top), |s| s.base);
        match kind {
            RegionKind::Heap => {
                let Some(heap) = self.heap else {
                    return Ok(None);
                };
                if va < heap.top || va >= ceiling {
                    return Ok(None);
                }
                let new_top = va
                    .checked_add_pages(1)
                    .ok_or(Error::InvalidAddress(va))?;
                if new_top.as_usize() - heap.base.as_usize() > config.user_heap_max || new_top > ceiling {
                    return Err(Error::InvalidAddress(va));
                }
                Ok(Some(Growth::Heap(new_top)))
            }
            RegionKind::Stack => {
                let Some(stack) = self.stack else {
                    return Ok(None);
                };
                if va >= stack.base {
                    return Ok(None);
                }
                if va < self.stack_floor() || stack.top.as_usize() - va.as_usize() > config.user_stack_max {
                    return Err(Error::InvalidAddress(va));
                }
                Ok(Some(Growth::Stack(va)))
            }
            RegionKind::Code | RegionKind::Data => Ok(None),
        }
    }

    /// Commit a growth computed by [`plan_growth`](Self::plan_growth)
    pub fn apply_growth(&mut self, growth: Growth) {
        match growth {
            Growth::Heap(top) => {
                if let Some(heap) = self.heap.as_mut() {
                    heap.top = top;
                    debug!("vm: heap grown to {:#x}", top.as_usize());
                }
            }
            Growth::Stack(base) => {
                if let Some(stack) = self.stack.as_mut() {
                    stack.base = base;
                    debug!("vm: stack grown to {:#x}", base.as_usize());
                }
            }
        }
    }
}
