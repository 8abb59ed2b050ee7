//! Address spaces and their registry
//!
//! Frame and swap entries refer to their owner through an
//! [`AddressSpaceId`]: a slot index plus the generation of the slot at the
//! time the space was created. Destroying a space bumps the slot's
//! generation, so an id that outlives its space is rejected with
//! `StaleAddressSpace` instead of reaching a reused slot.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use tos_api::{Error, Result, SegmentLoader};

use crate::page_table::PageTable;
use crate::region::RegionSet;

/// Generation-checked handle to an address space
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId {
    index: u32,
    generation: u32,
}

impl AddressSpaceId {
    /// Build an id from its parts
    pub const fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Registry slot
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the id was issued
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}.{}", self.index, self.generation)
    }
}

/// One process's view of memory
pub struct AddressSpace {
    /// Page-table entries of touched pages
    pub page_table: PageTable,
    /// Code, data, heap and stack
    pub regions: RegionSet,
    /// Executable the code and data pages are loaded from
    pub program: Arc<dyn SegmentLoader>,
}

impl AddressSpace {
    /// Empty address space backed by `program`
    pub fn new(program: Arc<dyn SegmentLoader>) -> Self {
        Self {
            page_table: PageTable::new(),
            regions: RegionSet::new(),
            program,
        }
    }
}

struct Slot {
    generation: u32,
    space: Option<AddressSpace>,
}

/// Owner of every live address space
pub struct SpaceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    current: Option<AddressSpaceId>,
}

impl SpaceRegistry {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            current: None,
        }
    }

    /// Register `space` and return its id
    pub fn insert(&mut self, space: AddressSpace) -> AddressSpaceId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.space = Some(space);
            return AddressSpaceId::from_raw(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            space: Some(space),
        });
        AddressSpaceId::from_raw(index, 0)
    }

    fn slot(&self, id: AddressSpaceId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    /// True if `id` names a live address space
    pub fn contains(&self, id: AddressSpaceId) -> bool {
        self.slot(id).is_some_and(|s| s.space.is_some())
    }

    /// Address space `id`
    pub fn get(&self, id: AddressSpaceId) -> Result<&AddressSpace> {
        self.slot(id)
            .and_then(|s| s.space.as_ref())
            .ok_or(Error::StaleAddressSpace)
    }

    /// Mutable address space `id`
    pub fn get_mut(&mut self, id: AddressSpaceId) -> Result<&mut AddressSpace> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.space.as_mut())
            .ok_or(Error::StaleAddressSpace)
    }

    /// Remove `id`, retiring the id. Clears it as current.
    pub fn remove(&mut self, id: AddressSpaceId) -> Result<AddressSpace> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(Error::StaleAddressSpace)?;
        let space = slot.space.take().ok_or(Error::StaleAddressSpace)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(space)
    }

    /// Active address space, if any
    pub fn current(&self) -> Option<AddressSpaceId> {
        self.current
    }

    /// Make `id` the active address space
    pub fn set_current(&mut self, id: Option<AddressSpaceId>) -> Result<()> {
        if let Some(id) = id {
            if !self.contains(id) {
                return Err(Error::StaleAddressSpace);
            }
        }
        self.current = id;
        Ok(())
    }

    /// Number of live address spaces
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.space.is_some()).count()
    }

    /// True if no address space is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
