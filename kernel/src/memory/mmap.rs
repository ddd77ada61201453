//! Mapped-file region bookkeeping.
//!
//! `mmap` never installs page-table entries; it records a region here and
//! lets the fault handler read file pages in on demand. `munmap` walks the
//! region page by page, writing shared pages back before unmapping them.

use bitflags::bitflags;

use super::{PAGE_SIZE, VirtAddr};
use crate::{error::KernelError, file::File, param::MMAP_INFO_MAX};

bitflags! {
    /// Requested access to a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: usize {
        const READ = 0x1;
        const WRITE = 0x10;
    }
}

bitflags! {
    /// Whether stores to a mapped region reach the underlying file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: usize {
        const SHARED = 0x1;
        const PRIVATE = 0x10;
    }
}

/// The state of one memory-mapped file region in a process' address space.
#[derive(Clone)]
pub(super) struct MmapRegion {
    /// First virtual address in the region; page-aligned.
    pub(super) start: VirtAddr,
    /// Size of the region in bytes.
    pub(super) len: usize,
    pub(super) prot: MmapProt,
    pub(super) flags: MmapFlags,
    /// The mapped file; holding it keeps the file open.
    pub(super) file: File,
    /// File offset the region starts at.
    pub(super) offset: usize,
    /// Pages not yet unmapped; starts at the region's page count.
    pub(super) num_pages: usize,
}

impl MmapRegion {
    pub(super) fn end(&self) -> VirtAddr {
        self.start.byte_add(self.len).unwrap()
    }

    pub(super) fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end()
    }

    /// The file offset backing the page at `va`.
    pub(super) fn file_offset(&self, va: VirtAddr) -> usize {
        self.offset + (va.addr() - self.start.addr())
    }

    /// The region bytes backing the page at `va`, at most one page.
    pub(super) fn bytes_at(&self, va: VirtAddr) -> usize {
        usize::min(PAGE_SIZE, self.end().addr() - va.addr())
    }
}

/// A process' mapped-file regions, a fixed array of slots.
#[derive(Clone)]
pub(super) struct MmapTable {
    slots: [Option<MmapRegion>; MMAP_INFO_MAX],
}

impl MmapTable {
    pub(super) const fn new() -> Self {
        Self {
            slots: [const { None }; MMAP_INFO_MAX],
        }
    }

    pub(super) fn reserve(&mut self, region: MmapRegion) -> Result<(), KernelError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(KernelError::NoFreeMappingSlot)?;
        *slot = Some(region);
        Ok(())
    }

    /// Finds the live slot whose region contains `va`.
    pub(super) fn find(&self, va: VirtAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|region| region.contains(va)))
    }

    pub(super) fn get(&self, index: usize) -> &MmapRegion {
        self.slots[index].as_ref().unwrap()
    }

    pub(super) fn get_mut(&mut self, index: usize) -> &mut MmapRegion {
        self.slots[index].as_mut().unwrap()
    }

    pub(super) fn release(&mut self, index: usize) {
        self.slots[index] = None;
    }
}
