//! Per-process user virtual memory.
//!
//! A [`UserMemory`] is one process' view of memory: a root page table, the
//! heap break `size`, and the mapped-file regions. Addresses below `size`
//! are reachable but not necessarily mapped; the first touch faults and the
//! handler materializes the page (zero-filled for the heap, file-filled for
//! a mapped region, privately copied for copy-on-write).

use core::mem;

use memchr::memchr;

use super::{
    PAGE_SIZE, PageRound as _, PhysAddr, VirtAddr,
    mmap::{MmapFlags, MmapProt, MmapRegion, MmapTable},
    page::Page,
    page_table::{PageTableRoot, PtEntryFlags},
};
use crate::{error::KernelError, file::File};

/// One process' memory: root page table, heap break, mapped regions.
///
/// The scheduler guarantees a process runs on one CPU at a time, so this
/// struct needs no internal lock.
pub struct UserMemory {
    root: PageTableRoot,
    size: usize,
    mappings: MmapTable,
}

/// What a page fault at some address means, judged once from the leaf PTE
/// state and the mapping table.
enum FaultKind {
    /// The address is past the process break.
    OutOfRange,
    /// A mapped page with user access removed: the stack guard.
    Guard,
    /// A shared frame waiting for its private copy.
    CopyOnWrite,
    /// Mapped and accessible; the access itself was illegal.
    Forbidden,
    /// No leaf, inside a mapped-file region.
    MappedFile(usize),
    /// No leaf, below the break: lazy heap.
    LazyHeap,
}

impl UserMemory {
    /// Creates an empty address space.
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            root: PageTableRoot::try_new()?,
            size: 0,
            mappings: MmapTable::new(),
        })
    }

    /// The process break: bytes in `[0, size)` are reachable.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The physical address of the root page-table page, for installing the
    /// address space on the hardware.
    pub fn root_phys_addr(&self) -> PhysAddr {
        self.root.phys_addr()
    }

    /// Loads the initial process image at address 0.
    ///
    /// For the very first process; `src` must fit in one page.
    pub fn map_first(&mut self, src: &[u8]) -> Result<(), KernelError> {
        assert_eq!(self.size, 0);
        assert!(src.len() < PAGE_SIZE, "src.len()={:#x}", src.len());

        let mut page = Page::alloc_zeroed()?;
        page.bytes_mut()[..src.len()].copy_from_slice(src);
        self.root
            .get_mut()
            .map_page(VirtAddr::MIN, page, PtEntryFlags::URWX)?;
        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Moves the break up by `increment` bytes without mapping anything;
    /// the new pages fault in on first touch. Returns the old break.
    pub fn grow_lazy(&mut self, increment: usize) -> Result<usize, KernelError> {
        let old_size = self.size;
        let new_size = old_size
            .checked_add(increment)
            .ok_or(KernelError::HeapSizeOverflow)?;
        VirtAddr::new(new_size)?;
        self.size = new_size;
        Ok(old_size)
    }

    /// Moves the break down by `decrement` bytes, unmapping and freeing the
    /// whole pages past the new break. Returns the old break.
    pub fn shrink_by(&mut self, decrement: usize) -> usize {
        let old_size = self.size;
        self.shrink_to_size(old_size.saturating_sub(decrement));
        old_size
    }

    /// Allocates and maps every page up to `new_size`, for the exec path.
    ///
    /// `new_size` need not be page-aligned. On failure the address space is
    /// restored to its previous size.
    pub fn grow_eager(
        &mut self,
        new_size: usize,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        if new_size <= self.size {
            return Ok(());
        }

        let old_size = self.size;
        let end = VirtAddr::new(new_size)?;
        let mut va = VirtAddr::new(self.size)?.page_roundup();
        while va < end {
            self.size = va.addr();

            let page = match Page::alloc_zeroed() {
                Ok(page) => page,
                Err(e) => {
                    self.shrink_to_size(old_size);
                    return Err(e);
                }
            };
            if let Err(e) = self.root.get_mut().map_page(va, page, perm) {
                self.shrink_to_size(old_size);
                return Err(e);
            }
            va = va.byte_add(PAGE_SIZE).unwrap();
        }
        self.size = new_size;

        Ok(())
    }

    fn shrink_to_size(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }

        let new_top = new_size.page_roundup();
        let old_top = self.size.page_roundup();
        if new_top < old_top {
            let start = VirtAddr::new(new_top).unwrap();
            self.root
                .get_mut()
                .unmap_range(start, (old_top - new_top) / PAGE_SIZE);
        }
        self.size = new_size;
    }

    /// Shares this address space with `target` for a fork.
    ///
    /// Every mapped page becomes copy-on-write in both parent and child and
    /// its frame gains a reference; mapped-file regions are inherited with
    /// their file handles duplicated. On failure `target` is left empty.
    pub fn fork_clone_into(&mut self, target: &mut Self) -> Result<(), KernelError> {
        target.shrink_to_size(0);

        if let Err(e) = self
            .root
            .get_mut()
            .clone_into(target.root.get_mut(), self.size)
        {
            target
                .root
                .get_mut()
                .unmap_range(VirtAddr::MIN, self.size.page_roundup() / PAGE_SIZE);
            target.size = 0;
            return Err(e);
        }

        target.size = self.size;
        target.mappings = self.mappings.clone();
        Ok(())
    }

    /// Removes user access from the page at `va`.
    ///
    /// Exec calls this on the page below the stack so that stack overflows
    /// fault instead of silently corrupting memory.
    pub fn clear_user_access(&mut self, va: VirtAddr) {
        self.root.get_mut().clear_user_bit(va.page_rounddown());
    }

    /// Maps `len` bytes of `file` starting at file offset `offset`.
    ///
    /// The region lands at the page above the current break and the break
    /// moves past it; no page-table entries are written. Returns the
    /// region's starting address.
    pub fn mmap(
        &mut self,
        len: usize,
        prot: MmapProt,
        flags: MmapFlags,
        file: File,
        offset: usize,
    ) -> Result<VirtAddr, KernelError> {
        if len == 0 {
            return Err(KernelError::ZeroLengthMapping);
        }
        if !prot.intersects(MmapProt::READ | MmapProt::WRITE) {
            return Err(KernelError::InvalidMappingProtection);
        }
        // Reads of the region are reads of the file.
        if prot.contains(MmapProt::READ) && !file.readable() {
            return Err(KernelError::FileDescriptorNotReadable);
        }
        // Writes reach the file only for shared mappings; a private mapping
        // of a read-only file may still be written.
        if prot.contains(MmapProt::WRITE)
            && !file.writable()
            && !flags.contains(MmapFlags::PRIVATE)
        {
            return Err(KernelError::FileDescriptorNotWritable);
        }

        let start = VirtAddr::new(self.size.page_roundup())?;
        let end = start.byte_add(len)?;
        self.mappings.reserve(MmapRegion {
            start,
            len,
            prot,
            flags,
            file,
            offset,
            num_pages: len.div_ceil(PAGE_SIZE),
        })?;
        self.size = end.addr();

        Ok(start)
    }

    /// Unmaps `len` bytes starting at `addr` from the mapped-file region
    /// containing `addr`.
    ///
    /// Shared pages are written back to the file first. Pages the process
    /// never touched have no frame and nothing to write back. The region's
    /// slot is released once its last page is gone.
    pub fn munmap(&mut self, addr: VirtAddr, len: usize) -> Result<(), KernelError> {
        let slot = self
            .mappings
            .find(addr)
            .ok_or(KernelError::MappingNotFound(addr))?;
        let (region_start, region_end, region_flags, region_offset, file) = {
            let region = self.mappings.get(slot);
            (
                region.start,
                region.end(),
                region.flags,
                region.offset,
                region.file.clone(),
            )
        };

        let mut va = addr.page_rounddown();
        let mut remaining = len;
        while remaining > 0 && va < region_end {
            if self.root.get().leaf_flags(va).is_some() {
                if region_flags.contains(MmapFlags::SHARED) {
                    let amount = usize::min(PAGE_SIZE, region_end.addr() - va.addr());
                    let file_offset = region_offset + (va.addr() - region_start.addr());
                    let bytes = self.root.get().fetch_page(va, PtEntryFlags::U)?;
                    let written = file.write_at(&bytes[..amount], file_offset)?;
                    if written < amount {
                        return Err(KernelError::MappedFileWrite);
                    }
                }
                drop(self.root.get_mut().unmap_page(va));
            }

            let drained = {
                let region = self.mappings.get_mut(slot);
                region.num_pages -= 1;
                region.num_pages == 0
            };
            if drained {
                self.mappings.release(slot);
                break;
            }

            remaining = remaining.saturating_sub(PAGE_SIZE);
            va = va.byte_add(PAGE_SIZE)?;
        }

        Ok(())
    }

    /// Handles a page fault at `va`. On success the faulting access can be
    /// retried; on error the trap layer kills the process.
    pub fn handle_fault(&mut self, va: VirtAddr) -> Result<(), KernelError> {
        match self.classify_fault(va) {
            FaultKind::OutOfRange => Err(KernelError::AccessBeyondBreak(va)),
            FaultKind::Guard => Err(KernelError::StackGuardPage(va)),
            FaultKind::Forbidden => Err(KernelError::InaccessiblePage(va)),
            FaultKind::CopyOnWrite => self
                .root
                .get_mut()
                .resolve_write_fault(va.page_rounddown()),
            FaultKind::MappedFile(slot) => self.fault_in_mapped_page(slot, va.page_rounddown()),
            FaultKind::LazyHeap => self.fault_in_heap_page(va.page_rounddown()),
        }
    }

    fn classify_fault(&self, va: VirtAddr) -> FaultKind {
        if va.addr() >= self.size {
            return FaultKind::OutOfRange;
        }

        let vp = va.page_rounddown();
        match self.root.get().leaf_flags(vp) {
            Some(flags) if !flags.contains(PtEntryFlags::U) => FaultKind::Guard,
            Some(flags)
                if flags.contains(PtEntryFlags::C) && !flags.contains(PtEntryFlags::W) =>
            {
                FaultKind::CopyOnWrite
            }
            Some(_) => FaultKind::Forbidden,
            None => match self.mappings.find(vp) {
                Some(slot) => FaultKind::MappedFile(slot),
                None => FaultKind::LazyHeap,
            },
        }
    }

    fn fault_in_heap_page(&mut self, vp: VirtAddr) -> Result<(), KernelError> {
        let page = Page::alloc_zeroed()?;
        self.root.get_mut().map_page(vp, page, PtEntryFlags::URWX)
    }

    fn fault_in_mapped_page(&mut self, slot: usize, vp: VirtAddr) -> Result<(), KernelError> {
        let (file, offset, len, prot) = {
            let region = self.mappings.get(slot);
            (
                region.file.clone(),
                region.file_offset(vp),
                region.bytes_at(vp),
                region.prot,
            )
        };

        let mut page = Page::alloc_zeroed()?;
        // A short read near end-of-file leaves the tail zero-filled.
        file.read_at(&mut page.bytes_mut()[..len], offset)?;

        let mut perm = PtEntryFlags::U;
        if prot.contains(MmapProt::READ) {
            perm |= PtEntryFlags::R;
        }
        if prot.contains(MmapProt::WRITE) {
            perm |= PtEntryFlags::W;
        }
        self.root.get_mut().map_page(vp, page, perm)
    }

    /// Copies `src` into user memory at `dst`.
    ///
    /// Unmapped destination pages below the break are allocated on the spot
    /// and copy-on-write pages get their private copy, exactly as a user
    /// store would behave.
    pub fn copy_out(&mut self, dst: VirtAddr, mut src: &[u8]) -> Result<(), KernelError> {
        let mut dst_va = dst;
        while !src.is_empty() {
            let vp = dst_va.page_rounddown();
            self.ensure_writable_page(vp)?;

            let offset = dst_va.addr() - vp.addr();
            let n = usize::min(PAGE_SIZE - offset, src.len());
            let bytes = self.root.get_mut().fetch_page_mut(vp, PtEntryFlags::UW)?;
            bytes[offset..offset + n].copy_from_slice(&src[..n]);

            src = &src[n..];
            dst_va = vp.byte_add(PAGE_SIZE)?;
        }
        Ok(())
    }

    fn ensure_writable_page(&mut self, vp: VirtAddr) -> Result<(), KernelError> {
        match self.root.get().leaf_flags(vp) {
            None => {
                let page = Page::alloc_zeroed()?;
                self.root.get_mut().map_page(vp, page, PtEntryFlags::URWX)
            }
            Some(flags)
                if flags.contains(PtEntryFlags::C) && !flags.contains(PtEntryFlags::W) =>
            {
                self.root.get_mut().resolve_write_fault(vp)
            }
            Some(_) => Ok(()),
        }
    }

    /// Copies user memory at `src` into `dst`.
    ///
    /// Unmapped source pages are allocated zero-filled, like any other
    /// first touch; reads never resolve copy-on-write.
    pub fn copy_in(&mut self, mut dst: &mut [u8], src: VirtAddr) -> Result<(), KernelError> {
        let mut src_va = src;
        while !dst.is_empty() {
            let vp = src_va.page_rounddown();
            if self.root.get().leaf_flags(vp).is_none() {
                let page = Page::alloc_zeroed()?;
                self.root.get_mut().map_page(vp, page, PtEntryFlags::URWX)?;
            }

            let offset = src_va.addr() - vp.addr();
            let n = usize::min(PAGE_SIZE - offset, dst.len());
            let bytes = self.root.get().fetch_page(vp, PtEntryFlags::UR)?;

            let rest = mem::take(&mut dst);
            let (chunk, rest) = rest.split_at_mut(n);
            chunk.copy_from_slice(&bytes[offset..offset + n]);
            dst = rest;

            src_va = vp.byte_add(PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user memory at `src` into `dst`,
    /// including the terminator. Returns the string length without it.
    ///
    /// Unlike [`UserMemory::copy_in`], unmapped pages are an error; a
    /// string argument must already exist.
    pub fn copy_in_str(&self, dst: &mut [u8], src: VirtAddr) -> Result<usize, KernelError> {
        let mut copied = 0;
        let mut src_va = src;
        while copied < dst.len() {
            let vp = src_va.page_rounddown();
            let bytes = self.root.get().fetch_page(vp, PtEntryFlags::UR)?;

            let offset = src_va.addr() - vp.addr();
            let n = usize::min(PAGE_SIZE - offset, dst.len() - copied);
            let chunk = &bytes[offset..offset + n];
            if let Some(nul) = memchr(0, chunk) {
                dst[copied..copied + nul + 1].copy_from_slice(&chunk[..=nul]);
                return Ok(copied + nul);
            }

            dst[copied..copied + n].copy_from_slice(chunk);
            copied += n;
            src_va = vp.byte_add(PAGE_SIZE)?;
        }
        Err(KernelError::UnterminatedUserString)
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        if self.size > 0 {
            self.root
                .get_mut()
                .unmap_range(VirtAddr::MIN, self.size.page_roundup() / PAGE_SIZE);
        }
        // The page-table root frees its interior pages when it drops; the
        // mapping slots drop their file handles.
    }
}
