//! The Sv39 page-table engine.
//!
//! A page table is a tree of three levels of 512-entry arrays of 64-bit
//! PTEs. A virtual address is split into five fields:
//!
//! ```text
//!     39..=63 -- must be zero.
//!     30..=38 -- 9 bits of level-2 index.
//!     21..=29 -- 9 bits of level-1 index.
//!     12..=20 -- 9 bits of level-0 index.
//!      0..=11 -- 12 bits of byte offset within the page.
//! ```
//!
//! Every page-table page is itself a reference-counted frame; interior
//! entries park a [`Page`] reference while they are valid.

use core::ptr::NonNull;

use dataview::Pod;

pub use self::entry::PtEntryFlags;
use self::entry::PtEntry;
use super::{PAGE_SIZE, PageRound as _, PhysAddr, VirtAddr, page::Page};
use crate::{error::KernelError, memory};

mod entry;

/// One page of page-table entries.
#[repr(transparent)]
#[derive(Pod)]
pub struct PageTable([PtEntry; 512]);

/// Owns the root of a page-table tree.
///
/// Dropping the root frees every interior page-table page; all leaf
/// mappings must have been unmapped by then.
pub(crate) struct PageTableRoot(NonNull<PageTable>);

unsafe impl Send for PageTableRoot {}

impl PageTableRoot {
    /// Allocates an empty page table.
    pub(crate) fn try_new() -> Result<Self, KernelError> {
        // A zeroed frame is a table of invalid entries.
        let page = Page::alloc_zeroed()?;
        Ok(Self(page.into_raw().as_non_null()))
    }

    /// The physical address of the root page, for installing the address
    /// space on the hardware.
    pub(crate) fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.0.addr().get())
    }

    pub(crate) fn get(&self) -> &PageTable {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn get_mut(&mut self) -> &mut PageTable {
        unsafe { self.0.as_mut() }
    }
}

impl Drop for PageTableRoot {
    fn drop(&mut self) {
        self.get_mut().free_descendant();
        drop(Page::from_raw(self.phys_addr()));
    }
}

impl PageTable {
    /// Runs `f` on the level-0 PTE for `va`.
    ///
    /// If `insert_new_table` is `true`, missing interior page-table pages
    /// are allocated on the way down; otherwise their absence is an error.
    /// The updated PTE must end up invalid or a leaf.
    ///
    /// # Panics
    ///
    /// Panics if `va` is at or above [`VirtAddr::MAX`].
    fn update_level0_entry<T, F>(
        &mut self,
        va: VirtAddr,
        insert_new_table: bool,
        f: F,
    ) -> Result<T, KernelError>
    where
        F: FnOnce(&mut PtEntry) -> T,
    {
        assert!(va < VirtAddr::MAX, "va={va:#x}");

        let mut pt = self;
        for level in (1..=2).rev() {
            let pte = &mut pt.0[va.level_idx(level)];
            if !pte.is_valid() {
                if !insert_new_table {
                    return Err(KernelError::VirtualPageNotMapped(va));
                }
                let page = Page::alloc_zeroed()?;
                pte.set_page_table(page);
            }
            pt = pte.get_page_table_mut().unwrap();
        }

        let pte = &mut pt.0[va.level_idx(0)];
        let res = f(pte);
        // A level-0 PTE must be invalid or a leaf.
        assert!(!pte.is_non_leaf());
        Ok(res)
    }

    /// Returns the leaf PTE corresponding to `va`.
    ///
    /// # Panics
    ///
    /// Panics if `va` is at or above [`VirtAddr::MAX`].
    fn find_leaf_entry(&self, va: VirtAddr) -> Result<&PtEntry, KernelError> {
        assert!(va < VirtAddr::MAX, "va={va:#x}");

        let mut pt = self;
        for level in (1..=2).rev() {
            pt = pt.0[va.level_idx(level)]
                .get_page_table()
                .ok_or(KernelError::VirtualPageNotMapped(va))?;
        }

        let pte = &pt.0[va.level_idx(0)];
        if !pte.is_leaf() {
            return Err(KernelError::VirtualPageNotMapped(va));
        }
        Ok(pte)
    }

    fn find_leaf_entry_mut(&mut self, va: VirtAddr) -> Result<&mut PtEntry, KernelError> {
        assert!(va < VirtAddr::MAX, "va={va:#x}");

        let mut pt = self;
        for level in (1..=2).rev() {
            pt = pt.0[va.level_idx(level)]
                .get_page_table_mut()
                .ok_or(KernelError::VirtualPageNotMapped(va))?;
        }

        let pte = &mut pt.0[va.level_idx(0)];
        if !pte.is_leaf() {
            return Err(KernelError::VirtualPageNotMapped(va));
        }
        Ok(pte)
    }

    /// Returns the flags of the leaf mapping `va`, or `None` if no leaf
    /// exists (a lazy hole).
    pub(crate) fn leaf_flags(&self, va: VirtAddr) -> Option<PtEntryFlags> {
        self.find_leaf_entry(va).ok().map(PtEntry::flags)
    }

    /// Maps the frame owned by `page` at `va`, consuming the handle into
    /// the leaf PTE.
    ///
    /// On failure the handle is dropped, which frees the frame if it was
    /// the last reference.
    ///
    /// # Panics
    ///
    /// Panics if `va` is already mapped (remap), is not page-aligned, or
    /// `perm` has none of R/W/X.
    pub(crate) fn map_page(
        &mut self,
        va: VirtAddr,
        page: Page,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        self.update_level0_entry(va, true, move |pte| {
            assert!(
                !pte.is_valid(),
                "remap on the already mapped address: va={va:#x}"
            );
            pte.set_phys_addr(page.into_raw(), perm | PtEntryFlags::V);
        })
    }

    /// Unmaps the page at `va`, returning the frame handle the leaf held.
    ///
    /// Returns `None` for lazy holes (no leaf) and for leaves that point
    /// outside the managed frame range (kernel-text mappings carry no
    /// reference count).
    pub(crate) fn unmap_page(&mut self, va: VirtAddr) -> Option<Page> {
        assert!(va.is_page_aligned(), "va={va:#x}");

        let Ok(pte) = self.find_leaf_entry_mut(va) else {
            return None;
        };
        let pa = pte.phys_addr();
        pte.clear();
        memory::flush_page(va);

        if !memory::page::is_heap_addr(pa) {
            return None;
        }
        Some(Page::from_raw(pa))
    }

    /// Unmaps `npages` pages starting at `va`, freeing the frames.
    ///
    /// Missing leaves are skipped; a lazily grown region may never have
    /// been touched.
    pub(crate) fn unmap_range(&mut self, va: VirtAddr, npages: usize) {
        let mut va = va;
        for _ in 0..npages {
            drop(self.unmap_page(va));
            va = va.byte_add(PAGE_SIZE).unwrap();
        }
    }

    /// Shares every mapped page in `[0, size)` with `target` for a fork.
    ///
    /// Each source leaf is downgraded to copy-on-write (`W` cleared, `C`
    /// set), the same frame is installed in `target` under the new flags,
    /// and the frame gains a reference. On failure the caller is expected
    /// to tear down `target`, which drops the references taken so far.
    pub(crate) fn clone_into(
        &mut self,
        target: &mut Self,
        size: usize,
    ) -> Result<(), KernelError> {
        let end = VirtAddr::new(size.page_roundup())?;

        let mut va = VirtAddr::MIN;
        while va < end {
            if let Ok(pte) = self.find_leaf_entry_mut(va) {
                pte.make_copy_on_write();
                memory::flush_page(va);

                let perm = pte.flags() & !PtEntryFlags::V;
                let page = Page::from_raw(pte.phys_addr());
                let target_page = page.clone();
                // The source leaf keeps the reference it always held.
                let _ = page.into_raw();

                target.map_page(va, target_page, perm)?;
            }
            va = va.byte_add(PAGE_SIZE).unwrap();
        }
        Ok(())
    }

    /// Resolves a write fault on a copy-on-write mapping at `va`.
    pub(crate) fn resolve_write_fault(&mut self, va: VirtAddr) -> Result<(), KernelError> {
        let pte = self.find_leaf_entry_mut(va)?;
        pte.resolve_copy_on_write(va)?;
        memory::flush_page(va);
        Ok(())
    }

    /// Removes user access from the page at `va`.
    ///
    /// Used by exec for the stack guard page.
    ///
    /// # Panics
    ///
    /// Panics if no leaf maps `va`.
    pub(crate) fn clear_user_bit(&mut self, va: VirtAddr) {
        let pte = self
            .find_leaf_entry_mut(va)
            .expect("guard page must be mapped");
        pte.clear_user();
        memory::flush_page(va);
    }

    /// Looks up `va`, requiring the mapping to carry `flags`.
    pub(crate) fn resolve_addr(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<PhysAddr, KernelError> {
        let pte = self.find_leaf_entry(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }
        Ok(pte.phys_addr())
    }

    /// Fetches the page mapped at `va` for reading.
    pub(crate) fn fetch_page(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8; PAGE_SIZE], KernelError> {
        let pa = self.resolve_addr(va, flags)?;
        Ok(unsafe { pa.as_non_null::<[u8; PAGE_SIZE]>().as_ref() })
    }

    /// Fetches the page mapped at `va` for writing, resolving copy-on-write
    /// first when needed.
    pub(crate) fn fetch_page_mut(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8; PAGE_SIZE], KernelError> {
        if self
            .find_leaf_entry(va)?
            .flags()
            .contains(PtEntryFlags::C)
        {
            self.resolve_write_fault(va)?;
        }

        let pte = self.find_leaf_entry_mut(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }
        let pa = pte.phys_addr();
        Ok(unsafe { pa.as_non_null::<[u8; PAGE_SIZE]>().as_mut() })
    }

    /// Recursively frees interior page-table pages.
    ///
    /// # Panics
    ///
    /// Panics if any leaf mapping is still installed.
    fn free_descendant(&mut self) {
        for pte in &mut self.0 {
            assert!(
                !pte.is_leaf(),
                "leaf mapping outlived its address space: {:?}",
                pte.flags()
            );
            if pte.is_non_leaf() {
                let pa = pte.phys_addr();
                let child = unsafe { pa.as_non_null::<PageTable>().as_mut() };
                child.free_descendant();
                pte.clear();
                drop(Page::from_raw(pa));
            }
        }
    }
}
