use bitflags::bitflags;
use dataview::Pod;

use super::PageTable;
use crate::{
    error::KernelError,
    memory::{PhysAddr, VirtAddr, addr::PhysPageNum, page::Page},
};

bitflags! {
    /// Flags for page table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid Bit of page table entry.
        ///
        /// If set, an entry for this virtual address exists.
        const V = 1 << 0;

        /// Read Bit of page table entry.
        ///
        /// If set, the CPU can read to this virtual address.
        const R = 1 << 1;

        /// Write Bit of page table entry.
        ///
        /// If set, the CPU can write to this virtual address.
        const W = 1 << 2;

        /// Executable Bit of page table entry.
        ///
        /// If set, the CPU can execute instructions on this virtual address.
        const X = 1 << 3;

        /// UserMode Bit of page table entry.
        ///
        /// If set, userspace can access this virtual address.
        const U = 1 << 4;

        /// Global Mapping Bit of page table entry.
        ///
        /// If set, this virtual address exists in all address spaces.
        const G = 1 << 5;

        /// Access Bit of page table entry.
        ///
        /// If set, this virtual address has been accessed.
        const A = 1 << 6;

        /// Dirty Bit of page table entry.
        ///
        /// If set, this virtual address has been written to.
        const D = 1 << 7;

        /// Copy-On-Write Bit of page table entry.
        ///
        /// One of the bits the hardware reserves for software. Set together
        /// with a cleared `W` on frames shared by fork; a write fault on
        /// such an entry copies the frame instead of failing.
        const C = 1 << 8;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

/// A single Sv39 page table entry.
#[repr(transparent)]
#[derive(Pod)]
pub(crate) struct PtEntry(usize);

impl PtEntry {
    const FLAGS_MASK: usize = 0x3FF;

    /// Creates an entry with the given physical page number and flags.
    ///
    /// # Panics
    ///
    /// Panics if the flags contain bits outside the valid range.
    ///
    /// # Safety
    ///
    /// The caller must ensure the physical page matches what the flags claim
    /// (a page-table page for non-leaf flags, a mapped frame otherwise).
    unsafe fn new(ppn: PhysPageNum, flags: PtEntryFlags) -> Self {
        assert_eq!(
            flags.bits() & Self::FLAGS_MASK,
            flags.bits(),
            "flags: {flags:#x}={flags:?}"
        );
        Self((ppn.value() << 10) | flags.bits())
    }

    /// Returns the child page table if this entry is a non-leaf entry.
    pub(super) fn get_page_table(&self) -> Option<&PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_non_null::<PageTable>().as_ref() })
    }

    /// Returns the child page table if this entry is a non-leaf entry.
    pub(super) fn get_page_table_mut(&mut self) -> Option<&mut PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_non_null::<PageTable>().as_mut() })
    }

    /// Points this entry at a freshly allocated page-table page, parking the
    /// frame's reference here.
    ///
    /// # Panics
    ///
    /// Panics if the entry is already valid.
    pub(super) fn set_page_table(&mut self, page: Page) {
        assert!(!self.is_valid());
        let ppn = page.into_raw().phys_page_num();
        *self = unsafe { Self::new(ppn, PtEntryFlags::V) };
    }

    /// Returns the physical page number (PPN) associated with this entry.
    pub(super) fn phys_page_num(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 >> 10)
    }

    /// Returns the physical address (PA) associated with this entry.
    pub(super) fn phys_addr(&self) -> PhysAddr {
        self.phys_page_num().phys_addr()
    }

    /// Installs a leaf mapping.
    ///
    /// # Panics
    ///
    /// Panics if the entry is already valid or the flags lack `V`.
    pub(super) fn set_phys_addr(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        assert!(!self.is_valid());
        assert!(flags.contains(PtEntryFlags::V));
        *self = unsafe { Self::new(pa.phys_page_num(), flags) };
    }

    /// Returns `true` if this entry is valid.
    pub(super) fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// Returns `true` if this entry is a valid leaf entry.
    pub(super) fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    /// Returns `true` if this entry is a valid non-leaf entry.
    pub(super) fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Returns the flags associated with this entry.
    pub(crate) fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Clears the entry.
    pub(super) fn clear(&mut self) {
        self.0 = 0;
    }

    /// Removes the user-access bit, turning the page into a guard page.
    pub(super) fn clear_user(&mut self) {
        self.0 &= !PtEntryFlags::U.bits();
    }

    /// Downgrades this mapping to a copy-on-write one.
    ///
    /// Every forked leaf gets the marker, read-only ones included: a later
    /// write fault distinguishes "shared, copy me" from "illegal" by `C`
    /// alone, and the shared frame's reference count matches the number of
    /// `!W && C` leaves pointing at it.
    pub(super) fn make_copy_on_write(&mut self) {
        let mut flags = self.flags();
        flags.remove(PtEntryFlags::W);
        flags.insert(PtEntryFlags::C);
        *self = unsafe { Self::new(self.phys_page_num(), flags) };
    }

    /// Makes this entry privately writable, copying the frame if it is
    /// still shared.
    ///
    /// Returns an error if the entry is not a user copy-on-write mapping or
    /// no frame is available for the private copy.
    pub(super) fn resolve_copy_on_write(&mut self, va: VirtAddr) -> Result<(), KernelError> {
        let mut flags = self.flags();
        if flags.contains(PtEntryFlags::UW) {
            return Ok(());
        }
        if !flags.contains(PtEntryFlags::U | PtEntryFlags::C) {
            return Err(KernelError::InaccessiblePage(va));
        }

        flags.remove(PtEntryFlags::C);
        flags.insert(PtEntryFlags::W);

        let page = Page::from_raw(self.phys_addr());
        if page.ref_count() == 1 {
            // Last holder; writing in place is fine.
            let ppn = page.into_raw().phys_page_num();
            *self = unsafe { Self::new(ppn, flags) };
            return Ok(());
        }

        let mut new_page = match Page::alloc() {
            Ok(new_page) => new_page,
            Err(e) => {
                // Give the adopted reference back to the entry untouched.
                let _ = page.into_raw();
                return Err(e);
            }
        };
        new_page.bytes_mut().copy_from_slice(page.bytes());
        *self = unsafe { Self::new(new_page.into_raw().phys_page_num(), flags) };

        // Drops the shared frame's reference that this entry used to hold.
        drop(page);

        Ok(())
    }
}
