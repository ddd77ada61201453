//! Physical memory allocation, for user processes, page-table pages, and
//! slab-backed kernel objects.
//!
//! Allocates whole 4096-byte pages. Ownership of an allocated frame is
//! expressed by the [`Page`] handle: cloning records another holder,
//! dropping records one fewer, and the frame returns to a freelist exactly
//! when the last handle goes away. Page-table leaves park their reference
//! in a raw physical address via [`Page::into_raw`] and adopt it back with
//! [`Page::from_raw`].

use core::{mem, ops::Range, ptr::NonNull};

use once_init::OnceInit;
use page_alloc::{FrameAllocator, FreeList};

use super::{PAGE_SIZE, PhysAddr};
use crate::{cpu, error::KernelError, param::NCPU, sync::SpinLock};

type KernelFrameAllocator = FrameAllocator<SpinLock<FreeList>, PAGE_SIZE, NCPU>;

static PAGE_MANAGER: OnceInit<PageManager> = OnceInit::new();

struct PageManager {
    allocator: KernelFrameAllocator,
}

/// Initializes the page allocator over the physical range `region`.
///
/// Every frame starts on the calling CPU's freelist; the other CPUs fill
/// their shards by stealing.
///
/// # Safety
///
/// `region` must be RAM that nothing else in the system uses, and this
/// function must be called exactly once, before any allocation.
pub unsafe fn init(region: Range<NonNull<u8>>) {
    let cpu = cpu::pinned();
    let allocator = unsafe { FrameAllocator::new(region, cpu.id()) };
    PAGE_MANAGER.init(PageManager { allocator });
}

fn allocator() -> &'static KernelFrameAllocator {
    &PAGE_MANAGER.get().allocator
}

/// Returns the number of free frames on the current CPU's freelist.
///
/// Backs the `nfree` diagnostic syscall.
pub fn nfree_local() -> usize {
    let cpu = cpu::pinned();
    allocator().free_frames(cpu.id())
}

/// Returns the total number of frames under management.
pub fn total_frames() -> usize {
    allocator().total_frames()
}

/// Returns `true` if `pa` is a frame the allocator manages.
///
/// Kernel-text mappings fall outside and are never reference counted.
pub(crate) fn is_heap_addr(pa: PhysAddr) -> bool {
    allocator().contains(pa.as_non_null())
}

/// One reference to an allocated frame.
pub(crate) struct Page {
    pa: PhysAddr,
}

impl Page {
    /// Allocates a frame with this handle as its only reference.
    ///
    /// For callers that overwrite the whole frame anyway; anything that
    /// relies on the contents should go through [`Page::alloc_zeroed`].
    pub(crate) fn alloc() -> Result<Self, KernelError> {
        let cpu = cpu::pinned();
        let frame = allocator().alloc(cpu.id()).ok_or(KernelError::NoFreePage)?;
        Ok(Self { pa: frame.into() })
    }

    /// Allocates a zeroed frame with this handle as its only reference.
    ///
    /// The per-CPU allocator scrubs every frame it hands out, so this costs
    /// the same as [`Page::alloc`]; the name is the contract.
    pub(crate) fn alloc_zeroed() -> Result<Self, KernelError> {
        Self::alloc()
    }

    /// Adopts one existing reference to the frame at `pa`, typically the one
    /// a page-table leaf parked there.
    pub(crate) fn from_raw(pa: PhysAddr) -> Self {
        assert!(allocator().ref_count(pa.as_non_null()) > 0);
        Self { pa }
    }

    /// Parks this handle's reference in a raw physical address.
    ///
    /// The caller is responsible for adopting it back with
    /// [`Page::from_raw`] eventually.
    pub(crate) fn into_raw(self) -> PhysAddr {
        let pa = self.pa;
        mem::forget(self);
        pa
    }

    pub(crate) fn phys_addr(&self) -> PhysAddr {
        self.pa
    }

    pub(crate) fn ref_count(&self) -> u32 {
        allocator().ref_count(self.pa.as_non_null())
    }

    pub(crate) fn bytes(&self) -> &[u8; PAGE_SIZE] {
        unsafe { self.pa.as_non_null::<[u8; PAGE_SIZE]>().as_ref() }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { self.pa.as_non_null::<[u8; PAGE_SIZE]>().as_mut() }
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        allocator().increment_ref(self.pa.as_non_null());
        Self { pa: self.pa }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let cpu = cpu::pinned();
        unsafe {
            allocator().decrement_ref(cpu.id(), self.pa.as_non_null());
        }
    }
}
