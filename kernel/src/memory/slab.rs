//! The kernel's slab caches.
//!
//! One global [`CacheTable`] serves every subsystem that needs objects
//! smaller than a page; its slabs come from the page allocator and go back
//! as soon as they drain.

use core::ptr::NonNull;

use once_init::OnceInit;
use slab_allocator::{Cache, CacheTable, FrameSource};

use super::{PAGE_SIZE, page::Page};
use crate::{param::KMEM_CACHE_MAX, sync::SpinLock};

/// Draws slabs from the page allocator, one frame per slab.
struct PageSource;

impl FrameSource for PageSource {
    const SLAB_SIZE: usize = PAGE_SIZE;

    fn alloc_frame(&self) -> Option<NonNull<u8>> {
        let page = Page::alloc().ok()?;
        Some(page.into_raw().as_non_null())
    }

    unsafe fn release_frame(&self, frame: NonNull<u8>) {
        drop(Page::from_raw(frame.into()));
    }
}

static CACHES: OnceInit<SpinLock<CacheTable<PageSource, KMEM_CACHE_MAX>>> = OnceInit::new();

/// Sets up the cache table. The page allocator must already be initialized.
pub fn init() {
    CACHES.init(SpinLock::new(CacheTable::new(PageSource)));
}

/// Creates a cache for objects of `object_size` bytes.
pub fn create(object_size: usize) -> Option<Cache> {
    CACHES.get().lock().create(object_size)
}

/// Allocates one object from `cache`.
pub fn allocate(cache: &Cache) -> Option<NonNull<u8>> {
    CACHES.get().lock().allocate(cache)
}

/// Returns `obj` to `cache`.
///
/// # Safety
///
/// `obj` must have come from [`allocate`] on the same cache and must not be
/// used afterwards.
pub unsafe fn deallocate(cache: &Cache, obj: NonNull<u8>) {
    unsafe {
        CACHES.get().lock().deallocate(cache, obj);
    }
}

/// Returns the number of live objects in `cache`.
pub fn live_objects(cache: &Cache) -> usize {
    CACHES.get().lock().live_objects(cache)
}
