//! Object caches carved out of single-page slabs.
//!
//! The page allocator only hands out whole frames, so kernel objects smaller
//! than a page would otherwise have to be declared in static arrays. A
//! [`CacheTable`] manages caches of fixed-size objects instead: each cache
//! owns a chain of nodes, each node backs its objects with one slab obtained
//! from a [`FrameSource`], and slabs are retired as soon as they hold no
//! objects.
//!
//! A slot's first four bytes encode its state: `-1` when free, `0` when
//! allocated. The scheme follows the slab allocator described in Bonwick's
//! "The Slab Allocator: An Object-Caching Kernel Memory Allocator".

#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

/// The free-slot sentinel stamped into the first four bytes of a slot.
const FREE_SENTINEL: i32 = -1;

/// The supplier of slab backing memory.
///
/// The kernel implements this on top of the physical page allocator; tests
/// use a plain arena.
pub trait FrameSource {
    /// The size in bytes of every slab handed out by this source.
    const SLAB_SIZE: usize;

    /// Obtains one slab, or `None` when memory is exhausted.
    fn alloc_frame(&self) -> Option<NonNull<u8>>;

    /// Returns a slab previously obtained from [`FrameSource::alloc_frame`].
    ///
    /// # Safety
    ///
    /// The slab must not be accessed after this call.
    unsafe fn release_frame(&self, frame: NonNull<u8>);
}

/// A handle to one cache (one object size class) inside a [`CacheTable`].
///
/// The handle names the cache's head node, which survives for the life of
/// the cache even when it currently backs no slab, so the handle never needs
/// to be rewritten when the cache drains.
pub struct Cache {
    head: usize,
}

#[derive(Clone, Copy)]
struct CacheNode {
    slab: Option<NonNull<u8>>,
    object_size: usize,
    occupancy: usize,
    capacity: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl CacheNode {
    const EMPTY: Self = Self {
        slab: None,
        object_size: 0,
        occupancy: 0,
        capacity: 0,
        prev: None,
        next: None,
    };
}

/// A bounded table of cache nodes plus the frame source backing their slabs.
pub struct CacheTable<F, const N: usize> {
    source: F,
    nodes: [CacheNode; N],
    in_use: [bool; N],
}

unsafe impl<F, const N: usize> Send for CacheTable<F, N> where F: Send {}

impl<F, const N: usize> CacheTable<F, N>
where
    F: FrameSource,
{
    /// Creates an empty table drawing slabs from `source`.
    pub const fn new(source: F) -> Self {
        Self {
            source,
            nodes: [CacheNode::EMPTY; N],
            in_use: [false; N],
        }
    }

    /// Creates a cache for objects of `object_size` bytes.
    ///
    /// Returns `None` if the size is unusable (the sentinel needs four
    /// bytes; a slab holds at least one object) or the node table is full.
    pub fn create(&mut self, object_size: usize) -> Option<Cache> {
        if object_size < size_of::<i32>() || object_size > F::SLAB_SIZE {
            return None;
        }
        let head = self.reserve_node(object_size)?;
        Some(Cache { head })
    }

    /// Allocates one object from `cache`.
    ///
    /// Returns `None` when no slab can be obtained or the node table is
    /// exhausted. The object's bytes beyond the slot header are untouched
    /// free-slot state; callers initialize the object themselves.
    pub fn allocate(&mut self, cache: &Cache) -> Option<NonNull<u8>> {
        let mut index = cache.head;
        loop {
            if self.nodes[index].slab.is_none() {
                let slab = self.source.alloc_frame()?;
                stamp_free_slots(slab, self.nodes[index].object_size, F::SLAB_SIZE);
                self.nodes[index].slab = Some(slab);
            }

            if self.nodes[index].occupancy < self.nodes[index].capacity {
                return Some(self.take_slot(index));
            }

            // This slab is full; cascade to the next cache in the chain,
            // growing it on demand.
            index = match self.nodes[index].next {
                Some(next) => next,
                None => {
                    let next = self.reserve_node(self.nodes[index].object_size)?;
                    self.nodes[next].prev = Some(index);
                    self.nodes[index].next = Some(next);
                    next
                }
            };
        }
    }

    /// Returns `obj` to `cache`.
    ///
    /// An object that belongs to no slab in the chain is ignored: that is a
    /// caller bug, but not one worth a panic. Draining a node releases its
    /// slab; a drained extension node is also spliced out of the chain.
    ///
    /// # Safety
    ///
    /// `obj` must not be accessed after this call, and must not be freed
    /// twice.
    pub unsafe fn deallocate(&mut self, cache: &Cache, obj: NonNull<u8>) {
        let mut index = Some(cache.head);
        while let Some(i) = index {
            index = self.nodes[i].next;

            let Some(slab) = self.nodes[i].slab else {
                continue;
            };
            let base = slab.addr().get();
            let addr = obj.addr().get();
            if !(base..base + F::SLAB_SIZE).contains(&addr) {
                continue;
            }
            if (addr - base) % self.nodes[i].object_size != 0 {
                // Inside the slab but not on a slot boundary.
                return;
            }
            if unsafe { obj.cast::<i32>().read_unaligned() } == FREE_SENTINEL {
                return;
            }

            unsafe {
                obj.cast::<i32>().write_unaligned(FREE_SENTINEL);
            }
            self.nodes[i].occupancy -= 1;

            if self.nodes[i].occupancy == 0 {
                let slab = self.nodes[i].slab.take().unwrap();
                unsafe {
                    self.source.release_frame(slab);
                }
                if i != cache.head {
                    self.splice_out(i);
                }
            }
            return;
        }
    }

    /// Tears down `cache`, releasing every node in its chain.
    ///
    /// # Panics
    ///
    /// Panics if any object is still allocated.
    pub fn destroy(&mut self, cache: Cache) {
        let mut index = Some(cache.head);
        while let Some(i) = index {
            index = self.nodes[i].next;
            assert_eq!(
                self.nodes[i].occupancy, 0,
                "destroying a cache with live objects"
            );
            if let Some(slab) = self.nodes[i].slab.take() {
                unsafe {
                    self.source.release_frame(slab);
                }
            }
            self.nodes[i] = CacheNode::EMPTY;
            self.in_use[i] = false;
        }
    }

    /// Returns the number of objects currently allocated from `cache`.
    pub fn live_objects(&self, cache: &Cache) -> usize {
        let mut count = 0;
        let mut index = Some(cache.head);
        while let Some(i) = index {
            count += self.nodes[i].occupancy;
            index = self.nodes[i].next;
        }
        count
    }

    fn reserve_node(&mut self, object_size: usize) -> Option<usize> {
        let index = self.in_use.iter().position(|used| !used)?;
        self.in_use[index] = true;
        self.nodes[index] = CacheNode {
            slab: None,
            object_size,
            occupancy: 0,
            capacity: F::SLAB_SIZE / object_size,
            prev: None,
            next: None,
        };
        Some(index)
    }

    /// Finds the first free slot in node `index`'s slab and claims it.
    fn take_slot(&mut self, index: usize) -> NonNull<u8> {
        let node = self.nodes[index];
        let slab = node.slab.unwrap();
        for slot in 0..node.capacity {
            let ptr = unsafe { slab.add(slot * node.object_size) };
            if unsafe { ptr.cast::<i32>().read_unaligned() } == FREE_SENTINEL {
                unsafe {
                    ptr.cast::<i32>().write_unaligned(0);
                }
                self.nodes[index].occupancy += 1;
                return ptr;
            }
        }
        unreachable!("occupancy below capacity but no free slot");
    }

    fn splice_out(&mut self, index: usize) {
        let prev = self.nodes[index]
            .prev
            .expect("only extension nodes are spliced");
        let next = self.nodes[index].next;
        self.nodes[prev].next = next;
        if let Some(next) = next {
            self.nodes[next].prev = Some(prev);
        }
        self.nodes[index] = CacheNode::EMPTY;
        self.in_use[index] = false;
    }
}

fn stamp_free_slots(slab: NonNull<u8>, object_size: usize, slab_size: usize) {
    let mut offset = 0;
    while offset + object_size <= slab_size {
        unsafe {
            slab.add(offset).cast::<i32>().write_unaligned(FREE_SENTINEL);
        }
        offset += object_size;
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashSet};

    use super::*;

    const SLAB_SIZE: usize = 4096;

    #[repr(align(4096))]
    struct Arena([u8; SLAB_SIZE * 16]);

    /// Hands out slabs from a leaked arena and tracks how many are out.
    struct TestSource {
        free: RefCell<Vec<NonNull<u8>>>,
        total: usize,
    }

    impl TestSource {
        fn new() -> Self {
            let arena = Box::leak(Box::new(Arena([0; SLAB_SIZE * 16])));
            let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
            let free = (0..16).map(|i| unsafe { base.add(i * SLAB_SIZE) }).collect();
            Self {
                free: RefCell::new(free),
                total: 16,
            }
        }

        fn outstanding(&self) -> usize {
            self.total - self.free.borrow().len()
        }
    }

    impl FrameSource for TestSource {
        const SLAB_SIZE: usize = SLAB_SIZE;

        fn alloc_frame(&self) -> Option<NonNull<u8>> {
            self.free.borrow_mut().pop()
        }

        unsafe fn release_frame(&self, frame: NonNull<u8>) {
            self.free.borrow_mut().push(frame);
        }
    }

    type TestTable = CacheTable<TestSource, 8>;

    #[test]
    fn create_rejects_bad_sizes() {
        let mut table = TestTable::new(TestSource::new());
        assert!(table.create(0).is_none());
        assert!(table.create(3).is_none());
        assert!(table.create(SLAB_SIZE + 1).is_none());
        assert!(table.create(4).is_some());
        assert!(table.create(SLAB_SIZE).is_some());
    }

    #[test]
    fn objects_are_slot_aligned_and_distinct() {
        let mut table = TestTable::new(TestSource::new());
        let cache = table.create(64).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let obj = table.allocate(&cache).unwrap();
            assert_eq!(obj.addr().get() % 64, 0);
            assert!(seen.insert(obj.addr()), "slot handed out twice");
        }
        assert_eq!(table.live_objects(&cache), 10);
    }

    #[test]
    fn slab_lifecycle_binds_and_releases_frames() {
        let mut table = TestTable::new(TestSource::new());
        let cache = table.create(64).unwrap();
        assert_eq!(table.source.outstanding(), 0);

        // One slab holds exactly 64 objects of 64 bytes.
        let mut objs = vec![];
        for _ in 0..64 {
            objs.push(table.allocate(&cache).unwrap());
        }
        assert_eq!(table.source.outstanding(), 1);

        // The 65th cascades onto a second slab.
        objs.push(table.allocate(&cache).unwrap());
        assert_eq!(table.source.outstanding(), 2);

        for obj in objs.drain(..) {
            unsafe {
                table.deallocate(&cache, obj);
            }
        }
        assert_eq!(table.source.outstanding(), 0);
        assert_eq!(table.live_objects(&cache), 0);

        // The drained cache is still usable through the same handle.
        let obj = table.allocate(&cache).unwrap();
        assert_eq!(table.source.outstanding(), 1);
        unsafe {
            table.deallocate(&cache, obj);
        }
        assert_eq!(table.source.outstanding(), 0);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut table = TestTable::new(TestSource::new());
        let cache = table.create(128).unwrap();

        let first = table.allocate(&cache).unwrap();
        let _second = table.allocate(&cache).unwrap();
        unsafe {
            table.deallocate(&cache, first);
        }
        assert_eq!(table.allocate(&cache), Some(first));
    }

    #[test]
    fn draining_a_middle_node_splices_it_out() {
        let mut table = TestTable::new(TestSource::new());
        // Two objects per slab makes chains easy to build.
        let cache = table.create(SLAB_SIZE / 2).unwrap();

        let mut objs: Vec<_> = (0..6).map(|_| table.allocate(&cache).unwrap()).collect();
        assert_eq!(table.source.outstanding(), 3);

        // Free the middle slab's two objects (indices 2 and 3).
        unsafe {
            table.deallocate(&cache, objs[2]);
            table.deallocate(&cache, objs[3]);
        }
        assert_eq!(table.source.outstanding(), 2);
        assert_eq!(table.live_objects(&cache), 4);

        // The remaining objects still free cleanly through the chain.
        unsafe {
            table.deallocate(&cache, objs[4]);
            table.deallocate(&cache, objs[5]);
            table.deallocate(&cache, objs[0]);
            table.deallocate(&cache, objs[1]);
        }
        objs.clear();
        assert_eq!(table.source.outstanding(), 0);
    }

    #[test]
    fn foreign_and_double_frees_are_ignored() {
        let mut table = TestTable::new(TestSource::new());
        let cache = table.create(64).unwrap();
        let obj = table.allocate(&cache).unwrap();

        let mut foreign = [0u8; 8];
        unsafe {
            table.deallocate(&cache, NonNull::new(foreign.as_mut_ptr()).unwrap());
        }
        assert_eq!(table.live_objects(&cache), 1);

        unsafe {
            table.deallocate(&cache, obj);
            table.deallocate(&cache, obj);
        }
        assert_eq!(table.live_objects(&cache), 0);
    }

    #[test]
    fn node_table_exhaustion_fails_allocation() {
        let mut table = CacheTable::<TestSource, 2>::new(TestSource::new());
        let cache = table.create(SLAB_SIZE).unwrap();

        // One object per slab; the second allocation needs an extension
        // node, the third finds the table full.
        let a = table.allocate(&cache).unwrap();
        let b = table.allocate(&cache).unwrap();
        assert!(table.allocate(&cache).is_none());

        unsafe {
            table.deallocate(&cache, b);
            table.deallocate(&cache, a);
        }
    }

    #[test]
    fn destroy_releases_nodes() {
        let mut table = CacheTable::<TestSource, 2>::new(TestSource::new());
        let a = table.create(64).unwrap();
        let b = table.create(64).unwrap();
        assert!(table.create(64).is_none());

        table.destroy(a);
        table.destroy(b);
        assert!(table.create(64).is_some());
    }

    #[test]
    #[should_panic(expected = "live objects")]
    fn destroy_with_live_objects_panics() {
        let mut table = TestTable::new(TestSource::new());
        let cache = table.create(64).unwrap();
        let _obj = table.allocate(&cache).unwrap();
        table.destroy(cache);
    }
}
