use core::{
    array,
    ops::Range,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use mutex_api::Mutex;

struct Run {
    next: Option<NonNull<Run>>,
}

/// A LIFO stack of free frames, one per CPU, protected by its shard's lock.
pub struct FreeList {
    head: Option<NonNull<Run>>,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self { head: None }
    }
}

/// One CPU's share of the allocator.
///
/// `nfree` mirrors the list length. It is written only while `list` is held
/// and read without the lock by the steal probe and diagnostics.
struct Shard<M> {
    list: M,
    nfree: AtomicUsize,
}

/// The state of a single frame.
struct FrameState {
    /// The reference count of the frame. `0` means the frame is free.
    ref_count: AtomicU32,
}

impl FrameState {
    const fn new() -> Self {
        Self {
            ref_count: AtomicU32::new(0),
        }
    }

    fn get(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Increments the count, returning the previous value.
    fn increment(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the count, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if the count is already `0`.
    fn decrement(&self) -> u32 {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                assert!(current > 0, "frame reference count underflow");
                Some(current - 1)
            })
            .unwrap()
    }
}

/// A physical page-frame allocator with `NCPU` freelist shards and a
/// per-frame reference count table.
pub struct FrameAllocator<M, const PAGE_SIZE: usize, const NCPU: usize> {
    shards: [Shard<M>; NCPU],
    states: &'static [FrameState],
    heap: Range<usize>,
}

impl<M, const PAGE_SIZE: usize, const NCPU: usize> FrameAllocator<M, PAGE_SIZE, NCPU>
where
    M: Mutex<Data = FreeList>,
{
    /// Creates an allocator managing the frames in `region`.
    ///
    /// The front of the region is carved off to hold the reference count
    /// table; every remaining page-aligned frame is pushed onto the shard of
    /// `boot_cpu` with a reference count of zero. Other shards fill up
    /// through stealing and later frees.
    ///
    /// # Safety
    ///
    /// `region` must be valid memory, exclusively owned by the allocator for
    /// its whole lifetime, and must not overlap any other allocator's region.
    pub unsafe fn new(region: Range<NonNull<u8>>, boot_cpu: usize) -> Self {
        assert!(size_of::<Run>() <= PAGE_SIZE);
        assert!(boot_cpu < NCPU);

        let base = region.start;
        let base_addr = base.addr().get();
        let region_start = base_addr.next_multiple_of(PAGE_SIZE);
        let region_end = region.end.addr().get() & !(PAGE_SIZE - 1);
        let max_frames = (region_end - region_start) / PAGE_SIZE;
        assert!(
            max_frames > 0,
            "region too small: {region_start:#x}..{region_end:#x}"
        );

        let state_start = base_addr.next_multiple_of(align_of::<FrameState>());
        let state_ptr = unsafe { base.add(state_start - base_addr) }.cast::<FrameState>();
        for i in 0..max_frames {
            unsafe {
                state_ptr.add(i).write(FrameState::new());
            }
        }
        let states = unsafe { slice::from_raw_parts(state_ptr.as_ptr(), max_frames) };

        let state_end = states.as_ptr_range().end.addr();
        let heap_start = state_end.next_multiple_of(PAGE_SIZE);
        assert!(heap_start <= region_end);
        assert!((region_end - heap_start) / PAGE_SIZE <= max_frames);

        let allocator = Self {
            shards: array::from_fn(|_| Shard {
                list: M::new(FreeList::new()),
                nfree: AtomicUsize::new(0),
            }),
            states,
            heap: heap_start..region_end,
        };

        let mut frame = unsafe { base.add(heap_start - base_addr) };
        while frame.addr().get() < region_end {
            unsafe {
                allocator.free(boot_cpu, frame);
                frame = frame.add(PAGE_SIZE);
            }
        }

        allocator
    }

    /// Allocates one frame from `cpu`'s shard, stealing from another shard
    /// if the local one is empty.
    ///
    /// Returns `None` only when every shard is empty. The returned frame is
    /// zeroed and has a reference count of one.
    pub fn alloc(&self, cpu: usize) -> Option<NonNull<u8>> {
        let frame = self.pop(cpu).or_else(|| self.steal(cpu))?;
        unsafe {
            frame.write_bytes(0, PAGE_SIZE);
        }
        let prev = self.state(frame).increment();
        assert_eq!(prev, 0, "frame on a freelist must be unreferenced");
        Some(frame)
    }

    /// Returns `frame` to `cpu`'s freelist.
    ///
    /// The frame is filled with junk to catch dangling references.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is misaligned, outside the managed region, or still
    /// referenced.
    ///
    /// # Safety
    ///
    /// The frame must not be accessed after this call, and must not already
    /// be on a freelist.
    pub unsafe fn free(&self, cpu: usize, frame: NonNull<u8>) {
        assert_eq!(
            self.state(frame).get(),
            0,
            "freed frame must be unreferenced"
        );

        // Fill with junk to catch dangling refs.
        unsafe {
            frame.write_bytes(1, PAGE_SIZE);
        }

        let shard = &self.shards[cpu];
        let mut list = shard.list.lock();
        let mut run = frame.cast::<Run>();
        unsafe {
            run.as_mut().next = list.head;
        }
        list.head = Some(run);
        shard.nfree.fetch_add(1, Ordering::Release);
    }

    /// Records one more holder of `frame`.
    pub fn increment_ref(&self, frame: NonNull<u8>) {
        let prev = self.state(frame).increment();
        assert!(prev > 0, "cannot share an unreferenced frame");
    }

    /// Drops one holder of `frame`; the last holder returns the frame to
    /// `cpu`'s freelist.
    ///
    /// # Panics
    ///
    /// Panics on reference count underflow.
    ///
    /// # Safety
    ///
    /// The caller must actually hold one of the frame's references and must
    /// not access the frame afterwards.
    pub unsafe fn decrement_ref(&self, cpu: usize, frame: NonNull<u8>) {
        let prev = self.state(frame).decrement();
        if prev == 1 {
            unsafe {
                self.free(cpu, frame);
            }
        }
    }

    /// Returns the current reference count of `frame`.
    pub fn ref_count(&self, frame: NonNull<u8>) -> u32 {
        self.state(frame).get()
    }

    /// Returns the number of free frames on `cpu`'s shard.
    pub fn free_frames(&self, cpu: usize) -> usize {
        self.shards[cpu].nfree.load(Ordering::Acquire)
    }

    /// Returns the total number of frames managed by the allocator.
    pub fn total_frames(&self) -> usize {
        (self.heap.end - self.heap.start) / PAGE_SIZE
    }

    /// Returns `true` if `ptr` lies within the managed frame region.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.heap.contains(&ptr.addr().get())
    }

    fn pop(&self, cpu: usize) -> Option<NonNull<u8>> {
        let shard = &self.shards[cpu];
        let mut list = shard.list.lock();
        let run = list.head.take()?;
        list.head = unsafe { run.as_ref().next };
        shard.nfree.fetch_sub(1, Ordering::Release);
        Some(run.cast())
    }

    /// Takes a frame from another CPU's shard.
    ///
    /// Victims are probed round-robin starting past `cpu`. The unlocked
    /// probe reads the shard's `nfree` counter with acquire ordering; the
    /// shard is then locked and re-checked before popping.
    fn steal(&self, cpu: usize) -> Option<NonNull<u8>> {
        for offset in 1..NCPU {
            let victim = (cpu + offset) % NCPU;
            if self.shards[victim].nfree.load(Ordering::Acquire) == 0 {
                continue;
            }
            if let Some(frame) = self.pop(victim) {
                return Some(frame);
            }
        }
        None
    }

    fn state(&self, frame: NonNull<u8>) -> &FrameState {
        let addr = frame.addr().get();
        assert!(
            self.heap.contains(&addr),
            "frame {addr:#x} outside managed region {:#x}..{:#x}",
            self.heap.start,
            self.heap.end
        );
        assert_eq!(addr % PAGE_SIZE, 0, "misaligned frame {addr:#x}");
        &self.states[(addr - self.heap.start) / PAGE_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex as StdMutex, thread};

    use super::*;

    const PAGE_SIZE: usize = 256;
    const NCPU: usize = 4;

    struct TestMutex<T>(StdMutex<T>);

    impl<T> Mutex for TestMutex<T> {
        type Data = T;
        type Guard<'a>
            = std::sync::MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(StdMutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0.lock().unwrap()
        }
    }

    type TestAllocator = FrameAllocator<TestMutex<FreeList>, PAGE_SIZE, NCPU>;

    #[repr(align(256))]
    struct Arena([u8; PAGE_SIZE * 64]);

    fn new_allocator() -> &'static TestAllocator {
        let arena = Box::leak(Box::new(Arena([0; PAGE_SIZE * 64])));
        let range = arena.0.as_mut_ptr_range();
        let range = NonNull::new(range.start).unwrap()..NonNull::new(range.end).unwrap();
        Box::leak(Box::new(unsafe { TestAllocator::new(range, 0) }))
    }

    #[test]
    fn frames_start_on_boot_shard() {
        let allocator = new_allocator();
        assert_eq!(allocator.free_frames(0), allocator.total_frames());
        for cpu in 1..NCPU {
            assert_eq!(allocator.free_frames(cpu), 0);
        }
    }

    #[test]
    fn alloc_returns_zeroed_aligned_frames() {
        let allocator = new_allocator();
        let frame = allocator.alloc(0).unwrap();
        assert_eq!(frame.addr().get() % PAGE_SIZE, 0);
        let bytes = unsafe { slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(allocator.ref_count(frame), 1);
        unsafe {
            allocator.decrement_ref(0, frame);
        }
    }

    #[test]
    fn freed_frames_are_junk_filled_until_reallocated() {
        let allocator = new_allocator();
        let frame = allocator.alloc(0).unwrap();
        unsafe {
            frame.write_bytes(0xAB, PAGE_SIZE);
            allocator.decrement_ref(0, frame);
        }
        // The freelist node occupies the head of the frame; the rest holds
        // the junk pattern.
        let tail = unsafe {
            slice::from_raw_parts(
                frame.as_ptr().add(size_of::<Run>()),
                PAGE_SIZE - size_of::<Run>(),
            )
        };
        assert!(tail.iter().all(|&b| b == 1));
    }

    #[test]
    fn refcount_lifecycle() {
        let allocator = new_allocator();
        let before = allocator.free_frames(0);
        let frame = allocator.alloc(0).unwrap();
        assert_eq!(allocator.free_frames(0), before - 1);

        allocator.increment_ref(frame);
        assert_eq!(allocator.ref_count(frame), 2);

        unsafe {
            allocator.decrement_ref(0, frame);
        }
        // Still referenced, so not back on the freelist.
        assert_eq!(allocator.free_frames(0), before - 1);

        unsafe {
            allocator.decrement_ref(0, frame);
        }
        assert_eq!(allocator.free_frames(0), before);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn refcount_underflow_panics() {
        let allocator = new_allocator();
        let frame = allocator.alloc(0).unwrap();
        unsafe {
            allocator.decrement_ref(0, frame);
        }
        unsafe {
            allocator.decrement_ref(0, frame);
        }
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn misaligned_free_panics() {
        let allocator = new_allocator();
        let frame = allocator.alloc(0).unwrap();
        let inside = NonNull::new(unsafe { frame.as_ptr().add(1) }).unwrap();
        unsafe {
            allocator.decrement_ref(0, inside);
        }
    }

    #[test]
    #[should_panic(expected = "outside managed region")]
    fn out_of_range_free_panics() {
        let allocator = new_allocator();
        let bogus = NonNull::new(PAGE_SIZE as *mut u8).unwrap();
        unsafe {
            allocator.free(0, bogus);
        }
    }

    #[test]
    fn shards_hand_out_disjoint_frames() {
        let allocator = new_allocator();
        let mut seen = HashSet::new();
        let mut frames = vec![];

        // Drain everything, alternating shards; stealing keeps both going.
        let mut cpu = 0;
        while let Some(frame) = allocator.alloc(cpu) {
            assert!(seen.insert(frame.addr()), "frame handed out twice");
            frames.push((cpu, frame));
            cpu = (cpu + 1) % NCPU;
        }
        assert_eq!(frames.len(), allocator.total_frames());
        for cpu in 0..NCPU {
            assert_eq!(allocator.free_frames(cpu), 0);
        }

        for (cpu, frame) in frames {
            unsafe {
                allocator.decrement_ref(cpu, frame);
            }
        }
        let total: usize = (0..NCPU).map(|cpu| allocator.free_frames(cpu)).sum();
        assert_eq!(total, allocator.total_frames());
    }

    #[test]
    fn empty_shard_steals_from_neighbor() {
        let allocator = new_allocator();

        // Move a few frames to CPU 1's shard.
        for _ in 0..4 {
            let frame = allocator.alloc(0).unwrap();
            unsafe {
                allocator.decrement_ref(1, frame);
            }
        }
        assert_eq!(allocator.free_frames(1), 4);

        // Drain CPU 0 completely.
        let mut held = vec![];
        while allocator.free_frames(0) > 0 {
            held.push(allocator.alloc(0).unwrap());
        }

        // The next local allocation succeeds by stealing from CPU 1.
        let stolen = allocator.alloc(0).unwrap();
        assert_eq!(allocator.free_frames(1), 3);

        unsafe {
            allocator.decrement_ref(0, stolen);
        }
        for frame in held {
            unsafe {
                allocator.decrement_ref(0, frame);
            }
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let allocator = new_allocator();
        let mut frames = vec![];
        while let Some(frame) = allocator.alloc(0) {
            frames.push(frame);
        }
        assert!(allocator.alloc(0).is_none());
        assert!(allocator.alloc(2).is_none());

        let frame = frames.pop().unwrap();
        unsafe {
            allocator.decrement_ref(3, frame);
        }
        // Freed onto CPU 3; CPU 0 recovers it by stealing.
        assert_eq!(allocator.alloc(0), Some(frame));
        frames.push(frame);

        for frame in frames {
            unsafe {
                allocator.decrement_ref(0, frame);
            }
        }
    }

    #[test]
    fn concurrent_alloc_free_conserves_frames() {
        let allocator = new_allocator();
        let total = allocator.total_frames();

        thread::scope(|s| {
            for cpu in 0..NCPU {
                s.spawn(move || {
                    for _ in 0..200 {
                        let Some(frame) = allocator.alloc(cpu) else {
                            continue;
                        };
                        allocator.increment_ref(frame);
                        unsafe {
                            allocator.decrement_ref(cpu, frame);
                            allocator.decrement_ref(cpu, frame);
                        }
                    }
                });
            }
        });

        let free: usize = (0..NCPU).map(|cpu| allocator.free_frames(cpu)).sum();
        assert_eq!(free, total);
    }
}
