#![allow(dead_code)]

use std::{
    cmp,
    ptr::NonNull,
    sync::{Mutex, Once},
};

use kernel::{
    error::KernelError,
    file::{File, Inode},
    memory::{self, PAGE_SIZE, VirtAddr, page, vm_user::UserMemory},
};

/// Simulated physical RAM handed to the page allocator, in pages.
const ARENA_PAGES: usize = 2048;

/// Brings up the memory subsystem once per test binary, in boot order.
pub fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let arena = vec![0u8; (ARENA_PAGES + 1) * PAGE_SIZE].leak();
        let range = arena.as_mut_ptr_range();
        let range = NonNull::new(range.start).unwrap()..NonNull::new(range.end).unwrap();
        unsafe {
            page::init(range);
        }
        memory::slab::init();
        kernel::file::init();
    });
}

/// An in-memory file standing in for the on-disk file system.
pub struct MemInode(pub Mutex<Vec<u8>>);

impl Inode for MemInode {
    fn read_at(&self, dst: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let data = self.0.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = cmp::min(dst.len(), data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, src: &[u8], offset: usize) -> Result<usize, KernelError> {
        let mut data = self.0.lock().unwrap();
        if data.len() < offset + src.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

/// Opens an in-memory file over `data`, returning the handle and the inode
/// for inspecting the "disk" afterwards.
pub fn open_mem_file(
    data: Vec<u8>,
    readable: bool,
    writable: bool,
) -> (File, &'static MemInode) {
    let inode: &'static MemInode = Box::leak(Box::new(MemInode(Mutex::new(data))));
    let file = File::new(inode, readable, writable).unwrap();
    (file, inode)
}

pub fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr).unwrap()
}

pub fn read_byte(um: &mut UserMemory, addr: usize) -> u8 {
    let mut byte = [0_u8];
    um.copy_in(&mut byte, va(addr)).unwrap();
    byte[0]
}

pub fn write_byte(um: &mut UserMemory, addr: usize, value: u8) {
    um.copy_out(va(addr), &[value]).unwrap();
}

/// Moves some frames onto the calling thread's freelist shard so that
/// `nfree_local` deltas are meaningful on a shard that started empty.
pub fn warm_local_shard(pages: usize) {
    let mut um = UserMemory::new().unwrap();
    um.grow_lazy(pages * PAGE_SIZE).unwrap();
    for i in 0..pages {
        write_byte(&mut um, i * PAGE_SIZE, 0);
    }
    drop(um);
}
