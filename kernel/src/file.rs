//! The file seam the memory core maps against.
//!
//! The on-disk file system lives outside this crate; mapped files reach it
//! through [`Inode`]. A [`File`] is the cheap-clone open-file handle the
//! mapping table holds: cloning is `filedup`, the last drop closes. The
//! shared blocks behind the handles come from a slab cache; open files are
//! the classic object the kernel cannot size statically.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering, fence},
};

use once_init::OnceInit;
use slab_allocator::Cache;

use crate::{error::KernelError, memory::slab};

/// Read/write access to one file's data.
///
/// Implementations are expected to bracket each call with the file-system
/// transaction and the inode lock (`begin_op`/`ilock` … `iunlock`/`end_op`)
/// and may sleep; the memory core never holds a spinlock across these
/// calls.
pub trait Inode: Send + Sync {
    /// Reads up to `dst.len()` bytes at `offset`, returning the count read.
    /// Reads past end-of-file return short counts, eventually zero.
    fn read_at(&self, dst: &mut [u8], offset: usize) -> Result<usize, KernelError>;

    /// Writes `src` at `offset`, returning the count written.
    fn write_at(&self, src: &[u8], offset: usize) -> Result<usize, KernelError>;
}

struct FileShared {
    refs: AtomicU32,
    readable: bool,
    writable: bool,
    inode: &'static dyn Inode,
}

static FILE_CACHE: OnceInit<Cache> = OnceInit::new();

/// Sets up the open-file cache. The slab layer must already be initialized.
pub fn init() {
    let object_size = size_of::<FileShared>().next_multiple_of(align_of::<FileShared>());
    FILE_CACHE.init(slab::create(object_size).expect("file cache allocation"));
}

/// Returns the number of open-file blocks currently live, a diagnostic.
pub fn live_files() -> usize {
    slab::live_objects(FILE_CACHE.get())
}

/// An open file handle.
pub struct File {
    shared: NonNull<FileShared>,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    /// Opens `inode` with the given capabilities.
    pub fn new(
        inode: &'static dyn Inode,
        readable: bool,
        writable: bool,
    ) -> Result<Self, KernelError> {
        let obj = slab::allocate(FILE_CACHE.get()).ok_or(KernelError::NoFreeFileTableEntry)?;
        let shared = obj.cast::<FileShared>();
        unsafe {
            shared.write(FileShared {
                refs: AtomicU32::new(1),
                readable,
                writable,
                inode,
            });
        }
        Ok(Self { shared })
    }

    fn shared(&self) -> &FileShared {
        unsafe { self.shared.as_ref() }
    }

    pub fn readable(&self) -> bool {
        self.shared().readable
    }

    pub fn writable(&self) -> bool {
        self.shared().writable
    }

    pub fn read_at(&self, dst: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        self.shared().inode.read_at(dst, offset)
    }

    pub fn write_at(&self, src: &[u8], offset: usize) -> Result<usize, KernelError> {
        self.shared().inode.write_at(src, offset)
    }
}

impl Clone for File {
    /// Another holder of the open file; xv6 calls this `filedup`.
    fn clone(&self) -> Self {
        self.shared().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.shared().refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe {
                slab::deallocate(FILE_CACHE.get(), self.shared.cast());
            }
        }
    }
}
