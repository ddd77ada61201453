/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Slab cache nodes available system-wide.
pub const KMEM_CACHE_MAX: usize = 200;

/// Mapped file regions per process.
pub const MMAP_INFO_MAX: usize = 64;
