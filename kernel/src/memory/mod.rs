pub use self::addr::{PageRound, PhysAddr, PhysPageNum, VirtAddr};

/// Bytes per page
pub const PAGE_SIZE: usize = 4096;

/// Bits of offset within a page
pub const PAGE_SHIFT: usize = 12;

pub mod addr;
pub mod layout;
pub mod mmap;
pub mod page;
pub mod page_table;
pub mod slab;
pub mod vm_user;

/// Flushes the TLB after a mapping was narrowed or replaced.
///
/// Newly created mappings (invalid to valid) need no flush; the hardware
/// never cached them.
pub(crate) fn flush_page(_va: VirtAddr) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        riscv::asm::sfence_vma_all();
    }
}
