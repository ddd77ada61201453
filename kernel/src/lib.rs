//! The memory-management core of an xv6-style teaching kernel.
//!
//! This crate implements the pieces of the kernel that own physical and
//! virtual memory: the per-CPU physical page allocator with frame reference
//! counts, the slab caches for small kernel objects, the Sv39 page-table
//! engine, and the user virtual-memory manager (lazy heap growth,
//! copy-on-write fork, file-backed `mmap`).
//!
//! The rest of the operating system reaches in through a few narrow seams:
//! the trap layer calls [`memory::vm_user::UserMemory::handle_fault`], the
//! process layer owns one [`memory::vm_user::UserMemory`] per process, and
//! the file system supplies [`file::Inode`] implementations. Boot code is
//! expected to call [`memory::page::init`], [`memory::slab::init`], and
//! [`file::init`] in that order on the boot hart before any allocation.
//!
//! On `riscv64` targets the crate is `no_std`; on other architectures it
//! builds against std with thread-local stand-ins for the hart id and the
//! interrupt enable bit, which is what the integration tests run on.

#![cfg_attr(target_arch = "riscv64", no_std)]

pub mod cpu;
pub mod error;
pub mod file;
pub mod interrupt;
pub mod memory;
pub mod param;
pub mod sync;
