//! Physical memory layout
//!
//! qemu -machine virt is set up like this,
//! based on qemu's hw/riscv/virt.c:
//!
//! ```text
//! 80000000 -- boot ROM jumps here in machine mode,
//!             kernel text and data
//! end -- start of kernel page allocation area
//! PHYS_TOP -- end of RAM used by the kernel
//! ```
//!
//! Boot code hands `[end, PHYS_TOP)` to [`super::page::init`]; frames below
//! `end` hold kernel text and are never reference counted.

/// Start of RAM, where the kernel is loaded.
pub const KERN_BASE: usize = 0x8000_0000;

/// End of the RAM used by the kernel.
pub const PHYS_TOP: usize = KERN_BASE + 128 * 1024 * 1024;
