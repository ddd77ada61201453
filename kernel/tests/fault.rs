//! Fault-handler rejection paths and the kernel copy routines.

mod common;

use common::{open_mem_file, read_byte, setup, va, write_byte};
use kernel::{
    error::KernelError,
    memory::{
        PAGE_SIZE,
        mmap::{MmapFlags, MmapProt},
        page_table::PtEntryFlags,
        vm_user::UserMemory,
    },
};

#[test]
fn faults_past_the_break_are_rejected() {
    setup();

    let mut um = UserMemory::new().unwrap();
    assert_eq!(
        um.handle_fault(va(0)).unwrap_err(),
        KernelError::AccessBeyondBreak(va(0))
    );

    um.grow_lazy(PAGE_SIZE).unwrap();
    um.handle_fault(va(10)).unwrap();
    assert_eq!(
        um.handle_fault(va(PAGE_SIZE + 10)).unwrap_err(),
        KernelError::AccessBeyondBreak(va(PAGE_SIZE + 10))
    );
}

#[test]
fn stack_guard_page_kills_the_access() {
    setup();

    let mut um = UserMemory::new().unwrap();
    um.grow_eager(2 * PAGE_SIZE, PtEntryFlags::URWX).unwrap();
    // The page below the stack loses its user bit, as exec arranges it.
    um.clear_user_access(va(0));

    assert_eq!(
        um.handle_fault(va(8)).unwrap_err(),
        KernelError::StackGuardPage(va(8))
    );
    // The page above the guard stays usable.
    write_byte(&mut um, PAGE_SIZE + 8, 0x77);
    assert_eq!(read_byte(&mut um, PAGE_SIZE + 8), 0x77);
}

#[test]
fn write_faults_on_read_only_mappings_are_rejected() {
    setup();

    let (file, _) = open_mem_file(vec![0_u8; PAGE_SIZE], true, false);
    let mut um = UserMemory::new().unwrap();
    let base = um
        .mmap(PAGE_SIZE, MmapProt::READ, MmapFlags::PRIVATE, file, 0)
        .unwrap();

    // The first fault maps the page read-only; a second fault on the same
    // page is an illegal access, not more demand paging.
    um.handle_fault(base).unwrap();
    assert_eq!(
        um.handle_fault(base).unwrap_err(),
        KernelError::InaccessiblePage(base)
    );

    // The kernel-side write path refuses as well.
    assert!(um.copy_out(base, &[1]).is_err());
}

#[test]
fn copy_routines_cross_page_boundaries() {
    setup();

    let mut um = UserMemory::new().unwrap();
    um.grow_lazy(4 * PAGE_SIZE).unwrap();

    let pattern: Vec<u8> = (0..2 * PAGE_SIZE + 33).map(|i| (i % 241) as u8).collect();
    let dst = va(PAGE_SIZE - 17);
    um.copy_out(dst, &pattern).unwrap();

    let mut read_back = vec![0_u8; pattern.len()];
    um.copy_in(&mut read_back, dst).unwrap();
    assert_eq!(read_back, pattern);
}

#[test]
fn copy_in_str_finds_the_terminator() {
    setup();

    let mut um = UserMemory::new().unwrap();
    um.grow_lazy(2 * PAGE_SIZE).unwrap();

    // The string straddles the page boundary, NUL included.
    let s = b"echo hello world\0";
    um.copy_out(va(PAGE_SIZE - 5), s).unwrap();

    let mut buf = [0_u8; 64];
    let len = um.copy_in_str(&mut buf, va(PAGE_SIZE - 5)).unwrap();
    assert_eq!(len, s.len() - 1);
    assert_eq!(&buf[..=len], s);

    // Without a terminator in range the copy fails.
    um.copy_out(va(0), &[b'x'; 64]).unwrap();
    let mut small = [0_u8; 32];
    assert_eq!(
        um.copy_in_str(&mut small, va(0)).unwrap_err(),
        KernelError::UnterminatedUserString
    );

    // An unmapped source page is an error, not a lazy allocation.
    let fresh = UserMemory::new().unwrap();
    let mut buf = [0_u8; 8];
    assert_eq!(
        fresh.copy_in_str(&mut buf, va(3 * PAGE_SIZE)).unwrap_err(),
        KernelError::VirtualPageNotMapped(va(3 * PAGE_SIZE))
    );
}
