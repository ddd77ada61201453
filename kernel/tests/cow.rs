//! Copy-on-write fork: frames stay shared until somebody writes.

mod common;

use common::{read_byte, setup, warm_local_shard, write_byte};
use kernel::memory::{PAGE_SIZE, page, vm_user::UserMemory};

#[test]
fn fork_shares_frames_and_copies_on_write() {
    setup();
    warm_local_shard(24);
    let baseline = page::nfree_local();

    let mut parent = UserMemory::new().unwrap();
    parent.grow_lazy(8 * PAGE_SIZE).unwrap();
    write_byte(&mut parent, 0x4000, 0xAB);

    // Fork shares the one touched data frame; only the child's interior
    // page-table pages are allocated.
    let mut child = UserMemory::new().unwrap();
    let before = page::nfree_local();
    parent.fork_clone_into(&mut child).unwrap();
    assert_eq!(before - page::nfree_local(), 2);

    // Reading either side sees the parent's byte, without copying.
    let before = page::nfree_local();
    assert_eq!(read_byte(&mut parent, 0x4000), 0xAB);
    assert_eq!(read_byte(&mut child, 0x4000), 0xAB);
    assert_eq!(page::nfree_local(), before);

    // The child's write copies the frame, exactly one.
    let before = page::nfree_local();
    write_byte(&mut child, 0x4000, 0xCD);
    assert_eq!(before - page::nfree_local(), 1);

    assert_eq!(read_byte(&mut parent, 0x4000), 0xAB);
    assert_eq!(read_byte(&mut child, 0x4000), 0xCD);

    // The parent is the last holder now; its write reuses the frame.
    let before = page::nfree_local();
    write_byte(&mut parent, 0x4000, 0x5A);
    assert_eq!(page::nfree_local(), before);
    assert_eq!(read_byte(&mut parent, 0x4000), 0x5A);
    assert_eq!(read_byte(&mut child, 0x4000), 0xCD);

    // Everything comes back.
    drop(child);
    drop(parent);
    assert_eq!(page::nfree_local(), baseline);
}
