use crate::memory::VirtAddr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("no free page found")]
    NoFreePage,
    #[error("no free mapping slot")]
    NoFreeMappingSlot,
    #[error("no free file table entry")]
    NoFreeFileTableEntry,
    #[error("too large virtual address: {0:#x}")]
    TooLargeVirtualAddress(usize),
    #[error("virtual address underflow")]
    VirtualAddressUnderflow,
    #[error("page not mapped: {0:#x}")]
    VirtualPageNotMapped(VirtAddr),
    #[error("inaccessible page: {0:#x}")]
    InaccessiblePage(VirtAddr),
    #[error("access beyond process size: {0:#x}")]
    AccessBeyondBreak(VirtAddr),
    #[error("stack guard page touched: {0:#x}")]
    StackGuardPage(VirtAddr),
    #[error("no mapping contains address: {0:#x}")]
    MappingNotFound(VirtAddr),
    #[error("zero-length mapping")]
    ZeroLengthMapping,
    #[error("mapping protection incompatible with file")]
    InvalidMappingProtection,
    #[error("file descriptor not readable")]
    FileDescriptorNotReadable,
    #[error("file descriptor not writable")]
    FileDescriptorNotWritable,
    #[error("mapped file read failed")]
    MappedFileRead,
    #[error("mapped file write failed")]
    MappedFileWrite,
    #[error("heap size overflow")]
    HeapSizeOverflow,
    #[error("user string not NUL-terminated")]
    UnterminatedUserString,
}
