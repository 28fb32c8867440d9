//! Deployment constants. The on-disk constants (block size, log capacity,
//! addressing widths) must agree with the image produced by `mkfs`.

/// Block size.
pub const BSIZE: usize = 1024;

/// Max # of blocks any single FS operation writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;
