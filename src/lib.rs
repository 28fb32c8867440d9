//! The on-disk file system core of a teaching kernel, lifted out of the
//! kernel so it can be built, read, and tested on a host.
//!
//! Five layers cooperate over a single block device:
//!
//! * a buffer cache (`bio`) that caches disk blocks, sharded across hash
//!   buckets with per-bucket locks so unrelated blocks do not contend;
//! * a write-ahead log (`fs::log`) giving every operation atomic,
//!   crash-recoverable multi-block updates through group commit;
//! * a block allocator over an on-disk bitmap;
//! * an inode layer with direct, single-indirect, and double-indirect
//!   block addressing, backed by a locked in-memory inode table;
//! * a pathname resolver over fixed-size directory entries.
//!
//! The kernel facilities the file system consumes are narrowed to two
//! seams: a synchronous block device (`DiskDevice`) and the sleep/wakeup
//! primitives inside the lock module. A `FileSystem` value owns all the
//! mutable state; see `FileSystem::init` for mounting and recovery and
//! `FileSystem::begin_op` for transactions.

mod bio;
pub mod fs;
pub mod hal;
mod lock;
pub mod param;

pub use bio::Buf;
pub use fs::mkfs;
pub use fs::{
    FileName, FileSystem, FsTransaction, InodeGuard, InodeType, Path, RcInode, Stat,
};
pub use hal::{DiskDevice, MemDisk};
