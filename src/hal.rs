//! The block device contract consumed by the file system, and a RAM-backed
//! reference device.
//!
//! The real driver (virtio on the original machine) lives outside this
//! crate. Everything the file system needs from it is one synchronous
//! transfer primitive: move `BSIZE` bytes between a buffer and a block,
//! returning only once the transfer is durable.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::param::BSIZE;

/// A synchronous block device.
///
/// `rw` transfers the block `(dev, blockno)`: into `data` when `write` is
/// false, out of `data` when `write` is true. The call returns only when
/// the transfer is durable. I/O errors are not modelled; a device that
/// cannot complete a transfer should panic.
pub trait DiskDevice: Send + Sync {
    fn rw(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool);
}

/// A memory-backed disk.
///
/// Stands in for the driver during tests and experiments. Besides the plain
/// block array it keeps a write-cutoff failpoint: after
/// `crash_after_writes(n)`, only the next `n` writes reach the block array
/// and every later one is silently dropped, which is what a power failure
/// in the middle of a commit looks like from the disk's point of view.
/// `snapshot` then captures the surviving image for a re-mount.
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
    writes_left: AtomicI64,
    writes_done: AtomicU64,
}

impl MemDisk {
    /// A zero-filled disk of `nblocks` blocks.
    pub fn new(nblocks: usize) -> Self {
        Self::from_image(vec![[0; BSIZE]; nblocks])
    }

    /// A disk initialized with `image`.
    pub fn from_image(image: Vec<[u8; BSIZE]>) -> Self {
        Self {
            blocks: Mutex::new(image),
            writes_left: AtomicI64::new(i64::MAX),
            writes_done: AtomicU64::new(0),
        }
    }

    /// Drop every write after the next `n`.
    pub fn crash_after_writes(&self, n: i64) {
        self.writes_left.store(n, Ordering::SeqCst);
    }

    /// Number of writes that actually reached the block array.
    pub fn write_count(&self) -> u64 {
        self.writes_done.load(Ordering::SeqCst)
    }

    /// Copy of the current on-disk image.
    pub fn snapshot(&self) -> Vec<[u8; BSIZE]> {
        self.blocks.lock().unwrap().clone()
    }
}

impl DiskDevice for MemDisk {
    fn rw(&self, _dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        if write {
            if self.writes_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
                // Power is gone; the write never happens.
                return;
            }
            self.blocks.lock().unwrap()[blockno as usize] = *data;
            self.writes_done.fetch_add(1, Ordering::SeqCst);
        } else {
            *data = self.blocks.lock().unwrap()[blockno as usize];
        }
    }
}
