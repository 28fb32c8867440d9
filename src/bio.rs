//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! reduces the number of disk reads and gives the rest of the file system
//! a single synchronization point per block: any given `(dev, blockno)`
//! lives in at most one buffer, and that buffer's sleep lock serializes
//! everyone touching its bytes.
//!
//! Residency is sharded: each cached block is recorded in one of
//! `NBUFMAP_BUCKET` bucket chains picked by hashing its key, and each
//! bucket has its own spin lock, so lookups of unrelated blocks do not
//! contend. A miss triggers an eviction: the least recently released
//! buffer with no references anywhere in the cache is stolen and re-keyed.
//! A second array of per-key eviction locks serializes misses on the same
//! key, so two threads cannot both steal a victim for one block.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `bread`.
//! * After changing buffer data, call `Buf::write` to push it to disk.
//! * Dropping the `Buf` releases it; do not hold buffers longer than
//!   necessary.
//! * The log pins buffers of uncommitted transactions with `Buf::pin` so
//!   they cannot be evicted, and drops the pin with `Buf::unpin` once the
//!   blocks are installed.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use array_macro::array;
use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::hal::DiskDevice;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock, SpinLockGuard};
use crate::param::{BSIZE, NBUF};

/// Number of residency buckets. Prime, so consecutive block numbers spread.
const NBUFMAP_BUCKET: usize = 13;

const_assert!(BSIZE % 8 == 0);

fn bufmap_hash(dev: u32, blockno: u32) -> usize {
    let key = ((dev as u64) << 27) | blockno as u64;
    (key % NBUFMAP_BUCKET as u64) as usize
}

/// One block worth of bytes, aligned so the block can be viewed as on-disk
/// records (which hold `u32`s at least).
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub(crate) const fn zeroed() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Contents of one buffer slot, guarded by the slot's sleep lock.
struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            data: BufData::zeroed(),
        }
    }
}

/// Residency record of one buffer slot. Lives in the chain of the bucket
/// its key hashes to, and is guarded by that bucket's lock; while a slot is
/// being moved between buckets it is reachable from neither and the moving
/// thread has it to itself.
#[derive(Clone, Copy)]
struct BufMeta {
    slot: usize,
    dev: u32,
    blockno: u32,
    /// Nonzero while any `Buf` guard or log pin refers to the slot; the
    /// slot cannot be evicted until it drops back to zero.
    refcnt: u32,
    /// Stamp of the release that made `refcnt` zero; eviction takes the
    /// smallest.
    last_use: u64,
}

struct Bucket {
    chain: ArrayVec<BufMeta, NBUF>,
}

pub struct Bcache {
    buckets: [SpinLock<Bucket>; NBUFMAP_BUCKET],
    /// Serializes the whole miss path per bucket index, keeping the bucket
    /// locks themselves short-lived.
    eviction_locks: [SpinLock<()>; NBUFMAP_BUCKET],
    slots: [SleepLock<BufInner>; NBUF],
    /// Monotonic release clock for LRU ordering. Relaxed readers may see a
    /// slightly stale value; that only perturbs eviction order.
    ticks: AtomicU64,
}

impl Bcache {
    pub fn new() -> Self {
        let mut cache = Self {
            buckets: array![_ => SpinLock::new("bcache.bucket", Bucket { chain: ArrayVec::new() }); NBUFMAP_BUCKET],
            eviction_locks: array![_ => SpinLock::new("bcache.evict", ()); NBUFMAP_BUCKET],
            slots: array![_ => SleepLock::new("buffer", BufInner::new()); NBUF],
            ticks: AtomicU64::new(0),
        };
        // Every slot starts out resident under a key on device 0, which is
        // never read, so the initial population is pure eviction fodder.
        for slot in 0..NBUF {
            let blockno = slot as u32;
            let bucket = cache.buckets[bufmap_hash(0, blockno)].get_mut();
            bucket.chain.push(BufMeta {
                slot,
                dev: 0,
                blockno,
                refcnt: 0,
                last_use: 0,
            });
        }
        cache
    }

    /// Returns a locked buffer holding the contents of the indicated block,
    /// reading it from disk if the cache does not already have it.
    pub fn bread<'s>(&'s self, disk: &dyn DiskDevice, dev: u32, blockno: u32) -> Buf<'s> {
        let mut b = self.bget(dev, blockno);
        if !b.inner.valid {
            disk.rw(dev, blockno, &mut b.inner.data, false);
            b.inner.valid = true;
        }
        b
    }

    /// Returns a locked buffer for the indicated block without touching the
    /// disk. The caller is about to overwrite the whole block.
    pub(crate) fn bget_for_overwrite<'s>(&'s self, dev: u32, blockno: u32) -> Buf<'s> {
        self.bget(dev, blockno)
    }

    /// Looks through the cache for the block; on a miss, recycles the least
    /// recently used unreferenced buffer. Either way the returned buffer is
    /// locked.
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = bufmap_hash(dev, blockno);

        // Cached?
        {
            let mut bucket = self.buckets[key].lock();
            if let Some(meta) = bucket
                .chain
                .iter_mut()
                .find(|m| m.dev == dev && m.blockno == blockno)
            {
                meta.refcnt += 1;
                let slot = meta.slot;
                drop(bucket);
                return self.lock_slot(slot, dev, blockno);
            }
        }

        // Not cached. Serialize misses on this key so two threads cannot
        // race to steal a victim for the same block.
        let _eviction = self.eviction_locks[key].lock();

        // The block may have arrived while we waited for the eviction lock.
        {
            let mut bucket = self.buckets[key].lock();
            if let Some(meta) = bucket
                .chain
                .iter_mut()
                .find(|m| m.dev == dev && m.blockno == blockno)
            {
                meta.refcnt += 1;
                let slot = meta.slot;
                drop(bucket);
                // Drop the eviction lock before the sleep lock: the slot
                // may be locked by another thread, and we must not suspend
                // while holding a spin lock.
                drop(_eviction);
                return self.lock_slot(slot, dev, blockno);
            }
        }

        // Steal the globally least recently used unreferenced buffer.
        // Buckets are visited in index order holding at most two bucket
        // locks: the one being scanned and the one owning the best
        // candidate so far. The owned index is always below the scanned
        // index, so concurrent scans cannot deadlock, and holding the
        // candidate's bucket lock keeps another scan from stealing it.
        let mut victim: Option<(SpinLockGuard<'_, Bucket>, usize)> = None;
        for i in 0..NBUFMAP_BUCKET {
            let bucket = self.buckets[i].lock();
            let local_best = bucket
                .chain
                .iter()
                .enumerate()
                .filter(|(_, m)| m.refcnt == 0)
                .min_by_key(|(_, m)| m.last_use)
                .map(|(pos, m)| (pos, m.last_use));
            if let Some((pos, last_use)) = local_best {
                let better = match &victim {
                    None => true,
                    Some((held, vpos)) => last_use < held.chain[*vpos].last_use,
                };
                if better {
                    // Replacing the option releases the previously held
                    // bucket lock.
                    victim = Some((bucket, pos));
                }
            }
        }

        let (mut holder, pos) = match victim {
            Some(v) => v,
            None => panic!("bget: no buffers"),
        };
        let old = holder.chain[pos];
        let slot = old.slot;

        if bufmap_hash(old.dev, old.blockno) != key {
            // Unlink from the owning bucket, then link under the new key.
            holder.chain.swap_remove(pos);
            drop(holder);
            let mut bucket = self.buckets[key].lock();
            bucket.chain.push(BufMeta {
                slot,
                dev,
                blockno,
                refcnt: 1,
                last_use: old.last_use,
            });
            // SAFETY: the victim had refcnt == 0, so no sleep-lock holder
            // exists, and none can appear before this bucket lock is
            // released makes the new mapping visible.
            unsafe { (*self.slots[slot].get_mut_raw()).valid = false };
        } else {
            let meta = &mut holder.chain[pos];
            meta.dev = dev;
            meta.blockno = blockno;
            meta.refcnt = 1;
            // SAFETY: as above.
            unsafe { (*self.slots[slot].get_mut_raw()).valid = false };
            drop(holder);
        }

        drop(_eviction);
        self.lock_slot(slot, dev, blockno)
    }

    fn lock_slot<'s>(&'s self, slot: usize, dev: u32, blockno: u32) -> Buf<'s> {
        Buf {
            cache: self,
            slot,
            dev,
            blockno,
            inner: ManuallyDrop::new(self.slots[slot].lock()),
        }
    }

    /// Adjusts the reference count of a resident block under its bucket
    /// lock. `pin`/`unpin` and the release half of `Buf::drop` all funnel
    /// through here.
    fn refcnt_add(&self, dev: u32, blockno: u32, delta: i32) {
        let key = bufmap_hash(dev, blockno);
        let mut bucket = self.buckets[key].lock();
        let meta = bucket
            .chain
            .iter_mut()
            .find(|m| m.dev == dev && m.blockno == blockno)
            .expect("bcache: block not resident");
        if delta > 0 {
            meta.refcnt += delta as u32;
        } else {
            assert!(meta.refcnt >= (-delta) as u32, "bcache: refcnt underflow");
            meta.refcnt -= (-delta) as u32;
            if meta.refcnt == 0 {
                meta.last_use = self.ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A locked buffer: exclusive access to one cached block's bytes.
///
/// Dropping the guard first releases the sleep lock and then drops the
/// cache reference, stamping the LRU clock if no reference remains.
pub struct Buf<'s> {
    cache: &'s Bcache,
    slot: usize,
    dev: u32,
    blockno: u32,
    inner: ManuallyDrop<SleepLockGuard<'s, BufInner>>,
}

impl Buf<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Index of the slot backing this buffer. Tests use it to check that
    /// residency never leaves the fixed slot array.
    #[allow(dead_code)]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub fn data(&self) -> &BufData {
        &self.inner.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.inner.data
    }

    /// Marks the contents as initialized without a disk read. Only for
    /// callers that just overwrote the whole block.
    pub(crate) fn mark_valid(&mut self) {
        self.inner.valid = true;
    }

    /// Writes the buffer's contents to disk. The sleep lock is held by
    /// construction, so the bytes cannot change underneath the transfer.
    pub fn write(&mut self, disk: &dyn DiskDevice) {
        disk.rw(self.dev, self.blockno, &mut self.inner.data, true);
    }

    /// Takes an extra cache reference so the buffer survives release and
    /// cannot be evicted; used by the log for blocks of an uncommitted
    /// transaction.
    pub fn pin(&self) {
        self.cache.refcnt_add(self.dev, self.blockno, 1);
    }

    /// Drops a reference taken with `pin`.
    pub fn unpin(&self) {
        self.cache.refcnt_add(self.dev, self.blockno, -1);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the sleep lock before giving up the reference, so the
        // buffer can never be eviction-eligible while still locked.
        // SAFETY: `self.inner` is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        self.cache.refcnt_add(self.dev, self.blockno, -1);
    }
}
