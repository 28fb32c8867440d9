//! Simple logging that allows concurrent FS operations.
//!
//! A log transaction contains the updates of multiple FS operations. The
//! logging system only commits when no FS operation is active, so there is
//! never any reasoning required about whether a commit might write an
//! uncommitted operation's updates to disk.
//!
//! An operation should bracket itself with `begin_op`/`end_op`. Usually
//! `begin_op` just increments the count of in-progress operations and
//! returns, but if it thinks the log is close to running out, it sleeps
//! until the last outstanding `end_op` commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous. Writing the header with a nonzero count is
//! the commit point: before that write reaches the disk a crash discards
//! the transaction, after it recovery re-installs every logged block.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::{Bcache, Buf};
use crate::hal::DiskDevice;
use crate::lock::SleepableLock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

/// Contents of the header block, as it sits on disk.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS operations are executing?
    outstanding: u32,

    /// In commit; please wait.
    committing: bool,

    /// In-memory copy of the header: home block numbers of the running
    /// transaction, in log-slot order. Each listed block is pinned in the
    /// buffer cache until it is installed.
    head: ArrayVec<u32, LOGSIZE>,
}

impl Log {
    /// Recovers from the log left by the previous run, then returns the
    /// ready log state.
    pub fn new(dev: u32, start: u32, size: u32, bcache: &Bcache, disk: &dyn DiskDevice) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            head: ArrayVec::new(),
        };
        log.recover(bcache, disk);
        log
    }

    /// Reads the on-disk header into `head`.
    fn read_head(&mut self, bcache: &Bcache, disk: &dyn DiskDevice) {
        let buf = bcache.bread(disk, self.dev, self.start);
        let (header, _) = LayoutVerified::<_, LogHeader>::new_from_prefix(&buf.data()[..])
            .expect("log: unaligned header block");
        for &blockno in &header.block[..header.n as usize] {
            self.head.push(blockno);
        }
    }

    /// Writes the in-memory header to disk. With a nonzero count this is
    /// the moment the running transaction commits; with a zero count it
    /// erases a finished one.
    fn write_head(&mut self, bcache: &Bcache, disk: &dyn DiskDevice) {
        let mut buf = bcache.bread(disk, self.dev, self.start);
        {
            let (mut header, _) =
                LayoutVerified::<_, LogHeader>::new_from_prefix(&mut buf.data_mut()[..])
                    .expect("log: unaligned header block");
            header.n = self.head.len() as u32;
            for (slot, blockno) in izip!(&mut header.block, &self.head) {
                *slot = *blockno;
            }
        }
        buf.write(disk);
    }

    /// Copies committed blocks from the log to their home locations.
    /// During recovery no buffer was ever pinned, so there is nothing to
    /// unpin.
    fn install_trans(&mut self, bcache: &Bcache, disk: &dyn DiskDevice, recovering: bool) {
        for (tail, &blockno) in self.head.iter().enumerate() {
            let lbuf = bcache.bread(disk, self.dev, self.start + 1 + tail as u32);
            let mut dbuf = bcache.bread(disk, self.dev, blockno);
            dbuf.data_mut().copy_from_slice(&lbuf.data()[..]);
            dbuf.write(disk);
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    /// Copies the cached home blocks of the transaction into their log
    /// slots.
    fn write_log(&mut self, bcache: &Bcache, disk: &dyn DiskDevice) {
        for (tail, &blockno) in self.head.iter().enumerate() {
            let mut to = bcache.bread(disk, self.dev, self.start + 1 + tail as u32);
            let from = bcache.bread(disk, self.dev, blockno);
            to.data_mut().copy_from_slice(&from.data()[..]);
            to.write(disk);
        }
    }

    fn recover(&mut self, bcache: &Bcache, disk: &dyn DiskDevice) {
        self.read_head(bcache, disk);
        // If the header was committed, carry the transaction home.
        self.install_trans(bcache, disk, true);
        self.head.clear();
        // Erase the log.
        self.write_head(bcache, disk);
    }

    fn commit(&mut self, bcache: &Bcache, disk: &dyn DiskDevice) {
        if !self.head.is_empty() {
            // Write modified blocks from cache to log.
            self.write_log(bcache, disk);
            // Write header to disk -- the real commit.
            self.write_head(bcache, disk);
            // Now install writes to home locations.
            self.install_trans(bcache, disk, false);
            self.head.clear();
            // Erase the transaction from the log.
            self.write_head(bcache, disk);
        }
    }

    /// Records that `b` belongs to the running transaction and pins it in
    /// the cache; the actual disk writes happen at commit. Replaces
    /// `Buf::write` for callers inside a transaction. A block already in
    /// the transaction is absorbed: the list does not grow, and whatever
    /// the cached block holds at commit is what gets written.
    pub fn log_write(&mut self, b: &Buf<'_>) {
        assert!(
            self.head.len() < LOGSIZE && (self.head.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log_write outside of trans");

        if !self.head.contains(&b.blockno()) {
            b.pin();
            self.head.push(b.blockno());
        }
    }
}

impl SleepableLock<Log> {
    /// Called at the start of each FS operation.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This operation might exhaust log space; wait for commit.
                || guard.head.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS operation; commits if this was the
    /// last outstanding operation.
    pub fn end_op(&self, bcache: &Bcache, disk: &dyn DiskDevice) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: already committing");

        if guard.outstanding == 0 {
            // No transaction is running, and `committing` keeps new ones
            // from starting even after the lock is dropped below.
            guard.committing = true;
            guard.reacquire_after(|| {
                // SAFETY: `committing` is set, so no other thread can
                // reach the log state until it is cleared under the lock.
                let log = unsafe { &mut *self.get_mut_raw() };
                log.commit(bcache, disk);
            });
            guard.committing = false;
        }

        // `begin_op` may be waiting for log space, and decrementing
        // `outstanding` (or finishing the commit) has freed some.
        guard.wakeup();
    }
}
