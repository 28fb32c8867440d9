//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk inode holds the
//! file's type, its size, the number of links referring to it, and the
//! list of blocks holding its content. Inodes are packed sequentially on
//! disk starting at `superblock.inodestart`; an inode's number is its
//! position there.
//!
//! The in-memory inode table provides the synchronization point for inodes
//! used by multiple threads, and adds the book-keeping that is not stored
//! on disk: the reference count and the `valid` flag. An inode goes
//! through a sequence of states:
//!
//! * Allocation: an inode is allocated if its on-disk type is nonzero.
//!   `ialloc` allocates; `iput` frees when both the link count and the
//!   reference count have fallen to zero.
//! * Referencing in table: a table entry is free when its reference count
//!   is zero. `iget` finds or creates an entry and increments its count so
//!   the entry stays put and `RcInode` handles remain meaningful; `iput`
//!   decrements it.
//! * Valid: the copied fields (type, size, &c) of an entry are only
//!   correct once `ilock` has read them from disk and set `valid`. `iput`
//!   clears `valid` when it recycles the entry.
//! * Locked: the fields may only be examined or modified through the
//!   `InodeGuard` returned by `ilock`.
//!
//! Thus a typical sequence is:
//!   ip = fs.iget(dev, inum)
//!   guard = fs.ilock(&ip)
//!   ... examine and modify guard.xxx ...
//!   drop(guard)
//!   fs.iput(ip, &tx)
//!
//! `ilock` is separate from `iget` so that an open file can hold a
//! long-term reference and lock it only for short periods; the separation
//! also avoids deadlock during pathname lookup.
//!
//! The table spin lock protects the allocation columns (`dev`, `inum`,
//! reference count); each entry's sleep lock protects everything else.

use core::iter::StepBy;
use core::mem;
use core::ops::{Deref, DerefMut, Range};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::{FileName, FileSystem, FsTransaction, Path, Stat, IPB, MAXFILE, NDIRECT, NINDIRECT};
use crate::bio::BufData;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NINODE};

/// Maximum length of a directory entry name.
pub const DIRSIZ: usize = 14;

/// Directory entry size.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

const_assert!(BSIZE % DIRENT_SIZE == 0);

/// What an inode is, with the device numbers for device files.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

impl InodeType {
    fn from_raw(typ: i16, major: u16, minor: u16) -> Self {
        match typ {
            0 => InodeType::None,
            1 => InodeType::Dir,
            2 => InodeType::File,
            3 => InodeType::Device { major, minor },
            _ => panic!("inode: unknown type {}", typ),
        }
    }

    fn to_raw(self) -> (i16, u16, u16) {
        match self {
            InodeType::None => (0, 0, 0),
            InodeType::Dir => (1, 0, 0),
            InodeType::File => (2, 0, 0),
            InodeType::Device { major, minor } => (3, major, minor),
        }
    }
}

/// On-disk inode structure.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; 0 marks a free inode
    typ: i16,

    /// Major device number (device files only)
    major: u16,

    /// Minor device number (device files only)
    minor: u16,

    /// Number of links to inode in file system
    nlink: i16,

    /// Size of file (bytes)
    size: u32,

    /// Data block addresses: direct, then one single-indirect, then one
    /// double-indirect
    addrs: [u32; NDIRECT + 2],
}

/// A directory is a file containing a sequence of these entries. An entry
/// with `inum == 0` is free.
#[repr(C)]
#[derive(Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    /// Fills in the name. Names shorter than `DIRSIZ` get a NUL
    /// terminator; names of exactly `DIRSIZ` bytes are stored unterminated.
    pub(crate) fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the slice that exactly contains the stored name.
    fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        FileName::new(&self.name[..len])
    }
}

/// In-memory copy of an inode's disk fields, plus the `valid` flag.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub(crate) valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 2],
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
        }
    }
}

/// Allocation columns of one table entry, guarded by the table spin lock.
#[derive(Copy, Clone, Default)]
struct ISlot {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

pub(crate) struct Itable {
    slots: SpinLock<[ISlot; NINODE]>,
    inodes: [SleepLock<InodeInner>; NINODE],
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            slots: SpinLock::new("itable", [ISlot::default(); NINODE]),
            inodes: array_macro::array![_ => SleepLock::new("inode", InodeInner::new()); NINODE],
        }
    }
}

/// A counted reference to an in-memory inode. Obtained from `iget` (or the
/// operations built on it) and given back with `iput`, which must run
/// inside a transaction since dropping the last reference to an unlinked
/// inode frees its blocks. A handle that is never `iput` only leaks its
/// table entry.
#[derive(Debug)]
pub struct RcInode {
    pub dev: u32,
    pub inum: u32,
    idx: usize,
}

/// A locked inode: exclusive access to the loaded fields of one inode.
/// Dropping the guard unlocks it.
pub struct InodeGuard<'s> {
    fs: &'s FileSystem,
    pub dev: u32,
    pub inum: u32,
    guard: SleepLockGuard<'s, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }
}

impl FileSystem {
    /// Finds the inode numbered `inum` on device `dev` and returns its
    /// in-memory entry, creating one if needed. Does not lock the inode
    /// and does not read it from disk.
    pub fn iget(&self, dev: u32, inum: u32) -> RcInode {
        let mut slots = self.itable.slots.lock();

        let mut empty = None;
        for idx in 0..NINODE {
            let slot = &mut slots[idx];
            if slot.refcnt > 0 && slot.dev == dev && slot.inum == inum {
                slot.refcnt += 1;
                return RcInode { dev, inum, idx };
            }
            if empty.is_none() && slot.refcnt == 0 {
                empty = Some(idx);
            }
        }

        // Recycle an unreferenced entry.
        let idx = match empty {
            Some(idx) => idx,
            None => panic!("iget: no inodes"),
        };
        slots[idx] = ISlot {
            dev,
            inum,
            refcnt: 1,
        };
        // SAFETY: the entry had no references, so no thread holds or can
        // take its sleep lock before this table lock is released.
        unsafe { (*self.itable.inodes[idx].get_mut_raw()).valid = false };
        RcInode { dev, inum, idx }
    }

    /// Takes another reference to the same inode.
    pub fn idup(&self, ip: &RcInode) -> RcInode {
        let mut slots = self.itable.slots.lock();
        slots[ip.idx].refcnt += 1;
        RcInode {
            dev: ip.dev,
            inum: ip.inum,
            idx: ip.idx,
        }
    }

    /// Drops a reference to an in-memory inode. If that was the last
    /// reference, the table entry can be recycled; if additionally the
    /// inode has no links, the inode and its content are freed on disk.
    pub fn iput(&self, ip: RcInode, tx: &FsTransaction<'_>) {
        let mut slots = self.itable.slots.lock();
        debug_assert!(slots[ip.idx].refcnt >= 1, "iput: bad refcnt");

        if slots[ip.idx].refcnt == 1 {
            // SAFETY: ours is the only reference, so no thread holds or
            // can take this entry's sleep lock while we peek.
            let inner = unsafe { &*self.itable.inodes[ip.idx].get_mut_raw() };
            if inner.valid && inner.nlink == 0 {
                // No links and no other references: truncate and free.
                // The sleep lock cannot block for the same reason, so
                // taking it under the table lock is fine.
                let guard = self.itable.inodes[ip.idx].lock();
                drop(slots);

                let mut ip_guard = InodeGuard {
                    fs: self,
                    dev: ip.dev,
                    inum: ip.inum,
                    guard,
                };
                ip_guard.trunc(tx);
                ip_guard.typ = InodeType::None;
                ip_guard.update(tx);
                ip_guard.valid = false;
                drop(ip_guard);

                slots = self.itable.slots.lock();
            }
        }
        slots[ip.idx].refcnt -= 1;
    }

    /// Locks the inode, reading its fields from disk if this entry has not
    /// been loaded since it was (re)claimed.
    pub fn ilock<'s>(&'s self, ip: &RcInode) -> InodeGuard<'s> {
        let mut guard = self.itable.inodes[ip.idx].lock();
        if !guard.valid {
            let bp = self.bread(ip.dev, self.superblock().iblock(ip.inum));
            let dinodes = LayoutVerified::<_, [Dinode]>::new_slice(&bp.data()[..])
                .expect("ilock: unaligned inode block")
                .into_slice();
            let dip = &dinodes[ip.inum as usize % IPB];
            guard.typ = InodeType::from_raw(dip.typ, dip.major, dip.minor);
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs = dip.addrs;
            guard.valid = true;
            assert_ne!(guard.typ, InodeType::None, "ilock: no type");
        }
        InodeGuard {
            fs: self,
            dev: ip.dev,
            inum: ip.inum,
            guard,
        }
    }

    /// Allocates a fresh inode of the given type on device `dev` and
    /// returns a reference to it, unlocked.
    pub fn ialloc(&self, dev: u32, typ: InodeType, tx: &FsTransaction<'_>) -> RcInode {
        for inum in 1..self.superblock().ninodes {
            let mut bp = self.bread(dev, self.superblock().iblock(inum));
            let mut free = false;
            {
                let dinodes = LayoutVerified::<_, [Dinode]>::new_slice(&mut bp.data_mut()[..])
                    .expect("ialloc: unaligned inode block")
                    .into_mut_slice();
                let dip = &mut dinodes[inum as usize % IPB];
                if dip.typ == 0 {
                    *dip = Dinode::default();
                    let (t, major, minor) = typ.to_raw();
                    dip.typ = t;
                    dip.major = major;
                    dip.minor = minor;
                    free = true;
                }
            }
            if free {
                // Mark it allocated on the disk.
                tx.write(bp);
                return self.iget(dev, inum);
            }
        }
        panic!("ialloc: no inodes");
    }
}

// Inode content.
//
// The content associated with each inode is stored in blocks on the disk.
// The first NDIRECT blocks are listed in addrs[]; the next NINDIRECT are
// listed in the block addrs[NDIRECT]; the NINDIRECT * NINDIRECT after
// those hang off the two-level tree rooted at addrs[NDIRECT + 1].
impl<'s> InodeGuard<'s> {
    /// Copies a modified in-memory inode to disk. Must be called after
    /// every change to a field that lives on disk.
    pub fn update(&mut self, tx: &FsTransaction<'_>) {
        let fs = self.fs;
        let mut bp = fs.bread(self.dev, fs.superblock().iblock(self.inum));
        {
            let dinodes = LayoutVerified::<_, [Dinode]>::new_slice(&mut bp.data_mut()[..])
                .expect("update: unaligned inode block")
                .into_mut_slice();
            let dip = &mut dinodes[self.inum as usize % IPB];
            let (t, major, minor) = self.typ.to_raw();
            dip.typ = t;
            dip.major = major;
            dip.minor = minor;
            dip.nlink = self.nlink;
            dip.size = self.size;
            dip.addrs = self.addrs;
        }
        tx.write(bp);
    }

    /// Returns the disk block holding the `bn`th block of this inode,
    /// allocating it (and any missing indirect blocks on the way) when a
    /// transaction is supplied. A hole without a transaction is fatal;
    /// reads only ever map blocks below the file size, which all exist.
    fn bmap_internal(&mut self, bn: usize, tx: Option<&FsTransaction<'_>>) -> u32 {
        let fs = self.fs;
        let dev = self.dev;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = tx.expect("bmap: unallocated block").balloc(dev);
                self.addrs[bn] = addr;
            }
            return addr;
        }
        let bn = bn - NDIRECT;

        if bn < NINDIRECT {
            // Load the indirect block, allocating if necessary.
            let mut indirect = self.addrs[NDIRECT];
            if indirect == 0 {
                indirect = tx.expect("bmap: unallocated block").balloc(dev);
                self.addrs[NDIRECT] = indirect;
            }
            let mut bp = fs.bread(dev, indirect);
            let entries = block_u32s(bp.data_mut());
            let mut addr = entries[bn];
            if addr == 0 {
                let tx = tx.expect("bmap: unallocated block");
                addr = tx.balloc(dev);
                entries[bn] = addr;
                tx.write(bp);
            }
            return addr;
        }
        let bn = bn - NINDIRECT;

        if bn < NINDIRECT * NINDIRECT {
            // Two levels: the first picks an indirect block, the second a
            // data block within it.
            let l1 = bn / NINDIRECT;
            let l2 = bn % NINDIRECT;

            let mut dbl = self.addrs[NDIRECT + 1];
            if dbl == 0 {
                dbl = tx.expect("bmap: unallocated block").balloc(dev);
                self.addrs[NDIRECT + 1] = dbl;
            }
            let mut bp = fs.bread(dev, dbl);
            let entries = block_u32s(bp.data_mut());
            let mut mid = entries[l1];
            if mid == 0 {
                let tx = tx.expect("bmap: unallocated block");
                mid = tx.balloc(dev);
                entries[l1] = mid;
                tx.write(bp);
            } else {
                drop(bp);
            }

            let mut bp = fs.bread(dev, mid);
            let entries = block_u32s(bp.data_mut());
            let mut addr = entries[l2];
            if addr == 0 {
                let tx = tx.expect("bmap: unallocated block");
                addr = tx.balloc(dev);
                entries[l2] = addr;
                tx.write(bp);
            }
            return addr;
        }

        panic!("bmap: out of range");
    }

    fn bmap_or_alloc(&mut self, bn: usize, tx: &FsTransaction<'_>) -> u32 {
        self.bmap_internal(bn, Some(tx))
    }

    fn bmap(&mut self, bn: usize) -> u32 {
        self.bmap_internal(bn, None)
    }

    /// Truncates the inode: discards its contents and returns every data
    /// and indirect block to the allocator.
    pub fn trunc(&mut self, tx: &FsTransaction<'_>) {
        let fs = self.fs;
        let dev = self.dev;

        for addr in &mut self.guard.addrs[..NDIRECT] {
            if *addr != 0 {
                tx.bfree(dev, *addr);
                *addr = 0;
            }
        }

        let indirect = self.addrs[NDIRECT];
        if indirect != 0 {
            {
                let bp = fs.bread(dev, indirect);
                for &addr in block_u32s_ref(bp.data()) {
                    if addr != 0 {
                        tx.bfree(dev, addr);
                    }
                }
            }
            tx.bfree(dev, indirect);
            self.addrs[NDIRECT] = 0;
        }

        let dbl = self.addrs[NDIRECT + 1];
        if dbl != 0 {
            // Copy the first level out so only one buffer is held while
            // the second level is walked.
            let mut level1 = [0u32; NINDIRECT];
            {
                let bp = fs.bread(dev, dbl);
                level1.copy_from_slice(block_u32s_ref(bp.data()));
            }
            for &mid in level1.iter().filter(|&&mid| mid != 0) {
                {
                    let bp = fs.bread(dev, mid);
                    for &addr in block_u32s_ref(bp.data()) {
                        if addr != 0 {
                            tx.bfree(dev, addr);
                        }
                    }
                }
                tx.bfree(dev, mid);
            }
            tx.bfree(dev, dbl);
            self.addrs[NDIRECT + 1] = 0;
        }

        self.size = 0;
        self.update(tx);
    }

    /// Reads data from the inode. `f(off, src)` is called once per block
    /// span and copies `src` to the interval beginning at the `off`th byte
    /// of wherever the caller is reading to; an error from `f` aborts the
    /// read.
    fn read_internal<F>(&mut self, mut off: u32, mut n: u32, mut f: F) -> Result<usize, ()>
    where
        F: FnMut(u32, &[u8]) -> Result<(), ()>,
    {
        let fs = self.fs;
        if off > self.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > self.size {
            n = self.size - off;
        }

        let mut tot: u32 = 0;
        while tot < n {
            let addr = self.bmap(off as usize / BSIZE);
            let bp = fs.bread(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let res = f(tot, &bp.data()[begin..begin + m as usize]);
            drop(bp);
            res?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Writes data to the inode. `f(off, dst)` copies the interval
    /// beginning at the `off`th byte of the source into `dst`; an error
    /// from `f` stops the write early, and the number of bytes already
    /// written is returned.
    fn write_internal<F>(
        &mut self,
        mut off: u32,
        n: u32,
        mut f: F,
        tx: &FsTransaction<'_>,
    ) -> Result<usize, ()>
    where
        F: FnMut(u32, &mut [u8]) -> Result<(), ()>,
    {
        let fs = self.fs;
        if off > self.size {
            return Err(());
        }
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot: u32 = 0;
        while tot < n {
            let addr = self.bmap_or_alloc(off as usize / BSIZE, tx);
            let mut bp = fs.bread(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            if f(tot, &mut bp.data_mut()[begin..begin + m as usize]).is_ok() {
                tx.write(bp);
            } else {
                break;
            }
            tot += m;
            off += m;
        }

        if off > self.size {
            self.size = off;
        }

        // Write the inode back even if the size is unchanged, because the
        // loop may have grown addrs[] through bmap.
        self.update(tx);
        Ok(tot as usize)
    }

    /// Copies up to `dst.len()` bytes at offset `off` into `dst`, clamped
    /// by the file size. Returns the number of bytes copied.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32) -> usize {
        self.read_internal(off, dst.len() as u32, |o, src| {
            dst[o as usize..o as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
        .expect("read_bytes: cannot fail")
    }

    /// Reads one plain-data record at offset `off`.
    pub fn read_obj<T: AsBytes + FromBytes>(&mut self, dst: &mut T, off: u32) -> Result<(), ()> {
        let n = self.read_bytes(dst.as_bytes_mut(), off);
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Writes `src` at offset `off`, extending the file if it grows.
    /// Rejects writes starting past the end of the file or reaching past
    /// the largest representable file.
    pub fn write_bytes(
        &mut self,
        src: &[u8],
        off: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<usize, ()> {
        self.write_internal(
            off,
            src.len() as u32,
            |o, dst| {
                dst.copy_from_slice(&src[o as usize..o as usize + dst.len()]);
                Ok(())
            },
            tx,
        )
    }

    /// Writes one plain-data record at offset `off`.
    pub fn write_obj<T: AsBytes>(
        &mut self,
        src: &T,
        off: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        let n = self.write_bytes(src.as_bytes(), off, tx)?;
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Copies out the inode's metadata.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum,
            typ: self.typ.stat_code(),
            nlink: self.nlink,
            size: self.size as u64,
        }
    }
}

// Directories.
impl<'s> InodeGuard<'s> {
    fn iter_dirents<'a>(&'a mut self) -> DirentIter<'a, 's> {
        let iter = (0..self.size).step_by(DIRENT_SIZE);
        DirentIter { guard: self, iter }
    }

    /// Looks for a directory entry by name. If found, returns a reference
    /// to the entry's inode and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.typ, InodeType::Dir, "dirlookup not DIR");
        let fs = self.fs;
        let dev = self.dev;
        self.iter_dirents()
            .find(|(de, _)| de.inum != 0 && de.get_name() == name)
            .map(|(de, off)| (fs.iget(dev, de.inum as u32), off))
            .ok_or(())
    }

    /// Writes a new directory entry (`name`, `inum`) into this directory,
    /// reusing the first free slot or appending at the end. Fails if the
    /// name is already present.
    pub fn dirlink(
        &mut self,
        name: &FileName,
        inum: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        // The name must not be present.
        if let Ok((ip, _)) = self.dirlookup(name) {
            self.fs.iput(ip, tx);
            return Err(());
        }

        // Look for an empty slot.
        let (mut de, off) = self
            .iter_dirents()
            .find(|(de, _)| de.inum == 0)
            .unwrap_or((Dirent::default(), self.size));
        de.inum = inum as u16;
        de.set_name(name);
        self.write_obj(&de, off, tx).expect("dirlink");
        Ok(())
    }

    /// Is the directory empty except for `.` and `..`?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::default();
        for off in (2 * DIRENT_SIZE as u32..self.size).step_by(DIRENT_SIZE) {
            self.read_obj(&mut de, off).expect("is_dir_empty: read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

struct DirentIter<'a, 's> {
    guard: &'a mut InodeGuard<'s>,
    iter: StepBy<Range<u32>>,
}

impl Iterator for DirentIter<'_, '_> {
    type Item = (Dirent, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let off = self.iter.next()?;
        let mut de = Dirent::default();
        self.guard.read_obj(&mut de, off).expect("DirentIter");
        Some((de, off))
    }
}

// Pathname resolution.
impl FileSystem {
    /// The root directory of the mounted device.
    pub fn root(&self) -> RcInode {
        self.iget(self.dev(), super::ROOTINO)
    }

    /// Resolves `path` to an inode. Relative paths start at `cwd`.
    pub fn namei(
        &self,
        path: &Path,
        cwd: &RcInode,
        tx: &FsTransaction<'_>,
    ) -> Result<RcInode, ()> {
        Ok(self.namex(path, false, cwd, tx)?.0)
    }

    /// Resolves `path` to the inode of its parent directory, and returns
    /// the final path element alongside.
    pub fn nameiparent<'p>(
        &self,
        path: &'p Path,
        cwd: &RcInode,
        tx: &FsTransaction<'_>,
    ) -> Result<(RcInode, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true, cwd, tx)?;
        let name = name.ok_or(())?;
        Ok((ip, name))
    }

    fn namex<'p>(
        &self,
        mut path: &'p Path,
        parent: bool,
        cwd: &RcInode,
        tx: &FsTransaction<'_>,
    ) -> Result<(RcInode, Option<&'p FileName>), ()> {
        let mut ip = if path.is_absolute() {
            self.root()
        } else {
            self.idup(cwd)
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut guard = self.ilock(&ip);
            if guard.typ != InodeType::Dir {
                drop(guard);
                self.iput(ip, tx);
                return Err(());
            }
            if parent && path.is_empty_string() {
                // Stop one level early, keeping the reference.
                drop(guard);
                return Ok((ip, Some(name)));
            }
            let next = guard.dirlookup(name);
            drop(guard);
            self.iput(ip, tx);
            ip = next?.0;
        }

        if parent {
            // The loop ran out of components without finding a layer to
            // stop above.
            self.iput(ip, tx);
            return Err(());
        }
        Ok((ip, None))
    }
}

/// Writes the root directory's on-disk inode into the (zeroed) first
/// inode block while formatting a device.
pub(crate) fn mkfs_root_dinode(block: &mut BufData, data_block: u32, size: u32) {
    let dinodes = LayoutVerified::<_, [Dinode]>::new_slice(&mut block[..])
        .expect("unaligned inode block")
        .into_mut_slice();
    let root = &mut dinodes[super::ROOTINO as usize % IPB];
    let (typ, major, minor) = InodeType::Dir.to_raw();
    root.typ = typ;
    root.major = major;
    root.minor = minor;
    root.nlink = 1;
    root.size = size;
    root.addrs[0] = data_block;
}

/// Views a block's bytes as an array of block numbers.
fn block_u32s(data: &mut BufData) -> &mut [u32] {
    LayoutVerified::<_, [u32]>::new_slice(&mut data[..])
        .expect("unaligned indirect block")
        .into_mut_slice()
}

fn block_u32s_ref(data: &BufData) -> &[u32] {
    LayoutVerified::<_, [u32]>::new_slice(&data[..])
        .expect("unaligned indirect block")
        .into_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_name_round_trip() {
        let mut de = Dirent::default();
        de.set_name(FileName::new(b"hello"));
        assert_eq!(de.get_name().as_bytes(), b"hello");
    }

    #[test]
    fn dirsiz_name_is_stored_unterminated() {
        let mut de = Dirent::default();
        de.set_name(FileName::new(b"exactly14bytes"));
        assert_eq!(de.name.len(), DIRSIZ);
        assert!(!de.name.contains(&0));
        assert_eq!(de.get_name().as_bytes(), b"exactly14bytes");
    }

    #[test]
    fn short_name_is_terminated() {
        let mut de = Dirent::default();
        de.set_name(FileName::new(b"f"));
        assert_eq!(de.name[1], 0);
        assert_eq!(de.get_name().as_bytes(), b"f");
    }

    #[test]
    fn dinode_packs_exactly() {
        assert_eq!(mem::size_of::<Dinode>(), 64);
        assert_eq!(BSIZE % mem::size_of::<Dinode>(), 0);
    }
}
