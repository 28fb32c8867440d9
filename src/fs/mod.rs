//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: paths like /usr/rtm/xv6/fs.c for convenient naming.
//!
//! The three mutable singletons (buffer cache, inode table, log) are owned
//! by one `FileSystem` value; everything the layer above needs is a method
//! on it or on a guard borrowed from it. `init` mounts a device: it reads
//! the superblock and replays whatever committed transaction the log still
//! holds.
//!
//! Every operation that writes the disk runs inside a transaction, opened
//! with `begin_op` and closed by dropping the returned guard.

use core::mem;

use scopeguard::ScopeGuard;
use spin::Once;

use crate::bio::{Bcache, Buf};
use crate::hal::DiskDevice;
use crate::lock::SleepableLock;
use crate::param::BSIZE;
use std::sync::Arc;

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    Dinode, Dirent, InodeGuard, InodeInner, InodeType, RcInode, DIRENT_SIZE, DIRSIZ,
};
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEVICE, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB, FSMAGIC, IPB};

use inode::Itable;
use log::Log;

/// Root i-number.
pub const ROOTINO: u32 = 1;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 11;

/// Block addresses per indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Largest representable file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// State that exists once a device is mounted.
struct Mount {
    dev: u32,
    /// There should be one superblock per disk device, but we run with
    /// only one device.
    superblock: Superblock,
    log: SleepableLock<Log>,
}

pub struct FileSystem {
    disk: Arc<dyn DiskDevice>,
    bcache: Bcache,
    itable: Itable,
    mount: Once<Mount>,
}

impl FileSystem {
    /// A file system over `disk`, with cold caches and no device mounted.
    pub fn new(disk: Arc<dyn DiskDevice>) -> Self {
        Self {
            disk,
            bcache: Bcache::new(),
            itable: Itable::new(),
            mount: Once::new(),
        }
    }

    /// Mounts device `dev`: reads and checks the superblock, then runs log
    /// recovery, carrying any committed-but-uninstalled transaction home.
    /// Runs at most once; later calls are no-ops.
    pub fn init(&self, dev: u32) {
        self.mount.call_once(|| {
            let superblock = {
                let buf = self.bread(dev, 1);
                Superblock::read(&buf)
            };
            let log = SleepableLock::new(
                "log",
                Log::new(
                    dev,
                    superblock.logstart,
                    superblock.nlog,
                    &self.bcache,
                    &*self.disk,
                ),
            );
            Mount {
                dev,
                superblock,
                log,
            }
        });
    }

    fn mounted(&self) -> &Mount {
        self.mount.get().expect("file system is not mounted")
    }

    /// The mounted device.
    pub fn dev(&self) -> u32 {
        self.mounted().dev
    }

    pub fn superblock(&self) -> &Superblock {
        &self.mounted().superblock
    }

    fn log(&self) -> &SleepableLock<Log> {
        &self.mounted().log
    }

    /// Returns a locked buffer with the contents of the given block.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        self.bcache.bread(&*self.disk, dev, blockno)
    }

    /// Opens a transaction. Called at the start of each FS operation;
    /// dropping the guard ends the operation and commits once no
    /// operation is outstanding.
    pub fn begin_op(&self) -> FsTransaction<'_> {
        self.log().begin_op();
        FsTransaction { fs: self }
    }
}

/// A running FS operation's membership in the current log transaction.
/// All disk mutation funnels through its methods, and dropping it is
/// `end_op`.
pub struct FsTransaction<'s> {
    fs: &'s FileSystem,
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        self.fs.log().end_op(&self.fs.bcache, &*self.fs.disk);
    }
}

impl FsTransaction<'_> {
    /// Hands a modified buffer to the log: the block is recorded in the
    /// running transaction and pinned until commit installs it. Replaces
    /// `Buf::write`; a typical use is:
    ///   bp = fs.bread(...)
    ///   modify bp.data_mut()
    ///   tx.write(bp)
    pub fn write(&self, b: Buf<'_>) {
        self.fs.log().lock().log_write(&b);
        // The buffer itself is released here; the log's pin keeps the
        // block cached.
    }

    /// Zeroes a block. No read is needed; the old contents are dead.
    fn bzero(&self, dev: u32, blockno: u32) {
        let mut buf = self.fs.bcache.bget_for_overwrite(dev, blockno);
        buf.data_mut().fill(0);
        buf.mark_valid();
        self.write(buf);
    }

    /// Allocates a zeroed disk block, marking it in the bitmap.
    pub(crate) fn balloc(&self, dev: u32) -> u32 {
        let sb = self.fs.superblock();
        for base in num_iter::range_step(0, sb.size, BPB) {
            let mut bp = self.fs.bread(dev, sb.bblock(base));
            for bi in 0..core::cmp::min(BPB, sb.size - base) {
                let m = 1u8 << (bi % 8);
                if bp.data()[bi as usize / 8] & m == 0 {
                    // The block is free.
                    bp.data_mut()[bi as usize / 8] |= m; // Mark it in use.
                    self.write(bp);
                    self.bzero(dev, base + bi);
                    return base + bi;
                }
            }
        }
        panic!("balloc: out of blocks");
    }

    /// Returns a block to the bitmap. Freeing a free block is fatal.
    pub(crate) fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock();
        let mut bp = self.fs.bread(dev, sb.bblock(b));
        let bi = b as usize % BPB as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data()[bi / 8] & m, 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        self.write(bp);
    }
}

// Namespace operations. Each must be called inside a transaction.
impl FileSystem {
    /// Creates `path` as a file, directory, or device node and returns a
    /// reference to its inode. Creating an existing file is not an error
    /// and returns the existing inode; any other collision fails.
    pub fn create(
        &self,
        path: &Path,
        typ: InodeType,
        cwd: &RcInode,
        tx: &FsTransaction<'_>,
    ) -> Result<RcInode, ()> {
        let (dirp, name) = self.nameiparent(path, cwd, tx)?;
        let dirp = scopeguard::guard(dirp, |ip| self.iput(ip, tx));
        let mut dp = self.ilock(&dirp);

        if let Ok((existing, _)) = dp.dirlookup(name) {
            drop(dp);
            let existing = scopeguard::guard(existing, |ip| self.iput(ip, tx));
            if typ != InodeType::File {
                return Err(());
            }
            let guard = self.ilock(&existing);
            match guard.typ {
                InodeType::File | InodeType::Device { .. } => {
                    drop(guard);
                    return Ok(ScopeGuard::into_inner(existing));
                }
                _ => return Err(()),
            }
        }

        let ip = self.ialloc(dp.dev, typ, tx);
        let mut guard = self.ilock(&ip);
        guard.nlink = 1;
        guard.update(tx);

        // Create . and .. entries.
        if typ == InodeType::Dir {
            // for ".."
            dp.nlink += 1;
            dp.update(tx);

            let inum = ip.inum;
            // No nlink++ for ".": avoid a cyclic reference count.
            guard
                .dirlink(FileName::new(b"."), inum, tx)
                .and_then(|_| guard.dirlink(FileName::new(b".."), dp.inum, tx))
                .expect("create dots");
        }

        dp.dirlink(name, ip.inum, tx).expect("create: dirlink");
        Ok(ip)
    }

    /// Adds a hard link at `new` to the inode named by `old`. Fails on
    /// directories, across devices, and on a taken name, undoing the link
    /// count bump.
    pub fn link(
        &self,
        old: &Path,
        new: &Path,
        cwd: &RcInode,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        let ip = self.namei(old, cwd, tx)?;
        let ip = scopeguard::guard(ip, |ip| self.iput(ip, tx));
        {
            let mut guard = self.ilock(&ip);
            if guard.typ == InodeType::Dir {
                return Err(());
            }
            guard.nlink += 1;
            guard.update(tx);
        }

        if let Ok((dirp, name)) = self.nameiparent(new, cwd, tx) {
            let dirp = scopeguard::guard(dirp, |ip| self.iput(ip, tx));
            let mut dp = self.ilock(&dirp);
            if dp.dev == ip.dev && dp.dirlink(name, ip.inum, tx).is_ok() {
                return Ok(());
            }
        }

        let mut guard = self.ilock(&ip);
        guard.nlink -= 1;
        guard.update(tx);
        Err(())
    }

    /// Removes the directory entry named by `path`. Refuses `.` and `..`
    /// and non-empty directories. The inode itself is freed once its last
    /// in-memory reference is put.
    pub fn unlink(&self, path: &Path, cwd: &RcInode, tx: &FsTransaction<'_>) -> Result<(), ()> {
        let (dirp, name) = self.nameiparent(path, cwd, tx)?;
        let dirp = scopeguard::guard(dirp, |ip| self.iput(ip, tx));
        let mut dp = self.ilock(&dirp);

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(());
        }

        let (ip, off) = dp.dirlookup(name)?;
        let ip = scopeguard::guard(ip, |ip| self.iput(ip, tx));
        let mut guard = self.ilock(&ip);
        assert!(guard.nlink >= 1, "unlink: nlink < 1");

        if guard.typ == InodeType::Dir && !guard.is_dir_empty() {
            return Err(());
        }

        dp.write_obj(&Dirent::default(), off, tx)
            .expect("unlink: write entry");
        if guard.typ == InodeType::Dir {
            dp.nlink -= 1;
            dp.update(tx);
        }
        drop(dp);
        drop(dirp);

        guard.nlink -= 1;
        guard.update(tx);
        Ok(())
    }
}

/// Builds an empty file system on a device.
pub mod mkfs {
    use super::superblock::{BPB, FSMAGIC, IPB};
    use super::{Dirent, FileName, Superblock, DIRENT_SIZE, ROOTINO};
    use crate::bio::BufData;
    use crate::hal::DiskDevice;
    use crate::param::LOGSIZE;
    use zerocopy::{AsBytes, LayoutVerified};

    use super::inode::mkfs_root_dinode;

    /// Formats `dev`: writes the superblock, an empty log, a zeroed inode
    /// table with an allocated root directory holding `.` and `..`, and a
    /// bitmap with every metadata block (and the root directory's data
    /// block) marked in use.
    ///
    /// The log region gets `LOGSIZE` data blocks plus the header block, so
    /// a full transaction fits.
    pub fn mkfs(disk: &dyn DiskDevice, dev: u32, size: u32, ninodes: u32) {
        let nlog = LOGSIZE as u32 + 1;
        let ninodeblocks = ninodes / IPB as u32 + 1;
        let nbitmap = size / BPB + 1;

        let logstart = 2;
        let inodestart = logstart + nlog;
        let bmapstart = inodestart + ninodeblocks;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        assert!(nmeta + 1 < size, "mkfs: device too small");
        assert!(nmeta + 1 <= BPB, "mkfs: bitmap spills past its first block");

        let mut block = BufData::zeroed();
        for b in 0..size {
            disk.rw(dev, b, &mut block, true);
        }

        // Superblock.
        let sb = Superblock {
            magic: FSMAGIC,
            size,
            nblocks: size - nmeta,
            ninodes,
            nlog,
            logstart,
            inodestart,
            bmapstart,
        };
        let mut block = BufData::zeroed();
        block[..core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
        disk.rw(dev, 1, &mut block, true);

        // Root directory inode, pointing at the first data block.
        let rootdata = nmeta;
        let mut block = BufData::zeroed();
        mkfs_root_dinode(&mut block, rootdata, (2 * DIRENT_SIZE) as u32);
        disk.rw(dev, inodestart, &mut block, true);

        // Its "." and ".." entries.
        let mut block = BufData::zeroed();
        {
            let dirents = LayoutVerified::<_, [Dirent]>::new_slice(&mut block[..])
                .expect("mkfs: unaligned dirent block")
                .into_mut_slice();
            dirents[0].inum = ROOTINO as u16;
            dirents[0].set_name(FileName::new(b"."));
            dirents[1].inum = ROOTINO as u16;
            dirents[1].set_name(FileName::new(b".."));
        }
        disk.rw(dev, rootdata, &mut block, true);

        // Bitmap: everything up to and including the root data block is
        // taken.
        let mut block = BufData::zeroed();
        for b in 0..=rootdata {
            block[b as usize / 8] |= 1 << (b % 8);
        }
        disk.rw(dev, bmapstart, &mut block, true);
    }
}
