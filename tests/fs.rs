//! End-to-end scenarios over a memory-backed disk: mount, transactions,
//! crash recovery at both sides of the commit point, log absorption,
//! concurrent operations, pathname traversal, and the block-map limits.

use std::sync::Arc;
use std::thread;

use rv6_fs::fs::{MAXFILE, T_DIR, T_FILE};
use rv6_fs::param::{BSIZE, LOGSIZE, ROOTDEV};
use rv6_fs::{mkfs, FileSystem, InodeType, MemDisk, Path};

const FSSIZE: u32 = 1000;
const NINODES: u32 = 200;

fn mkfs_disk(size: u32) -> Arc<MemDisk> {
    let disk = Arc::new(MemDisk::new(size as usize));
    mkfs::mkfs(&*disk, ROOTDEV, size, NINODES);
    disk
}

fn mount(disk: Arc<MemDisk>) -> FileSystem {
    let fs = FileSystem::new(disk);
    fs.init(ROOTDEV);
    fs
}

fn remount(disk: &MemDisk) -> FileSystem {
    mount(Arc::new(MemDisk::from_image(disk.snapshot())))
}

/// Creates `/f` containing "hello" but leaves the transaction open so the
/// caller controls the commit.
fn create_hello<'s>(fs: &'s FileSystem) -> rv6_fs::FsTransaction<'s> {
    let tx = fs.begin_op();
    let root = fs.root();
    let ip = fs
        .create(Path::new("/f"), InodeType::File, &root, &tx)
        .unwrap();
    {
        let mut guard = fs.ilock(&ip);
        assert_eq!(guard.write_bytes(b"hello", 0, &tx), Ok(5));
    }
    fs.iput(ip, &tx);
    fs.iput(root, &tx);
    tx
}

fn read_hello(fs: &FileSystem) -> Result<Vec<u8>, ()> {
    let tx = fs.begin_op();
    let root = fs.root();
    let found = fs.namei(Path::new("/f"), &root, &tx);
    let out = found.map(|ip| {
        let mut guard = fs.ilock(&ip);
        assert_eq!(guard.stat().size, 5);
        let mut buf = [0u8; 5];
        assert_eq!(guard.read_bytes(&mut buf, 0), 5);
        drop(guard);
        fs.iput(ip, &tx);
        buf.to_vec()
    });
    fs.iput(root, &tx);
    out
}

#[test]
fn create_write_read_through_remount() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk.clone());
    drop(create_hello(&fs));

    assert_eq!(read_hello(&fs).unwrap(), b"hello");

    // The same contents survive a clean remount.
    let fs2 = remount(&disk);
    assert_eq!(read_hello(&fs2).unwrap(), b"hello");
}

/// Number of disk writes the commit of `create_hello` issues. The commit
/// writes each logged block once into the log region, then the header
/// (the commit point), then each home block, then the header again.
fn commit_write_count() -> u64 {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk.clone());
    let tx = create_hello(&fs);
    let before = disk.write_count();
    drop(tx);
    let total = disk.write_count() - before;
    assert!(total >= 4 && total % 2 == 0, "unexpected commit shape");
    total
}

#[test]
fn crash_before_commit_point_discards_everything() {
    let logged = (commit_write_count() - 2) / 2;

    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk.clone());
    let tx = create_hello(&fs);
    // Power fails after the log data blocks are written but before the
    // header: the transaction must vanish.
    disk.crash_after_writes(logged as i64);
    drop(tx);

    let fs2 = remount(&disk);
    assert!(read_hello(&fs2).is_err());

    // No block leaked: the surviving bitmap is the freshly formatted one.
    let pristine = mkfs_disk(FSSIZE);
    let bmapstart = fs2.superblock().bmapstart as usize;
    assert_eq!(
        disk.snapshot()[bmapstart][..],
        pristine.snapshot()[bmapstart][..]
    );
}

#[test]
fn crash_after_commit_point_recovers_everything() {
    let logged = (commit_write_count() - 2) / 2;

    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk.clone());
    let tx = create_hello(&fs);
    // Power fails right after the header write: none of the home blocks
    // were updated, but recovery must redo the whole transaction.
    disk.crash_after_writes(logged as i64 + 1);
    drop(tx);

    let fs2 = remount(&disk);
    assert_eq!(read_hello(&fs2).unwrap(), b"hello");
}

#[test]
fn repeated_writes_absorb_into_one_log_slot() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk);

    // Rewrite the same block far more times than the log has slots; only
    // absorption lets a single transaction hold this.
    let tx = fs.begin_op();
    let root = fs.root();
    let ip = fs
        .create(Path::new("/f"), InodeType::File, &root, &tx)
        .unwrap();
    {
        let mut guard = fs.ilock(&ip);
        for i in 0..(2 * LOGSIZE) {
            assert_eq!(guard.write_bytes(&[i as u8], 0, &tx), Ok(1));
        }
    }
    fs.iput(ip, &tx);
    fs.iput(root, &tx);
    drop(tx);

    let tx = fs.begin_op();
    let root = fs.root();
    let ip = fs.namei(Path::new("/f"), &root, &tx).unwrap();
    let mut guard = fs.ilock(&ip);
    let mut byte = [0u8; 1];
    assert_eq!(guard.read_bytes(&mut byte, 0), 1);
    // The committed value is the last write.
    assert_eq!(byte[0], (2 * LOGSIZE - 1) as u8);
    drop(guard);
    fs.iput(ip, &tx);
    fs.iput(root, &tx);
}

#[test]
fn concurrent_operations() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk);

    thread::scope(|s| {
        for t in 0..8u32 {
            let fs = &fs;
            s.spawn(move || {
                for i in 0..10u32 {
                    let name = format!("/t{}_{}", t, i);
                    let tx = fs.begin_op();
                    let root = fs.root();
                    let ip = fs
                        .create(Path::new(&name), InodeType::File, &root, &tx)
                        .unwrap();
                    {
                        let mut guard = fs.ilock(&ip);
                        assert_eq!(
                            guard.write_bytes(name.as_bytes(), 0, &tx),
                            Ok(name.len())
                        );
                    }
                    fs.iput(ip, &tx);
                    fs.iput(root, &tx);
                }
            });
        }
    });

    // Every file holds its own name.
    let tx = fs.begin_op();
    let root = fs.root();
    for t in 0..8u32 {
        for i in 0..10u32 {
            let name = format!("/t{}_{}", t, i);
            let ip = fs.namei(Path::new(&name), &root, &tx).unwrap();
            let mut guard = fs.ilock(&ip);
            let mut buf = vec![0u8; name.len()];
            assert_eq!(guard.read_bytes(&mut buf, 0), name.len());
            assert_eq!(buf, name.as_bytes());
            drop(guard);
            fs.iput(ip, &tx);
        }
    }
    fs.iput(root, &tx);
}

#[test]
fn path_traversal_and_parent() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk);

    for dir in ["/a", "/a/b", "/a/b/c"] {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs
            .create(Path::new(dir), InodeType::Dir, &root, &tx)
            .unwrap();
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }
    {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs
            .create(Path::new("/a/b/c/x"), InodeType::File, &root, &tx)
            .unwrap();
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }

    let tx = fs.begin_op();
    let root = fs.root();

    let file = fs.namei(Path::new("/a/b/c/x"), &root, &tx).unwrap();
    {
        let guard = fs.ilock(&file);
        assert_eq!(guard.stat().typ, T_FILE);
    }

    let dir_c = fs.namei(Path::new("/a/b/c"), &root, &tx).unwrap();
    {
        let guard = fs.ilock(&dir_c);
        assert_eq!(guard.stat().typ, T_DIR);
    }

    let (parent, name) = fs.nameiparent(Path::new("/a/b/c/x"), &root, &tx).unwrap();
    assert_eq!(name.as_bytes(), b"x");
    assert_eq!(parent.inum, dir_c.inum);

    // Looking up a file through a non-directory component fails.
    assert!(fs.namei(Path::new("/a/b/c/x/y"), &root, &tx).is_err());
    // A parent of the root alone does not exist.
    assert!(fs.nameiparent(Path::new("/"), &root, &tx).is_err());

    fs.iput(parent, &tx);
    fs.iput(dir_c, &tx);
    fs.iput(file, &tx);
    fs.iput(root, &tx);
}

#[test]
fn link_and_unlink() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk);
    drop(create_hello(&fs));

    // A second name reaches the same bytes.
    {
        let tx = fs.begin_op();
        let root = fs.root();
        fs.link(Path::new("/f"), Path::new("/g"), &root, &tx)
            .unwrap();
        // Linking onto a taken name fails.
        assert!(fs.link(Path::new("/f"), Path::new("/g"), &root, &tx).is_err());
        let ip = fs.namei(Path::new("/g"), &root, &tx).unwrap();
        {
            let mut guard = fs.ilock(&ip);
            assert_eq!(guard.stat().nlink, 2);
            let mut buf = [0u8; 5];
            assert_eq!(guard.read_bytes(&mut buf, 0), 5);
            assert_eq!(&buf, b"hello");
        }
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }

    // Unlinking one name leaves the other.
    {
        let tx = fs.begin_op();
        let root = fs.root();
        fs.unlink(Path::new("/f"), &root, &tx).unwrap();
        assert!(fs.namei(Path::new("/f"), &root, &tx).is_err());
        let ip = fs.namei(Path::new("/g"), &root, &tx).unwrap();
        {
            let guard = fs.ilock(&ip);
            assert_eq!(guard.stat().nlink, 1);
        }
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }

    // An open reference keeps the bytes readable after the last unlink;
    // the inode is freed when the reference is put.
    {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs.namei(Path::new("/g"), &root, &tx).unwrap();
        fs.unlink(Path::new("/g"), &root, &tx).unwrap();
        {
            let mut guard = fs.ilock(&ip);
            let mut buf = [0u8; 5];
            assert_eq!(guard.read_bytes(&mut buf, 0), 5);
            assert_eq!(&buf, b"hello");
        }
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }

    // Directories must be empty to go away, and dot entries are pinned.
    {
        let tx = fs.begin_op();
        let root = fs.root();
        let d = fs
            .create(Path::new("/d"), InodeType::Dir, &root, &tx)
            .unwrap();
        let inner = fs
            .create(Path::new("/d/inner"), InodeType::File, &root, &tx)
            .unwrap();
        fs.iput(inner, &tx);
        fs.iput(d, &tx);

        assert!(fs.unlink(Path::new("/d"), &root, &tx).is_err());
        assert!(fs.unlink(Path::new("/d/."), &root, &tx).is_err());
        fs.unlink(Path::new("/d/inner"), &root, &tx).unwrap();
        fs.unlink(Path::new("/d"), &root, &tx).unwrap();
        assert!(fs.namei(Path::new("/d"), &root, &tx).is_err());
        fs.iput(root, &tx);
    }
}

/// Writes `nblocks` blocks to `path`, each stamped with its index, using a
/// few blocks per transaction the way the syscall layer batches writes.
fn write_big(fs: &FileSystem, path: &str, nblocks: usize) {
    {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs
            .create(Path::new(path), InodeType::File, &root, &tx)
            .unwrap();
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }

    let mut block = vec![0u8; BSIZE];
    for chunk in (0..nblocks).collect::<Vec<_>>().chunks(4) {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs.namei(Path::new(path), &root, &tx).unwrap();
        {
            let mut guard = fs.ilock(&ip);
            for &bn in chunk {
                block[..8].copy_from_slice(&(bn as u64).to_le_bytes());
                assert_eq!(
                    guard.write_bytes(&block, (bn * BSIZE) as u32, &tx),
                    Ok(BSIZE)
                );
            }
        }
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
    }
}

#[test]
fn big_file_reaches_double_indirect_blocks_and_frees_them() {
    // Enough blocks to spill past the direct and single-indirect ranges.
    let nblocks = rv6_fs::fs::NDIRECT + rv6_fs::fs::NINDIRECT + 13;
    let disk = mkfs_disk(600);
    let fs = mount(disk);

    write_big(&fs, "/big", nblocks);

    let tx = fs.begin_op();
    let root = fs.root();
    let ip = fs.namei(Path::new("/big"), &root, &tx).unwrap();
    {
        let mut guard = fs.ilock(&ip);
        assert_eq!(guard.stat().size, (nblocks * BSIZE) as u64);
        for &bn in &[0, rv6_fs::fs::NDIRECT, rv6_fs::fs::NDIRECT + 5, nblocks - 1] {
            let mut stamp = [0u8; 8];
            assert_eq!(guard.read_bytes(&mut stamp, (bn * BSIZE) as u32), 8);
            assert_eq!(u64::from_le_bytes(stamp), bn as u64);
        }
    }
    fs.iput(ip, &tx);
    fs.unlink(Path::new("/big"), &root, &tx).unwrap();
    fs.iput(root, &tx);
    drop(tx);

    // Truncation returned every block: an equally big file fits again on
    // this small disk.
    write_big(&fs, "/big2", nblocks);
}

#[test]
fn write_bounds() {
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk);
    drop(create_hello(&fs));

    let tx = fs.begin_op();
    let root = fs.root();
    let ip = fs.namei(Path::new("/f"), &root, &tx).unwrap();
    {
        let mut guard = fs.ilock(&ip);

        // Writes may not start past the end of the file.
        assert_eq!(guard.write_bytes(b"x", 6, &tx), Err(()));

        // A write reaching past the largest representable file is
        // rejected outright.
        let too_big = vec![0u8; MAXFILE * BSIZE + 1];
        assert_eq!(guard.write_bytes(&too_big, 0, &tx), Err(()));

        // Reads past the end return nothing rather than failing.
        let mut buf = [0u8; 4];
        assert_eq!(guard.read_bytes(&mut buf, 100), 0);
    }
    fs.iput(ip, &tx);
    fs.iput(root, &tx);
}

#[test]
fn update_survives_cache_recycling() {
    // Force the in-memory inode to be dropped and reloaded from disk by
    // remounting, and check every stat field round-trips.
    let disk = mkfs_disk(FSSIZE);
    let fs = mount(disk.clone());
    drop(create_hello(&fs));

    let before = {
        let tx = fs.begin_op();
        let root = fs.root();
        let ip = fs.namei(Path::new("/f"), &root, &tx).unwrap();
        let st = fs.ilock(&ip).stat();
        fs.iput(ip, &tx);
        fs.iput(root, &tx);
        st
    };

    let fs2 = remount(&disk);
    let tx = fs2.begin_op();
    let root = fs2.root();
    let ip = fs2.namei(Path::new("/f"), &root, &tx).unwrap();
    let after = fs2.ilock(&ip).stat();
    fs2.iput(ip, &tx);
    fs2.iput(root, &tx);

    assert_eq!(before.ino, after.ino);
    assert_eq!(before.typ, after.typ);
    assert_eq!(before.nlink, after.nlink);
    assert_eq!(before.size, after.size);
}
