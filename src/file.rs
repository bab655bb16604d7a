//! Support functions for system calls that involve file descriptors.
//!
//! A `File` is one open-file description: the inode handle, the access
//! mode, and the seek offset shared by everything that duplicated the
//! descriptor. Descriptor tables hold `Arc<File>`, so `dup` and `clone`
//! are reference bumps.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::fs::{self, FsContext, InodeType, Path, RcInode, Stat};

bitflags::bitflags! {
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREATE = 1 << 9;
        const TRUNC = 1 << 10;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

pub enum FileKind {
    Inode { ip: RcInode, off: Mutex<u64> },
    /// Device nodes and FIFOs are creatable and statable, but their bodies
    /// belong to drivers outside this kernel core.
    Device { ip: RcInode },
}

pub struct File {
    readable: bool,
    writable: bool,
    pub kind: FileKind,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl File {
    /// Opens `path`, optionally creating or truncating it.
    pub fn open(ctx: &FsContext, path: &Path, flags: OpenFlags, perm: u16) -> Result<Arc<File>> {
        let ip = if flags.contains(OpenFlags::CREATE) {
            match fs::namei(ctx, path) {
                Ok(ip) => ip,
                Err(Error::NotFound) => fs::create(ctx, path, InodeType::File, perm)?,
                Err(e) => return Err(e),
            }
        } else {
            fs::namei(ctx, path)?
        };

        let writable = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);
        let readable = !flags.contains(OpenFlags::WRONLY);
        match ip.typ {
            InodeType::Dir => {
                if writable {
                    return Err(Error::IsDir);
                }
            }
            InodeType::Symlink => return Err(Error::Inval),
            _ => {}
        }

        if flags.contains(OpenFlags::TRUNC) && ip.typ == InodeType::File {
            let mut g = ip.lock();
            ip.ops.truncate(&ip, &mut g.inner, 0)?;
        }

        let kind = match ip.typ {
            InodeType::Device { .. } | InodeType::Fifo => FileKind::Device { ip },
            _ => FileKind::Inode {
                ip,
                off: Mutex::new(0),
            },
        };
        Ok(Arc::new(File {
            readable,
            writable,
            kind,
        }))
    }

    pub fn stat(&self) -> Stat {
        match &self.kind {
            FileKind::Inode { ip, .. } | FileKind::Device { ip } => ip.stat(),
        }
    }

    /// Reads from the current offset, advancing it by the amount read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(Error::Access);
        }
        match &self.kind {
            FileKind::Inode { ip, off } => {
                let mut off = off.lock();
                let mut g = ip.lock();
                let n = ip.ops.read_at(ip, &mut g.inner, *off, buf)?;
                *off += n as u64;
                Ok(n)
            }
            FileKind::Device { .. } => Err(Error::Io),
        }
    }

    /// Writes at the current offset, extending the file first when the
    /// write reaches past the end.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::Access);
        }
        match &self.kind {
            FileKind::Inode { ip, off } => {
                let mut off = off.lock();
                let mut g = ip.lock();
                let end = *off + buf.len() as u64;
                if end > g.inner.size {
                    // Writes never create holes; growth goes through
                    // truncate, which zero-fills.
                    ip.ops.truncate(ip, &mut g.inner, end)?;
                }
                let n = ip.ops.write_at(ip, &mut g.inner, *off, buf)?;
                *off += n as u64;
                Ok(n)
            }
            FileKind::Device { .. } => Err(Error::Io),
        }
    }

    /// Repositions the offset. The result must not be negative.
    pub fn lseek(&self, offset: i64, whence: Whence) -> Result<u64> {
        match &self.kind {
            FileKind::Inode { ip, off } => {
                let mut off = off.lock();
                let base = match whence {
                    Whence::Set => 0,
                    Whence::Cur => *off as i64,
                    Whence::End => ip.lock().inner.size as i64,
                };
                let target = base.checked_add(offset).ok_or(Error::Inval)?;
                if target < 0 {
                    return Err(Error::Inval);
                }
                *off = target as u64;
                Ok(*off)
            }
            FileKind::Device { .. } => Err(Error::Io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tmpfs::tests::test_fs;

    fn p(s: &str) -> &Path {
        Path::from_str(s).unwrap()
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::mkdir(&ctx, p("/a"), 0o755).unwrap();
        fs::create(&ctx, p("/a/f"), InodeType::File, 0o644).unwrap();

        let f = File::open(&ctx, p("/a/f"), OpenFlags::RDWR, 0).unwrap();
        let msg = b"Hello, tmpfs!";
        assert_eq!(f.write(msg).unwrap(), msg.len());
        assert_eq!(f.lseek(0, Whence::Set).unwrap(), 0);
        let mut out = [0u8; 13];
        assert_eq!(f.read(&mut out).unwrap(), 13);
        assert_eq!(&out, msg);
        assert_eq!(f.stat().size, 13);
    }

    #[test]
    fn large_round_trip_across_layers() {
        let (_kmem, _vfs, ctx) = test_fs(256);
        let f = File::open(
            &ctx,
            p("/big"),
            OpenFlags::RDWR | OpenFlags::CREATE,
            0o644,
        )
        .unwrap();

        // Spans the embedded buffer, several direct blocks and the first
        // indirect entries.
        let len = (crate::param::NDIRECT + 3) * crate::param::PGSIZE + 123;
        let data: alloc::vec::Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        assert_eq!(f.write(&data).unwrap(), len);
        let _ = f.lseek(0, Whence::Set).unwrap();
        let mut out = alloc::vec![0u8; len];
        assert_eq!(f.read(&mut out).unwrap(), len);
        assert!(out == data);

        // Reading past the end is empty, not an error.
        assert_eq!(f.read(&mut out[..16]).unwrap(), 0);
    }

    #[test]
    fn seek_past_end_then_write_zero_fills() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let f = File::open(&ctx, p("/f"), OpenFlags::RDWR | OpenFlags::CREATE, 0o644).unwrap();
        f.write(b"head").unwrap();
        let _ = f.lseek(10000, Whence::Set).unwrap();
        f.write(b"tail").unwrap();
        assert_eq!(f.stat().size, 10004);

        let _ = f.lseek(0, Whence::Set).unwrap();
        let mut out = alloc::vec![0xffu8; 10004];
        assert_eq!(f.read(&mut out).unwrap(), 10004);
        assert_eq!(&out[..4], b"head");
        assert!(out[4..10000].iter().all(|b| *b == 0));
        assert_eq!(&out[10000..], b"tail");
    }

    #[test]
    fn open_modes_are_enforced() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();

        let ro = File::open(&ctx, p("/f"), OpenFlags::RDONLY, 0).unwrap();
        assert_eq!(ro.write(b"x").unwrap_err(), Error::Access);
        let wo = File::open(&ctx, p("/f"), OpenFlags::WRONLY, 0).unwrap();
        let mut b = [0u8; 1];
        assert_eq!(wo.read(&mut b).unwrap_err(), Error::Access);

        // Directories open read-only at most.
        assert_eq!(
            File::open(&ctx, p("/"), OpenFlags::RDWR, 0).unwrap_err(),
            Error::IsDir
        );
    }

    #[test]
    fn trunc_flag_empties_the_file() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let f = File::open(&ctx, p("/f"), OpenFlags::RDWR | OpenFlags::CREATE, 0o644).unwrap();
        f.write(b"contents").unwrap();
        drop(f);
        let f = File::open(&ctx, p("/f"), OpenFlags::RDWR | OpenFlags::TRUNC, 0).unwrap();
        assert_eq!(f.stat().size, 0);
    }

    #[test]
    fn device_bodies_are_not_ours() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::create(&ctx, p("/dev0"), InodeType::Device { major: 1, minor: 5 }, 0o666).unwrap();
        let f = File::open(&ctx, p("/dev0"), OpenFlags::RDWR, 0).unwrap();
        let mut b = [0u8; 4];
        assert_eq!(f.read(&mut b).unwrap_err(), Error::Io);
        assert_eq!(f.write(b"x").unwrap_err(), Error::Io);
    }

    #[test]
    fn lazy_unmount_keeps_open_files_alive() {
        let (_kmem, vfs, ctx) = test_fs(256);
        fs::mkdir(&ctx, p("/m"), 0o755).unwrap();
        {
            let m = fs::namei(&ctx, p("/m")).unwrap();
            vfs.mount(&m, "tmpfs", None, crate::fs::MountFlags::empty(), "")
                .unwrap();
        }
        let f = File::open(&ctx, p("/m/f"), OpenFlags::RDWR | OpenFlags::CREATE, 0o644).unwrap();
        let child_sb = match &f.kind {
            FileKind::Inode { ip, .. } => ip.sb.clone(),
            _ => unreachable!(),
        };

        let mp = {
            let (dir, name) = fs::nameiparent(&ctx, p("/m")).unwrap();
            let dent = {
                let _g = dir.lock();
                dir.ops
                    .lookup(&dir, crate::fs::FileName::new(&name).unwrap())
                    .unwrap()
            };
            fs::get_dentry_inode(&dir, &dent).unwrap()
        };
        vfs.unmount_lazy(&mp).unwrap();

        // The namespace reverted at once: `/m` is an ordinary directory.
        let m = fs::namei(&ctx, p("/m")).unwrap();
        assert!(Arc::ptr_eq(&m.sb, &ctx.root.sb));
        drop(m);
        drop(mp);

        // The open file still works.
        f.write(b"still here").unwrap();
        let _ = f.lseek(0, Whence::Set).unwrap();
        let mut out = [0u8; 10];
        assert_eq!(f.read(&mut out).unwrap(), 10);
        assert_eq!(&out, b"still here");

        {
            let st = child_sb.state.read();
            assert!(st.detached && !st.valid);
            assert!(st.root.is_some());
        }

        // Closing the file drains the superblock.
        drop(f);
        {
            let st = child_sb.state.read();
            assert!(st.root.is_none());
            assert!(st.inodes.is_empty());
        }
    }
}
