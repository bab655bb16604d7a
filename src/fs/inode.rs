//! Inodes.
//!
//! An inode describes a single unnamed file: its type, link count, size,
//! and driver-owned contents. Each superblock keeps every live inode in a
//! hash keyed by inode number, which is the place where concurrent access
//! to one file synchronizes.
//!
//! Two counts govern an inode's life:
//!
//! * `ref_count` tracks external holders (open files, working directories,
//!   mountpoint backlinks). `RcInode` is the handle that maintains it:
//!   cloning increments, dropping decrements, and the last drop runs the
//!   eviction protocol against the owning superblock.
//! * `nlink` tracks names in the directory tree. A backendless filesystem
//!   keeps an inode cached while `nlink > 0` even with no holders; other
//!   filesystems evict as soon as `ref_count` reaches zero.
//!
//! The `inner` mutex protects everything mutable. Code may only examine or
//! modify an inode's fields or contents with the mutex held; holders keep a
//! long-term `RcInode` and lock only for short periods. Lock order puts the
//! superblock lock before any inode mutex, and a directory's mutex before
//! its child's.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use super::path::FileName;
use super::stat::{Stat, T_DEVICE, T_DIR, T_FIFO, T_FILE, T_SYMLINK};
use super::superblock::Superblock;
use crate::error::{Error, Result};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    Dir,
    File,
    Symlink,
    Device { major: u16, minor: u16 },
    Fifo,
}

impl InodeType {
    pub fn is_dir(&self) -> bool {
        *self == InodeType::Dir
    }
}

/// A mounted filesystem hanging off a directory.
///
/// The mount tree owns child filesystems: this is the strong edge from a
/// mountpoint down to the mounted superblock and its root.
pub struct MountData {
    pub sb: Arc<Superblock>,
    pub root: Arc<Inode>,
}

pub struct InodeInner {
    /// In the superblock's cache?
    pub valid: bool,
    /// Permission bits.
    pub perm: u16,
    /// Names referring to this inode; `2 + #subdirectories` on directories.
    pub nlink: u32,
    /// File body size in bytes.
    pub size: u64,
    /// Containing directory, for `..`. A lookup edge, never ownership.
    pub parent: Option<Weak<Inode>>,
    /// Present on directories that are mountpoints.
    pub mount: Option<MountData>,
}

pub struct Inode {
    /// Inode number, unique within `sb`.
    pub ino: u64,
    pub typ: InodeType,
    /// Owning superblock. The cache map holds the only strong edges back;
    /// superblock teardown breaks the cycle explicitly.
    pub sb: Arc<Superblock>,
    /// External holders. Maintained by `RcInode`, never written directly.
    pub ref_count: AtomicUsize,
    pub inner: Mutex<InodeInner>,
    /// Driver payload and operations.
    pub ops: Box<dyn InodeOps>,
}

impl Inode {
    pub fn new(
        sb: Arc<Superblock>,
        ino: u64,
        typ: InodeType,
        perm: u16,
        nlink: u32,
        ops: Box<dyn InodeOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            typ,
            sb,
            ref_count: AtomicUsize::new(0),
            inner: Mutex::new(InodeInner {
                valid: false,
                perm,
                nlink,
                size: 0,
                parent: None,
                mount: None,
            }),
            ops,
        })
    }

    /// Locks the inode.
    pub fn lock(&self) -> InodeGuard<'_> {
        InodeGuard {
            inode: self,
            inner: self.inner.lock(),
        }
    }

    /// Metadata snapshot.
    pub fn stat(&self) -> Stat {
        let inner = self.inner.lock();
        Stat {
            ino: self.ino,
            typ: match self.typ {
                InodeType::Dir => T_DIR,
                InodeType::File => T_FILE,
                InodeType::Symlink => T_SYMLINK,
                InodeType::Device { .. } => T_DEVICE,
                InodeType::Fifo => T_FIFO,
            },
            perm: inner.perm,
            nlink: inner.nlink,
            size: inner.size,
        }
    }
}

/// Holds the inode mutex; dropping unlocks.
pub struct InodeGuard<'a> {
    pub inode: &'a Inode,
    pub inner: MutexGuard<'a, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        self.inode
    }
}

/// A counted handle to an inode.
///
/// Holding one keeps the inode cached and its superblock alive. Do not drop
/// an `RcInode` while holding its own inode mutex or its superblock lock:
/// the final drop re-acquires both.
pub struct RcInode {
    ptr: Arc<Inode>,
}

impl core::fmt::Debug for RcInode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RcInode")
            .field("ino", &self.ptr.ino)
            .finish_non_exhaustive()
    }
}

impl RcInode {
    /// Wraps an inode, counting a new external holder.
    pub fn get(ptr: Arc<Inode>) -> Self {
        let _ = ptr.ref_count.fetch_add(1, Ordering::AcqRel);
        Self { ptr }
    }

    pub fn arc(&self) -> &Arc<Inode> {
        &self.ptr
    }

    /// Same underlying inode?
    pub fn is(&self, other: &Arc<Inode>) -> bool {
        Arc::ptr_eq(&self.ptr, other)
    }
}

impl Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        &self.ptr
    }
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        Self::get(self.ptr.clone())
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        let prev = self.ptr.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "RcInode: underflow");
        if prev == 1 {
            // Last holder: hand the inode back to its superblock for the
            // eviction / teardown decision.
            Superblock::inode_released(&self.ptr);
        }
    }
}

/// Sentinel cookie: iteration finished.
pub const COOKIE_END: u64 = u64::MAX;
/// Sentinel cookie: the `".."` entry comes next.
pub const COOKIE_PARENT: u64 = u64::MAX - 1;

/// A transient record exchanged between the VFS and a driver during lookup
/// and iteration. Carrying one implies nothing about caching.
#[derive(Clone, Debug)]
pub struct Dentry {
    pub name: Vec<u8>,
    pub ino: u64,
    /// Opaque resume point; pass it back to continue iterating after this
    /// entry.
    pub cookie: u64,
}

/// Driver-side inode operations.
///
/// The implementing object owns the file's payload; the VFS calls these
/// with the inode mutex of every involved inode held, in directory-before-
/// child order. Operations a file type does not support keep the defaults.
pub trait InodeOps: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Copies out of the file body at `off`. Reads beyond the current size
    /// return 0 bytes; holes read as zeros.
    fn read_at(&self, _inode: &Inode, _guard: &mut InodeInner, _off: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Inval)
    }

    /// Copies into the file body at `off`. The region must already be
    /// within the file size: callers extend with `truncate` first, so
    /// writes never create holes.
    fn write_at(&self, _inode: &Inode, _guard: &mut InodeInner, _off: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::Inval)
    }

    /// Grows (zero-filling) or shrinks the file body to `size`.
    fn truncate(&self, _inode: &Inode, _guard: &mut InodeInner, _size: u64) -> Result<()> {
        Err(Error::Inval)
    }

    /// Copies the symlink target, returning its length.
    fn readlink(&self, _inode: &Inode, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Inval)
    }

    /// Finds `name` in a directory. `.` and `..` never reach the driver.
    fn lookup(&self, _dir: &Inode, _name: &FileName) -> Result<Dentry> {
        Err(Error::NotDir)
    }

    /// Creates a new child of the given type and links it under `name`.
    /// `dir_inner` is the directory's locked state, for the link counts.
    fn create(
        &self,
        _dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        _name: &FileName,
        _typ: InodeType,
        _perm: u16,
    ) -> Result<Arc<Inode>> {
        Err(Error::NotDir)
    }

    /// Creates a symlink to `target` under `name`.
    fn symlink(
        &self,
        _dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        _name: &FileName,
        _target: &[u8],
    ) -> Result<Arc<Inode>> {
        Err(Error::NotDir)
    }

    /// Adds a second name for an existing non-directory inode.
    fn link(
        &self,
        _dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        _name: &FileName,
        _inode: &Arc<Inode>,
    ) -> Result<()> {
        Err(Error::NotDir)
    }

    /// Removes a non-directory name.
    fn unlink(&self, _dir: &Inode, _dir_inner: &mut InodeInner, _name: &FileName) -> Result<()> {
        Err(Error::NotDir)
    }

    /// Removes an empty directory.
    fn rmdir(&self, _dir: &Inode, _dir_inner: &mut InodeInner, _name: &FileName) -> Result<()> {
        Err(Error::NotDir)
    }

    /// Moves `name` from `dir` to `new_dir`/`new_name`, atomically with
    /// respect to the source directory: the new name is linked before the
    /// old one is unlinked. `new_dir_inner` is `None` when both names live
    /// in the same directory.
    fn rename(
        &self,
        _dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        _name: &FileName,
        _new_dir: &Arc<Inode>,
        _new_dir_inner: Option<&mut InodeInner>,
        _new_name: &FileName,
    ) -> Result<()> {
        Err(Error::NotDir)
    }

    /// Yields the child at iteration position `pos` (0-based, excluding the
    /// implicit dot entries), or `None` at the end.
    fn next_entry(&self, _dir: &Inode, _pos: u64) -> Result<Option<Dentry>> {
        Err(Error::NotDir)
    }
}
