//! tmpfs inode payloads.
//!
//! Every payload type owns its file body outright and returns each page to
//! the allocator when the inode dies. Regular files start with a small
//! inline buffer and migrate to a paged block index on first growth past
//! it; the index runs direct, then single-indirect, then double-indirect,
//! with `u64` frame addresses (0 = none) packed into index pages.
//!
//! The VFS calls in here with the inode mutex held, so the interior
//! payload locks are uncontended; they exist to keep the types `Sync`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use spin::Mutex;

use super::{TmpfsShared, TmpfsSuper};
use crate::error::{Error, Result};
use crate::fs::{Dentry, FileName, Inode, InodeInner, InodeOps, InodeType};
use crate::param::{EMBEDDED_LEN, MAXFILE, NDIRECT, NINDIRECT, PGSIZE};

/// Paged block index of a regular file.
#[derive(Default)]
pub(super) struct BlockIndex {
    direct: [u64; NDIRECT],
    indirect: u64,
    dindirect: u64,
    /// Allocated data blocks; index pages are not counted here.
    nblocks: u64,
}

pub(super) enum FileContent {
    /// Bodies up to `EMBEDDED_LEN` bytes live inline. Bytes past the file
    /// size are kept zero.
    Embedded([u8; EMBEDDED_LEN]),
    Indexed(BlockIndex),
}

impl BlockIndex {
    /// Frame address of data block `bn`, 0 when absent.
    fn get(&self, sh: &TmpfsShared, bn: u64) -> u64 {
        let bn = bn as usize;
        if bn < NDIRECT {
            self.direct[bn]
        } else if bn < NDIRECT + NINDIRECT {
            if self.indirect == 0 {
                return 0;
            }
            // SAFETY: `indirect` is an index page this file owns.
            unsafe { sh.entries(self.indirect)[bn - NDIRECT] }
        } else {
            let i = bn - NDIRECT - NINDIRECT;
            let (hi, lo) = (i / NINDIRECT, i % NINDIRECT);
            if self.dindirect == 0 {
                return 0;
            }
            // SAFETY: both levels are index pages this file owns.
            let l1 = unsafe { sh.entries(self.dindirect)[hi] };
            if l1 == 0 {
                return 0;
            }
            unsafe { sh.entries(l1)[lo] }
        }
    }

    /// Installs `pa` as data block `bn`, allocating the index pages on the
    /// way down as needed. On failure the caller still owns `pa`.
    fn set(&mut self, sh: &TmpfsShared, bn: u64, pa: u64) -> Result<()> {
        let bn = bn as usize;
        if bn < NDIRECT {
            debug_assert_eq!(self.direct[bn], 0);
            self.direct[bn] = pa;
        } else if bn < NDIRECT + NINDIRECT {
            if self.indirect == 0 {
                self.indirect = sh.alloc_page()?;
            }
            // SAFETY: owned index page.
            let e = unsafe { sh.entries(self.indirect) };
            debug_assert_eq!(e[bn - NDIRECT], 0);
            e[bn - NDIRECT] = pa;
        } else {
            let i = bn - NDIRECT - NINDIRECT;
            let (hi, lo) = (i / NINDIRECT, i % NINDIRECT);
            if self.dindirect == 0 {
                self.dindirect = sh.alloc_page()?;
            }
            // SAFETY: owned index pages; the two levels are distinct frames.
            let l1 = unsafe { sh.entries(self.dindirect) };
            if l1[hi] == 0 {
                l1[hi] = sh.alloc_page()?;
            }
            let e = unsafe { sh.entries(l1[hi]) };
            debug_assert_eq!(e[lo], 0);
            e[lo] = pa;
        }
        Ok(())
    }

    /// Removes data block `bn` (which must be the current last one) and
    /// frees every index page that just became empty: inner page first,
    /// then the outer.
    fn take_last(&mut self, sh: &TmpfsShared) -> u64 {
        debug_assert!(self.nblocks > 0);
        let bn = (self.nblocks - 1) as usize;
        self.nblocks -= 1;
        if bn < NDIRECT {
            let pa = self.direct[bn];
            self.direct[bn] = 0;
            pa
        } else if bn < NDIRECT + NINDIRECT {
            // SAFETY: owned index page.
            let e = unsafe { sh.entries(self.indirect) };
            let pa = e[bn - NDIRECT];
            e[bn - NDIRECT] = 0;
            if bn == NDIRECT {
                sh.free_page(self.indirect);
                self.indirect = 0;
            }
            pa
        } else {
            let i = bn - NDIRECT - NINDIRECT;
            let (hi, lo) = (i / NINDIRECT, i % NINDIRECT);
            // SAFETY: owned index pages.
            let l1 = unsafe { sh.entries(self.dindirect) };
            let inner = l1[hi];
            let e = unsafe { sh.entries(inner) };
            let pa = e[lo];
            e[lo] = 0;
            if lo == 0 {
                sh.free_page(inner);
                l1[hi] = 0;
                if hi == 0 {
                    sh.free_page(self.dindirect);
                    self.dindirect = 0;
                }
            }
            pa
        }
    }

    /// Appends zeroed data blocks until `to` are allocated. On exhaustion
    /// everything appended so far is taken back.
    fn grow(&mut self, sh: &TmpfsShared, to: u64) -> Result<()> {
        let from = self.nblocks;
        while self.nblocks < to {
            let pa = match sh.alloc_page() {
                Ok(pa) => pa,
                Err(e) => {
                    self.shrink(sh, from);
                    return Err(e);
                }
            };
            if let Err(e) = self.set(sh, self.nblocks, pa) {
                sh.free_page(pa);
                self.shrink(sh, from);
                return Err(e);
            }
            self.nblocks += 1;
        }
        Ok(())
    }

    /// Frees data blocks from the tail down to `to`, plus any index page a
    /// failed growth left behind with no entries.
    fn shrink(&mut self, sh: &TmpfsShared, to: u64) {
        while self.nblocks > to {
            let pa = self.take_last(sh);
            sh.free_page(pa);
        }
        if self.nblocks <= (NDIRECT + NINDIRECT) as u64 && self.dindirect != 0 {
            sh.free_page(self.dindirect);
            self.dindirect = 0;
        }
        if self.nblocks <= NDIRECT as u64 && self.indirect != 0 {
            sh.free_page(self.indirect);
            self.indirect = 0;
        }
    }

    #[cfg(test)]
    pub(super) fn shape(&self) -> (u64, bool, bool) {
        (self.nblocks, self.indirect != 0, self.dindirect != 0)
    }
}

/// Regular file.
pub(super) struct FileNode {
    shared: Arc<TmpfsShared>,
    pub(super) content: Mutex<FileContent>,
}

impl FileNode {
    pub(super) fn new(shared: Arc<TmpfsShared>) -> Box<Self> {
        Box::new(Self {
            shared,
            content: Mutex::new(FileContent::Embedded([0; EMBEDDED_LEN])),
        })
    }

    /// Copies `buf` into the indexed body at `off`; the blocks must exist.
    fn write_blocks(&self, ix: &BlockIndex, mut off: u64, mut buf: &[u8]) -> Result<()> {
        let sh = &*self.shared;
        while !buf.is_empty() {
            let bn = off / PGSIZE as u64;
            let inpg = (off % PGSIZE as u64) as usize;
            let m = core::cmp::min(buf.len(), PGSIZE - inpg);
            let pa = ix.get(sh, bn);
            if pa == 0 {
                return Err(Error::Io);
            }
            // SAFETY: a data page this file owns; the inode mutex is held.
            unsafe { sh.page(pa)[inpg..inpg + m].copy_from_slice(&buf[..m]) };
            off += m as u64;
            buf = &buf[m..];
        }
        Ok(())
    }

    fn read_blocks(&self, ix: &BlockIndex, mut off: u64, buf: &mut [u8]) {
        let sh = &*self.shared;
        let mut done = 0;
        while done < buf.len() {
            let bn = off / PGSIZE as u64;
            let inpg = (off % PGSIZE as u64) as usize;
            let m = core::cmp::min(buf.len() - done, PGSIZE - inpg);
            let pa = ix.get(sh, bn);
            if pa == 0 {
                // A hole reads as zeros.
                buf[done..done + m].fill(0);
            } else {
                // SAFETY: a data page this file owns; the inode mutex is held.
                unsafe { buf[done..done + m].copy_from_slice(&sh.page(pa)[inpg..inpg + m]) };
            }
            off += m as u64;
            done += m;
        }
    }
}

impl InodeOps for FileNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn read_at(
        &self,
        _inode: &Inode,
        inner: &mut InodeInner,
        off: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if off >= inner.size {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len() as u64, inner.size - off) as usize;
        match &*self.content.lock() {
            FileContent::Embedded(b) => {
                buf[..n].copy_from_slice(&b[off as usize..off as usize + n]);
            }
            FileContent::Indexed(ix) => self.read_blocks(ix, off, &mut buf[..n]),
        }
        Ok(n)
    }

    fn write_at(
        &self,
        _inode: &Inode,
        inner: &mut InodeInner,
        off: u64,
        buf: &[u8],
    ) -> Result<usize> {
        // Writes never grow the file here; the caller extends through
        // truncate first, so holes cannot appear.
        if off + buf.len() as u64 > inner.size {
            return Err(Error::Inval);
        }
        match &mut *self.content.lock() {
            FileContent::Embedded(b) => {
                b[off as usize..off as usize + buf.len()].copy_from_slice(buf);
            }
            FileContent::Indexed(ix) => self.write_blocks(ix, off, buf)?,
        }
        Ok(buf.len())
    }

    fn truncate(&self, _inode: &Inode, inner: &mut InodeInner, size: u64) -> Result<()> {
        if size > (MAXFILE * PGSIZE) as u64 {
            return Err(Error::NoSpace);
        }
        let old = inner.size;
        if size == old {
            return Ok(());
        }
        let sh = &*self.shared;
        let mut content = self.content.lock();

        if size > old {
            match &mut *content {
                FileContent::Embedded(_) if size <= EMBEDDED_LEN as u64 => {
                    // The inline tail is already zero.
                }
                FileContent::Embedded(b) => {
                    // Migrate the inline bytes into block 0, then grow.
                    let mut ix = BlockIndex::default();
                    ix.grow(sh, 1)?;
                    let pa = ix.get(sh, 0);
                    // SAFETY: a fresh data page this file owns.
                    unsafe { sh.page(pa)[..old as usize].copy_from_slice(&b[..old as usize]) };
                    let target = (size as usize + PGSIZE - 1) / PGSIZE;
                    if let Err(e) = ix.grow(sh, target as u64) {
                        ix.shrink(sh, 0);
                        return Err(e);
                    }
                    *content = FileContent::Indexed(ix);
                }
                FileContent::Indexed(ix) => {
                    let target = (size as usize + PGSIZE - 1) / PGSIZE;
                    ix.grow(sh, target as u64)?;
                }
            }
        } else {
            match &mut *content {
                FileContent::Embedded(b) => {
                    b[size as usize..old as usize].fill(0);
                }
                FileContent::Indexed(ix) => {
                    if size == 0 {
                        ix.shrink(sh, 0);
                        *content = FileContent::Embedded([0; EMBEDDED_LEN]);
                    } else if size <= EMBEDDED_LEN as u64 {
                        // Back to the inline body: keep the surviving
                        // prefix from block 0.
                        let mut b = [0; EMBEDDED_LEN];
                        let pa = ix.get(sh, 0);
                        if pa != 0 {
                            // SAFETY: a data page this file owns.
                            unsafe {
                                b[..size as usize].copy_from_slice(&sh.page(pa)[..size as usize])
                            };
                        }
                        ix.shrink(sh, 0);
                        *content = FileContent::Embedded(b);
                    } else {
                        let keep = (size as usize + PGSIZE - 1) / PGSIZE;
                        ix.shrink(sh, keep as u64);
                        // Zero the cut tail of the last block so later
                        // growth reads as zeros.
                        let cut = (size % PGSIZE as u64) as usize;
                        if cut != 0 {
                            let pa = ix.get(sh, keep as u64 - 1);
                            if pa != 0 {
                                // SAFETY: a data page this file owns.
                                unsafe { sh.page(pa)[cut..].fill(0) };
                            }
                        }
                    }
                }
            }
        }

        inner.size = size;
        Ok(())
    }
}

impl Drop for FileNode {
    fn drop(&mut self) {
        if let FileContent::Indexed(ix) = &mut *self.content.lock() {
            ix.shrink(&self.shared, 0);
        }
    }
}

/// Directory: a hash of owned names to child inodes.
pub(super) struct DirNode {
    pub(super) children: Mutex<HashMap<Box<[u8]>, Arc<Inode>>>,
}

impl DirNode {
    pub(super) fn new() -> Box<Self> {
        Box::new(Self {
            children: Mutex::new(HashMap::new()),
        })
    }
}

impl InodeOps for DirNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn lookup(&self, _dir: &Inode, name: &FileName) -> Result<Dentry> {
        let children = self.children.lock();
        let child = children.get(name.as_bytes()).ok_or(Error::NotFound)?;
        Ok(Dentry {
            name: name.as_bytes().to_vec(),
            ino: child.ino,
            cookie: 0,
        })
    }

    fn create(
        &self,
        dir: &Arc<Inode>,
        dir_inner: &mut InodeInner,
        name: &FileName,
        typ: InodeType,
        perm: u16,
    ) -> Result<Arc<Inode>> {
        let child = dir.sb.ops.alloc_inode(&dir.sb, typ, perm)?;
        child.inner.lock().parent = Some(Arc::downgrade(dir));
        if typ.is_dir() {
            // The child's `..`.
            dir_inner.nlink += 1;
        }
        let _ = self
            .children
            .lock()
            .insert(name.as_bytes().into(), child.clone());
        Ok(child)
    }

    fn symlink(
        &self,
        dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        name: &FileName,
        target: &[u8],
    ) -> Result<Arc<Inode>> {
        let sup = dir
            .sb
            .ops
            .as_any()
            .downcast_ref::<TmpfsSuper>()
            .ok_or(Error::Io)?;
        let child = sup.alloc_symlink(&dir.sb, target)?;
        child.inner.lock().parent = Some(Arc::downgrade(dir));
        let _ = self
            .children
            .lock()
            .insert(name.as_bytes().into(), child.clone());
        Ok(child)
    }

    fn link(
        &self,
        _dir: &Arc<Inode>,
        _dir_inner: &mut InodeInner,
        name: &FileName,
        inode: &Arc<Inode>,
    ) -> Result<()> {
        inode.inner.lock().nlink += 1;
        let _ = self
            .children
            .lock()
            .insert(name.as_bytes().into(), inode.clone());
        Ok(())
    }

    fn unlink(&self, _dir: &Inode, _dir_inner: &mut InodeInner, name: &FileName) -> Result<()> {
        let child = self
            .children
            .lock()
            .remove(name.as_bytes())
            .ok_or(Error::NotFound)?;
        let mut ci = child.inner.lock();
        debug_assert!(ci.nlink >= 1);
        ci.nlink -= 1;
        Ok(())
    }

    fn rmdir(&self, _dir: &Inode, dir_inner: &mut InodeInner, name: &FileName) -> Result<()> {
        let child = self
            .children
            .lock()
            .remove(name.as_bytes())
            .ok_or(Error::NotFound)?;
        {
            let mut ci = child.inner.lock();
            debug_assert_eq!(ci.nlink, 2);
            ci.nlink = 0;
            ci.parent = None;
        }
        // The child's `..` went away.
        dir_inner.nlink -= 1;
        Ok(())
    }

    fn rename(
        &self,
        _dir: &Arc<Inode>,
        dir_inner: &mut InodeInner,
        name: &FileName,
        new_dir: &Arc<Inode>,
        new_dir_inner: Option<&mut InodeInner>,
        new_name: &FileName,
    ) -> Result<()> {
        if new_dir_inner.is_none() && name.as_bytes() == new_name.as_bytes() {
            return Ok(());
        }
        let child = self
            .children
            .lock()
            .get(name.as_bytes())
            .cloned()
            .ok_or(Error::NotFound)?;
        let new_node = new_dir
            .ops
            .as_any()
            .downcast_ref::<DirNode>()
            .ok_or(Error::NotDir)?;

        // Link the new name before the old one goes away, so the entry is
        // reachable throughout.
        {
            let mut nc = new_node.children.lock();
            if nc.contains_key(new_name.as_bytes()) {
                return Err(Error::Exists);
            }
            let _ = nc.insert(new_name.as_bytes().into(), child.clone());
        }
        let _ = self.children.lock().remove(name.as_bytes());

        if let Some(new_inner) = new_dir_inner {
            if child.typ.is_dir() {
                dir_inner.nlink -= 1;
                new_inner.nlink += 1;
            }
            child.inner.lock().parent = Some(Arc::downgrade(new_dir));
        }
        Ok(())
    }

    fn next_entry(&self, _dir: &Inode, pos: u64) -> Result<Option<Dentry>> {
        let children = self.children.lock();
        Ok(children.iter().nth(pos as usize).map(|(name, child)| Dentry {
            name: name.to_vec(),
            ino: child.ino,
            cookie: pos + 1,
        }))
    }
}

/// Symlink. Short targets stay inline; long ones go to the heap.
pub(super) enum LinkTarget {
    Inline(ArrayVec<u8, EMBEDDED_LEN>),
    Heap(Vec<u8>),
}

pub(super) struct SymlinkNode {
    target: LinkTarget,
}

impl SymlinkNode {
    pub(super) fn new(target: &[u8]) -> Box<Self> {
        let target = if target.len() <= EMBEDDED_LEN {
            let mut v = ArrayVec::new();
            v.try_extend_from_slice(target).expect("symlink: inline");
            LinkTarget::Inline(v)
        } else {
            LinkTarget::Heap(target.to_vec())
        };
        Box::new(Self { target })
    }

    fn target(&self) -> &[u8] {
        match &self.target {
            LinkTarget::Inline(v) => v,
            LinkTarget::Heap(v) => v,
        }
    }
}

impl InodeOps for SymlinkNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn readlink(&self, _inode: &Inode, buf: &mut [u8]) -> Result<usize> {
        let t = self.target();
        let n = core::cmp::min(t.len(), buf.len());
        buf[..n].copy_from_slice(&t[..n]);
        Ok(n)
    }
}

/// Device node or FIFO; the identifier lives in the inode type, and the
/// body belongs to a driver this filesystem does not have.
pub(super) struct DevNode;

impl InodeOps for DevNode {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
