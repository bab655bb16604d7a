//! tmpfs: the in-memory filesystem.
//!
//! Backendless; file bodies live in pages taken straight from the physical
//! allocator and every structure dies with the superblock. Inode numbers
//! come from a bump counter; the driver keeps a weak map of every live
//! node so that an inode evicted from the superblock cache (a failed or
//! lazy unmount does that) can be found again while the tree still names
//! it.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use super::{
    FilesystemType, Inode, InodeType, MountFlags, RcInode, SbState, SuperOps, Superblock,
};
use crate::addr::PAddr;
use crate::error::{Error, Result};
use crate::kalloc::{AllocFlags, Kmem};
use crate::param::{MAXPATH, NINDIRECT};

mod inode;

use self::inode::{DevNode, DirNode, FileNode, SymlinkNode};

/// Inode number of every tmpfs root.
pub const ROOT_INO: u64 = 1;

/// State shared by a tmpfs instance and all of its file payloads.
pub(self) struct TmpfsShared {
    kmem: Arc<Kmem>,
    /// Data and index pages currently held.
    pages: AtomicU64,
}

impl TmpfsShared {
    fn alloc_page(&self) -> Result<u64> {
        let pa = self
            .kmem
            .alloc(0, AllocFlags::ZERO)
            .ok_or(Error::NoMem)?;
        let _ = self.pages.fetch_add(1, Ordering::Relaxed);
        Ok(pa.into_usize() as u64)
    }

    fn free_page(&self, pa: u64) {
        self.kmem.free(PAddr::new(pa as usize), 0);
        let _ = self.pages.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bytes of an owned data page.
    ///
    /// # Safety
    ///
    /// `pa` must be a page this filesystem allocated and not yet freed, and
    /// the caller must hold the mutex of the inode that owns it.
    unsafe fn page<'a>(&self, pa: u64) -> &'a mut [u8] {
        let bytes = unsafe { self.kmem.page_slice_mut(PAddr::new(pa as usize), 0) };
        // SAFETY: see function contract; the caller guarantees exclusive
        // access for the manufactured lifetime.
        unsafe { core::slice::from_raw_parts_mut(bytes.as_mut_ptr(), bytes.len()) }
    }

    /// Entries of an owned index page.
    ///
    /// # Safety
    ///
    /// Same as `page`; additionally `pa` must hold index entries.
    unsafe fn entries<'a>(&self, pa: u64) -> &'a mut [u64] {
        let bytes = unsafe { self.kmem.page_slice_mut(PAddr::new(pa as usize), 0) };
        // SAFETY: pages are PGSIZE-aligned, which is more than u64 needs.
        unsafe { core::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut u64, NINDIRECT) }
    }
}

/// Per-mount driver state behind the superblock ops table.
pub struct TmpfsSuper {
    shared: Arc<TmpfsShared>,
    next_ino: AtomicU64,
    /// Every node ever handed out, by number. Weak: the tree owns them.
    nodes: Mutex<HashMap<u64, Weak<Inode>>>,
}

impl TmpfsSuper {
    fn register(&self, inode: &Arc<Inode>) {
        let _ = self
            .nodes
            .lock()
            .insert(inode.ino, Arc::downgrade(inode));
    }

    fn build(
        &self,
        sb: &Arc<Superblock>,
        ino: u64,
        typ: InodeType,
        perm: u16,
        nlink: u32,
        ops: Box<dyn super::InodeOps>,
    ) -> Arc<Inode> {
        let inode = Inode::new(sb.clone(), ino, typ, perm, nlink, ops);
        self.register(&inode);
        inode
    }

    fn alloc_root(&self, sb: &Arc<Superblock>) -> Arc<Inode> {
        self.build(sb, ROOT_INO, InodeType::Dir, 0o755, 2, DirNode::new())
    }

    /// Symlinks carry their target from birth, so they bypass
    /// `alloc_inode`.
    pub(self) fn alloc_symlink(&self, sb: &Arc<Superblock>, target: &[u8]) -> Result<Arc<Inode>> {
        if target.len() > MAXPATH {
            return Err(Error::NameTooLong);
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let inode = self.build(sb, ino, InodeType::Symlink, 0o777, 1, SymlinkNode::new(target));
        inode.inner.lock().size = target.len() as u64;
        Ok(inode)
    }
}

impl SuperOps for TmpfsSuper {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn alloc_inode(&self, sb: &Arc<Superblock>, typ: InodeType, perm: u16) -> Result<Arc<Inode>> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let (ops, nlink): (Box<dyn super::InodeOps>, u32) = match typ {
            InodeType::Dir => (DirNode::new(), 2),
            InodeType::File => (FileNode::new(self.shared.clone()), 1),
            InodeType::Device { .. } | InodeType::Fifo => (Box::new(DevNode), 1),
            InodeType::Symlink => return Err(Error::Inval),
        };
        Ok(self.build(sb, ino, typ, perm, nlink, ops))
    }

    fn load_inode(&self, _sb: &Arc<Superblock>, ino: u64) -> Result<Arc<Inode>> {
        // Still named by the tree, just not in the superblock cache.
        self.nodes
            .lock()
            .get(&ino)
            .and_then(Weak::upgrade)
            .ok_or(Error::NotFound)
    }

    fn unmount_begin(&self, _sb: &Superblock, state: &mut SbState) {
        let root = state.root.clone();
        state.inodes.retain(|_, ip| {
            let keep = ip.ref_count.load(Ordering::Acquire) > 0
                || root.as_ref().map_or(false, |r| Arc::ptr_eq(r, ip));
            if !keep {
                ip.inner.lock().valid = false;
            }
            keep
        });
    }

    fn blocks(&self) -> Option<(u64, u64)> {
        Some((
            self.shared.pages.load(Ordering::Relaxed),
            self.shared.kmem.managed_frames() as u64,
        ))
    }
}

/// The registered driver.
pub struct TmpFsType {
    kmem: Arc<Kmem>,
}

impl TmpFsType {
    pub fn new(kmem: Arc<Kmem>) -> Arc<Self> {
        Arc::new(Self { kmem })
    }
}

impl FilesystemType for TmpFsType {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn mount(
        self: Arc<Self>,
        device: Option<RcInode>,
        _flags: MountFlags,
        data: &str,
    ) -> Result<Arc<Superblock>> {
        if device.is_some() {
            // Backendless by definition.
            return Err(Error::Inval);
        }
        // No mount options are recognized.
        if !data.trim().is_empty() {
            return Err(Error::Inval);
        }
        let ops = TmpfsSuper {
            shared: Arc::new(TmpfsShared {
                kmem: self.kmem.clone(),
                pages: AtomicU64::new(0),
            }),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            nodes: Mutex::new(HashMap::new()),
        };
        let sb = Superblock::new(self, Box::new(ops), None);
        let sup = sb
            .ops
            .as_any()
            .downcast_ref::<TmpfsSuper>()
            .expect("tmpfs: own ops");
        let root = sup.alloc_root(&sb);
        sb.state.write().root = Some(root);
        Ok(sb)
    }

    fn free(&self, sb: &Superblock) {
        // The payload tree frees its own pages on drop; only the node map
        // needs clearing so stale weak entries cannot resurrect anything.
        if let Some(sup) = sb.ops.as_any().downcast_ref::<TmpfsSuper>() {
            sup.nodes.lock().clear();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::inode::FileNode;
    use super::*;
    use crate::fs::{self, FsContext, Path, Vfs};
    use crate::param::{EMBEDDED_LEN, PGSHIFT, PGSIZE};
    use crate::platform::{PhysRange, PlatformInfo};

    /// A real, dereferencable "physical" region carved from the test heap.
    pub(crate) fn test_kmem(pages: usize) -> Arc<Kmem> {
        let size = pages << PGSHIFT;
        let layout = core::alloc::Layout::from_size_align(size, PGSIZE).unwrap();
        // Leaked on purpose: the region must outlive every allocator user.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);
        let platform = PlatformInfo::new(
            PhysRange::new(base, base + size),
            PhysRange::new(base, base),
        );
        Arc::new(Kmem::new(&platform))
    }

    pub(crate) fn test_fs(pages: usize) -> (Arc<Kmem>, Vfs, FsContext) {
        let kmem = test_kmem(pages);
        let vfs = Vfs::new();
        vfs.register_fs_type(TmpFsType::new(kmem.clone())).unwrap();
        vfs.mount_root("tmpfs", None, MountFlags::empty(), "").unwrap();
        let ctx = vfs.context().unwrap();
        (kmem, vfs, ctx)
    }

    fn p(s: &str) -> &Path {
        Path::from_str(s).unwrap()
    }

    fn file_shape(ip: &RcInode) -> Option<(u64, bool, bool)> {
        let node = ip.ops.as_any().downcast_ref::<FileNode>()?;
        match &*node.content.lock() {
            inode::FileContent::Embedded(_) => None,
            inode::FileContent::Indexed(ix) => Some(ix.shape()),
        }
    }

    #[test]
    fn registry_rejects_duplicates() {
        let kmem = test_kmem(16);
        let vfs = Vfs::new();
        vfs.register_fs_type(TmpFsType::new(kmem.clone())).unwrap();
        assert_eq!(
            vfs.register_fs_type(TmpFsType::new(kmem)),
            Err(Error::Exists)
        );
        assert_eq!(vfs.unregister_fs_type("nofs"), Err(Error::NotFound));
        vfs.unregister_fs_type("tmpfs").unwrap();
    }

    #[test]
    fn unregister_refuses_while_mounted() {
        let (_kmem, vfs, _ctx) = test_fs(64);
        assert_eq!(vfs.unregister_fs_type("tmpfs"), Err(Error::Busy));
    }

    #[test]
    fn mount_options_are_rejected() {
        let kmem = test_kmem(16);
        let vfs = Vfs::new();
        vfs.register_fs_type(TmpFsType::new(kmem)).unwrap();
        assert_eq!(
            vfs.mount_root("tmpfs", None, MountFlags::empty(), "size=1g"),
            Err(Error::Inval)
        );
    }

    #[test]
    fn mkdir_create_lookup() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let dir = fs::mkdir(&ctx, p("/a"), 0o755).unwrap();
        assert!(dir.typ.is_dir());
        let f = fs::create(&ctx, p("/a/f"), InodeType::File, 0o644).unwrap();
        assert_eq!(f.typ, InodeType::File);

        let by_walk = fs::namei(&ctx, p("/a/f")).unwrap();
        assert!(by_walk.is(f.arc()));
        assert_eq!(
            fs::namei(&ctx, p("/a/missing")).unwrap_err(),
            Error::NotFound
        );
        assert_eq!(
            fs::create(&ctx, p("/a/f"), InodeType::File, 0o644).unwrap_err(),
            Error::Exists
        );
    }

    #[test]
    fn path_walk_normalizes() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::mkdir(&ctx, p("/dir"), 0o755).unwrap();
        fs::mkdir(&ctx, p("/dir/nested"), 0o755).unwrap();
        let f = fs::create(&ctx, p("/dir/nested/file"), InodeType::File, 0o644).unwrap();

        let crooked = fs::namei(&ctx, p("///dir/./nested/../nested/file")).unwrap();
        assert!(crooked.is(f.arc()));

        let root = fs::namei(&ctx, p("/")).unwrap();
        assert!(root.is(ctx.root.arc()));
        let above = fs::namei(&ctx, p("/..")).unwrap();
        assert!(above.is(ctx.root.arc()));
    }

    #[test]
    fn dir_link_counts() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let root_links = ctx.root.stat().nlink;
        fs::mkdir(&ctx, p("/a"), 0o755).unwrap();
        fs::mkdir(&ctx, p("/a/b"), 0o755).unwrap();
        fs::mkdir(&ctx, p("/a/c"), 0o755).unwrap();

        // 2 + number of subdirectories.
        let a = fs::namei(&ctx, p("/a")).unwrap();
        assert_eq!(a.stat().nlink, 4);
        assert_eq!(ctx.root.stat().nlink, root_links + 1);

        fs::rmdir(&ctx, p("/a/b")).unwrap();
        assert_eq!(a.stat().nlink, 3);
        assert_eq!(fs::rmdir(&ctx, p("/a")).unwrap_err(), Error::NotEmpty);
        fs::rmdir(&ctx, p("/a/c")).unwrap();
        drop(a);
        fs::rmdir(&ctx, p("/a")).unwrap();
        assert_eq!(ctx.root.stat().nlink, root_links);
        assert_eq!(fs::namei(&ctx, p("/a")).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn hard_links_share_the_inode() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let f = fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();
        fs::link(&ctx, p("/f"), p("/g")).unwrap();
        assert_eq!(f.stat().nlink, 2);
        let g = fs::namei(&ctx, p("/g")).unwrap();
        assert!(g.is(f.arc()));

        fs::unlink(&ctx, p("/f")).unwrap();
        assert_eq!(f.stat().nlink, 1);
        assert!(fs::namei(&ctx, p("/g")).is_ok());
        fs::unlink(&ctx, p("/g")).unwrap();
        assert_eq!(f.stat().nlink, 0);

        // Directories cannot be hard-linked.
        fs::mkdir(&ctx, p("/d"), 0o755).unwrap();
        assert_eq!(fs::link(&ctx, p("/d"), p("/e")).unwrap_err(), Error::IsDir);
    }

    #[test]
    fn symlinks_resolve_and_loop() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::mkdir(&ctx, p("/dir"), 0o755).unwrap();
        let f = fs::create(&ctx, p("/dir/f"), InodeType::File, 0o644).unwrap();
        fs::symlink(&ctx, b"/dir", p("/s")).unwrap();

        let via = fs::namei(&ctx, p("/s/f")).unwrap();
        assert!(via.is(f.arc()));

        let mut buf = [0u8; 64];
        let n = fs::readlink(&ctx, p("/s"), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"/dir");

        // A cycle trips the expansion limit.
        fs::symlink(&ctx, b"/loop2", p("/loop1")).unwrap();
        fs::symlink(&ctx, b"/loop1", p("/loop2")).unwrap();
        assert_eq!(fs::namei(&ctx, p("/loop1/x")).unwrap_err(), Error::Loop);
    }

    #[test]
    fn rename_moves_and_updates_counts() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::mkdir(&ctx, p("/a"), 0o755).unwrap();
        fs::mkdir(&ctx, p("/b"), 0o755).unwrap();
        fs::mkdir(&ctx, p("/a/sub"), 0o755).unwrap();
        let f = fs::create(&ctx, p("/a/f"), InodeType::File, 0o644).unwrap();

        fs::rename(&ctx, p("/a/f"), p("/b/f2")).unwrap();
        assert_eq!(fs::namei(&ctx, p("/a/f")).unwrap_err(), Error::NotFound);
        assert!(fs::namei(&ctx, p("/b/f2")).unwrap().is(f.arc()));
        assert_eq!(f.stat().nlink, 1);

        let a = fs::namei(&ctx, p("/a")).unwrap();
        let b = fs::namei(&ctx, p("/b")).unwrap();
        assert_eq!(a.stat().nlink, 3);
        assert_eq!(b.stat().nlink, 2);
        fs::rename(&ctx, p("/a/sub"), p("/b/sub")).unwrap();
        assert_eq!(a.stat().nlink, 2);
        assert_eq!(b.stat().nlink, 3);

        // `..` of the moved directory follows it.
        let up = fs::namei(&ctx, p("/b/sub/..")).unwrap();
        assert!(up.is(b.arc()));

        // A directory cannot move under its own descendant.
        assert_eq!(
            fs::rename(&ctx, p("/b"), p("/b/sub/b")).unwrap_err(),
            Error::Inval
        );
    }

    #[test]
    fn truncate_walks_the_index_layers() {
        let (_kmem, _vfs, ctx) = test_fs(1024);
        let f = fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();
        let pg = PGSIZE as u64;

        fs::truncate(&ctx, p("/f"), 5 * pg).unwrap();
        assert_eq!(f.stat().size, 5 * pg);
        assert_eq!(file_shape(&f), Some((5, false, false)));

        fs::truncate(&ctx, p("/f"), 100 * pg).unwrap();
        assert_eq!(file_shape(&f), Some((100, true, false)));

        fs::truncate(&ctx, p("/f"), 600 * pg).unwrap();
        assert_eq!(file_shape(&f), Some((600, true, true)));

        // Idempotent.
        fs::truncate(&ctx, p("/f"), 600 * pg).unwrap();
        assert_eq!(file_shape(&f), Some((600, true, true)));

        fs::truncate(&ctx, p("/f"), 0).unwrap();
        assert_eq!(file_shape(&f), None);
        assert_eq!(f.stat().size, 0);
    }

    #[test]
    fn truncate_releases_every_page() {
        let (_kmem, vfs, ctx) = test_fs(1024);
        let used_before = {
            let root = vfs.root().unwrap();
            root.sb.ops.blocks().unwrap().0
        };
        let f = fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();
        fs::truncate(&ctx, p("/f"), 600 * PGSIZE as u64).unwrap();
        assert!(f.sb.ops.blocks().unwrap().0 > used_before);
        fs::truncate(&ctx, p("/f"), 0).unwrap();
        assert_eq!(f.sb.ops.blocks().unwrap().0, used_before);
    }

    #[test]
    fn embedded_bytes_survive_migration() {
        let (_kmem, _vfs, ctx) = test_fs(256);
        let f = fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();
        let msg = b"short body";

        {
            let mut g = f.lock();
            f.ops.truncate(&f, &mut g.inner, msg.len() as u64).unwrap();
            f.ops.write_at(&f, &mut g.inner, 0, msg).unwrap();
            assert!(file_shape(&f).is_none());

            // Growth past the inline buffer moves the bytes into block 0.
            f.ops
                .truncate(&f, &mut g.inner, (EMBEDDED_LEN + PGSIZE) as u64)
                .unwrap();
            let mut out = [0u8; 10];
            assert_eq!(f.ops.read_at(&f, &mut g.inner, 0, &mut out).unwrap(), 10);
            assert_eq!(&out, msg);
            // The grown region reads as zeros.
            let mut z = [0xffu8; 32];
            let _ = f.ops.read_at(&f, &mut g.inner, PGSIZE as u64, &mut z).unwrap();
            assert!(z.iter().all(|b| *b == 0));

            // And shrinking back re-inlines the prefix.
            f.ops.truncate(&f, &mut g.inner, 4).unwrap();
            assert!(file_shape(&f).is_none());
            let mut out = [0u8; 4];
            assert_eq!(f.ops.read_at(&f, &mut g.inner, 0, &mut out).unwrap(), 4);
            assert_eq!(&out, b"shor");
        }
    }

    #[test]
    fn writes_may_not_pass_eof() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let f = fs::create(&ctx, p("/f"), InodeType::File, 0o644).unwrap();
        let mut g = f.lock();
        assert_eq!(
            f.ops.write_at(&f, &mut g.inner, 0, b"x").unwrap_err(),
            Error::Inval
        );
    }

    #[test]
    fn readdir_yields_dots_then_children() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        fs::mkdir(&ctx, p("/d"), 0o755).unwrap();
        fs::create(&ctx, p("/d/x"), InodeType::File, 0o644).unwrap();
        fs::create(&ctx, p("/d/y"), InodeType::File, 0o644).unwrap();
        let d = fs::namei(&ctx, p("/d")).unwrap();

        let mut names: Vec<Vec<u8>> = Vec::new();
        let mut cookie = 0;
        while let Some(dent) = fs::readdir(&ctx, &d, cookie).unwrap() {
            cookie = dent.cookie;
            names.push(dent.name);
        }
        assert_eq!(&names[0], b".");
        assert_eq!(&names[1], b"..");
        let mut rest: Vec<_> = names[2..].to_vec();
        rest.sort();
        assert_eq!(rest, alloc::vec![b"x".to_vec(), b"y".to_vec()]);

        // `..` of a first-level directory is the root.
        let dent = fs::readdir(&ctx, &d, crate::fs::COOKIE_PARENT)
            .unwrap()
            .unwrap();
        assert_eq!(dent.ino, ctx.root.ino);
    }

    #[test]
    fn mknod_and_fifo() {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let dev = fs::create(
            &ctx,
            p("/null"),
            InodeType::Device { major: 1, minor: 3 },
            0o666,
        )
        .unwrap();
        assert_eq!(dev.typ, InodeType::Device { major: 1, minor: 3 });
        let fifo = fs::create(&ctx, p("/pipe"), InodeType::Fifo, 0o644).unwrap();
        assert_eq!(fifo.typ, InodeType::Fifo);
    }

    #[test]
    fn mount_and_unmount_balance() {
        let (kmem, vfs, ctx) = test_fs(256);
        fs::mkdir(&ctx, p("/m"), 0o755).unwrap();
        let root_links = ctx.root.stat().nlink;
        let cache_size = {
            let st = ctx.root.sb.state.read();
            st.inodes.len()
        };

        {
            let m = fs::namei(&ctx, p("/m")).unwrap();
            vfs.mount(&m, "tmpfs", None, MountFlags::empty(), "").unwrap();
        }
        {
            let st = ctx.root.sb.state.read();
            assert_eq!(st.mount_count, 1);
        }

        // The walk lands on the mounted root now.
        let m = fs::namei(&ctx, p("/m")).unwrap();
        assert!(!Arc::ptr_eq(&m.sb, &ctx.root.sb));
        assert_eq!(m.ino, ROOT_INO);
        fs::create(&ctx, p("/m/inner"), InodeType::File, 0o644).unwrap();
        fs::unlink(&ctx, p("/m/inner")).unwrap();

        // `..` crosses back to the parent filesystem.
        let up = fs::namei(&ctx, p("/m/..")).unwrap();
        assert!(up.is(ctx.root.arc()));
        drop(up);
        drop(m);

        let mp = {
            // Resolve the mountpoint itself via its parent, not the mount.
            let (dir, name) = fs::nameiparent(&ctx, p("/m")).unwrap();
            let dent = {
                let _g = dir.lock();
                dir.ops
                    .lookup(&dir, crate::fs::FileName::new(&name).unwrap())
                    .unwrap()
            };
            fs::get_dentry_inode(&dir, &dent).unwrap()
        };
        vfs.unmount(&mp).unwrap();
        drop(mp);

        assert_eq!(ctx.root.stat().nlink, root_links);
        {
            let st = ctx.root.sb.state.read();
            assert_eq!(st.mount_count, 0);
            assert_eq!(st.inodes.len(), cache_size);
        }
        // An ordinary directory again.
        let m = fs::namei(&ctx, p("/m")).unwrap();
        assert!(Arc::ptr_eq(&m.sb, &ctx.root.sb));
        let _ = kmem;
    }

    #[test]
    fn unmount_refuses_busy() {
        let (_kmem, vfs, ctx) = test_fs(256);
        fs::mkdir(&ctx, p("/m"), 0o755).unwrap();
        {
            let m = fs::namei(&ctx, p("/m")).unwrap();
            vfs.mount(&m, "tmpfs", None, MountFlags::empty(), "").unwrap();
        }
        let held = fs::create(&ctx, p("/m/f"), InodeType::File, 0o644).unwrap();

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
        assert_eq!(vfs.unmount(&mp), Err(Error::Busy));

        drop(held);
        vfs.unmount(&mp).unwrap();
    }

    #[test]
    fn mounting_on_a_mountpoint_is_busy() {
        let (_kmem, vfs, ctx) = test_fs(256);
        fs::mkdir(&ctx, p("/m"), 0o755).unwrap();
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
        vfs.mount(&mp, "tmpfs", None, MountFlags::empty(), "").unwrap();
        assert_eq!(
            vfs.mount(&mp, "tmpfs", None, MountFlags::empty(), ""),
            Err(Error::Busy)
        );
        vfs.unmount(&mp).unwrap();
    }
}
