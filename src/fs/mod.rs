//! Virtual filesystem layer.
//!
//! Drivers register a `FilesystemType`; mounting one produces a
//! `Superblock` whose root hangs off a directory of the parent filesystem.
//! Everything above the driver seam lives here: the driver registry, the
//! mount tree, path resolution with mount and symlink traversal, and the
//! directory-level front-ends the system-call layer talks to.
//!
//! Lock order, outermost first; violating it is a bug:
//!   1. the process-wide mount mutex (registry + mount-tree mutation)
//!   2. superblock rwlock, parent before child, write side for mutation
//!   3. inode mutex, directory before child
//!   4. page and buddy-pool spinlocks, inside the allocator
//!
//! Holders of an `RcInode` must not drop it while inside its superblock
//! lock or its own mutex; the final drop re-enters both.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::error::{Error, Result};
use crate::param::{MAXPATH, MAXSYMLINKS, NFSTYPE};

mod inode;
mod path;
mod stat;
mod superblock;
pub mod tmpfs;

pub use self::inode::{
    Dentry, Inode, InodeGuard, InodeInner, InodeOps, InodeType, MountData, RcInode, COOKIE_END,
    COOKIE_PARENT,
};
pub use self::path::{FileName, Path};
pub use self::stat::{Stat, T_DEVICE, T_DIR, T_FIFO, T_FILE, T_SYMLINK};
pub use self::superblock::{SbState, SuperOps, Superblock};

bitflags::bitflags! {
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
    }
}

/// A filesystem driver, as registered with the VFS.
pub trait FilesystemType: Send + Sync {
    /// Unique driver name, e.g. `"tmpfs"`.
    fn name(&self) -> &'static str;

    /// Builds a new, not-yet-valid superblock with an allocated root inode.
    /// `data` carries the mount options; drivers reject options they do not
    /// recognize.
    fn mount(
        self: Arc<Self>,
        device: Option<RcInode>,
        flags: MountFlags,
        data: &str,
    ) -> Result<Arc<Superblock>>;

    /// Releases every piece of filesystem-private state of `sb`. Called on
    /// mount failure and at final teardown.
    fn free(&self, sb: &Superblock);
}

struct Registered {
    driver: Arc<dyn FilesystemType>,
    /// Superblocks mounted from this driver. Weak so that a lazily
    /// detached superblock can destroy itself without the mount mutex;
    /// dead entries are pruned on the next scan.
    sbs: Vec<alloc::sync::Weak<Superblock>>,
}

/// The mount layer: driver registry plus the namespace root.
pub struct Vfs {
    /// The process-wide mount mutex.
    registry: Mutex<Vec<Registered>>,
    root: Once<RcInode>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            root: Once::new(),
        }
    }

    /// Registers a filesystem driver.
    pub fn register_fs_type(&self, driver: Arc<dyn FilesystemType>) -> Result<()> {
        if driver.name().is_empty() {
            return Err(Error::Inval);
        }
        let mut reg = self.registry.lock();
        if reg.iter().any(|r| r.driver.name() == driver.name()) {
            return Err(Error::Exists);
        }
        if reg.len() >= NFSTYPE {
            return Err(Error::NoSpace);
        }
        reg.push(Registered {
            driver,
            sbs: Vec::new(),
        });
        Ok(())
    }

    /// Unregisters a driver. Refuses while any of its superblocks live.
    pub fn unregister_fs_type(&self, name: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let pos = reg
            .iter()
            .position(|r| r.driver.name() == name)
            .ok_or(Error::NotFound)?;
        reg[pos].sbs.retain(|w| w.upgrade().is_some());
        if !reg[pos].sbs.is_empty() {
            return Err(Error::Busy);
        }
        let _ = reg.remove(pos);
        Ok(())
    }

    fn find_driver(
        reg: &[Registered],
        name: &str,
    ) -> Result<(usize, Arc<dyn FilesystemType>)> {
        reg.iter()
            .position(|r| r.driver.name() == name)
            .map(|i| (i, reg[i].driver.clone()))
            .ok_or(Error::NotFound)
    }

    /// Mounts the namespace root. Runs once, at boot.
    pub fn mount_root(
        &self,
        fstype: &str,
        device: Option<RcInode>,
        flags: MountFlags,
        data: &str,
    ) -> Result<()> {
        if self.root.is_completed() {
            return Err(Error::AlreadyInit);
        }
        let mut reg = self.registry.lock();
        let (idx, driver) = Self::find_driver(&reg, fstype)?;
        let sb = driver.clone().mount(device, flags, data)?;
        let sb = scopeguard::guard(sb, |sb| driver.free(&sb));
        let root = Self::validate_mounted(&sb)?;
        {
            let mut st = sb.state.write();
            st.valid = true;
            st.initialized = true;
            root.inner.lock().valid = true;
            let _ = st.inodes.insert(root.ino, root.clone());
        }
        let sb = scopeguard::ScopeGuard::into_inner(sb);
        reg[idx].sbs.push(Arc::downgrade(&sb));
        let _ = self.root.call_once(|| RcInode::get(root));
        Ok(())
    }

    /// The process root of a fresh context.
    pub fn root(&self) -> Result<RcInode> {
        self.root.get().cloned().ok_or(Error::Inval)
    }

    /// A resolution context rooted at the namespace root.
    pub fn context(&self) -> Result<FsContext> {
        let root = self.root()?;
        Ok(FsContext {
            cwd: root.clone(),
            root,
        })
    }

    /// Checks a driver-built superblock before committing the mount.
    fn validate_mounted(sb: &Arc<Superblock>) -> Result<Arc<Inode>> {
        let root = sb.root().ok_or(Error::Inval)?;
        if !root.typ.is_dir() {
            return Err(Error::Inval);
        }
        if sb.backendless != sb.device.is_none() {
            return Err(Error::Inval);
        }
        if let Some((used, total)) = sb.ops.blocks() {
            if used > total {
                return Err(Error::Inval);
            }
        }
        {
            let st = sb.state.read();
            if st.valid || st.dirty || st.initialized {
                return Err(Error::Inval);
            }
        }
        Ok(root)
    }

    /// Mounts a filesystem on `mountpoint`.
    ///
    /// The mountpoint must be a directory that is not already a mountpoint
    /// and has no holders beyond the caller and one working directory.
    pub fn mount(
        &self,
        mountpoint: &RcInode,
        fstype: &str,
        device: Option<RcInode>,
        flags: MountFlags,
        data: &str,
    ) -> Result<()> {
        let mut reg = self.registry.lock();
        let (idx, driver) = Self::find_driver(&reg, fstype)?;

        let parent_sb = mountpoint.sb.clone();
        let mut pst = parent_sb.state.write();
        if !pst.valid {
            return Err(Error::Inval);
        }
        if !mountpoint.typ.is_dir() {
            return Err(Error::NotDir);
        }
        let mut mg = mountpoint.lock();
        if mg.inner.mount.is_some() {
            return Err(Error::Busy);
        }
        if mountpoint.ref_count.load(core::sync::atomic::Ordering::Acquire) > 2 {
            return Err(Error::Busy);
        }

        let sb = driver.clone().mount(device, flags, data)?;
        // Undone in reverse on any validation failure below.
        let sb = scopeguard::guard(sb, |sb| driver.free(&sb));
        let root = Self::validate_mounted(&sb)?;

        {
            let mut st = sb.state.write();
            st.valid = true;
            st.initialized = true;
            st.parent = Arc::downgrade(&parent_sb);
            st.mountpoint = Some(mountpoint.clone());
            root.inner.lock().valid = true;
            let _ = st.inodes.insert(root.ino, root.clone());
        }
        let sb = scopeguard::ScopeGuard::into_inner(sb);
        mg.inner.mount = Some(MountData {
            sb: sb.clone(),
            root,
        });
        pst.mount_count += 1;
        reg[idx].sbs.push(Arc::downgrade(&sb));
        Ok(())
    }

    /// Strict unmount: refuses with `Busy` while child mounts, dirty state,
    /// or inode holders remain.
    pub fn unmount(&self, mountpoint: &RcInode) -> Result<()> {
        self.do_unmount(mountpoint, false)
    }

    /// Lazy unmount: detaches the filesystem from the namespace at once and
    /// defers destruction until the last holder drains.
    pub fn unmount_lazy(&self, mountpoint: &RcInode) -> Result<()> {
        self.do_unmount(mountpoint, true)
    }

    fn do_unmount(&self, mountpoint: &RcInode, lazy: bool) -> Result<()> {
        let mut reg = self.registry.lock();
        let parent_sb = mountpoint.sb.clone();

        // Deferred drops: handles released only after every lock is gone.
        let sb;
        let drained;
        {
            let mut pst = parent_sb.state.write();
            let mut mg = mountpoint.lock();
            let (mnt_sb, root) = match mg.inner.mount.as_ref() {
                Some(md) => (md.sb.clone(), md.root.clone()),
                None => return Err(Error::Inval),
            };
            sb = mnt_sb;

            let mut st = sb.state.write();
            if st.mount_count != 0 {
                return Err(Error::Busy);
            }
            if !lazy && st.dirty {
                return Err(Error::Busy);
            }
            let mut rg = root.lock();
            sb.ops.unmount_begin(&sb, &mut st);

            if !lazy {
                // Nothing but the root may remain cached, and nobody may
                // hold it.
                let only_root = st.inodes.values().all(|ip| Arc::ptr_eq(ip, &root));
                if !only_root
                    || root.ref_count.load(core::sync::atomic::Ordering::Acquire) > 0
                {
                    return Err(Error::Busy);
                }
                rg.inner.valid = false;
                let _ = st.inodes.remove(&root.ino);
            }
            drop(rg);

            st.valid = false;
            st.detached = true;
            let mp_backlink = st.mountpoint.take();
            let old_root = if lazy { None } else { st.root.take() };
            drop(st);

            let md = mg.inner.mount.take();
            pst.mount_count -= 1;

            // Prune this superblock (and any dead entries) from the
            // driver's list.
            if let Some(r) = reg
                .iter_mut()
                .find(|r| r.driver.name() == sb.fstype.name())
            {
                r.sbs
                    .retain(|w| w.upgrade().map_or(false, |s| !Arc::ptr_eq(&s, &sb)));
            }

            drop(mg);
            drop(pst);

            // Locks are gone; release the deferred handles.
            drop(md);
            drop(old_root);
            drop(mp_backlink);

            drained = {
                let st = sb.state.read();
                Superblock::drained(&st)
            };
        }
        drop(reg);

        if !lazy {
            sb.fstype.free(&sb);
        } else if drained {
            Superblock::finalize(&sb);
        }
        Ok(())
    }
}

/// Per-process resolution state: the namespace root and working directory.
pub struct FsContext {
    pub root: RcInode,
    pub cwd: RcInode,
}

impl FsContext {
    pub fn chdir(&mut self, dir: RcInode) -> Result<()> {
        if !dir.typ.is_dir() {
            return Err(Error::NotDir);
        }
        self.cwd = dir;
        Ok(())
    }
}

/// Follows mounts downward: a directory with a mounted filesystem stands
/// for that filesystem's root.
fn traverse_mounts(mut ip: RcInode) -> RcInode {
    loop {
        let below = {
            let g = ip.lock();
            g.inner.mount.as_ref().map(|md| md.root.clone())
        };
        match below {
            Some(root) => ip = RcInode::get(root),
            None => return ip,
        }
    }
}

/// One resolution step inside `dir`.
///
/// `.` and `..` are handled here, against the process root and across mount
/// boundaries; ordinary names go to the driver and the result re-enters any
/// filesystem mounted on it.
pub fn ilookup(ctx: &FsContext, dir: &RcInode, name: &FileName) -> Result<RcInode> {
    if !dir.typ.is_dir() {
        return Err(Error::NotDir);
    }
    if name.is_dot() {
        return Ok(dir.clone());
    }
    if name.is_dotdot() {
        // Climb out of local roots first; the process root absorbs `..`.
        let mut cur = dir.clone();
        loop {
            if ctx.root.is(cur.arc()) {
                return Ok(cur);
            }
            let local_root = cur
                .sb
                .root()
                .map_or(false, |r| Arc::ptr_eq(&r, cur.arc()));
            if !local_root {
                break;
            }
            let mp = {
                let st = cur.sb.state.read();
                st.mountpoint.clone()
            };
            match mp {
                Some(mp) => cur = mp,
                // Root of the whole namespace (or of a detached tree).
                None => return Ok(cur),
            }
        }
        let parent = {
            let g = cur.lock();
            g.inner.parent.clone()
        };
        return match parent.and_then(|w| w.upgrade()) {
            Some(p) => Ok(RcInode::get(p)),
            None => Ok(cur),
        };
    }

    let dent = {
        let _g = dir.lock();
        dir.ops.lookup(dir, name)?
    };
    let child = get_dentry_inode(dir, &dent)?;
    Ok(traverse_mounts(child))
}

/// Resolves a dentry, as returned by lookup or iteration, to a counted
/// inode on the same filesystem as `dir`.
pub fn get_dentry_inode(dir: &Inode, dent: &Dentry) -> Result<RcInode> {
    dir.sb.get_inode(dent.ino)
}

/// Looks up and returns the inode for `path`.
pub fn namei(ctx: &FsContext, path: &Path) -> Result<RcInode> {
    let (ip, _) = namex(ctx, path, false)?;
    Ok(ip)
}

/// Returns the parent directory of `path`'s last component, and that
/// component's name.
pub fn nameiparent(ctx: &FsContext, path: &Path) -> Result<(RcInode, Vec<u8>)> {
    let (ip, name) = namex(ctx, path, true)?;
    Ok((ip, name.ok_or(Error::Inval)?))
}

fn namex(
    ctx: &FsContext,
    path: &Path,
    want_parent: bool,
) -> Result<(RcInode, Option<Vec<u8>>)> {
    let mut ip = if path.is_absolute() {
        ctx.root.clone()
    } else {
        ctx.cwd.clone()
    };
    let mut rest: Vec<u8> = path.as_bytes().to_vec();
    let mut depth = 0;

    loop {
        let (next_rest, name) = {
            // SAFETY: `rest` starts as `Path` bytes and is only ever
            // rebuilt from path and symlink-target bytes, none of which
            // contain NUL.
            let p = unsafe { Path::from_bytes(&rest) };
            match p.skipelem()? {
                None => break,
                Some((np, nm)) => (np.as_bytes().to_vec(), nm.as_bytes().to_vec()),
            }
        };
        if !ip.typ.is_dir() {
            return Err(Error::NotDir);
        }
        // SAFETY: produced by `skipelem`, which upholds the invariant.
        let name_ref = unsafe { FileName::from_bytes(&name) };
        let last = next_rest.iter().all(|c| *c == b'/');
        if want_parent && last {
            return Ok((ip, Some(name)));
        }

        let next = ilookup(ctx, &ip, name_ref)?;
        if next.typ == InodeType::Symlink {
            depth += 1;
            if depth > MAXSYMLINKS {
                return Err(Error::Loop);
            }
            let mut buf = [0u8; MAXPATH];
            let n = next.ops.readlink(&next, &mut buf)?;
            let target = &buf[..n];
            let mut spliced = Vec::with_capacity(n + 1 + next_rest.len());
            spliced.extend_from_slice(target);
            spliced.push(b'/');
            spliced.extend_from_slice(&next_rest);
            if target.first() == Some(&b'/') {
                ip = ctx.root.clone();
            }
            // `ip` stays at the directory containing the link.
            rest = spliced;
            continue;
        }

        ip = next;
        rest = next_rest;
    }

    if want_parent {
        return Err(Error::Inval);
    }
    Ok((ip, None))
}

/// Reads one directory entry, resuming at `cookie` (0 to start). Yields
/// `"."`, then `".."`, then the children in driver order; `None` at the
/// end. The returned dentry's cookie resumes after that entry.
pub fn readdir(ctx: &FsContext, dir: &RcInode, cookie: u64) -> Result<Option<Dentry>> {
    if !dir.typ.is_dir() {
        return Err(Error::NotDir);
    }
    match cookie {
        0 => Ok(Some(Dentry {
            name: b".".to_vec(),
            ino: dir.ino,
            cookie: COOKIE_PARENT,
        })),
        COOKIE_PARENT => {
            // SAFETY: a literal without NUL or '/'.
            let dotdot = unsafe { FileName::from_bytes(b"..") };
            let parent = ilookup(ctx, dir, dotdot)?;
            Ok(Some(Dentry {
                name: b"..".to_vec(),
                ino: parent.ino,
                cookie: 1,
            }))
        }
        COOKIE_END => Ok(None),
        pos => {
            let _g = dir.lock();
            match dir.ops.next_entry(dir, pos - 1)? {
                Some(mut dent) => {
                    // Driver cookies count children; shift past `.`/`..`.
                    dent.cookie += 1;
                    Ok(Some(dent))
                }
                None => Ok(None),
            }
        }
    }
}

fn name_of(bytes: &[u8]) -> Result<&FileName> {
    FileName::new(bytes)
}

fn lookup_in(dir: &InodeGuard<'_>, name: &FileName) -> Result<Dentry> {
    dir.inode.ops.lookup(dir.inode, name)
}

/// Creates a file, directory, device node or FIFO at `path`.
pub fn create(
    ctx: &FsContext,
    path: &Path,
    typ: InodeType,
    perm: u16,
) -> Result<RcInode> {
    if typ == InodeType::Symlink {
        return Err(Error::Inval);
    }
    let (dp, name) = nameiparent(ctx, path)?;
    let name = name_of(&name)?;
    if name.is_dot() || name.is_dotdot() {
        return Err(Error::Exists);
    }

    let mut st = dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }
    let mut dg = dp.lock();
    match lookup_in(&dg, name) {
        Ok(_) => return Err(Error::Exists),
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    let child = dp.ops.create(dp.arc(), &mut dg.inner, name, typ, perm)?;
    child.inner.lock().valid = true;
    let _ = st.inodes.insert(child.ino, child.clone());
    drop(dg);
    drop(st);
    Ok(RcInode::get(child))
}

/// Creates a directory.
pub fn mkdir(ctx: &FsContext, path: &Path, perm: u16) -> Result<RcInode> {
    create(ctx, path, InodeType::Dir, perm)
}

/// Creates a symlink at `path` pointing to `target`.
pub fn symlink(ctx: &FsContext, target: &[u8], path: &Path) -> Result<RcInode> {
    if target.is_empty() || target.contains(&0) {
        return Err(Error::Inval);
    }
    if target.len() > MAXPATH {
        return Err(Error::NameTooLong);
    }
    let (dp, name) = nameiparent(ctx, path)?;
    let name = name_of(&name)?;
    if name.is_dot() || name.is_dotdot() {
        return Err(Error::Exists);
    }

    let mut st = dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }
    let mut dg = dp.lock();
    match lookup_in(&dg, name) {
        Ok(_) => return Err(Error::Exists),
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    let child = dp.ops.symlink(dp.arc(), &mut dg.inner, name, target)?;
    child.inner.lock().valid = true;
    let _ = st.inodes.insert(child.ino, child.clone());
    drop(dg);
    drop(st);
    Ok(RcInode::get(child))
}

/// Adds a second name (`new`) for the existing non-directory at `old`.
pub fn link(ctx: &FsContext, old: &Path, new: &Path) -> Result<()> {
    let ip = namei(ctx, old)?;
    if ip.typ.is_dir() {
        return Err(Error::IsDir);
    }
    let (dp, name) = nameiparent(ctx, new)?;
    if !Arc::ptr_eq(&dp.sb, &ip.sb) {
        return Err(Error::Inval);
    }
    let name = name_of(&name)?;
    if name.is_dot() || name.is_dotdot() {
        return Err(Error::Exists);
    }

    let st = dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }
    let mut dg = dp.lock();
    match lookup_in(&dg, name) {
        Ok(_) => return Err(Error::Exists),
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    dp.ops.link(dp.arc(), &mut dg.inner, name, ip.arc())?;
    drop(dg);
    drop(st);
    Ok(())
}

/// Removes the non-directory name at `path`. The inode itself lives on
/// while other names or holders remain.
pub fn unlink(ctx: &FsContext, path: &Path) -> Result<()> {
    let (dp, name) = nameiparent(ctx, path)?;
    let name = name_of(&name)?;
    if name.is_dot() || name.is_dotdot() {
        return Err(Error::Inval);
    }

    let mut st = dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }
    let mut dg = dp.lock();
    let dent = lookup_in(&dg, name)?;
    let child = match st.inodes.get(&dent.ino) {
        Some(c) => c.clone(),
        // Named but evicted (an unmount attempt got that far once).
        None => dp.sb.ops.load_inode(&dp.sb, dent.ino).map_err(|_| Error::Io)?,
    };
    if child.typ.is_dir() {
        return Err(Error::IsDir);
    }
    dp.ops.unlink(&*dp, &mut dg.inner, name)?;
    let gone = {
        let cg = child.lock();
        cg.inner.nlink == 0
            && child.ref_count.load(core::sync::atomic::Ordering::Acquire) == 0
    };
    if gone {
        Superblock::remove_inode(&mut st, &child);
    }
    drop(dg);
    drop(st);
    Ok(())
}

/// Removes the empty directory at `path`.
pub fn rmdir(ctx: &FsContext, path: &Path) -> Result<()> {
    let (dp, name) = nameiparent(ctx, path)?;
    let name = name_of(&name)?;
    if name.is_dot() {
        return Err(Error::Inval);
    }
    if name.is_dotdot() {
        return Err(Error::NotEmpty);
    }

    let mut st = dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }
    let mut dg = dp.lock();
    let dent = lookup_in(&dg, name)?;
    let child = match st.inodes.get(&dent.ino) {
        Some(c) => c.clone(),
        None => dp.sb.ops.load_inode(&dp.sb, dent.ino).map_err(|_| Error::Io)?,
    };
    if !child.typ.is_dir() {
        return Err(Error::NotDir);
    }
    {
        let cg = child.lock();
        if cg.inner.mount.is_some() {
            return Err(Error::Busy);
        }
        // An empty directory holds exactly its `.` and `..` links.
        if cg.inner.nlink != 2 {
            return Err(Error::NotEmpty);
        }
    }
    dp.ops.rmdir(&*dp, &mut dg.inner, name)?;
    let gone = {
        let cg = child.lock();
        cg.inner.nlink == 0
            && child.ref_count.load(core::sync::atomic::Ordering::Acquire) == 0
    };
    if gone {
        Superblock::remove_inode(&mut st, &child);
    }
    drop(dg);
    drop(st);
    Ok(())
}

/// Moves `old` to `new`. Both must live on the same filesystem; the new
/// name is linked before the old one is unlinked, so the entry never
/// disappears from the source directory's point of view.
pub fn rename(ctx: &FsContext, old: &Path, new: &Path) -> Result<()> {
    let (old_dp, old_name) = nameiparent(ctx, old)?;
    let (new_dp, new_name) = nameiparent(ctx, new)?;
    if !Arc::ptr_eq(&old_dp.sb, &new_dp.sb) {
        return Err(Error::Inval);
    }
    let old_name = name_of(&old_name)?;
    let new_name = name_of(&new_name)?;
    if old_name.is_dot() || old_name.is_dotdot() || new_name.is_dot() || new_name.is_dotdot() {
        return Err(Error::Inval);
    }

    let st = old_dp.sb.state.write();
    if !st.valid && !st.detached {
        return Err(Error::Inval);
    }

    // A directory must not move under its own descendant.
    {
        let dent = {
            let g = old_dp.lock();
            lookup_in(&g, old_name)?
        };
        if dent.ino != new_dp.ino {
            let mut anc = Some(new_dp.arc().clone());
            while let Some(a) = anc {
                if a.ino == dent.ino {
                    return Err(Error::Inval);
                }
                anc = a.inner.lock().parent.clone().and_then(|w| w.upgrade());
            }
        }
    }

    // Same directory: a single lock; otherwise order by inode number to
    // keep concurrent renames deadlock-free.
    let same = Arc::ptr_eq(old_dp.arc(), new_dp.arc());
    let res = if same {
        let mut g = old_dp.lock();
        old_dp
            .ops
            .rename(old_dp.arc(), &mut g.inner, old_name, new_dp.arc(), None, new_name)
    } else if old_dp.ino < new_dp.ino {
        let mut og = old_dp.lock();
        let mut ng = new_dp.lock();
        old_dp.ops.rename(
            old_dp.arc(),
            &mut og.inner,
            old_name,
            new_dp.arc(),
            Some(&mut ng.inner),
            new_name,
        )
    } else {
        let mut ng = new_dp.lock();
        let mut og = old_dp.lock();
        old_dp.ops.rename(
            old_dp.arc(),
            &mut og.inner,
            old_name,
            new_dp.arc(),
            Some(&mut ng.inner),
            new_name,
        )
    };
    drop(st);
    res
}

/// Copies the target of the symlink at `path` into `buf`.
pub fn readlink(ctx: &FsContext, path: &Path, buf: &mut [u8]) -> Result<usize> {
    let ip = namei_nofollow(ctx, path)?;
    if ip.typ != InodeType::Symlink {
        return Err(Error::Inval);
    }
    ip.ops.readlink(&ip, buf)
}

/// `namei` that does not follow a symlink in the final component.
pub fn namei_nofollow(ctx: &FsContext, path: &Path) -> Result<RcInode> {
    match nameiparent(ctx, path) {
        Ok((dp, name)) => {
            let name = name_of(&name)?;
            ilookup(ctx, &dp, name)
        }
        // Paths like "/" have no final component to protect.
        Err(Error::Inval) => namei(ctx, path),
        Err(e) => Err(e),
    }
}

/// Grows or shrinks the regular file at `path`.
pub fn truncate(ctx: &FsContext, path: &Path, size: u64) -> Result<()> {
    let ip = namei(ctx, path)?;
    if ip.typ.is_dir() {
        return Err(Error::IsDir);
    }
    if ip.typ != InodeType::File {
        return Err(Error::Inval);
    }
    let mut g = ip.lock();
    let inner = &mut *g.inner;
    ip.ops.truncate(&ip, inner, size)
}

/// Metadata of the object at `path`.
pub fn stat(ctx: &FsContext, path: &Path) -> Result<Stat> {
    let ip = namei(ctx, path)?;
    Ok(ip.stat())
}
