//! Superblocks.
//!
//! A superblock owns one mounted filesystem instance: its inode cache, its
//! root, the backlink to the directory it is mounted on, and the driver's
//! private state behind the ops table. A reader/writer lock guards all of
//! it; insertion and removal in the inode cache take the write side.
//!
//! Ownership flows strictly downward from the mount tree: a mountpoint
//! holds its child superblock strongly, while `parent` and the inodes'
//! backrefs are broken explicitly at teardown. A lazily unmounted
//! superblock lingers as `detached` until the last inode holder drains,
//! then destroys itself.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::sync::atomic::Ordering;

use hashbrown::HashMap;
use spin::RwLock;

use super::inode::{Inode, InodeType, RcInode};
use super::FilesystemType;
use crate::error::{Error, Result};

/// Everything mutable about a superblock, under its rwlock.
pub struct SbState {
    /// Mount committed and not yet unmounted.
    pub valid: bool,
    /// Unsynchronized driver state; refuses strict unmount.
    pub dirty: bool,
    /// Root initialized and attached.
    pub initialized: bool,
    /// Namespace-detached by a lazy unmount; destruction pending.
    pub detached: bool,
    /// Number of child mounts directly under this superblock.
    pub mount_count: usize,
    /// The directory on the parent filesystem this one is mounted on.
    pub mountpoint: Option<RcInode>,
    /// Superblock of the mountpoint. A lookup edge, never ownership.
    pub parent: Weak<Superblock>,
    /// Root inode; dropped at teardown to break the ownership cycle.
    pub root: Option<Arc<Inode>>,
    /// Every live inode, keyed by inode number.
    pub inodes: HashMap<u64, Arc<Inode>>,
}

/// Driver callbacks on a mounted filesystem.
pub trait SuperOps: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Allocates a fresh inode of the given type. The VFS inserts it into
    /// the cache afterwards.
    fn alloc_inode(&self, sb: &Arc<Superblock>, typ: InodeType, perm: u16) -> Result<Arc<Inode>>;

    /// Loads an inode from backing storage. Backendless filesystems have
    /// nothing to load from.
    fn load_inode(&self, _sb: &Arc<Superblock>, _ino: u64) -> Result<Arc<Inode>> {
        Err(Error::NotFound)
    }

    /// First phase of unmount: evict every cached inode nobody holds,
    /// except the root.
    fn unmount_begin(&self, sb: &Superblock, state: &mut SbState);

    /// `(used, total)` block counts when the filesystem is bounded.
    fn blocks(&self) -> Option<(u64, u64)>;
}

pub struct Superblock {
    pub fstype: Arc<dyn FilesystemType>,
    pub ops: Box<dyn SuperOps>,
    /// No device inode backs this filesystem; inodes live only in memory.
    pub backendless: bool,
    /// Backing device inode, on some other filesystem.
    pub device: Option<RcInode>,
    pub state: RwLock<SbState>,
}

impl Superblock {
    /// A fresh, not yet valid superblock. The driver's `mount` builds one,
    /// allocates the root, and hands both to the VFS for validation.
    pub fn new(
        fstype: Arc<dyn FilesystemType>,
        ops: Box<dyn SuperOps>,
        device: Option<RcInode>,
    ) -> Arc<Self> {
        let backendless = device.is_none();
        Arc::new(Self {
            fstype,
            ops,
            backendless,
            device,
            state: RwLock::new(SbState {
                valid: false,
                dirty: false,
                initialized: false,
                detached: false,
                mount_count: 0,
                mountpoint: None,
                parent: Weak::new(),
                root: None,
                inodes: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> Option<Arc<Inode>> {
        self.state.read().root.clone()
    }

    /// Asks the driver for a fresh inode and caches it.
    pub fn alloc_inode(self: &Arc<Self>, typ: InodeType, perm: u16) -> Result<RcInode> {
        let inode = self.ops.alloc_inode(self, typ, perm)?;
        Ok(RcInode::get(self.insert_inode(inode)))
    }

    /// Inserts a driver-built inode into the cache, marking it valid.
    ///
    /// On a duplicate inode number the existing entry wins and the new
    /// allocation is dropped.
    pub fn insert_inode(&self, inode: Arc<Inode>) -> Arc<Inode> {
        let mut st = self.state.write();
        if let Some(existing) = st.inodes.get(&inode.ino) {
            return existing.clone();
        }
        inode.inner.lock().valid = true;
        let _ = st.inodes.insert(inode.ino, inode.clone());
        inode
    }

    /// Finds the inode numbered `ino`, loading it through the driver on a
    /// cache miss.
    pub fn get_inode(self: &Arc<Self>, ino: u64) -> Result<RcInode> {
        if let Ok(ip) = self.get_inode_cached(ino) {
            return Ok(ip);
        }
        let loaded = self.ops.load_inode(self, ino)?;
        Ok(RcInode::get(self.insert_inode(loaded)))
    }

    /// Cache-only lookup. The validity check happens under the inode lock,
    /// so an entry mid-eviction reads as absent.
    pub fn get_inode_cached(&self, ino: u64) -> Result<RcInode> {
        let st = self.state.read();
        let inode = st.inodes.get(&ino).ok_or(Error::NotFound)?;
        let inner = inode.inner.lock();
        if !inner.valid {
            return Err(Error::NotFound);
        }
        drop(inner);
        Ok(RcInode::get(inode.clone()))
    }

    /// Removes an inode from the cache. Requires the write lock (passed as
    /// `state`) and takes the inode mutex.
    pub fn remove_inode(state: &mut SbState, inode: &Arc<Inode>) {
        inode.inner.lock().valid = false;
        let _ = state.inodes.remove(&inode.ino);
    }

    /// Eviction protocol, run by `RcInode` when the last holder drops.
    pub(super) fn inode_released(inode: &Arc<Inode>) {
        let sb = inode.sb.clone();
        let finalize = {
            let mut st = sb.state.write();
            // A concurrent `get_inode_cached` may have resurrected it.
            if inode.ref_count.load(Ordering::Acquire) > 0 {
                return;
            }
            let evict = {
                let inner = inode.inner.lock();
                inner.valid && (inner.nlink == 0 || !sb.backendless || st.detached)
            };
            if evict {
                Superblock::remove_inode(&mut st, inode);
            }
            st.detached && Self::drained(&st)
        };
        if finalize {
            Self::finalize(&sb);
        }
    }

    /// True when nothing but an unreferenced root remains cached.
    pub(super) fn drained(st: &SbState) -> bool {
        st.inodes.values().all(|ip| {
            st.root.as_ref().map_or(false, |r| Arc::ptr_eq(ip, r))
                && ip.ref_count.load(Ordering::Acquire) == 0
        })
    }

    /// Destroys a detached superblock: drops the cache and the root (which
    /// cascades into the driver payloads) and lets the driver release its
    /// private state.
    pub(super) fn finalize(sb: &Arc<Superblock>) {
        let (root, mountpoint) = {
            let mut st = sb.state.write();
            st.inodes.clear();
            st.initialized = false;
            (st.root.take(), st.mountpoint.take())
        };
        // Holders of these re-enter superblock locks on drop; release them
        // outside ours.
        drop(root);
        drop(mountpoint);
        sb.fstype.free(sb);
    }
}
