//! The kernel object: every subsystem with global state, built in one
//! documented order.
//!
//! Construction order matters and is fixed here:
//!   1. console sink (optional; printing works without one)
//!   2. platform memory map, handed over by the FDT parser
//!   3. physical page allocator
//!   4. VFS driver registry
//!   5. tmpfs registration and the root mount
//!
//! The boot path installs the one global instance through `init`; tests
//! build private `Kernel` values instead and never touch the global.

use alloc::sync::Arc;

use spin::Once;

use crate::error::Result;
use crate::fs::tmpfs::TmpFsType;
use crate::fs::{FsContext, MountFlags, Vfs};
use crate::kalloc::Kmem;
use crate::platform::PlatformInfo;

pub struct Kernel {
    pub platform: PlatformInfo,
    pub kmem: Arc<Kmem>,
    pub vfs: Vfs,
}

impl Kernel {
    /// Brings up the allocator and filesystem layers over a memory map.
    pub fn new(platform: PlatformInfo) -> Result<Self> {
        let kmem = Arc::new(Kmem::new(&platform));
        let vfs = Vfs::new();
        vfs.register_fs_type(TmpFsType::new(kmem.clone()))?;
        vfs.mount_root("tmpfs", None, MountFlags::empty(), "")?;
        Ok(Self {
            platform,
            kmem,
            vfs,
        })
    }

    /// Resolution context for a new process, rooted at the system root.
    pub fn fs_context(&self) -> Result<FsContext> {
        self.vfs.context()
    }
}

static KERNEL: Once<Kernel> = Once::new();

/// Builds the global kernel. Called once from the boot hart.
pub fn init(platform: PlatformInfo) -> Result<&'static Kernel> {
    if KERNEL.get().is_some() {
        return Err(crate::error::Error::AlreadyInit);
    }
    let kernel = Kernel::new(platform)?;
    Ok(KERNEL.call_once(|| kernel))
}

/// The global kernel; panics before `init`.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel: not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{File, OpenFlags};
    use crate::fs::Path;
    use crate::param::{PGSHIFT, PGSIZE};
    use crate::platform::PhysRange;

    #[test]
    fn boots_over_a_memory_map() {
        let size = 256 << PGSHIFT;
        let layout = core::alloc::Layout::from_size_align(size, PGSIZE).unwrap();
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);
        let platform = PlatformInfo::new(
            PhysRange::new(base, base + size),
            PhysRange::new(base, base),
        );

        let k = Kernel::new(platform).unwrap();
        let ctx = k.fs_context().unwrap();
        let f = File::open(
            &ctx,
            Path::from_str("/hello").unwrap(),
            OpenFlags::CREATE | OpenFlags::RDWR,
            0o644,
        )
        .unwrap();
        f.write(b"boot").unwrap();
        assert_eq!(f.stat().size, 4);
    }
}
