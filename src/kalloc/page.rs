//! Page descriptors.
//!
//! One descriptor exists for every frame from the kernel base to the end of
//! DRAM. Descriptors of frames the buddy layer manages carry the group
//! metadata; descriptors of live or pinned frames carry none. The free-list
//! links are frame indices into the descriptor table, never pointers, so a
//! tail descriptor's `head` field is a lookup key and not ownership.

use core::sync::atomic::AtomicU32;

use spin::{Mutex, MutexGuard};

use crate::addr::PAddr;
use crate::param::{PGSHIFT, PGSIZE};

/// Sentinel index for "no frame".
pub const NIL: u32 = u32::MAX;

bitflags::bitflags! {
    /// Per-frame flag bits.
    pub struct PageFlags: u32 {
        /// Never enters the pools: kernel image, descriptor area,
        /// firmware-reserved ranges, ramdisk.
        const LOCKED = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Caller flags for `Kmem::alloc`.
    pub struct AllocFlags: u32 {
        /// Zero-fill the frames before returning them.
        const ZERO = 1 << 0;
    }
}

/// Where an allocator-owned group currently lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BuddyState {
    /// Head is linked into a buddy pool.
    Free,
    /// Detached, between pools; unavailable to peers.
    Merging,
    /// Head is held by a per-CPU cache.
    Cached,
}

/// Buddy-layer metadata of a frame.
#[derive(Copy, Clone, Debug)]
pub struct BuddyMeta {
    /// Order of the group this frame belongs to.
    pub order: usize,
    pub state: BuddyState,
    /// Index of the group head; equals the frame's own index on heads.
    pub head: u32,
    /// Free-list links, `NIL` when detached.
    pub prev: u32,
    pub next: u32,
}

impl BuddyMeta {
    pub fn new(order: usize, state: BuddyState, head: u32) -> Self {
        Self {
            order,
            state,
            head,
            prev: NIL,
            next: NIL,
        }
    }

    pub fn is_free_head(&self, idx: u32) -> bool {
        self.state == BuddyState::Free && self.head == idx
    }
}

/// Typed payload of a frame.
#[derive(Copy, Clone, Debug)]
pub enum PageKind {
    /// Owned outside the allocator: live, or permanently locked.
    Owned,
    /// Managed by the buddy layer.
    Buddy(BuddyMeta),
}

pub struct PageMeta {
    pub flags: PageFlags,
    pub kind: PageKind,
}

impl PageMeta {
    pub fn buddy(&self) -> &BuddyMeta {
        match &self.kind {
            PageKind::Buddy(b) => b,
            PageKind::Owned => panic!("page: not buddy-managed"),
        }
    }

    pub fn buddy_mut(&mut self) -> &mut BuddyMeta {
        match &mut self.kind {
            PageKind::Buddy(b) => b,
            PageKind::Owned => panic!("page: not buddy-managed"),
        }
    }
}

/// One frame's descriptor.
///
/// `ref_count` sits outside the meta lock so that the unlocked reference
/// operations can use plain atomics; the locked variants take `meta` first
/// and then use the same atomic.
pub struct PageDescriptor {
    pub ref_count: AtomicU32,
    pub meta: Mutex<PageMeta>,
}

impl PageDescriptor {
    fn new() -> Self {
        Self {
            ref_count: AtomicU32::new(0),
            meta: Mutex::new(PageMeta {
                flags: PageFlags::empty(),
                kind: PageKind::Owned,
            }),
        }
    }
}

/// The dense descriptor array plus the arithmetic that indexes it.
///
/// `frame ↔ physical address` is pure arithmetic relative to `base`:
/// `idx = (pa - base) >> PGSHIFT`.
pub struct PageTable {
    base: usize,
    descs: alloc::boxed::Box<[PageDescriptor]>,
}

impl PageTable {
    /// Builds descriptors for every frame in `[base, end)`.
    pub fn new(base: usize, end: usize) -> Self {
        debug_assert!(base % PGSIZE == 0 && end % PGSIZE == 0 && base < end);
        let nframes = (end - base) >> PGSHIFT;
        let mut descs = alloc::vec::Vec::with_capacity(nframes);
        descs.resize_with(nframes, PageDescriptor::new);
        Self {
            base,
            descs: descs.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn contains(&self, pa: PAddr) -> bool {
        let a = pa.into_usize();
        pa.is_page_aligned() && a >= self.base && ((a - self.base) >> PGSHIFT) < self.descs.len()
    }

    pub fn index(&self, pa: PAddr) -> u32 {
        debug_assert!(self.contains(pa), "page index out of range: {:?}", pa);
        ((pa.into_usize() - self.base) >> PGSHIFT) as u32
    }

    pub fn paddr(&self, idx: u32) -> PAddr {
        debug_assert!((idx as usize) < self.descs.len());
        PAddr::new(self.base).add_pages(idx as usize)
    }

    pub fn desc(&self, idx: u32) -> &PageDescriptor {
        &self.descs[idx as usize]
    }

    /// Locks one frame's metadata. Nests inside pool locks, never outside.
    pub fn meta(&self, idx: u32) -> MutexGuard<'_, PageMeta> {
        self.descs[idx as usize].meta.lock()
    }

    /// Index of the buddy of the order-`order` group headed at `idx`.
    ///
    /// Equivalent to `phys XOR (PGSIZE << order)` relative to `base`.
    pub fn buddy_of(&self, idx: u32, order: usize) -> Option<u32> {
        let b = idx ^ (1u32 << order);
        if (b as usize) + (1 << order) <= self.descs.len() {
            Some(b)
        } else {
            None
        }
    }
}
