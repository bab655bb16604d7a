//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and file contents. Allocates groups of `2^order`
//! contiguous frames.
//!
//! The allocator owns a dense descriptor table covering everything from the
//! kernel base to the end of DRAM. Free groups sit in one buddy pool per
//! order; recently freed small groups sit in per-CPU caches. Coalescing is
//! lazy: a group detached for merging is marked `Merging`, which tells
//! every concurrent peer to treat it as unavailable.
//!
//! Lock order: a pool lock is held only long enough to pop, push, or detach
//! one head; page meta locks nest inside pool locks; pool locks are taken
//! in ascending order when more than one is needed (statistics snapshot).

use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::addr::{max_aligned_order, pgrounddown, pgroundup, PAddr};
use crate::error::{Error, Result};
use crate::hal;
use crate::param::{MAX_ORDER, NCPU, PGSHIFT, PGSIZE, SMALL_MAX};
use crate::platform::PlatformInfo;

mod cache;
mod page;
mod pool;

pub use self::page::{AllocFlags, BuddyState, PageFlags};

use self::cache::CpuCache;
use self::page::{BuddyMeta, PageKind, PageTable};
use self::pool::BuddyPool;

pub struct Kmem {
    table: PageTable,
    pools: [Mutex<BuddyPool>; MAX_ORDER + 1],
    caches: [CpuCache; NCPU],
    /// First frame the pools may hand out.
    managed_start: usize,
    managed_end: usize,
}

impl Kmem {
    /// Builds the descriptor table and fills the pools from the platform
    /// memory map.
    ///
    /// Frames of the kernel image (which includes the early-allocator
    /// carve-out), the firmware-reserved ranges and the ramdisk are
    /// permanently locked. Everything else between the end of the kernel
    /// image and the end of DRAM enters the pools as maximal aligned
    /// groups.
    pub fn new(platform: &PlatformInfo) -> Kmem {
        let base = pgrounddown(platform.kernel.start);
        let end = pgrounddown(platform.dram.end);
        let managed_start = pgroundup(platform.kernel.end);
        assert!(managed_start <= end, "kalloc: no managed memory");

        let table = PageTable::new(base, end);
        let kmem = Kmem {
            table,
            pools: array_macro::array![_ => Mutex::new(BuddyPool::new()); MAX_ORDER + 1],
            caches: array_macro::array![_ => CpuCache::new(); NCPU],
            managed_start,
            managed_end: end,
        };

        // Everything below the managed range is the kernel's own.
        for pa in num_iter::range_step(base, managed_start, PGSIZE) {
            kmem.lock_frame(PAddr::new(pa));
        }
        for range in platform.locked_ranges() {
            let lo = pgrounddown(range.start).max(base);
            let hi = pgroundup(range.end).min(end);
            for pa in num_iter::range_step(lo, hi, PGSIZE) {
                kmem.lock_frame(PAddr::new(pa));
            }
        }

        kmem.release_unlocked();
        kmem
    }

    fn lock_frame(&self, pa: PAddr) {
        let idx = self.table.index(pa);
        let mut meta = self.table.meta(idx);
        if !meta.flags.contains(PageFlags::LOCKED) {
            meta.flags.insert(PageFlags::LOCKED);
            meta.kind = PageKind::Owned;
            self.table.desc(idx).ref_count.store(1, Ordering::Relaxed);
        }
    }

    /// Pushes every unlocked managed frame into the pools, as the largest
    /// aligned groups that fit between locked frames.
    fn release_unlocked(&self) {
        let start = self.table.index(PAddr::new(self.managed_start));
        let end = self.table.index(PAddr::new(self.managed_end - PGSIZE)) + 1;
        let mut idx = start;
        while idx < end {
            if self.table.meta(idx).flags.contains(PageFlags::LOCKED) {
                idx += 1;
                continue;
            }
            let align = max_aligned_order((idx as usize) << PGSHIFT, MAX_ORDER);
            let mut order = align.min(log2_floor((end - idx) as usize));
            // Shrink until the whole group is unlocked.
            'fit: loop {
                for i in idx..idx + (1u32 << order) {
                    if self.table.meta(i).flags.contains(PageFlags::LOCKED) {
                        debug_assert!(order > 0 || i == idx);
                        order -= 1;
                        continue 'fit;
                    }
                }
                break;
            }
            self.commit_free(idx, order);
            idx += 1 << order;
        }
    }

    /// Number of frames in the managed range.
    pub fn managed_frames(&self) -> usize {
        (self.managed_end - self.managed_start) >> PGSHIFT
    }

    /// Allocates a group of `2^order` contiguous frames. The head comes
    /// back with `ref_count = 1`. Never blocks; `None` means exhaustion.
    pub fn alloc(&self, order: usize, flags: AllocFlags) -> Option<PAddr> {
        if order > MAX_ORDER {
            return None;
        }

        // Hot path: this CPU freed one recently.
        if order <= SMALL_MAX {
            if let Some(idx) = self.caches[hal::cpu_id()].pop(order) {
                return Some(self.init_group(idx, order, flags));
            }
        }

        if let Some(idx) = self.pools[order].lock().pop(&self.table) {
            return Some(self.init_group(idx, order, flags));
        }

        // Scan upward and split down. Each pool lock is released before the
        // next one is taken; the popped group is private while `Merging`.
        for k in order + 1..=MAX_ORDER {
            let popped = self.pools[k].lock().pop(&self.table);
            if let Some(idx) = popped {
                let mut cur = k;
                while cur > order {
                    cur -= 1;
                    let upper = idx + (1u32 << cur);
                    self.commit_free(upper, cur);
                }
                return Some(self.init_group(idx, order, flags));
            }
        }
        None
    }

    /// Returns a group to the allocator.
    ///
    /// Every descriptor of the group must be freeable: not `LOCKED`,
    /// `ref_count <= 1`, and currently owned outside the allocator.
    /// Anything else is a caller bug and panics.
    pub fn free(&self, pa: PAddr, order: usize) {
        assert!(order <= MAX_ORDER, "kfree: bad order");
        assert!(self.table.contains(pa), "kfree: out of range");
        let idx = self.table.index(pa);
        assert_eq!(idx as usize % (1 << order), 0, "kfree: misaligned group");

        for i in idx..idx + (1u32 << order) {
            let meta = self.table.meta(i);
            assert!(!meta.flags.contains(PageFlags::LOCKED), "kfree: locked frame");
            match meta.kind {
                PageKind::Owned => {}
                PageKind::Buddy(_) => panic!("kfree: double free"),
            }
            let rc = self.table.desc(i).ref_count.load(Ordering::Acquire);
            assert!(rc <= 1, "kfree: frame still referenced");
            self.table.desc(i).ref_count.store(0, Ordering::Release);
        }

        if order <= SMALL_MAX {
            match self.caches[hal::cpu_id()].put(&self.table, order, idx) {
                Ok(()) => return,
                Err(_) => {} // cache full; coalesce instead
            }
        }

        self.merge_and_insert(idx, order);
    }

    /// The merge loop. `idx` heads a detached group of `order`; climbs as
    /// long as the buddy is a free head of equal order, then commits.
    fn merge_and_insert(&self, mut idx: u32, mut order: usize) {
        self.table.meta(idx).kind =
            PageKind::Buddy(BuddyMeta::new(order, BuddyState::Merging, idx));

        loop {
            if order == MAX_ORDER {
                break;
            }
            let buddy = match self.table.buddy_of(idx, order) {
                Some(b) => b,
                None => break,
            };

            let mut pool = self.pools[order].lock();
            // The probe and the detach happen under the pool lock; a buddy
            // that is `Merging` or `Cached` belongs to somebody else.
            let mergeable = {
                let meta = self.table.meta(buddy);
                match meta.kind {
                    PageKind::Buddy(ref b) => b.order == order && b.is_free_head(buddy),
                    PageKind::Owned => false,
                }
            };
            if !mergeable {
                break;
            }
            pool.detach(&self.table, buddy);
            drop(pool);

            // New head is the lower of the pair.
            idx = idx.min(buddy);
            order += 1;
            self.table.meta(idx).kind =
                PageKind::Buddy(BuddyMeta::new(order, BuddyState::Merging, idx));
        }

        self.commit_free(idx, order);
    }

    /// Commits a detached group as a free group of `order`: writes the tail
    /// descriptors outside any pool lock, then links the head.
    fn commit_free(&self, idx: u32, order: usize) {
        for i in idx + 1..idx + (1u32 << order) {
            let mut meta = self.table.meta(i);
            meta.kind = PageKind::Buddy(BuddyMeta::new(order, BuddyState::Free, idx));
        }
        {
            let mut meta = self.table.meta(idx);
            meta.kind = PageKind::Buddy(BuddyMeta::new(order, BuddyState::Merging, idx));
        }
        self.pools[order].lock().push(&self.table, idx);
    }

    /// Turns a detached or cached group into a live allocation.
    fn init_group(&self, idx: u32, order: usize, flags: AllocFlags) -> PAddr {
        for i in idx..idx + (1u32 << order) {
            let mut meta = self.table.meta(i);
            meta.kind = PageKind::Owned;
            self.table
                .desc(i)
                .ref_count
                .store((i == idx) as u32, Ordering::Release);
        }
        let pa = self.table.paddr(idx);
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the group was just detached from the pools, so this
            // thread is its only owner.
            unsafe { core::ptr::write_bytes(pa.into_usize() as *mut u8, 0, PGSIZE << order) };
        }
        pa
    }

    /// Bumps the head's reference count without the page lock.
    pub fn ref_inc(&self, pa: PAddr) -> u32 {
        let idx = self.table.index(pa);
        let old = self.table.desc(idx).ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old >= 1, "ref_inc on free page");
        old + 1
    }

    /// Drops one reference without the page lock. The caller must know a
    /// second reference exists; the count never reaches zero this way.
    pub fn ref_dec(&self, pa: PAddr) -> Result<u32> {
        let idx = self.table.index(pa);
        self.table
            .desc(idx)
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v >= 2 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .map(|v| v - 1)
            .map_err(|_| Error::Inval)
    }

    /// Locked decrement; may take the count to zero, at which point the
    /// caller owns the group again and frees it.
    pub fn ref_dec_locked(&self, pa: PAddr) -> u32 {
        let idx = self.table.index(pa);
        let _meta = self.table.meta(idx);
        let old = self.table.desc(idx).ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old >= 1, "ref_dec on free page");
        old - 1
    }

    /// Current reference count of the group headed at `pa`.
    pub fn ref_count(&self, pa: PAddr) -> u32 {
        let idx = self.table.index(pa);
        self.table.desc(idx).ref_count.load(Ordering::Acquire)
    }

    /// Snapshot of the per-order free-group counts, taken with every pool
    /// lock held (ascending) so the counts are mutually consistent.
    pub fn stat(&self, out: &mut [usize; MAX_ORDER + 1]) {
        let guards: alloc::vec::Vec<_> = self.pools.iter().map(|p| p.lock()).collect();
        for (slot, pool) in out.iter_mut().zip(guards.iter()) {
            *slot = pool.count();
        }
    }

    /// Borrows the contents of a frame group the caller owns.
    ///
    /// # Safety
    ///
    /// `pa` must head a live group of at least `2^order` frames allocated
    /// from this allocator, and the caller must be its unique accessor for
    /// the duration of the borrow.
    pub unsafe fn page_slice_mut(&self, pa: PAddr, order: usize) -> &mut [u8] {
        debug_assert!(self.table.contains(pa));
        unsafe { core::slice::from_raw_parts_mut(pa.into_usize() as *mut u8, PGSIZE << order) }
    }

    /// Walks every pool and checks the list invariants. Test support.
    #[cfg(test)]
    pub fn check_pools(&self) {
        for (order, pool) in self.pools.iter().enumerate() {
            pool.lock().check(&self.table, order);
        }
    }

    /// Heads currently linked in one pool, for tests.
    #[cfg(test)]
    pub fn pool_heads(&self, order: usize) -> alloc::vec::Vec<PAddr> {
        let mut out = alloc::vec::Vec::new();
        let _pool = self.pools[order].lock();
        // Walk via the descriptor links; the pool lock keeps them still.
        let mut idx = {
            // `BuddyPool` exposes no head pointer; recover it by scanning.
            let mut found = page::NIL;
            for i in 0..self.table.len() as u32 {
                let meta = self.table.meta(i);
                if let PageKind::Buddy(ref b) = meta.kind {
                    if b.order == order && b.is_free_head(i) && b.prev == page::NIL {
                        found = i;
                        break;
                    }
                }
            }
            found
        };
        while idx != page::NIL {
            out.push(self.table.paddr(idx));
            let meta = self.table.meta(idx);
            idx = meta.buddy().next;
        }
        out
    }
}

const fn log2_floor(x: usize) -> usize {
    (usize::BITS - 1 - x.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PhysRange;

    /// A map whose managed range never gets dereferenced: buddy state
    /// machine only, no `AllocFlags::ZERO`.
    fn fake_kmem(managed_pages: usize) -> Kmem {
        let base = 0x8000_0000;
        let kernel_end = 0x8004_0000;
        let dram_end = kernel_end + managed_pages * PGSIZE;
        let platform = PlatformInfo::new(
            PhysRange::new(base, dram_end),
            PhysRange::new(base, kernel_end),
        );
        Kmem::new(&platform)
    }

    #[test]
    fn split_cascade() {
        // One order-4 group at 0x80040000 and nothing else.
        let kmem = fake_kmem(16);
        let mut counts = [0; MAX_ORDER + 1];
        kmem.stat(&mut counts);
        assert_eq!(counts[4], 1);
        assert_eq!(counts.iter().sum::<usize>(), 1);

        let pa = kmem.alloc(2, AllocFlags::empty()).unwrap();
        assert_eq!(pa, PAddr::new(0x8004_0000));
        assert_eq!(kmem.ref_count(pa), 1);

        // The upper halves were committed on the way down.
        assert_eq!(kmem.pool_heads(2), [PAddr::new(0x8004_4000)]);
        assert_eq!(kmem.pool_heads(3), [PAddr::new(0x8004_8000)]);
        kmem.stat(&mut counts);
        assert_eq!((counts[2], counts[3], counts[4]), (1, 1, 0));
        kmem.check_pools();
    }

    #[test]
    fn merge_cascade() {
        let kmem = fake_kmem(16);
        let pa = kmem.alloc(2, AllocFlags::empty()).unwrap();
        kmem.free(pa, 2);

        // 2 -> 3 -> 4: back to a single order-4 group.
        let mut counts = [0; MAX_ORDER + 1];
        kmem.stat(&mut counts);
        assert_eq!(counts[4], 1);
        assert_eq!(counts.iter().sum::<usize>(), 1);
        assert_eq!(kmem.pool_heads(4), [PAddr::new(0x8004_0000)]);
        kmem.check_pools();
    }

    #[test]
    fn alloc_free_restores_counts() {
        let kmem = fake_kmem(256);
        let mut before = [0; MAX_ORDER + 1];
        kmem.stat(&mut before);

        // Above SMALL_MAX the caches never interfere.
        let pa = kmem.alloc(5, AllocFlags::empty()).unwrap();
        kmem.free(pa, 5);

        let mut after = [0; MAX_ORDER + 1];
        kmem.stat(&mut after);
        assert_eq!(before, after);
        kmem.check_pools();
    }

    #[test]
    fn small_frees_hit_the_cache() {
        let kmem = fake_kmem(64);
        let a = kmem.alloc(0, AllocFlags::empty()).unwrap();
        kmem.free(a, 0);
        // Cached, not pooled: the same frame comes straight back.
        let b = kmem.alloc(0, AllocFlags::empty()).unwrap();
        assert_eq!(a, b);
        kmem.free(b, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let kmem = fake_kmem(16);
        let pa = kmem.alloc(4, AllocFlags::empty()).unwrap();
        assert_eq!(kmem.alloc(0, AllocFlags::empty()), None);
        kmem.free(pa, 4);
        assert!(kmem.alloc(0, AllocFlags::empty()).is_some());
    }

    #[test]
    fn refcounts() {
        let kmem = fake_kmem(16);
        let pa = kmem.alloc(0, AllocFlags::empty()).unwrap();
        assert_eq!(kmem.ref_inc(pa), 2);
        assert_eq!(kmem.ref_dec(pa), Ok(1));
        // Unlocked decrement refuses to drop the last reference.
        assert_eq!(kmem.ref_dec(pa), Err(Error::Inval));
        assert_eq!(kmem.ref_dec_locked(pa), 0);
        kmem.free(pa, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let kmem = fake_kmem(16);
        // Use an order above SMALL_MAX so the group lands in a pool, where
        // the second free can see it.
        let pa = kmem.alloc(4, AllocFlags::empty()).unwrap();
        kmem.free(pa, 4);
        kmem.free(pa, 4);
    }

    #[test]
    fn reserved_ranges_stay_locked() {
        let base = 0x8000_0000;
        let kernel_end = 0x8004_0000;
        let dram_end = kernel_end + 64 * PGSIZE;
        let mut platform = PlatformInfo::new(
            PhysRange::new(base, dram_end),
            PhysRange::new(base, kernel_end),
        );
        // Poke a hole in the middle of the managed range.
        let hole = PhysRange::new(kernel_end + 8 * PGSIZE, kernel_end + 9 * PGSIZE);
        platform.reserved.push(hole);
        let kmem = Kmem::new(&platform);

        let mut counts = [0; MAX_ORDER + 1];
        kmem.stat(&mut counts);
        let free_pages: usize = counts
            .iter()
            .enumerate()
            .map(|(k, n)| n << k)
            .sum();
        assert_eq!(free_pages, 63);
        kmem.check_pools();

        // Drain everything; the locked frame never shows up.
        while let Some(pa) = kmem.alloc(0, AllocFlags::empty()) {
            assert!(!hole.contains(pa));
        }
    }
}
