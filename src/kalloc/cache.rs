//! Per-CPU hot caches.
//!
//! Each CPU keeps a bounded stack of recently freed group heads per small
//! order. The order-0 cache is the large one (hot pages); it is touched
//! with interrupts pushed off, so its lock is uncontended on its own CPU
//! and exists to leave cross-CPU stealing possible. A cached head is
//! `Cached` and linked into no pool.

use arrayvec::ArrayVec;
use spin::Mutex;

use super::page::{BuddyMeta, BuddyState, PageKind, PageTable};
use crate::hal;
use crate::param::{HOT_CACHE_CAP, SMALL_CACHE_CAP, SMALL_MAX};

pub struct CpuCache {
    hot: Mutex<ArrayVec<u32, HOT_CACHE_CAP>>,
    small: [Mutex<ArrayVec<u32, SMALL_CACHE_CAP>>; SMALL_MAX],
}

impl CpuCache {
    pub fn new() -> Self {
        Self {
            hot: Mutex::new(ArrayVec::new()),
            small: array_macro::array![_ => Mutex::new(ArrayVec::new()); SMALL_MAX],
        }
    }

    /// Takes a cached group head of `order`, if one is available.
    pub fn pop(&self, order: usize) -> Option<u32> {
        debug_assert!(order <= SMALL_MAX);
        if order == 0 {
            let _intr = hal::push_off();
            self.hot.lock().pop()
        } else {
            self.small[order - 1].lock().pop()
        }
    }

    /// Caches a freed group head. Fails when the cache is at capacity, in
    /// which case the caller sends the group to the buddy layer instead.
    pub fn put(&self, table: &PageTable, order: usize, idx: u32) -> Result<(), u32> {
        debug_assert!(order <= SMALL_MAX);
        let pushed = if order == 0 {
            let _intr = hal::push_off();
            self.hot.lock().try_push(idx).is_ok()
        } else {
            self.small[order - 1].lock().try_push(idx).is_ok()
        };
        if pushed {
            // Committed after the push: until the head is marked `Cached`
            // nobody else can see it anyway, since it is detached.
            let mut meta = table.meta(idx);
            meta.kind = PageKind::Buddy(BuddyMeta::new(order, BuddyState::Cached, idx));
            Ok(())
        } else {
            Err(idx)
        }
    }
}
