//! Per-process file descriptor tables.
//!
//! A table is a fixed array of slots. An open slot holds the file; a free
//! slot holds the index of the next free slot, forming an intrusive free
//! list through the array so allocation is O(1). Frees reinsert in
//! ascending order, which keeps allocation returning the lowest free
//! descriptor.
//!
//! Tables are per-process; the process table's own discipline is the only
//! serialization they need.

use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::file::File;
use crate::param::NOFILE;

enum FdSlot {
    Open(Arc<File>),
    /// Next free slot index; `None` ends the list.
    Free { next: Option<usize> },
}

pub struct FdTable {
    slots: [FdSlot; NOFILE],
    /// Head of the free list; `None` when the table is full.
    next_fd: Option<usize>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: array_macro::array![i => FdSlot::Free {
                next: if i + 1 < NOFILE { Some(i + 1) } else { None },
            }; NOFILE],
            next_fd: Some(0),
        }
    }

    /// Installs `file` in the lowest free slot.
    pub fn alloc_fd(&mut self, file: Arc<File>) -> Result<usize> {
        let fd = self.next_fd.ok_or(Error::TooMany)?;
        self.next_fd = match &self.slots[fd] {
            FdSlot::Free { next } => *next,
            FdSlot::Open(_) => panic!("fd table: free list hits open slot"),
        };
        self.slots[fd] = FdSlot::Open(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Result<&Arc<File>> {
        match self.slots.get(fd) {
            Some(FdSlot::Open(file)) => Ok(file),
            _ => Err(Error::Inval),
        }
    }

    /// Closes `fd`, reinserting the slot in ascending free-list order.
    pub fn dealloc_fd(&mut self, fd: usize) -> Result<Arc<File>> {
        if fd >= NOFILE {
            return Err(Error::Inval);
        }
        let file = match core::mem::replace(&mut self.slots[fd], FdSlot::Free { next: None }) {
            FdSlot::Open(file) => file,
            free @ FdSlot::Free { .. } => {
                self.slots[fd] = free;
                return Err(Error::Inval);
            }
        };

        match self.next_fd {
            Some(head) if head < fd => {
                // Walk to the last free slot below fd and splice in.
                let mut cur = head;
                loop {
                    let next = match &self.slots[cur] {
                        FdSlot::Free { next } => *next,
                        FdSlot::Open(_) => panic!("fd table: free list hits open slot"),
                    };
                    match next {
                        Some(n) if n < fd => cur = n,
                        _ => break,
                    }
                }
                let after = match &self.slots[cur] {
                    FdSlot::Free { next } => *next,
                    FdSlot::Open(_) => unreachable!(),
                };
                self.slots[fd] = FdSlot::Free { next: after };
                self.slots[cur] = FdSlot::Free { next: Some(fd) };
            }
            _ => {
                self.slots[fd] = FdSlot::Free { next: self.next_fd };
                self.next_fd = Some(fd);
            }
        }
        Ok(file)
    }

    /// Duplicates the table for a forked process: every open slot shares
    /// its file, and the free list is rebuilt in one ascending pass.
    pub fn clone_table(&self) -> Self {
        let mut slots = array_macro::array![_ => FdSlot::Free { next: None }; NOFILE];
        for (i, slot) in self.slots.iter().enumerate() {
            if let FdSlot::Open(file) = slot {
                slots[i] = FdSlot::Open(file.clone());
            }
        }

        let mut next_fd = None;
        for i in (0..NOFILE).rev() {
            if let FdSlot::Free { next } = &mut slots[i] {
                *next = next_fd;
                next_fd = Some(i);
            }
        }
        Self { slots, next_fd }
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, FdSlot::Open(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{File, OpenFlags};
    use crate::fs::tmpfs::tests::test_fs;
    use crate::fs::{InodeType, Path};

    fn open_file() -> Arc<File> {
        let (_kmem, _vfs, ctx) = test_fs(64);
        let p = Path::from_str("/f").unwrap();
        let _ = crate::fs::create(&ctx, p, InodeType::File, 0o644).unwrap();
        File::open(&ctx, p, OpenFlags::RDONLY, 0).unwrap()
    }

    #[test]
    fn alloc_returns_lowest_free() {
        let file = open_file();
        let mut t = FdTable::new();
        assert_eq!(t.alloc_fd(file.clone()).unwrap(), 0);
        assert_eq!(t.alloc_fd(file.clone()).unwrap(), 1);
        assert_eq!(t.alloc_fd(file.clone()).unwrap(), 2);

        let _ = t.dealloc_fd(1).unwrap();
        let _ = t.dealloc_fd(0).unwrap();
        // Lowest first, regardless of close order.
        assert_eq!(t.alloc_fd(file.clone()).unwrap(), 0);
        assert_eq!(t.alloc_fd(file.clone()).unwrap(), 1);
        assert_eq!(t.alloc_fd(file).unwrap(), 3);
    }

    #[test]
    fn table_fills_then_frees() {
        let file = open_file();
        let mut t = FdTable::new();
        for i in 0..NOFILE {
            assert_eq!(t.alloc_fd(file.clone()).unwrap(), i);
        }
        assert_eq!(t.alloc_fd(file.clone()).unwrap_err(), Error::TooMany);
        let _ = t.dealloc_fd(7).unwrap();
        assert_eq!(t.alloc_fd(file).unwrap(), 7);
    }

    #[test]
    fn double_close_is_an_error() {
        let file = open_file();
        let mut t = FdTable::new();
        let fd = t.alloc_fd(file).unwrap();
        let _ = t.dealloc_fd(fd).unwrap();
        assert_eq!(t.dealloc_fd(fd).unwrap_err(), Error::Inval);
        assert_eq!(t.dealloc_fd(NOFILE).unwrap_err(), Error::Inval);
        assert_eq!(t.get(fd).unwrap_err(), Error::Inval);
    }

    #[test]
    fn clone_shares_files_and_rebuilds_free_list() {
        let file = open_file();
        let mut t = FdTable::new();
        let _ = t.alloc_fd(file.clone()).unwrap(); // 0
        let _ = t.alloc_fd(file.clone()).unwrap(); // 1
        let _ = t.alloc_fd(file.clone()).unwrap(); // 2
        let _ = t.dealloc_fd(1).unwrap();

        let mut c = t.clone_table();
        assert_eq!(c.open_count(), 2);
        assert!(Arc::ptr_eq(c.get(0).unwrap(), &file));
        // The child's free list starts at the same lowest hole.
        assert_eq!(c.alloc_fd(file.clone()).unwrap(), 1);
        assert_eq!(c.alloc_fd(file).unwrap(), 3);
    }
}
