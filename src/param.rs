/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Hard cap on registered filesystem drivers.
pub const NFSTYPE: usize = 8;

/// Page size in bytes.
pub const PGSIZE: usize = 1 << PGSHIFT;

/// log2 of the page size.
pub const PGSHIFT: usize = 12;

/// Largest buddy order; there are `MAX_ORDER + 1` pools.
pub const MAX_ORDER: usize = 10;

/// Largest order kept in the per-CPU caches.
pub const SMALL_MAX: usize = 3;

/// Per-CPU capacity of the order-0 hot-page cache.
pub const HOT_CACHE_CAP: usize = 32;

/// Per-CPU capacity of each cache for orders `1..=SMALL_MAX`.
pub const SMALL_CACHE_CAP: usize = 8;

/// Direct block pointers per regular file.
pub const NDIRECT: usize = 12;

/// Block pointers per index page.
pub const NINDIRECT: usize = PGSIZE / core::mem::size_of::<u64>();

/// Largest file in pages.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Inline payload bytes carried directly in a tmpfs inode.
pub const EMBEDDED_LEN: usize = 64;

/// Longest directory entry name.
pub const NAME_MAX: usize = 255;

/// Symlink expansions allowed in one resolution.
pub const MAXSYMLINKS: usize = 10;

/// Maximum file path name.
pub const MAXPATH: usize = 512;

/// Upper bound on reserved memory regions taken from the FDT.
pub const NRESERVED: usize = 16;

static_assertions::const_assert!(EMBEDDED_LEN < PGSIZE);
static_assertions::const_assert!(SMALL_MAX < MAX_ORDER);
static_assertions::const_assert_eq!(NINDIRECT * core::mem::size_of::<u64>(), PGSIZE);
