//! Boot-time memory map.
//!
//! The FDT parser runs before the allocator comes up and leaves behind this
//! resolved description of the machine. The parser itself lives elsewhere;
//! only its output contract matters here.

use arrayvec::ArrayVec;

use crate::addr::PAddr;
use crate::param::NRESERVED;

/// A half-open physical range `[start, end)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PhysRange {
    pub start: usize,
    pub end: usize,
}

impl PhysRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, pa: PAddr) -> bool {
        let a = pa.into_usize();
        self.start <= a && a < self.end
    }

    pub fn overlaps(&self, other: &PhysRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// What the allocator needs to know about the machine.
///
/// `reserved` holds every `reserved-memory` range the FDT declares. Nodes
/// whose unit address was not numeric are keyed in the parser by a hash of
/// the address string; collisions within one parent are improbable but
/// possible, so exact-match lookup of such a node by address is unreliable.
/// The ranges below are therefore treated only as opaque spans to keep out
/// of the pools, never as a lookup structure.
pub struct PlatformInfo {
    /// All of DRAM.
    pub dram: PhysRange,
    /// The loaded kernel image, including the early-allocator carve-out.
    pub kernel: PhysRange,
    /// FDT `reserved-memory` ranges.
    pub reserved: ArrayVec<PhysRange, NRESERVED>,
    /// Loaded initial ramdisk, if any.
    pub ramdisk: Option<PhysRange>,
}

impl PlatformInfo {
    /// A map with nothing reserved beyond the kernel image.
    pub fn new(dram: PhysRange, kernel: PhysRange) -> Self {
        Self {
            dram,
            kernel,
            reserved: ArrayVec::new(),
            ramdisk: None,
        }
    }

    /// Every range the allocator must permanently lock out, kernel image
    /// included.
    pub fn locked_ranges(&self) -> impl Iterator<Item = PhysRange> + '_ {
        core::iter::once(self.kernel)
            .chain(self.reserved.iter().copied())
            .chain(self.ramdisk.iter().copied())
    }
}
