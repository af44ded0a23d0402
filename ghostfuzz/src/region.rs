//! Bookkeeping for the regions mapped lazily while a case runs.

use std::collections::TryReserveError;
use std::ptr;

use slog::{Logger, debug, warn};

use crate::memory::{is_page_aligned, unmap};

/// One lazily created mapping. Always page aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub base: usize,
    pub len: usize,
}

impl MappedRegion {
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.end()).contains(&addr)
    }
}

/// Result of [`RegionTracker::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    Added,
    /// A region with this exact base is already tracked.
    Duplicate,
    /// The table is full; the region is only remembered for release.
    Overflow,
}

/// Owns every lazily mapped region of the current case.
///
/// Regions past the capacity are kept on a separate overflow list: they are
/// released by [`RegionTracker::unmap_all`] but never scanned or refilled.
#[derive(Debug)]
pub struct RegionTracker {
    regions: Vec<MappedRegion>,
    overflow: Vec<MappedRegion>,
    capacity: usize,
}

impl RegionTracker {
    /// Allocates the region table up front; failing here is fatal.
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut regions = Vec::new();
        regions.try_reserve_exact(capacity)?;
        Ok(Self {
            regions,
            overflow: Vec::new(),
            capacity,
        })
    }

    pub fn add(&mut self, region: MappedRegion, logger: &Logger) -> Tracked {
        if self.exists(region.base) {
            return Tracked::Duplicate;
        }
        if self.regions.len() >= self.capacity {
            warn!(logger, "WARNING: region capacity exhausted";
                "base" => format!("{:#x}", region.base), "capacity" => self.capacity);
            self.overflow.push(region);
            return Tracked::Overflow;
        }
        self.regions.push(region);
        Tracked::Added
    }

    /// Exact match on the base address only; overlapping bases are not detected.
    pub fn exists(&self, base: usize) -> bool {
        self.regions.iter().chain(&self.overflow).any(|r| r.base == base)
    }

    /// Releases every mapping and empties the table. Failures are logged and skipped.
    pub fn unmap_all(&mut self, logger: &Logger) {
        for region in self.regions.drain(..).chain(self.overflow.drain(..)) {
            debug!(logger, "munmapping"; "base" => format!("{:#x}", region.base), "len" => region.len);
            if !is_page_aligned(region.base) || !is_page_aligned(region.len) {
                warn!(logger, "munmap of misaligned region";
                    "base" => format!("{:#x}", region.base), "len" => region.len);
            }
            // SAFETY: tracked regions are created by the lazy mapper and only
            // referenced by the (finished) case being torn down.
            if let Err(err) = unsafe { unmap(region.base, region.len) } {
                warn!(logger, "munmap failed"; "base" => format!("{:#x}", region.base), "error" => %err);
            }
        }
    }

    /// Overwrites every tracked region with `byte`.
    pub fn fill_all(&self, byte: u8) {
        for region in &self.regions {
            // SAFETY: tracked regions are live read/write mappings of `len` bytes.
            unsafe { ptr::write_bytes(region.base as *mut u8, byte, region.len) };
        }
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn overflowed(&self) -> usize {
        self.overflow.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for RegionTracker {
    fn drop(&mut self) {
        self.unmap_all(&Logger::root(slog::Discard, slog::o!()));
    }
}
