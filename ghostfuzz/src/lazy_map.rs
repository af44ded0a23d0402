//! Maps memory on demand at the address an execution faulted on.

use std::fmt;
use std::io;
use std::ptr;

use slog::{Logger, debug, warn};

use crate::constants::{PAGES_PER_FAULT, USER_SPACE_LIMIT};
use crate::memory::{map_fixed_noreplace, page_align_down, page_size, unmap};
use crate::region::{MappedRegion, RegionTracker, Tracked};

/// Why a faulting address could not be backed with memory.
#[derive(Debug)]
pub enum MapError {
    /// The fault carried no address.
    NullAddress,
    /// The fault hit the first page of the address space.
    LowPage { addr: usize },
    /// The fault hit the kernel half of the address space.
    Restricted { addr: usize },
    /// mmap refused the request.
    Os { base: usize, source: io::Error },
    /// The kernel placed the mapping somewhere else.
    Displaced { requested: usize, actual: usize },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NullAddress => write!(f, "fault at the null address"),
            MapError::LowPage { addr } => write!(f, "fault at {addr:#x} in the first page"),
            MapError::Restricted { addr } => write!(f, "fault at {addr:#x} in the restricted area"),
            MapError::Os { base, source } => write!(f, "mmap at {base:#x} failed: {source}"),
            MapError::Displaced { requested, actual } => {
                write!(f, "mmap at {requested:#x} landed at {actual:#x}")
            }
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Backs the page containing `fault_addr` and the one after it with fresh
/// memory filled with `fill`, and records the mapping in `tracker`.
///
/// A fault inside a region that is already tracked by base is a no-op.
pub fn map_fault(
    fault_addr: usize,
    fill: u8,
    tracker: &mut RegionTracker,
    logger: &Logger,
) -> Result<Tracked, MapError> {
    if fault_addr == 0 {
        return Err(MapError::NullAddress);
    }
    let base = page_align_down(fault_addr);
    if base < page_size() {
        return Err(MapError::LowPage { addr: fault_addr });
    }
    if base >= USER_SPACE_LIMIT {
        return Err(MapError::Restricted { addr: fault_addr });
    }
    if tracker.exists(base) {
        return Ok(Tracked::Duplicate);
    }

    let len = PAGES_PER_FAULT * page_size();
    let actual = map_fixed_noreplace(base, len).map_err(|source| MapError::Os { base, source })?;
    if actual != base {
        release_displaced(actual, len, logger);
        return Err(MapError::Displaced {
            requested: base,
            actual,
        });
    }
    // SAFETY: [base, base + len) was mapped read/write above.
    unsafe { ptr::write_bytes(base as *mut u8, fill, len) };
    debug!(logger, "mapped region"; "base" => format!("{base:#x}"), "len" => len, "fill" => format!("{fill:#04x}"));

    Ok(tracker.add(MappedRegion { base, len }, logger))
}

/// Gives back a mapping the kernel placed away from the requested address.
fn release_displaced(actual: usize, len: usize, logger: &Logger) {
    // SAFETY: the mapping was just created and nothing refers to it.
    if let Err(err) = unsafe { unmap(actual, len) } {
        warn!(logger, "munmap of displaced mapping failed"; "base" => format!("{actual:#x}"), "error" => %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn maps_two_filled_pages_at_the_fault() {
        let log = logger();
        let mut tracker = RegionTracker::with_capacity(8).unwrap();
        let addr = 0x6200_0000_0123;
        assert_matches!(map_fault(addr, 0xFF, &mut tracker, &log), Ok(Tracked::Added));

        let region = tracker.regions()[0];
        assert_eq!(region.base, page_align_down(addr));
        assert_eq!(region.len, 2 * page_size());
        let bytes = unsafe { std::slice::from_raw_parts(region.base as *const u8, region.len) };
        assert!(bytes.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn remapping_the_same_fault_is_a_no_op() {
        let log = logger();
        let mut tracker = RegionTracker::with_capacity(8).unwrap();
        let addr = 0x6210_0000_0040;
        map_fault(addr, 0, &mut tracker, &log).unwrap();
        assert_matches!(map_fault(addr + 8, 0, &mut tracker, &log), Ok(Tracked::Duplicate));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let log = logger();
        let mut tracker = RegionTracker::with_capacity(8).unwrap();
        assert_matches!(map_fault(0, 0, &mut tracker, &log), Err(MapError::NullAddress));
        assert_matches!(map_fault(0x10, 0, &mut tracker, &log), Err(MapError::LowPage { addr: 0x10 }));
        assert_matches!(
            map_fault(0xffff_ffc0_0000_0000, 0, &mut tracker, &log),
            Err(MapError::Restricted { .. })
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn occupied_addresses_are_refused() {
        let log = logger();
        let mut tracker = RegionTracker::with_capacity(8).unwrap();
        let local = 0u64;
        let addr = &local as *const u64 as usize;
        assert_matches!(
            map_fault(addr, 0, &mut tracker, &log),
            Err(MapError::Os { .. } | MapError::Displaced { .. })
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn full_table_still_maps() {
        let log = logger();
        let mut tracker = RegionTracker::with_capacity(0).unwrap();
        let addr = 0x6220_0000_0000;
        assert_matches!(map_fault(addr, 0xFF, &mut tracker, &log), Ok(Tracked::Overflow));
        assert_eq!(unsafe { *(addr as *const u8) }, 0xFF);
        assert_eq!(tracker.overflowed(), 1);
    }

    #[test]
    fn failed_release_of_a_displaced_mapping_is_logged() {
        let buffer = crate::log::LogBuffer::new(1024);
        let log = crate::log::build_logger(&buffer, false);
        release_displaced(0x6250_0000_0001, 2 * page_size(), &log);
        let text = buffer.take();
        assert!(text.starts_with("munmap of displaced mapping failed base=0x625000000001"), "{text}");
    }
}
