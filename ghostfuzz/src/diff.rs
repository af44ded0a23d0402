//! Compares lazily mapped memory against the fill byte it was seeded with.

use slog::{Logger, debug, info, warn};

use crate::guard::Guard;
use crate::memory::{is_page_aligned, page_size};
use crate::probe::{probe_byte, probe_into};
use crate::region::RegionTracker;

/// One byte that no longer holds the fill value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemDiff {
    pub address: usize,
    pub expected: u8,
    pub observed: u8,
}

#[derive(Debug, Default)]
pub struct DiffEngine {
    diffs: Vec<MemDiff>,
    scratch: Vec<u8>,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans every tracked region for bytes different from `expected`.
    ///
    /// Pages whose first byte cannot be read are skipped; a fault later in a
    /// page ends the scan of that page only. The returned list holds the
    /// findings of this call alone.
    pub fn scan_and_report(
        &mut self,
        guard: &Guard,
        tracker: &RegionTracker,
        expected: u8,
        logger: &Logger,
    ) -> &[MemDiff] {
        self.diffs.clear();
        let page = page_size();
        self.scratch.resize(page - 1, 0);

        for region in tracker.regions() {
            if !is_page_aligned(region.base) || !is_page_aligned(region.len) {
                warn!(logger, "skipping misaligned region";
                    "addr" => format!("{:#x}", region.base), "len" => region.len);
                continue;
            }
            for page_base in (region.base..region.end()).step_by(page) {
                let Some(first) = probe_byte(guard, page_base) else {
                    debug!(logger, "skipping unreadable page"; "addr" => format!("{page_base:#x}"));
                    continue;
                };
                self.record(page_base, expected, first);

                let read = probe_into(guard, page_base + 1, &mut self.scratch);
                for offset in 0..read {
                    let observed = self.scratch[offset];
                    self.record(page_base + 1 + offset, expected, observed);
                }
                if read < self.scratch.len() {
                    debug!(logger, "page scan truncated by fault";
                        "addr" => format!("{:#x}", page_base + 1 + read));
                }
            }
        }

        for diff in &self.diffs {
            info!(logger, "CHG:";
                "addr" => format!("{:#x}", diff.address),
                "old" => format!("{:#04x}", diff.expected),
                "new" => format!("{:#04x}", diff.observed));
        }
        &self.diffs
    }

    pub fn diffs(&self) -> &[MemDiff] {
        &self.diffs
    }

    fn record(&mut self, address: usize, expected: u8, observed: u8) {
        if observed != expected {
            self.diffs.push(MemDiff {
                address,
                expected,
                observed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy_map::map_fault;
    use crate::region::MappedRegion;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn reports_changed_bytes_only() {
        let log = logger();
        let guard = Guard::install().unwrap();
        let mut tracker = RegionTracker::with_capacity(4).unwrap();
        let base = 0x6300_0000_0000;
        map_fault(base, 0x00, &mut tracker, &log).unwrap();
        unsafe {
            *((base + 5) as *mut u8) = 0x42;
            *((base + page_size()) as *mut u8) = 0x01;
        }

        let mut engine = DiffEngine::new();
        let diffs = engine.scan_and_report(&guard, &tracker, 0x00, &log).to_vec();
        assert_eq!(
            diffs,
            vec![
                MemDiff { address: base + 5, expected: 0, observed: 0x42 },
                MemDiff { address: base + page_size(), expected: 0, observed: 0x01 },
            ]
        );
    }

    #[test]
    fn scanning_does_not_mutate() {
        let log = logger();
        let guard = Guard::install().unwrap();
        let mut tracker = RegionTracker::with_capacity(4).unwrap();
        let base = 0x6310_0000_0000;
        map_fault(base, 0xFF, &mut tracker, &log).unwrap();
        unsafe { *((base + 100) as *mut u8) = 0x00 };

        let mut engine = DiffEngine::new();
        assert_eq!(engine.scan_and_report(&guard, &tracker, 0xFF, &log).len(), 1);
        assert_eq!(engine.scan_and_report(&guard, &tracker, 0xFF, &log).len(), 1);

        tracker.fill_all(0xFF);
        assert!(engine.scan_and_report(&guard, &tracker, 0xFF, &log).is_empty());
        assert!(engine.diffs().is_empty());
    }

    #[test]
    fn fill_then_scan_is_clean() {
        let log = logger();
        let guard = Guard::install().unwrap();
        let mut tracker = RegionTracker::with_capacity(4).unwrap();
        map_fault(0x6320_0000_0000, 0x00, &mut tracker, &log).unwrap();
        map_fault(0x6320_0010_0000, 0x00, &mut tracker, &log).unwrap();
        tracker.fill_all(0xAA);

        let mut engine = DiffEngine::new();
        assert!(engine.scan_and_report(&guard, &tracker, 0xAA, &log).is_empty());
    }

    #[test]
    fn unreadable_pages_are_skipped() {
        let log = logger();
        let guard = Guard::install().unwrap();
        let mut tracker = RegionTracker::with_capacity(4).unwrap();
        let base = 0x6330_0000_0000;
        map_fault(base, 0x00, &mut tracker, &log).unwrap();
        unsafe {
            *((base + page_size() + 3) as *mut u8) = 0x77;
            libc::mprotect(base as *mut libc::c_void, page_size(), libc::PROT_NONE);
        }

        let mut engine = DiffEngine::new();
        let diffs = engine.scan_and_report(&guard, &tracker, 0x00, &log);
        assert_eq!(diffs, &[MemDiff { address: base + page_size() + 3, expected: 0, observed: 0x77 }]);
    }

    #[test]
    fn misaligned_regions_are_skipped() {
        let log = logger();
        let guard = Guard::install().unwrap();
        let mut tracker = RegionTracker::with_capacity(4).unwrap();
        let base = 0x6340_0000_0000;
        map_fault(base, 0x00, &mut tracker, &log).unwrap();
        unsafe {
            *((base + 7) as *mut u8) = 0x11;
            *((base + page_size() + 9) as *mut u8) = 0x22;
        }
        // Both overlap the real region, so scanning them would repeat its diffs.
        tracker.add(MappedRegion { base: base + 1, len: 2 * page_size() }, &log);
        tracker.add(MappedRegion { base: base + page_size(), len: page_size() + 1 }, &log);
        assert_eq!(tracker.len(), 3);

        let mut engine = DiffEngine::new();
        let diffs = engine.scan_and_report(&guard, &tracker, 0x00, &log);
        assert_eq!(
            diffs,
            &[
                MemDiff { address: base + 7, expected: 0, observed: 0x11 },
                MemDiff { address: base + page_size() + 9, expected: 0, observed: 0x22 },
            ]
        );
    }
}
