//! Memory reads that may fault without taking the process down.

use std::ffi::c_void;
use std::ptr;

use crate::guard::{Guard, Outcome};

#[repr(C)]
struct CopyJob {
    src: *const u8,
    dst: *mut u8,
    len: usize,
    /// Bytes copied so far; left pointing at the faulting byte on a fault.
    done: usize,
}

unsafe extern "C" fn copy_bytes(arg: *mut c_void) {
    // SAFETY: `arg` is the CopyJob set up by `probe_into`.
    unsafe {
        let job = arg.cast::<CopyJob>();
        while ptr::read_volatile(&raw const (*job).done) < (*job).len {
            let i = (*job).done;
            let byte = ptr::read_volatile((*job).src.add(i));
            ptr::write_volatile((*job).dst.add(i), byte);
            ptr::write_volatile(&raw mut (*job).done, i + 1);
        }
    }
}

/// Reads the byte at `addr`, or `None` if the read faults.
pub fn probe_byte(guard: &Guard, addr: usize) -> Option<u8> {
    let mut byte = [0u8; 1];
    (probe_into(guard, addr, &mut byte) == 1).then_some(byte[0])
}

/// Copies bytes starting at `addr` into `dst` until the first fault.
///
/// Returns how many leading bytes of `dst` are valid.
pub fn probe_into(guard: &Guard, addr: usize, dst: &mut [u8]) -> usize {
    let mut job = CopyJob {
        src: addr as *const u8,
        dst: dst.as_mut_ptr(),
        len: dst.len(),
        done: 0,
    };
    let job_ptr: *mut CopyJob = &mut job;
    // SAFETY: `copy_bytes` owns nothing and only writes inside `dst`. Reads
    // from `addr` either succeed or fault into the guard.
    let outcome = unsafe { guard.run(0..0, copy_bytes, job_ptr.cast()) };
    // SAFETY: the entry wrote through `job_ptr`.
    let done = unsafe { ptr::read_volatile(&raw const (*job_ptr).done) };
    match outcome {
        Outcome::Completed => dst.len(),
        _ => done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Mapping, page_size};

    #[test]
    fn readable_byte_is_returned() {
        let guard = Guard::install().unwrap();
        let value = 0xC3u8;
        assert_eq!(probe_byte(&guard, &value as *const u8 as usize), Some(0xC3));
    }

    #[test]
    fn unreadable_byte_is_none() {
        let guard = Guard::install().unwrap();
        let page = Mapping::anonymous(page_size(), libc::PROT_NONE).unwrap();
        assert_eq!(probe_byte(&guard, page.as_ptr() as usize), None);
    }

    #[test]
    fn copy_stops_at_the_first_unreadable_page() {
        let guard = Guard::install().unwrap();
        let page = page_size();
        let mut mapping = Mapping::anonymous(2 * page, libc::PROT_READ | libc::PROT_WRITE).unwrap();
        unsafe { ptr::write_bytes(mapping.as_ptr(), 0x11, page) };
        mapping.protect(page, page, libc::PROT_NONE).unwrap();

        let start = mapping.as_ptr() as usize + page - 16;
        let mut dst = [0u8; 64];
        assert_eq!(probe_into(&guard, start, &mut dst), 16);
        assert!(dst[..16].iter().all(|&b| b == 0x11));
        assert!(dst[16..].iter().all(|&b| b == 0));
    }
}
