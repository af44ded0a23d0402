//! The executable buffer candidate instructions are injected into, and the
//! seam through which a case driver enters it.

use std::ffi::c_void;
use std::ops::Range;
use std::ptr;

use anyhow::{Context, Result};
use slog::{Logger, debug};

use crate::constants::{PLACEHOLDER_NOP, SANDBOX_PAGES, TRAMPOLINE_RETURN};
use crate::guard::EntryFn;
use crate::memory::{Mapping, page_size};

/// One candidate instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzCase {
    pub word: u32,
}

impl FuzzCase {
    pub fn new(word: u32) -> Self {
        Self { word }
    }

    /// The words written at the start of the sandbox: the candidate in the
    /// placeholder slot, followed by the trampoline back to the harness.
    pub fn template(&self) -> [u32; 2] {
        [self.word, TRAMPOLINE_RETURN]
    }
}

impl Default for FuzzCase {
    /// A no-op in the candidate slot.
    fn default() -> Self {
        Self::new(PLACEHOLDER_NOP)
    }
}

/// A read/write/execute mapping that lives for the whole process.
#[derive(Debug)]
pub struct Sandbox {
    mapping: Mapping,
}

impl Sandbox {
    pub fn new() -> Result<Self> {
        let mapping = Mapping::anonymous(
            SANDBOX_PAGES * page_size(),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
        .context("allocating the executable sandbox")?;
        Ok(Self { mapping })
    }

    /// Zeroes the buffer. All-zero words are illegal instructions, so a jump
    /// past the template traps instead of running stale code.
    pub fn clear(&mut self) {
        // SAFETY: the mapping is writable and `len` bytes long.
        unsafe { ptr::write_bytes(self.mapping.as_ptr(), 0, self.mapping.len()) };
    }

    /// Clears the buffer, writes the case template at its start and makes it
    /// visible to instruction fetch.
    pub fn inject(&mut self, case: &FuzzCase, logger: &Logger) {
        self.clear();
        let words = self.mapping.as_ptr().cast::<u32>();
        for (i, word) in case.template().into_iter().enumerate() {
            // SAFETY: the template is far smaller than a page, and the
            // mapping is page aligned.
            unsafe { ptr::write_volatile(words.add(i), word) };
        }
        flush_icache(self.range());
        debug!(logger, "injected"; "word" => format!("{:#010x}", case.word), "sandbox" => format!("{:p}", self.mapping.as_ptr()));
    }

    /// Address of the first template word.
    pub fn entry_address(&self) -> usize {
        self.mapping.as_ptr() as usize
    }

    /// The word currently in the candidate slot.
    pub fn injected_word(&self) -> u32 {
        // SAFETY: the mapping is readable and aligned.
        unsafe { ptr::read_volatile(self.mapping.as_ptr().cast::<u32>()) }
    }

    pub fn range(&self) -> Range<usize> {
        self.mapping.range()
    }
}

#[cfg(target_arch = "riscv64")]
fn flush_icache(range: Range<usize>) {
    const SYS_RISCV_FLUSH_ICACHE: libc::c_long = 259;
    // SAFETY: the syscall only synchronizes caches over the given range.
    unsafe {
        libc::syscall(SYS_RISCV_FLUSH_ICACHE, range.start, range.end, 0usize);
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn flush_icache(_range: Range<usize>) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// A guarded call into the sandbox: `routine(arg)`.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint {
    pub routine: EntryFn,
    pub arg: *mut c_void,
}

/// Transfers control into the injected code and reports register effects.
pub trait SandboxEntry {
    /// Returns the routine that runs the code currently injected into
    /// `sandbox`. Called before every execution.
    fn prepare(&mut self, sandbox: &Sandbox) -> EntryPoint;

    /// Logs the register side effects of the most recent execution.
    fn report_registers(&self, logger: &Logger) {
        debug!(logger, "register capture not supported by this entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_places_word_before_trampoline() {
        assert_eq!(FuzzCase::new(0x1002_8027).template(), [0x1002_8027, TRAMPOLINE_RETURN]);
    }

    #[test]
    fn inject_replaces_previous_case() {
        let log = Logger::root(slog::Discard, slog::o!());
        let mut sandbox = Sandbox::new().unwrap();
        sandbox.inject(&FuzzCase::new(0xFFFF_FFFF), &log);
        assert_eq!(sandbox.injected_word(), 0xFFFF_FFFF);
        sandbox.inject(&FuzzCase::new(PLACEHOLDER_NOP), &log);
        assert_eq!(sandbox.injected_word(), PLACEHOLDER_NOP);

        let bytes = unsafe { std::slice::from_raw_parts(sandbox.entry_address() as *const u8, sandbox.range().len()) };
        assert_eq!(&bytes[4..8], &TRAMPOLINE_RETURN.to_ne_bytes());
        assert!(bytes[8..].iter().all(|&b| b == 0));
    }
}
