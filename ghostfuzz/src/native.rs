//! Native execution of the sandbox on RISC-V hardware.
//!
//! `ghostfuzz_native_launch` loads a complete register file, points `sp` at a
//! private stack and jumps into the sandbox with `jalr x9, 0(x9)`. The
//! injected template ends in `jalr x0, 0(x9)`, which lands on
//! `ghostfuzz_native_return`. That stub stores every register and leaves
//! through the guard's resume path exactly like a normal return would.

use std::arch::global_asm;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use slog::{Logger, info, warn};

use crate::constants::SANDBOX_STACK_SIZE;
use crate::guard::ACTIVE_FRAME;
use crate::memory::{Mapping, page_size};
use crate::registers::{self, RegisterFile};
use crate::sandbox::{EntryPoint, Sandbox, SandboxEntry};

/// x0..x31 followed by f0..f31. Slot 0 of the output bank doubles as the
/// "captured" flag since x0 itself carries no information.
#[repr(C, align(16))]
struct RegisterBank(UnsafeCell<[u64; 64]>);

// SAFETY: only touched under the guard lock, by the one NativeEntry alive.
unsafe impl Sync for RegisterBank {}

impl RegisterBank {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; 64]))
    }
}

static REGS_IN: RegisterBank = RegisterBank::new();
static REGS_OUT: RegisterBank = RegisterBank::new();
static CLAIMED: AtomicBool = AtomicBool::new(false);

const SLOT_SP: usize = 2;
const SLOT_CODE: usize = 9;

/// gp and tp belong to the harness; x9 carries the return address.
const HARNESS_OWNED: [usize; 3] = [3, 4, 9];

global_asm!(
    ".pushsection .text.ghostfuzz_native,\"ax\",@progbits",
    ".option push",
    ".option norelax",
    ".p2align 2",
    ".globl ghostfuzz_native_launch",
    ".hidden ghostfuzz_native_launch",
    ".type ghostfuzz_native_launch,@function",
    "ghostfuzz_native_launch:",
    "lla t0, {regs_in}",
    "fld f0, 256(t0)",
    "fld f1, 264(t0)",
    "fld f2, 272(t0)",
    "fld f3, 280(t0)",
    "fld f4, 288(t0)",
    "fld f5, 296(t0)",
    "fld f6, 304(t0)",
    "fld f7, 312(t0)",
    "fld f8, 320(t0)",
    "fld f9, 328(t0)",
    "fld f10, 336(t0)",
    "fld f11, 344(t0)",
    "fld f12, 352(t0)",
    "fld f13, 360(t0)",
    "fld f14, 368(t0)",
    "fld f15, 376(t0)",
    "fld f16, 384(t0)",
    "fld f17, 392(t0)",
    "fld f18, 400(t0)",
    "fld f19, 408(t0)",
    "fld f20, 416(t0)",
    "fld f21, 424(t0)",
    "fld f22, 432(t0)",
    "fld f23, 440(t0)",
    "fld f24, 448(t0)",
    "fld f25, 456(t0)",
    "fld f26, 464(t0)",
    "fld f27, 472(t0)",
    "fld f28, 480(t0)",
    "fld f29, 488(t0)",
    "fld f30, 496(t0)",
    "fld f31, 504(t0)",
    "ld x1, 8(t0)",
    "ld x2, 16(t0)",
    "ld x6, 48(t0)",
    "ld x7, 56(t0)",
    "ld x8, 64(t0)",
    "ld x10, 80(t0)",
    "ld x11, 88(t0)",
    "ld x12, 96(t0)",
    "ld x13, 104(t0)",
    "ld x14, 112(t0)",
    "ld x15, 120(t0)",
    "ld x16, 128(t0)",
    "ld x17, 136(t0)",
    "ld x18, 144(t0)",
    "ld x19, 152(t0)",
    "ld x20, 160(t0)",
    "ld x21, 168(t0)",
    "ld x22, 176(t0)",
    "ld x23, 184(t0)",
    "ld x24, 192(t0)",
    "ld x25, 200(t0)",
    "ld x26, 208(t0)",
    "ld x27, 216(t0)",
    "ld x28, 224(t0)",
    "ld x29, 232(t0)",
    "ld x30, 240(t0)",
    "ld x31, 248(t0)",
    "ld x9, 72(t0)",
    "ld x5, 40(x5)",
    "jalr x9, 0(x9)",
    ".globl ghostfuzz_native_return",
    ".hidden ghostfuzz_native_return",
    "ghostfuzz_native_return:",
    "lla x9, {regs_out}",
    "sd x1, 8(x9)",
    "sd x2, 16(x9)",
    "sd x3, 24(x9)",
    "sd x4, 32(x9)",
    "sd x5, 40(x9)",
    "sd x6, 48(x9)",
    "sd x7, 56(x9)",
    "sd x8, 64(x9)",
    "sd x10, 80(x9)",
    "sd x11, 88(x9)",
    "sd x12, 96(x9)",
    "sd x13, 104(x9)",
    "sd x14, 112(x9)",
    "sd x15, 120(x9)",
    "sd x16, 128(x9)",
    "sd x17, 136(x9)",
    "sd x18, 144(x9)",
    "sd x19, 152(x9)",
    "sd x20, 160(x9)",
    "sd x21, 168(x9)",
    "sd x22, 176(x9)",
    "sd x23, 184(x9)",
    "sd x24, 192(x9)",
    "sd x25, 200(x9)",
    "sd x26, 208(x9)",
    "sd x27, 216(x9)",
    "sd x28, 224(x9)",
    "sd x29, 232(x9)",
    "sd x30, 240(x9)",
    "sd x31, 248(x9)",
    "fsd f0, 256(x9)",
    "fsd f1, 264(x9)",
    "fsd f2, 272(x9)",
    "fsd f3, 280(x9)",
    "fsd f4, 288(x9)",
    "fsd f5, 296(x9)",
    "fsd f6, 304(x9)",
    "fsd f7, 312(x9)",
    "fsd f8, 320(x9)",
    "fsd f9, 328(x9)",
    "fsd f10, 336(x9)",
    "fsd f11, 344(x9)",
    "fsd f12, 352(x9)",
    "fsd f13, 360(x9)",
    "fsd f14, 368(x9)",
    "fsd f15, 376(x9)",
    "fsd f16, 384(x9)",
    "fsd f17, 392(x9)",
    "fsd f18, 400(x9)",
    "fsd f19, 408(x9)",
    "fsd f20, 416(x9)",
    "fsd f21, 424(x9)",
    "fsd f22, 432(x9)",
    "fsd f23, 440(x9)",
    "fsd f24, 448(x9)",
    "fsd f25, 456(x9)",
    "fsd f26, 464(x9)",
    "fsd f27, 472(x9)",
    "fsd f28, 480(x9)",
    "fsd f29, 488(x9)",
    "fsd f30, 496(x9)",
    "fsd f31, 504(x9)",
    "lla t0, ghostfuzz_native_return",
    "sd t0, 72(x9)",
    "li t0, 1",
    "sd t0, 0(x9)",
    "lla t0, {active}",
    "ld a0, 0(t0)",
    "sd zero, 0(t0)",
    "li a1, 0",
    "j ghostfuzz_guard_resume",
    ".size ghostfuzz_native_launch, . - ghostfuzz_native_launch",
    ".option pop",
    ".popsection",
    regs_in = sym REGS_IN,
    regs_out = sym REGS_OUT,
    active = sym ACTIVE_FRAME,
);

unsafe extern "C" {
    fn ghostfuzz_native_launch(arg: *mut c_void);
}

/// Stack handed to injected code, with an inaccessible page below it.
#[derive(Debug)]
pub struct SandboxStack {
    mapping: Mapping,
}

impl SandboxStack {
    pub fn new() -> Result<Self> {
        let guard_len = page_size();
        let mut mapping = Mapping::anonymous(guard_len + SANDBOX_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE)?;
        mapping.protect(0, guard_len, libc::PROT_NONE)?;
        Ok(Self { mapping })
    }

    /// Initial stack pointer, 16-byte aligned.
    pub fn top(&self) -> usize {
        (self.mapping.as_ptr() as usize + self.mapping.len()) & !0xF
    }
}

/// Runs the sandbox on the CPU itself and captures the register file.
///
/// Only one instance may exist at a time since the register banks are global.
#[derive(Debug)]
pub struct NativeEntry {
    stack: SandboxStack,
    initial: RegisterFile,
    loaded: RegisterFile,
}

impl NativeEntry {
    pub fn new() -> Result<Self> {
        if CLAIMED.swap(true, Ordering::SeqCst) {
            bail!("a native entry is already in use");
        }
        let stack = match SandboxStack::new() {
            Ok(stack) => stack,
            Err(err) => {
                CLAIMED.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        Ok(Self {
            stack,
            initial: RegisterFile::unmapped_pattern(),
            loaded: RegisterFile::default(),
        })
    }

    /// Register values loaded before each execution. `sp` and `x9` are
    /// always replaced by the harness.
    pub fn set_initial(&mut self, regs: RegisterFile) {
        self.initial = regs;
    }

    pub fn initial(&self) -> &RegisterFile {
        &self.initial
    }

    /// Registers captured by the last execution, if it reached the trampoline.
    pub fn captured(&self) -> Option<RegisterFile> {
        // SAFETY: the bank is only written by the launch stub, which cannot
        // run concurrently with `&self` access on this thread.
        let bank = unsafe { ptr::read_volatile(REGS_OUT.0.get()) };
        if bank[0] != 1 {
            return None;
        }
        let mut regs = RegisterFile::default();
        regs.x[1..].copy_from_slice(&bank[1..32]);
        regs.f.copy_from_slice(&bank[32..]);
        Some(regs)
    }
}

impl Drop for NativeEntry {
    fn drop(&mut self) {
        CLAIMED.store(false, Ordering::SeqCst);
    }
}

impl SandboxEntry for NativeEntry {
    fn prepare(&mut self, sandbox: &Sandbox) -> EntryPoint {
        let mut loaded = self.initial;
        loaded.x[0] = 0;
        loaded.x[SLOT_SP] = self.stack.top() as u64;
        loaded.x[SLOT_CODE] = sandbox.entry_address() as u64;
        self.loaded = loaded;

        let mut bank = [0u64; 64];
        bank[..32].copy_from_slice(&loaded.x);
        bank[32..].copy_from_slice(&loaded.f);
        // SAFETY: no guarded call is in flight while the entry is prepared.
        unsafe {
            ptr::write_volatile(REGS_IN.0.get(), bank);
            ptr::write_volatile(REGS_OUT.0.get(), [0; 64]);
        }
        EntryPoint {
            routine: ghostfuzz_native_launch,
            arg: ptr::null_mut(),
        }
    }

    fn report_registers(&self, logger: &Logger) {
        let Some(after) = self.captured() else {
            warn!(logger, "WARNING: no register snapshot, last execution faulted");
            return;
        };
        for delta in registers::diff(&self.loaded, &after, &HARNESS_OWNED) {
            info!(logger, "{}", delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_aligned_and_guarded() {
        let stack = SandboxStack::new().unwrap();
        assert_eq!(stack.top() % 16, 0);
        let guard = crate::guard::Guard::install().unwrap();
        let below = stack.mapping.as_ptr() as usize;
        assert_eq!(crate::probe::probe_byte(&guard, below), None);
        assert!(crate::probe::probe_byte(&guard, stack.top() - 1).is_some());
    }
}
