use std::arch::global_asm;
use std::ffi::c_void;

use super::{ACTIVE_FRAME, EntryFn, GuardFrame};

/// s0-s11, sp, ra, gp, tp, fs0-fs11, fcsr.
pub(super) const SAVED_SLOTS: usize = 29;
const SLOT_SP: usize = 12;

// __gregs indices: pc takes the slot of x0.
const REG_PC: usize = 0;
const REG_SP: usize = 2;
const REG_A0: usize = 10;
const REG_A1: usize = 11;

// ghostfuzz_guard_enter(frame: a0, entry: a1, arg: a2) -> a0
//
// gp and tp are saved as well: a fuzzed instruction can overwrite them, and
// nothing but this stub would put them back.
global_asm!(
    ".pushsection .text.ghostfuzz_guard,\"ax\",@progbits",
    ".option push",
    ".option norelax",
    ".p2align 2",
    ".globl ghostfuzz_guard_enter",
    ".hidden ghostfuzz_guard_enter",
    ".type ghostfuzz_guard_enter,@function",
    "ghostfuzz_guard_enter:",
    "sd s0, 0(a0)",
    "sd s1, 8(a0)",
    "sd s2, 16(a0)",
    "sd s3, 24(a0)",
    "sd s4, 32(a0)",
    "sd s5, 40(a0)",
    "sd s6, 48(a0)",
    "sd s7, 56(a0)",
    "sd s8, 64(a0)",
    "sd s9, 72(a0)",
    "sd s10, 80(a0)",
    "sd s11, 88(a0)",
    "sd sp, 96(a0)",
    "sd ra, 104(a0)",
    "sd gp, 112(a0)",
    "sd tp, 120(a0)",
    "fsd fs0, 128(a0)",
    "fsd fs1, 136(a0)",
    "fsd fs2, 144(a0)",
    "fsd fs3, 152(a0)",
    "fsd fs4, 160(a0)",
    "fsd fs5, 168(a0)",
    "fsd fs6, 176(a0)",
    "fsd fs7, 184(a0)",
    "fsd fs8, 192(a0)",
    "fsd fs9, 200(a0)",
    "fsd fs10, 208(a0)",
    "fsd fs11, 216(a0)",
    "frcsr t0",
    "sd t0, 224(a0)",
    "la t0, {active}",
    "sd a0, 0(t0)",
    "mv t1, a1",
    "mv a0, a2",
    "jalr ra, 0(t1)",
    "la t0, {active}",
    "ld a0, 0(t0)",
    "sd zero, 0(t0)",
    "li a1, 0",
    "j ghostfuzz_guard_resume",
    ".size ghostfuzz_guard_enter, . - ghostfuzz_guard_enter",
    "",
    ".p2align 2",
    ".globl ghostfuzz_guard_resume",
    ".hidden ghostfuzz_guard_resume",
    ".type ghostfuzz_guard_resume,@function",
    "ghostfuzz_guard_resume:",
    "ld s0, 0(a0)",
    "ld s1, 8(a0)",
    "ld s2, 16(a0)",
    "ld s3, 24(a0)",
    "ld s4, 32(a0)",
    "ld s5, 40(a0)",
    "ld s6, 48(a0)",
    "ld s7, 56(a0)",
    "ld s8, 64(a0)",
    "ld s9, 72(a0)",
    "ld s10, 80(a0)",
    "ld s11, 88(a0)",
    "ld sp, 96(a0)",
    "ld ra, 104(a0)",
    "ld gp, 112(a0)",
    "ld tp, 120(a0)",
    "fld fs0, 128(a0)",
    "fld fs1, 136(a0)",
    "fld fs2, 144(a0)",
    "fld fs3, 152(a0)",
    "fld fs4, 160(a0)",
    "fld fs5, 168(a0)",
    "fld fs6, 176(a0)",
    "fld fs7, 184(a0)",
    "fld fs8, 192(a0)",
    "fld fs9, 200(a0)",
    "fld fs10, 208(a0)",
    "fld fs11, 216(a0)",
    "ld t0, 224(a0)",
    "fscsr t0",
    "mv a0, a1",
    "ret",
    ".size ghostfuzz_guard_resume, . - ghostfuzz_guard_resume",
    ".option pop",
    ".popsection",
    active = sym ACTIVE_FRAME,
);

unsafe extern "C" {
    pub(super) fn ghostfuzz_guard_enter(frame: *mut GuardFrame, entry: EntryFn, arg: *mut c_void) -> u64;
    fn ghostfuzz_guard_resume();
}

/// Points the interrupted context at the resume stub.
///
/// # Safety
///
/// `context` must be the `ucontext_t` handed to the signal handler and
/// `frame` the published guard frame.
pub(super) unsafe fn redirect(context: *mut c_void, frame: *mut GuardFrame, code: u64) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        let uc = &mut *context.cast::<libc::ucontext_t>();
        let gregs = &mut uc.uc_mcontext.__gregs;
        gregs[REG_PC] = ghostfuzz_guard_resume as usize as libc::c_ulong;
        gregs[REG_SP] = (*frame).regs[SLOT_SP] as libc::c_ulong;
        gregs[REG_A0] = frame as usize as libc::c_ulong;
        gregs[REG_A1] = code as libc::c_ulong;
    }
}
