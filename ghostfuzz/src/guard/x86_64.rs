use std::arch::global_asm;
use std::ffi::c_void;

use super::{ACTIVE_FRAME, EntryFn, GuardFrame};

/// rbx, rbp, r12-r15, rsp, return address, mxcsr/fcw.
pub(super) const SAVED_SLOTS: usize = 10;
const SLOT_SP: usize = 6;

// gregs indices from <sys/ucontext.h>.
const REG_RDI: usize = 8;
const REG_RSI: usize = 9;
const REG_RSP: usize = 15;
const REG_RIP: usize = 16;

// ghostfuzz_guard_enter(frame: rdi, entry: rsi, arg: rdx) -> rax
//
// The frame is published only once it holds a complete register state.
// Normal completion and the signal handler both leave through
// ghostfuzz_guard_resume(frame: rdi, code: rsi), which reloads the saved
// state and "returns" from ghostfuzz_guard_enter with `code`.
global_asm!(
    ".pushsection .text.ghostfuzz_guard,\"ax\",@progbits",
    ".p2align 4",
    ".globl ghostfuzz_guard_enter",
    ".hidden ghostfuzz_guard_enter",
    ".type ghostfuzz_guard_enter,@function",
    "ghostfuzz_guard_enter:",
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], r12",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r14",
    "mov [rdi + 0x28], r15",
    "lea rax, [rsp + 8]",
    "mov [rdi + 0x30], rax",
    "mov rax, [rsp]",
    "mov [rdi + 0x38], rax",
    "stmxcsr dword ptr [rdi + 0x40]",
    "fnstcw word ptr [rdi + 0x44]",
    "mov qword ptr [rip + {active}], rdi",
    "mov rdi, rdx",
    "sub rsp, 8",
    "call rsi",
    "mov rdi, qword ptr [rip + {active}]",
    "mov qword ptr [rip + {active}], 0",
    "xor esi, esi",
    "jmp ghostfuzz_guard_resume",
    ".size ghostfuzz_guard_enter, . - ghostfuzz_guard_enter",
    "",
    ".p2align 4",
    ".globl ghostfuzz_guard_resume",
    ".hidden ghostfuzz_guard_resume",
    ".type ghostfuzz_guard_resume,@function",
    "ghostfuzz_guard_resume:",
    "mov rbx, [rdi + 0x00]",
    "mov rbp, [rdi + 0x08]",
    "mov r12, [rdi + 0x10]",
    "mov r13, [rdi + 0x18]",
    "mov r14, [rdi + 0x20]",
    "mov r15, [rdi + 0x28]",
    "mov rsp, [rdi + 0x30]",
    "fninit",
    "ldmxcsr dword ptr [rdi + 0x40]",
    "fldcw word ptr [rdi + 0x44]",
    "cld",
    "mov rax, rsi",
    "jmp qword ptr [rdi + 0x38]",
    ".size ghostfuzz_guard_resume, . - ghostfuzz_guard_resume",
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
        let gregs = &mut uc.uc_mcontext.gregs;
        gregs[REG_RIP] = ghostfuzz_guard_resume as usize as i64;
        gregs[REG_RSP] = (*frame).regs[SLOT_SP] as i64;
        gregs[REG_RDI] = frame as usize as i64;
        gregs[REG_RSI] = code as i64;
    }
}
