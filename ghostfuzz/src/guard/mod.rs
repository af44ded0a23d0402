//! Turns hardware faults raised by untrusted code into ordinary return values.
//!
//! [`Guard::run`] saves the caller's callee-saved register state into a
//! `GuardFrame`, publishes the frame to the process-wide signal handler and
//! calls the entry routine. When the entry routine returns, the call yields
//! [`Outcome::Completed`]. When it raises SIGSEGV, SIGBUS, SIGILL, SIGFPE,
//! SIGTRAP or the watchdog's SIGALRM, the handler classifies the signal,
//! records the fault address in the frame and rewrites the interrupted context
//! so that `sigreturn` lands in an assembly resume stub. The stub restores the
//! saved state and returns the classification from the same call site.
//!
//! Everything the entry routine had on its own stack is abandoned at that
//! point. Entry routines must therefore not own anything with a destructor.

use std::cell::RefCell;
use std::ffi::c_void;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;

use crate::constants::SIGNAL_STACK_SIZE;
use crate::memory::Mapping;
use crate::watchdog::Watchdog;

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
use riscv64 as arch;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "riscv64"))))]
compile_error!("ghostfuzz guards execution on linux x86_64 and riscv64 only");

/// Routine executed under the guard. Receives the opaque argument given to [`Guard::run`].
pub type EntryFn = unsafe extern "C" fn(*mut c_void);

const CODE_COMPLETED: u64 = 0;
const CODE_UNRECOVERABLE: u64 = 1;
const CODE_RECOVERABLE_SEGFAULT: u64 = 2;
const CODE_SANDBOX_FAULT: u64 = 3;
const CODE_TIMEOUT: u64 = 4;

const GUARDED_SIGNALS: [libc::c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
    libc::SIGALRM,
];

/// How a guarded execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The entry routine returned normally.
    Completed,
    /// A non-segmentation fault (illegal instruction, bus error, ...).
    UnrecoverableFault { signal: i32, addr: usize },
    /// A segmentation fault outside the sandbox buffer, eligible for lazy mapping.
    RecoverableSegfault { addr: usize },
    /// A segmentation fault inside the sandbox buffer itself.
    SandboxFault { addr: usize },
    /// The watchdog fired.
    Timeout,
}

impl Outcome {
    fn decode(code: u64, signal: i32, addr: usize) -> Self {
        match code {
            CODE_COMPLETED => Outcome::Completed,
            CODE_RECOVERABLE_SEGFAULT => Outcome::RecoverableSegfault { addr },
            CODE_SANDBOX_FAULT => Outcome::SandboxFault { addr },
            CODE_TIMEOUT => Outcome::Timeout,
            _ => Outcome::UnrecoverableFault { signal, addr },
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Outcome::RecoverableSegfault { .. })
    }
}

/// Saved register state plus the fault report written by the signal handler.
///
/// The assembly stubs only touch `regs`, which must stay the first field.
#[repr(C)]
pub(crate) struct GuardFrame {
    regs: [u64; arch::SAVED_SLOTS],
    owner: libc::pid_t,
    signal: libc::c_int,
    fault_addr: usize,
    sandbox_start: usize,
    sandbox_end: usize,
}

/// The frame of the guarded call in flight, null when none is.
///
/// A plain global rather than a thread local: fuzzed instructions may clobber
/// the thread pointer before faulting.
pub(crate) static ACTIVE_FRAME: AtomicPtr<GuardFrame> = AtomicPtr::new(ptr::null_mut());

/// Serializes guarded calls, since there is exactly one `ACTIVE_FRAME`.
static GUARD_LOCK: Mutex<()> = Mutex::new(());

static HANDLERS: OnceCell<()> = OnceCell::new();

thread_local! {
    static SIGNAL_STACK: RefCell<Option<SignalStack>> = const { RefCell::new(None) };
}

/// Proof that the fault handlers are installed and that the current thread
/// has an alternate signal stack. Tied to the thread that created it.
#[derive(Debug)]
pub struct Guard {
    owner: libc::pid_t,
    _thread_bound: PhantomData<*const ()>,
}

impl Guard {
    /// Installs the process-wide fault handlers (once) and the alternate
    /// signal stack of the calling thread.
    pub fn install() -> Result<Self> {
        HANDLERS.get_or_try_init(install_handlers)?;
        SIGNAL_STACK.with(|slot| -> Result<()> {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(SignalStack::install()?);
            }
            Ok(())
        })?;
        Ok(Self {
            owner: current_tid(),
            _thread_bound: PhantomData,
        })
    }

    /// Runs `entry(arg)` and reports how it ended. Faults whose address lies in
    /// `sandbox` are reported as [`Outcome::SandboxFault`].
    ///
    /// # Safety
    ///
    /// `entry` may execute arbitrary code. Its stack frames are discarded
    /// without unwinding when it faults, so it must not hold locks or own
    /// values with destructors, and whatever it does to memory is on the caller.
    pub unsafe fn run(&self, sandbox: Range<usize>, entry: EntryFn, arg: *mut c_void) -> Outcome {
        // SAFETY: forwarded from the caller.
        unsafe { self.run_inner(None, sandbox, entry, arg) }
    }

    /// Like [`Guard::run`], with `watchdog` armed for exactly the duration of
    /// the call.
    ///
    /// # Safety
    ///
    /// Same as [`Guard::run`].
    pub unsafe fn run_timed(
        &self,
        watchdog: &Watchdog,
        sandbox: Range<usize>,
        entry: EntryFn,
        arg: *mut c_void,
    ) -> Outcome {
        // SAFETY: forwarded from the caller.
        unsafe { self.run_inner(Some(watchdog), sandbox, entry, arg) }
    }

    unsafe fn run_inner(
        &self,
        watchdog: Option<&Watchdog>,
        sandbox: Range<usize>,
        entry: EntryFn,
        arg: *mut c_void,
    ) -> Outcome {
        // The watchdog is only ever armed while this lock is held.
        let _serial = GUARD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let mut frame = GuardFrame {
            regs: [0; arch::SAVED_SLOTS],
            owner: self.owner,
            signal: 0,
            fault_addr: 0,
            sandbox_start: sandbox.start,
            sandbox_end: sandbox.end,
        };
        let frame_ptr: *mut GuardFrame = &mut frame;
        let mut timed = TimedCall {
            watchdog: ptr::null(),
            entry,
            arg,
        };
        let (entry, arg) = match watchdog {
            Some(watchdog) => {
                timed.watchdog = watchdog;
                (timed_entry as EntryFn, (&raw mut timed).cast::<c_void>())
            }
            None => (entry, arg),
        };
        // SAFETY: the frame outlives the call. The enter stub publishes it in
        // ACTIVE_FRAME, and the stubs restore every callee-saved register
        // before returning here.
        let code = unsafe { arch::ghostfuzz_guard_enter(frame_ptr, entry, arg) };
        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }
        ACTIVE_FRAME.store(ptr::null_mut(), Ordering::SeqCst);

        // SAFETY: the handler wrote through `frame_ptr`; read it back the same way.
        let (signal, addr) = unsafe {
            (
                ptr::read_volatile(&raw const (*frame_ptr).signal),
                ptr::read_volatile(&raw const (*frame_ptr).fault_addr),
            )
        };
        Outcome::decode(code, signal, addr)
    }
}

/// Argument of [`timed_entry`].
#[repr(C)]
struct TimedCall {
    watchdog: *const Watchdog,
    entry: EntryFn,
    arg: *mut c_void,
}

/// Arms the watchdog from inside the guarded call, where the frame is
/// already published, then runs the real entry.
unsafe extern "C" fn timed_entry(call: *mut c_void) {
    // SAFETY: `run_inner` passes a live `TimedCall` whose watchdog outlives the call.
    unsafe {
        let call = &*call.cast::<TimedCall>();
        (*call.watchdog).arm();
        (call.entry)(call.arg);
    }
}

/// Alternate stack the handler runs on, so a clobbered stack pointer
/// cannot prevent fault delivery.
struct SignalStack {
    _mapping: Mapping,
}

impl SignalStack {
    fn install() -> Result<Self> {
        let mapping = Mapping::anonymous(SIGNAL_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE)
            .context("allocating the alternate signal stack")?;
        let stack = libc::stack_t {
            ss_sp: mapping.as_ptr().cast(),
            ss_flags: 0,
            ss_size: mapping.len(),
        };
        // SAFETY: the stack memory stays mapped until `drop` disables it.
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error()).context("sigaltstack");
        }
        Ok(Self { _mapping: mapping })
    }
}

impl Drop for SignalStack {
    fn drop(&mut self) {
        let disable = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        // SAFETY: disabling the alternate stack before its memory is released.
        unsafe {
            libc::sigaltstack(&disable, ptr::null_mut());
        }
    }
}

fn install_handlers() -> Result<()> {
    for signal in GUARDED_SIGNALS {
        // SAFETY: a zeroed sigaction is a valid starting point; every field
        // the kernel reads is set below.
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_signal
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
            as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        // SAFETY: sa_mask is owned by `action`.
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            for blocked in GUARDED_SIGNALS {
                libc::sigaddset(&mut action.sa_mask, blocked);
            }
        }
        // SAFETY: `handle_signal` only touches async-signal-safe state.
        if unsafe { libc::sigaction(signal, &action, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("installing handler for {}", signal_name(signal)));
        }
    }
    Ok(())
}

fn current_tid() -> libc::pid_t {
    // SAFETY: gettid cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn classify(signal: libc::c_int, addr: usize, sandbox_start: usize, sandbox_end: usize) -> u64 {
    match signal {
        libc::SIGALRM => CODE_TIMEOUT,
        libc::SIGSEGV if (sandbox_start..sandbox_end).contains(&addr) => CODE_SANDBOX_FAULT,
        libc::SIGSEGV => CODE_RECOVERABLE_SEGFAULT,
        _ => CODE_UNRECOVERABLE,
    }
}

extern "C" fn handle_signal(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let frame = ACTIVE_FRAME.load(Ordering::SeqCst);
    // SAFETY: a non-null frame is live for as long as it is published.
    if frame.is_null() || unsafe { (*frame).owner } != current_tid() {
        if signal != libc::SIGALRM {
            // Not ours: fall back to the default action and let the fault recur.
            // SAFETY: resetting a disposition is async-signal-safe.
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(signal, &action, ptr::null_mut());
            }
        }
        return;
    }
    // One-shot: later signals until the next guarded call are strays.
    ACTIVE_FRAME.store(ptr::null_mut(), Ordering::SeqCst);

    let addr = if signal == libc::SIGALRM || info.is_null() {
        0
    } else {
        // SAFETY: the kernel fills si_addr for every fault signal we handle.
        unsafe { (*info).si_addr() as usize }
    };
    // SAFETY: frame is live (see above) and nothing else touches it now.
    unsafe {
        let code = classify(signal, addr, (*frame).sandbox_start, (*frame).sandbox_end);
        (*frame).signal = signal;
        (*frame).fault_addr = addr;
        arch::redirect(context, frame, code);
    }
}

/// Human readable name of the signals the guard handles.
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV (Segmentation Fault)",
        libc::SIGBUS => "SIGBUS (Bus Error)",
        libc::SIGILL => "SIGILL (Illegal Instruction)",
        libc::SIGFPE => "SIGFPE (Floating Point Exception)",
        libc::SIGTRAP => "SIGTRAP (Trace/Breakpoint Trap)",
        libc::SIGALRM => "SIGALRM (Watchdog)",
        _ => "unknown signal",
    }
}
