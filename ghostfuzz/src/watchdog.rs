//! Per-execution timeout delivered as SIGALRM to the executing thread.

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::time::Duration;

use anyhow::{Context, Result};

/// A POSIX timer bound to the thread that created it.
///
/// The guard classifies its SIGALRM as [`crate::guard::Outcome::Timeout`].
#[derive(Debug)]
pub struct Watchdog {
    timer: libc::timer_t,
    timeout: Duration,
    _thread_bound: PhantomData<*const ()>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Result<Self> {
        // SAFETY: sigevent is plain data; zero is a valid starting value.
        let mut event: libc::sigevent = unsafe { mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = libc::SIGALRM;
        // SAFETY: gettid cannot fail.
        event.sigev_notify_thread_id = unsafe { libc::syscall(libc::SYS_gettid) } as libc::c_int;

        let mut timer: libc::timer_t = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut timer) } != 0 {
            return Err(io::Error::last_os_error()).context("creating the watchdog timer");
        }
        Ok(Self {
            timer,
            timeout,
            _thread_bound: PhantomData,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the countdown. Fires once.
    pub fn arm(&self) {
        self.set(self.timeout);
    }

    pub fn disarm(&self) {
        self.set(Duration::ZERO);
    }

    fn set(&self, value: Duration) {
        let setting = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: value.as_secs() as libc::time_t,
                tv_nsec: value.subsec_nanos() as libc::c_long,
            },
        };
        // SAFETY: the timer is live until drop. Failure only happens for an
        // invalid timer id, which cannot occur here.
        unsafe {
            libc::timer_settime(self.timer, 0, &setting, ptr::null_mut());
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // SAFETY: created in `new`, deleted exactly once.
        unsafe {
            libc::timer_delete(self.timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{Guard, Outcome};
    use std::ffi::c_void;
    use std::time::Instant;

    unsafe extern "C" fn spins(_arg: *mut c_void) {
        loop {
            std::hint::spin_loop();
        }
    }

    /// Spins for the number of milliseconds `arg` points at, then returns.
    unsafe extern "C" fn spins_for(arg: *mut c_void) {
        let millis = unsafe { *arg.cast::<u64>() };
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(millis) {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn fires_on_a_spinning_entry() {
        let guard = Guard::install().unwrap();
        let watchdog = Watchdog::new(Duration::from_millis(50)).unwrap();
        let outcome = unsafe { guard.run_timed(&watchdog, 0..0, spins, ptr::null_mut()) };
        assert_eq!(outcome, Outcome::Timeout);
    }

    #[test]
    fn disarmed_watchdog_stays_quiet() {
        let guard = Guard::install().unwrap();
        let watchdog = Watchdog::new(Duration::from_millis(10)).unwrap();
        watchdog.arm();
        watchdog.disarm();
        // Spans the original deadline with a frame published.
        let mut millis = 40u64;
        let outcome = unsafe { guard.run(0..0, spins_for, (&raw mut millis).cast()) };
        assert_eq!(outcome, Outcome::Completed);
    }

    #[test]
    fn immediate_expiry_is_still_a_timeout() {
        let guard = Guard::install().unwrap();
        let watchdog = Watchdog::new(Duration::from_nanos(1)).unwrap();
        let mut millis = 500u64;
        let outcome = unsafe { guard.run_timed(&watchdog, 0..0, spins_for, (&raw mut millis).cast()) };
        assert_eq!(outcome, Outcome::Timeout);
    }
}
