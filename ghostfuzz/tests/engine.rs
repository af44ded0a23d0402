//! End-to-end runs of the case driver against a scripted stand-in for the
//! CPU: a Rust routine that decodes the injected word into an effect.

use std::ffi::c_void;
use std::io::{self, Cursor, Read, Write};
use std::ptr;
use std::time::Duration;

use assert_matches::assert_matches;
use ghostfuzz::config::HarnessConfig;
use ghostfuzz::driver::CaseDriver;
use ghostfuzz::guard::Outcome;
use ghostfuzz::log::{LogBuffer, build_logger};
use ghostfuzz::memory::page_size;
use ghostfuzz::retry::StopReason;
use ghostfuzz::sandbox::{EntryPoint, Sandbox, SandboxEntry};
use ghostfuzz::session::{SessionEnd, run_session};

const NOP: u32 = 0x0000_0013;
const ILLEGAL: u32 = 0xFFFF_FFFF;
/// Writes `GHOST` at `target` and `target + 3`.
const STORE_FIXED: u32 = 0x0000_A023;
/// Writes to a fresh page on every execution.
const STORE_WALK: u32 = 0x0000_B023;
const SPIN: u32 = 0x0000_006F;

const GHOST: u8 = 0x5A;

#[repr(C)]
struct Script {
    sandbox: usize,
    target: usize,
    walk: usize,
}

unsafe extern "C" fn scripted(arg: *mut c_void) {
    unsafe {
        let script = arg.cast::<Script>();
        let word = ptr::read_volatile((*script).sandbox as *const u32);
        match word {
            STORE_FIXED => {
                let target = (*script).target as *mut u8;
                ptr::write_volatile(target, GHOST);
                ptr::write_volatile(target.add(3), GHOST);
            }
            STORE_WALK => {
                let next = (*script).walk + 4 * page_size();
                ptr::write_volatile(&raw mut (*script).walk, next);
                ptr::write_volatile(next as *mut u8, GHOST);
            }
            SPIN => loop {
                std::hint::spin_loop();
            },
            ILLEGAL => {
                libc::raise(libc::SIGILL);
            }
            _ => {}
        }
    }
}

struct FakeCpu {
    script: Box<Script>,
}

impl FakeCpu {
    fn new(target: usize) -> Self {
        Self {
            script: Box::new(Script {
                sandbox: 0,
                target,
                walk: target + 0x1000_0000,
            }),
        }
    }
}

impl SandboxEntry for FakeCpu {
    fn prepare(&mut self, sandbox: &Sandbox) -> EntryPoint {
        self.script.sandbox = sandbox.entry_address();
        EntryPoint {
            routine: scripted,
            arg: (&mut *self.script as *mut Script).cast(),
        }
    }
}

fn config(timeout_ms: u64) -> HarnessConfig {
    HarnessConfig {
        timeout: Duration::from_millis(timeout_ms),
        echo_log: false,
        ..HarnessConfig::default()
    }
}

fn driver(target: usize, timeout_ms: u64) -> (CaseDriver<FakeCpu>, LogBuffer) {
    let log = LogBuffer::new(64 * 1024);
    let logger = build_logger(&log, false);
    let driver = CaseDriver::new(FakeCpu::new(target), &config(timeout_ms), logger).unwrap();
    (driver, log)
}

#[test]
fn nop_leaves_no_trace() {
    let (mut driver, _log) = driver(0x6600_0000_0000, 1000);
    let report = driver.run_case(0, NOP);
    assert_eq!(report.first_outcome, Outcome::Completed);
    assert!(report.passes.is_empty());
    assert_eq!(report.diff_count(), 0);
    assert!(driver.tracker().is_empty());
}

#[test]
fn store_is_found_in_both_passes() {
    let target = 0x6610_0000_0010;
    let (mut driver, log) = driver(target, 1000);
    let report = driver.run_case(3, STORE_FIXED);

    assert_eq!(report.first_outcome, Outcome::RecoverableSegfault { addr: target });
    assert_eq!(report.passes.len(), 2);
    let [first, second] = report.passes.as_slice() else { unreachable!() };
    assert_eq!((first.fill, first.stop, first.attempts), (0x00, StopReason::Completed, 2));
    assert_eq!((second.fill, second.stop, second.attempts), (0xFF, StopReason::Completed, 1));
    assert_eq!(first.regions.len(), 1);
    assert_eq!(first.regions[0].base, target & !(page_size() - 1));
    assert_eq!(first.regions[0].len, 2 * page_size());
    assert_eq!(first.diffs.len(), 2);
    assert!(first.diffs.iter().all(|d| d.expected == 0x00 && d.observed == GHOST));
    assert!(second.diffs.iter().all(|d| d.expected == 0xFF && d.observed == GHOST));
    assert_eq!(report.ghost_writes(), vec![target, target + 3]);

    let text = log.take();
    assert!(text.contains("CHG:"), "{text}");
    assert!(text.contains(&format!("addr={target:#x}")), "{text}");
}

#[test]
fn regions_do_not_leak_into_the_next_case() {
    let target = 0x6620_0000_0000;
    let (mut driver, _log) = driver(target, 1000);
    driver.run_case(0, STORE_FIXED);
    assert_eq!(driver.tracker().len(), 1);
    let report = driver.run_case(1, NOP);
    assert!(driver.tracker().is_empty());
    assert_eq!(report.first_outcome, Outcome::Completed);
    // The page is free again, so the store faults once more.
    let report = driver.run_case(2, STORE_FIXED);
    assert_eq!(report.first_outcome, Outcome::RecoverableSegfault { addr: target });
}

#[test]
fn unbounded_writes_exhaust_the_retry_ceiling() {
    let (mut driver, _log) = driver(0x6630_0000_0000, 1000);
    let report = driver.run_case(0, STORE_WALK);
    assert_matches!(report.first_outcome, Outcome::RecoverableSegfault { .. });
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].stop, StopReason::RetryExhausted);
    assert_eq!(report.passes[0].attempts, 20);
    assert!(report.passes[0].diffs.is_empty());
    assert_eq!(driver.tracker().len(), 20);
}

#[test]
fn illegal_instruction_abandons_the_case() {
    let (mut driver, log) = driver(0x6640_0000_0000, 1000);
    let report = driver.run_case(0, ILLEGAL);
    assert_matches!(report.first_outcome, Outcome::UnrecoverableFault { signal, .. } if signal == libc::SIGILL);
    assert!(report.passes.is_empty());
    assert!(log.take().contains("non-recoverable"));
}

#[test]
fn spinning_instruction_times_out() {
    let (mut driver, _log) = driver(0x6650_0000_0000, 100);
    let started = std::time::Instant::now();
    let report = driver.run_case(0, SPIN);
    assert_eq!(report.first_outcome, Outcome::Timeout);
    assert!(report.passes.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

struct Duplex {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn session_ships_the_batch_log() {
    let target = 0x6660_0000_0000;
    let (mut driver, log) = driver(target, 1000);
    let logger = build_logger(&LogBuffer::new(0), false);

    let mut script = Vec::new();
    for word in [2u32, NOP, STORE_FIXED, 0] {
        script.extend_from_slice(&word.to_be_bytes());
    }
    let mut stream = Duplex {
        input: Cursor::new(script),
        output: Vec::new(),
    };
    let summary = run_session(&mut stream, "beagle", 16, &mut driver, &log, &logger).unwrap();
    assert_eq!(summary.end, SessionEnd::NoMoreInstructions);
    assert_eq!(summary.batches, 1);

    let out = &stream.output;
    assert_eq!(&out[..10], b"\0\0\0\x06beagle");
    let len = u32::from_be_bytes([out[10], out[11], out[12], out[13]]) as usize;
    assert_eq!(out.len(), 14 + len);
    let text = std::str::from_utf8(&out[14..]).unwrap();
    assert!(text.contains("CHG:"), "{text}");
    assert!(log.is_empty());
}

#[test]
fn default_log_capacity_keeps_every_diff_of_a_batch() {
    let target = 0x6670_0000_0010;
    let config = HarnessConfig {
        echo_log: false,
        ..HarnessConfig::default()
    };
    let log = LogBuffer::new(config.log_capacity);
    let logger = build_logger(&log, false);
    let mut driver = CaseDriver::new(FakeCpu::new(target), &config, logger.clone()).unwrap();

    let mut script = 10u32.to_be_bytes().to_vec();
    for _ in 0..10 {
        script.extend_from_slice(&STORE_FIXED.to_be_bytes());
    }
    script.extend_from_slice(&0u32.to_be_bytes());
    let mut stream = Duplex {
        input: Cursor::new(script),
        output: Vec::new(),
    };
    run_session(&mut stream, "beagle", config.max_batch, &mut driver, &log, &logger).unwrap();

    let text = std::str::from_utf8(&stream.output[14..]).unwrap();
    // Two bytes per pass, two passes per case.
    assert_eq!(text.lines().filter(|line| line.starts_with("CHG:")).count(), 40, "{text}");
    assert!(!text.contains("log truncated"), "{text}");
    assert!(!text.contains("mapped region"), "{text}");
}
