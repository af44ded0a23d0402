//! A fault-driven harness for finding undocumented side effects of single
//! CPU instructions ("ghost" writes to memory or registers).
//!
//! A candidate instruction word is injected into an executable sandbox and
//! executed under a [`guard::Guard`], which turns every hardware fault into an
//! [`guard::Outcome`] instead of a crash. Segmentation faults outside the
//! sandbox are answered by mapping two fresh pages at the faulting address and
//! running again, until the instruction completes ("runs until quiet"). The
//! lazily mapped pages are then compared against the byte they were filled
//! with. Every case runs twice, with fill bytes `0x00` and `0xFF`, so writes
//! by the instruction can be told apart from whatever the memory held before.
//!
//! ## Getting Started
//!
//! Implement [`sandbox::SandboxEntry`] to transfer control into the injected
//! code (on RISC-V hardware, `native::NativeEntry` does this), then drive
//! cases with [`driver::CaseDriver`].
//!
//! ```no_run
//! use ghostfuzz::config::HarnessConfig;
//! use ghostfuzz::driver::CaseDriver;
//! use ghostfuzz::log::{LogBuffer, build_logger};
//! # use ghostfuzz::sandbox::{EntryPoint, Sandbox, SandboxEntry};
//! # struct MyEntry;
//! # impl SandboxEntry for MyEntry {
//! #     fn prepare(&mut self, _: &Sandbox) -> EntryPoint { unimplemented!() }
//! # }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = HarnessConfig::from_env()?;
//!     let log = LogBuffer::new(config.log_capacity);
//!     let logger = build_logger(&log, config.echo_log);
//!
//!     let mut driver = CaseDriver::new(MyEntry, &config, logger)?;
//!     let report = driver.run_case(0, 0x1002_8027);
//!     println!("{} ghost writes", report.ghost_writes().len());
//!     print!("{}", log.take());
//!     Ok(())
//! }
//! ```
//!
//! The networked client lives in `fuzzers/batch_client`, an offline sweep
//! in `fuzzers/local_sweep`.

pub mod config;
pub mod constants;
pub mod diff;
pub mod driver;
pub mod guard;
pub mod lazy_map;
pub mod log;
pub mod memory;
#[cfg(target_arch = "riscv64")]
pub mod native;
pub mod probe;
pub mod region;
pub mod registers;
pub mod retry;
pub mod sandbox;
pub mod session;
pub mod watchdog;
