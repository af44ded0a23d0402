//! This module defines constants used throughout the harness.
//! These constants cover the retry state machine, the lazily mapped region
//! table, the injected instruction template and the batch protocol.

use std::time::Duration;

/// Upper bound on sandbox executions per pass before the retry loop gives up.
pub const MAX_RETRIES: u32 = 20;

/// Number of lazily mapped regions tracked per case (`MAX_MAPPED_PAGES`).
pub const MAX_MAPPED_REGIONS: usize = 128;

/// Pages mapped per fault. Two pages cover accesses straddling a page boundary.
pub const PAGES_PER_FAULT: usize = 2;

/// How long a single sandbox execution may run before the watchdog fires.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1);

/// Sentinel fill byte of the first pass.
pub const FIRST_PASS_FILL: u8 = 0x00;

/// Sentinel fill byte of the second pass.
pub const SECOND_PASS_FILL: u8 = 0xFF;

/// `jalr x0, 0(x9)`: returns from the sandbox to the address held in `x9`.
pub const TRAMPOLINE_RETURN: u32 = 0x0004_8067;

/// `addi x0, x0, 0`, the word the candidate slot holds before injection.
pub const PLACEHOLDER_NOP: u32 = 0x0000_0013;

/// Size of the executable sandbox buffer in pages.
pub const SANDBOX_PAGES: usize = 1;

/// Usable stack handed to injected code (excluding the guard page).
pub const SANDBOX_STACK_SIZE: usize = 64 * 1024;

/// Size of the per-thread alternate signal stack.
pub const SIGNAL_STACK_SIZE: usize = 64 * 1024;

/// Default capacity of the log buffer flushed after every batch.
pub const LOG_BUFFER_CAPACITY: usize = 4096;

/// Largest `batch_size` a server may announce.
pub const MAX_BATCH_SIZE: u32 = 1 << 20;

/// Exclusive upper bound of user space addresses that may be lazily mapped.
/// Faults above it land in the kernel half and are never mappable.
pub const USER_SPACE_LIMIT: usize = 1 << 47;

/// Controller address used when none is configured.
pub const DEFAULT_SERVER: &str = "192.168.10.1:9000";

/// Client name announced during the handshake when none is configured.
pub const DEFAULT_CLIENT_NAME: &str = "beagle";
