//! Connects to the controller, runs every batch it sends on this CPU and
//! returns the collected log after each one.
//!
//! Configured through `GHOSTFUZZ_*` environment variables, see
//! `ghostfuzz::config::HarnessConfig`.

use anyhow::Result;
use ghostfuzz::config::HarnessConfig;

#[cfg(target_arch = "riscv64")]
fn main() -> Result<()> {
    use std::net::TcpStream;

    use anyhow::Context;
    use ghostfuzz::driver::CaseDriver;
    use ghostfuzz::log::{LogBuffer, build_logger};
    use ghostfuzz::native::NativeEntry;
    use ghostfuzz::session::run_session;
    use slog::info;

    let config = HarnessConfig::from_env()?;
    let log = LogBuffer::new(config.log_capacity);
    let logger = build_logger(&log, config.echo_log);

    let mut driver = CaseDriver::new(NativeEntry::new()?, &config, logger.clone())?;
    info!(logger, "sandbox ready"; "sandbox" => format!("{:#x}", driver.sandbox().entry_address()));

    let mut stream =
        TcpStream::connect(&config.server).with_context(|| format!("connecting to {}", config.server))?;
    info!(logger, "connected"; "server" => &config.server, "name" => &config.client_name);
    let summary = run_session(&mut stream, &config.client_name, config.max_batch, &mut driver, &log, &logger)?;
    info!(logger, "Done"; "batches" => summary.batches, "instructions" => summary.instructions);
    Ok(())
}

#[cfg(not(target_arch = "riscv64"))]
fn main() -> Result<()> {
    let config = HarnessConfig::from_env()?;
    anyhow::bail!(
        "batch_client executes instructions natively and only runs on riscv64 (server {})",
        config.server
    )
}
