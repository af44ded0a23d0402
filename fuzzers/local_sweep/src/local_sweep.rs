//! Runs a list of instruction words without a controller and prints the log.
//!
//! `GHOSTFUZZ_SWEEP_WORDS` takes a comma separated list of hex words. Without
//! it, `GHOSTFUZZ_SWEEP_COUNT` random words are generated (default 16), from
//! `GHOSTFUZZ_SEED` if set. `GHOSTFUZZ_RANDOM_REGS=true` also randomizes the
//! initial register file of every case.

use anyhow::{Context, Result};
use libafl_bolts::current_nanos;
use libafl_bolts::rands::{Rand, StdRand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEFAULT_SWEEP_COUNT: usize = 16;

fn parse_words(list: &str) -> Result<Vec<u32>> {
    list.split(',')
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(|w| {
            let digits = w.trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(digits, 16).with_context(|| format!("invalid instruction word {w:?}"))
        })
        .collect()
}

fn random_words(rng: &mut StdRng, count: usize) -> Vec<u32> {
    (0..count).map(|_| rng.random::<u32>()).collect()
}

fn seeded_rng() -> Result<StdRng> {
    let seed = match std::env::var("GHOSTFUZZ_SEED") {
        Ok(raw) => raw.trim().parse().with_context(|| format!("invalid GHOSTFUZZ_SEED {raw:?}"))?,
        Err(_) => current_nanos(),
    };
    let mut rand = StdRand::with_seed(seed);
    Ok(StdRng::seed_from_u64(rand.next()))
}

fn sweep_words(rng: &mut StdRng) -> Result<Vec<u32>> {
    if let Ok(list) = std::env::var("GHOSTFUZZ_SWEEP_WORDS") {
        return parse_words(&list);
    }
    let count = match std::env::var("GHOSTFUZZ_SWEEP_COUNT") {
        Ok(raw) => raw.trim().parse().with_context(|| format!("invalid GHOSTFUZZ_SWEEP_COUNT {raw:?}"))?,
        Err(_) => DEFAULT_SWEEP_COUNT,
    };
    Ok(random_words(rng, count))
}

#[cfg(target_arch = "riscv64")]
fn main() -> Result<()> {
    use ghostfuzz::config::HarnessConfig;
    use ghostfuzz::driver::CaseDriver;
    use ghostfuzz::log::{LogBuffer, build_logger};
    use ghostfuzz::native::NativeEntry;
    use ghostfuzz::registers::RegisterFile;
    use slog::info;

    let config = HarnessConfig::from_env()?;
    let random_regs = std::env::var("GHOSTFUZZ_RANDOM_REGS").is_ok_and(|v| v.trim() == "true");
    let mut rng = seeded_rng()?;
    let words = sweep_words(&mut rng)?;

    let log = LogBuffer::new(config.log_capacity);
    let logger = build_logger(&log, config.echo_log);
    let mut driver = CaseDriver::new(NativeEntry::new()?, &config, logger.clone())?;
    info!(logger, "sweeping"; "count" => words.len(), "random_regs" => random_regs);

    let mut ghosts = 0;
    for (index, &word) in words.iter().enumerate() {
        if random_regs {
            driver.entry_mut().set_initial(RegisterFile::from_words(|| rng.random()));
        }
        ghosts += driver.run_case(index, word).ghost_writes().len();
        // Print per case: the buffer is bounded.
        print!("{}", log.take());
    }
    println!("{} cases, {ghosts} ghost writes", words.len());
    Ok(())
}

#[cfg(not(target_arch = "riscv64"))]
fn main() -> Result<()> {
    let mut rng = seeded_rng()?;
    let words = sweep_words(&mut rng)?;
    for word in &words {
        println!("{word:#010x}");
    }
    anyhow::bail!("local_sweep executes instructions natively and only runs on riscv64")
}
