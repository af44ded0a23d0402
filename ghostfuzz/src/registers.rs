//! RISC-V register files and the deltas between two snapshots.

use std::fmt;

/// ABI names of x0..x31.
pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

/// Integer and floating point registers, raw 64-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub x: [u64; 32],
    pub f: [u64; 32],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            x: [0; 32],
            f: [0; 32],
        }
    }
}

impl RegisterFile {
    /// Every integer register points into a distinct, normally unmapped,
    /// 64 KiB window of user space, so a stray access through any of them
    /// faults at a recognizable address. Float registers hold their index.
    pub fn unmapped_pattern() -> Self {
        let mut regs = Self::default();
        for i in 1..32 {
            regs.x[i] = 0x20_0000_0000 + (i as u64) * 0x1_0000;
            regs.f[i] = i as u64;
        }
        regs
    }

    /// Builds a register file from 64 random words: 32 integer, then 32 float.
    pub fn from_words(mut next: impl FnMut() -> u64) -> Self {
        let mut regs = Self::default();
        for i in 1..32 {
            regs.x[i] = next();
        }
        for f in regs.f.iter_mut() {
            *f = next();
        }
        regs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Integer,
    Float,
}

/// One register whose value differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDelta {
    pub kind: RegisterKind,
    pub index: usize,
    pub before: u64,
    pub after: u64,
}

impl fmt::Display for RegisterDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegisterKind::Integer => write!(
                f,
                "x{} ({}) changed: {:#018x} -> {:#018x}",
                self.index, ABI_NAMES[self.index], self.before, self.after
            ),
            RegisterKind::Float => {
                let name = format!("f{}", self.index);
                write!(f, "{name:<4} changed: {:#018x} -> {:#018x}", self.before, self.after)
            }
        }
    }
}

/// Lists the registers that differ, integer registers first. Integer
/// registers whose index is in `skip` are ignored.
pub fn diff(before: &RegisterFile, after: &RegisterFile, skip: &[usize]) -> Vec<RegisterDelta> {
    let ints = (0..32)
        .filter(|i| !skip.contains(i))
        .filter(|&i| before.x[i] != after.x[i])
        .map(|i| RegisterDelta {
            kind: RegisterKind::Integer,
            index: i,
            before: before.x[i],
            after: after.x[i],
        });
    let floats = (0..32).filter(|&i| before.f[i] != after.f[i]).map(|i| RegisterDelta {
        kind: RegisterKind::Float,
        index: i,
        before: before.f[i],
        after: after.f[i],
    });
    ints.chain(floats).collect()
}
