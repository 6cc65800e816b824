//! CPU and memory sizing clamped to hypervisor-declared bounds.

use std::num::NonZeroUsize;

/// One GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Memory requested for the guest before clamping (4 GiB).
pub const PREFERRED_MEMORY: u64 = 4 * GIB;

/// Resource bounds declared by the hypervisor. All ranges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Limits {
    /// Fewest vCPUs a guest may have.
    pub min_cpus: usize,
    /// Most vCPUs a guest may have.
    pub max_cpus: usize,
    /// Smallest guest memory size in bytes.
    pub min_memory: u64,
    /// Largest guest memory size in bytes.
    pub max_memory: u64,
}

impl Limits {
    /// Creates a set of inclusive bounds.
    pub const fn new(min_cpus: usize, max_cpus: usize, min_memory: u64, max_memory: u64) -> Self {
        Self {
            min_cpus,
            max_cpus,
            min_memory,
            max_memory,
        }
    }
}

/// Returns the vCPU count for a host with `host_cores` logical cores.
///
/// One core is left to the host; the result is raised to `min_cpus` and
/// then capped at `max_cpus`.
pub fn cpu_count(host_cores: usize, limits: &Limits) -> usize {
    let wanted = if host_cores <= 1 { 1 } else { host_cores - 1 };
    wanted.max(limits.min_cpus).min(limits.max_cpus)
}

/// Returns the guest memory size in bytes: 4 GiB, clamped to the bounds.
pub fn memory_size(limits: &Limits) -> u64 {
    PREFERRED_MEMORY.max(limits.min_memory).min(limits.max_memory)
}

/// Number of logical cores on this host, or 1 when it cannot be determined.
pub fn host_cores() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
