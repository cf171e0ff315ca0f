//! Memory pressure probe
//!
//! Large payload reads and write-buffer growth consult this module before
//! allocating. The probe degrades gracefully: where free-memory accounting is
//! unavailable, everything is reported as fitting and only the buffer caps
//! bound memory use.

/// Headroom kept free beyond any single allocation request
pub const RESERVE: u64 = 1024 * 1024;

/// Fraction of total memory under which the system counts as short on memory
const SHORT_FRACTION: u64 = 10;

/// Bytes of memory estimated to be available for allocation.
///
/// Returns `u64::MAX` when the platform gives no answer, so callers that guard
/// with `available() < needed` never refuse spuriously.
pub fn available() -> u64 {
    read_meminfo_kb("MemAvailable:")
        .map(|kb| kb * 1024)
        .unwrap_or(u64::MAX)
}

/// Whether the process should stop growing caches and flush instead.
pub fn short_status() -> bool {
    match (read_meminfo_kb("MemAvailable:"), read_meminfo_kb("MemTotal:")) {
        (Some(avail), Some(total)) if total > 0 => avail < total / SHORT_FRACTION,
        _ => false,
    }
}

/// Guard for a single allocation of `needed` bytes plus reserve.
pub fn request(needed: u64) -> bool {
    available() >= needed.saturating_add(RESERVE)
}

#[cfg(target_os = "linux")]
fn read_meminfo_kb(field: &str) -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            let kb = rest.trim().trim_end_matches(" kB").trim();
            return kb.parse().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo_kb(_field: &str) -> Option<u64> {
    None
}
