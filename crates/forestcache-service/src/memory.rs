//! Resident memory of the running process.
//!
//! The cache does not account for the size of the profiles it holds, since parsed call graphs have
//! irregular footprints that are expensive to estimate. Instead it watches the memory of the whole
//! process through a [`MemoryProbe`].

use std::fmt;
use std::sync::OnceLock;

/// Reports how much memory the process currently uses.
pub trait MemoryProbe: fmt::Debug + Send + Sync {
    /// Returns the current memory usage in bytes.
    ///
    /// Implementations return `0` when the usage cannot be determined. The cache treats that as
    /// "no pressure", so an unavailable probe never causes evictions.
    fn current_usage(&self) -> u64;

    /// Hands memory that was freed by dropped values back to the operating system.
    ///
    /// The cache calls this after every forced eviction, before it measures again. Allocators
    /// usually keep freed pages around for reuse, and the resident size only goes down once they
    /// are purged.
    fn reclaim(&self) {}
}

/// Reads the resident set size from `/proc/self/status`.
///
/// On platforms without procfs this always reports `0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    #[cfg(target_os = "linux")]
    fn current_usage(&self) -> u64 {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                report_once(|| {
                    tracing::debug!(error = %err, "failed to read /proc/self/status");
                });
                return 0;
            }
        };

        match parse_status(&status, "VmRSS:") {
            Some(bytes) => {
                metric!(gauge("process.memory") = bytes);
                bytes
            }
            None => {
                report_once(|| tracing::debug!("no usable VmRSS line in /proc/self/status"));
                0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn current_usage(&self) -> u64 {
        0
    }
}

/// Logs a probe failure only once, the probe runs on every cache insert.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn report_once(f: impl FnOnce()) {
    static REPORTED: OnceLock<()> = OnceLock::new();
    if REPORTED.set(()).is_ok() {
        f();
    }
}

/// Extracts a `Vm*` value in bytes from the contents of a procfs `status` file.
///
/// Lines look like `VmRSS:     9999 kB`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_status(status: &str, key: &str) -> Option<u64> {
    let line = status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(key))?;

    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let scale = match fields.next()? {
        "kB" | "KB" => 1024,
        "mB" | "MB" => 1024 * 1024,
        _ => return None,
    };
    Some(value.saturating_mul(scale))
}
