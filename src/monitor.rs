//! Host memory introspection.
//!
//! The worker throttle, the memory watchdog, and the adaptive rate
//! controller all consume the `MemoryProbe` trait; production wires in the
//! sysinfo-backed probe, tests a fixed one.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Source of resident/available memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size of this process, in bytes.
    fn resident_bytes(&self) -> u64;

    /// Memory still available to the host, in bytes.
    fn available_bytes(&self) -> u64;
}

/// Probe backed by the sysinfo crate.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn available_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Fixed readings, settable from tests.
#[derive(Default)]
pub struct FixedProbe {
    resident: AtomicU64,
    available: AtomicU64,
}

impl FixedProbe {
    pub fn new(resident: u64, available: u64) -> Self {
        Self {
            resident: AtomicU64::new(resident),
            available: AtomicU64::new(available),
        }
    }

    pub fn set_resident(&self, bytes: u64) {
        self.resident.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedProbe {
    fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::Relaxed)
    }

    fn available_bytes(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }
}

/// Latch the memory watchdog engages above the hard cap. While engaged,
/// every worker read-loop yields; intake effectively pauses until resident
/// memory falls back under the release threshold.
#[derive(Default)]
pub struct PressureLatch {
    engaged: AtomicBool,
}

impl PressureLatch {
    pub fn engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    fn set(&self, value: bool) {
        self.engaged.store(value, Ordering::Release);
    }
}

/// Spawn the watchdog. Engages the latch when resident memory exceeds
/// `hard_cap_bytes`; releases at 90% of the cap so the latch cannot
/// flap around the boundary.
pub fn spawn_memory_watchdog(
    probe: Arc<dyn MemoryProbe>,
    latch: Arc<PressureLatch>,
    hard_cap_bytes: u64,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let release_below = hard_cap_bytes - hard_cap_bytes / 10;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let resident = probe.resident_bytes();
            if resident > hard_cap_bytes {
                if !latch.engaged() {
                    warn!(
                        "Resident memory {} MiB over hard cap {} MiB; pausing intake",
                        resident / 1024 / 1024,
                        hard_cap_bytes / 1024 / 1024
                    );
                    latch.set(true);
                }
            } else if resident < release_below && latch.engaged() {
                info!(
                    "Resident memory back to {} MiB; resuming",
                    resident / 1024 / 1024
                );
                latch.set(false);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::new(100, 1000);
        assert_eq!(probe.resident_bytes(), 100);
        probe.set_resident(200);
        assert_eq!(probe.resident_bytes(), 200);
    }

    #[tokio::test]
    async fn test_watchdog_engages_and_releases() {
        let probe = Arc::new(FixedProbe::new(0, 0));
        let latch = Arc::new(PressureLatch::default());
        let handle = spawn_memory_watchdog(
            probe.clone(),
            latch.clone(),
            1000,
            Duration::from_millis(10),
        );

        probe.set_resident(2000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(latch.engaged());

        probe.set_resident(100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!latch.engaged());

        handle.abort();
    }

    #[test]
    fn test_sysinfo_probe_reports_something() {
        let probe = SysinfoProbe::new();
        // A running test binary has a nonzero RSS.
        assert!(probe.resident_bytes() > 0);
    }
}
