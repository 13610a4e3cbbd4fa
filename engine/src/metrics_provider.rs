//! System metric sources
//!
//! The monitors never talk to the OS directly; they consult a
//! [`MetricsProvider`]. The production implementation is backed by
//! `sysinfo` plus procfs reads, with last-known-good fallbacks so a
//! failed read is never fatal. Tests use [`FakeMetrics`], which is
//! fully deterministic.

use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

use crate::error::{MetricsError, MetricsResult};

/// Point-in-time system health snapshot attached to crash reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage_pct: f64,
    pub memory_used_bytes: u64,
    pub disk_usage_pct: f64,
    pub active_threads: u64,
    pub open_file_descriptors: u64,
    pub network_reachable: bool,
}

/// Stateless (from the caller's view) queries for current system metrics
///
/// Implementations must be cheap, must never block beyond a bounded
/// OS-call timeout, and must not error outward: a failed read returns
/// the last-known-good value.
pub trait MetricsProvider: Send + Sync {
    /// Global CPU usage as a percentage (0-100)
    fn cpu_usage(&self) -> f64;

    /// Used memory as a percentage of total (0-100)
    fn memory_usage_pct(&self) -> f64;

    /// Used memory in bytes
    fn memory_used_bytes(&self) -> u64;

    /// Disk usage across mounted disks as a percentage (0-100)
    fn disk_usage_pct(&self) -> f64;

    /// Approximate disk I/O operations per second
    fn disk_iops(&self) -> f64;

    /// Threads in the current process
    fn active_threads(&self) -> u64;

    /// Open file descriptors in the current process
    fn open_file_descriptors(&self) -> u64;

    /// Whether the network probe target is reachable
    fn network_reachable(&self) -> bool;

    /// Latency of the last network probe in milliseconds
    fn network_latency_ms(&self) -> f64;

    /// Bounded responsiveness measurement of the engine's own
    /// scheduling context
    fn response_probe(&self) -> Duration;

    /// Convenience snapshot of everything above
    fn snapshot(&self) -> SystemState {
        SystemState {
            timestamp: Utc::now(),
            cpu_usage: self.cpu_usage(),
            memory_usage_pct: self.memory_usage_pct(),
            memory_used_bytes: self.memory_used_bytes(),
            disk_usage_pct: self.disk_usage_pct(),
            active_threads: self.active_threads(),
            open_file_descriptors: self.open_file_descriptors(),
            network_reachable: self.network_reachable(),
        }
    }
}

/// Timeout for the TCP reachability probe
const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Well-known probe target (public DNS)
const NETWORK_PROBE_ADDR: &str = "1.1.1.1:53";

/// Upper bound on the responsiveness probe
const RESPONSE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct ProviderState {
    system: System,
    disks: Disks,
    last_cpu: f64,
    last_threads: u64,
    last_fds: u64,
    last_latency_ms: f64,
    last_reachable: bool,
    last_network_probe: Option<Instant>,
}

/// `sysinfo`-backed metrics provider
///
/// The network probe result is cached between calls so that back-to-back
/// queries from the watchdog and the performance tracker do not each pay
/// the probe timeout.
pub struct SystemMetricsProvider {
    state: Mutex<ProviderState>,
}

impl SystemMetricsProvider {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            state: Mutex::new(ProviderState {
                system,
                disks: Disks::new_with_refreshed_list(),
                last_cpu: 0.0,
                last_threads: 1,
                last_fds: 0,
                last_latency_ms: 0.0,
                last_reachable: true,
                last_network_probe: None,
            }),
        }
    }

    fn count_proc_entries(metric: &'static str, path: &str) -> MetricsResult<u64> {
        let entries = fs::read_dir(path).map_err(|e| MetricsError::ReadFailed {
            metric: metric.to_string(),
            reason: e.to_string(),
        })?;
        Ok(entries.count() as u64)
    }

    fn probe_network(state: &mut ProviderState) {
        // Re-probe at most every 5s.
        if let Some(last) = state.last_network_probe {
            if last.elapsed() < Duration::from_secs(5) {
                return;
            }
        }
        state.last_network_probe = Some(Instant::now());

        let addr: SocketAddr = match NETWORK_PROBE_ADDR.parse() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let started = Instant::now();
        match TcpStream::connect_timeout(&addr, NETWORK_PROBE_TIMEOUT) {
            Ok(_) => {
                state.last_reachable = true;
                state.last_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            }
            Err(e) => {
                debug!("network probe failed: {}", e);
                state.last_reachable = false;
                state.last_latency_ms = NETWORK_PROBE_TIMEOUT.as_secs_f64() * 1000.0;
            }
        }
    }
}

impl Default for SystemMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for SystemMetricsProvider {
    fn cpu_usage(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.system.refresh_cpu();
        let usage = state.system.global_cpu_info().cpu_usage() as f64;
        if usage.is_finite() {
            state.last_cpu = usage;
        }
        state.last_cpu
    }

    fn memory_usage_pct(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.system.refresh_memory();
        let total = state.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (state.system.used_memory() as f64 / total as f64) * 100.0
    }

    fn memory_used_bytes(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.system.refresh_memory();
        state.system.used_memory()
    }

    fn disk_usage_pct(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.disks.refresh();
        let (total, available) = state
            .disks
            .iter()
            .fold((0u64, 0u64), |(t, a), disk| {
                (t + disk.total_space(), a + disk.available_space())
            });
        if total == 0 {
            debug!(
                "{}",
                MetricsError::SourceUnavailable { name: "disks".to_string() }
            );
            return 0.0;
        }
        ((total - available) as f64 / total as f64) * 100.0
    }

    fn disk_iops(&self) -> f64 {
        // sysinfo exposes no per-interval IOPS figure; report none
        // rather than a fabricated value.
        0.0
    }

    fn active_threads(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        match Self::count_proc_entries("active_threads", "/proc/self/task") {
            Ok(count) => {
                state.last_threads = count;
                count
            }
            Err(e) => {
                debug!("{}, using last-known value", e);
                state.last_threads
            }
        }
    }

    fn open_file_descriptors(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        match Self::count_proc_entries("open_file_descriptors", "/proc/self/fd") {
            Ok(count) => {
                state.last_fds = count;
                count
            }
            Err(e) => {
                debug!("{}, using last-known value", e);
                state.last_fds
            }
        }
    }

    fn network_reachable(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::probe_network(&mut state);
        state.last_reachable
    }

    fn network_latency_ms(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        Self::probe_network(&mut state);
        state.last_latency_ms
    }

    fn response_probe(&self) -> Duration {
        // Time how long it takes to get scheduled on a fresh thread and
        // back. Under a hung or saturated process this grows without
        // bound, which is exactly the signal the hang check wants.
        let started = Instant::now();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(());
        });
        if rx.recv_timeout(RESPONSE_PROBE_TIMEOUT).is_err() {
            warn!(
                "{}",
                MetricsError::ProbeTimeout {
                    timeout_ms: RESPONSE_PROBE_TIMEOUT.as_millis() as u64,
                }
            );
        }
        started.elapsed()
    }
}

/// Deterministic metrics provider for tests
///
/// All fields are plain settable values; no OS calls are made.
#[derive(Debug)]
pub struct FakeMetrics {
    inner: Mutex<FakeValues>,
}

#[derive(Debug, Clone)]
struct FakeValues {
    cpu_usage: f64,
    memory_usage_pct: f64,
    memory_used_bytes: u64,
    disk_usage_pct: f64,
    disk_iops: f64,
    active_threads: u64,
    open_file_descriptors: u64,
    network_reachable: bool,
    network_latency_ms: f64,
    response_time: Duration,
}

impl Default for FakeValues {
    fn default() -> Self {
        Self {
            cpu_usage: 10.0,
            memory_usage_pct: 40.0,
            memory_used_bytes: 512 * 1024 * 1024,
            disk_usage_pct: 50.0,
            disk_iops: 100.0,
            active_threads: 20,
            open_file_descriptors: 64,
            network_reachable: true,
            network_latency_ms: 20.0,
            response_time: Duration::from_millis(5),
        }
    }
}

impl FakeMetrics {
    pub fn healthy() -> Self {
        Self { inner: Mutex::new(FakeValues::default()) }
    }

    pub fn set_cpu_usage(&self, value: f64) {
        self.inner.lock().unwrap().cpu_usage = value;
    }

    pub fn set_memory_usage_pct(&self, value: f64) {
        self.inner.lock().unwrap().memory_usage_pct = value;
    }

    pub fn set_disk_usage_pct(&self, value: f64) {
        self.inner.lock().unwrap().disk_usage_pct = value;
    }

    pub fn set_active_threads(&self, value: u64) {
        self.inner.lock().unwrap().active_threads = value;
    }

    pub fn set_open_file_descriptors(&self, value: u64) {
        self.inner.lock().unwrap().open_file_descriptors = value;
    }

    pub fn set_network_reachable(&self, value: bool) {
        self.inner.lock().unwrap().network_reachable = value;
    }

    pub fn set_network_latency_ms(&self, value: f64) {
        self.inner.lock().unwrap().network_latency_ms = value;
    }

    pub fn set_response_time(&self, value: Duration) {
        self.inner.lock().unwrap().response_time = value;
    }
}

impl MetricsProvider for FakeMetrics {
    fn cpu_usage(&self) -> f64 {
        self.inner.lock().unwrap().cpu_usage
    }

    fn memory_usage_pct(&self) -> f64 {
        self.inner.lock().unwrap().memory_usage_pct
    }

    fn memory_used_bytes(&self) -> u64 {
        self.inner.lock().unwrap().memory_used_bytes
    }

    fn disk_usage_pct(&self) -> f64 {
        self.inner.lock().unwrap().disk_usage_pct
    }

    fn disk_iops(&self) -> f64 {
        self.inner.lock().unwrap().disk_iops
    }

    fn active_threads(&self) -> u64 {
        self.inner.lock().unwrap().active_threads
    }

    fn open_file_descriptors(&self) -> u64 {
        self.inner.lock().unwrap().open_file_descriptors
    }

    fn network_reachable(&self) -> bool {
        self.inner.lock().unwrap().network_reachable
    }

    fn network_latency_ms(&self) -> f64 {
        self.inner.lock().unwrap().network_latency_ms
    }

    fn response_probe(&self) -> Duration {
        self.inner.lock().unwrap().response_time
    }
}
