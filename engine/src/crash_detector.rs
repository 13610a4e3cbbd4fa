//! Crash detection: fast health-check loop plus slower watchdog
//!
//! The health-check loop (default 1s) runs three independent checks:
//! hang detection, resource exhaustion, and memory integrity. The
//! watchdog (default 10s) covers CPU, memory, disk, and network
//! issues. Every check is idempotent per tick and emits at most one
//! event onto the bus.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CrashDetectionConfig, MemoryMonitoringConfig};
use crate::events::{CrashContext, CrashEvent, CrashKind, EventBus, MonitorEvent, Severity};
use crate::metrics_provider::MetricsProvider;

/// Watchdog CPU ceiling in percent
const WATCHDOG_CPU_PCT: f64 = 90.0;

/// Watchdog disk usage ceiling in percent
const WATCHDOG_DISK_PCT: f64 = 90.0;

/// Detects hangs, resource exhaustion, and memory integrity problems
pub struct CrashDetector {
    config: CrashDetectionConfig,
    memory_config: MemoryMonitoringConfig,
    provider: Arc<dyn MetricsProvider>,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CrashDetector {
    pub fn new(
        config: CrashDetectionConfig,
        memory_config: MemoryMonitoringConfig,
        provider: Arc<dyn MetricsProvider>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            memory_config,
            provider,
            bus,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Start the health-check and watchdog loops. Idempotent.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            debug!("crash detector already running");
            return;
        }
        self.cancel = CancellationToken::new();
        info!(
            check_interval_secs = self.config.check_interval_secs,
            watchdog_interval_secs = self.config.watchdog_interval_secs,
            "starting crash detector"
        );

        self.tasks.push(spawn_health_loop(
            self.config.clone(),
            self.memory_config.clone(),
            self.provider.clone(),
            self.bus.clone(),
            self.cancel.clone(),
        ));
        self.tasks.push(spawn_watchdog_loop(
            self.config.clone(),
            self.memory_config.clone(),
            self.provider.clone(),
            self.bus.clone(),
            self.cancel.clone(),
        ));
    }

    /// Stop both loops; on return no further events are emitted. Idempotent.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("crash detector task join failed: {}", e);
            }
        }
        info!("crash detector stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }
}

fn spawn_health_loop(
    config: CrashDetectionConfig,
    memory_config: MemoryMonitoringConfig,
    provider: Arc<dyn MetricsProvider>,
    bus: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for event in health_check_tick(&config, &memory_config, provider.as_ref()) {
                        bus.publish(MonitorEvent::Crash(event));
                    }
                }
            }
        }
    })
}

fn spawn_watchdog_loop(
    config: CrashDetectionConfig,
    memory_config: MemoryMonitoringConfig,
    provider: Arc<dyn MetricsProvider>,
    bus: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.watchdog_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for event in watchdog_tick(&memory_config, provider.as_ref()) {
                        bus.publish(MonitorEvent::Crash(event));
                    }
                }
            }
        }
    })
}

/// Run the three fast health checks; each yields at most one event.
pub fn health_check_tick(
    config: &CrashDetectionConfig,
    memory_config: &MemoryMonitoringConfig,
    provider: &dyn MetricsProvider,
) -> Vec<CrashEvent> {
    let mut events = Vec::new();
    if let Some(event) = hang_check(config, provider) {
        events.push(event);
    }
    if let Some(event) = resource_exhaustion_check(config, provider) {
        events.push(event);
    }
    if let Some(event) = memory_integrity_check(config, memory_config, provider) {
        events.push(event);
    }
    events
}

/// Hang detection: responsiveness probe against the configured limit
fn hang_check(config: &CrashDetectionConfig, provider: &dyn MetricsProvider) -> Option<CrashEvent> {
    let response = provider.response_probe();
    let response_secs = response.as_secs_f64();
    if response_secs <= config.hang_threshold_secs {
        return None;
    }
    warn!(response_secs, "main loop unresponsive");
    Some(
        CrashEvent::new(
            CrashKind::ApplicationHang,
            Severity::High,
            CrashContext::new("crash_detector", "hang_check")
                .with_thread_info(format!("probe round-trip {:.3}s", response_secs)),
        )
        .with_metadata("response_secs", format!("{:.3}", response_secs)),
    )
}

/// Resource exhaustion: file descriptors take precedence over threads
fn resource_exhaustion_check(
    config: &CrashDetectionConfig,
    provider: &dyn MetricsProvider,
) -> Option<CrashEvent> {
    let fds = provider.open_file_descriptors();
    if fds > config.max_file_descriptors {
        warn!(fds, limit = config.max_file_descriptors, "file descriptor exhaustion");
        return Some(
            CrashEvent::new(
                CrashKind::SystemResourceExhaustion,
                Severity::Critical,
                CrashContext::new("crash_detector", "resource_exhaustion_check"),
            )
            .with_metadata("open_file_descriptors", fds.to_string()),
        );
    }

    let threads = provider.active_threads();
    if threads > config.max_threads {
        warn!(threads, limit = config.max_threads, "thread exhaustion");
        return Some(
            CrashEvent::new(
                CrashKind::SystemResourceExhaustion,
                Severity::High,
                CrashContext::new("crash_detector", "resource_exhaustion_check")
                    .with_thread_info(format!("{} active threads", threads)),
            )
            .with_metadata("active_threads", threads.to_string()),
        );
    }
    None
}

/// Memory integrity: a scored check over current memory figures
fn memory_integrity_check(
    config: &CrashDetectionConfig,
    memory_config: &MemoryMonitoringConfig,
    provider: &dyn MetricsProvider,
) -> Option<CrashEvent> {
    let usage_pct = provider.memory_usage_pct();
    let score = integrity_score(usage_pct, memory_config);
    if score >= config.min_integrity_score {
        return None;
    }
    warn!(score, usage_pct, "memory integrity score below floor");
    Some(
        CrashEvent::new(
            CrashKind::DataCorruption,
            Severity::Critical,
            CrashContext::new("crash_detector", "memory_integrity_check").with_memory_snapshot(
                format!("{} bytes used ({:.1}%)", provider.memory_used_bytes(), usage_pct),
            ),
        )
        .with_metadata("integrity_score", format!("{:.2}", score)),
    )
}

/// Pure scoring function over memory pressure; 1.0 is pristine.
pub fn integrity_score(memory_usage_pct: f64, memory_config: &MemoryMonitoringConfig) -> f64 {
    let mut score: f64 = 1.0;
    if memory_usage_pct >= 99.0 {
        score -= 0.5;
    } else if memory_usage_pct >= memory_config.critical_pct {
        score -= 0.25;
    } else if memory_usage_pct >= memory_config.warning_pct {
        score -= 0.1;
    }
    score.max(0.0)
}

/// Run the watchdog checks; each yields at most one event.
pub fn watchdog_tick(
    memory_config: &MemoryMonitoringConfig,
    provider: &dyn MetricsProvider,
) -> Vec<CrashEvent> {
    let mut events = Vec::new();

    let cpu = provider.cpu_usage();
    if cpu > WATCHDOG_CPU_PCT {
        events.push(
            CrashEvent::new(
                CrashKind::PerformanceDegradation,
                Severity::High,
                CrashContext::new("watchdog", "cpu_check"),
            )
            .with_metadata("cpu_usage", format!("{:.1}", cpu)),
        );
    }

    let memory = provider.memory_usage_pct();
    if memory > memory_config.warning_pct {
        events.push(
            CrashEvent::new(
                CrashKind::MemoryPressure,
                Severity::High,
                CrashContext::new("watchdog", "memory_check").with_memory_snapshot(format!(
                    "{} bytes used ({:.1}%)",
                    provider.memory_used_bytes(),
                    memory
                )),
            )
            .with_metadata("memory_usage_pct", format!("{:.1}", memory)),
        );
    }

    let disk = provider.disk_usage_pct();
    if disk > WATCHDOG_DISK_PCT {
        events.push(
            CrashEvent::new(
                CrashKind::SystemResourceExhaustion,
                Severity::High,
                CrashContext::new("watchdog", "disk_check"),
            )
            .with_metadata("disk_usage_pct", format!("{:.1}", disk)),
        );
    }

    if !provider.network_reachable() {
        events.push(
            CrashEvent::new(
                CrashKind::NetworkFailure,
                Severity::Medium,
                CrashContext::new("watchdog", "network_check"),
            )
            .with_metadata("latency_ms", format!("{:.0}", provider.network_latency_ms())),
        );
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::metrics_provider::FakeMetrics;
    use std::time::Duration;

    fn configs() -> (CrashDetectionConfig, MemoryMonitoringConfig) {
        let config = MonitoringConfig::default();
        (config.crash_detection, config.memory_monitoring)
    }

    #[test]
    fn test_healthy_system_produces_no_events() {
        let (config, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        assert!(health_check_tick(&config, &memory_config, &fake).is_empty());
        assert!(watchdog_tick(&memory_config, &fake).is_empty());
    }

    #[test]
    fn test_hang_detection() {
        let (config, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        fake.set_response_time(Duration::from_secs(6));

        let events = health_check_tick(&config, &memory_config, &fake);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrashKind::ApplicationHang);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn test_fd_exhaustion_outranks_thread_exhaustion() {
        let (config, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        fake.set_open_file_descriptors(9000);
        fake.set_active_threads(600);

        let events = health_check_tick(&config, &memory_config, &fake);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrashKind::SystemResourceExhaustion);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn test_thread_exhaustion_is_high() {
        let (config, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        fake.set_active_threads(501);

        let events = health_check_tick(&config, &memory_config, &fake);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn test_integrity_score_bands() {
        let (_, memory_config) = configs();
        assert_eq!(integrity_score(50.0, &memory_config), 1.0);
        assert!(integrity_score(86.0, &memory_config) >= 0.8);
        assert!(integrity_score(96.0, &memory_config) < 0.8);
        assert!(integrity_score(99.5, &memory_config) < 0.8);
    }

    #[test]
    fn test_memory_corruption_event() {
        let (config, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        fake.set_memory_usage_pct(97.0);

        let events = health_check_tick(&config, &memory_config, &fake);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrashKind::DataCorruption);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn test_watchdog_detects_all_four_conditions() {
        let (_, memory_config) = configs();
        let fake = FakeMetrics::healthy();
        fake.set_cpu_usage(95.0);
        fake.set_memory_usage_pct(90.0);
        fake.set_disk_usage_pct(95.0);
        fake.set_network_reachable(false);

        let events = watchdog_tick(&memory_config, &fake);
        assert_eq!(events.len(), 4);

        let kinds: Vec<CrashKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&CrashKind::PerformanceDegradation));
        assert!(kinds.contains(&CrashKind::MemoryPressure));
        assert!(kinds.contains(&CrashKind::SystemResourceExhaustion));
        assert!(kinds.contains(&CrashKind::NetworkFailure));

        let network = events.iter().find(|e| e.kind == CrashKind::NetworkFailure).unwrap();
        assert_eq!(network.severity, Severity::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_lifecycle() {
        let (config, memory_config) = configs();
        let fake = Arc::new(FakeMetrics::healthy());
        fake.set_open_file_descriptors(9000);

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut detector = CrashDetector::new(config, memory_config, fake.clone(), bus);

        detector.start();
        detector.start(); // second start is a no-op
        assert!(detector.is_running());

        tokio::time::advance(Duration::from_millis(1100)).await;
        // At least the immediate tick plus one interval worth of events.
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, MonitorEvent::Crash(_)));

        detector.stop().await;
        detector.stop().await; // second stop is a no-op
        assert!(!detector.is_running());

        // Drain anything emitted before the stop, then verify silence.
        while rx.try_recv().is_ok() {}
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
