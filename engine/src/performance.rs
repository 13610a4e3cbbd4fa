//! Performance tracking
//!
//! Periodically snapshots system performance into a bounded rolling
//! window and evaluates three layers of analysis: instantaneous
//! threshold breaches, short-window trend, and sustained degradation
//! against a baseline. Also exposes named operation timers for
//! arbitrary caller-defined work.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PerformanceTrackingConfig;
use crate::events::{
    EventBus, MonitorEvent, PerformanceEvent, PerformanceMetricKind, PerformanceTrend, Severity,
};
use crate::metrics_provider::MetricsProvider;

/// Number of points the trend evaluation looks back over
const TREND_WINDOW: usize = 5;

/// Number of points in each degradation comparison window
const DEGRADATION_WINDOW: usize = 10;

/// A single performance snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage_pct: f64,
    pub disk_iops: f64,
    pub network_latency_ms: f64,
    pub active_threads: u64,
    pub response_time_ms: f64,
    /// Operations per second; 0.0 means no throughput signal yet
    pub throughput: f64,
}

struct TrackerState {
    history: VecDeque<PerformanceMetrics>,
    trend: PerformanceTrend,
    degradation_active: bool,
    operations: HashMap<String, Instant>,
    ops_completed: u64,
    last_tick: Option<Instant>,
}

/// Rolling-window performance analyzer
pub struct PerformanceTracker {
    config: PerformanceTrackingConfig,
    provider: Arc<dyn MetricsProvider>,
    bus: EventBus,
    state: Arc<RwLock<TrackerState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PerformanceTracker {
    pub fn new(
        config: PerformanceTrackingConfig,
        provider: Arc<dyn MetricsProvider>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            provider,
            bus,
            state: Arc::new(RwLock::new(TrackerState {
                history: VecDeque::new(),
                trend: PerformanceTrend::Stable,
                degradation_active: false,
                operations: HashMap::new(),
                ops_completed: 0,
                last_tick: None,
            })),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the snapshot loop. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            debug!("performance tracker already running");
            return;
        }
        self.cancel = CancellationToken::new();
        info!(interval_secs = self.config.interval_secs, "starting performance tracker");

        let config = self.config.clone();
        let provider = self.provider.clone();
        let bus = self.bus.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = collect_sample(&config, provider.as_ref(), &state);
                        let events = observe_sample(&config, &state, sample);
                        for event in events {
                            bus.publish(MonitorEvent::Performance(event));
                        }
                    }
                }
            }
        }));
    }

    /// Stop the loop; on return no further events are emitted. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!("performance tracker task join failed: {}", e);
        }
        info!("performance tracker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Feed a pre-built sample through the full evaluation pipeline.
    ///
    /// The periodic loop uses the same path; this is also the seam a
    /// host application or test can push synthetic samples through.
    pub fn ingest_sample(&self, sample: PerformanceMetrics) -> Vec<PerformanceEvent> {
        let events = observe_sample(&self.config, &self.state, sample);
        for event in &events {
            self.bus.publish(MonitorEvent::Performance(event.clone()));
        }
        events
    }

    /// Begin timing a named operation
    pub fn start_operation(&self, name: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        state.operations.insert(name.into(), Instant::now());
    }

    /// Finish a named operation, emitting a medium event when it ran
    /// past the response-time threshold. Unknown names are a no-op.
    pub fn finish_operation(&self, name: &str) -> Option<Duration> {
        let started = {
            let mut state = self.state.write().unwrap();
            let started = state.operations.remove(name)?;
            state.ops_completed += 1;
            started
        };
        let elapsed = started.elapsed();
        let threshold = Duration::from_secs_f64(self.config.response_time_threshold_secs);
        if elapsed > threshold {
            warn!(operation = name, elapsed_ms = elapsed.as_millis() as u64, "slow operation");
            let event = PerformanceEvent::new(
                PerformanceMetricKind::OperationDuration,
                elapsed.as_secs_f64() * 1000.0,
                threshold.as_secs_f64() * 1000.0,
                Severity::Medium,
                format!("operation '{}' took {:.2}s", name, elapsed.as_secs_f64()),
            );
            self.bus.publish(MonitorEvent::Performance(event));
        }
        Some(elapsed)
    }

    /// Current trend over the recent window
    pub fn trend(&self) -> PerformanceTrend {
        self.state.read().unwrap().trend
    }

    /// Most recent snapshot, if any
    pub fn current_metrics(&self) -> Option<PerformanceMetrics> {
        self.state.read().unwrap().history.back().cloned()
    }

    /// Retained history length
    pub fn history_len(&self) -> usize {
        self.state.read().unwrap().history.len()
    }
}

fn collect_sample(
    config: &PerformanceTrackingConfig,
    provider: &dyn MetricsProvider,
    state: &Arc<RwLock<TrackerState>>,
) -> PerformanceMetrics {
    let now = Instant::now();
    let (ops_completed, elapsed) = {
        let mut state = state.write().unwrap();
        let elapsed = state
            .last_tick
            .map(|t| now.duration_since(t))
            .unwrap_or_else(|| config.interval());
        state.last_tick = Some(now);
        let ops = state.ops_completed;
        state.ops_completed = 0;
        (ops, elapsed)
    };
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        ops_completed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    PerformanceMetrics {
        timestamp: Utc::now(),
        cpu_usage: provider.cpu_usage(),
        memory_usage_pct: provider.memory_usage_pct(),
        disk_iops: provider.disk_iops(),
        network_latency_ms: provider.network_latency_ms(),
        active_threads: provider.active_threads(),
        response_time_ms: provider.response_probe().as_secs_f64() * 1000.0,
        throughput,
    }
}

fn observe_sample(
    config: &PerformanceTrackingConfig,
    state: &Arc<RwLock<TrackerState>>,
    sample: PerformanceMetrics,
) -> Vec<PerformanceEvent> {
    let mut events = evaluate_thresholds(config, &sample);

    let mut state = state.write().unwrap();
    state.history.push_back(sample);
    while state.history.len() > config.history_limit {
        state.history.pop_front();
    }

    state.trend = evaluate_trend(&state.history);

    if let Some(degradation) = evaluate_degradation(&state.history) {
        // Fire once per episode; re-arm only after the condition clears.
        if !state.degradation_active {
            state.degradation_active = true;
            events.push(degradation);
        }
    } else {
        state.degradation_active = false;
    }

    let trend = state.trend;
    for event in &mut events {
        event.trend = trend;
    }
    events
}

/// Instantaneous threshold evaluation; severity scales with the breach ratio.
fn evaluate_thresholds(
    config: &PerformanceTrackingConfig,
    sample: &PerformanceMetrics,
) -> Vec<PerformanceEvent> {
    let mut events = Vec::new();

    if sample.cpu_usage >= config.cpu_threshold_pct {
        let ratio = sample.cpu_usage / config.cpu_threshold_pct;
        events.push(PerformanceEvent::new(
            PerformanceMetricKind::CpuUsage,
            sample.cpu_usage,
            config.cpu_threshold_pct,
            Severity::from_threshold_ratio(ratio),
            format!("CPU usage {:.1}% at or above {:.1}%", sample.cpu_usage, config.cpu_threshold_pct),
        ));
    }

    let response_threshold_ms = config.response_time_threshold_secs * 1000.0;
    if sample.response_time_ms >= response_threshold_ms {
        let ratio = sample.response_time_ms / response_threshold_ms;
        events.push(PerformanceEvent::new(
            PerformanceMetricKind::ResponseTime,
            sample.response_time_ms,
            response_threshold_ms,
            Severity::from_threshold_ratio(ratio),
            format!("response time {:.0}ms at or above {:.0}ms", sample.response_time_ms, response_threshold_ms),
        ));
    }

    if sample.active_threads > config.thread_threshold {
        let ratio = sample.active_threads as f64 / config.thread_threshold as f64;
        events.push(PerformanceEvent::new(
            PerformanceMetricKind::ActiveThreads,
            sample.active_threads as f64,
            config.thread_threshold as f64,
            Severity::from_threshold_ratio(ratio),
            format!("{} active threads above {}", sample.active_threads, config.thread_threshold),
        ));
    }

    if sample.network_latency_ms > config.network_latency_threshold_ms {
        let ratio = sample.network_latency_ms / config.network_latency_threshold_ms;
        events.push(PerformanceEvent::new(
            PerformanceMetricKind::NetworkLatency,
            sample.network_latency_ms,
            config.network_latency_threshold_ms,
            Severity::from_threshold_ratio(ratio),
            format!("network latency {:.0}ms above {:.0}ms", sample.network_latency_ms, config.network_latency_threshold_ms),
        ));
    }

    // throughput == 0.0 means no signal, not zero work; skip it.
    if sample.throughput > 0.0 && sample.throughput < config.min_throughput_ops {
        let ratio = config.min_throughput_ops / sample.throughput;
        events.push(PerformanceEvent::new(
            PerformanceMetricKind::Throughput,
            sample.throughput,
            config.min_throughput_ops,
            Severity::from_threshold_ratio(ratio),
            format!("throughput {:.1} ops/s below {:.1} ops/s", sample.throughput, config.min_throughput_ops),
        ));
    }

    events
}

/// Trend over the last [`TREND_WINDOW`] points
fn evaluate_trend(history: &VecDeque<PerformanceMetrics>) -> PerformanceTrend {
    if history.len() < TREND_WINDOW {
        return PerformanceTrend::Stable;
    }
    let window: Vec<&PerformanceMetrics> =
        history.iter().skip(history.len() - TREND_WINDOW).collect();
    let first = window.first().unwrap();
    let last = window.last().unwrap();

    let cpu_delta = last.cpu_usage - first.cpu_usage;
    let response_delta_ms = last.response_time_ms - first.response_time_ms;

    if cpu_delta > 20.0 || response_delta_ms > 2000.0 {
        PerformanceTrend::Degrading
    } else if cpu_delta < -10.0 && response_delta_ms < -500.0 {
        PerformanceTrend::Improving
    } else {
        PerformanceTrend::Stable
    }
}

/// Sustained degradation: most recent window against the earliest
/// retained window.
fn evaluate_degradation(history: &VecDeque<PerformanceMetrics>) -> Option<PerformanceEvent> {
    if history.len() < DEGRADATION_WINDOW {
        return None;
    }

    let baseline: Vec<&PerformanceMetrics> = history.iter().take(DEGRADATION_WINDOW).collect();
    let recent: Vec<&PerformanceMetrics> =
        history.iter().skip(history.len().saturating_sub(DEGRADATION_WINDOW)).collect();

    let mean = |points: &[&PerformanceMetrics], f: fn(&PerformanceMetrics) -> f64| {
        points.iter().map(|p| f(p)).sum::<f64>() / points.len() as f64
    };

    let baseline_cpu = mean(&baseline, |p| p.cpu_usage);
    let recent_cpu = mean(&recent, |p| p.cpu_usage);
    let baseline_response = mean(&baseline, |p| p.response_time_ms);
    let recent_response = mean(&recent, |p| p.response_time_ms);

    if baseline_cpu > 0.0 && recent_cpu > baseline_cpu * 1.5 {
        return Some(PerformanceEvent::new(
            PerformanceMetricKind::Degradation,
            recent_cpu,
            baseline_cpu * 1.5,
            Severity::High,
            format!(
                "sustained CPU degradation: recent avg {:.1}% vs baseline {:.1}%",
                recent_cpu, baseline_cpu
            ),
        ));
    }
    if baseline_response > 0.0 && recent_response > baseline_response * 2.0 {
        return Some(PerformanceEvent::new(
            PerformanceMetricKind::Degradation,
            recent_response,
            baseline_response * 2.0,
            Severity::High,
            format!(
                "sustained response-time degradation: recent avg {:.0}ms vs baseline {:.0}ms",
                recent_response, baseline_response
            ),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_provider::FakeMetrics;
    use proptest::prelude::*;

    fn tracker() -> PerformanceTracker {
        let config = PerformanceTrackingConfig::default();
        let provider = Arc::new(FakeMetrics::healthy());
        PerformanceTracker::new(config, provider, EventBus::new(256))
    }

    fn sample(cpu: f64, response_ms: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            timestamp: Utc::now(),
            cpu_usage: cpu,
            memory_usage_pct: 40.0,
            disk_iops: 100.0,
            network_latency_ms: 20.0,
            active_threads: 20,
            response_time_ms: response_ms,
            throughput: 100.0,
        }
    }

    #[test]
    fn test_quiet_sample_yields_no_events() {
        let tracker = tracker();
        let events = tracker.ingest_sample(sample(30.0, 100.0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_cpu_breach_severity_scales_with_ratio() {
        let tracker = tracker();
        // threshold 80: 88 -> ratio 1.1 low, 100 -> 1.25 medium,
        // 130 -> 1.625 high, 160 -> 2.0 critical
        let cases = [
            (88.0, Severity::Low),
            (100.0, Severity::Medium),
            (130.0, Severity::High),
            (160.0, Severity::Critical),
        ];
        for (cpu, expected) in cases {
            let events = tracker.ingest_sample(sample(cpu, 100.0));
            let cpu_event = events
                .iter()
                .find(|e| e.metric == PerformanceMetricKind::CpuUsage)
                .unwrap();
            assert_eq!(cpu_event.severity, expected, "cpu = {}", cpu);
        }
    }

    #[test]
    fn test_throughput_breach_inverts_ratio() {
        let tracker = tracker();
        let mut slow = sample(10.0, 100.0);
        slow.throughput = 20.0; // 50/20 = 2.5 -> critical
        let events = tracker.ingest_sample(slow);
        let event = events
            .iter()
            .find(|e| e.metric == PerformanceMetricKind::Throughput)
            .unwrap();
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn test_zero_throughput_is_no_signal() {
        let tracker = tracker();
        let mut idle = sample(10.0, 100.0);
        idle.throughput = 0.0;
        let events = tracker.ingest_sample(idle);
        assert!(events.iter().all(|e| e.metric != PerformanceMetricKind::Throughput));
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = tracker();
        for _ in 0..120 {
            tracker.ingest_sample(sample(10.0, 100.0));
        }
        assert_eq!(tracker.history_len(), 50);
    }

    #[test]
    fn test_trend_degrading_on_cpu_climb() {
        let tracker = tracker();
        for cpu in [30.0, 35.0, 40.0, 50.0, 60.0] {
            tracker.ingest_sample(sample(cpu, 100.0));
        }
        assert_eq!(tracker.trend(), PerformanceTrend::Degrading);
    }

    #[test]
    fn test_trend_improving_needs_both_deltas() {
        {
            let tracker = tracker();
            for (cpu, response) in
                [(60.0, 900.0), (55.0, 800.0), (50.0, 600.0), (48.0, 400.0), (45.0, 300.0)]
            {
                tracker.ingest_sample(sample(cpu, response));
            }
            assert_eq!(tracker.trend(), PerformanceTrend::Improving);
        }

        // CPU falls but response does not: stable.
        {
            let tracker = tracker();
            for cpu in [60.0, 55.0, 50.0, 48.0, 45.0] {
                tracker.ingest_sample(sample(cpu, 100.0));
            }
            assert_eq!(tracker.trend(), PerformanceTrend::Stable);
        }
    }

    #[test]
    fn test_degradation_fires_exactly_once_per_episode() {
        let tracker = tracker();
        let mut degradation_events = 0;
        for _ in 0..10 {
            degradation_events += tracker
                .ingest_sample(sample(30.0, 100.0))
                .iter()
                .filter(|e| e.metric == PerformanceMetricKind::Degradation)
                .count();
        }
        for _ in 0..10 {
            degradation_events += tracker
                .ingest_sample(sample(50.0, 100.0))
                .iter()
                .filter(|e| e.metric == PerformanceMetricKind::Degradation)
                .count();
        }
        assert_eq!(degradation_events, 1);
    }

    #[test]
    fn test_operation_timer_unknown_finish_is_noop() {
        let tracker = tracker();
        assert!(tracker.finish_operation("never-started").is_none());
    }

    #[test]
    fn test_operation_timer_roundtrip() {
        let tracker = tracker();
        tracker.start_operation("categorize-batch");
        let elapsed = tracker.finish_operation("categorize-batch").unwrap();
        assert!(elapsed < Duration::from_secs(1));
        // Completed op feeds the throughput counter.
        assert_eq!(tracker.state.read().unwrap().ops_completed, 1);
    }

    #[tokio::test]
    async fn test_slow_operation_emits_medium_event() {
        let config = PerformanceTrackingConfig {
            response_time_threshold_secs: 0.01,
            ..Default::default()
        };
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let tracker = PerformanceTracker::new(config, Arc::new(FakeMetrics::healthy()), bus);

        tracker.start_operation("report-export");
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.finish_operation("report-export").unwrap();

        match rx.recv().await.unwrap() {
            MonitorEvent::Performance(event) => {
                assert_eq!(event.metric, PerformanceMetricKind::OperationDuration);
                assert_eq!(event.severity, Severity::Medium);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    proptest! {
        /// Severity never decreases as the breach ratio grows.
        #[test]
        fn severity_monotonic_in_ratio(a in 0.0f64..10.0, b in 0.0f64..10.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                Severity::from_threshold_ratio(lo) <= Severity::from_threshold_ratio(hi)
            );
        }
    }
}
