//! Engine assembly and lifecycle
//!
//! Wires the metrics provider, the three monitors, the coordinator,
//! and the alert system together behind a single start/stop surface.
//! This is the type the daemon binary and embedding applications hold.

use std::sync::Arc;

use tracing::info;

use crate::alerts::{AlertSystem, CrashAlert, NotificationSink};
use crate::config::MonitoringConfig;
use crate::coordinator::ObservabilityCoordinator;
use crate::crash_detector::CrashDetector;
use crate::error::Result;
use crate::events::{EventBus, PerformanceTrend};
use crate::metrics_provider::{MetricsProvider, SystemMetricsProvider, SystemState};
use crate::performance::{PerformanceMetrics, PerformanceTracker};
use crate::workflow::{
    FinancialOperationState, FinancialWorkflowMonitor, WorkflowHandle, WorkflowHealth,
};

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Created,
    Running,
    Stopped,
}

/// The assembled observability engine
pub struct MonitoringEngine {
    config: MonitoringConfig,
    provider: Arc<dyn MetricsProvider>,
    bus: EventBus,
    crash_detector: CrashDetector,
    performance: PerformanceTracker,
    workflow_monitor: FinancialWorkflowMonitor,
    coordinator: ObservabilityCoordinator,
    alerts: Arc<AlertSystem>,
    status: EngineStatus,
}

impl MonitoringEngine {
    /// Build an engine backed by the real OS metrics provider.
    pub fn new(config: MonitoringConfig) -> Result<Self> {
        Self::with_provider(config, Arc::new(SystemMetricsProvider::new()))
    }

    /// Build an engine with a caller-supplied metrics provider.
    pub fn with_provider(
        config: MonitoringConfig,
        provider: Arc<dyn MetricsProvider>,
    ) -> Result<Self> {
        Self::with_provider_and_sinks(config, provider, Vec::new())
    }

    /// Build an engine with extra notification sinks alongside the
    /// structured log sink.
    pub fn with_provider_and_sinks(
        config: MonitoringConfig,
        provider: Arc<dyn MetricsProvider>,
        extra_sinks: Vec<Box<dyn NotificationSink>>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::default();
        let mut sinks: Vec<Box<dyn NotificationSink>> =
            vec![Box::new(crate::alerts::LogNotificationSink)];
        sinks.extend(extra_sinks);
        let alerts = Arc::new(AlertSystem::with_sinks(config.alerting.clone(), sinks));

        let crash_detector = CrashDetector::new(
            config.crash_detection.clone(),
            config.memory_monitoring.clone(),
            provider.clone(),
            bus.clone(),
        );
        let performance = PerformanceTracker::new(
            config.performance_tracking.clone(),
            provider.clone(),
            bus.clone(),
        );
        let workflow_monitor = FinancialWorkflowMonitor::new(config.workflow.clone(), bus.clone());
        let coordinator = ObservabilityCoordinator::new(
            config.clone(),
            provider.clone(),
            workflow_monitor.handle(),
            alerts.clone(),
            bus.clone(),
        );

        Ok(Self {
            config,
            provider,
            bus,
            crash_detector,
            performance,
            workflow_monitor,
            coordinator,
            alerts,
            status: EngineStatus::Created,
        })
    }

    /// Start every monitor. Idempotent.
    pub fn start(&mut self) {
        if self.status == EngineStatus::Running {
            return;
        }
        info!("starting monitoring engine");
        // Coordinator first so no startup event slips past it.
        self.coordinator.start();
        self.workflow_monitor.start();
        self.crash_detector.start();
        self.performance.start();
        self.status = EngineStatus::Running;
        info!(
            subscribers = self.bus.subscriber_count(),
            "monitoring engine started"
        );
    }

    /// Stop every monitor; on return nothing ticks and nothing is
    /// emitted. Idempotent.
    pub async fn stop(&mut self) {
        if self.status != EngineStatus::Running {
            return;
        }
        info!("stopping monitoring engine");
        self.crash_detector.stop().await;
        self.performance.stop().await;
        self.workflow_monitor.stop().await;
        self.coordinator.stop().await;
        self.status = EngineStatus::Stopped;
        info!("monitoring engine stopped");
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Handle for declaring workflow lifecycle transitions
    pub fn workflow_handle(&self) -> WorkflowHandle {
        self.workflow_monitor.handle()
    }

    /// Direct access to the performance tracker (operation timers,
    /// sample ingestion)
    pub fn performance_tracker(&self) -> &PerformanceTracker {
        &self.performance
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::events::MonitorEvent> {
        self.bus.subscribe()
    }

    // Read models for a presentation layer.

    pub fn active_alerts(&self) -> Vec<CrashAlert> {
        self.alerts.active_alerts()
    }

    pub fn alert_history(&self) -> Vec<CrashAlert> {
        self.alerts.alert_history()
    }

    pub fn alert_system(&self) -> &Arc<AlertSystem> {
        &self.alerts
    }

    pub async fn workflow_health(&self) -> WorkflowHealth {
        self.workflow_monitor.handle().health().await.unwrap_or_default()
    }

    pub async fn financial_state(&self) -> Option<FinancialOperationState> {
        self.workflow_monitor.handle().snapshot().await
    }

    pub fn performance_trend(&self) -> PerformanceTrend {
        self.performance.trend()
    }

    pub fn current_metrics(&self) -> Option<PerformanceMetrics> {
        self.performance.current_metrics()
    }

    pub fn system_state(&self) -> SystemState {
        self.provider.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_provider::FakeMetrics;

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let provider = Arc::new(FakeMetrics::healthy());
        let mut engine =
            MonitoringEngine::with_provider(MonitoringConfig::default(), provider).unwrap();
        assert_eq!(engine.status(), EngineStatus::Created);

        engine.start();
        engine.start(); // idempotent
        assert_eq!(engine.status(), EngineStatus::Running);

        engine.stop().await;
        engine.stop().await; // idempotent
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_keeps_workflow_monitoring_alive() {
        let provider = Arc::new(FakeMetrics::healthy());
        let mut engine =
            MonitoringEngine::with_provider(MonitoringConfig::default(), provider).unwrap();

        engine.start();
        engine.stop().await;
        engine.start();
        assert_eq!(engine.status(), EngineStatus::Running);

        let handle = engine.workflow_handle();
        handle
            .start_document_processing("doc-1", crate::events::WorkflowKind::DocumentProcessing)
            .await;
        let state = engine.financial_state().await.expect("workflow monitor answering");
        assert_eq!(state.active_document_count, 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = MonitoringConfig::default();
        config.performance_tracking.interval_secs = 0;
        let provider = Arc::new(FakeMetrics::healthy());
        assert!(MonitoringEngine::with_provider(config, provider).is_err());
    }

    #[tokio::test]
    async fn test_read_models_available_while_running() {
        let provider = Arc::new(FakeMetrics::healthy());
        let mut engine =
            MonitoringEngine::with_provider(MonitoringConfig::default(), provider).unwrap();
        engine.start();

        assert_eq!(engine.workflow_health().await, WorkflowHealth::Healthy);
        assert_eq!(engine.performance_trend(), PerformanceTrend::Stable);
        assert!(engine.active_alerts().is_empty());
        let state = engine.system_state();
        assert!(state.network_reachable);

        engine.stop().await;
    }
}
