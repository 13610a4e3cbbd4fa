//! FinSentry observability engine library
//!
//! Watches system health (CPU, memory, disk, threads, descriptors,
//! responsiveness), correlates anomalies with in-flight financial
//! workflows, and produces deduplicated, severity-ranked alerts.

pub mod alerts;
pub mod config;
pub mod coordinator;
pub mod crash_detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics_provider;
pub mod performance;
pub mod workflow;

// Re-export commonly used types
pub use alerts::{AlertSystem, CrashAlert, NotificationSink};
pub use config::MonitoringConfig;
pub use coordinator::{CrashReport, ObservabilityCoordinator, RecoveryAction};
pub use crash_detector::CrashDetector;
pub use engine::{EngineStatus, MonitoringEngine};
pub use error::{EngineError, Result};
pub use events::{
    CrashContext, CrashEvent, CrashKind, EventBus, FinancialWorkflowCrashEvent, MonitorEvent,
    PerformanceEvent, PerformanceMetricKind, PerformanceTrend, Severity, WorkflowFailure,
    WorkflowKind,
};
pub use metrics_provider::{FakeMetrics, MetricsProvider, SystemMetricsProvider, SystemState};
pub use performance::{PerformanceMetrics, PerformanceTracker};
pub use workflow::{
    FinancialOperationState, FinancialWorkflowMonitor, Transaction, WorkflowHandle, WorkflowHealth,
};
