//! Event types and the engine event bus
//!
//! All cross-component communication happens through the immutable
//! event types defined here, delivered over a tokio broadcast channel.
//! Kinds are closed enums and are matched exhaustively; nothing in the
//! engine dispatches on strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event severity levels, ordered
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }

    /// Classify a threshold breach by how far past the threshold the
    /// observed value landed.
    pub fn from_threshold_ratio(ratio: f64) -> Self {
        if ratio < 1.2 {
            Severity::Low
        } else if ratio < 1.5 {
            Severity::Medium
        } else if ratio < 2.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            "fatal" => Ok(Severity::Fatal),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// System-level anomaly kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CrashKind {
    ApplicationHang,
    SystemResourceExhaustion,
    MemoryPressure,
    DataCorruption,
    PerformanceDegradation,
    NetworkFailure,
    FinancialProcessingFailure,
}

impl CrashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashKind::ApplicationHang => "application_hang",
            CrashKind::SystemResourceExhaustion => "system_resource_exhaustion",
            CrashKind::MemoryPressure => "memory_pressure",
            CrashKind::DataCorruption => "data_corruption",
            CrashKind::PerformanceDegradation => "performance_degradation",
            CrashKind::NetworkFailure => "network_failure",
            CrashKind::FinancialProcessingFailure => "financial_processing_failure",
        }
    }
}

/// Business workflow kinds tracked by the workflow monitor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    DocumentProcessing,
    TransactionAnalysis,
    ReportGeneration,
    DataExport,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::DocumentProcessing => "document_processing",
            WorkflowKind::TransactionAnalysis => "transaction_analysis",
            WorkflowKind::ReportGeneration => "report_generation",
            WorkflowKind::DataExport => "data_export",
        }
    }
}

/// Workflow-correlated failure kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowFailure {
    DocumentProcessingFailed,
    TransactionAnalysisFailed,
    WorkflowStalled,
    MemoryLeakDetected,
    TransactionIntegrityViolation,
    AnalyticsEngineIssue,
}

impl WorkflowFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowFailure::DocumentProcessingFailed => "document_processing_failed",
            WorkflowFailure::TransactionAnalysisFailed => "transaction_analysis_failed",
            WorkflowFailure::WorkflowStalled => "workflow_stalled",
            WorkflowFailure::MemoryLeakDetected => "memory_leak_detected",
            WorkflowFailure::TransactionIntegrityViolation => "transaction_integrity_violation",
            WorkflowFailure::AnalyticsEngineIssue => "analytics_engine_issue",
        }
    }
}

/// Execution context captured alongside a crash event
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrashContext {
    /// Module that detected the anomaly
    pub module: String,

    /// Function or check that detected the anomaly
    pub function: String,

    /// Thread information at detection time
    pub thread_info: Option<String>,

    /// Memory figures at detection time (bytes used / pct)
    pub memory_snapshot: Option<String>,

    /// Stack trace, when capture is enabled
    pub stack_trace: Option<String>,
}

impl CrashContext {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn with_memory_snapshot(mut self, snapshot: String) -> Self {
        self.memory_snapshot = Some(snapshot);
        self
    }

    pub fn with_thread_info(mut self, info: String) -> Self {
        self.thread_info = Some(info);
        self
    }
}

/// A single detected system-level anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: CrashKind,
    pub severity: Severity,
    pub context: CrashContext,
    pub metadata: HashMap<String, String>,
}

impl CrashEvent {
    pub fn new(kind: CrashKind, severity: Severity, context: CrashContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            context,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The metric a performance event refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMetricKind {
    CpuUsage,
    ResponseTime,
    ActiveThreads,
    NetworkLatency,
    Throughput,
    Degradation,
    OperationDuration,
}

impl PerformanceMetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMetricKind::CpuUsage => "cpu_usage",
            PerformanceMetricKind::ResponseTime => "response_time",
            PerformanceMetricKind::ActiveThreads => "active_threads",
            PerformanceMetricKind::NetworkLatency => "network_latency",
            PerformanceMetricKind::Throughput => "throughput",
            PerformanceMetricKind::Degradation => "degradation",
            PerformanceMetricKind::OperationDuration => "operation_duration",
        }
    }
}

/// Performance trend over the recent history window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTrend {
    Improving,
    #[default]
    Stable,
    Degrading,
}

/// A threshold breach or sustained degradation detected by the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub metric: PerformanceMetricKind,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub trend: PerformanceTrend,
    pub message: String,
}

impl PerformanceEvent {
    pub fn new(
        metric: PerformanceMetricKind,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            metric,
            value,
            threshold,
            severity,
            trend: PerformanceTrend::Stable,
            message,
        }
    }
}

/// An anomaly correlated with a specific business workflow
///
/// The document/transaction counts are the live counts at emission
/// time, not the counts when the workflow started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialWorkflowCrashEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_kind: WorkflowKind,
    pub failure: WorkflowFailure,
    pub severity: Severity,
    pub documents_being_processed: usize,
    pub pending_transactions: usize,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

/// The single message type carried on the engine bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    Crash(CrashEvent),
    Performance(PerformanceEvent),
    Workflow(FinancialWorkflowCrashEvent),
}

impl MonitorEvent {
    pub fn severity(&self) -> Severity {
        match self {
            MonitorEvent::Crash(e) => e.severity,
            MonitorEvent::Performance(e) => e.severity,
            MonitorEvent::Workflow(e) => e.severity,
        }
    }
}

/// Broadcast bus connecting the monitors to the coordinator
///
/// Slow subscribers lag rather than block publishers; a lagged
/// subscriber resumes from the oldest retained event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; a send with no live subscribers is not an error.
    pub fn publish(&self, event: MonitorEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
