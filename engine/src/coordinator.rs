//! Observability coordination
//!
//! Subscribes to every monitor on the bus, enriches qualifying events
//! with live system and financial-operation snapshots plus suggested
//! recovery actions, and forwards the assembled [`CrashReport`] to the
//! alert system.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertSystem;
use crate::config::MonitoringConfig;
use crate::events::{
    CrashContext, CrashEvent, CrashKind, EventBus, FinancialWorkflowCrashEvent, MonitorEvent,
    PerformanceEvent, Severity,
};
use crate::metrics_provider::{MetricsProvider, SystemState};
use crate::workflow::{FinancialOperationState, WorkflowHandle};

/// Performance events below this severity stay local to the tracker
const PERFORMANCE_ESCALATION_FLOOR: Severity = Severity::High;

/// Suggested operator/runtime responses to a crash kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    SuspendNonCriticalOperations,
    TriggerMemoryCleanup,
    ReduceWorkerConcurrency,
    RestartNetworkStack,
    FlushAndRevalidateCaches,
    PauseDocumentIngestion,
    RequeueFailedWorkflows,
    EscalateToOperator,
}

impl RecoveryAction {
    pub fn description(&self) -> &'static str {
        match self {
            RecoveryAction::SuspendNonCriticalOperations => {
                "Suspend non-critical operations until pressure subsides"
            }
            RecoveryAction::TriggerMemoryCleanup => "Trigger memory cleanup and cache eviction",
            RecoveryAction::ReduceWorkerConcurrency => "Reduce worker pool concurrency",
            RecoveryAction::RestartNetworkStack => "Restart the network client stack",
            RecoveryAction::FlushAndRevalidateCaches => "Flush and revalidate in-memory caches",
            RecoveryAction::PauseDocumentIngestion => "Pause document ingestion intake",
            RecoveryAction::RequeueFailedWorkflows => "Requeue failed workflows for retry",
            RecoveryAction::EscalateToOperator => "Escalate to the on-call operator",
        }
    }
}

/// Static per-kind recovery lookup
pub fn recovery_actions_for(kind: CrashKind) -> Vec<RecoveryAction> {
    match kind {
        CrashKind::ApplicationHang => vec![
            RecoveryAction::SuspendNonCriticalOperations,
            RecoveryAction::ReduceWorkerConcurrency,
            RecoveryAction::EscalateToOperator,
        ],
        CrashKind::SystemResourceExhaustion => vec![
            RecoveryAction::SuspendNonCriticalOperations,
            RecoveryAction::ReduceWorkerConcurrency,
        ],
        CrashKind::MemoryPressure => vec![
            RecoveryAction::SuspendNonCriticalOperations,
            RecoveryAction::TriggerMemoryCleanup,
        ],
        CrashKind::DataCorruption => vec![
            RecoveryAction::FlushAndRevalidateCaches,
            RecoveryAction::EscalateToOperator,
        ],
        CrashKind::PerformanceDegradation => vec![
            RecoveryAction::ReduceWorkerConcurrency,
            RecoveryAction::TriggerMemoryCleanup,
        ],
        CrashKind::NetworkFailure => vec![RecoveryAction::RestartNetworkStack],
        CrashKind::FinancialProcessingFailure => vec![
            RecoveryAction::PauseDocumentIngestion,
            RecoveryAction::RequeueFailedWorkflows,
        ],
    }
}

/// Immutable incident record built once per qualifying event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: CrashKind,
    pub severity: Severity,
    pub context: CrashContext,
    pub system_state: Option<SystemState>,
    pub financial_state: Option<FinancialOperationState>,
    pub recovery_actions: Vec<RecoveryAction>,
    pub suppression_key: String,
    pub metadata: HashMap<String, String>,
}

/// Builds crash reports out of raw monitor events
pub struct ObservabilityCoordinator {
    config: MonitoringConfig,
    provider: Arc<dyn MetricsProvider>,
    workflow: WorkflowHandle,
    alerts: Arc<AlertSystem>,
    bus: EventBus,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ObservabilityCoordinator {
    pub fn new(
        config: MonitoringConfig,
        provider: Arc<dyn MetricsProvider>,
        workflow: WorkflowHandle,
        alerts: Arc<AlertSystem>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            provider,
            workflow,
            alerts,
            bus,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start consuming events from the bus. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            debug!("coordinator already running");
            return;
        }
        self.cancel = CancellationToken::new();
        info!("starting observability coordinator");

        let config = self.config.clone();
        let provider = self.provider.clone();
        let workflow = self.workflow.clone();
        let alerts = self.alerts.clone();
        let mut rx = self.bus.subscribe();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let status_enabled = config.reporting_interval_secs > 0;
            let mut status_ticker = tokio::time::interval(Duration::from_secs(
                config.reporting_interval_secs.max(1),
            ));
            status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = status_ticker.tick(), if status_enabled => {
                        let state = provider.snapshot();
                        let health = workflow.health().await.unwrap_or_default();
                        info!(
                            cpu_usage = format!("{:.1}", state.cpu_usage),
                            memory_usage_pct = format!("{:.1}", state.memory_usage_pct),
                            active_threads = state.active_threads,
                            open_file_descriptors = state.open_file_descriptors,
                            workflow_health = ?health,
                            active_alerts = alerts.active_alerts().len(),
                            "engine status"
                        );
                    }
                    event = rx.recv() => {
                        match event {
                            Ok(event) => {
                                if let Some(report) =
                                    build_report(&config, &provider, &workflow, event).await
                                {
                                    alerts.process_report(&report);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "coordinator lagged behind the event bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        }));
    }

    /// Stop consuming; on return no further reports are produced. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!("coordinator task join failed: {}", e);
        }
        info!("coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

/// Assemble a report for a qualifying event; `None` means the event
/// does not meet the reporting bar.
pub async fn build_report(
    config: &MonitoringConfig,
    provider: &Arc<dyn MetricsProvider>,
    workflow: &WorkflowHandle,
    event: MonitorEvent,
) -> Option<CrashReport> {
    if !config.crash_detection.enable_crash_reporting {
        return None;
    }

    let (kind, severity, context, suppression_key, metadata) = match event {
        MonitorEvent::Crash(event) => {
            if event.severity < config.crash_detection.reporting_level {
                return None;
            }
            crash_report_parts(event)
        }
        MonitorEvent::Performance(event) => {
            if event.severity < PERFORMANCE_ESCALATION_FLOOR {
                return None;
            }
            performance_report_parts(event)
        }
        MonitorEvent::Workflow(event) => workflow_report_parts(event),
    };

    let system_state = if config.crash_detection.enable_system_state_capture {
        Some(provider.snapshot())
    } else {
        None
    };
    let financial_state = workflow.snapshot().await;

    let mut context = context;
    if config.crash_detection.enable_stack_trace_capture && context.stack_trace.is_none() {
        context.stack_trace = Some(std::backtrace::Backtrace::force_capture().to_string());
    }

    let recovery_actions = if config.enable_automatic_recovery {
        recovery_actions_for(kind)
    } else {
        Vec::new()
    };

    Some(CrashReport {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        kind,
        severity,
        context,
        system_state,
        financial_state,
        recovery_actions,
        suppression_key,
        metadata,
    })
}

type ReportParts = (CrashKind, Severity, CrashContext, String, HashMap<String, String>);

fn crash_report_parts(event: CrashEvent) -> ReportParts {
    let suppression_key = format!("{}_{}", event.kind.as_str(), event.context.function);
    (event.kind, event.severity, event.context, suppression_key, event.metadata)
}

fn performance_report_parts(event: PerformanceEvent) -> ReportParts {
    let kind = CrashKind::PerformanceDegradation;
    let suppression_key = format!("{}_{}", kind.as_str(), event.metric.as_str());
    let mut metadata = HashMap::new();
    metadata.insert("metric".to_string(), event.metric.as_str().to_string());
    metadata.insert("value".to_string(), format!("{:.2}", event.value));
    metadata.insert("threshold".to_string(), format!("{:.2}", event.threshold));
    (
        kind,
        event.severity,
        CrashContext::new("performance_tracker", event.metric.as_str()),
        suppression_key,
        metadata,
    )
}

fn workflow_report_parts(event: FinancialWorkflowCrashEvent) -> ReportParts {
    let kind = CrashKind::FinancialProcessingFailure;
    let suppression_key = format!("{}_{}", kind.as_str(), event.workflow_kind.as_str());
    let mut metadata = event.metadata;
    metadata.insert("failure".to_string(), event.failure.as_str().to_string());
    metadata.insert("message".to_string(), event.message);
    metadata.insert(
        "documents_being_processed".to_string(),
        event.documents_being_processed.to_string(),
    );
    metadata
        .insert("pending_transactions".to_string(), event.pending_transactions.to_string());
    (
        kind,
        event.severity,
        CrashContext::new("workflow_monitor", event.failure.as_str()),
        suppression_key,
        metadata,
    )
}
