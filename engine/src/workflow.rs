//! Financial workflow monitoring
//!
//! Tracks the lifecycle of externally-declared business workflows
//! (document processing, transaction analysis) and correlates failures
//! with live workflow state. All state lives inside a single worker
//! task; external callers go through a cloneable [`WorkflowHandle`]
//! whose calls are marshaled onto that task as messages.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::events::{
    EventBus, FinancialWorkflowCrashEvent, MonitorEvent, Severity, WorkflowFailure, WorkflowKind,
};

/// A transaction under analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub amount: f64,
    pub description: String,
    pub category: Option<String>,
}

impl Transaction {
    /// Integrity rule: a pending transaction must have an id, a
    /// non-zero amount, and a description.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && self.amount != 0.0 && !self.description.is_empty()
    }
}

/// Status of an in-flight workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    /// Past the stall threshold but not yet finished
    LongRunning,
}

/// An in-flight workflow, owned exclusively by the monitor
#[derive(Debug, Clone)]
pub struct ActiveWorkflow {
    pub id: String,
    pub kind: WorkflowKind,
    pub start_time: DateTime<Utc>,
    pub status: WorkflowStatus,
    started: Instant,
}

/// Derived workflow health classification, recomputed on demand
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowHealth {
    #[default]
    Healthy,
    Warning,
    Degraded,
    Critical,
}

/// Read-only snapshot of the financial operation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialOperationState {
    pub current_status: WorkflowHealth,
    pub active_document_count: usize,
    pub pending_transaction_count: usize,
    pub last_successful_operation: Option<DateTime<Utc>>,
    pub operation_start_time: Option<DateTime<Utc>>,
}

enum Command {
    StartDocument { id: String, kind: WorkflowKind, ack: oneshot::Sender<()> },
    FinishDocument { id: String, success: bool, transaction_count: usize, ack: oneshot::Sender<()> },
    StartTransaction { id: String, transaction: Transaction, ack: oneshot::Sender<()> },
    FinishTransaction { id: String, success: bool, ack: oneshot::Sender<()> },
    AnalyticsIssue { error: String, ack: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<FinancialOperationState> },
    Health { reply: oneshot::Sender<WorkflowHealth> },
}

/// Cloneable handle through which collaborators declare workflow
/// lifecycle transitions
///
/// Lifecycle calls return only after the worker has applied the
/// transition, so a caller observes its own declarations. The sender
/// slot is shared so handles stay valid across monitor restarts.
#[derive(Clone)]
pub struct WorkflowHandle {
    tx: Arc<RwLock<mpsc::Sender<Command>>>,
}

impl WorkflowHandle {
    pub async fn start_document_processing(&self, id: impl Into<String>, kind: WorkflowKind) {
        let (ack, done) = oneshot::channel();
        self.send(Command::StartDocument { id: id.into(), kind, ack }).await;
        let _ = done.await;
    }

    pub async fn finish_document_processing(
        &self,
        id: impl Into<String>,
        success: bool,
        transaction_count: usize,
    ) {
        let (ack, done) = oneshot::channel();
        self.send(Command::FinishDocument { id: id.into(), success, transaction_count, ack })
            .await;
        let _ = done.await;
    }

    pub async fn start_transaction_analysis(
        &self,
        id: impl Into<String>,
        transaction: Transaction,
    ) {
        let (ack, done) = oneshot::channel();
        self.send(Command::StartTransaction { id: id.into(), transaction, ack }).await;
        let _ = done.await;
    }

    pub async fn finish_transaction_analysis(&self, id: impl Into<String>, success: bool) {
        let (ack, done) = oneshot::channel();
        self.send(Command::FinishTransaction { id: id.into(), success, ack }).await;
        let _ = done.await;
    }

    pub async fn report_analytics_engine_issue(&self, error: impl Into<String>) {
        let (ack, done) = oneshot::channel();
        self.send(Command::AnalyticsIssue { error: error.into(), ack }).await;
        let _ = done.await;
    }

    /// Point-in-time snapshot of the workflow state
    pub async fn snapshot(&self) -> Option<FinancialOperationState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await;
        rx.await.ok()
    }

    /// Current derived health classification
    pub async fn health(&self) -> Option<WorkflowHealth> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Health { reply }).await;
        rx.await.ok()
    }

    async fn send(&self, command: Command) {
        let tx = self.tx.read().unwrap().clone();
        if tx.send(command).await.is_err() {
            debug!("workflow monitor not running, command dropped");
        }
    }
}

/// Monitors financial workflow lifecycles and emits correlated crash
/// events
pub struct FinancialWorkflowMonitor {
    config: WorkflowConfig,
    bus: EventBus,
    handle: WorkflowHandle,
    rx: Option<mpsc::Receiver<Command>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FinancialWorkflowMonitor {
    pub fn new(config: WorkflowConfig, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            config,
            bus,
            handle: WorkflowHandle { tx: Arc::new(RwLock::new(tx)) },
            rx: Some(rx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn handle(&self) -> WorkflowHandle {
        self.handle.clone()
    }

    /// Start the worker and its health tick. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            debug!("workflow monitor already running");
            return;
        }
        // On a restart the previous receiver died with its task; build
        // a fresh channel and repoint every outstanding handle at it.
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(256);
                *self.handle.tx.write().unwrap() = tx;
                rx
            }
        };
        self.cancel = CancellationToken::new();
        info!(
            health_interval_secs = self.config.health_interval_secs,
            stall_threshold_secs = self.config.stall_threshold_secs,
            "starting financial workflow monitor"
        );

        let config = self.config.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let mut state = WorkflowState::default();
            let mut ticker = tokio::time::interval(config.health_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for event in state.health_tick(&config) {
                            bus.publish(MonitorEvent::Workflow(event));
                        }
                    }
                    command = rx.recv() => {
                        match command {
                            Some(command) => {
                                for event in state.apply(&config, command) {
                                    bus.publish(MonitorEvent::Workflow(event));
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }));
    }

    /// Stop the worker; on return no further events are emitted. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!("workflow monitor task join failed: {}", e);
        }
        info!("workflow monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

/// All mutable workflow state, owned by the worker task
#[derive(Default)]
struct WorkflowState {
    active: HashMap<String, ActiveWorkflow>,
    pending: HashMap<String, Transaction>,
    error_times: VecDeque<Instant>,
    last_successful: Option<DateTime<Utc>>,
}

impl WorkflowState {
    fn apply(&mut self, config: &WorkflowConfig, command: Command) -> Vec<FinancialWorkflowCrashEvent> {
        match command {
            Command::StartDocument { id, kind, ack } => {
                debug!(document_id = %id, kind = kind.as_str(), "document processing started");
                self.active.insert(
                    id.clone(),
                    ActiveWorkflow {
                        id,
                        kind,
                        start_time: Utc::now(),
                        status: WorkflowStatus::Running,
                        started: Instant::now(),
                    },
                );
                let _ = ack.send(());
                Vec::new()
            }
            Command::FinishDocument { id, success, transaction_count, ack } => {
                if self.active.remove(&id).is_none() {
                    debug!(document_id = %id, "finish for unknown document, ignoring");
                    let _ = ack.send(());
                    return Vec::new();
                }
                let events = if success {
                    debug!(document_id = %id, transaction_count, "document processing finished");
                    self.last_successful = Some(Utc::now());
                    Vec::new()
                } else {
                    warn!(document_id = %id, "document processing failed");
                    self.record_error(config);
                    vec![self.failure_event(
                        WorkflowKind::DocumentProcessing,
                        WorkflowFailure::DocumentProcessingFailed,
                        Severity::High,
                        format!("document processing failed for '{}'", id),
                    )]
                };
                let _ = ack.send(());
                events
            }
            Command::StartTransaction { id, transaction, ack } => {
                debug!(transaction_id = %id, "transaction analysis started");
                self.pending.insert(id, transaction);
                let _ = ack.send(());
                Vec::new()
            }
            Command::FinishTransaction { id, success, ack } => {
                if self.pending.remove(&id).is_none() {
                    debug!(transaction_id = %id, "finish for unknown transaction, ignoring");
                    let _ = ack.send(());
                    return Vec::new();
                }
                let events = if success {
                    debug!(transaction_id = %id, "transaction analysis finished");
                    self.last_successful = Some(Utc::now());
                    Vec::new()
                } else {
                    warn!(transaction_id = %id, "transaction analysis failed");
                    self.record_error(config);
                    vec![self.failure_event(
                        WorkflowKind::TransactionAnalysis,
                        WorkflowFailure::TransactionAnalysisFailed,
                        Severity::High,
                        format!("transaction analysis failed for '{}'", id),
                    )]
                };
                let _ = ack.send(());
                events
            }
            Command::AnalyticsIssue { error, ack } => {
                warn!(error = %error, "analytics engine issue reported");
                self.record_error(config);
                let events = vec![self.failure_event(
                    WorkflowKind::TransactionAnalysis,
                    WorkflowFailure::AnalyticsEngineIssue,
                    Severity::Medium,
                    format!("analytics engine issue: {}", error),
                )];
                let _ = ack.send(());
                events
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(config));
                Vec::new()
            }
            Command::Health { reply } => {
                let _ = reply.send(self.health(config));
                Vec::new()
            }
        }
    }

    /// Periodic health evaluation: stalls, leaks, integrity.
    ///
    /// A workflow that stays stalled produces a fresh event on every
    /// tick; downstream deduplication decides how often that reaches
    /// anyone.
    fn health_tick(&mut self, config: &WorkflowConfig) -> Vec<FinancialWorkflowCrashEvent> {
        let mut events = Vec::new();
        let stall_threshold = Duration::from_secs(config.stall_threshold_secs);
        let now = Instant::now();

        let stalled: Vec<(String, WorkflowKind, Duration)> = self
            .active
            .values()
            .filter(|w| now.duration_since(w.started) > stall_threshold)
            .map(|w| (w.id.clone(), w.kind, now.duration_since(w.started)))
            .collect();
        for (id, kind, age) in stalled {
            if let Some(workflow) = self.active.get_mut(&id) {
                workflow.status = WorkflowStatus::LongRunning;
            }
            warn!(workflow_id = %id, age_secs = age.as_secs(), "workflow stalled");
            events.push(self.failure_event(
                kind,
                WorkflowFailure::WorkflowStalled,
                Severity::High,
                format!("workflow '{}' stalled for {}s", id, age.as_secs()),
            ));
        }

        if self.active.len() > config.leak_threshold {
            warn!(active = self.active.len(), "possible workflow leak");
            events.push(self.failure_event(
                WorkflowKind::DocumentProcessing,
                WorkflowFailure::MemoryLeakDetected,
                Severity::High,
                format!("{} workflows active, leak suspected", self.active.len()),
            ));
        }

        let invalid: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, txn)| !txn.is_valid())
            .map(|(id, _)| id.clone())
            .collect();
        for id in invalid {
            warn!(transaction_id = %id, "transaction integrity violation");
            events.push(self.failure_event(
                WorkflowKind::TransactionAnalysis,
                WorkflowFailure::TransactionIntegrityViolation,
                Severity::Critical,
                format!("pending transaction '{}' fails integrity validation", id),
            ));
        }

        events
    }

    fn record_error(&mut self, config: &WorkflowConfig) {
        self.error_times.push_back(Instant::now());
        self.prune_errors(config);
    }

    fn prune_errors(&mut self, config: &WorkflowConfig) {
        let cutoff = Duration::from_secs(config.error_window_secs);
        let now = Instant::now();
        while let Some(front) = self.error_times.front() {
            if now.duration_since(*front) > cutoff {
                self.error_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Health is a pure function of recent errors and active count.
    fn health(&mut self, config: &WorkflowConfig) -> WorkflowHealth {
        self.prune_errors(config);
        let errors = self.error_times.len();
        let active = self.active.len();
        if errors > 5 || active > 10 {
            WorkflowHealth::Critical
        } else if errors > 2 || active > 5 {
            WorkflowHealth::Degraded
        } else if errors > 0 || active > 2 {
            WorkflowHealth::Warning
        } else {
            WorkflowHealth::Healthy
        }
    }

    fn snapshot(&mut self, config: &WorkflowConfig) -> FinancialOperationState {
        FinancialOperationState {
            current_status: self.health(config),
            active_document_count: self.active.len(),
            pending_transaction_count: self.pending.len(),
            last_successful_operation: self.last_successful,
            operation_start_time: self.active.values().map(|w| w.start_time).min(),
        }
    }

    /// Event carrying the live counts at emission time.
    fn failure_event(
        &self,
        workflow_kind: WorkflowKind,
        failure: WorkflowFailure,
        severity: Severity,
        message: String,
    ) -> FinancialWorkflowCrashEvent {
        FinancialWorkflowCrashEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            workflow_kind,
            failure,
            severity,
            documents_being_processed: self.active.len(),
            pending_transactions: self.pending.len(),
            message,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkflowConfig {
        WorkflowConfig::default()
    }

    fn txn(id: &str, amount: f64, description: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            amount,
            description: description.to_string(),
            category: None,
        }
    }

    fn ack() -> oneshot::Sender<()> {
        oneshot::channel().0
    }

    fn start_doc(state: &mut WorkflowState, id: &str) {
        let events = state.apply(
            &config(),
            Command::StartDocument {
                id: id.to_string(),
                kind: WorkflowKind::DocumentProcessing,
                ack: ack(),
            },
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_failure_event_carries_live_counts() {
        let mut state = WorkflowState::default();
        start_doc(&mut state, "doc-1");
        start_doc(&mut state, "doc-2");
        state.apply(
            &config(),
            Command::StartTransaction {
                id: "tx-1".to_string(),
                transaction: txn("tx-1", 10.0, "coffee"),
                ack: ack(),
            },
        );

        let events = state.apply(
            &config(),
            Command::FinishDocument {
                id: "doc-1".to_string(),
                success: false,
                transaction_count: 0,
                ack: ack(),
            },
        );
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.failure, WorkflowFailure::DocumentProcessingFailed);
        // doc-1 already removed; doc-2 still active.
        assert_eq!(event.documents_being_processed, 1);
        assert_eq!(event.pending_transactions, 1);
    }

    #[test]
    fn test_finish_unknown_transaction_is_noop() {
        let mut state = WorkflowState::default();
        let events = state.apply(
            &config(),
            Command::FinishTransaction { id: "tx-9".to_string(), success: false, ack: ack() },
        );
        assert!(events.is_empty());
        assert_eq!(state.pending.len(), 0);
        assert_eq!(state.error_times.len(), 0);
    }

    #[test]
    fn test_successful_finish_updates_last_successful() {
        let mut state = WorkflowState::default();
        start_doc(&mut state, "doc-1");
        assert!(state.last_successful.is_none());
        state.apply(
            &config(),
            Command::FinishDocument {
                id: "doc-1".to_string(),
                success: true,
                transaction_count: 4,
                ack: ack(),
            },
        );
        assert!(state.last_successful.is_some());
        assert!(state.error_times.is_empty());
    }

    #[test]
    fn test_health_classification_bands() {
        let cfg = config();
        let mut state = WorkflowState::default();
        assert_eq!(state.health(&cfg), WorkflowHealth::Healthy);

        // 3 active -> warning
        for i in 0..3 {
            start_doc(&mut state, &format!("doc-{}", i));
        }
        assert_eq!(state.health(&cfg), WorkflowHealth::Warning);

        // 6 active -> degraded
        for i in 3..6 {
            start_doc(&mut state, &format!("doc-{}", i));
        }
        assert_eq!(state.health(&cfg), WorkflowHealth::Degraded);

        // 11 active -> critical
        for i in 6..11 {
            start_doc(&mut state, &format!("doc-{}", i));
        }
        assert_eq!(state.health(&cfg), WorkflowHealth::Critical);
    }

    #[test]
    fn test_health_critical_iff_thresholds() {
        let cfg = config();

        // exactly 6 errors -> critical; 5 errors -> not critical
        let mut state = WorkflowState::default();
        for _ in 0..5 {
            state.record_error(&cfg);
        }
        assert_ne!(state.health(&cfg), WorkflowHealth::Critical);
        state.record_error(&cfg);
        assert_eq!(state.health(&cfg), WorkflowHealth::Critical);

        // exactly 10 active -> not critical; 11 -> critical
        let mut state = WorkflowState::default();
        for i in 0..10 {
            start_doc(&mut state, &format!("doc-{}", i));
        }
        assert_ne!(state.health(&cfg), WorkflowHealth::Critical);
        start_doc(&mut state, "doc-10");
        assert_eq!(state.health(&cfg), WorkflowHealth::Critical);
    }

    #[test]
    fn test_leak_detection() {
        let cfg = config();
        let mut state = WorkflowState::default();
        for i in 0..21 {
            start_doc(&mut state, &format!("doc-{}", i));
        }
        let events = state.health_tick(&cfg);
        let leak = events
            .iter()
            .find(|e| e.failure == WorkflowFailure::MemoryLeakDetected)
            .unwrap();
        assert_eq!(leak.workflow_kind, WorkflowKind::DocumentProcessing);
        assert_eq!(leak.documents_being_processed, 21);
    }

    #[test]
    fn test_integrity_validation_flags_bad_transactions() {
        let cfg = config();
        let mut state = WorkflowState::default();
        state.apply(
            &cfg,
            Command::StartTransaction {
                id: "tx-ok".to_string(),
                transaction: txn("tx-ok", 25.0, "groceries"),
                ack: ack(),
            },
        );
        state.apply(
            &cfg,
            Command::StartTransaction {
                id: "tx-bad".to_string(),
                transaction: txn("tx-bad", 0.0, "refund"),
                ack: ack(),
            },
        );
        state.apply(
            &cfg,
            Command::StartTransaction {
                id: "tx-blank".to_string(),
                transaction: txn("tx-blank", 5.0, ""),
                ack: ack(),
            },
        );

        let events = state.health_tick(&cfg);
        let violations: Vec<_> = events
            .iter()
            .filter(|e| e.failure == WorkflowFailure::TransactionIntegrityViolation)
            .collect();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|e| e.workflow_kind == WorkflowKind::TransactionAnalysis));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_refires_every_tick() {
        let cfg = config();
        let mut state = WorkflowState::default();
        start_doc(&mut state, "doc-1");

        tokio::time::advance(Duration::from_secs(301)).await;

        let first = state.health_tick(&cfg);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].failure, WorkflowFailure::WorkflowStalled);
        assert_eq!(first[0].workflow_kind, WorkflowKind::DocumentProcessing);
        assert_eq!(first[0].documents_being_processed, 1);
        assert_eq!(state.active.get("doc-1").unwrap().status, WorkflowStatus::LongRunning);

        // Condition still holds: the next tick reports it again.
        let second = state.health_tick(&cfg);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].failure, WorkflowFailure::WorkflowStalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_window_pruning() {
        let cfg = config();
        let mut state = WorkflowState::default();
        for _ in 0..6 {
            state.record_error(&cfg);
        }
        assert_eq!(state.health(&cfg), WorkflowHealth::Critical);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(state.health(&cfg), WorkflowHealth::Healthy);
    }

    #[tokio::test]
    async fn test_actor_roundtrip() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut monitor = FinancialWorkflowMonitor::new(config(), bus);
        let handle = monitor.handle();
        monitor.start();

        handle.start_document_processing("doc-1", WorkflowKind::DocumentProcessing).await;
        handle.finish_document_processing("doc-1", false, 0).await;

        match rx.recv().await.unwrap() {
            MonitorEvent::Workflow(event) => {
                assert_eq!(event.failure, WorkflowFailure::DocumentProcessingFailed);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_document_count, 0);
        assert_eq!(snapshot.current_status, WorkflowHealth::Warning);

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_call_is_applied_on_return() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut monitor = FinancialWorkflowMonitor::new(config(), bus);
        let handle = monitor.handle();
        monitor.start();

        // Once the call returns, the workflow must be registered even
        // if the clock jumps immediately afterwards.
        handle.start_document_processing("doc-1", WorkflowKind::DocumentProcessing).await;
        tokio::time::advance(Duration::from_secs(301)).await;

        let event = loop {
            match rx.recv().await.unwrap() {
                MonitorEvent::Workflow(event)
                    if event.failure == WorkflowFailure::WorkflowStalled =>
                {
                    break event
                }
                _ => {}
            }
        };
        assert_eq!(event.documents_being_processed, 1);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_restart_keeps_handles_live() {
        let bus = EventBus::new(64);
        let mut monitor = FinancialWorkflowMonitor::new(config(), bus);
        let handle = monitor.handle();

        monitor.start();
        monitor.stop().await;
        monitor.start();
        assert!(monitor.is_running());

        // A handle cloned before the restart still reaches the worker.
        handle.start_document_processing("doc-1", WorkflowKind::DocumentProcessing).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_document_count, 1);

        monitor.stop().await;
    }
}
