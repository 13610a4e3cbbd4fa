//! Alerting: suppression, deduplication, and delivery
//!
//! Consumes crash reports from the coordinator and turns the ones that
//! matter into user-visible alerts. Everything upstream is silent
//! telemetry; this is the only component with user-visible failure
//! behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AlertingConfig;
use crate::coordinator::CrashReport;
use crate::error::{AlertError, AlertResult};
use crate::events::{CrashKind, Severity};

/// A delivered (or deliverable) incident alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashAlert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: CrashKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub action_items: Vec<String>,
    pub suppression_key: String,
    pub source_report_id: String,
}

/// Destination for delivered alerts (push notification, webhook, ...)
///
/// Delivery failures are logged and never retried; the alert still
/// counts as delivered for suppression purposes.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, alert: &CrashAlert) -> AlertResult<()>;
    fn name(&self) -> &str;
}

/// Sink that writes alerts to the structured log
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn deliver(&self, alert: &CrashAlert) -> AlertResult<()> {
        match alert.severity {
            Severity::Fatal | Severity::Critical => error!(
                alert_id = %alert.id,
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                title = %alert.title,
                message = %alert.message,
                "CRITICAL ALERT"
            ),
            Severity::High => warn!(
                alert_id = %alert.id,
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                title = %alert.title,
                message = %alert.message,
                "alert raised"
            ),
            Severity::Medium | Severity::Low => info!(
                alert_id = %alert.id,
                kind = alert.kind.as_str(),
                title = %alert.title,
                "alert raised"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

struct AlertState {
    active: VecDeque<CrashAlert>,
    history: VecDeque<CrashAlert>,
    delivered_keys: HashMap<String, Instant>,
    suppress_until: Option<Instant>,
}

/// Deduplicating, bounded alert pipeline
pub struct AlertSystem {
    config: AlertingConfig,
    state: RwLock<AlertState>,
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl AlertSystem {
    pub fn new(config: AlertingConfig) -> Self {
        Self::with_sinks(config, vec![Box::new(LogNotificationSink)])
    }

    pub fn with_sinks(config: AlertingConfig, sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self {
            config,
            state: RwLock::new(AlertState {
                active: VecDeque::new(),
                history: VecDeque::new(),
                delivered_keys: HashMap::new(),
                suppress_until: None,
            }),
            sinks,
        }
    }

    /// Run a report through suppression, severity, and deduplication
    /// filters; deliver it if it survives. Returns the delivered alert.
    pub fn process_report(&self, report: &CrashReport) -> Option<CrashAlert> {
        if !self.category_enabled(report.kind) {
            debug!(kind = report.kind.as_str(), "alert category disabled");
            return None;
        }
        if report.severity < self.config.alert_threshold {
            debug!(
                severity = report.severity.as_str(),
                threshold = self.config.alert_threshold.as_str(),
                "report below alert threshold"
            );
            return None;
        }

        let now = Instant::now();
        let dedup_window = Duration::from_secs(self.config.dedup_window_secs);
        let alert = {
            let mut state = self.state.write().unwrap();

            if let Some(until) = state.suppress_until {
                if now < until {
                    debug!(key = %report.suppression_key, "alerts temporarily suppressed");
                    return None;
                }
                state.suppress_until = None;
            }

            if let Some(last) = state.delivered_keys.get(&report.suppression_key) {
                if now.duration_since(*last) < dedup_window {
                    debug!(key = %report.suppression_key, "duplicate alert suppressed");
                    return None;
                }
            }

            let alert = build_alert(report);

            state.active.push_back(alert.clone());
            while state.active.len() > self.config.max_active_alerts {
                if let Some(evicted) = state.active.pop_front() {
                    debug!(alert_id = %evicted.id, "active alert evicted to history");
                }
            }

            state.history.push_back(alert.clone());
            while state.history.len() > self.config.max_alert_history {
                state.history.pop_front();
            }

            state.delivered_keys.insert(report.suppression_key.clone(), now);
            // Stop the delivered-key map growing with dead keys.
            state.delivered_keys.retain(|_, t| now.duration_since(*t) < dedup_window);

            alert
        };

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&alert) {
                warn!(sink = sink.name(), alert_id = %alert.id, "alert delivery failed: {}", e);
            }
        }
        Some(alert)
    }

    /// Remove an alert from the active list; history keeps its copy.
    pub fn dismiss_alert(&self, id: &str) -> AlertResult<()> {
        let mut state = self.state.write().unwrap();
        let before = state.active.len();
        state.active.retain(|a| a.id != id);
        if state.active.len() == before {
            return Err(AlertError::UnknownAlert { id: id.to_string() });
        }
        info!(alert_id = %id, "alert dismissed");
        Ok(())
    }

    /// Arm (or re-arm, replacing any pending window) global suppression.
    pub fn suppress_temporarily(&self, duration: Duration) {
        let mut state = self.state.write().unwrap();
        state.suppress_until = Some(Instant::now() + duration);
        info!(duration_secs = duration.as_secs(), "alerts temporarily suppressed");
    }

    /// Clear the active alert list. History is the audit trail and stays.
    pub fn clear_all_alerts(&self) {
        let mut state = self.state.write().unwrap();
        let cleared = state.active.len();
        state.active.clear();
        info!(cleared, "active alerts cleared");
    }

    pub fn active_alerts(&self) -> Vec<CrashAlert> {
        self.state.read().unwrap().active.iter().cloned().collect()
    }

    pub fn alert_history(&self) -> Vec<CrashAlert> {
        self.state.read().unwrap().history.iter().cloned().collect()
    }

    fn category_enabled(&self, kind: CrashKind) -> bool {
        match kind {
            CrashKind::FinancialProcessingFailure => {
                self.config.enable_financial_processing_alerts
            }
            CrashKind::PerformanceDegradation
            | CrashKind::MemoryPressure
            | CrashKind::NetworkFailure => self.config.enable_system_health_alerts,
            CrashKind::ApplicationHang
            | CrashKind::SystemResourceExhaustion
            | CrashKind::DataCorruption => self.config.enable_crash_alerts,
        }
    }
}

/// Template the user-facing title/message/action items per crash kind.
fn build_alert(report: &CrashReport) -> CrashAlert {
    let (title, message) = match report.kind {
        CrashKind::ApplicationHang => (
            "Application unresponsive".to_string(),
            "The engine's main loop stopped responding within the configured limit.".to_string(),
        ),
        CrashKind::SystemResourceExhaustion => (
            "System resources exhausted".to_string(),
            "File descriptor, thread, or disk usage crossed a hard ceiling.".to_string(),
        ),
        CrashKind::MemoryPressure => (
            "Memory pressure".to_string(),
            "Memory usage crossed the warning threshold.".to_string(),
        ),
        CrashKind::DataCorruption => (
            "Possible data corruption".to_string(),
            "The memory integrity check scored below the acceptable floor.".to_string(),
        ),
        CrashKind::PerformanceDegradation => (
            "Performance degradation".to_string(),
            "Sustained or acute performance decline detected.".to_string(),
        ),
        CrashKind::NetworkFailure => (
            "Network failure".to_string(),
            "The network probe target is unreachable.".to_string(),
        ),
        CrashKind::FinancialProcessingFailure => (
            "Financial processing failure".to_string(),
            "A business workflow failed, stalled, or violated an integrity rule.".to_string(),
        ),
    };

    let mut message = message;
    if let Some(detail) = report.metadata.get("message") {
        message = format!("{} {}", message, detail);
    }
    if let Some(financial) = &report.financial_state {
        message = format!(
            "{} ({} documents in flight, {} transactions pending)",
            message, financial.active_document_count, financial.pending_transaction_count
        );
    }

    CrashAlert {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        kind: report.kind,
        severity: report.severity,
        title,
        message,
        action_items: report
            .recovery_actions
            .iter()
            .map(|a| a.description().to_string())
            .collect(),
        suppression_key: report.suppression_key.clone(),
        source_report_id: report.id.clone(),
    }
}
