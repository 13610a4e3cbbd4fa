//! Configuration management for the FinSentry engine
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and environment variables. Every tunable the
//! monitors consult lives here, with defaults matching the production
//! policy.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::events::Severity;

/// Main configuration structure for the monitoring engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Crash detection configuration
    pub crash_detection: CrashDetectionConfig,

    /// Memory monitoring configuration
    pub memory_monitoring: MemoryMonitoringConfig,

    /// Performance tracking configuration
    pub performance_tracking: PerformanceTrackingConfig,

    /// Financial workflow monitoring configuration
    pub workflow: WorkflowConfig,

    /// Alerting configuration
    pub alerting: AlertingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Enable automatic recovery suggestions on reports
    pub enable_automatic_recovery: bool,

    /// Interval for periodic status reporting in seconds
    pub reporting_interval_secs: u64,
}

/// Crash detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashDetectionConfig {
    /// Enable crash report generation
    pub enable_crash_reporting: bool,

    /// Capture stack traces into crash context
    pub enable_stack_trace_capture: bool,

    /// Capture a live system state snapshot into each report
    pub enable_system_state_capture: bool,

    /// Minimum severity a crash event must reach to be reported
    pub reporting_level: Severity,

    /// Health-check tick interval in seconds
    pub check_interval_secs: u64,

    /// Watchdog tick interval in seconds
    pub watchdog_interval_secs: u64,

    /// Main-loop responsiveness limit in seconds
    pub hang_threshold_secs: f64,

    /// Open file descriptor ceiling
    pub max_file_descriptors: u64,

    /// Active thread ceiling
    pub max_threads: u64,

    /// Memory integrity score floor (0.0-1.0)
    pub min_integrity_score: f64,
}

/// Memory monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMonitoringConfig {
    /// Warning threshold as a percentage of total memory
    pub warning_pct: f64,

    /// Critical threshold as a percentage of total memory
    pub critical_pct: f64,

    /// Collection interval in seconds
    pub interval_secs: u64,
}

/// Performance tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceTrackingConfig {
    /// CPU usage threshold as a percentage
    pub cpu_threshold_pct: f64,

    /// Response time threshold in seconds
    pub response_time_threshold_secs: f64,

    /// Active thread threshold
    pub thread_threshold: u64,

    /// Network latency threshold in milliseconds
    pub network_latency_threshold_ms: f64,

    /// Minimum acceptable throughput in operations per second
    pub min_throughput_ops: f64,

    /// Snapshot interval in seconds
    pub interval_secs: u64,

    /// Maximum retained history points
    pub history_limit: usize,
}

/// Financial workflow monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Health tick interval in seconds
    pub health_interval_secs: u64,

    /// Age in seconds after which an active workflow counts as stalled
    pub stall_threshold_secs: u64,

    /// Active workflow count above which a leak is assumed
    pub leak_threshold: usize,

    /// Trailing window for error-rate accounting in seconds
    pub error_window_secs: u64,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Enable alerts for system crash events
    pub enable_crash_alerts: bool,

    /// Enable alerts for system health (watchdog/performance) events
    pub enable_system_health_alerts: bool,

    /// Enable alerts for financial processing events
    pub enable_financial_processing_alerts: bool,

    /// Minimum severity an incoming report must reach to alert
    pub alert_threshold: Severity,

    /// Deduplication window per suppression key in seconds
    pub dedup_window_secs: u64,

    /// Maximum concurrently active alerts
    pub max_active_alerts: usize,

    /// Maximum retained alert history entries
    pub max_alert_history: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format ("json" or "text")
    pub format: String,

    /// Enable console logging
    pub console: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            crash_detection: CrashDetectionConfig::default(),
            memory_monitoring: MemoryMonitoringConfig::default(),
            performance_tracking: PerformanceTrackingConfig::default(),
            workflow: WorkflowConfig::default(),
            alerting: AlertingConfig::default(),
            logging: LoggingConfig::default(),
            enable_automatic_recovery: true,
            reporting_interval_secs: 60,
        }
    }
}

impl Default for CrashDetectionConfig {
    fn default() -> Self {
        Self {
            enable_crash_reporting: true,
            enable_stack_trace_capture: true,
            enable_system_state_capture: true,
            reporting_level: Severity::Low,
            check_interval_secs: 1,
            watchdog_interval_secs: 10,
            hang_threshold_secs: 5.0,
            max_file_descriptors: 8000,
            max_threads: 500,
            min_integrity_score: 0.8,
        }
    }
}

impl Default for MemoryMonitoringConfig {
    fn default() -> Self {
        Self {
            warning_pct: 85.0,
            critical_pct: 95.0,
            interval_secs: 10,
        }
    }
}

impl Default for PerformanceTrackingConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_pct: 80.0,
            response_time_threshold_secs: 2.0,
            thread_threshold: 300,
            network_latency_threshold_ms: 1000.0,
            min_throughput_ops: 50.0,
            interval_secs: 5,
            history_limit: 50,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 5,
            stall_threshold_secs: 300,
            leak_threshold: 20,
            error_window_secs: 3600,
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enable_crash_alerts: true,
            enable_system_health_alerts: true,
            enable_financial_processing_alerts: true,
            alert_threshold: Severity::Medium,
            dedup_window_secs: 600,
            max_active_alerts: 5,
            max_alert_history: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            console: true,
        }
    }
}

impl MonitoringConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string_lossy().to_string(),
        })?;

        let config: MonitoringConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (FINSENTRY_* keys)
    pub fn apply_env_overrides(mut self) -> ConfigResult<Self> {
        if let Ok(level) = env::var("FINSENTRY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(value) = env::var("FINSENTRY_CPU_THRESHOLD") {
            self.performance_tracking.cpu_threshold_pct =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "performance_tracking.cpu_threshold_pct".to_string(),
                    value,
                })?;
        }
        if let Ok(value) = env::var("FINSENTRY_ALERT_THRESHOLD") {
            self.alerting.alert_threshold =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "alerting.alert_threshold".to_string(),
                    value,
                })?;
        }
        Ok(self)
    }

    /// Default configuration file location
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("finsentry")
            .join("engine.toml")
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.crash_detection.check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crash_detection.check_interval_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.crash_detection.watchdog_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "crash_detection.watchdog_interval_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.crash_detection.hang_threshold_secs <= 0.0 {
            return Err(ConfigError::ValidationFailed {
                reason: "hang threshold must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.crash_detection.min_integrity_score) {
            return Err(ConfigError::InvalidValue {
                field: "crash_detection.min_integrity_score".to_string(),
                value: self.crash_detection.min_integrity_score.to_string(),
            });
        }
        if self.memory_monitoring.warning_pct >= self.memory_monitoring.critical_pct {
            return Err(ConfigError::ValidationFailed {
                reason: "memory warning threshold must be below the critical threshold"
                    .to_string(),
            });
        }
        if self.performance_tracking.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "performance_tracking.interval_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.performance_tracking.cpu_threshold_pct <= 0.0
            || self.performance_tracking.cpu_threshold_pct > 100.0
        {
            return Err(ConfigError::InvalidValue {
                field: "performance_tracking.cpu_threshold_pct".to_string(),
                value: self.performance_tracking.cpu_threshold_pct.to_string(),
            });
        }
        if self.performance_tracking.history_limit < 10 {
            return Err(ConfigError::ValidationFailed {
                reason: "performance history must retain at least 10 points".to_string(),
            });
        }
        if self.workflow.health_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workflow.health_interval_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.workflow.stall_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workflow.stall_threshold_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.alerting.max_active_alerts == 0 || self.alerting.max_alert_history == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "alert list bounds must be positive".to_string(),
            });
        }
        if !matches!(self.logging.format.to_lowercase().as_str(), "json" | "text") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                value: self.logging.format.clone(),
            });
        }
        Ok(())
    }
}

impl CrashDetectionConfig {
    /// Health-check tick interval
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Watchdog tick interval
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

impl PerformanceTrackingConfig {
    /// Snapshot interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl WorkflowConfig {
    /// Health tick interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitoringConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crash_detection.check_interval_secs, 1);
        assert_eq!(config.crash_detection.watchdog_interval_secs, 10);
        assert_eq!(config.workflow.stall_threshold_secs, 300);
        assert_eq!(config.alerting.max_active_alerts, 5);
        assert_eq!(config.alerting.max_alert_history, 50);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert!(config.logging.console);
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let mut config = MonitoringConfig::default();
        config.crash_detection.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = MonitoringConfig::default();
        config.performance_tracking.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_memory_thresholds() {
        let mut config = MonitoringConfig::default();
        config.memory_monitoring.warning_pct = 96.0;
        config.memory_monitoring.critical_pct = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_format() {
        let mut config = MonitoringConfig::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        config.logging.format = "JSON".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_helpers_match_configured_seconds() {
        let config = MonitoringConfig::default();
        assert_eq!(
            config.crash_detection.check_interval(),
            Duration::from_secs(config.crash_detection.check_interval_secs)
        );
        assert_eq!(
            config.crash_detection.watchdog_interval(),
            Duration::from_secs(config.crash_detection.watchdog_interval_secs)
        );
        assert_eq!(
            config.performance_tracking.interval(),
            Duration::from_secs(config.performance_tracking.interval_secs)
        );
        assert_eq!(
            config.workflow.health_interval(),
            Duration::from_secs(config.workflow.health_interval_secs)
        );
    }

    #[test]
    fn test_from_file_roundtrip() {
        let config = MonitoringConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serialized.as_bytes()).unwrap();

        let loaded = MonitoringConfig::from_file(file.path()).unwrap();
        assert_eq!(
            loaded.performance_tracking.cpu_threshold_pct,
            config.performance_tracking.cpu_threshold_pct
        );
        assert_eq!(loaded.alerting.alert_threshold, config.alerting.alert_threshold);
    }

    #[test]
    fn test_from_file_missing() {
        let result = MonitoringConfig::from_file("/nonexistent/engine.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }
}
