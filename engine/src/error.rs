//! Error handling for the FinSentry engine
//!
//! This module provides the error types for all engine operations,
//! including configuration loading, metric collection, event routing,
//! and alert delivery.

use std::io;

use thiserror::Error;

/// The main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metric collection errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Alert delivery errors
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    /// Event channel errors (bus closed, subscriber lagged out)
    #[error("Event channel error: {0}")]
    Channel(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Monitor lifecycle errors (double start, stop before start)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Metric collection errors
///
/// These are never fatal: providers fall back to last-known-good
/// values and the failure is logged at low severity.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric read failed: {metric}: {reason}")]
    ReadFailed { metric: String, reason: String },

    #[error("Metric source unavailable: {name}")]
    SourceUnavailable { name: String },

    #[error("Responsiveness probe timed out after {timeout_ms}ms")]
    ProbeTimeout { timeout_ms: u64 },
}

/// Alert delivery errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Notification sink delivery failed: {reason}")]
    DeliveryFailed { reason: String },

    #[error("Unknown alert id: {id}")]
    UnknownAlert { id: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for metric collection
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// A specialized result type for alert operations
pub type AlertResult<T> = std::result::Result<T, AlertError>;

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Metrics(_) => true,
            EngineError::Alert(_) => true,
            EngineError::Channel(_) => true,
            EngineError::Config(_) => false,
            EngineError::Lifecycle(_) => false,
            EngineError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => true,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Metrics(_) => "metrics",
            EngineError::Alert(_) => "alert",
            EngineError::Channel(_) => "channel",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Lifecycle(_) => "lifecycle",
            EngineError::Generic(_) => "generic",
        }
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Generic(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Generic(msg.to_string())
    }
}
