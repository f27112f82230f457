// Operator alerts - success/failure events emitted by the orchestrators

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    /// Ledger could not record the outcome; operator action required
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(level: AlertLevel, message: impl Into<String>, context: Value) -> Self {
        Self {
            level,
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for alerts. Delivery failures must never fail the operation.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: AlertEvent);
}

/// Writes alerts to the tracing pipeline
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, event: AlertEvent) {
        let context = event.context.to_string();
        match event.level {
            AlertLevel::Info => info!(alert = %event.level, context = %context, "{}", event.message),
            AlertLevel::Warning => warn!(alert = %event.level, context = %context, "{}", event.message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(alert = %event.level, context = %context, "{}", event.message)
            }
        }
    }
}

/// Keeps every alert in memory; used by tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the alerts received so far
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }

    /// Levels in arrival order
    pub fn levels(&self) -> Vec<AlertLevel> {
        self.events.lock().iter().map(|e| e.level).collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, event: AlertEvent) {
        self.events.lock().push(event);
    }
}
