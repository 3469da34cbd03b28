use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::detection::{Detection, Severity};
use crate::errors::{Result, MonitorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Info,
    Standard,
    Persistent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub detection_id: String,
    pub camera_id: String,
    pub camera_name: String,
    pub severity: Severity,
    pub urgency: Urgency,
    pub title: String,
    pub message: String,
    #[serde(with = "duration_ms")]
    pub display_for: Duration,
    pub timestamp: DateTime<Utc>,
}

mod duration_ms {
    use std::time::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

impl Alert {
    pub fn for_detection(detection: &Detection) -> Self {
        let (urgency, display_for, title) = match detection.severity {
            Severity::High => (
                Urgency::Persistent,
                Duration::from_secs(10),
                format!("HIGH DANGER on {}", detection.camera_name),
            ),
            Severity::Medium => (
                Urgency::Standard,
                Duration::from_secs(5),
                format!("Hazard detected on {}", detection.camera_name),
            ),
            Severity::Low => (
                Urgency::Info,
                Duration::from_secs(3),
                format!("Minor issue on {}", detection.camera_name),
            ),
        };

        Self {
            detection_id: detection.id.clone(),
            camera_id: detection.camera_id.clone(),
            camera_name: detection.camera_name.clone(),
            severity: detection.severity,
            urgency,
            title,
            message: detection.description.clone(),
            display_for,
            timestamp: detection.timestamp,
        }
    }
}

/// Fire-and-forget alert sink. Errors are logged by the caller and otherwise ignored.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log at a level matching their severity
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::High => error!("{}: {}", alert.title, alert.message),
            Severity::Medium => warn!("{}: {}", alert.title, alert.message),
            Severity::Low => info!("{}: {}", alert.title, alert.message),
        }
        Ok(())
    }
}

/// Fans alerts out to in-process subscribers such as WebSocket clients
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: Arc<broadcast::Sender<Alert>>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, alert: &Alert) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(alert.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, alert: &Alert) -> Result<()> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(alert) {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::notification(failures.join("; ")))
        }
    }
}
