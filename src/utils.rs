use std::time::Duration;
use crate::errors::{Result, MonitorError};

/// Parse a duration string like "500ms", "10s", "1m" into a std Duration
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MonitorError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(s)
        .map_err(|e| MonitorError::config(format!("Invalid duration '{}': {}", s, e)))?;

    if duration.is_zero() {
        return Err(MonitorError::config("Duration must be positive"));
    }

    Ok(duration)
}

/// Label shown for a device whose platform label is withheld before permission is granted
pub fn placeholder_label(device_id: &str) -> String {
    let short: String = device_id.chars().take(8).collect();
    if short.is_empty() {
        "Camera".to_string()
    } else {
        format!("Camera {}", short)
    }
}
