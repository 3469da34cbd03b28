use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::CapturedImage;

const HIGH_KEYWORDS: &[&str] = &["fire", "explosion", "weapon", "violence", "emergency"];
const LOW_KEYWORDS: &[&str] = &["minor", "low risk"];
const CLEAR_PHRASES: &[&str] = &["no danger detected", "no hazard detected"];

static DETECTION_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Clear,
    Hazard(Severity),
}

/// Classify a model description. High keywords win over low keywords.
pub fn classify(description: &str) -> Classification {
    let text = description.to_lowercase();

    if CLEAR_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return Classification::Clear;
    }

    let severity = if HIGH_KEYWORDS.iter().any(|k| text.contains(k)) {
        Severity::High
    } else if LOW_KEYWORDS.iter().any(|k| text.contains(k)) {
        Severity::Low
    } else {
        Severity::Medium
    };

    Classification::Hazard(severity)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub camera_id: String,
    pub camera_name: String,
    pub timestamp: DateTime<Utc>,   // capture time of the analyzed frame
    pub image: CapturedImage,
    pub description: String,
    pub severity: Severity,
}

impl Detection {
    pub fn new(
        camera_id: &str,
        camera_name: &str,
        captured_at: DateTime<Utc>,
        image: CapturedImage,
        description: String,
        severity: Severity,
    ) -> Self {
        Self {
            id: format!(
                "{}-{}-{}",
                camera_id,
                captured_at.timestamp_millis(),
                DETECTION_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            camera_id: camera_id.to_string(),
            camera_name: camera_name.to_string(),
            timestamp: captured_at,
            image,
            description,
            severity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub by_camera: HashMap<String, usize>,
    pub last_detection_at: Option<DateTime<Utc>>,
}

/// Newest-first, size-bounded detection log
#[derive(Debug, Clone)]
pub struct DetectionHistory {
    entries: VecDeque<Detection>,
    limit: usize,
}

impl DetectionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    /// Rebuild from a persisted newest-first list
    pub fn from_entries(entries: Vec<Detection>, limit: usize) -> Self {
        let mut history = Self::new(limit);
        history.entries.extend(entries);
        history.entries.truncate(history.limit);
        history
    }

    pub fn push(&mut self, detection: Detection) {
        self.entries.push_front(detection);
        self.entries.truncate(self.limit);
    }

    /// Drop every detection produced by the camera, returning how many were removed
    pub fn purge_camera(&mut self, camera_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|d| d.camera_id != camera_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Detection> {
        self.entries.iter().cloned().collect()
    }

    pub fn recent(&self, limit: usize, camera_id: Option<&str>) -> Vec<Detection> {
        self.entries
            .iter()
            .filter(|d| camera_id.map_or(true, |id| d.camera_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DetectionStats {
        let mut stats = DetectionStats {
            total: self.entries.len(),
            last_detection_at: self.entries.front().map(|d| d.timestamp),
            ..DetectionStats::default()
        };
        for detection in &self.entries {
            *stats.by_severity.entry(detection.severity).or_insert(0) += 1;
            *stats.by_camera.entry(detection.camera_id.clone()).or_insert(0) += 1;
        }
        stats
    }
}
