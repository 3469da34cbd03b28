use std::sync::Arc;

use crate::alerts::Notifier;
use crate::analysis::Analyzer;
use crate::devices::MediaDevices;
use crate::errors::{Result, MonitorError};
use crate::monitor::{MonitorSettings, SafetyMonitor};
use crate::persistence::{PersistedView, ViewStore};

/// Builder for SafetyMonitor so callers only name the collaborators they have
pub struct SafetyMonitorBuilder {
    media: Option<Arc<dyn MediaDevices>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    notifier: Option<Arc<dyn Notifier>>,
    store: Option<Arc<dyn ViewStore>>,
    settings: MonitorSettings,
}

impl SafetyMonitorBuilder {
    pub fn new() -> Self {
        Self {
            media: None,
            analyzer: None,
            notifier: None,
            store: None,
            settings: MonitorSettings::default(),
        }
    }

    pub fn media(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn analyzer(mut self, analyzer: Option<Arc<dyn Analyzer>>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(mut self, store: Arc<dyn ViewStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<SafetyMonitor> {
        let media = self.media.ok_or_else(|| MonitorError::config("A media device source is required"))?;
        if self.settings.max_cameras == 0 {
            return Err(MonitorError::config("max_cameras must be at least 1"));
        }

        Ok(SafetyMonitor::new(
            media,
            self.analyzer,
            self.notifier,
            self.store.map(PersistedView::new),
            self.settings,
        ))
    }
}

impl Default for SafetyMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
