use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::alerts::{LogNotifier, Notifier};
use crate::analysis::{Analyzer, AnalysisSession, HAZARD_PROMPT};
use crate::capture::CapturedImage;
use crate::config::{CaptureConfig, Config, MAX_CAMERAS};
use crate::detection::{Detection, DetectionHistory, DetectionStats};
use crate::devices::{Device, DeviceRegistry, MediaDevices, MediaStream};
use crate::errors::{Result, MonitorError};
use crate::persistence::{PersistedView, StoredCamera};
use crate::scheduler::AnalysisScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Active,
    Paused,
    Error,
}

/// Live camera slot. Only ever touched while holding the monitor state lock.
pub(crate) struct CameraRecord {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub status: CameraStatus,
    pub stream: Option<Arc<dyn MediaStream>>,
    pub last_capture: Option<CapturedImage>,
    pub last_report: Option<(CapturedImage, String)>,
    pub error_message: Option<String>,
    pub is_analyzing: bool,
    pub analysis_enabled: bool,
    pub analysis_interval: Option<Duration>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub danger_detected: bool,
    pub stream_generation: u64,
    pub analysis_epoch: u64,
}

impl CameraRecord {
    pub fn new(id: String, name: String, device_id: String) -> Self {
        Self {
            id,
            name,
            device_id,
            status: CameraStatus::Paused,
            stream: None,
            last_capture: None,
            last_report: None,
            error_message: None,
            is_analyzing: false,
            analysis_enabled: false,
            analysis_interval: None,
            last_analysis_at: None,
            danger_detected: false,
            stream_generation: 0,
            analysis_epoch: 0,
        }
    }

    /// Release the stream, if any. Safe to call repeatedly.
    pub fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }

    pub fn view(&self) -> CameraView {
        CameraView {
            id: self.id.clone(),
            name: self.name.clone(),
            device_id: self.device_id.clone(),
            status: self.status,
            has_stream: self.stream.is_some(),
            error_message: self.error_message.clone(),
            is_analyzing: self.is_analyzing,
            analysis_enabled: self.analysis_enabled,
            analysis_interval_ms: self.analysis_interval.map(|d| d.as_millis() as u64),
            last_analysis_at: self.last_analysis_at,
            last_capture_at: self.last_capture.as_ref().map(|c| c.captured_at),
            danger_detected: self.danger_detected,
        }
    }

    fn stored(&self) -> StoredCamera {
        StoredCamera {
            id: self.id.clone(),
            name: self.name.clone(),
            device_id: self.device_id.clone(),
            was_active: self.status == CameraStatus::Active,
            analysis_enabled: self.analysis_enabled,
            analysis_interval_ms: self.analysis_interval.map(|d| d.as_millis() as u64),
        }
    }
}

/// Read-only snapshot of a camera handed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraView {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub status: CameraStatus,
    pub has_stream: bool,
    pub error_message: Option<String>,
    pub is_analyzing: bool,
    pub analysis_enabled: bool,
    pub analysis_interval_ms: Option<u64>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub last_capture_at: Option<DateTime<Utc>>,
    pub danger_detected: bool,
}

pub(crate) struct MonitorState {
    pub cameras: Vec<CameraRecord>,     // creation order
    pub history: DetectionHistory,
}

impl MonitorState {
    pub fn camera(&self, id: &str) -> Option<&CameraRecord> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn camera_mut(&mut self, id: &str) -> Option<&mut CameraRecord> {
        self.cameras.iter_mut().find(|c| c.id == id)
    }

    pub fn require_mut(&mut self, id: &str) -> Result<&mut CameraRecord> {
        self.camera_mut(id)
            .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' does not exist", id)))
    }

    pub fn bound_devices(&self) -> HashSet<String> {
        self.cameras.iter().map(|c| c.device_id.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub max_cameras: usize,
    pub history_limit: usize,
    pub capture: CaptureConfig,
    pub analysis_interval: Duration,
    pub analysis_timeout: Duration,
    pub prompt: String,
    pub restore_active: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_cameras: MAX_CAMERAS,
            history_limit: 100,
            capture: CaptureConfig::default(),
            analysis_interval: Duration::from_secs(10),
            analysis_timeout: Duration::from_secs(30),
            prompt: HAZARD_PROMPT.to_string(),
            restore_active: false,
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            max_cameras: config.monitor.max_cameras.min(MAX_CAMERAS),
            history_limit: config.monitor.history_limit,
            capture: config.capture.clone(),
            analysis_interval: config.analysis.interval()?,
            analysis_timeout: config.analysis.timeout()?,
            prompt: config.analysis.prompt.clone().unwrap_or_else(|| HAZARD_PROMPT.to_string()),
            restore_active: config.monitor.restore_active,
        })
    }
}

/// Owner of every camera slot and the detection history.
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SafetyMonitor {
    pub(crate) state: Arc<RwLock<MonitorState>>,
    pub(crate) registry: DeviceRegistry,
    pub(crate) analyzer: Option<Arc<dyn Analyzer>>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) view: Option<PersistedView>,
    pub(crate) scheduler: AnalysisScheduler,
    pub(crate) settings: Arc<MonitorSettings>,
    persist_lock: Arc<Mutex<()>>,
}

impl SafetyMonitor {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        analyzer: Option<Arc<dyn Analyzer>>,
        notifier: Option<Arc<dyn Notifier>>,
        view: Option<PersistedView>,
        settings: MonitorSettings,
    ) -> Self {
        let state = MonitorState {
            cameras: Vec::new(),
            history: DetectionHistory::new(settings.history_limit),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            registry: DeviceRegistry::new(media),
            analyzer,
            notifier: notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            view,
            scheduler: AnalysisScheduler::new(),
            settings: Arc::new(settings),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn analyzer(&self) -> Option<Arc<dyn Analyzer>> {
        self.analyzer.clone()
    }

    pub async fn scan_devices(&self) -> Result<Vec<Device>> {
        self.registry.scan().await
    }

    /// Scanned devices not yet bound to a camera
    pub async fn available_devices(&self) -> Vec<Device> {
        let bound = self.state.read().await.bound_devices();
        self.registry.available(&bound).await
    }

    pub async fn cameras(&self) -> Vec<CameraView> {
        self.state.read().await.cameras.iter().map(CameraRecord::view).collect()
    }

    pub async fn camera(&self, camera_id: &str) -> Result<CameraView> {
        self.state.read().await
            .camera(camera_id)
            .map(CameraRecord::view)
            .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' does not exist", camera_id)))
    }

    pub async fn last_capture(&self, camera_id: &str) -> Option<CapturedImage> {
        self.state.read().await.camera(camera_id)?.last_capture.clone()
    }

    pub async fn detections(&self) -> Vec<Detection> {
        self.state.read().await.history.to_vec()
    }

    pub async fn recent_detections(&self, limit: usize, camera_id: Option<&str>) -> Vec<Detection> {
        self.state.read().await.history.recent(limit, camera_id)
    }

    pub async fn detection_stats(&self) -> DetectionStats {
        self.state.read().await.history.stats()
    }

    /// Start a follow-up conversation about the camera's most recent analyzed frame
    pub async fn open_session(&self, camera_id: &str) -> Result<AnalysisSession> {
        let state = self.state.read().await;
        let camera = state.camera(camera_id)
            .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' does not exist", camera_id)))?;
        let (image, description) = camera.last_report.clone()
            .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' has not been analyzed yet", camera_id)))?;
        Ok(AnalysisSession::new(camera.id.clone(), camera.name.clone(), image, description))
    }

    /// Snapshot and save happen under one guard so saves land in state order
    pub(crate) async fn persist_cameras(&self) {
        let Some(view) = self.view.clone() else { return };
        let _guard = self.persist_lock.lock().await;
        let stored: Vec<StoredCamera> = self.state.read().await
            .cameras
            .iter()
            .map(CameraRecord::stored)
            .collect();
        write_blocking(move || view.save_cameras(&stored)).await;
    }

    pub(crate) async fn persist_detections(&self) {
        let Some(view) = self.view.clone() else { return };
        let _guard = self.persist_lock.lock().await;
        let detections = self.state.read().await.history.to_vec();
        write_blocking(move || view.save_detections(&detections)).await;
    }

    /// Reload persisted cameras and history. Cameras come back paused unless
    /// `restore_active` is set and they were streaming when last saved.
    pub async fn restore(&self) -> usize {
        let Some(view) = &self.view else { return 0 };
        let stored = view.load_cameras();
        let detections = view.load_detections();

        let mut restored = Vec::new();
        {
            let mut state = self.state.write().await;
            state.history = DetectionHistory::from_entries(detections, self.settings.history_limit);

            for camera in stored {
                if state.cameras.len() >= self.settings.max_cameras {
                    warn!("Skipping persisted camera '{}': camera limit reached", camera.id);
                    continue;
                }
                if state.camera(&camera.id).is_some() || state.bound_devices().contains(&camera.device_id) {
                    warn!("Skipping persisted camera '{}': duplicate id or device", camera.id);
                    continue;
                }
                state.cameras.push(CameraRecord::new(camera.id.clone(), camera.name.clone(), camera.device_id.clone()));
                restored.push(camera);
            }
        }

        info!("Restored {} camera(s) from persisted state", restored.len());

        if self.settings.restore_active {
            for camera in restored.iter().filter(|c| c.was_active) {
                debug!("Resuming camera '{}'", camera.id);
                if let Err(e) = self.start_camera(&camera.id).await {
                    warn!("Failed to resume camera '{}': {}", camera.id, e);
                    continue;
                }
                if camera.analysis_enabled {
                    let interval = camera.analysis_interval_ms.map(Duration::from_millis);
                    if let Err(e) = self.enable_analysis(&camera.id, interval).await {
                        warn!("Failed to resume analysis for camera '{}': {}", camera.id, e);
                    }
                }
            }
        }

        restored.len()
    }

    /// Cancel every timer and release every stream. Persisted state keeps the
    /// pre-shutdown status so active cameras can be resumed.
    pub async fn shutdown(&self) {
        self.persist_cameras().await;
        self.scheduler.cancel_all();

        let mut state = self.state.write().await;
        for camera in state.cameras.iter_mut() {
            camera.stream_generation += 1;
            camera.analysis_epoch += 1;
            camera.release_stream();
            camera.status = CameraStatus::Paused;
            camera.is_analyzing = false;
            camera.analysis_enabled = false;
        }
        info!("Released {} camera(s)", state.cameras.len());
    }
}

async fn write_blocking(write: impl FnOnce() + Send + 'static) {
    if let Err(e) = tokio::task::spawn_blocking(write).await {
        warn!("Persist task failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Severity;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::persistence::{MemoryStore, ViewStore, CAMERAS_KEY};
    use crate::testing::{sample_image, FakeDevices};

    /// Memory store whose next camera save stalls once armed
    #[derive(Default)]
    struct StallingStore {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    impl ViewStore for StallingStore {
        fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
            if key == CAMERAS_KEY && self.armed.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.inner.save(key, value)
        }

        fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.load(key)
        }
    }

    fn monitor_with(fake: Arc<FakeDevices>, view: PersistedView, settings: MonitorSettings) -> SafetyMonitor {
        SafetyMonitor::new(fake, None, None, Some(view), settings)
    }

    #[tokio::test]
    async fn test_restore_brings_cameras_back_paused() {
        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        let view = PersistedView::new(Arc::new(MemoryStore::new()));
        view.save_cameras(&[StoredCamera {
            id: "c1".to_string(),
            name: "Gate".to_string(),
            device_id: "d1".to_string(),
            was_active: true,
            analysis_enabled: true,
            analysis_interval_ms: Some(10_000),
        }]);
        view.save_detections(&[Detection::new("c1", "Gate", Utc::now(), sample_image(), "Fire".to_string(), Severity::High)]);

        let monitor = monitor_with(fake.clone(), view, MonitorSettings::default());
        assert_eq!(monitor.restore().await, 1);

        let camera = monitor.camera("c1").await.unwrap();
        assert_eq!(camera.status, CameraStatus::Paused);
        assert!(!camera.has_stream);
        assert!(!camera.analysis_enabled);
        assert_eq!(monitor.detections().await.len(), 1);
        assert_eq!(fake.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_restore_resumes_active_cameras_when_configured() {
        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        fake.add_device("d2", "Yard");
        let view = PersistedView::new(Arc::new(MemoryStore::new()));
        let stored = |id: &str, device: &str, active: bool| StoredCamera {
            id: id.to_string(),
            name: id.to_string(),
            device_id: device.to_string(),
            was_active: active,
            analysis_enabled: false,
            analysis_interval_ms: None,
        };
        view.save_cameras(&[stored("c1", "d1", true), stored("c2", "d2", false), stored("c3", "d1", true)]);

        let settings = MonitorSettings { restore_active: true, ..MonitorSettings::default() };
        let monitor = monitor_with(fake.clone(), view, settings);
        assert_eq!(monitor.restore().await, 2);

        assert_eq!(monitor.camera("c1").await.unwrap().status, CameraStatus::Active);
        assert_eq!(monitor.camera("c2").await.unwrap().status, CameraStatus::Paused);
        assert!(monitor.camera("c3").await.is_err());
        assert_eq!(fake.live_streams(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_streams() {
        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        let view = PersistedView::new(Arc::new(MemoryStore::new()));
        let monitor = monitor_with(fake.clone(), view.clone(), MonitorSettings::default());

        let camera = monitor.add_camera("d1", None, false).await.unwrap();
        monitor.start_camera(&camera.id).await.unwrap();
        assert_eq!(fake.live_streams(), 1);

        monitor.shutdown().await;
        assert_eq!(fake.live_streams(), 0);
        assert!(view.load_cameras()[0].was_active);
    }

    #[tokio::test]
    async fn test_open_session_requires_prior_analysis() {
        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        let monitor = SafetyMonitor::new(fake, None, None, None, MonitorSettings::default());
        let camera = monitor.add_camera("d1", Some("Gate".to_string()), false).await.unwrap();

        assert!(matches!(
            monitor.open_session(&camera.id).await,
            Err(MonitorError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_saves_keep_latest_camera_list() {
        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        let store = Arc::new(StallingStore::default());
        let monitor = monitor_with(fake, PersistedView::new(store.clone()), MonitorSettings::default());
        let camera = monitor.add_camera("d1", None, false).await.unwrap();

        store.armed.store(true, Ordering::SeqCst);
        let rename = {
            let monitor = monitor.clone();
            let id = camera.id.clone();
            tokio::spawn(async move { monitor.rename_camera(&id, "Gate").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.remove_camera(&camera.id).await.unwrap();
        rename.await.unwrap().unwrap();

        assert!(monitor.cameras().await.is_empty());
        assert!(PersistedView::new(store).load_cameras().is_empty());
    }
}
