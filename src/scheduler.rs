use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::alerts::Alert;
use crate::capture::{capture_frame, CaptureProfile};
use crate::detection::{classify, Classification, Detection};
use crate::errors::{Result, MonitorError};
use crate::monitor::{CameraStatus, CameraView, SafetyMonitor};

/// Central registry of per-camera analysis timers.
/// Cancellation is synchronous so lifecycle operations can call it under the state lock.
#[derive(Clone, Default)]
pub struct AnalysisScheduler {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AnalysisScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the timer produced by `spawn` unless one is already live.
    /// Returns false when an existing timer was kept.
    pub fn install(&self, camera_id: &str, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut timers = self.timers();
        if timers.get(camera_id).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        timers.insert(camera_id.to_string(), spawn());
        true
    }

    pub fn cancel(&self, camera_id: &str) -> bool {
        match self.timers().remove(camera_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, camera_id: &str) -> bool {
        self.timers().get(camera_id).is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_all(&self) {
        for (camera_id, handle) in self.timers().drain() {
            trace!("Cancelling analysis timer of camera '{}'", camera_id);
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotActive,
    InFlight,
    NoAnalyzer,
    NoFrame,
}

/// What one analysis cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Clear,
    Hazard(Detection),
    Failed(String),
    /// The camera was stopped, disabled or removed while the request was in flight
    Discarded,
}

struct CycleToken {
    camera_name: String,
    stream_generation: u64,
    analysis_epoch: u64,
}

impl SafetyMonitor {
    /// Start periodic analysis. A camera with a live timer keeps it.
    pub async fn enable_analysis(&self, camera_id: &str, interval: Option<Duration>) -> Result<CameraView> {
        let period = interval.unwrap_or(self.settings.analysis_interval);
        if period.is_zero() {
            return Err(MonitorError::config("Analysis interval must be positive"));
        }

        let view = {
            let mut state = self.state.write().await;
            let camera = state.require_mut(camera_id)?;

            let monitor = self.clone();
            let id = camera_id.to_string();
            let installed = self.scheduler.install(camera_id, move || tokio::spawn(monitor.run_timer(id, period)));
            if installed {
                camera.analysis_enabled = true;
                camera.analysis_interval = Some(period);
                info!("Enabled analysis for camera '{}' every {:?}", camera_id, period);
            } else {
                debug!("Analysis already scheduled for camera '{}'", camera_id);
            }
            camera.view()
        };

        self.persist_cameras().await;
        Ok(view)
    }

    pub async fn disable_analysis(&self, camera_id: &str) -> Result<CameraView> {
        let view = {
            let mut state = self.state.write().await;
            let camera = state.require_mut(camera_id)?;
            self.scheduler.cancel(camera_id);
            camera.analysis_epoch += 1;
            camera.analysis_enabled = false;
            camera.is_analyzing = false;
            camera.danger_detected = false;
            camera.view()
        };

        info!("Disabled analysis for camera '{}'", camera_id);
        self.persist_cameras().await;
        Ok(view)
    }

    /// Run one cycle now, outside the timer, through the same single-flight gate
    pub async fn analyze_now(&self, camera_id: &str) -> Result<CycleOutcome> {
        self.camera(camera_id).await?;
        Ok(self.run_cycle(camera_id).await)
    }

    async fn run_timer(self, camera_id: String, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // Detached: a tick that lands mid-cycle is dropped by the in-flight gate
            let monitor = self.clone();
            let id = camera_id.clone();
            tokio::spawn(async move {
                monitor.run_cycle(&id).await;
            });
        }
    }

    pub async fn run_cycle(&self, camera_id: &str) -> CycleOutcome {
        let (stream, analyzer, token) = {
            let mut state = self.state.write().await;
            let Some(camera) = state.camera_mut(camera_id) else {
                return CycleOutcome::Skipped(SkipReason::NotActive);
            };
            let stream = match (&camera.status, &camera.stream) {
                (CameraStatus::Active, Some(stream)) => stream.clone(),
                _ => return CycleOutcome::Skipped(SkipReason::NotActive),
            };
            if camera.is_analyzing {
                trace!("Analysis still in flight for camera '{}', skipping tick", camera_id);
                return CycleOutcome::Skipped(SkipReason::InFlight);
            }
            let Some(analyzer) = self.analyzer.clone() else {
                return CycleOutcome::Skipped(SkipReason::NoAnalyzer);
            };
            camera.is_analyzing = true;
            let token = CycleToken {
                camera_name: camera.name.clone(),
                stream_generation: camera.stream_generation,
                analysis_epoch: camera.analysis_epoch,
            };
            (stream, analyzer, token)
        };

        let profile = CaptureProfile::analysis(&self.settings.capture);
        let Some(image) = capture_frame(stream.as_ref(), &profile) else {
            if let Some(camera) = self.state.write().await.camera_mut(camera_id) {
                if camera.analysis_epoch == token.analysis_epoch {
                    camera.is_analyzing = false;
                }
            }
            debug!("No frame available from camera '{}', skipping tick", camera_id);
            return CycleOutcome::Skipped(SkipReason::NoFrame);
        };

        debug!("Analyzing {}x{} frame from camera '{}'", image.width, image.height, camera_id);

        // Own task, so a panicking analyzer still clears the gate
        let request = {
            let image = image.clone();
            let prompt = self.settings.prompt.clone();
            tokio::spawn(async move { analyzer.analyze(&image, &prompt).await })
        };
        let timeout = self.settings.analysis_timeout;
        let abort = request.abort_handle();
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(MonitorError::analysis(format!("Analysis task failed: {}", join_error))),
            Err(_) => {
                abort.abort();
                Err(MonitorError::analysis(format!("Analysis timed out after {:?}", timeout)))
            }
        };

        let outcome = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let Some(camera) = state.cameras.iter_mut().find(|c| c.id == camera_id) else {
                debug!("Discarding analysis result for removed camera '{}'", camera_id);
                return CycleOutcome::Discarded;
            };

            if camera.analysis_epoch != token.analysis_epoch {
                debug!("Discarding stale analysis result for camera '{}'", camera_id);
                return CycleOutcome::Discarded;
            }
            camera.is_analyzing = false;
            camera.last_analysis_at = Some(Utc::now());

            if camera.stream_generation != token.stream_generation || camera.status != CameraStatus::Active {
                debug!("Camera '{}' restarted during analysis, discarding result", camera_id);
                return CycleOutcome::Discarded;
            }

            match result {
                Err(e) => {
                    warn!("Analysis failed for camera '{}': {}", camera_id, e);
                    CycleOutcome::Failed(e.to_string())
                }
                Ok(description) => {
                    camera.last_capture = Some(image.clone());
                    camera.last_report = Some((image.clone(), description.clone()));
                    match classify(&description) {
                        Classification::Clear => {
                            trace!("Camera '{}' is clear", camera_id);
                            camera.danger_detected = false;
                            CycleOutcome::Clear
                        }
                        Classification::Hazard(severity) => {
                            camera.danger_detected = true;
                            let detection = Detection::new(
                                camera_id,
                                &token.camera_name,
                                image.captured_at,
                                image,
                                description,
                                severity,
                            );
                            state.history.push(detection.clone());
                            CycleOutcome::Hazard(detection)
                        }
                    }
                }
            }
        };

        if let CycleOutcome::Hazard(detection) = &outcome {
            info!("Camera '{}' {} hazard: {}", camera_id, detection.severity, detection.description);
            if let Err(e) = self.notifier.notify(&Alert::for_detection(detection)) {
                warn!("Failed to deliver alert for camera '{}': {}", camera_id, e);
            }
            self.persist_detections().await;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::detection::Severity;
    use crate::monitor::MonitorSettings;
    use crate::persistence::{MemoryStore, PersistedView};
    use crate::testing::{FakeAnalyzer, FakeDevices, RecordingNotifier};

    struct Harness {
        monitor: SafetyMonitor,
        fake: Arc<FakeDevices>,
        analyzer: Arc<FakeAnalyzer>,
        alerts: Arc<RecordingNotifier>,
    }

    fn harness(analyzer: FakeAnalyzer, settings: MonitorSettings) -> Harness {
        harness_with(analyzer, RecordingNotifier::new(), settings)
    }

    fn harness_with(analyzer: FakeAnalyzer, notifier: RecordingNotifier, settings: MonitorSettings) -> Harness {
        let fake = Arc::new(FakeDevices::new());
        for i in 1..=3 {
            fake.add_device(&format!("d{}", i), &format!("Device {}", i));
        }
        let analyzer = Arc::new(analyzer);
        let alerts = Arc::new(notifier);
        let monitor = SafetyMonitor::new(
            fake.clone(),
            Some(analyzer.clone() as Arc<dyn Analyzer>),
            Some(alerts.clone()),
            Some(PersistedView::new(Arc::new(MemoryStore::new()))),
            settings,
        );
        Harness { monitor, fake, analyzer, alerts }
    }

    async fn active_camera(monitor: &SafetyMonitor, device_id: &str) -> String {
        let camera = monitor.add_camera(device_id, None, false).await.unwrap();
        monitor.start_camera(&camera.id).await.unwrap();
        camera.id
    }

    #[tokio::test(start_paused = true)]
    async fn test_autostart_then_periodic_analysis_records_high_detection() {
        let h = harness(FakeAnalyzer::replying("Fire detected near exit, high risk"), MonitorSettings::default());
        let camera = h.monitor.add_camera("d1", Some("Exit".to_string()), true).await.unwrap();

        for _ in 0..10 {
            if h.monitor.camera(&camera.id).await.unwrap().status == CameraStatus::Active {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.monitor.camera(&camera.id).await.unwrap().status, CameraStatus::Active);

        h.monitor.enable_analysis(&camera.id, Some(Duration::from_millis(1000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let detections = h.monitor.detections().await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].severity, Severity::High);
        assert_eq!(detections[0].camera_name, "Exit");
        let view = h.monitor.camera(&camera.id).await.unwrap();
        assert!(view.danger_detected);
        assert!(!view.is_analyzing);
        assert!(view.last_analysis_at.is_some());

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_outstanding_request_is_skipped() {
        let h = harness(FakeAnalyzer::never(), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        h.monitor.enable_analysis(&id, Some(Duration::from_millis(1000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(h.analyzer.calls(), 1);
        assert!(h.monitor.camera(&id).await.unwrap().is_analyzing);
        assert_eq!(h.monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(h.analyzer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_gate_and_next_tick_retries() {
        let settings = MonitorSettings {
            analysis_timeout: Duration::from_millis(1500),
            ..MonitorSettings::default()
        };
        let h = harness(FakeAnalyzer::never(), settings);
        let id = active_camera(&h.monitor, "d1").await;

        h.monitor.enable_analysis(&id, Some(Duration::from_millis(1000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3200)).await;

        // tick 1 times out at 2.5s, tick 2 is dropped, tick 3 retries
        assert_eq!(h.analyzer.calls(), 2);
        assert!(h.monitor.detections().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_response_creates_no_detection() {
        let h = harness(FakeAnalyzer::replying("NO DANGER DETECTED."), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        assert_eq!(h.monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Clear);
        assert!(h.monitor.detections().await.is_empty());
        assert!(!h.monitor.camera(&id).await.unwrap().danger_detected);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_clear_response_resets_danger_flag() {
        let h = harness(FakeAnalyzer::replying("Worker without hard hat"), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        let CycleOutcome::Hazard(detection) = h.monitor.analyze_now(&id).await.unwrap() else {
            panic!("expected a hazard");
        };
        assert_eq!(detection.severity, Severity::Medium);
        assert!(h.monitor.camera(&id).await.unwrap().danger_detected);

        h.analyzer.reply_with("No danger detected.");
        assert_eq!(h.monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Clear);
        assert!(!h.monitor.camera(&id).await.unwrap().danger_detected);
        assert_eq!(h.monitor.detections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_from_keywords() {
        let h = harness(FakeAnalyzer::replying("Small fire in skip bin"), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        for (reply, expected) in [
            ("Small fire in skip bin", Severity::High),
            ("Minor issue: cones knocked over", Severity::Low),
            ("Unsecured load on crane hook", Severity::Medium),
        ] {
            h.analyzer.reply_with(reply);
            match h.monitor.analyze_now(&id).await.unwrap() {
                CycleOutcome::Hazard(detection) => assert_eq!(detection.severity, expected, "{}", reply),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_alert_still_records_detection() {
        let h = harness_with(FakeAnalyzer::replying("Fire"), RecordingNotifier::failing(), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        assert!(matches!(h.monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Hazard(_)));

        let detections = h.monitor.detections().await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].severity, Severity::High);
        assert!(h.monitor.camera(&id).await.unwrap().danger_detected);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_analysis_clears_gate() {
        let h = harness(FakeAnalyzer::failing("bad status 500"), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        assert!(matches!(h.monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Failed(_)));
        let view = h.monitor.camera(&id).await.unwrap();
        assert!(!view.is_analyzing);
        assert!(view.last_analysis_at.is_some());
        assert!(h.monitor.detections().await.is_empty());
    }

    #[tokio::test]
    async fn test_skips_paused_camera_and_missing_analyzer() {
        let h = harness(FakeAnalyzer::replying("Fire"), MonitorSettings::default());
        let camera = h.monitor.add_camera("d1", None, false).await.unwrap();
        assert_eq!(
            h.monitor.analyze_now(&camera.id).await.unwrap(),
            CycleOutcome::Skipped(SkipReason::NotActive)
        );

        let fake = Arc::new(FakeDevices::new());
        fake.add_device("d1", "Gate");
        let monitor = SafetyMonitor::new(fake, None, None, None, MonitorSettings::default());
        let id = active_camera(&monitor, "d1").await;
        assert_eq!(monitor.analyze_now(&id).await.unwrap(), CycleOutcome::Skipped(SkipReason::NoAnalyzer));
        assert_eq!(h.analyzer.calls(), 0);
        assert!(matches!(h.monitor.analyze_now("missing").await, Err(MonitorError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_discarded_after_stop() {
        let h = harness(
            FakeAnalyzer::replying("Explosion near tank").delayed(Duration::from_secs(2)),
            MonitorSettings::default(),
        );
        let id = active_camera(&h.monitor, "d1").await;

        let cycle = {
            let monitor = h.monitor.clone();
            let id = id.clone();
            tokio::spawn(async move { monitor.analyze_now(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.analyzer.calls(), 1);

        h.monitor.stop_camera(&id).await.unwrap();
        assert_eq!(cycle.await.unwrap().unwrap(), CycleOutcome::Discarded);
        assert!(h.monitor.detections().await.is_empty());
        assert!(!h.monitor.camera(&id).await.unwrap().danger_detected);
        assert_eq!(h.fake.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_discarded_after_remove() {
        let h = harness(
            FakeAnalyzer::replying("Fire").delayed(Duration::from_secs(2)),
            MonitorSettings::default(),
        );
        let id = active_camera(&h.monitor, "d1").await;
        h.monitor.enable_analysis(&id, Some(Duration::from_secs(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.analyzer.calls(), 1);

        h.monitor.remove_camera(&id).await.unwrap();
        assert!(!h.monitor.scheduler.is_scheduled(&id));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.analyzer.calls(), 1);
        assert!(h.monitor.detections().await.is_empty());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_is_idempotent_and_disable_cancels() {
        let h = harness(FakeAnalyzer::replying("No danger detected."), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;

        h.monitor.enable_analysis(&id, Some(Duration::from_secs(1))).await.unwrap();
        let view = h.monitor.enable_analysis(&id, Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(view.analysis_interval_ms, Some(1000));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.analyzer.calls(), 2);

        let view = h.monitor.disable_analysis(&id).await.unwrap();
        assert!(!view.analysis_enabled);
        assert!(!h.monitor.scheduler.is_scheduled(&id));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.analyzer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_paused_camera_cancels_its_timer() {
        let h = harness(FakeAnalyzer::replying("No danger detected."), MonitorSettings::default());
        let camera = h.monitor.add_camera("d1", None, false).await.unwrap();

        h.monitor.enable_analysis(&camera.id, Some(Duration::from_secs(1))).await.unwrap();
        assert!(h.monitor.scheduler.is_scheduled(&camera.id));

        let view = h.monitor.stop_camera(&camera.id).await.unwrap();
        assert_eq!(view.status, CameraStatus::Paused);
        assert!(!view.analysis_enabled);
        assert!(!h.monitor.scheduler.is_scheduled(&camera.id));
        assert_eq!(h.analyzer.calls(), 0);
    }

    #[tokio::test]
    async fn test_removal_purges_only_that_cameras_detections() {
        let h = harness(FakeAnalyzer::replying("Worker at height without harness"), MonitorSettings::default());
        let a = active_camera(&h.monitor, "d1").await;
        let b = active_camera(&h.monitor, "d2").await;

        h.monitor.analyze_now(&a).await.unwrap();
        h.monitor.analyze_now(&b).await.unwrap();
        h.monitor.analyze_now(&a).await.unwrap();
        assert_eq!(h.monitor.detections().await.len(), 3);

        h.monitor.remove_camera(&a).await.unwrap();
        let remaining = h.monitor.detections().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].camera_id, b);
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let settings = MonitorSettings { history_limit: 50, ..MonitorSettings::default() };
        let h = harness(FakeAnalyzer::replying("Blocked exit"), settings);
        let id = active_camera(&h.monitor, "d1").await;

        for i in 0..51 {
            h.analyzer.reply_with(&format!("Blocked exit #{}", i));
            h.monitor.analyze_now(&id).await.unwrap();
        }

        let detections = h.monitor.detections().await;
        assert_eq!(detections.len(), 50);
        assert_eq!(detections[0].description, "Blocked exit #50");
        assert!(detections.iter().all(|d| d.description != "Blocked exit #0"));
    }

    #[tokio::test]
    async fn test_follow_up_session_uses_last_report() {
        let h = harness(FakeAnalyzer::replying("Crane load swinging over workers"), MonitorSettings::default());
        let id = active_camera(&h.monitor, "d1").await;
        h.monitor.analyze_now(&id).await.unwrap();

        let mut session = h.monitor.open_session(&id).await.unwrap();
        assert_eq!(session.description, "Crane load swinging over workers");

        h.analyzer.reply_with("Clear the area under the load.");
        let answer = session.ask(h.analyzer.as_ref(), "What now?", Duration::from_secs(5)).await.unwrap();
        assert_eq!(answer, "Clear the area under the load.");
    }
}
