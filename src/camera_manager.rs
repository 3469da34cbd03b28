use tracing::{debug, error, info, warn};

use crate::capture::{capture_frame, CaptureProfile, CapturedImage};
use crate::devices::StreamConstraints;
use crate::errors::{Result, MonitorError};
use crate::monitor::{CameraRecord, CameraStatus, CameraView, SafetyMonitor};

impl SafetyMonitor {
    /// Commit a new paused camera. With `auto_start` the stream is acquired
    /// in the background once the record is visible to readers.
    pub async fn add_camera(&self, device_id: &str, name: Option<String>, auto_start: bool) -> Result<CameraView> {
        let view = {
            let mut state = self.state.write().await;

            if state.cameras.len() >= self.settings.max_cameras {
                warn!("Rejecting camera for device '{}': limit of {} reached", device_id, self.settings.max_cameras);
                return Err(MonitorError::capacity(format!(
                    "Maximum of {} cameras reached",
                    self.settings.max_cameras
                )));
            }

            if let Some(existing) = state.cameras.iter().find(|c| c.device_id == device_id) {
                return Err(MonitorError::capacity(format!(
                    "Device '{}' is already in use by camera '{}'",
                    device_id, existing.name
                )));
            }

            let name = name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("Camera {}", state.cameras.len() + 1));

            let record = CameraRecord::new(uuid::Uuid::new_v4().to_string(), name, device_id.to_string());
            let view = record.view();
            state.cameras.push(record);
            view
        };

        info!("Added camera '{}' ({}) on device '{}'", view.id, view.name, view.device_id);
        self.persist_cameras().await;

        if auto_start {
            let monitor = self.clone();
            let camera_id = view.id.clone();
            tokio::spawn(async move {
                if let Err(e) = monitor.start_camera(&camera_id).await {
                    error!("Auto-start failed for camera '{}': {}", camera_id, e);
                }
            });
        }

        Ok(view)
    }

    /// Acquire a fresh stream. Any existing stream is released first.
    pub async fn start_camera(&self, camera_id: &str) -> Result<CameraView> {
        let (constraints, generation) = {
            let mut state = self.state.write().await;
            let camera = state.require_mut(camera_id)?;
            camera.stream_generation += 1;
            if camera.stream.is_some() {
                debug!("Releasing previous stream of camera '{}' before restart", camera_id);
                camera.release_stream();
                camera.status = CameraStatus::Paused;
            }
            let constraints = StreamConstraints {
                device_id: camera.device_id.clone(),
                width: self.settings.capture.ideal_width,
                height: self.settings.capture.ideal_height,
            };
            (constraints, camera.stream_generation)
        };

        info!("Starting camera '{}' on device '{}'", camera_id, constraints.device_id);
        let acquired = self.registry.media().get_stream(&constraints).await;

        let outcome = {
            let mut state = self.state.write().await;
            let Some(camera) = state.camera_mut(camera_id) else {
                if let Ok(stream) = acquired {
                    stream.stop();
                }
                debug!("Camera '{}' was removed while its stream was being acquired", camera_id);
                return Err(MonitorError::not_found(format!("Camera '{}' does not exist", camera_id)));
            };

            if camera.stream_generation != generation {
                if let Ok(stream) = acquired {
                    stream.stop();
                }
                debug!("Discarding superseded stream acquisition for camera '{}'", camera_id);
                return Ok(camera.view());
            }

            match acquired {
                Ok(stream) => {
                    camera.stream = Some(stream);
                    camera.status = CameraStatus::Active;
                    camera.error_message = None;
                    Ok(camera.view())
                }
                Err(e) => {
                    let message = format!("Failed to start camera: {}", e);
                    camera.status = CameraStatus::Error;
                    camera.error_message = Some(message.clone());
                    Err(MonitorError::device(message))
                }
            }
        };

        match &outcome {
            Ok(_) => info!("Camera '{}' is active", camera_id),
            Err(e) => error!("Camera '{}' failed to start: {}", camera_id, e),
        }
        self.persist_cameras().await;
        outcome
    }

    /// Release the stream, pause and cancel analysis. Stopping a paused camera
    /// only invalidates a start that is still acquiring and drops its timer.
    pub async fn stop_camera(&self, camera_id: &str) -> Result<CameraView> {
        let view = {
            let mut state = self.state.write().await;
            let camera = state.require_mut(camera_id)?;
            camera.stream_generation += 1;

            let already_paused = camera.status == CameraStatus::Paused && camera.stream.is_none();
            if already_paused && !camera.analysis_enabled {
                debug!("Camera '{}' is already paused", camera_id);
                return Ok(camera.view());
            }

            if !already_paused {
                camera.release_stream();
                camera.status = CameraStatus::Paused;
                camera.error_message = None;
                camera.danger_detected = false;
            }
            if self.scheduler.cancel(camera_id) {
                debug!("Cancelled analysis timer of camera '{}'", camera_id);
            }
            camera.analysis_epoch += 1;
            camera.analysis_enabled = false;
            camera.is_analyzing = false;
            camera.view()
        };

        info!("Stopped camera '{}'", camera_id);
        self.persist_cameras().await;
        Ok(view)
    }

    pub async fn toggle_camera(&self, camera_id: &str) -> Result<CameraView> {
        let status = self.camera(camera_id).await?.status;
        if status == CameraStatus::Active {
            self.stop_camera(camera_id).await
        } else {
            self.start_camera(camera_id).await
        }
    }

    /// Stop, cancel analysis, delete the record and purge its detections
    pub async fn remove_camera(&self, camera_id: &str) -> Result<CameraView> {
        let (view, purged) = {
            let mut state = self.state.write().await;
            let index = state.cameras.iter().position(|c| c.id == camera_id)
                .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' does not exist", camera_id)))?;

            self.scheduler.cancel(camera_id);
            let mut camera = state.cameras.remove(index);
            camera.stream_generation += 1;
            camera.analysis_epoch += 1;
            camera.release_stream();
            camera.status = CameraStatus::Paused;

            let purged = state.history.purge_camera(camera_id);
            (camera.view(), purged)
        };

        info!("Removed camera '{}' and {} detection(s)", camera_id, purged);
        self.persist_cameras().await;
        if purged > 0 {
            self.persist_detections().await;
        }
        Ok(view)
    }

    pub async fn rename_camera(&self, camera_id: &str, name: &str) -> Result<CameraView> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MonitorError::config("Camera name must not be empty"));
        }

        let view = {
            let mut state = self.state.write().await;
            let camera = state.require_mut(camera_id)?;
            camera.name = name.to_string();
            camera.view()
        };

        info!("Renamed camera '{}' to '{}'", camera_id, name);
        self.persist_cameras().await;
        Ok(view)
    }

    /// Full-resolution still of the current frame. `Ok(None)` when the stream
    /// has not produced a frame yet.
    pub async fn capture_snapshot(&self, camera_id: &str) -> Result<Option<CapturedImage>> {
        let stream = {
            let state = self.state.read().await;
            let camera = state.camera(camera_id)
                .ok_or_else(|| MonitorError::not_found(format!("Camera '{}' does not exist", camera_id)))?;
            match (&camera.status, &camera.stream) {
                (CameraStatus::Active, Some(stream)) => stream.clone(),
                _ => return Err(MonitorError::device(format!("Camera '{}' is not active", camera_id))),
            }
        };

        let profile = CaptureProfile::snapshot(&self.settings.capture);
        let Some(image) = capture_frame(stream.as_ref(), &profile) else {
            debug!("Camera '{}' has no frame to capture yet", camera_id);
            return Ok(None);
        };

        if let Some(camera) = self.state.write().await.camera_mut(camera_id) {
            camera.last_capture = Some(image.clone());
        }
        Ok(Some(image))
    }
}
