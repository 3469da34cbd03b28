use std::collections::HashSet;
use std::sync::Arc;
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::utils::placeholder_label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

/// Raw entry as reported by the platform media subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

/// A video input ready to be bound to a camera slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConstraints {
    pub device_id: String,
    pub width: u32,   // ideal, the source may negotiate lower
    pub height: u32,
}

/// A live capture stream. Owned by exactly one camera while it is active.
pub trait MediaStream: Send + Sync {
    fn device_id(&self) -> &str;

    /// Most recent decoded frame, `None` while the source has not produced one yet
    fn latest_frame(&self) -> Option<Arc<RgbImage>>;

    /// Stop all tracks. Must be idempotent.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a throwaway stream so the platform unlocks device labels
    async fn request_permission(&self) -> Result<Arc<dyn MediaStream>>;

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    async fn get_stream(&self, constraints: &StreamConstraints) -> Result<Arc<dyn MediaStream>>;
}

#[derive(Clone)]
pub struct DeviceRegistry {
    media: Arc<dyn MediaDevices>,
    cached: Arc<RwLock<Vec<Device>>>,
}

impl DeviceRegistry {
    pub fn new(media: Arc<dyn MediaDevices>) -> Self {
        Self {
            media,
            cached: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn media(&self) -> Arc<dyn MediaDevices> {
        self.media.clone()
    }

    /// Request permission, enumerate, and keep only video inputs.
    /// On failure the cached list is cleared and the error is returned to the caller.
    pub async fn scan(&self) -> Result<Vec<Device>> {
        match self.scan_inner().await {
            Ok(devices) => {
                info!("Found {} video input device(s)", devices.len());
                *self.cached.write().await = devices.clone();
                Ok(devices)
            }
            Err(e) => {
                warn!("Device scan failed: {}", e);
                self.cached.write().await.clear();
                Err(e)
            }
        }
    }

    async fn scan_inner(&self) -> Result<Vec<Device>> {
        let probe = self.media.request_permission().await?;
        probe.stop();
        debug!("Permission probe on '{}' released", probe.device_id());

        let devices = self.media.enumerate().await?
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .map(|d| {
                let label = if d.label.trim().is_empty() {
                    placeholder_label(&d.device_id)
                } else {
                    d.label
                };
                Device { device_id: d.device_id, label }
            })
            .collect();

        Ok(devices)
    }

    pub async fn cached(&self) -> Vec<Device> {
        self.cached.read().await.clone()
    }

    /// Cached devices not bound to any camera
    pub async fn available(&self, bound: &HashSet<String>) -> Vec<Device> {
        self.cached.read().await
            .iter()
            .filter(|d| !bound.contains(&d.device_id))
            .cloned()
            .collect()
    }
}
