use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use image::{ImageBuffer, Rgb, RgbImage};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, DeviceSource};
use crate::devices::{DeviceInfo, DeviceKind, MediaDevices, MediaStream, StreamConstraints};
use crate::errors::{Result, MonitorError};
use crate::utils::parse_interval;

/// Synthetic moving gradient, useful for demos and for sites without hardware yet
pub struct TestPatternStream {
    device_id: String,
    width: u32,
    height: u32,
    started: Instant,
    live: AtomicBool,
}

impl TestPatternStream {
    pub fn new(device_id: &str, width: u32, height: u32) -> Self {
        Self {
            device_id: device_id.to_string(),
            width,
            height,
            started: Instant::now(),
            live: AtomicBool::new(true),
        }
    }

    fn render(&self) -> RgbImage {
        let t = self.started.elapsed().as_millis() as u32;
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let r = ((x + t / 10) % 255) as u8;
            let g = ((y + t / 20) % 255) as u8;
            let b = ((x + y + t / 5) % 255) as u8;
            Rgb([r, g, b])
        })
    }
}

impl MediaStream for TestPatternStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        if !self.is_live() {
            return None;
        }
        Some(Arc::new(self.render()))
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Test pattern '{}' stopped", self.device_id);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// IP camera exposing a JPEG snapshot URL. A background task polls the URL
/// and keeps the most recent decoded frame.
pub struct SnapshotStream {
    device_id: String,
    frame: Arc<RwLock<Option<Arc<RgbImage>>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    live: AtomicBool,
}

async fn fetch_frame(client: &reqwest::Client, url: &str) -> Result<RgbImage> {
    let res = client.get(url).send().await?;
    let status = res.status();
    if !status.is_success() {
        return Err(MonitorError::device(format!("Snapshot request returned {}", status)));
    }
    let body = res.bytes().await?;
    Ok(image::load_from_memory(&body)?.to_rgb8())
}

impl SnapshotStream {
    /// Fetch the first frame, then keep polling. Fails if the first fetch fails.
    pub async fn connect(client: reqwest::Client, device_id: &str, url: &str, poll_interval: Duration) -> Result<Self> {
        let first = fetch_frame(&client, url).await
            .map_err(|e| MonitorError::device(format!("Could not reach snapshot camera '{}': {}", device_id, e)))?;
        info!("Snapshot camera '{}' connected ({}x{})", device_id, first.width(), first.height());

        let frame = Arc::new(RwLock::new(Some(Arc::new(first))));
        let poller = {
            let frame = frame.clone();
            let device_id = device_id.to_string();
            let url = url.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match fetch_frame(&client, &url).await {
                        Ok(image) => {
                            if let Ok(mut slot) = frame.write() {
                                *slot = Some(Arc::new(image));
                            }
                        }
                        Err(e) => warn!("Snapshot poll failed for camera '{}': {}", device_id, e),
                    }
                }
            })
        };

        Ok(Self {
            device_id: device_id.to_string(),
            frame,
            poller: Mutex::new(Some(poller)),
            live: AtomicBool::new(true),
        })
    }
}

impl MediaStream for SnapshotStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        if !self.is_live() {
            return None;
        }
        self.frame.read().ok()?.clone()
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        let poller = self.poller.lock().ok().and_then(|mut slot| slot.take());
        if let Some(poller) = poller {
            poller.abort();
            debug!("Snapshot poller for '{}' stopped", self.device_id);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Devices declared under `[[devices]]` in the configuration
pub struct ConfiguredDevices {
    devices: Vec<DeviceConfig>,
    client: reqwest::Client,
}

impl ConfiguredDevices {
    pub fn from_config(devices: &[DeviceConfig]) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            devices: devices.to_vec(),
            client,
        })
    }

    fn find(&self, device_id: &str) -> Result<&DeviceConfig> {
        self.devices.iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| MonitorError::device(format!("Requested device not found: {}", device_id)))
    }
}

#[async_trait]
impl MediaDevices for ConfiguredDevices {
    async fn request_permission(&self) -> Result<Arc<dyn MediaStream>> {
        let first = self.devices.first()
            .ok_or_else(|| MonitorError::device("No video input devices found"))?;
        Ok(Arc::new(TestPatternStream::new(&first.id, 1, 1)))
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.iter()
            .map(|d| DeviceInfo {
                device_id: d.id.clone(),
                label: d.label.clone().unwrap_or_default(),
                kind: DeviceKind::VideoInput,
            })
            .collect())
    }

    async fn get_stream(&self, constraints: &StreamConstraints) -> Result<Arc<dyn MediaStream>> {
        let device = self.find(&constraints.device_id)?;
        match &device.source {
            DeviceSource::TestPattern { width, height } => {
                let width = constraints.width.min(*width).max(1);
                let height = constraints.height.min(*height).max(1);
                debug!("Negotiated {}x{} for test pattern '{}'", width, height, device.id);
                Ok(Arc::new(TestPatternStream::new(&device.id, width, height)))
            }
            DeviceSource::Snapshot { url, poll_interval } => {
                let poll_interval = parse_interval(poll_interval)?;
                let stream = SnapshotStream::connect(self.client.clone(), &device.id, url, poll_interval).await?;
                Ok(Arc::new(stream))
            }
        }
    }
}
