use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use image::{ImageBuffer, Rgb, RgbImage};
use tokio::sync::Notify;

use crate::alerts::{Alert, Notifier};
use crate::analysis::Analyzer;
use crate::capture::CapturedImage;
use crate::devices::{DeviceInfo, DeviceKind, MediaDevices, MediaStream, StreamConstraints};
use crate::errors::{Result, MonitorError};

/// Tiny fixed JPEG with a stable timestamp so values compare equal across calls
pub fn sample_image() -> CapturedImage {
    CapturedImage {
        data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9]),
        mime_type: "image/jpeg".to_string(),
        width: 1,
        height: 1,
        captured_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
    }
}

pub struct FakeStream {
    device_id: String,
    frame: Option<Arc<RgbImage>>,
    live: AtomicBool,
    counter: Option<Arc<AtomicUsize>>,
}

impl FakeStream {
    pub fn with_frame(device_id: &str, width: u32, height: u32) -> Self {
        let frame: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        Self {
            device_id: device_id.to_string(),
            frame: Some(Arc::new(frame)),
            live: AtomicBool::new(true),
            counter: None,
        }
    }

    pub fn without_frame(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            frame: None,
            live: AtomicBool::new(true),
            counter: None,
        }
    }

    fn counted(mut self, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        self.counter = Some(counter);
        self
    }
}

impl MediaStream for FakeStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        if self.is_live() { self.frame.clone() } else { None }
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(counter) = &self.counter {
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Scriptable media subsystem that counts how many streams are still live
#[derive(Default)]
pub struct FakeDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    deny_permission: AtomicBool,
    failing: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    live: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device_id: &str, label: &str) {
        self.add_raw(DeviceInfo {
            device_id: device_id.to_string(),
            label: label.to_string(),
            kind: DeviceKind::VideoInput,
        });
    }

    pub fn add_raw(&self, info: DeviceInfo) {
        self.devices.lock().unwrap().push(info);
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn fail_device(&self, device_id: &str) {
        self.failing.lock().unwrap().insert(device_id.to_string());
    }

    /// Hold every `get_stream` call until the gate is notified
    pub fn set_acquire_gate(&self, gate: Arc<Notify>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn knows(&self, device_id: &str) -> bool {
        self.devices.lock().unwrap().iter().any(|d| d.device_id == device_id)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn request_permission(&self) -> Result<Arc<dyn MediaStream>> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(MonitorError::device("Permission denied"));
        }
        Ok(Arc::new(FakeStream::with_frame("probe", 4, 4).counted(self.live.clone())))
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_stream(&self, constraints: &StreamConstraints) -> Result<Arc<dyn MediaStream>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().unwrap().contains(&constraints.device_id) {
            return Err(MonitorError::device("Could not start video source"));
        }
        if !self.knows(&constraints.device_id) {
            return Err(MonitorError::device(format!("Requested device not found: {}", constraints.device_id)));
        }

        let stream = FakeStream::with_frame(&constraints.device_id, 640, 480).counted(self.live.clone());
        Ok(Arc::new(stream))
    }
}

enum Behavior {
    Reply(String),
    Fail(String),
    Never,
}

pub struct FakeAnalyzer {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeAnalyzer {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with(Behavior::Reply(text.to_string()))
    }

    pub fn failing(message: &str) -> Self {
        Self::with(Behavior::Fail(message.to_string()))
    }

    /// Every call stays pending forever
    pub fn never() -> Self {
        Self::with(Behavior::Never)
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn reply_with(&self, text: &str) {
        *self.behavior.lock().unwrap() = Behavior::Reply(text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(&self, _image: &CapturedImage, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = match &*self.behavior.lock().unwrap() {
            Behavior::Reply(text) => Some(Ok(text.clone())),
            Behavior::Fail(message) => Some(Err(MonitorError::analysis(message.clone()))),
            Behavior::Never => None,
        };
        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, alert: &Alert) -> Result<()> {
        if self.fail {
            return Err(MonitorError::notification("sink unavailable"));
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
