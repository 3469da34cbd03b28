use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, MonitorError};
use crate::utils::parse_interval;

/// Hard ceiling on concurrently configured cameras
pub const MAX_CAMERAS: usize = 6;

pub const MIN_ANALYSIS_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_ANALYSIS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SnapshotFormat {
    #[serde(rename = "jpeg")]
    Jpeg,
    #[serde(rename = "png")]
    Png,
}

impl Default for SnapshotFormat {
    fn default() -> Self {
        Self::Jpeg
    }
}

impl std::fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotFormat::Jpeg => write!(f, "jpeg"),
            SnapshotFormat::Png => write!(f, "png"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allow_origin: Some("*".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_max_cameras")]
    pub max_cameras: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Start restored cameras that were active when state was last saved
    #[serde(default)]
    pub restore_active: bool,
}

fn default_max_cameras() -> usize { MAX_CAMERAS }
fn default_history_limit() -> usize { 100 }
fn default_state_dir() -> String { "state".to_string() }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_cameras: default_max_cameras(),
            history_limit: default_history_limit(),
            state_dir: default_state_dir(),
            restore_active: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_analysis_max_width")]
    pub analysis_max_width: u32,
    #[serde(default = "default_analysis_max_height")]
    pub analysis_max_height: u32,
    #[serde(default = "default_analysis_quality")]
    pub analysis_quality: u8,     // JPEG quality 1-100 for frames sent to the model
    #[serde(default = "default_snapshot_quality")]
    pub snapshot_quality: u8,     // JPEG quality for user captures
    #[serde(default)]
    pub snapshot_format: SnapshotFormat,
    #[serde(default = "default_ideal_width")]
    pub ideal_width: u32,
    #[serde(default = "default_ideal_height")]
    pub ideal_height: u32,
}

fn default_analysis_max_width() -> u32 { 512 }
fn default_analysis_max_height() -> u32 { 384 }
fn default_analysis_quality() -> u8 { 60 }
fn default_snapshot_quality() -> u8 { 90 }
fn default_ideal_width() -> u32 { 1280 }
fn default_ideal_height() -> u32 { 720 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            analysis_max_width: default_analysis_max_width(),
            analysis_max_height: default_analysis_max_height(),
            analysis_quality: default_analysis_quality(),
            snapshot_quality: default_snapshot_quality(),
            snapshot_format: SnapshotFormat::default(),
            ideal_width: default_ideal_width(),
            ideal_height: default_ideal_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,      // Environment variable consulted when api_key is unset
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_interval")]
    pub interval: String,         // e.g. "10s", accepted range 5s..=60s
    #[serde(default = "default_timeout")]
    pub timeout: String,
    pub prompt: Option<String>,   // Overrides the built-in hazard prompt
}

fn default_api_key_env() -> String { "GEMINI_API_KEY".to_string() }
fn default_endpoint() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_model() -> String { "gemini-1.5-flash".to_string() }
fn default_interval() -> String { "10s".to_string() }
fn default_timeout() -> String { "30s".to_string() }

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            endpoint: default_endpoint(),
            model: default_model(),
            interval: default_interval(),
            timeout: default_timeout(),
            prompt: None,
        }
    }
}

impl AnalysisConfig {
    /// The configured key, falling back to the environment. Empty strings count as unset.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn interval(&self) -> Result<Duration> {
        parse_interval(&self.interval)
    }

    pub fn timeout(&self) -> Result<Duration> {
        parse_interval(&self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source")]
pub enum DeviceSource {
    #[serde(rename = "test_pattern")]
    TestPattern {
        #[serde(default = "default_pattern_width")]
        width: u32,
        #[serde(default = "default_pattern_height")]
        height: u32,
    },
    #[serde(rename = "snapshot")]
    Snapshot {
        url: String,
        #[serde(default = "default_poll_interval")]
        poll_interval: String,
    },
}

fn default_pattern_width() -> u32 { 1280 }
fn default_pattern_height() -> u32 { 720 }
fn default_poll_interval() -> String { "1s".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub label: Option<String>,
    #[serde(flatten)]
    pub source: DeviceSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            monitor: MonitorConfig::default(),
            capture: CaptureConfig::default(),
            analysis: AnalysisConfig::default(),
            devices: vec![DeviceConfig {
                id: "test-pattern-0".to_string(),
                label: Some("Test Pattern".to_string()),
                source: DeviceSource::TestPattern {
                    width: default_pattern_width(),
                    height: default_pattern_height(),
                },
            }],
            mqtt: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path.ends_with(".json"))
    }

    pub fn parse(content: &str, json: bool) -> Result<Self> {
        let mut config: Config = if json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.max_cameras == 0 || self.monitor.max_cameras > MAX_CAMERAS {
            return Err(MonitorError::config(format!(
                "max_cameras must be between 1 and {}", MAX_CAMERAS
            )));
        }

        if !(50..=100).contains(&self.monitor.history_limit) {
            return Err(MonitorError::config("history_limit must be between 50 and 100"));
        }

        let interval = self.analysis.interval()?;
        if interval < MIN_ANALYSIS_INTERVAL || interval > MAX_ANALYSIS_INTERVAL {
            return Err(MonitorError::config(format!(
                "analysis interval '{}' must be between 5s and 60s", self.analysis.interval
            )));
        }
        self.analysis.timeout()?;

        for quality in [self.capture.analysis_quality, self.capture.snapshot_quality] {
            if quality == 0 || quality > 100 {
                return Err(MonitorError::config("JPEG quality must be between 1 and 100"));
            }
        }

        if self.capture.analysis_max_width == 0 || self.capture.analysis_max_height == 0 {
            return Err(MonitorError::config("analysis frame bounds must be non-zero"));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(MonitorError::config(format!("Duplicate device id: {}", device.id)));
            }
            if let DeviceSource::Snapshot { url, poll_interval } = &device.source {
                url::Url::parse(url)
                    .map_err(|e| MonitorError::config(format!("Invalid snapshot URL '{}': {}", url, e)))?;
                parse_interval(poll_interval)?;
            }
        }

        Ok(())
    }
}
