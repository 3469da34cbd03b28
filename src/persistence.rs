use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detection::Detection;
use crate::errors::{Result, MonitorError};

pub const CAMERAS_KEY: &str = "cameras";
pub const DETECTIONS_KEY: &str = "detections";

/// Durable key/value mirror of view state. Never the system of record for live streams.
pub trait ViewStore: Send + Sync {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// One compact JSON file per key, replaced atomically on every save
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            info!("Creating state directory '{}'", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\', '.']) {
            return Err(MonitorError::storage(format!("Invalid state key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ViewStore for JsonFileStore {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!("{}.{}.tmp", key, Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("Saved state '{}' to {}", key, path.display());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViewStore for MemoryStore {
    fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| MonitorError::storage("state store lock poisoned"))?
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values
            .lock()
            .map_err(|_| MonitorError::storage("state store lock poisoned"))?
            .get(key)
            .cloned())
    }
}

/// Persisted shape of a camera slot. Streams and in-flight flags are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCamera {
    pub id: String,
    pub name: String,
    pub device_id: String,
    #[serde(default)]
    pub was_active: bool,
    #[serde(default)]
    pub analysis_enabled: bool,
    pub analysis_interval_ms: Option<u64>,
}

/// Typed view over a `ViewStore`. Load failures fall back to empty defaults.
#[derive(Clone)]
pub struct PersistedView {
    store: Arc<dyn ViewStore>,
}

impl PersistedView {
    pub fn new(store: Arc<dyn ViewStore>) -> Self {
        Self { store }
    }

    pub fn save_cameras(&self, cameras: &[StoredCamera]) {
        self.save(CAMERAS_KEY, cameras);
    }

    pub fn load_cameras(&self) -> Vec<StoredCamera> {
        self.load(CAMERAS_KEY)
    }

    pub fn save_detections(&self, detections: &[Detection]) {
        self.save(DETECTIONS_KEY, detections);
    }

    pub fn load_detections(&self) -> Vec<Detection> {
        self.load(DETECTIONS_KEY)
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let result = serde_json::to_value(value)
            .map_err(MonitorError::from)
            .and_then(|json| self.store.save(key, &json));
        if let Err(e) = result {
            warn!("Failed to persist '{}': {}", key, e);
        }
    }

    fn load<T: for<'de> Deserialize<'de> + Default>(&self, key: &str) -> T {
        match self.store.load(key) {
            Ok(Some(json)) => serde_json::from_value(json).unwrap_or_else(|e| {
                warn!("Discarding unreadable persisted '{}': {}", key, e);
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                warn!("Failed to load persisted '{}': {}", key, e);
                T::default()
            }
        }
    }
}
