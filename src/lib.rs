pub mod alerts;
pub mod analysis;
pub mod api;
pub mod builders;
pub mod camera_manager;
pub mod capture;
pub mod config;
pub mod detection;
pub mod devices;
pub mod errors;
pub mod monitor;
pub mod mqtt;
pub mod persistence;
pub mod scheduler;
pub mod sources;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use builders::SafetyMonitorBuilder;
pub use errors::{MonitorError, Result};
pub use monitor::{CameraStatus, CameraView, SafetyMonitor};
