use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Device error: {message}")]
    Device { message: String },

    #[error("{message}")]
    Capacity { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Analysis error: {message}")]
    Analysis { message: String },

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("Notification error: {message}")]
    Notification { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
}

impl MonitorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device { message: message.into() }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis { message: message.into() }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }

    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification { message: message.into() }
    }

    /// Errors scoped to one camera or one analysis cycle; the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Device { .. } | Self::Analysis { .. } | Self::Capture { .. } | Self::Http { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(MonitorError::device("Permission denied").is_recoverable());
        assert!(MonitorError::analysis("bad status 500").is_recoverable());
        assert!(!MonitorError::config("interval out of range").is_recoverable());
        assert!(!MonitorError::capacity("Maximum of 6 cameras reached").is_recoverable());
    }

    #[test]
    fn test_capacity_message_is_verbatim() {
        let err = MonitorError::capacity("Maximum of 6 cameras reached");
        assert_eq!(err.to_string(), "Maximum of 6 cameras reached");
    }
}
