use std::io::Cursor;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::{CaptureConfig, SnapshotFormat};
use crate::devices::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Jpeg { quality: u8 },
    Png,
}

impl Encoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Encoding::Jpeg { .. } => "image/jpeg",
            Encoding::Png => "image/png",
        }
    }
}

/// Size bound and encoding applied to a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProfile {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub encoding: Encoding,
}

impl CaptureProfile {
    /// Small, aggressively compressed frames for the analysis model
    pub fn analysis(config: &CaptureConfig) -> Self {
        Self {
            max_width: Some(config.analysis_max_width),
            max_height: Some(config.analysis_max_height),
            encoding: Encoding::Jpeg { quality: config.analysis_quality },
        }
    }

    /// Native resolution, high fidelity, for user-triggered captures
    pub fn snapshot(config: &CaptureConfig) -> Self {
        let encoding = match config.snapshot_format {
            SnapshotFormat::Jpeg => Encoding::Jpeg { quality: config.snapshot_quality },
            SnapshotFormat::Png => Encoding::Png,
        };
        Self {
            max_width: None,
            max_height: None,
            encoding,
        }
    }
}

/// An encoded still image. Serialized with the payload as a base64 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedImage {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl CapturedImage {
    pub fn to_base64(&self) -> String {
        B64.encode(&self.data)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

mod base64_bytes {
    use super::B64;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        B64.decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Fit (width, height) inside the bounds, preserving aspect ratio. Never upscales.
pub fn scaled_dimensions(width: u32, height: u32, max_width: Option<u32>, max_height: Option<u32>) -> (u32, u32) {
    let max_w = max_width.unwrap_or(width).max(1);
    let max_h = max_height.unwrap_or(height).max(1);
    if width <= max_w && height <= max_h {
        return (width, height);
    }

    let scale = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}

/// Grab the current frame of a live stream and encode it.
/// Returns `None` when the stream has nothing to draw yet; callers skip the cycle.
pub fn capture_frame(stream: &dyn MediaStream, profile: &CaptureProfile) -> Option<CapturedImage> {
    let frame = stream.latest_frame()?;
    encode_frame(&frame, profile)
}

pub fn encode_frame(frame: &RgbImage, profile: &CaptureProfile) -> Option<CapturedImage> {
    let (src_w, src_h) = frame.dimensions();
    if src_w == 0 || src_h == 0 {
        trace!("Skipping capture of zero-sized frame");
        return None;
    }

    let (width, height) = scaled_dimensions(src_w, src_h, profile.max_width, profile.max_height);
    let resized;
    let source: &RgbImage = if (width, height) == (src_w, src_h) {
        frame
    } else {
        resized = image::imageops::resize(frame, width, height, FilterType::Triangle);
        &resized
    };

    let mut data = Vec::new();
    let encoded = match profile.encoding {
        Encoding::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100)).encode_image(source)
        }
        Encoding::Png => source.write_to(&mut Cursor::new(&mut data), image::ImageFormat::Png),
    };

    if let Err(e) = encoded {
        warn!("Failed to encode {}x{} frame: {}", width, height, e);
        return None;
    }

    Some(CapturedImage {
        data: Bytes::from(data),
        mime_type: profile.encoding.mime_type().to_string(),
        width,
        height,
        captured_at: Utc::now(),
    })
}
