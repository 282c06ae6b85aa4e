use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BridgeError;

/// A video frame owned by exactly one party at a time.
///
/// Not `Clone`: the producer hands it to the bridge, the bridge hands it to the
/// consumer, and whoever holds it last releases the planes.
pub struct Frame {
    /// Immutable plane data - can be shared across threads without copying
    pub planes: Vec<Plane>,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// One byte region of a frame (luma, chroma, alpha or packed pixels)
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub stride: u32,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Source timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    I420,
    I420A,
    Nv12,
    Rgb24,
    Bgr24,
    Yuyv4,
}

impl PixelFormat {
    /// Number of planes a frame of this format carries
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::I420 => 3,
            PixelFormat::I420A => 4,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Yuyv4 => 1,
        }
    }

    /// Minimum `(stride, rows)` of each plane for a `width` x `height` image.
    pub fn plane_layout(self, width: u32, height: u32) -> Vec<(u32, u32)> {
        let half_w = width.div_ceil(2);
        let half_h = height.div_ceil(2);
        match self {
            PixelFormat::I420 => vec![(width, height), (half_w, half_h), (half_w, half_h)],
            PixelFormat::I420A => vec![
                (width, height),
                (half_w, half_h),
                (half_w, half_h),
                (width, height),
            ],
            PixelFormat::Nv12 => vec![(width, height), (half_w * 2, half_h)],
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => vec![(width * 3, height)],
            PixelFormat::Yuyv4 => vec![(half_w * 4, height)],
        }
    }
}

/// Dimensions and layout of a stream, without any pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(planes: Vec<Plane>, meta: FrameMetadata) -> Self {
        Self {
            planes,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn format(&self) -> FrameFormat {
        FrameFormat {
            width: self.meta.width,
            height: self.meta.height,
            format: self.meta.format,
        }
    }

    /// Check that the frame describes a real image: non-zero dimensions and
    /// one plane per component of its pixel format.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let meta = &self.meta;
        if meta.width == 0 || meta.height == 0 {
            return Err(BridgeError::InvalidDimensions {
                width: meta.width,
                height: meta.height,
            });
        }
        let expected = meta.format.plane_count();
        if self.planes.len() != expected {
            return Err(BridgeError::PlaneMismatch {
                format: meta.format,
                expected,
                actual: self.planes.len(),
            });
        }
        Ok(())
    }

    /// Total payload size across all planes
    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("planes", &self.planes.len())
            .field("bytes", &self.byte_len())
            .finish()
    }
}
