//! Camera types and data structures.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel format of an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, 8 bits per sample (the classifier's native input)
    Yuv420,
    /// Semi-planar NV21
    Nv21,
    /// Compressed JPEG
    Jpeg,
    /// Packed RGB, 3 bytes per pixel
    Rgb,
}

impl PixelFormat {
    /// Bytes required for one frame of the given size.
    pub fn frame_len(&self, size: Size) -> usize {
        let pixels = size.area() as usize;
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv21 => pixels + pixels / 2,
            PixelFormat::Rgb => pixels * 3,
            // Variable; callers treat this as an upper bound.
            PixelFormat::Jpeg => pixels,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuv420 => "YUV_420_888",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Rgb => "RGB",
        };
        f.write_str(name)
    }
}

/// Supported hardware level, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    Legacy,
    Limited,
    Full,
    Level3,
}

impl HardwareTier {
    /// Whether a device at this tier satisfies `required`.
    pub fn supports(&self, required: HardwareTier) -> bool {
        *self >= required
    }
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareTier::Legacy => "legacy",
            HardwareTier::Limited => "limited",
            HardwareTier::Full => "full",
            HardwareTier::Level3 => "level3",
        };
        f.write_str(name)
    }
}

/// Direction the lens faces relative to the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensFacing {
    Front,
    Back,
    External,
}

/// Output sizes a device supports for one pixel format, in driver order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfiguration {
    pub format: PixelFormat,
    pub sizes: Vec<Size>,
}

/// Static description of a device, read once when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub device_id: String,
    pub hardware_tier: HardwareTier,
    pub lens_facing: LensFacing,
    /// Clockwise rotation of the sensor relative to the device's natural orientation
    pub sensor_orientation: u32,
    pub stream_configurations: Vec<StreamConfiguration>,
}

impl DeviceCharacteristics {
    /// Sizes supported for `format`, in the driver's enumeration order.
    pub fn output_sizes(&self, format: PixelFormat) -> &[Size] {
        self.stream_configurations
            .iter()
            .find(|c| c.format == format)
            .map(|c| c.sizes.as_slice())
            .unwrap_or(&[])
    }
}

/// Opaque handle to an open driver connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub device_id: String,
    pub token: u64,
}

/// Opaque handle to a configured capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub token: u64,
}

/// A frame written by the driver into an image ring.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data, planar for YUV formats
    pub data: Vec<u8>,
    pub size: Size,
    pub format: PixelFormat,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, size: Size, format: PixelFormat) -> Self {
        Self {
            data,
            size,
            format,
            timestamp: Instant::now(),
        }
    }

    /// The luma plane (Y) for YUV formats, or the whole buffer otherwise.
    pub fn luma(&self) -> &[u8] {
        match self.format {
            PixelFormat::Yuv420 | PixelFormat::Nv21 => {
                let len = (self.size.area() as usize).min(self.data.len());
                &self.data[..len]
            }
            _ => &self.data,
        }
    }
}
