//! CLI enum types for pixel format and hardware tier options.

use clap::ValueEnum;

use crate::camera::{HardwareTier, PixelFormat};

/// Pixel format requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    #[default]
    Yuv420,
    Nv21,
    Jpeg,
    Rgb,
}

impl From<Format> for PixelFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Yuv420 => PixelFormat::Yuv420,
            Format::Nv21 => PixelFormat::Nv21,
            Format::Jpeg => PixelFormat::Jpeg,
            Format::Rgb => PixelFormat::Rgb,
        }
    }
}

/// Lowest hardware tier accepted when starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tier {
    Legacy,
    Limited,
    Full,
    Level3,
}

impl From<Tier> for HardwareTier {
    fn from(t: Tier) -> Self {
        match t {
            Tier::Legacy => HardwareTier::Legacy,
            Tier::Limited => HardwareTier::Limited,
            Tier::Full => HardwareTier::Full,
            Tier::Level3 => HardwareTier::Level3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_conversion() {
        assert_eq!(PixelFormat::from(Format::default()), PixelFormat::Yuv420);
        assert_eq!(PixelFormat::from(Format::Jpeg), PixelFormat::Jpeg);
    }

    #[test]
    fn test_tier_conversion() {
        assert_eq!(HardwareTier::from(Tier::Legacy), HardwareTier::Legacy);
        assert_eq!(HardwareTier::from(Tier::Level3), HardwareTier::Level3);
    }
}
