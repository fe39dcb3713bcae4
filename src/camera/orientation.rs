//! Relative rotation between the sensor and the device display.

use super::types::{DeviceCharacteristics, LensFacing};

/// Snap a raw rotation reading (degrees clockwise) to the display rotation
/// it corresponds to.
pub fn surface_rotation(raw_degrees: u32) -> u32 {
    match raw_degrees % 360 {
        0..=45 => 0,
        46..=135 => 270,
        136..=225 => 180,
        226..=315 => 90,
        _ => 0,
    }
}

/// Rotation needed to bring sensor output upright for the given display
/// rotation.
pub fn relative_orientation(characteristics: &DeviceCharacteristics, display_degrees: u32) -> u32 {
    let sensor = (characteristics.sensor_orientation % 360) as i64;
    let device = (display_degrees % 360) as i64;
    let sign = if characteristics.lens_facing == LensFacing::Front {
        1
    } else {
        -1
    };
    ((sensor - device * sign + 360) % 360) as u32
}

/// Turns raw rotation readings into change notifications.
#[derive(Debug, Clone)]
pub struct OrientationTracker {
    characteristics: DeviceCharacteristics,
    last: Option<u32>,
}

impl OrientationTracker {
    pub fn new(characteristics: DeviceCharacteristics) -> Self {
        Self {
            characteristics,
            last: None,
        }
    }

    /// Feed a raw reading; returns the new relative orientation only when
    /// it differs from the previous one.
    pub fn update(&mut self, raw_degrees: u32) -> Option<u32> {
        let rotation = surface_rotation(raw_degrees);
        let relative = relative_orientation(&self.characteristics, rotation);
        if self.last == Some(relative) {
            return None;
        }
        self.last = Some(relative);
        Some(relative)
    }

    pub fn current(&self) -> Option<u32> {
        self.last
    }
}
