//! Camera device enumeration and output size negotiation.

use std::fmt;
use std::sync::Arc;

use super::driver::CameraDriver;
use super::error::CameraError;
use super::types::{DeviceCharacteristics, HardwareTier, LensFacing, PixelFormat, Size};

/// Summary of an available camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub id: String,
    pub hardware_tier: HardwareTier,
    pub lens_facing: LensFacing,
    /// Largest YUV output, if the device offers one
    pub max_yuv_size: Option<Size>,
}

impl fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?} camera, {} hardware",
            self.id, self.lens_facing, self.hardware_tier
        )?;
        match self.max_yuv_size {
            Some(size) => write!(f, ", up to {}", size),
            None => write!(f, ", no YUV output"),
        }
    }
}

/// Read-only view of the driver's devices.
#[derive(Clone)]
pub struct DeviceCatalog {
    driver: Arc<dyn CameraDriver>,
}

impl fmt::Debug for DeviceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCatalog").finish_non_exhaustive()
    }
}

impl DeviceCatalog {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self { driver }
    }

    /// List all available camera devices.
    ///
    /// If no cameras are found, returns an empty vector (not an error).
    pub fn list_devices(&self) -> Vec<CameraInfo> {
        self.driver
            .device_ids()
            .into_iter()
            .filter_map(|id| self.driver.characteristics(&id))
            .map(|c| CameraInfo {
                max_yuv_size: choose_output_size(&c, PixelFormat::Yuv420).ok(),
                id: c.device_id,
                hardware_tier: c.hardware_tier,
                lens_facing: c.lens_facing,
            })
            .collect()
    }

    /// # Errors
    /// * `CameraError::DeviceNotFound` - If the driver does not know `device_id`
    pub fn characteristics(&self, device_id: &str) -> Result<DeviceCharacteristics, CameraError> {
        self.driver
            .characteristics(device_id)
            .ok_or_else(|| CameraError::DeviceNotFound(device_id.to_string()))
    }
}

/// Pick the largest supported size (by area) for `format`.
///
/// Ties go to the size the driver listed first.
///
/// # Errors
/// * `CameraError::NoOutputSizes` - If the device offers no sizes for `format`
pub fn choose_output_size(
    characteristics: &DeviceCharacteristics,
    format: PixelFormat,
) -> Result<Size, CameraError> {
    // Not `max_by_key`: it keeps the last of equal maxima.
    let mut best: Option<Size> = None;
    for size in characteristics.output_sizes(format) {
        if best.map_or(true, |b| size.area() > b.area()) {
            best = Some(*size);
        }
    }
    best.ok_or(CameraError::NoOutputSizes { format })
}
