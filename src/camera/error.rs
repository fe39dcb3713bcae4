//! Error types for device, session and frame operations.

use super::types::{HardwareTier, PixelFormat};

/// Reason a driver gave for failing to open or operate a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The device or the camera service hit an unrecoverable fault
    Fatal,
    /// Another client holds the device
    InUse,
    /// Device policy forbids camera use
    Disabled,
    /// Too many devices are open system-wide
    MaxReached,
    Unknown,
}

impl DeviceErrorKind {
    /// Map a driver error code onto a kind.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DeviceErrorKind::InUse,
            2 => DeviceErrorKind::MaxReached,
            3 => DeviceErrorKind::Disabled,
            4 | 5 => DeviceErrorKind::Fatal,
            _ => DeviceErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DeviceErrorKind::Fatal => "fatal",
            DeviceErrorKind::InUse => "camera in use",
            DeviceErrorKind::Disabled => "disabled by device policy",
            DeviceErrorKind::MaxReached => "maximum cameras in use",
            DeviceErrorKind::Unknown => "unknown",
        };
        f.write_str(msg)
    }
}

/// Synchronous failure reported by a driver call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("driver error: {0}")]
pub struct DriverError(pub String);

/// Errors that can occur while running the capture pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CameraError {
    #[error("Camera device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Camera device disconnected")]
    DeviceDisconnected,

    #[error("Camera device error: {kind}")]
    DeviceError { kind: DeviceErrorKind },

    #[error("Capture session configuration failed")]
    SessionConfigurationFailed,

    #[error("Frame format mismatch: expected {expected}, got {actual}")]
    FrameFormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },

    #[error("No output sizes supported for format {format}")]
    NoOutputSizes { format: PixelFormat },

    #[error("Hardware tier '{actual}' is below the required '{required}'")]
    UnsupportedHardware {
        required: HardwareTier,
        actual: HardwareTier,
    },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Operation canceled")]
    Canceled,

    #[error("Worker '{worker}' has shut down")]
    WorkerShutDown { worker: &'static str },

    #[error("Repeating request failed: {0}")]
    RepeatingRequestFailed(String),

    #[error("No async runtime available")]
    NoRuntime,

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}
