//! The callback-based device driver API consumed by the capture core.
//!
//! Every asynchronous driver operation reports through a callback that
//! fires zero or one times per call; repeating-request frames are the one
//! exception and are written straight into the [`ImageRing`] targets.

use std::sync::Arc;

use super::error::DriverError;
use super::ring::ImageRing;
use super::types::{DeviceCharacteristics, DeviceHandle, SessionHandle};

/// Notifications delivered for an open (or opening) device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened(DeviceHandle),
    /// The device went away; may arrive at any point after `open_device`
    Disconnected,
    /// Driver error code, see [`DeviceErrorKind::from_code`](super::DeviceErrorKind::from_code).
    /// Carries the device when the driver created one, so it can be closed.
    Error {
        device: Option<DeviceHandle>,
        code: i32,
    },
}

/// Outcome of a session configuration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Configured(SessionHandle),
    ConfigureFailed,
}

pub type DeviceCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;
pub type SessionCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Where the driver writes captured frames.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// A host-owned surface (e.g. a viewfinder), passed through untouched
    Surface(String),
    /// An image ring consumed by the frame gate
    Reader(Arc<ImageRing>),
}

impl OutputTarget {
    pub fn as_reader(&self) -> Option<&Arc<ImageRing>> {
        match self {
            OutputTarget::Reader(ring) => Some(ring),
            OutputTarget::Surface(_) => None,
        }
    }
}

/// Capture parameter presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
}

/// Immutable capture request submitted once per session.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    template: RequestTemplate,
    targets: Vec<OutputTarget>,
}

impl CaptureRequest {
    /// A preview request writing to every target.
    pub fn preview(targets: Vec<OutputTarget>) -> Self {
        Self {
            template: RequestTemplate::Preview,
            targets,
        }
    }

    pub fn template(&self) -> RequestTemplate {
        self.template
    }

    pub fn targets(&self) -> &[OutputTarget] {
        &self.targets
    }

    /// Image rings among the targets.
    pub fn readers(&self) -> impl Iterator<Item = &Arc<ImageRing>> {
        self.targets.iter().filter_map(OutputTarget::as_reader)
    }
}

/// Vendor camera API.
///
/// Implementations must not call back synchronously while the caller still
/// holds locks; the core always invokes these methods from the
/// `device-ops` worker.
pub trait CameraDriver: Send + Sync {
    /// Device ids in the driver's enumeration order.
    fn device_ids(&self) -> Vec<String>;

    fn characteristics(&self, device_id: &str) -> Option<DeviceCharacteristics>;

    /// Begin opening a device. `callback` receives `Opened` or `Error`, and
    /// later `Disconnected`/`Error` for as long as the device stays open.
    fn open_device(&self, device_id: &str, callback: DeviceCallback);

    /// Begin configuring a session writing to `targets`.
    fn create_session(
        &self,
        device: &DeviceHandle,
        targets: &[OutputTarget],
        callback: SessionCallback,
    );

    /// Start delivering frames until `stop_repeating` or close.
    fn submit_repeating_request(
        &self,
        session: &SessionHandle,
        request: &CaptureRequest,
    ) -> Result<(), DriverError>;

    fn stop_repeating(&self, session: &SessionHandle) -> Result<(), DriverError>;

    fn close_device(&self, device: &DeviceHandle) -> Result<(), DriverError>;
}
