//! Camera capture core.
//!
//! This module provides the pieces between a callback-based camera driver
//! and the frame classifier:
//! - Device enumeration and size negotiation via [`DeviceCatalog`]
//! - The open/configure/repeat state machine via [`CaptureSessionCoordinator`]
//! - The capacity-2 image ring via [`ImageRing`]
//! - The owning scope for a whole pipeline via [`SessionLifecycle`]

mod coordinator;
mod device;
mod driver;
mod error;
mod lifecycle;
mod orientation;
mod ring;
mod types;

pub use coordinator::{CaptureSessionCoordinator, FatalHandler, SessionPhase, SessionState};
pub use device::{choose_output_size, CameraInfo, DeviceCatalog};
pub use driver::{
    CameraDriver, CaptureRequest, DeviceCallback, DeviceEvent, OutputTarget, RequestTemplate,
    SessionCallback, SessionEvent,
};
pub use error::{CameraError, DeviceErrorKind, DriverError};
pub use lifecycle::{LifecycleOptions, SessionLifecycle};
pub use orientation::{relative_orientation, surface_rotation, OrientationTracker};
pub use ring::{ImageAvailableListener, ImageBuffer, ImageRing, RingStats, IMAGE_BUFFER_SIZE};
pub use types::{
    DeviceCharacteristics, DeviceHandle, Frame, HardwareTier, LensFacing, PixelFormat,
    SessionHandle, Size, StreamConfiguration,
};
