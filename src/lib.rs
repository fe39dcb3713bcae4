//! sensorpic library crate.
//!
//! Drives a callback-based camera driver through open, session
//! configuration and a repeating capture request, and feeds the resulting
//! frames one at a time to a classifier that decides whether the lens is
//! blocked.

pub mod bridge;
pub mod camera;
pub mod cli;
pub mod config;
pub mod detection;
pub mod gate;
pub mod sim;
pub mod worker;

pub use camera::{CameraError, LifecycleOptions, SessionLifecycle};
pub use detection::{Classifier, Detection, PipelineEvent, Recognition};
