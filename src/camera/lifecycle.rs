//! Owning scope for one capture pipeline.
//!
//! [`SessionLifecycle`] holds the worker threads, the coordinator, the image
//! ring and the frame gate, and tears all of them down in reverse order
//! however far `start()` got.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;

use super::coordinator::{CaptureSessionCoordinator, SessionPhase};
use super::device::{choose_output_size, DeviceCatalog};
use super::driver::{CameraDriver, CaptureRequest, OutputTarget};
use super::error::CameraError;
use super::orientation::OrientationTracker;
use super::ring::{ImageRing, IMAGE_BUFFER_SIZE};
use super::types::{HardwareTier, PixelFormat, Size};
use crate::detection::{
    emit, event_channel, Classifier, EventReceiver, EventSender, PipelineEvent,
    DEFAULT_THRESHOLD_PERCENT,
};
use crate::gate::{FrameGate, GateStats};
use crate::worker::DualWorkerContext;

/// Values the host threads into the pipeline at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleOptions {
    /// Confidence in `0.0..=1.0` at which a detection counts as blocked
    pub threshold: f32,
    /// Lowest hardware tier accepted by `start()`
    pub required_tier: HardwareTier,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            threshold: f32::from(DEFAULT_THRESHOLD_PERCENT) / 100.0,
            required_tier: HardwareTier::Full,
        }
    }
}

struct LifecycleInner {
    catalog: DeviceCatalog,
    workers: DualWorkerContext,
    coordinator: CaptureSessionCoordinator,
    classifier: Arc<dyn Classifier>,
    options: LifecycleOptions,
    events: EventSender,
    runtime: Handle,
    gate: Mutex<Option<FrameGate>>,
    ring: Mutex<Option<Arc<ImageRing>>>,
    orientation: Mutex<Option<OrientationTracker>>,
    started: AtomicBool,
    torn_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LifecycleInner {
    fn ensure_live(&self) -> Result<(), CameraError> {
        if self.torn_down.load(Ordering::SeqCst) {
            Err(CameraError::Canceled)
        } else {
            Ok(())
        }
    }

    async fn run_start(
        &self,
        device_id: &str,
        format: PixelFormat,
        mut targets: Vec<OutputTarget>,
    ) -> Result<Size, CameraError> {
        let characteristics = self.catalog.characteristics(device_id)?;
        let required = self.options.required_tier;
        if !characteristics.hardware_tier.supports(required) {
            return Err(CameraError::UnsupportedHardware {
                required,
                actual: characteristics.hardware_tier,
            });
        }
        let size = choose_output_size(&characteristics, format)?;
        log::info!("Camera {}: using {} {}", device_id, size, format);
        *lock(&self.orientation) = Some(OrientationTracker::new(characteristics));

        self.coordinator.open(device_id).await?;
        self.ensure_live()?;

        let ring = ImageRing::new(
            size,
            format,
            IMAGE_BUFFER_SIZE,
            self.workers.buffer_ops().clone(),
        );
        *lock(&self.ring) = Some(Arc::clone(&ring));
        self.ensure_live()?;

        targets.push(OutputTarget::Reader(Arc::clone(&ring)));
        self.coordinator.configure_session(targets.clone()).await?;
        self.ensure_live()?;

        self.coordinator
            .start_repeating(CaptureRequest::preview(targets))?;

        let gate = FrameGate::new(
            Arc::clone(&self.classifier),
            format,
            self.options.threshold,
            self.events.clone(),
            self.runtime.clone(),
            self.workers.buffer_ops().clone(),
        );
        *lock(&self.gate) = Some(gate.clone());
        self.ensure_live()?;
        ring.set_listener(Arc::new(gate));

        log::info!("Capture pipeline started on camera {}", device_id);
        Ok(size)
    }

    /// Every step is idempotent, so this always runs all of them.
    fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            log::info!("Tearing down capture pipeline");
        }

        if let Some(gate) = lock(&self.gate).take() {
            gate.detach();
        }
        let ring = lock(&self.ring).take();
        if let Some(ring) = &ring {
            ring.clear_listener();
        }
        self.coordinator.stop();
        if let Some(ring) = ring {
            ring.close();
        }
        self.workers.shutdown();
    }
}

/// A capture pipeline bound to an owning scope.
///
/// Dropping the lifecycle tears it down.
pub struct SessionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

impl SessionLifecycle {
    /// Spawn the worker threads and build an idle pipeline.
    ///
    /// Must be called from within a tokio runtime; classification tasks
    /// are spawned on it. Returns the receiving end of the host event
    /// stream alongside the lifecycle.
    ///
    /// # Errors
    /// * `CameraError::NoRuntime` - If called outside a tokio runtime
    /// * `CameraError::WorkerSpawn` - If a worker thread cannot be started
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        classifier: Arc<dyn Classifier>,
        options: LifecycleOptions,
    ) -> Result<(Self, EventReceiver), CameraError> {
        let runtime = Handle::try_current().map_err(|_| CameraError::NoRuntime)?;
        let workers =
            DualWorkerContext::new().map_err(|e| CameraError::WorkerSpawn(e.to_string()))?;
        let (events, receiver) = event_channel();

        let coordinator = CaptureSessionCoordinator::new(
            Arc::clone(&driver),
            workers.device_ops().clone(),
            events.clone(),
        );

        let inner = Arc::new(LifecycleInner {
            catalog: DeviceCatalog::new(driver),
            workers,
            coordinator,
            classifier,
            options,
            events,
            runtime,
            gate: Mutex::new(None),
            ring: Mutex::new(None),
            orientation: Mutex::new(None),
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        });

        // Errors after the session is up take the same teardown path.
        let weak: Weak<LifecycleInner> = Arc::downgrade(&inner);
        inner.coordinator.set_fatal_handler(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                log::error!("Capture session failed: {}", error);
                inner.teardown();
            }
        }));

        Ok((Self { inner }, receiver))
    }

    /// Start capturing from `device_id`.
    ///
    /// Reads the device characteristics, checks the hardware tier,
    /// negotiates the output size, opens the device, configures a session
    /// writing to `targets` plus an internal image ring, submits the
    /// repeating request and finally routes ring buffers to the frame gate.
    /// Returns the negotiated output size.
    ///
    /// Any failure tears the pipeline down before it is returned. A
    /// lifecycle can be started once.
    ///
    /// # Errors
    /// * `CameraError::DeviceNotFound` - If the device id is unknown
    /// * `CameraError::UnsupportedHardware` - If the device tier is below the required tier
    /// * `CameraError::NoOutputSizes` - If the device cannot produce `format`
    /// * `CameraError::Canceled` - If `stop()` runs before `start()` completes
    /// * any error reported by the coordinator while opening or configuring
    pub async fn start(
        &self,
        device_id: &str,
        format: PixelFormat,
        targets: Vec<OutputTarget>,
    ) -> Result<Size, CameraError> {
        self.inner.ensure_live()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CameraError::InvalidState {
                operation: "start",
                state: self.state().name(),
            });
        }

        match self.inner.run_start(device_id, format, targets).await {
            Ok(size) => Ok(size),
            Err(e) => {
                log::error!("Failed to start capture on camera {}: {}", device_id, e);
                self.inner.teardown();
                Err(e)
            }
        }
    }

    /// Host entry point for [`teardown`](Self::teardown).
    pub fn stop(&self) {
        self.teardown();
    }

    /// Detach the gate, close the image ring, stop the coordinator
    /// (canceling any pending open or configure) and shut both workers
    /// down. Never blocks, never fails, safe to repeat and to call while
    /// `start()` is still pending.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Feed a raw device rotation reading (degrees). Emits
    /// `OrientationChanged` when the relative orientation changes.
    pub fn on_device_orientation(&self, raw_degrees: u32) {
        let changed = lock(&self.inner.orientation)
            .as_mut()
            .and_then(|tracker| tracker.update(raw_degrees));
        if let Some(degrees) = changed {
            log::debug!("Relative orientation changed to {}", degrees);
            emit(&self.inner.events, PipelineEvent::OrientationChanged(degrees));
        }
    }

    pub fn state(&self) -> SessionPhase {
        self.inner.coordinator.state()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    pub fn gate_stats(&self) -> Option<GateStats> {
        lock(&self.inner.gate).as_ref().map(FrameGate::stats)
    }

    pub fn options(&self) -> LifecycleOptions {
        self.inner.options
    }

    pub fn workers(&self) -> &DualWorkerContext {
        &self.inner.workers
    }

    /// Block until both worker threads have drained and exited.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.workers.await_termination(timeout)
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LifecycleOptions::default();
        assert_eq!(options.threshold, 0.75);
        assert_eq!(options.required_tier, HardwareTier::Full);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let driver: Arc<dyn CameraDriver> = Arc::new(crate::sim::SimulatedDriver::new());
        let classifier: Arc<dyn Classifier> = Arc::new(crate::sim::CoverClassifier::default());
        let err = SessionLifecycle::new(driver, classifier, LifecycleOptions::default())
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, CameraError::NoRuntime);
    }
}
