//! Device open, session configuration and the repeating request.
//!
//! ```text
//! Closed --open()--> Opening --opened--> Opened --configure_session()--> Configuring
//! Configuring --configured--> Active --stop()--> Closing --> Closed
//! ```
//!
//! Open and configure each suspend the caller on a one-shot bridge. A
//! disconnect or driver error in any state forces `Closed`; if a bridge is
//! pending it receives the error, otherwise the host is told through the
//! event stream.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::driver::{
    CameraDriver, CaptureRequest, DeviceCallback, DeviceEvent, OutputTarget, SessionCallback,
    SessionEvent,
};
use super::error::{CameraError, DeviceErrorKind};
use super::types::{DeviceHandle, SessionHandle};
use crate::bridge::{self, CancelHandle, Resolver};
use crate::detection::{emit, EventSender, PipelineEvent};
use crate::worker::Worker;

/// Session state, carrying the live handles only where they are valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Opened {
        device: DeviceHandle,
    },
    Configuring {
        device: DeviceHandle,
    },
    Active {
        device: DeviceHandle,
        session: SessionHandle,
        repeating: bool,
    },
    Closing,
}

/// Handle-free view of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Opening,
    Opened,
    Configuring,
    Active,
    Closing,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Closed => "closed",
            SessionPhase::Opening => "opening",
            SessionPhase::Opened => "opened",
            SessionPhase::Configuring => "configuring",
            SessionPhase::Active => "active",
            SessionPhase::Closing => "closing",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Closed => SessionPhase::Closed,
            SessionState::Opening => SessionPhase::Opening,
            SessionState::Opened { .. } => SessionPhase::Opened,
            SessionState::Configuring { .. } => SessionPhase::Configuring,
            SessionState::Active { .. } => SessionPhase::Active,
            SessionState::Closing => SessionPhase::Closing,
        }
    }

    fn into_handles(self) -> (Option<DeviceHandle>, Option<SessionHandle>) {
        match self {
            SessionState::Opened { device } | SessionState::Configuring { device } => {
                (Some(device), None)
            }
            SessionState::Active {
                device, session, ..
            } => (Some(device), Some(session)),
            SessionState::Closed | SessionState::Opening | SessionState::Closing => (None, None),
        }
    }

    fn invalid(&self, operation: &'static str) -> CameraError {
        CameraError::InvalidState {
            operation,
            state: self.phase().name(),
        }
    }
}

/// Called once when the session dies outside of a pending open/configure.
pub type FatalHandler = Arc<dyn Fn(&CameraError) + Send + Sync>;

enum Pending {
    Open(Resolver<DeviceHandle>, CancelHandle),
    Configure(Resolver<SessionHandle>, CancelHandle),
}

impl Pending {
    fn fail(&self, error: CameraError) -> bool {
        match self {
            Pending::Open(resolver, _) => resolver.fail(error),
            Pending::Configure(resolver, _) => resolver.fail(error),
        }
    }

    fn cancel(&self) {
        match self {
            Pending::Open(_, cancel) | Pending::Configure(_, cancel) => cancel.cancel(),
        }
    }
}

struct Inner {
    state: SessionState,
    pending: Option<Pending>,
    /// Bumped on every open and stop; callbacks from older generations are ignored
    generation: u64,
    fatal_reported: bool,
}

struct Shared {
    driver: Arc<dyn CameraDriver>,
    device_ops: Worker,
    events: EventSender,
    inner: Mutex<Inner>,
    on_fatal: Mutex<Option<FatalHandler>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_callback(
        self: &Arc<Self>,
        generation: u64,
        resolver: Resolver<DeviceHandle>,
    ) -> DeviceCallback {
        let shared = Arc::downgrade(self);
        Arc::new(move |event| match shared.upgrade() {
            Some(shared) => shared.handle_device_event(generation, &resolver, event),
            None => log::debug!("Device event after coordinator dropped: {:?}", event),
        })
    }

    fn handle_device_event(
        self: &Arc<Self>,
        generation: u64,
        resolver: &Resolver<DeviceHandle>,
        event: DeviceEvent,
    ) {
        match event {
            DeviceEvent::Opened(device) => {
                if !resolver.resolve(device.clone()) && resolver.is_canceled() {
                    log::warn!(
                        "Camera {} opened after the open was abandoned, closing it",
                        device.device_id
                    );
                    self.release_handles(Some(device), None);
                }
            }
            DeviceEvent::Disconnected => {
                log::warn!("Camera has been disconnected");
                self.fail_session(generation, CameraError::DeviceDisconnected, None);
            }
            DeviceEvent::Error { device, code } => {
                let kind = DeviceErrorKind::from_code(code);
                log::error!("Camera error: ({}) {}", code, kind);
                self.fail_session(generation, CameraError::DeviceError { kind }, device);
            }
        }
    }

    /// Force `Closed` after a driver-reported failure. `reported` is a device
    /// handed over with the error; it is closed unless the state already
    /// holds a device.
    fn fail_session(
        self: &Arc<Self>,
        generation: u64,
        error: CameraError,
        reported: Option<DeviceHandle>,
    ) {
        let (pending, previous, report) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                log::debug!("Ignoring stale device event: {}", error);
                return;
            }
            let previous = mem::replace(&mut inner.state, SessionState::Closed);
            let pending = inner.pending.take();
            if previous == SessionState::Closed && pending.is_none() {
                return;
            }
            let report = !inner.fatal_reported;
            inner.fatal_reported = true;
            (pending, previous, report)
        };

        log::info!("Session forced closed from {}: {}", previous.phase(), error);
        let delivered = pending.is_some_and(|p| p.fail(error.clone()));
        let (device, session) = previous.into_handles();
        self.release_handles(device.or(reported), session);

        if !delivered && report {
            emit(&self.events, PipelineEvent::Error(error.clone()));
            let handler = self
                .on_fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                handler(&error);
            }
        }
    }

    /// Best-effort stop-repeating and close on the `device-ops` worker.
    /// Errors are logged, never returned.
    fn release_handles(&self, device: Option<DeviceHandle>, session: Option<SessionHandle>) {
        if device.is_none() && session.is_none() {
            return;
        }
        let driver = Arc::clone(&self.driver);
        self.device_ops.submit_or_run(move || {
            if let Some(session) = session {
                if let Err(e) = driver.stop_repeating(&session) {
                    log::warn!("Error stopping repeating request: {}", e);
                }
            }
            if let Some(device) = device {
                match driver.close_device(&device) {
                    Ok(()) => log::info!("Camera {} closed", device.device_id),
                    Err(e) => log::error!("Error closing camera {}: {}", device.device_id, e),
                }
            }
        });
    }
}

/// Drives one device through open, configure and repeating capture.
pub struct CaptureSessionCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for CaptureSessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSessionCoordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CaptureSessionCoordinator {
    /// Driver calls are made on `device_ops`; fatal errors go to `events`.
    pub fn new(driver: Arc<dyn CameraDriver>, device_ops: Worker, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                device_ops,
                events,
                inner: Mutex::new(Inner {
                    state: SessionState::Closed,
                    pending: None,
                    generation: 0,
                    fatal_reported: false,
                }),
                on_fatal: Mutex::new(None),
            }),
        }
    }

    /// Install the hook run after a fatal error the host learns about
    /// through the event stream.
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        *self
            .shared
            .on_fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn state(&self) -> SessionPhase {
        self.shared.lock().state.phase()
    }

    /// Snapshot of the full state, handles included.
    pub fn session_state(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// The open device, if the state carries one.
    pub fn device(&self) -> Option<DeviceHandle> {
        match &self.shared.lock().state {
            SessionState::Opened { device }
            | SessionState::Configuring { device }
            | SessionState::Active { device, .. } => Some(device.clone()),
            _ => None,
        }
    }

    /// Open `device_id` and wait for the driver to report the outcome.
    ///
    /// # Errors
    /// * `CameraError::InvalidState` - If the coordinator is not `Closed`
    /// * `CameraError::DeviceError` - If the driver reports an open failure
    /// * `CameraError::DeviceDisconnected` - If the device goes away while opening
    /// * `CameraError::Canceled` - If `stop()` runs before the open completes
    pub async fn open(&self, device_id: &str) -> Result<DeviceHandle, CameraError> {
        let (resolver, awaitable) = bridge::create::<DeviceHandle>();
        let generation = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Closed {
                return Err(inner.state.invalid("open device"));
            }
            inner.generation += 1;
            inner.state = SessionState::Opening;
            inner.pending = Some(Pending::Open(resolver.clone(), awaitable.cancel_handle()));
            inner.fatal_reported = false;
            inner.generation
        };

        log::info!("Opening camera {}", device_id);
        let callback = self.shared.device_callback(generation, resolver);
        let driver = Arc::clone(&self.shared.driver);
        let id = device_id.to_string();
        if let Err(e) = self
            .shared
            .device_ops
            .submit(move || driver.open_device(&id, callback))
        {
            self.abandon(generation);
            return Err(e);
        }

        let result = awaitable.await;

        let mut inner = self.shared.lock();
        let current = inner.generation == generation;
        if current && matches!(inner.pending, Some(Pending::Open(..))) {
            inner.pending = None;
        }
        match result {
            Ok(device) if current && inner.state == SessionState::Opening => {
                inner.state = SessionState::Opened {
                    device: device.clone(),
                };
                log::info!("Camera {} opened", device.device_id);
                Ok(device)
            }
            Ok(device) => {
                drop(inner);
                self.shared.release_handles(Some(device), None);
                Err(CameraError::Canceled)
            }
            Err(e) => {
                if current && inner.state == SessionState::Opening {
                    inner.state = SessionState::Closed;
                }
                Err(e)
            }
        }
    }

    /// Create a capture session writing to `targets`. Only valid in `Opened`.
    ///
    /// On success the coordinator is `Active` and ready for
    /// [`start_repeating`](Self::start_repeating).
    ///
    /// # Errors
    /// * `CameraError::InvalidState` - If the coordinator is not `Opened`
    /// * `CameraError::SessionConfigurationFailed` - If the driver rejects the configuration
    /// * `CameraError::DeviceDisconnected` - If the device goes away while configuring
    /// * `CameraError::Canceled` - If `stop()` runs before configuration completes
    pub async fn configure_session(
        &self,
        targets: Vec<OutputTarget>,
    ) -> Result<SessionHandle, CameraError> {
        let (resolver, awaitable) = bridge::create::<SessionHandle>();
        let (device, generation) = {
            let mut inner = self.shared.lock();
            let device = match &inner.state {
                SessionState::Opened { device } => device.clone(),
                other => return Err(other.invalid("configure session")),
            };
            inner.state = SessionState::Configuring {
                device: device.clone(),
            };
            inner.pending = Some(Pending::Configure(
                resolver.clone(),
                awaitable.cancel_handle(),
            ));
            (device, inner.generation)
        };

        log::info!(
            "Configuring session on camera {} with {} target(s)",
            device.device_id,
            targets.len()
        );
        let device_id = device.device_id.clone();
        let callback: SessionCallback = Arc::new(move |event| match event {
            SessionEvent::Configured(session) => {
                if !resolver.resolve(session) {
                    log::debug!("Session configured after it was abandoned");
                }
            }
            SessionEvent::ConfigureFailed => {
                log::error!("Camera {} session configuration failed", device_id);
                resolver.fail(CameraError::SessionConfigurationFailed);
            }
        });
        let driver = Arc::clone(&self.shared.driver);
        let submitted = self
            .shared
            .device_ops
            .submit(move || driver.create_session(&device, &targets, callback));
        if let Err(e) = submitted {
            self.abandon(generation);
            return Err(e);
        }

        let result = awaitable.await;

        let mut inner = self.shared.lock();
        let current = inner.generation == generation;
        if current && matches!(inner.pending, Some(Pending::Configure(..))) {
            inner.pending = None;
        }
        let configuring = current && matches!(inner.state, SessionState::Configuring { .. });
        match result {
            Ok(session) if configuring => {
                let previous = mem::replace(&mut inner.state, SessionState::Closed);
                if let SessionState::Configuring { device } = previous {
                    inner.state = SessionState::Active {
                        device,
                        session,
                        repeating: false,
                    };
                }
                log::info!("Capture session active");
                Ok(session)
            }
            // Closing the device tears down any session it configured.
            Ok(_) => Err(CameraError::Canceled),
            Err(e) => {
                if configuring {
                    let previous = mem::replace(&mut inner.state, SessionState::Closed);
                    drop(inner);
                    let (device, _) = previous.into_handles();
                    self.shared.release_handles(device, None);
                }
                Err(e)
            }
        }
    }

    /// Submit the single repeating request for this session. The driver
    /// keeps re-issuing it until `stop()`.
    ///
    /// Submission happens on `device-ops`; a driver failure is reported
    /// through the event stream like any other fatal session error.
    ///
    /// # Errors
    /// * `CameraError::InvalidState` - If not `Active`, or already repeating
    pub fn start_repeating(&self, request: CaptureRequest) -> Result<(), CameraError> {
        let (session, generation) = {
            let mut inner = self.shared.lock();
            let generation = inner.generation;
            match &mut inner.state {
                SessionState::Active {
                    session, repeating, ..
                } if !*repeating => {
                    *repeating = true;
                    (*session, generation)
                }
                SessionState::Active { .. } => {
                    return Err(CameraError::InvalidState {
                        operation: "submit a second repeating request",
                        state: SessionPhase::Active.name(),
                    })
                }
                other => return Err(other.invalid("submit repeating request")),
            }
        };

        let shared = Arc::clone(&self.shared);
        self.shared.device_ops.submit(move || {
            match shared.driver.submit_repeating_request(&session, &request) {
                Ok(()) => log::info!("Repeating request submitted"),
                Err(e) => {
                    log::error!("Failed to submit repeating request: {}", e);
                    shared.fail_session(
                        generation,
                        CameraError::RepeatingRequestFailed(e.0),
                        None,
                    );
                }
            }
        })
    }

    /// Best-effort stop: cancel any pending open/configure, stop the
    /// repeating request, close the device. Always ends in `Closed`.
    /// Idempotent and safe from any state.
    pub fn stop(&self) {
        let (previous, pending) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            let previous = mem::replace(&mut inner.state, SessionState::Closing);
            (previous, inner.pending.take())
        };

        if let Some(pending) = pending {
            pending.cancel();
        }
        let phase = previous.phase();
        let (device, session) = previous.into_handles();
        self.shared.release_handles(device, session);

        self.shared.lock().state = SessionState::Closed;
        if phase != SessionPhase::Closed {
            log::info!("Capture session stopped (was {})", phase);
        }
    }

    /// Undo a transition whose driver call could not be submitted.
    fn abandon(&self, generation: u64) {
        let previous = {
            let mut inner = self.shared.lock();
            if inner.generation != generation {
                return;
            }
            inner.pending = None;
            mem::replace(&mut inner.state, SessionState::Closed)
        };
        let (device, session) = previous.into_handles();
        self.shared.release_handles(device, session);
    }
}

impl Drop for CaptureSessionCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
