//! Shared fixtures for integration tests.
//!
//! [`ScriptedDriver`] records every call and keeps the callbacks it was
//! handed so a test can fire driver events by hand, in any order.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;

use sensorpic::camera::{
    CameraDriver, CaptureRequest, DeviceCallback, DeviceCharacteristics, DeviceEvent,
    DeviceHandle, DriverError, Frame, HardwareTier, ImageBuffer, ImageRing, LensFacing,
    OutputTarget, PixelFormat, SessionCallback, SessionEvent, SessionHandle, Size,
    StreamConfiguration,
};
use sensorpic::detection::{Classifier, ClassifierError, Recognition};

/// How long any test waits for an asynchronous effect.
pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(String),
    CreateSession { device: DeviceHandle, targets: usize },
    SubmitRepeating(SessionHandle),
    StopRepeating(SessionHandle),
    CloseDevice(DeviceHandle),
}

pub fn characteristics(id: &str, tier: HardwareTier, sizes: Vec<Size>) -> DeviceCharacteristics {
    DeviceCharacteristics {
        device_id: id.to_string(),
        hardware_tier: tier,
        lens_facing: LensFacing::Back,
        sensor_orientation: 90,
        stream_configurations: vec![StreamConfiguration {
            format: PixelFormat::Yuv420,
            sizes,
        }],
    }
}

/// Device "0" (full tier, largest YUV size 192x108) and device "legacy".
pub fn catalog() -> Vec<DeviceCharacteristics> {
    vec![
        characteristics(
            "0",
            HardwareTier::Full,
            vec![Size::new(64, 48), Size::new(192, 108), Size::new(128, 72)],
        ),
        characteristics("legacy", HardwareTier::Legacy, vec![Size::new(64, 48)]),
    ]
}

pub fn device(id: &str, token: u64) -> DeviceHandle {
    DeviceHandle {
        device_id: id.to_string(),
        token,
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    catalog: Vec<DeviceCharacteristics>,
    calls: Mutex<Vec<Call>>,
    device_callbacks: Mutex<Vec<DeviceCallback>>,
    session_callbacks: Mutex<Vec<SessionCallback>>,
    readers: Mutex<Vec<Arc<ImageRing>>>,
    repeating_error: Mutex<Option<String>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            catalog: catalog(),
            ..Default::default()
        })
    }

    pub fn fail_repeating_with(&self, message: &str) {
        *self.repeating_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    /// Fire an event on the most recent `open_device` callback.
    pub fn fire_device(&self, event: DeviceEvent) {
        let callback = self.device_callbacks.lock().unwrap().last().cloned();
        callback.expect("open_device was not called")(event);
    }

    /// Fire an event on the most recent `create_session` callback.
    pub fn fire_session(&self, event: SessionEvent) {
        let callback = self.session_callbacks.lock().unwrap().last().cloned();
        callback.expect("create_session was not called")(event);
    }

    pub async fn wait_for_open(&self) {
        eventually(|| (!self.device_callbacks.lock().unwrap().is_empty()).then_some(())).await
    }

    pub async fn wait_for_session(&self) {
        eventually(|| (!self.session_callbacks.lock().unwrap().is_empty()).then_some(())).await
    }

    /// The image ring the session was configured with.
    pub fn reader(&self) -> Arc<ImageRing> {
        self.readers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no reader target configured")
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CameraDriver for ScriptedDriver {
    fn device_ids(&self) -> Vec<String> {
        self.catalog.iter().map(|c| c.device_id.clone()).collect()
    }

    fn characteristics(&self, device_id: &str) -> Option<DeviceCharacteristics> {
        self.catalog.iter().find(|c| c.device_id == device_id).cloned()
    }

    fn open_device(&self, device_id: &str, callback: DeviceCallback) {
        self.record(Call::Open(device_id.to_string()));
        self.device_callbacks.lock().unwrap().push(callback);
    }

    fn create_session(
        &self,
        device: &DeviceHandle,
        targets: &[OutputTarget],
        callback: SessionCallback,
    ) {
        self.record(Call::CreateSession {
            device: device.clone(),
            targets: targets.len(),
        });
        self.readers
            .lock()
            .unwrap()
            .extend(targets.iter().filter_map(OutputTarget::as_reader).cloned());
        self.session_callbacks.lock().unwrap().push(callback);
    }

    fn submit_repeating_request(
        &self,
        session: &SessionHandle,
        _request: &CaptureRequest,
    ) -> Result<(), DriverError> {
        self.record(Call::SubmitRepeating(*session));
        match self.repeating_error.lock().unwrap().clone() {
            Some(message) => Err(DriverError(message)),
            None => Ok(()),
        }
    }

    fn stop_repeating(&self, session: &SessionHandle) -> Result<(), DriverError> {
        self.record(Call::StopRepeating(*session));
        Ok(())
    }

    fn close_device(&self, device: &DeviceHandle) -> Result<(), DriverError> {
        self.record(Call::CloseDevice(device.clone()));
        // Close failures must never escape teardown.
        Err(DriverError("close reported a failure".to_string()))
    }
}

/// Poll `check` until it yields a value or [`WAIT`] elapses.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it does not finish within [`WAIT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("future did not complete in time")
}

pub fn yuv_frame(size: Size, luma: u8) -> Frame {
    let len = PixelFormat::Yuv420.frame_len(size);
    Frame::new(vec![luma; len], size, PixelFormat::Yuv420)
}

/// Classifier that holds every call until released.
pub struct HeldClassifier {
    pub release: Notify,
    pub calls: AtomicUsize,
    confidence: f32,
}

impl HeldClassifier {
    pub fn new(confidence: f32) -> Arc<Self> {
        Arc::new(Self {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            confidence,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for HeldClassifier {
    fn classify<'a>(
        &'a self,
        _buffer: &'a ImageBuffer,
    ) -> BoxFuture<'a, Result<Option<Recognition>, ClassifierError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(Some(Recognition {
                label: "finger".to_string(),
                confidence: self.confidence,
            }))
        }
        .boxed()
    }
}
