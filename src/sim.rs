//! In-process camera driver and classifier.
//!
//! [`SimulatedDriver`] implements [`CameraDriver`] against a fixed device
//! table and writes synthetic frames from a background thread while a
//! repeating request is active. [`CoverClassifier`] reports the lens as
//! covered in proportion to how dark the frame is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;

use crate::camera::{
    CameraDriver, CaptureRequest, DeviceCallback, DeviceCharacteristics, DeviceEvent,
    DeviceHandle, DriverError, Frame, HardwareTier, ImageBuffer, ImageRing, LensFacing,
    OutputTarget, PixelFormat, SessionCallback, SessionEvent, SessionHandle, Size,
    StreamConfiguration,
};
use crate::detection::{Classifier, ClassifierError, Recognition};

/// Error code reported when a device is already open.
const ERROR_CAMERA_IN_USE: i32 = 1;
/// Error code reported for an unknown device.
const ERROR_CAMERA_DEVICE: i32 = 4;

/// Default delay between synthetic frames.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

struct OpenDevice {
    device_id: String,
    callback: DeviceCallback,
}

struct Producer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Producer {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            log::warn!("Frame producer thread panicked");
        }
    }
}

struct Session {
    device_token: u64,
    readers: Vec<Arc<ImageRing>>,
    producer: Option<Producer>,
}

#[derive(Default)]
struct SimState {
    next_token: u64,
    devices: HashMap<u64, OpenDevice>,
    sessions: HashMap<u64, Session>,
}

impl SimState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Remove a device and every session on it, returning their producers.
    fn remove_device(&mut self, token: u64) -> (Option<OpenDevice>, Vec<Producer>) {
        let device = self.devices.remove(&token);
        let session_tokens: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.device_token == token)
            .map(|(t, _)| *t)
            .collect();
        let producers = session_tokens
            .into_iter()
            .filter_map(|t| self.sessions.remove(&t))
            .filter_map(|s| s.producer)
            .collect();
        (device, producers)
    }

    fn token_for(&self, device_id: &str) -> Option<u64> {
        self.devices
            .iter()
            .find(|(_, d)| d.device_id == device_id)
            .map(|(t, _)| *t)
    }
}

/// A camera driver backed by a static device table.
pub struct SimulatedDriver {
    catalog: Vec<DeviceCharacteristics>,
    frame_interval: Duration,
    /// Luma value written into every synthetic frame
    luma: Arc<AtomicU8>,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("devices", &self.catalog.len())
            .field("frame_interval", &self.frame_interval)
            .field("luma", &self.luma.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// A driver exposing [`default_devices`].
    pub fn new() -> Self {
        Self::with_devices(default_devices())
    }

    pub fn with_devices(catalog: Vec<DeviceCharacteristics>) -> Self {
        Self {
            catalog,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            luma: Arc::new(AtomicU8::new(200)),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Brightness of subsequent frames. 0 is a fully covered lens.
    pub fn set_luma(&self, luma: u8) {
        self.luma.store(luma, Ordering::Relaxed);
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.lock().token_for(device_id).is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().sessions.values().any(|s| s.producer.is_some())
    }

    /// Unplug an open device. Returns `false` if it was not open.
    pub fn disconnect(&self, device_id: &str) -> bool {
        self.drop_device(device_id, |_| DeviceEvent::Disconnected)
    }

    /// Report a driver error on an open device and drop it.
    pub fn report_error(&self, device_id: &str, code: i32) -> bool {
        self.drop_device(device_id, |device| DeviceEvent::Error {
            device: Some(device),
            code,
        })
    }

    fn drop_device(
        &self,
        device_id: &str,
        event: impl FnOnce(DeviceHandle) -> DeviceEvent,
    ) -> bool {
        let (token, device, producers) = {
            let mut state = self.lock();
            let Some(token) = state.token_for(device_id) else {
                return false;
            };
            let (device, producers) = state.remove_device(token);
            (token, device, producers)
        };
        for producer in producers {
            producer.stop();
        }
        match device {
            Some(device) => {
                let event = event(DeviceHandle {
                    device_id: device_id.to_string(),
                    token,
                });
                log::info!("Simulated camera {}: {:?}", device_id, event);
                (device.callback)(event);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_producer(&self, readers: Vec<Arc<ImageRing>>) -> Result<Producer, DriverError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let luma = Arc::clone(&self.luma);
        let interval = self.frame_interval;

        let handle = thread::Builder::new()
            .name("sim-frames".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let value = luma.load(Ordering::Relaxed);
                    for ring in &readers {
                        ring.produce(synthetic_frame(ring.size(), ring.format(), value));
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|e| DriverError(format!("failed to spawn frame producer: {}", e)))?;

        Ok(Producer { stop, handle })
    }
}

/// Fill a frame with a flat luma value and neutral chroma.
fn synthetic_frame(size: Size, format: PixelFormat, luma: u8) -> Frame {
    let len = format.frame_len(size);
    let mut data = vec![luma; len];
    if matches!(format, PixelFormat::Yuv420 | PixelFormat::Nv21) {
        let plane = (size.area() as usize).min(len);
        data[plane..].fill(128);
    }
    Frame::new(data, size, format)
}

impl CameraDriver for SimulatedDriver {
    fn device_ids(&self) -> Vec<String> {
        self.catalog.iter().map(|c| c.device_id.clone()).collect()
    }

    fn characteristics(&self, device_id: &str) -> Option<DeviceCharacteristics> {
        self.catalog
            .iter()
            .find(|c| c.device_id == device_id)
            .cloned()
    }

    fn open_device(&self, device_id: &str, callback: DeviceCallback) {
        if self.characteristics(device_id).is_none() {
            log::warn!("Simulated camera {} does not exist", device_id);
            callback(DeviceEvent::Error {
                device: None,
                code: ERROR_CAMERA_DEVICE,
            });
            return;
        }

        let event = {
            let mut state = self.lock();
            if state.token_for(device_id).is_some() {
                DeviceEvent::Error {
                    device: None,
                    code: ERROR_CAMERA_IN_USE,
                }
            } else {
                let token = state.token();
                state.devices.insert(
                    token,
                    OpenDevice {
                        device_id: device_id.to_string(),
                        callback: Arc::clone(&callback),
                    },
                );
                DeviceEvent::Opened(DeviceHandle {
                    device_id: device_id.to_string(),
                    token,
                })
            }
        };
        callback(event);
    }

    fn create_session(
        &self,
        device: &DeviceHandle,
        targets: &[OutputTarget],
        callback: SessionCallback,
    ) {
        let supported = self.characteristics(&device.device_id).is_some_and(|c| {
            targets
                .iter()
                .filter_map(OutputTarget::as_reader)
                .all(|ring| c.output_sizes(ring.format()).contains(&ring.size()))
        });

        let event = {
            let mut state = self.lock();
            if !supported || !state.devices.contains_key(&device.token) {
                SessionEvent::ConfigureFailed
            } else {
                let token = state.token();
                state.sessions.insert(
                    token,
                    Session {
                        device_token: device.token,
                        readers: targets
                            .iter()
                            .filter_map(OutputTarget::as_reader)
                            .cloned()
                            .collect(),
                        producer: None,
                    },
                );
                SessionEvent::Configured(SessionHandle { token })
            }
        };
        callback(event);
    }

    fn submit_repeating_request(
        &self,
        session: &SessionHandle,
        request: &CaptureRequest,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        let entry = state
            .sessions
            .get_mut(&session.token)
            .ok_or_else(|| DriverError("session is not configured".to_string()))?;
        if entry.producer.is_some() {
            return Err(DriverError("repeating request already active".to_string()));
        }
        let configured = &entry.readers;
        let readers: Vec<Arc<ImageRing>> = request
            .readers()
            .filter(|r| configured.iter().any(|c| Arc::ptr_eq(c, r)))
            .cloned()
            .collect();
        entry.producer = Some(self.spawn_producer(readers)?);
        log::debug!("Simulated session {} streaming", session.token);
        Ok(())
    }

    fn stop_repeating(&self, session: &SessionHandle) -> Result<(), DriverError> {
        let producer = self
            .lock()
            .sessions
            .get_mut(&session.token)
            .ok_or_else(|| DriverError("session is not configured".to_string()))?
            .producer
            .take();
        if let Some(producer) = producer {
            producer.stop();
        }
        Ok(())
    }

    fn close_device(&self, device: &DeviceHandle) -> Result<(), DriverError> {
        let (removed, producers) = self.lock().remove_device(device.token);
        for producer in producers {
            producer.stop();
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(DriverError(format!(
                "camera {} is not open",
                device.device_id
            ))),
        }
    }
}

/// The device table used by [`SimulatedDriver::new`].
pub fn default_devices() -> Vec<DeviceCharacteristics> {
    let yuv_sizes = vec![Size::new(640, 480), Size::new(1280, 720), Size::new(320, 240)];
    let configs = |sizes: Vec<Size>| {
        vec![
            StreamConfiguration {
                format: PixelFormat::Yuv420,
                sizes: sizes.clone(),
            },
            StreamConfiguration {
                format: PixelFormat::Jpeg,
                sizes,
            },
        ]
    };
    vec![
        DeviceCharacteristics {
            device_id: "0".to_string(),
            hardware_tier: HardwareTier::Full,
            lens_facing: LensFacing::Back,
            sensor_orientation: 90,
            stream_configurations: configs(yuv_sizes),
        },
        DeviceCharacteristics {
            device_id: "1".to_string(),
            hardware_tier: HardwareTier::Limited,
            lens_facing: LensFacing::Front,
            sensor_orientation: 270,
            stream_configurations: configs(vec![Size::new(640, 480), Size::new(320, 240)]),
        },
        DeviceCharacteristics {
            device_id: "2".to_string(),
            hardware_tier: HardwareTier::Legacy,
            lens_facing: LensFacing::External,
            sensor_orientation: 0,
            stream_configurations: configs(vec![Size::new(320, 240)]),
        },
    ]
}

/// Scores a frame by how dark its luma plane is.
#[derive(Debug, Clone)]
pub struct CoverClassifier {
    pub label: String,
    /// Scores below this are reported as no object at all
    pub min_confidence: f32,
}

impl Default for CoverClassifier {
    fn default() -> Self {
        Self {
            label: "finger".to_string(),
            min_confidence: 0.3,
        }
    }
}

/// Every n-th luma byte is sampled.
const SAMPLE_STEP: usize = 16;

impl CoverClassifier {
    /// Darkness of the frame in `0.0..=1.0`.
    pub fn score(luma: &[u8]) -> Option<f32> {
        let (sum, count) = luma
            .iter()
            .step_by(SAMPLE_STEP)
            .fold((0u64, 0u64), |(sum, count), &v| (sum + u64::from(v), count + 1));
        if count == 0 {
            return None;
        }
        let mean = sum as f32 / count as f32;
        Some(1.0 - mean / 255.0)
    }
}

impl Classifier for CoverClassifier {
    fn classify<'a>(
        &'a self,
        buffer: &'a ImageBuffer,
    ) -> BoxFuture<'a, Result<Option<Recognition>, ClassifierError>> {
        let result = match Self::score(buffer.frame().luma()) {
            None => Err(ClassifierError("empty frame".to_string())),
            Some(confidence) if confidence < self.min_confidence => Ok(None),
            Some(confidence) => Ok(Some(Recognition {
                label: self.label.clone(),
                confidence,
            })),
        };
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn open(driver: &SimulatedDriver, id: &str) -> DeviceEvent {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        driver.open_device(
            id,
            Arc::new(move |event| {
                let _ = tx.lock().unwrap().send(event);
            }),
        );
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_default_devices_listed_in_order() {
        let driver = SimulatedDriver::new();
        assert_eq!(driver.device_ids(), vec!["0", "1", "2"]);
        assert!(driver.characteristics("9").is_none());
    }

    #[test]
    fn test_open_unknown_device_reports_error() {
        let driver = SimulatedDriver::new();
        assert_eq!(
            open(&driver, "9"),
            DeviceEvent::Error {
                device: None,
                code: ERROR_CAMERA_DEVICE
            }
        );
    }

    #[test]
    fn test_second_open_reports_in_use() {
        let driver = SimulatedDriver::new();
        assert!(matches!(open(&driver, "0"), DeviceEvent::Opened(_)));
        assert_eq!(
            open(&driver, "0"),
            DeviceEvent::Error {
                device: None,
                code: ERROR_CAMERA_IN_USE
            }
        );
    }

    #[test]
    fn test_close_then_close_again_fails() {
        let driver = SimulatedDriver::new();
        let DeviceEvent::Opened(handle) = open(&driver, "0") else {
            panic!("Expected open");
        };
        assert!(driver.is_open("0"));
        driver.close_device(&handle).unwrap();
        assert!(!driver.is_open("0"));
        assert!(driver.close_device(&handle).is_err());
    }

    #[test]
    fn test_report_error_hands_over_device() {
        let driver = SimulatedDriver::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        driver.open_device(
            "0",
            Arc::new(move |event| {
                let _ = tx.lock().unwrap().send(event);
            }),
        );
        let DeviceEvent::Opened(handle) = rx.recv_timeout(WAIT).unwrap() else {
            panic!("Expected open");
        };

        assert!(driver.report_error("0", ERROR_CAMERA_DEVICE));
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            DeviceEvent::Error {
                device: Some(handle),
                code: ERROR_CAMERA_DEVICE
            }
        );
        assert!(!driver.is_open("0"));
    }

    #[test]
    fn test_disconnect_only_hits_open_devices() {
        let driver = SimulatedDriver::new();
        assert!(!driver.disconnect("0"));
        open(&driver, "0");
        assert!(driver.disconnect("0"));
        assert!(!driver.is_open("0"));
    }

    #[test]
    fn test_synthetic_frame_layout() {
        let frame = synthetic_frame(Size::new(4, 2), PixelFormat::Yuv420, 10);
        assert_eq!(frame.data.len(), 12);
        assert!(frame.luma().iter().all(|&v| v == 10));
        assert!(frame.data[8..].iter().all(|&v| v == 128));
    }

    #[test]
    fn test_cover_score() {
        assert_eq!(CoverClassifier::score(&[0; 64]), Some(1.0));
        assert_eq!(CoverClassifier::score(&[255; 64]), Some(0.0));
        assert_eq!(CoverClassifier::score(&[]), None);
    }
}
