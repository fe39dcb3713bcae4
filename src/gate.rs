//! Single-slot admission between the image ring and the classifier.
//!
//! At most one frame is being classified at any moment. A frame that
//! arrives while the slot is taken is released on the spot; frames are
//! never queued behind a running classification.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::camera::{CameraError, ImageAvailableListener, ImageBuffer, PixelFormat};
use crate::detection::{emit, Classifier, Detection, EventSender, PipelineEvent};
use crate::worker::Worker;

/// Whether the gate's single slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Processing,
}

impl GateState {
    const IDLE: u8 = 0;
    const PROCESSING: u8 = 1;

    fn from_u8(value: u8) -> Self {
        if value == Self::PROCESSING {
            GateState::Processing
        } else {
            GateState::Idle
        }
    }
}

/// Frame counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub classified: u64,
    /// Frames released unclassified because the slot was busy
    pub dropped: u64,
    pub format_mismatches: u64,
}

struct GateShared {
    state: AtomicU8,
    attached: AtomicBool,
    expected_format: PixelFormat,
    threshold: f32,
    classifier: Arc<dyn Classifier>,
    events: EventSender,
    classified: AtomicU64,
    dropped: AtomicU64,
    format_mismatches: AtomicU64,
}

impl GateShared {
    fn finish(&self) {
        self.state.store(GateState::IDLE, Ordering::SeqCst);
    }
}

/// Returns the slot to `Idle` however the classification task ends,
/// including when the runtime drops it before its first poll.
struct IdleOnDrop(Arc<GateShared>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Admission gate in front of the classifier.
#[derive(Clone)]
pub struct FrameGate {
    shared: Arc<GateShared>,
    runtime: Handle,
    buffer_ops: Worker,
}

impl std::fmt::Debug for FrameGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGate")
            .field("state", &self.state())
            .field("expected_format", &self.shared.expected_format)
            .field("threshold", &self.shared.threshold)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FrameGate {
    /// Classification tasks are spawned on `runtime`; classified buffers
    /// are released back on `buffer_ops`.
    pub fn new(
        classifier: Arc<dyn Classifier>,
        expected_format: PixelFormat,
        threshold: f32,
        events: EventSender,
        runtime: Handle,
        buffer_ops: Worker,
    ) -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: AtomicU8::new(GateState::IDLE),
                attached: AtomicBool::new(true),
                expected_format,
                threshold,
                classifier,
                events,
                classified: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                format_mismatches: AtomicU64::new(0),
            }),
            runtime,
            buffer_ops,
        }
    }

    pub fn state(&self) -> GateState {
        GateState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            classified: self.shared.classified.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            format_mismatches: self.shared.format_mismatches.load(Ordering::Relaxed),
        }
    }

    /// Stop admitting frames. A classification already running is left to
    /// finish and still reports its result.
    pub fn detach(&self) {
        self.shared.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    /// Admit or drop one buffer. Runs on the `buffer-ops` worker and never
    /// waits for the classifier.
    pub fn on_buffer_available(&self, buffer: ImageBuffer) {
        let shared = &self.shared;
        if !self.is_attached() {
            buffer.release();
            return;
        }

        if buffer.format() != shared.expected_format {
            shared.format_mismatches.fetch_add(1, Ordering::Relaxed);
            let err = CameraError::FrameFormatMismatch {
                expected: shared.expected_format,
                actual: buffer.format(),
            };
            log::warn!("Skipping frame: {}", err);
            buffer.release();
            return;
        }

        if shared
            .state
            .compare_exchange(
                GateState::IDLE,
                GateState::PROCESSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Classifier busy, dropping frame");
            buffer.release();
            return;
        }

        let shared = Arc::clone(shared);
        let idle = IdleOnDrop(Arc::clone(&shared));
        let buffer_ops = self.buffer_ops.clone();
        self.runtime.spawn(async move {
            let result = shared.classifier.classify(&buffer).await;
            buffer_ops.submit_or_run(move || {
                buffer.release();
                drop(idle);
            });

            match result {
                Ok(recognition) => {
                    shared.classified.fetch_add(1, Ordering::Relaxed);
                    let event = match recognition {
                        Some(recognition) => {
                            let detection = Detection::assess(recognition, shared.threshold);
                            if detection.blocked {
                                log::info!(
                                    "Detected: {} {}",
                                    detection.label,
                                    detection.probability
                                );
                            } else {
                                log::info!(
                                    "Detected: {} {} (low confidence)",
                                    detection.label,
                                    detection.probability
                                );
                            }
                            PipelineEvent::Detection(detection)
                        }
                        None => {
                            log::debug!("Detected: no");
                            PipelineEvent::NoDetection
                        }
                    };
                    emit(&shared.events, event);
                }
                Err(e) => log::warn!("{}", e),
            }
        });
    }
}

impl ImageAvailableListener for FrameGate {
    fn on_image_available(&self, buffer: ImageBuffer) {
        self.on_buffer_available(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Frame, ImageRing, Size, IMAGE_BUFFER_SIZE};
    use crate::detection::{event_channel, ClassifierError, Recognition};
    use crate::worker::Worker;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Classifier that blocks until released and tracks concurrency.
    struct HeldClassifier {
        release: Notify,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        confidence: f32,
    }

    impl HeldClassifier {
        fn new(confidence: f32) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                confidence,
            })
        }
    }

    impl Classifier for HeldClassifier {
        fn classify<'a>(
            &'a self,
            _buffer: &'a ImageBuffer,
        ) -> BoxFuture<'a, Result<Option<Recognition>, ClassifierError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                self.release.notified().await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(Recognition {
                    label: "finger".to_string(),
                    confidence: self.confidence,
                }))
            }
            .boxed()
        }
    }

    fn worker() -> Worker {
        Worker::spawn("gate-test").unwrap()
    }

    fn ring(format: PixelFormat, worker: &Worker) -> Arc<ImageRing> {
        ImageRing::new(Size::new(2, 2), format, IMAGE_BUFFER_SIZE, worker.clone())
    }

    fn gate(classifier: Arc<dyn Classifier>, events: EventSender, worker: &Worker) -> FrameGate {
        FrameGate::new(
            classifier,
            PixelFormat::Yuv420,
            0.75,
            events,
            Handle::current(),
            worker.clone(),
        )
    }

    fn buffer(ring: &Arc<ImageRing>, format: PixelFormat) -> ImageBuffer {
        assert!(ring.produce(Frame::new(vec![0; 6], Size::new(2, 2), format)));
        ring.acquire_next().unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_buffer_dropped_while_processing() {
        let classifier = HeldClassifier::new(0.82);
        let (tx, mut rx) = event_channel();
        let worker = worker();
        let gate = gate(classifier.clone(), tx, &worker);
        let ring = ring(PixelFormat::Yuv420, &worker);

        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));
        assert_eq!(gate.state(), GateState::Processing);
        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));

        // Second buffer went straight back to the ring.
        assert_eq!(ring.stats().in_use, 1);
        assert_eq!(gate.stats().dropped, 1);

        wait_until(|| classifier.calls.load(Ordering::SeqCst) == 1).await;
        classifier.release.notify_one();

        let event = rx.recv().await.unwrap();
        match event {
            PipelineEvent::Detection(d) => {
                assert!(d.blocked);
                assert_eq!(d.probability, 82);
            }
            other => panic!("Expected detection, got {:?}", other),
        }
        wait_until(|| gate.state() == GateState::Idle).await;
        wait_until(|| ring.stats().in_use == 0).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_classification_in_flight() {
        let classifier = HeldClassifier::new(0.40);
        let (tx, mut rx) = event_channel();
        let worker = worker();
        let gate = gate(classifier.clone(), tx, &worker);
        let ring = ring(PixelFormat::Yuv420, &worker);

        for _ in 0..3 {
            for _ in 0..4 {
                gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));
            }
            wait_until(|| classifier.in_flight.load(Ordering::SeqCst) == 1).await;
            classifier.release.notify_one();
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, PipelineEvent::Detection(ref d) if !d.blocked));
            wait_until(|| gate.state() == GateState::Idle).await;
            wait_until(|| ring.stats().in_use == 0).await;
        }

        assert_eq!(classifier.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(gate.stats().classified, 3);
        assert_eq!(gate.stats().dropped, 9);
    }

    #[tokio::test]
    async fn test_classified_buffer_is_released_on_buffer_worker() {
        let classifier = HeldClassifier::new(0.9);
        let (tx, mut rx) = event_channel();
        let worker = worker();
        let gate = gate(classifier.clone(), tx, &worker);
        let ring = ring(PixelFormat::Yuv420, &worker);

        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));
        wait_until(|| classifier.calls.load(Ordering::SeqCst) == 1).await;

        // Occupy the worker so the release queues behind this task.
        let (unblock_tx, unblock_rx) = std::sync::mpsc::channel::<()>();
        let (ran_tx, ran_rx) = std::sync::mpsc::channel::<Option<String>>();
        worker
            .submit(move || {
                let _ = unblock_rx.recv();
                let _ = ran_tx.send(std::thread::current().name().map(str::to_string));
            })
            .unwrap();

        classifier.release.notify_one();
        assert!(matches!(rx.recv().await, Some(PipelineEvent::Detection(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ring.stats().in_use, 1);
        assert_eq!(gate.state(), GateState::Processing);

        unblock_tx.send(()).unwrap();
        wait_until(|| ring.stats().in_use == 0).await;
        wait_until(|| gate.state() == GateState::Idle).await;
        assert_eq!(ran_rx.recv().unwrap().as_deref(), Some("gate-test"));
    }

    #[test]
    fn test_spawn_on_stopped_runtime_reopens_gate() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let (tx, _rx) = event_channel();
        let worker = worker();
        let classifier = HeldClassifier::new(0.9);
        let gate = FrameGate::new(
            classifier.clone(),
            PixelFormat::Yuv420,
            0.75,
            tx,
            handle,
            worker.clone(),
        );
        let ring = ring(PixelFormat::Yuv420, &worker);

        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));

        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(ring.stats().in_use, 0);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_format_mismatch_releases_without_admitting() {
        let classifier = HeldClassifier::new(0.9);
        let (tx, _rx) = event_channel();
        let worker = worker();
        let gate = gate(classifier.clone(), tx, &worker);
        let ring = ring(PixelFormat::Jpeg, &worker);

        gate.on_buffer_available(buffer(&ring, PixelFormat::Jpeg));

        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(gate.stats().format_mismatches, 1);
        assert_eq!(ring.stats().in_use, 0);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detached_gate_releases_everything() {
        let classifier = HeldClassifier::new(0.9);
        let (tx, _rx) = event_channel();
        let worker = worker();
        let gate = gate(classifier.clone(), tx, &worker);
        let ring = ring(PixelFormat::Yuv420, &worker);

        gate.detach();
        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));

        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(ring.stats().in_use, 0);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn classify<'a>(
            &'a self,
            _buffer: &'a ImageBuffer,
        ) -> BoxFuture<'a, Result<Option<Recognition>, ClassifierError>> {
            async { Err(ClassifierError("model not loaded".to_string())) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_classifier_failure_releases_and_reopens_gate() {
        let (tx, _rx) = event_channel();
        let worker = worker();
        let gate = gate(Arc::new(FailingClassifier), tx, &worker);
        let ring = ring(PixelFormat::Yuv420, &worker);

        gate.on_buffer_available(buffer(&ring, PixelFormat::Yuv420));
        wait_until(|| gate.state() == GateState::Idle).await;

        assert_eq!(ring.stats().in_use, 0);
        assert_eq!(gate.stats().classified, 0);
    }
}
