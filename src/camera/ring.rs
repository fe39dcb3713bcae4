//! Fixed-capacity image ring shared between the driver and the consumer.
//!
//! The driver writes frames with [`ImageRing::produce`]; the consumer
//! acquires them as [`ImageBuffer`]s on the `buffer-ops` worker. A slot is
//! occupied from the moment a frame is queued until its buffer is released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::types::{Frame, PixelFormat, Size};
use crate::worker::Worker;

/// Maximum number of images held by the ring at once.
pub const IMAGE_BUFFER_SIZE: usize = 2;

/// Receives acquired buffers. Called on the `buffer-ops` worker.
pub trait ImageAvailableListener: Send + Sync {
    fn on_image_available(&self, buffer: ImageBuffer);
}

/// Counters describing how the ring has behaved under load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub produced: u64,
    /// Queued frames replaced by newer ones before anyone acquired them
    pub overwritten: u64,
    /// Frames discarded because every slot was held by the consumer
    pub stalled: u64,
    /// Buffers currently held by the consumer
    pub in_use: usize,
}

#[derive(Default)]
struct RingState {
    queued: VecDeque<Frame>,
    acquired: usize,
    listener: Option<Arc<dyn ImageAvailableListener>>,
    closed: bool,
    stats: RingStats,
}

/// Ring of image slots bound to one negotiated size and format.
pub struct ImageRing {
    size: Size,
    format: PixelFormat,
    capacity: usize,
    buffer_ops: Worker,
    state: Mutex<RingState>,
}

impl std::fmt::Debug for ImageRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRing")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ImageRing {
    pub fn new(size: Size, format: PixelFormat, capacity: usize, buffer_ops: Worker) -> Arc<Self> {
        Arc::new(Self {
            size,
            format,
            capacity: capacity.max(1),
            buffer_ops,
            state: Mutex::new(RingState::default()),
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RingStats {
        let state = self.lock();
        RingStats {
            in_use: state.acquired,
            ..state.stats
        }
    }

    /// Driver side: queue a freshly captured frame.
    ///
    /// When the ring is full the oldest unacquired frame is replaced. If
    /// every slot is held by the consumer the new frame is discarded and
    /// `false` is returned.
    pub fn produce(self: &Arc<Self>, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.queued.len() + state.acquired >= self.capacity {
            if state.queued.pop_front().is_some() {
                state.stats.overwritten += 1;
                log::debug!("Image ring full, replaced oldest queued frame");
            } else {
                state.stats.stalled += 1;
                log::debug!(
                    "Image ring stalled: all {} slots held by consumer",
                    self.capacity
                );
                return false;
            }
        }
        state.queued.push_back(frame);
        state.stats.produced += 1;
        let notify = state.listener.is_some();
        drop(state);

        if notify {
            self.schedule_dispatch();
        }
        true
    }

    /// Take the oldest queued frame, occupying its slot until released.
    pub fn acquire_next(self: &Arc<Self>) -> Option<ImageBuffer> {
        let mut state = self.lock();
        let frame = state.queued.pop_front()?;
        state.acquired += 1;
        Some(ImageBuffer {
            frame,
            ring: Some(Arc::clone(self)),
        })
    }

    /// Register the consumer. Frames already queued are dispatched to it.
    pub fn set_listener(self: &Arc<Self>, listener: Arc<dyn ImageAvailableListener>) {
        let pending = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.listener = Some(listener);
            state.queued.len()
        };
        for _ in 0..pending {
            self.schedule_dispatch();
        }
    }

    pub fn clear_listener(&self) {
        self.lock().listener = None;
    }

    /// Stop accepting frames and discard anything not yet acquired.
    /// Buffers already held by the consumer stay valid until released.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.listener = None;
        state.queued.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn schedule_dispatch(self: &Arc<Self>) {
        let ring = Arc::clone(self);
        if let Err(e) = self.buffer_ops.submit(move || ring.dispatch_next()) {
            log::debug!("Dropping image notification: {}", e);
        }
    }

    fn dispatch_next(self: &Arc<Self>) {
        let Some(listener) = self.lock().listener.clone() else {
            return;
        };
        if let Some(buffer) = self.acquire_next() {
            listener.on_image_available(buffer);
        }
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.acquired = state.acquired.saturating_sub(1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One acquired slot of an [`ImageRing`].
///
/// The slot is returned to the ring exactly once: by [`ImageBuffer::release`]
/// or, failing that, when the buffer is dropped.
pub struct ImageBuffer {
    frame: Frame,
    ring: Option<Arc<ImageRing>>,
}

impl std::fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("size", &self.frame.size)
            .field("format", &self.frame.format)
            .finish_non_exhaustive()
    }
}

impl ImageBuffer {
    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    pub fn size(&self) -> Size {
        self.frame.size
    }

    pub fn data(&self) -> &[u8] {
        &self.frame.data
    }

    pub fn timestamp(&self) -> Instant {
        self.frame.timestamp
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Hand the slot back to the ring.
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if let Some(ring) = self.ring.take() {
            ring.release_slot();
        }
    }
}

impl Drop for ImageBuffer {
    fn drop(&mut self) {
        self.release_slot();
    }
}
