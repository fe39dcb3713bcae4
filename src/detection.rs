//! Classifier seam and the results reported to the host.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::camera::{CameraError, ImageBuffer};

/// Default confidence threshold, as a percentage.
pub const DEFAULT_THRESHOLD_PERCENT: u8 = 75;

/// Best match reported by a classifier for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub label: String,
    /// Confidence in `0.0..=1.0`
    pub confidence: f32,
}

/// Classifier failure. Logged per frame, never fatal to the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("classification failed: {0}")]
pub struct ClassifierError(pub String);

/// An opaque frame classifier.
///
/// Implementations must not hold on to the buffer after the returned
/// future completes. `Ok(None)` means "no object".
pub trait Classifier: Send + Sync + 'static {
    fn classify<'a>(
        &'a self,
        buffer: &'a ImageBuffer,
    ) -> BoxFuture<'a, Result<Option<Recognition>, ClassifierError>>;
}

/// A recognition judged against the configured threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Confidence as a whole percentage, truncated
    pub probability: u8,
    /// `true` when confidence reached the threshold; otherwise the object
    /// was only "almost" detected
    pub blocked: bool,
}

impl Detection {
    pub fn assess(recognition: Recognition, threshold: f32) -> Self {
        let confidence = recognition.confidence.clamp(0.0, 1.0);
        Self {
            probability: (confidence * 100.0) as u8,
            blocked: confidence >= threshold,
            label: recognition.label,
            confidence,
        }
    }
}

/// Everything the pipeline reports to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A classified frame contained an object
    Detection(Detection),
    /// A classified frame contained nothing
    NoDetection,
    /// Relative rotation between sensor and display changed, in degrees
    OrientationChanged(u32),
    /// A fatal error after the session became active
    Error(CameraError),
}

pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether the host is still listening.
pub(crate) fn emit(events: &EventSender, event: PipelineEvent) {
    if events.send(event).is_err() {
        log::debug!("Host event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognition(confidence: f32) -> Recognition {
        Recognition {
            label: "finger".to_string(),
            confidence,
        }
    }

    #[test]
    fn test_confidence_above_threshold_is_blocked() {
        let detection = Detection::assess(recognition(0.82), 0.75);
        assert!(detection.blocked);
        assert_eq!(detection.probability, 82);
        assert_eq!(detection.label, "finger");
    }

    #[test]
    fn test_confidence_below_threshold_is_almost_blocked() {
        let detection = Detection::assess(recognition(0.40), 0.75);
        assert!(!detection.blocked);
        assert_eq!(detection.probability, 40);
    }

    #[test]
    fn test_probability_is_truncated() {
        assert_eq!(Detection::assess(recognition(0.829), 0.75).probability, 82);
        assert_eq!(Detection::assess(recognition(0.999), 0.75).probability, 99);
        assert_eq!(Detection::assess(recognition(0.575), 0.75).probability, 57);
    }

    #[test]
    fn test_confidence_equal_to_threshold_is_blocked() {
        assert!(Detection::assess(recognition(0.75), 0.75).blocked);
    }

    #[test]
    fn test_out_of_range_confidence_is_clamped() {
        let detection = Detection::assess(recognition(1.7), 0.75);
        assert_eq!(detection.probability, 100);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (tx, rx) = event_channel();
        drop(rx);
        emit(&tx, PipelineEvent::NoDetection);
    }
}
