//! Thread boundary between the device driver and the pipeline.
//!
//! [`CallbackBridge`] is installed as the driver's [`StreamObserver`]. It runs
//! entirely on the driver's callback thread and never suspends: it samples the
//! selected camera stream, copies and rotates every Nth image, and posts the
//! result through a [`Handoff`] so that the actual bus publish happens on the
//! scheduler.
//!
//! Nothing ever unwinds back into the driver. Callback bodies run under
//! `catch_unwind`, and a closed handoff only drops the event and logs.

use crate::backend::StreamObserver;
use crate::config::StreamingSettings;
use crate::pipeline::bus::Handoff;
use crate::pipeline::event::{Event, Payload, Topic};
use crate::pipeline::id::SessionId;
use crate::types::{CameraId, CaptureRecord, FrameSample, ImageView, Rotation, StreamingErrorCode};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters kept by a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Images of the selected camera seen by the bridge
    pub seen: u64,
    /// Samples handed off to the scheduler
    pub forwarded: u64,
    /// Samples or failures lost (bad buffer, closed handoff, panic)
    pub dropped: u64,
}

/// Adapts driver callbacks into bus events.
pub struct CallbackBridge {
    handoff: Handoff,
    session: SessionId,
    camera: CameraId,
    divisor: u64,
    rotation: Rotation,
    topics: Vec<Topic>,
    counter: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl CallbackBridge {
    /// Create a bridge for one pipeline run.
    ///
    /// Every sampled frame is published to each of `topics`, sharing one
    /// allocation.
    pub fn new(
        handoff: Handoff,
        session: SessionId,
        streaming: &StreamingSettings,
        topics: Vec<Topic>,
    ) -> Self {
        Self {
            handoff,
            session,
            camera: streaming.camera,
            divisor: streaming.sample_divisor.max(1),
            rotation: streaming.rotation,
            topics,
            counter: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            seen: self.counter.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Sample and transform one image.
    ///
    /// Returns `None` for images that are skipped by sampling, belong to
    /// another camera, or carry a buffer that does not match their size.
    pub fn sample(&self, image: ImageView<'_>, record: &CaptureRecord) -> Option<FrameSample> {
        if record.camera != self.camera {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if index % self.divisor != 0 {
            return None;
        }

        let Some(owned) = image.to_owned_image() else {
            tracing::warn!(
                "Dropping frame {}: buffer of {} bytes does not fit {}x{}",
                record.frame_number,
                image.data.len(),
                image.width,
                image.height
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        Some(FrameSample {
            image: self.rotation.apply(owned),
            record: *record,
            sample_index: index,
        })
    }

    fn post(&self, event: Event) -> bool {
        match self.handoff.post(event) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Session {}: {}", self.session, e);
                false
            }
        }
    }

    fn forward_image(&self, image: ImageView<'_>, record: &CaptureRecord) {
        let Some(sample) = self.sample(image, record) else {
            return;
        };

        let sample = Arc::new(sample);
        let mut delivered = false;
        for topic in &self.topics {
            let payload = Payload::Frame {
                session: self.session,
                sample: Arc::clone(&sample),
            };
            delivered |= self.post(Event::new(topic.clone(), payload));
        }

        if delivered {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Session {}: forwarded sample {} ({}x{})",
                self.session,
                sample.sample_index,
                sample.width(),
                sample.height()
            );
        }
    }
}

impl StreamObserver for CallbackBridge {
    fn on_image_received(&self, image: ImageView<'_>, record: &CaptureRecord) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.forward_image(image, record)));
        if result.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "Session {}: panic while handling frame {}",
                self.session,
                record.frame_number
            );
        }
    }

    fn on_streaming_failure(&self, code: StreamingErrorCode, message: &str) {
        tracing::error!("Session {}: streaming failed ({}): {}", self.session, code, message);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.post(Event::new(
                Topic::STREAM_FAILURE,
                Payload::StreamFailure {
                    session: self.session,
                    code,
                    message: message.to_string(),
                },
            ))
        }));
        if result.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
