//! Camera image stream feeding the engine.
//!
//! The camera side owns a [`FrameProducer`] and pushes images from any
//! thread. Images land in a single-slot mailbox: a newer image replaces an
//! unconsumed older one, so a slow render loop always draws the most recent
//! frame and memory stays bounded. A listener is notified once per pending
//! image; further pushes before the render thread pulls are coalesced.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::BackendError;
use crate::context::{RenderContext, ThreadAffinity};
use crate::uniforms::IDENTITY_TRANSFORM;

/// One camera image in RGBA8 with its capture metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Capture time in nanoseconds, propagated to the encoder as the presentation time.
    pub timestamp_ns: i64,
    /// Column-major texture coordinate transform supplied by the camera.
    pub transform: [f32; 16],
}

impl CameraImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, timestamp_ns: i64) -> Self {
        Self {
            width,
            height,
            pixels,
            timestamp_ns,
            transform: IDENTITY_TRANSFORM,
        }
    }

    pub fn with_transform(mut self, transform: [f32; 16]) -> Self {
        self.transform = transform;
        self
    }

    fn validate(&self) -> Result<(), FrameSourceError> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.width == 0 || self.height == 0 || self.pixels.len() != expected {
            return Err(FrameSourceError::InvalidImage {
                width: self.width,
                height: self.height,
                actual: self.pixels.len(),
                expected,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameSourceError {
    #[error("frame source has been released")]
    Released,
    #[error("camera image is {width}x{height} but carries {actual} bytes; expected {expected}")]
    InvalidImage {
        width: u32,
        height: u32,
        actual: usize,
        expected: usize,
    },
    #[error("camera texture upload failed: {0}")]
    Upload(#[from] BackendError),
}

/// Called when a new image is pending. Returns `false` if the notification could not be delivered.
pub type FrameListener = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Mailbox {
    latest: Mutex<Option<CameraImage>>,
    listener: Mutex<Option<FrameListener>>,
    pending: AtomicBool,
    released: AtomicBool,
    pushed: AtomicU64,
    replaced: AtomicU64,
}

impl Mailbox {
    fn latest(&self) -> MutexGuard<'_, Option<CameraImage>> {
        match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<FrameListener>> {
        match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self) {
        let delivered = match self.listener().as_ref() {
            Some(listener) => listener(),
            // Nobody listens yet; attach_listener fires for the pending image.
            None => true,
        };
        if !delivered {
            self.pending.store(false, Ordering::Release);
        }
    }
}

/// Camera-side handle. Cheap to clone and safe to use from any thread.
#[derive(Clone, Default)]
pub struct FrameProducer {
    mailbox: Arc<Mailbox>,
}

impl FrameProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `image` as the latest frame, replacing any image not yet rendered.
    pub fn push(&self, image: CameraImage) -> Result<(), FrameSourceError> {
        if self.mailbox.released.load(Ordering::Acquire) {
            return Err(FrameSourceError::Released);
        }
        image.validate()?;

        if self.mailbox.latest().replace(image).is_some() {
            self.mailbox.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.mailbox.pushed.fetch_add(1, Ordering::Relaxed);

        if !self.mailbox.pending.swap(true, Ordering::AcqRel) {
            self.mailbox.notify();
        }
        Ok(())
    }

    pub fn frames_pushed(&self) -> u64 {
        self.mailbox.pushed.load(Ordering::Relaxed)
    }

    /// Images overwritten before the render thread pulled them.
    pub fn frames_replaced(&self) -> u64 {
        self.mailbox.replaced.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.mailbox.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FrameProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProducer")
            .field("pushed", &self.frames_pushed())
            .field("replaced", &self.frames_replaced())
            .finish()
    }
}

/// Capture metadata of the image most recently pulled into the camera texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameStamp {
    pub timestamp_ns: i64,
    pub size: (u32, u32),
}

/// Render-thread side of the camera stream; owns the camera texture contents.
pub struct FrameSource {
    mailbox: Arc<Mailbox>,
    affinity: ThreadAffinity,
    transform: [f32; 16],
    released: bool,
}

impl FrameSource {
    /// Binds the stream to the calling thread, which must be the render thread.
    pub fn bind(producer: &FrameProducer) -> Self {
        Self {
            mailbox: producer.mailbox.clone(),
            affinity: ThreadAffinity::current(),
            transform: IDENTITY_TRANSFORM,
            released: false,
        }
    }

    /// Installs the frame-available callback. Fires immediately if an image is already pending.
    pub fn attach_listener(
        &mut self,
        listener: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<(), FrameSourceError> {
        if self.released {
            return Err(FrameSourceError::Released);
        }
        *self.mailbox.listener() = Some(Box::new(listener));
        if self.mailbox.pending.load(Ordering::Acquire) {
            self.mailbox.notify();
        }
        Ok(())
    }

    /// Uploads the newest image into the camera texture.
    ///
    /// Returns `Ok(None)` when the notification was already satisfied by an
    /// earlier pull. Render thread only.
    pub fn pull_latest_image(
        &mut self,
        context: &mut RenderContext,
    ) -> Result<Option<FrameStamp>, FrameSourceError> {
        self.affinity.assert_current("pull_latest_image");
        if self.released {
            return Err(FrameSourceError::Released);
        }

        // Clear before taking so a push racing with this pull raises a fresh notification.
        self.mailbox.pending.store(false, Ordering::Release);
        let Some(image) = self.mailbox.latest().take() else {
            return Ok(None);
        };

        context.update_camera_texture(&image)?;
        let stamp = FrameStamp {
            timestamp_ns: image.timestamp_ns,
            size: (image.width, image.height),
        };
        self.transform = image.transform;
        Ok(Some(stamp))
    }

    /// Transform of the last pulled image; identity before the first pull.
    pub fn latest_transform(&self) -> [f32; 16] {
        self.transform
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Detaches the listener and drops any pending image. Later pushes fail with `Released`.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.mailbox.released.store(true, Ordering::Release);
        self.mailbox.listener().take();
        self.mailbox.latest().take();
        tracing::debug!(
            pushed = self.mailbox.pushed.load(Ordering::Relaxed),
            replaced = self.mailbox.replaced.load(Ordering::Relaxed),
            "frame source released"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn image(timestamp_ns: i64) -> CameraImage {
        CameraImage::new(2, 2, vec![0; 16], timestamp_ns)
    }

    fn counting_listener(source: &mut FrameSource) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        source
            .attach_listener(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();
        calls
    }

    #[test]
    fn pushes_coalesce_until_pulled() {
        let producer = FrameProducer::new();
        let mut source = FrameSource::bind(&producer);
        let calls = counting_listener(&mut source);

        producer.push(image(1)).unwrap();
        producer.push(image(2)).unwrap();
        producer.push(image(3)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(producer.frames_pushed(), 3);
        assert_eq!(producer.frames_replaced(), 2);
        assert_eq!(producer.mailbox.latest().as_ref().unwrap().timestamp_ns, 3);
    }

    #[test]
    fn attaching_late_delivers_pending_frame() {
        let producer = FrameProducer::new();
        producer.push(image(7)).unwrap();
        let mut source = FrameSource::bind(&producer);
        let calls = counting_listener(&mut source);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undelivered_notification_is_retried_on_next_push() {
        let producer = FrameProducer::new();
        let mut source = FrameSource::bind(&producer);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        source
            .attach_listener(move || counter.fetch_add(1, Ordering::SeqCst) > 0)
            .unwrap();

        producer.push(image(1)).unwrap();
        producer.push(image(2)).unwrap();
        producer.push(image(3)).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_malformed_images() {
        let producer = FrameProducer::new();
        let err = producer
            .push(CameraImage::new(4, 4, vec![0; 3], 0))
            .unwrap_err();
        assert!(matches!(err, FrameSourceError::InvalidImage { expected: 64, .. }));
    }

    #[test]
    fn release_stops_the_stream() {
        let producer = FrameProducer::new();
        let mut source = FrameSource::bind(&producer);
        producer.push(image(1)).unwrap();
        source.release();
        assert!(source.is_released());
        assert!(matches!(
            producer.push(image(2)),
            Err(FrameSourceError::Released)
        ));
        assert!(matches!(
            source.attach_listener(|| true),
            Err(FrameSourceError::Released)
        ));
        assert_eq!(source.latest_transform(), IDENTITY_TRANSFORM);
    }
}
