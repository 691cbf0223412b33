//! Screen Capture and Per-Tick Caching
//!
//! Capture is the most expensive operation in the loop, so one tick never
//! captures the same region twice: frames are memoized under a short TTL,
//! keyed by the scan-height cutoff they were taken with. Detection outcomes
//! that are expensive but slow-moving (the priority probes) get their own
//! cache with an independent TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The observed surface disappeared (window closed, monitor detached)
    #[error("capture surface lost: {0}")]
    SurfaceLost(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// One captured frame, tightly packed RGBA. Cropped frames remember
/// their origin within the captured surface, so match coordinates can be
/// translated back without threading offsets alongside every frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Surface-relative position of this frame's top-left corner
    pub origin: (u32, u32),
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 4) as usize);
        Self { width, height, origin: (0, 0), pixels }
    }

    /// Copy of the top `max_height` rows. Row-major RGBA makes this a
    /// single slice copy.
    pub fn cropped_to(&self, max_height: u32) -> Frame {
        let h = max_height.min(self.height);
        let bytes = (self.width * h * 4) as usize;
        Frame {
            width: self.width,
            height: h,
            origin: self.origin,
            pixels: self.pixels[..bytes].to_vec(),
        }
    }

    /// Copy of an arbitrary sub-rectangle, clipped to the frame.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Frame {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let w = w.min(self.width - x);
        let h = h.min(self.height - y);
        let mut pixels = Vec::with_capacity((w * h * 4) as usize);
        for row in y..y + h {
            let start = ((row * self.width + x) * 4) as usize;
            pixels.extend_from_slice(&self.pixels[start..start + (w * 4) as usize]);
        }
        Frame {
            width: w,
            height: h,
            origin: (self.origin.0 + x, self.origin.1 + y),
            pixels,
        }
    }
}

/// Anything that can produce frames of the observed surface. The monitor
/// thread owns its own source, so implementations must be `Send`.
pub trait FrameSource: Send {
    /// Capture the surface, optionally cut off below `max_height` rows.
    fn capture(&mut self, max_height: Option<u32>) -> Result<Frame, CaptureError>;
}

/// TTL memoization of frames, keyed by scan-height cutoff. A full-height
/// request and a cut-off request are distinct entries.
pub struct CaptureCache {
    ttl: Duration,
    frames: HashMap<Option<u32>, (Instant, Frame)>,
}

impl CaptureCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, frames: HashMap::new() }
    }

    /// Return a cached frame if fresh, otherwise capture and cache.
    /// The source lock is held only for the capture itself.
    pub fn get(
        &mut self,
        source: &Mutex<Box<dyn FrameSource>>,
        max_height: Option<u32>,
        force: bool,
    ) -> Result<Frame, CaptureError> {
        if !force {
            if let Some((taken, frame)) = self.frames.get(&max_height) {
                if taken.elapsed() < self.ttl {
                    trace!(?max_height, "frame cache hit");
                    return Ok(frame.clone());
                }
            }
        }
        let frame = source.lock().unwrap().capture(max_height)?;
        self.frames.insert(max_height, (Instant::now(), frame.clone()));
        Ok(frame)
    }

    /// Drop everything. Called after any action that changes the surface.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// TTL memoization for a detection outcome, keyed like the frame cache.
/// The TTL is independent of the frame TTL: a priority probe result may
/// outlive the frame it was computed from.
pub struct ResultCache<T: Clone> {
    ttl: Duration,
    entries: HashMap<Option<u32>, (Instant, T)>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    pub fn get(&self, key: Option<u32>) -> Option<T> {
        let (taken, value) = self.entries.get(&key)?;
        (taken.elapsed() < self.ttl).then(|| value.clone())
    }

    pub fn put(&mut self, key: Option<u32>, value: T) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Captures a physical monitor.
#[cfg(feature = "vision")]
pub struct MonitorSource {
    monitor: xcap::Monitor,
}

#[cfg(feature = "vision")]
impl MonitorSource {
    pub fn open(index: usize) -> Result<Self, CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureError::SurfaceLost(e.to_string()))?;
        let monitor = monitors
            .into_iter()
            .nth(index)
            .ok_or_else(|| CaptureError::SurfaceLost(format!("no monitor at index {index}")))?;
        Ok(Self { monitor })
    }
}

#[cfg(feature = "vision")]
impl FrameSource for MonitorSource {
    fn capture(&mut self, max_height: Option<u32>) -> Result<Frame, CaptureError> {
        let image = self
            .monitor
            .capture_image()
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
        let (width, height) = (image.width(), image.height());
        let frame = Frame::new(width, height, image.into_raw());
        Ok(match max_height {
            Some(h) if h < height => frame.cropped_to(h),
            _ => frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        captures: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn capture(&mut self, max_height: Option<u32>) -> Result<Frame, CaptureError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            let h = max_height.unwrap_or(100);
            Ok(Frame::new(10, h, vec![0u8; (10 * h * 4) as usize]))
        }
    }

    fn source_with_counter() -> (Mutex<Box<dyn FrameSource>>, Arc<AtomicUsize>) {
        let captures = Arc::new(AtomicUsize::new(0));
        let source: Mutex<Box<dyn FrameSource>> = Mutex::new(Box::new(CountingSource {
            captures: captures.clone(),
        }));
        (source, captures)
    }

    #[test]
    fn fresh_entry_is_served_without_recapture() {
        let (source, captures) = source_with_counter();
        let mut cache = CaptureCache::new(Duration::from_secs(60));

        cache.get(&source, Some(660), false).unwrap();
        cache.get(&source, Some(660), false).unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_heights_are_distinct_entries() {
        let (source, captures) = source_with_counter();
        let mut cache = CaptureCache::new(Duration::from_secs(60));

        cache.get(&source, Some(660), false).unwrap();
        cache.get(&source, Some(710), false).unwrap();
        cache.get(&source, None, false).unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn force_and_clear_bypass_the_cache() {
        let (source, captures) = source_with_counter();
        let mut cache = CaptureCache::new(Duration::from_secs(60));

        cache.get(&source, None, false).unwrap();
        cache.get(&source, None, true).unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 2);

        cache.clear();
        cache.get(&source, None, false).unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn expired_entry_is_recaptured() {
        let (source, captures) = source_with_counter();
        let mut cache = CaptureCache::new(Duration::from_millis(0));

        cache.get(&source, None, false).unwrap();
        cache.get(&source, None, false).unwrap();
        assert_eq!(captures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn result_cache_honors_its_own_ttl() {
        let mut cache: ResultCache<bool> = ResultCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(Some(660)), None);
        cache.put(Some(660), true);
        assert_eq!(cache.get(Some(660)), Some(true));
        assert_eq!(cache.get(None), None);

        let mut expired: ResultCache<bool> = ResultCache::new(Duration::from_millis(0));
        expired.put(None, true);
        assert_eq!(expired.get(None), None);
    }

    #[test]
    fn crops_clip_to_frame_bounds() {
        let frame = Frame::new(4, 4, (0..64).collect());
        let top = frame.cropped_to(2);
        assert_eq!((top.width, top.height), (4, 2));
        assert_eq!(top.pixels.len(), 32);
        assert_eq!(&top.pixels[..4], &[0, 1, 2, 3]);

        let sub = frame.crop(2, 2, 10, 10);
        assert_eq!((sub.width, sub.height), (2, 2));
        assert_eq!(sub.origin, (2, 2));
        // Row 2 starts at byte (2*4+2)*4 = 40.
        assert_eq!(sub.pixels[0], 40);

        // Nested crops accumulate their origin.
        let nested = sub.crop(1, 0, 1, 1);
        assert_eq!(nested.origin, (3, 2));
    }
}
