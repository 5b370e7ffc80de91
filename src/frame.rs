//! Shared video frame handles
//!
//! A frame is created by the decode stage, cached in the frame queue, and may
//! simultaneously be held by a caller. The raw decoded raster lives inside
//! the handle until the first image materialization, which converts once,
//! caches the result and releases the raster.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ffmpeg_next::util::frame::video::Video as RawFrame;
use parking_lot::{Mutex, MutexGuard};

use crate::convert::{FrameConverter, OutputImage};
use crate::decode;
use crate::error::{Error, Result};

/// Backoff between attempts to win a frame's exclusive-access flag.
const BUSY_BACKOFF: Duration = Duration::from_millis(2);

struct FrameState {
    raster: Option<RawFrame>,
    image: Option<Arc<OutputImage>>,
}

/// One decoded video frame, addressable by presentation time.
///
/// Handles are reference-counted (`Arc<VideoFrame>`); the frame queue and any
/// caller that received the handle from `read_frame` share ownership. The
/// underlying raster buffer is released by whichever access materializes the
/// image first, or when the last holder drops the handle.
pub struct VideoFrame {
    pos_ms: i64,
    pts: i64,
    dur: i64,
    hardware: AtomicBool,
    eof: AtomicBool,
    start_of_segment: AtomicBool,
    state: Mutex<FrameState>,
    converter: Arc<FrameConverter>,
    quit: Arc<AtomicBool>,
    pending_hw: Arc<AtomicI32>,
}

// The raster only moves under the state mutex.
unsafe impl Send for VideoFrame {}
unsafe impl Sync for VideoFrame {}

impl VideoFrame {
    pub(crate) fn new(
        raster: RawFrame,
        pos_ms: i64,
        pts: i64,
        dur: i64,
        hardware: bool,
        converter: Arc<FrameConverter>,
        quit: Arc<AtomicBool>,
        pending_hw: Arc<AtomicI32>,
    ) -> Self {
        if hardware {
            pending_hw.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            pos_ms,
            pts,
            dur,
            hardware: AtomicBool::new(hardware),
            eof: AtomicBool::new(false),
            start_of_segment: AtomicBool::new(false),
            state: Mutex::new(FrameState {
                raster: Some(raster),
                image: None,
            }),
            converter,
            quit,
            pending_hw,
        }
    }

    /// Presentation position in milliseconds
    pub fn pos_ms(&self) -> i64 {
        self.pos_ms
    }

    /// Presentation timestamp in stream ticks
    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// Frame duration in stream ticks
    pub fn dur(&self) -> i64 {
        self.dur
    }

    /// Whether the raster still lives in accelerator memory
    pub fn is_hardware(&self) -> bool {
        self.hardware.load(Ordering::Acquire)
    }

    /// Whether this is the last frame of the stream
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub(crate) fn mark_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    /// Whether this is the first frame decoded at the start of a segment
    pub fn is_start(&self) -> bool {
        self.start_of_segment.load(Ordering::Acquire)
    }

    pub(crate) fn mark_start(&self) {
        self.start_of_segment.store(true, Ordering::Release);
    }

    /// Whether the output image has already been materialized
    pub fn is_ready(&self) -> bool {
        self.state.lock().image.is_some()
    }

    /// Produce the converted output image for this frame.
    ///
    /// Converts once on first access, caches the result and drops the raster;
    /// every later call returns the cached image without touching the
    /// converter. Returns `Err(NotReady)` when shutdown raced the access.
    pub fn materialize(&self) -> Result<Arc<OutputImage>> {
        let mut state = self.acquire_state().ok_or(Error::NotReady)?;
        if let Some(image) = state.image.as_ref() {
            return Ok(image.clone());
        }

        let raster = state.raster.take().ok_or_else(|| {
            Error::ConvertFailed(format!("no raster data at pos {}", self.pos_ms))
        })?;
        let result = self.converter.convert(&raster, self.pos_ms);
        drop(raster);
        self.release_hw();

        match result {
            Ok(image) => {
                let image = Arc::new(image);
                state.image = Some(image.clone());
                Ok(image)
            }
            Err(e) => {
                log::error!(
                    "Frame conversion FAILED at pos {}({}): {e}",
                    self.pos_ms,
                    self.pts
                );
                Err(e)
            }
        }
    }

    /// Move a hardware-resident raster into host memory.
    ///
    /// Returns `Ok(true)` on migration, `Ok(false)` when there was nothing to
    /// migrate (already host-resident, already materialized, or shutdown).
    /// On transfer failure the raster is discarded and the error returned so
    /// the caller can drop the frame instead of serving corrupted data.
    pub(crate) fn migrate_to_host(&self) -> Result<bool> {
        let mut state = match self.acquire_state() {
            Some(s) => s,
            None => return Ok(false),
        };
        if !self.is_hardware() {
            return Ok(false);
        }
        let Some(raster) = state.raster.as_ref() else {
            self.release_hw();
            return Ok(false);
        };

        match decode::transfer_to_host(raster) {
            Ok(sw_frame) => {
                state.raster = Some(sw_frame);
                self.release_hw();
                Ok(true)
            }
            Err(e) => {
                state.raster = None;
                self.release_hw();
                Err(e)
            }
        }
    }

    /// Win exclusive access to the frame's raster/image storage.
    ///
    /// Non-blocking critical-section discipline: the storage is only ever
    /// held for a bounded memory copy, so contenders spin with a short
    /// backoff instead of parking, and bail out on shutdown.
    fn acquire_state(&self) -> Option<MutexGuard<'_, FrameState>> {
        loop {
            if let Some(guard) = self.state.try_lock() {
                return Some(guard);
            }
            if self.quit.load(Ordering::Acquire) {
                return None;
            }
            std::thread::sleep(BUSY_BACKOFF);
        }
    }

    /// Drop this frame's claim on the hardware-frame budget, exactly once.
    fn release_hw(&self) {
        if self.hardware.swap(false, Ordering::AcqRel) {
            self.pending_hw.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        self.release_hw();
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pos_ms", &self.pos_ms)
            .field("pts", &self.pts)
            .field("dur", &self.dur)
            .field("hardware", &self.is_hardware())
            .field("eof", &self.is_eof())
            .field("start", &self.is_start())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::convert::OutputSpec;

    /// Frame with synthetic raster data (for queue/lookup tests)
    pub fn test_frame(pts: i64, dur: i64) -> Arc<VideoFrame> {
        let converter =
            Arc::new(FrameConverter::new(&OutputSpec::fixed(16, 16), 32, 32).unwrap());
        let raster =
            RawFrame::new(ffmpeg_next::format::Pixel::RGB24, 32, 32);
        Arc::new(VideoFrame::new(
            raster,
            pts, // tests use a 1:1 tick/ms scale
            pts,
            dur,
            false,
            converter,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicI32::new(0)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_frame;
    use super::*;
    use crate::convert::OutputSpec;

    #[test]
    fn test_materialize_is_idempotent() {
        let frame = test_frame(40, 40);
        let first = frame.materialize().unwrap();
        let second = frame.materialize().unwrap();
        // the second call must return the cached image, not re-convert
        assert!(Arc::ptr_eq(&first, &second));
        assert!(frame.is_ready());
    }

    #[test]
    fn test_flags() {
        let frame = test_frame(0, 40);
        assert!(!frame.is_eof());
        assert!(!frame.is_start());
        frame.mark_eof();
        frame.mark_start();
        assert!(frame.is_eof());
        assert!(frame.is_start());
    }

    #[test]
    fn test_hw_budget_released_on_drop() {
        let pending = Arc::new(AtomicI32::new(0));
        let converter =
            Arc::new(FrameConverter::new(&OutputSpec::fixed(16, 16), 32, 32).unwrap());
        let raster = RawFrame::new(ffmpeg_next::format::Pixel::RGB24, 32, 32);
        let frame = VideoFrame::new(
            raster,
            0,
            0,
            40,
            true,
            converter,
            Arc::new(AtomicBool::new(false)),
            pending.clone(),
        );
        assert_eq!(pending.load(Ordering::Acquire), 1);
        drop(frame);
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }
}
