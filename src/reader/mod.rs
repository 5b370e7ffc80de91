//! Reader facade
//!
//! Owns configuration and lifecycle, spawns the three stage threads and
//! serves `read_frame` lookups from the shared frame queue.
//!
//! Lifecycle: Closed -> Opened -> Configured -> Started <-> Suspended ->
//! Stopped (back to Configured) -> Closed. Every transition is gated by an
//! explicit precondition and serialized by a re-entrant API lock that is
//! never held across the worker loops.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutex};

use crate::convert::OutputSpec;
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::source::{MediaSource, StreamDescriptor};

mod context;
mod convert;
mod decode;
mod demux;

pub use context::ReaderTuning;

use context::{SeekState, Shared};
use convert::ConvertStage;
use decode::DecodeStage;
use demux::DemuxStage;

/// Result of a successful frame lookup
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub frame: Arc<VideoFrame>,
    /// Set when reading forward and the returned frame is the last of the
    /// stream
    pub eof: bool,
}

/// Pipelined, seekable video-frame reader.
///
/// Opens a media URL, decodes its best video stream on three worker threads
/// (demux, decode, convert) and answers "the frame valid at time T" queries
/// from a sliding timestamp-window cache, in either playback direction.
pub struct VideoReader {
    api_lock: ReentrantMutex<()>,
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    url: Mutex<Option<String>>,
    source_slot: Mutex<Option<MediaSource>>,
    stream: Mutex<Option<StreamDescriptor>>,
    out_spec: Mutex<Option<OutputSpec>>,

    opened: AtomicBool,
    configured: AtomicBool,
    started: AtomicBool,
    is_image: AtomicBool,
    prefer_hw: AtomicBool,
    duration_ms: AtomicI64,

    last_result: Mutex<Option<(i64, ReadResult)>>,
}

impl Default for VideoReader {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoReader {
    pub fn new() -> Self {
        Self::with_tuning(ReaderTuning::default())
    }

    /// Reader with non-default pipeline constants.
    pub fn with_tuning(tuning: ReaderTuning) -> Self {
        Self {
            api_lock: ReentrantMutex::new(()),
            shared: Arc::new(Shared::new(tuning)),
            threads: Mutex::new(Vec::new()),
            url: Mutex::new(None),
            source_slot: Mutex::new(None),
            stream: Mutex::new(None),
            out_spec: Mutex::new(None),
            opened: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            started: AtomicBool::new(false),
            is_image: AtomicBool::new(false),
            prefer_hw: AtomicBool::new(true),
            duration_ms: AtomicI64::new(0),
            last_result: Mutex::new(None),
        }
    }

    /// Open a media URL and select its best video stream.
    pub fn open(&self, url: &str) -> Result<()> {
        let _guard = self.api_lock.lock();
        if self.is_opened() {
            self.close();
        }
        let source = MediaSource::open(url).map_err(|e| self.fail(e))?;
        self.adopt_source(source)
    }

    /// Open from an already-probed media source.
    pub fn open_with_source(&self, source: MediaSource) -> Result<()> {
        let _guard = self.api_lock.lock();
        if self.is_opened() {
            self.close();
        }
        self.adopt_source(source)
    }

    fn adopt_source(&self, source: MediaSource) -> Result<()> {
        let stream = match source.best_video_stream() {
            Ok(s) => s,
            Err(e) => {
                self.close();
                return Err(self.fail(e));
            }
        };
        log::info!(
            "Opened '{}': video stream #{} {}x{} {:.3}fps, {}ms, codec {}",
            source.url(),
            stream.index,
            stream.width,
            stream.height,
            stream.frame_rate,
            stream.duration_ms,
            stream.codec_name
        );
        self.duration_ms.store(stream.duration_ms, Ordering::Release);
        self.is_image.store(stream.is_image, Ordering::Release);
        *self.url.lock() = Some(source.url().to_string());
        *self.stream.lock() = Some(stream);
        *self.source_slot.lock() = Some(source);
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    /// Fix the output format. Valid once opened and before start.
    pub fn configure(&self, spec: OutputSpec) -> Result<()> {
        let _guard = self.api_lock.lock();
        if !self.is_opened() {
            return Err(self.fail(Error::InvalidState("reader is not opened yet")));
        }
        if self.is_started() {
            return Err(self.fail(Error::InvalidState("reader is already started")));
        }
        spec.validate().map_err(|e| self.fail(e))?;
        *self.out_spec.lock() = Some(spec);
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    /// Spawn the pipeline. With `suspend` the reader enters the started
    /// state without holding decoder or container resources.
    pub fn start(&self, suspend: bool) -> Result<()> {
        let _guard = self.api_lock.lock();
        if !self.is_configured() {
            return Err(self.fail(Error::InvalidState("reader is not configured yet")));
        }
        if self.is_started() {
            return Ok(());
        }
        if suspend {
            self.release_video_resources();
        } else {
            self.start_threads()?;
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Tear down the pipeline and return to the configured state.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.api_lock.lock();
        if !self.is_configured() {
            return Err(self.fail(Error::InvalidState("reader is not configured yet")));
        }
        if !self.is_started() {
            return Ok(());
        }
        self.join_threads();
        self.shared.reset_run_state();
        *self.source_slot.lock() = None;
        *self.last_result.lock() = None;
        *self.shared.seek.lock() = SeekState::default();
        self.shared.read_forward.store(true, Ordering::Release);
        self.shared.update_read_pos(0, 1);
        self.shared.set_error("");
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    /// Release everything. Idempotent.
    pub fn close(&self) {
        // unblock any waiting read before taking the API lock
        self.shared.quit.store(true, Ordering::Release);
        let _guard = self.api_lock.lock();
        self.join_threads();
        self.shared.reset_run_state();
        *self.source_slot.lock() = None;
        *self.url.lock() = None;
        *self.stream.lock() = None;
        *self.out_spec.lock() = None;
        *self.last_result.lock() = None;
        *self.shared.seek.lock() = SeekState::default();
        self.shared.read_forward.store(true, Ordering::Release);
        self.shared.update_read_pos(0, 1);
        self.duration_ms.store(0, Ordering::Release);
        self.opened.store(false, Ordering::Release);
        self.configured.store(false, Ordering::Release);
        self.started.store(false, Ordering::Release);
        self.shared.set_error("");
    }

    /// Record a seek target. If the pipeline is not primed yet the target is
    /// kept and executed once priming completes.
    pub fn seek_to(&self, pos_ms: i64) -> Result<()> {
        if !self.is_configured() {
            return Err(self.fail(Error::InvalidState(
                "seek_to requires a configured reader",
            )));
        }
        let duration = self.duration_ms.load(Ordering::Acquire);
        if pos_ms < 0 || pos_ms > duration {
            return Err(self.fail(Error::InvalidArgument(format!(
                "seek position {pos_ms}ms outside [0, {duration}]"
            ))));
        }

        log::debug!("Seek requested to {pos_ms}ms");
        let mut seek = self.shared.seek.lock();
        seek.pos_ms = pos_ms;
        seek.updated = true;
        self.shared.in_seeking.store(true, Ordering::Release);
        if self.shared.prepared.load(Ordering::Acquire) {
            if let Some(stream) = self.stream.lock().as_ref() {
                let pts = stream.tick_scale().to_ticks(pos_ms);
                self.shared.update_read_pos(pts, stream.frame_interval_pts);
            }
        }
        Ok(())
    }

    /// Flip the playback direction. No-op when unchanged.
    pub fn set_direction(&self, forward: bool) -> Result<()> {
        if self.shared.read_forward.load(Ordering::Acquire) == forward {
            return Ok(());
        }
        let _guard = self.api_lock.lock();
        if !self.is_opened() {
            return Err(self.fail(Error::InvalidState("reader is not opened yet")));
        }
        self.shared.read_forward.store(forward, Ordering::Release);
        Ok(())
    }

    /// Tear down threads and release decoder/container resources while
    /// keeping the configuration and read position (e.g. backgrounded
    /// playback).
    pub fn suspend(&self) -> Result<()> {
        let _guard = self.api_lock.lock();
        if !self.is_started() {
            return Err(self.fail(Error::InvalidState("reader is not started yet")));
        }
        if self.shared.is_quit() || self.is_image.load(Ordering::Acquire) {
            return Ok(());
        }
        self.release_video_resources();
        Ok(())
    }

    /// Re-open the media at the last tracked position and restart the
    /// pipeline.
    pub fn wakeup(&self) -> Result<()> {
        let _guard = self.api_lock.lock();
        if !self.is_started() {
            return Err(self.fail(Error::InvalidState("reader is not started yet")));
        }
        if !self.shared.is_quit() || self.is_image.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = self
            .stream
            .lock()
            .clone()
            .ok_or_else(|| self.fail(Error::InvalidState("no stream selected")))?;

        let pos_ms = {
            let seek = self.shared.seek.lock();
            if seek.updated {
                seek.pos_ms
            } else {
                stream.tick_scale().to_millis(self.shared.read_pos())
            }
        };
        {
            let mut seek = self.shared.seek.lock();
            seek.pos_ms = pos_ms;
            seek.updated = true;
        }
        self.shared.in_seeking.store(true, Ordering::Release);
        self.start_threads()
    }

    /// Whether the reader is started but its resources are torn down
    pub fn is_suspended(&self) -> bool {
        self.is_started() && self.shared.is_quit()
    }

    /// Fetch the frame valid at `pos_ms`.
    ///
    /// Returns `Ok(None)` when `wait` is false and no frame is buffered yet
    /// (callers retry as the playhead settles); with `wait` the call polls
    /// until a frame is available or the reader shuts down. `eof` is
    /// signalled when reading forward and the returned frame is the last of
    /// the stream.
    pub fn read_frame(&self, pos_ms: i64, wait: bool) -> Result<Option<ReadResult>> {
        if !self.is_started() {
            return Err(self.fail(Error::InvalidState("reader is not started yet")));
        }
        let duration = self.duration_ms.load(Ordering::Acquire);
        let image = self.is_image.load(Ordering::Acquire);
        if pos_ms < 0 || (!image && pos_ms >= duration) {
            return Err(self.fail(Error::InvalidArgument(format!(
                "read position {pos_ms}ms outside [0, {duration})"
            ))));
        }
        if self.is_suspended() && !image {
            return Err(self.fail(Error::Suspended));
        }
        if !wait && !self.shared.prepared.load(Ordering::Acquire) {
            return Ok(None);
        }
        while !self.shared.is_quit()
            && !self.shared.prepared.load(Ordering::Acquire)
            && wait
        {
            std::thread::sleep(self.shared.tuning.read_poll);
        }
        if self.shared.is_quit() || !self.shared.prepared.load(Ordering::Acquire) {
            return Err(self.fail(Error::NotReady));
        }

        let pts = {
            let _guard = self.api_lock.lock();
            if let Some((prev_pos, prev)) = self.last_result.lock().as_ref() {
                if *prev_pos == pos_ms {
                    return Ok(Some(prev.clone()));
                }
            }
            let stream = self
                .stream
                .lock()
                .clone()
                .ok_or_else(|| self.fail(Error::NotReady))?;
            let pts = stream.tick_scale().to_ticks(pos_ms);
            let forward = self.shared.read_forward.load(Ordering::Acquire);
            let read_pos = self.shared.read_pos();
            // nudge the pipeline to pre-read further in the travel direction
            if (forward && pts > read_pos) || (!forward && pts < read_pos) {
                self.shared.update_read_pos(pts, stream.frame_interval_pts);
            }
            pts
        };
        log::trace!("To read frame pts={pts}, ts={pos_ms}ms");

        // poll without holding any lock while sleeping
        let wait_start = Instant::now();
        let mut last_warn = wait_start;
        let mut found = None;
        loop {
            if self.shared.is_quit() {
                break;
            }
            if !self.shared.in_seeking.load(Ordering::Acquire) {
                if let Some(frame) = self.shared.frames.lookup(pts) {
                    found = Some(frame);
                    break;
                }
            }
            if !wait {
                break;
            }
            std::thread::sleep(self.shared.tuning.read_poll);
            if last_warn.elapsed() >= self.shared.tuning.hang_warn {
                last_warn = Instant::now();
                log::warn!(
                    "read_frame({pos_ms}) hung up for {:.1}s",
                    wait_start.elapsed().as_secs_f64()
                );
            }
        }

        let frame = match found {
            Some(f) => f,
            None if !wait => return Ok(None),
            None => return Err(self.fail(Error::NotReady)),
        };

        let eof = self.shared.read_forward.load(Ordering::Acquire) && frame.is_eof();
        let result = ReadResult { frame, eof };
        *self.last_result.lock() = Some((pos_ms, result.clone()));
        Ok(Some(result))
    }

    /// Set the cache window frame counts, per playback direction.
    ///
    /// `*_ahead` frames are retained past the read position on the timestamp
    /// axis, `*_behind` frames before it.
    pub fn set_cache_window(
        &self,
        forward_ahead: u32,
        forward_behind: u32,
        backward_ahead: u32,
        backward_behind: u32,
    ) {
        let mut counts = self.shared.cache_counts.lock();
        counts.forward = (forward_behind, forward_ahead);
        counts.backward = (backward_behind, backward_ahead);
    }

    // --- unsupported on a video reader -----------------------------------

    /// Audio configuration is not implemented by a video reader; calling it
    /// is a programming error and fails immediately.
    pub fn config_audio_reader(&self, _channels: u32, _sample_rate: u32) -> Result<()> {
        Err(self.fail(Error::Unsupported(
            "config_audio_reader() on a video reader",
        )))
    }

    /// Audio reads are not implemented by a video reader.
    pub fn read_audio_samples(&self, _sample_count: u32, _wait: bool) -> Result<()> {
        Err(self.fail(Error::Unsupported(
            "read_audio_samples() on a video reader",
        )))
    }

    // --- accessors -------------------------------------------------------

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_direction_forward(&self) -> bool {
        self.shared.read_forward.load(Ordering::Acquire)
    }

    /// Selected video stream metadata
    pub fn stream(&self) -> Option<StreamDescriptor> {
        self.stream.lock().clone()
    }

    pub fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    /// Duration of the selected stream in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.duration_ms.load(Ordering::Acquire)
    }

    /// Current tracked read position in milliseconds
    pub fn read_pos_ms(&self) -> i64 {
        match self.stream.lock().as_ref() {
            Some(stream) => stream.tick_scale().to_millis(self.shared.read_pos()),
            None => 0,
        }
    }

    /// Output width; falls back to the stream width before configuration is
    /// resolved
    pub fn out_width(&self) -> u32 {
        if let Some(cvt) = self.shared.converter.lock().as_ref() {
            return cvt.out_width();
        }
        match *self.out_spec.lock() {
            Some(OutputSpec {
                size: crate::convert::OutputSize::Fixed(w, _),
                ..
            }) => w,
            _ => self.stream.lock().as_ref().map_or(0, |s| s.width),
        }
    }

    /// Output height; falls back to the stream height before configuration
    /// is resolved
    pub fn out_height(&self) -> u32 {
        if let Some(cvt) = self.shared.converter.lock().as_ref() {
            return cvt.out_height();
        }
        match *self.out_spec.lock() {
            Some(OutputSpec {
                size: crate::convert::OutputSize::Fixed(_, h),
                ..
            }) => h,
            _ => self.stream.lock().as_ref().map_or(0, |s| s.height),
        }
    }

    pub fn is_hw_accel_enabled(&self) -> bool {
        self.prefer_hw.load(Ordering::Acquire)
    }

    /// Toggle hardware decoding preference. Takes effect on the next
    /// pipeline start.
    pub fn enable_hw_accel(&self, enable: bool) {
        self.prefer_hw.store(enable, Ordering::Release);
    }

    /// Message of the most recent failure
    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    // --- internals -------------------------------------------------------

    fn fail(&self, e: Error) -> Error {
        self.shared.set_error(e.to_string());
        e
    }

    fn start_threads(&self) -> Result<()> {
        let source = match self.source_slot.lock().take() {
            Some(s) => s,
            None => {
                let url = self
                    .url
                    .lock()
                    .clone()
                    .ok_or_else(|| self.fail(Error::InvalidState("no media url to open")))?;
                MediaSource::open(&url).map_err(|e| self.fail(e))?
            }
        };
        let stream = self
            .stream
            .lock()
            .clone()
            .ok_or_else(|| self.fail(Error::InvalidState("no stream selected")))?;
        let out_spec = self
            .out_spec
            .lock()
            .ok_or_else(|| self.fail(Error::InvalidState("no output configuration")))?;

        let name = media_name(source.url());
        let scale = stream.tick_scale();
        self.shared.quit.store(false, Ordering::Release);

        let demux = DemuxStage {
            shared: self.shared.clone(),
            source,
            stream: stream.clone(),
            scale,
            out_spec,
            prefer_hw: self.prefer_hw.load(Ordering::Acquire),
        };
        let decode = DecodeStage {
            shared: self.shared.clone(),
            stream,
            scale,
        };
        let convert = ConvertStage {
            shared: self.shared.clone(),
        };

        let mut threads = self.threads.lock();
        threads.push(
            std::thread::Builder::new()
                .name(format!("vread-demux-{name}"))
                .spawn(move || demux.run())?,
        );
        threads.push(
            std::thread::Builder::new()
                .name(format!("vread-decode-{name}"))
                .spawn(move || decode.run())?,
        );
        threads.push(
            std::thread::Builder::new()
                .name(format!("vread-convert-{name}"))
                .spawn(move || convert.run())?,
        );
        Ok(())
    }

    /// Shutdown first, then join, then release handles: no worker ever
    /// touches a handle being torn down.
    fn join_threads(&self) {
        self.shared.quit.store(true, Ordering::Release);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn release_video_resources(&self) {
        self.join_threads();
        self.shared.reset_run_state();
        *self.source_slot.lock() = None;
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn media_name(url: &str) -> String {
    std::path::Path::new(url)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ColorFormat, OutputSpec};

    #[test]
    fn test_configure_requires_open() {
        let reader = VideoReader::new();
        let err = reader.configure(OutputSpec::fixed(640, 360)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(reader.last_error().contains("not opened"));
    }

    #[test]
    fn test_start_requires_configure() {
        let reader = VideoReader::new();
        assert!(matches!(
            reader.start(false),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_read_frame_requires_start() {
        let reader = VideoReader::new();
        assert!(matches!(
            reader.read_frame(0, false),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_seek_requires_configure() {
        let reader = VideoReader::new();
        assert!(matches!(reader.seek_to(1000), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_set_direction_noop_when_unchanged() {
        let reader = VideoReader::new();
        // forward -> forward needs no opened media
        assert!(reader.set_direction(true).is_ok());
        // an actual flip does
        assert!(matches!(
            reader.set_direction(false),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_audio_operations_fail_fast() {
        let reader = VideoReader::new();
        assert!(matches!(
            reader.config_audio_reader(2, 48000),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            reader.read_audio_samples(1024, false),
            Err(Error::Unsupported(_))
        ));
        assert!(reader.last_error().contains("video reader"));
    }

    #[test]
    fn test_open_garbage_fails() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 512]).unwrap();
        let reader = VideoReader::new();
        let path = file.path().to_string_lossy().to_string();
        assert!(reader.open(&path).is_err());
        assert!(!reader.is_opened());
        assert!(!reader.last_error().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let reader = VideoReader::new();
        reader.close();
        reader.close();
        assert!(!reader.is_opened());
    }

    #[test]
    fn test_hw_accel_toggle() {
        let reader = VideoReader::new();
        assert!(reader.is_hw_accel_enabled());
        reader.enable_hw_accel(false);
        assert!(!reader.is_hw_accel_enabled());
    }

    #[test]
    fn test_output_spec_builder() {
        let spec = OutputSpec::fixed(640, 360).with_color(ColorFormat::Bgra);
        let reader = VideoReader::new();
        // spec validation is part of configure, which still needs media
        assert!(reader.configure(spec).is_err());
    }
}
