//! State shared between the stage threads and the facade
//!
//! Everything that crosses a thread boundary lives here, each structure
//! behind its own lock or atomic. Nothing in this module is ambient: the
//! context is created by the facade and handed to each worker explicitly.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::convert::FrameConverter;
use crate::decode::StreamDecoder;
use crate::queue::{FrameQueue, PacketQueue};

/// Tuned pipeline constants, exposed as parameters rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct ReaderTuning {
    /// Packet-queue capacity used as forward-playback backpressure
    pub packet_queue_capacity: usize,
    /// Minimum packets with pts past the read position before the demux
    /// stage may stop reading (guards against decoder lookahead stalls)
    pub min_packets_past_read_pos: usize,
    /// Seek-correction backstep, in nominal frame intervals
    pub seek_backstep_intervals: i64,
    /// Ceiling on decoded frames still resident in accelerator memory
    pub max_pending_hw_frames: i32,
    /// Stage-thread idle sleep
    pub stage_poll: Duration,
    /// `read_frame` wait-poll sleep
    pub read_poll: Duration,
    /// Interval between hang warnings while a blocking read is unsatisfied
    pub hang_warn: Duration,
}

impl Default for ReaderTuning {
    fn default() -> Self {
        Self {
            packet_queue_capacity: 8,
            min_packets_past_read_pos: 2,
            seek_backstep_intervals: 4,
            max_pending_hw_frames: 2,
            stage_poll: Duration::from_millis(5),
            read_poll: Duration::from_millis(2),
            hang_warn: Duration::from_secs(3),
        }
    }
}

/// Look-ahead/look-behind frame counts, per playback direction, on the
/// timestamp axis (`behind` = frames kept at lower pts than the read
/// position, `ahead` = frames kept at higher pts).
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheCounts {
    pub forward: (u32, u32),  // (behind, ahead)
    pub backward: (u32, u32), // (behind, ahead)
}

impl Default for CacheCounts {
    fn default() -> Self {
        Self {
            forward: (1, 3),
            backward: (8, 1),
        }
    }
}

/// Pending seek request (position in output milliseconds).
#[derive(Debug, Default)]
pub(crate) struct SeekState {
    pub pos_ms: i64,
    pub updated: bool,
}

/// Cross-thread pipeline context.
pub(crate) struct Shared {
    /// Cooperative shutdown flag, checked by every loop and every sleep
    pub quit: Arc<AtomicBool>,
    /// Pipeline primed: decoder and converter are up, read position valid
    pub prepared: AtomicBool,
    /// A seek is in flight; frame lookups are suspended until the decode
    /// stage re-synchronizes
    pub in_seeking: AtomicBool,
    pub read_forward: AtomicBool,

    pub packets: PacketQueue,
    pub frames: FrameQueue,

    pub seek: Mutex<SeekState>,
    pub cache_counts: Mutex<CacheCounts>,

    // Cache window, derived from the read position. Updates happen under
    // `window_lock`; the stage loops read the atomics without it.
    window_lock: Mutex<()>,
    read_pos: AtomicI64,
    window_low: AtomicI64,
    window_high: AtomicI64,

    /// Decoded frames still resident in accelerator memory
    pub pending_hw: Arc<AtomicI32>,

    /// Decoder slot: populated by prepare, taken by the decode stage
    pub decoder: Mutex<Option<StreamDecoder>>,
    /// Converter slot: populated by prepare, shared with every frame handle
    pub converter: Mutex<Option<Arc<FrameConverter>>>,

    pub last_error: Mutex<String>,
    pub tuning: ReaderTuning,
}

impl Shared {
    pub fn new(tuning: ReaderTuning) -> Self {
        Self {
            quit: Arc::new(AtomicBool::new(true)),
            prepared: AtomicBool::new(false),
            in_seeking: AtomicBool::new(false),
            read_forward: AtomicBool::new(true),
            packets: PacketQueue::new(tuning.packet_queue_capacity),
            frames: FrameQueue::new(),
            seek: Mutex::new(SeekState::default()),
            cache_counts: Mutex::new(CacheCounts::default()),
            window_lock: Mutex::new(()),
            read_pos: AtomicI64::new(0),
            window_low: AtomicI64::new(0),
            window_high: AtomicI64::new(0),
            pending_hw: Arc::new(AtomicI32::new(0)),
            decoder: Mutex::new(None),
            converter: Mutex::new(None),
            last_error: Mutex::new(String::new()),
            tuning,
        }
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn read_pos(&self) -> i64 {
        self.read_pos.load(Ordering::Acquire)
    }

    pub fn window_low(&self) -> i64 {
        self.window_low.load(Ordering::Acquire)
    }

    pub fn window_high(&self) -> i64 {
        self.window_high.load(Ordering::Acquire)
    }

    /// Move the read position and derive the cache window from it.
    ///
    /// The window spans `look-behind` frames below and `look-ahead` frames
    /// above the position, widened by one tick on each side when the frame
    /// interval exceeds one tick (so boundary frames stay inside).
    pub fn update_read_pos(&self, read_pts: i64, frame_interval_pts: i64) {
        let _guard = self.window_lock.lock();
        let (behind, ahead) = {
            let counts = self.cache_counts.lock();
            if self.read_forward.load(Ordering::Acquire) {
                counts.forward
            } else {
                counts.backward
            }
        };
        let mut low = read_pts - behind as i64 * frame_interval_pts;
        let mut high = read_pts + ahead as i64 * frame_interval_pts;
        if frame_interval_pts > 1 {
            low -= 1;
            high += 1;
        }
        self.read_pos.store(read_pts, Ordering::Release);
        self.window_low.store(low, Ordering::Release);
        self.window_high.store(high, Ordering::Release);
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = message.into();
    }

    /// Reset every per-run field; called after the stage threads joined.
    pub fn reset_run_state(&self) {
        self.packets.clear();
        self.frames.clear();
        *self.decoder.lock() = None;
        *self.converter.lock() = None;
        self.prepared.store(false, Ordering::Release);
        self.in_seeking.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_from_read_pos_forward() {
        let shared = Shared::new(ReaderTuning::default());
        shared.update_read_pos(3600, 3600);
        // forward defaults: 1 behind, 3 ahead, widened by one tick
        assert_eq!(shared.read_pos(), 3600);
        assert_eq!(shared.window_low(), -1);
        assert_eq!(shared.window_high(), 3600 + 3 * 3600 + 1);
    }

    #[test]
    fn test_window_from_read_pos_backward() {
        let shared = Shared::new(ReaderTuning::default());
        shared.read_forward.store(false, Ordering::Release);
        shared.update_read_pos(100_000, 3600);
        // backward defaults: 8 behind, 1 ahead
        assert_eq!(shared.window_low(), 100_000 - 8 * 3600 - 1);
        assert_eq!(shared.window_high(), 100_000 + 3600 + 1);
    }

    #[test]
    fn test_no_widening_for_single_tick_interval() {
        let shared = Shared::new(ReaderTuning::default());
        shared.update_read_pos(100, 1);
        assert_eq!(shared.window_low(), 99);
        assert_eq!(shared.window_high(), 103);
    }
}
