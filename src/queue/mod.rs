//! Packet and frame queues shared between the pipeline stages
//!
//! Each queue sits behind its own lock so the demux and convert stages never
//! contend with the decode stage on the same lock. Locks are held only for
//! the enqueue/dequeue/scan critical sections, never across a call into the
//! container or decoder.

use std::collections::VecDeque;
use std::sync::Arc;

use ffmpeg_next::Packet;
use parking_lot::Mutex;

use crate::frame::VideoFrame;

/// One compressed packet travelling from the demux to the decode stage.
///
/// `packet == None` is the flush marker that drains the decoder's buffered
/// frames. Created by demux, consumed and destroyed by decode.
pub struct PacketEnvelope {
    pub packet: Option<Packet>,
    /// First packets after a container seek
    pub after_seek: bool,
    /// The frame queue must be cleared when this packet reaches the decoder
    pub flush_frames: bool,
    /// Very first packet of a (re)started segment
    pub start_packet: bool,
}

// Envelopes are immutable after construction; only the decode stage ever
// dereferences the packet.
unsafe impl Send for PacketEnvelope {}
unsafe impl Sync for PacketEnvelope {}

/// Bounded FIFO of compressed packets.
///
/// The capacity bound is the forward-playback backpressure: the demux stage
/// stops reading while the queue is full.
pub struct PacketQueue {
    inner: Mutex<VecDeque<Arc<PacketEnvelope>>>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, envelope: PacketEnvelope) {
        self.inner.lock().push_back(Arc::new(envelope));
    }

    /// Peek the head without removing it; decode pops only after the decoder
    /// accepted or rejected the packet.
    pub fn head(&self) -> Option<Arc<PacketEnvelope>> {
        self.inner.lock().front().cloned()
    }

    /// Pop `envelope` if it is still the head (a seek may have cleared the
    /// queue in between). Returns whether a pop happened.
    pub fn pop_if_head(&self, envelope: &Arc<PacketEnvelope>) -> bool {
        let mut queue = self.inner.lock();
        match queue.front() {
            Some(head) if Arc::ptr_eq(head, envelope) => {
                queue.pop_front();
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

/// Timestamp-ordered buffer of decoded frames.
///
/// Order is maintained by insertion position, never by post-hoc sorting, and
/// no two entries share a timestamp. There is no hard capacity; eviction is
/// window-driven and performed by the convert stage.
pub struct FrameQueue {
    inner: Mutex<Vec<Arc<VideoFrame>>>,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Insert keeping timestamp order. An exact-timestamp duplicate is
    /// discarded (the first decoded copy wins); returns whether the frame
    /// was actually inserted.
    pub fn insert(&self, frame: Arc<VideoFrame>) -> bool {
        let mut queue = self.inner.lock();
        let pts = frame.pts();
        // scan from the back: new frames usually belong near the tail
        let idx = queue
            .iter()
            .rposition(|f| f.pts() < pts)
            .map(|i| i + 1)
            .unwrap_or(0);
        if queue.get(idx).is_some_and(|f| f.pts() == pts) {
            return false;
        }
        queue.insert(idx, frame);
        true
    }

    /// Timestamp of the newest buffered frame
    pub fn tail_pts(&self) -> Option<i64> {
        self.inner.lock().last().map(|f| f.pts())
    }

    /// Timestamp of the oldest buffered frame
    pub fn front_pts(&self) -> Option<i64> {
        self.inner.lock().first().map(|f| f.pts())
    }

    /// Flag the stream tail after the decoder drained to EOF.
    ///
    /// The newest buffered frame is flagged; if eviction momentarily emptied
    /// the queue, the last produced frame is flagged and re-inserted.
    pub fn flag_eof(&self, last_produced: Option<&Arc<VideoFrame>>) {
        let mut queue = self.inner.lock();
        if let Some(tail) = queue.last() {
            tail.mark_eof();
        } else if let Some(prev) = last_produced {
            prev.mark_eof();
            queue.push(prev.clone());
        }
    }

    /// Find the frame valid at `target` ticks.
    ///
    /// Picks the newest frame at or before the target when a later frame
    /// already bounds it; at the head of the queue only the unique
    /// start-of-segment frame may serve targets before its timestamp; at the
    /// tail, the target must fall inside the frame's duration unless the
    /// frame is flagged end-of-stream.
    pub fn lookup(&self, target: i64) -> Option<Arc<VideoFrame>> {
        let queue = self.inner.lock();
        match queue.iter().position(|f| f.pts() > target) {
            Some(0) => {
                let head = &queue[0];
                head.is_start().then(|| head.clone())
            }
            Some(idx) => Some(queue[idx - 1].clone()),
            None => {
                let tail = queue.last()?;
                let within = target >= tail.pts() && target < tail.pts() + tail.dur();
                (within || tail.is_eof()).then(|| tail.clone())
            }
        }
    }

    /// Evict frames outside the cache window and pick the migration
    /// candidate.
    ///
    /// A frame goes when its `[pts, pts+dur)` interval lies entirely below
    /// `low` (unless it is the sole remaining end-of-stream frame during
    /// forward playback), or when its pts exceeds `high` and it is not the
    /// first frame past the bound (that one is retained as the lookahead
    /// anchor). Returns the first surviving hardware-resident frame, if any.
    pub fn sweep(&self, low: i64, high: i64, forward: bool) -> Option<Arc<VideoFrame>> {
        let mut queue = self.inner.lock();
        let mut candidate = None;
        let mut anchor_seen = false;
        let mut idx = 0;
        while idx < queue.len() {
            let frame = &queue[idx];
            let mut remove = false;
            if frame.pts() + frame.dur() < low {
                if !(forward && frame.is_eof() && queue.len() == 1) {
                    remove = true;
                }
            } else if frame.pts() > high {
                if anchor_seen {
                    remove = true;
                } else {
                    anchor_seen = true;
                }
            }
            if remove {
                log::trace!(
                    "Evict frame pts={} pos={}",
                    frame.pts(),
                    frame.pos_ms()
                );
                queue.remove(idx);
                continue;
            }
            if candidate.is_none() && frame.is_hardware() {
                candidate = Some(frame.clone());
            }
            idx += 1;
        }
        candidate
    }

    /// Direction-change scan: drop frames outside the window (keeping the
    /// single lookahead anchor above it) and report the earliest retained
    /// timestamp.
    pub fn trim_to_window(&self, low: i64, high: i64) -> Option<i64> {
        let mut queue = self.inner.lock();
        let mut anchor_seen = false;
        queue.retain(|f| {
            if f.pts() < low {
                false
            } else if f.pts() > high {
                let keep = !anchor_seen;
                anchor_seen = true;
                keep
            } else {
                true
            }
        });
        queue.first().map(|f| f.pts())
    }

    /// Remove a specific frame (used when hardware migration fails).
    pub fn remove(&self, frame: &Arc<VideoFrame>) {
        self.inner.lock().retain(|f| !Arc::ptr_eq(f, frame));
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffered timestamps in queue order
    pub fn timestamps(&self) -> Vec<i64> {
        self.inner.lock().iter().map(|f| f.pts()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testutil::test_frame;

    #[test]
    fn test_packet_queue_backpressure() {
        let queue = PacketQueue::new(2);
        assert!(!queue.is_full());
        queue.push(PacketEnvelope {
            packet: None,
            after_seek: false,
            flush_frames: false,
            start_packet: false,
        });
        queue.push(PacketEnvelope {
            packet: None,
            after_seek: true,
            flush_frames: true,
            start_packet: false,
        });
        assert!(queue.is_full());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_packet_queue_pop_if_head() {
        let queue = PacketQueue::new(4);
        queue.push(PacketEnvelope {
            packet: None,
            after_seek: false,
            flush_frames: false,
            start_packet: true,
        });
        let head = queue.head().unwrap();
        assert!(head.start_packet);
        // a seek clears the queue while decode still holds the handle
        queue.clear();
        assert!(!queue.pop_if_head(&head));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_frame_queue_keeps_timestamp_order() {
        let queue = FrameQueue::new();
        for pts in [40, 0, 120, 80] {
            assert!(queue.insert(test_frame(pts, 40)));
        }
        assert_eq!(queue.timestamps(), vec![0, 40, 80, 120]);
    }

    #[test]
    fn test_frame_queue_discards_duplicate_pts() {
        let queue = FrameQueue::new();
        assert!(queue.insert(test_frame(40, 40)));
        assert!(!queue.insert(test_frame(40, 40)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_lookup_interior_and_head() {
        let queue = FrameQueue::new();
        for pts in [100, 140, 180] {
            queue.insert(test_frame(pts, 40));
        }
        // interior: newest frame at or before the target
        assert_eq!(queue.lookup(150).unwrap().pts(), 140);
        assert_eq!(queue.lookup(140).unwrap().pts(), 140);
        // before the head: only a start-of-segment head may serve
        assert!(queue.lookup(50).is_none());
        let head = queue.lookup(100).unwrap();
        assert_eq!(head.pts(), 100);
        head.mark_start();
        assert_eq!(queue.lookup(50).unwrap().pts(), 100);
    }

    #[test]
    fn test_lookup_tail_duration_and_eof() {
        let queue = FrameQueue::new();
        queue.insert(test_frame(100, 40));
        // inside the tail frame's duration
        assert_eq!(queue.lookup(120).unwrap().pts(), 100);
        // past the duration: only an EOF-flagged tail serves
        assert!(queue.lookup(200).is_none());
        queue.lookup(100).unwrap().mark_eof();
        assert_eq!(queue.lookup(200).unwrap().pts(), 100);
    }

    #[test]
    fn test_sweep_window_eviction() {
        let queue = FrameQueue::new();
        for pts in [0, 40, 80, 120, 160, 200] {
            queue.insert(test_frame(pts, 40));
        }
        // window [81, 130]: the 0 and 40 frames end at or below the low
        // bound, 160 is the retained lookahead anchor, 200 goes
        queue.sweep(81, 130, true);
        assert_eq!(queue.timestamps(), vec![80, 120, 160]);
    }

    #[test]
    fn test_sweep_keeps_sole_eof_frame_forward() {
        let queue = FrameQueue::new();
        queue.insert(test_frame(100, 40));
        queue.lookup(100).unwrap().mark_eof();
        queue.sweep(500, 700, true);
        assert_eq!(queue.len(), 1);
        // backward playback has no EOF concept
        queue.sweep(500, 700, false);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_trim_to_window_reports_earliest() {
        let queue = FrameQueue::new();
        for pts in [0, 40, 80, 120, 160] {
            queue.insert(test_frame(pts, 40));
        }
        let front = queue.trim_to_window(40, 100);
        assert_eq!(front, Some(40));
        // 120 survives as the anchor, 160 does not
        assert_eq!(queue.timestamps(), vec![40, 80, 120]);
    }

    #[test]
    fn test_flag_eof_reinserts_last_produced() {
        let queue = FrameQueue::new();
        let last = test_frame(100, 40);
        queue.flag_eof(Some(&last));
        assert!(last.is_eof());
        assert_eq!(queue.len(), 1);
    }
}
