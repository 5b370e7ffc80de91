//! Demux stage
//!
//! Keeps the packet queue populated within policy and executes seeks.
//! Forward playback reads while the queue is below capacity; backward
//! playback repeatedly seeks earlier and reads up to a moving limit so the
//! decode stage always has history to serve from.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::convert::{FrameConverter, OutputSpec};
use crate::decode::StreamDecoder;
use crate::error::Result;
use crate::queue::PacketEnvelope;
use crate::source::{MediaSource, PacketRead, StreamDescriptor};
use crate::timestamp::TickScale;

use super::context::Shared;

pub(crate) struct DemuxStage {
    pub shared: Arc<Shared>,
    pub source: MediaSource,
    pub stream: StreamDescriptor,
    pub scale: TickScale,
    pub out_spec: OutputSpec,
    pub prefer_hw: bool,
}

impl DemuxStage {
    /// Open the decoder and converter, then set the initial read position.
    ///
    /// Runs once on the demux thread so `start` returns without blocking on
    /// codec initialization. A recorded-but-unserved seek target survives
    /// here: the seek state stays pending so the first loop iteration
    /// executes it as a regular seek.
    fn prepare(&mut self) -> Result<()> {
        let params = self.source.stream_parameters(self.stream.index)?;
        let decoder = StreamDecoder::open(params, self.prefer_hw)?;
        let converter = Arc::new(FrameConverter::new(
            &self.out_spec,
            self.stream.width,
            self.stream.height,
        )?);

        *self.shared.decoder.lock() = Some(decoder);
        *self.shared.converter.lock() = Some(converter);

        let read_pts = {
            let seek = self.shared.seek.lock();
            if seek.updated {
                self.scale.to_ticks(seek.pos_ms)
            } else {
                self.stream.start_time
            }
        };
        self.shared
            .update_read_pos(read_pts, self.stream.frame_interval_pts);
        self.shared.prepared.store(true, Ordering::Release);
        Ok(())
    }

    pub fn run(mut self) {
        log::debug!("Enter demux stage");

        if !self.shared.prepared.load(Ordering::Acquire) {
            if let Err(e) = self.prepare() {
                log::error!("Pipeline prepare FAILED: {e}");
                self.shared.set_error(e.to_string());
                return;
            }
        }

        let shared = self.shared.clone();
        let interval = self.stream.frame_interval_pts.max(1);
        let start_time = self.stream.start_time;
        let end_pts = start_time + self.stream.duration_pts;
        let backstep = interval * shared.tuning.seek_backstep_intervals;

        let mut demux_eof = false;
        let mut need_seek = false;
        let mut need_flush_frames = false;
        let mut after_seek = false;
        let mut read_forward = shared.read_forward.load(Ordering::Acquire);
        let mut last_pkt_pts = i64::MIN;
        let mut min_pts_after_seek = i64::MAX;
        let mut backward_limit_pts = shared.read_pos();
        let mut seek_pts = i64::MIN;
        let mut pts_list: VecDeque<i64> = VecDeque::new();
        let mut need_pts_safe_check = true;
        let mut null_pkt_sent = false;
        let mut is_start_packet = true;

        while !shared.is_quit() {
            let mut idle = true;

            // react to a direction flip
            let now_forward = shared.read_forward.load(Ordering::Acquire);
            if read_forward != now_forward {
                read_forward = now_forward;
                log::debug!("Demux: direction change detected");
                shared.update_read_pos(shared.read_pos(), interval);
                need_seek = true;
                if read_forward {
                    seek_pts = shared.read_pos();
                } else {
                    let front =
                        shared.frames.trim_to_window(shared.window_low(), shared.window_high());
                    let read_pos = shared.read_pos();
                    backward_limit_pts = match front {
                        None => read_pos,
                        Some(front_pts) if front_pts > read_pos => read_pos,
                        Some(front_pts) => front_pts - 1,
                    };
                    seek_pts = backward_limit_pts;
                    log::trace!("Demux: backward read limit {backward_limit_pts}");
                }
            }

            // pop a pending seek request
            let mut seek_triggered = false;
            {
                let mut seek = shared.seek.lock();
                if seek.updated {
                    seek_triggered = true;
                    need_seek = true;
                    need_flush_frames = true;
                    seek_pts = self.scale.to_ticks(seek.pos_ms);
                    seek.updated = false;
                }
            }
            if seek_triggered {
                log::debug!("Demux: flush packet queue for seek");
                shared.packets.clear();
                if !read_forward {
                    backward_limit_pts = shared.window_high();
                    log::trace!("Demux: backward read limit {backward_limit_pts}");
                }
                need_pts_safe_check = true;
                pts_list.clear();
            }
            if need_seek {
                need_seek = false;
                log::debug!(
                    "Demux: seek to {}ms ({seek_pts})",
                    self.scale.to_millis(seek_pts)
                );
                if let Err(e) = self.source.seek(self.stream.index, seek_pts) {
                    // non-fatal: continue with best-effort position tracking
                    log::warn!("Container seek to {seek_pts} FAILED: {e}");
                }
                last_pkt_pts = i64::MIN;
                min_pts_after_seek = i64::MAX;
                demux_eof = false;
                after_seek = true;
                is_start_packet = true;
            }

            // decide whether to read another packet
            let mut do_read = if read_forward {
                !shared.packets.is_full()
            } else {
                last_pkt_pts < backward_limit_pts
            };
            // safety check: ensure enough packet timestamps past the read
            // position so decoder lookahead cannot stall right at it
            if need_pts_safe_check {
                let read_pos = shared.read_pos();
                pts_list.retain(|&p| p >= read_pos);
                let threshold = shared.tuning.min_packets_past_read_pos;
                let count = if pts_list.iter().any(|&p| p == read_pos) {
                    threshold
                } else {
                    pts_list.iter().filter(|&&p| p > read_pos).count()
                };
                if count < threshold {
                    do_read = true;
                } else if !read_forward {
                    // backward playback only needs the check once per seek
                    need_pts_safe_check = false;
                }
            }
            if demux_eof {
                do_read = false;
            }

            if !do_read {
                if min_pts_after_seek != i64::MAX
                    && seek_pts != i64::MIN
                    && min_pts_after_seek > seek_pts
                    && min_pts_after_seek > shared.read_pos()
                {
                    // the seek landed past the requested position (keyframe
                    // granularity); re-issue an earlier seek
                    if seek_pts <= start_time {
                        log::warn!(
                            "min pts after seek ({min_pts_after_seek}) > seek target \
                             ({seek_pts}), but already at stream start"
                        );
                    } else {
                        let read_pos = shared.read_pos();
                        let mut corrected = if read_pos < seek_pts {
                            read_pos
                        } else {
                            seek_pts - backstep
                        };
                        corrected = corrected.max(start_time);
                        log::warn!(
                            "min pts after seek ({min_pts_after_seek}) > seek target \
                             ({seek_pts}), retrying at {corrected}"
                        );
                        let mut seek = shared.seek.lock();
                        seek.pos_ms = self.scale.to_millis(corrected);
                        seek.updated = true;
                        shared.in_seeking.store(true, Ordering::Release);
                        idle = false;
                    }
                } else if !read_forward {
                    // pre-read history below the read position
                    if min_pts_after_seek >= shared.window_low()
                        && min_pts_after_seek > start_time
                    {
                        if seek_pts <= start_time {
                            log::warn!(
                                "backward pre-read cannot extend: already at stream start"
                            );
                        } else {
                            backward_limit_pts = min_pts_after_seek - 1;
                            if backward_limit_pts > shared.read_pos() {
                                backward_limit_pts = shared.read_pos();
                                need_pts_safe_check = true;
                            }
                            seek_pts = if backward_limit_pts != seek_pts {
                                backward_limit_pts
                            } else {
                                backward_limit_pts - backstep
                            };
                            seek_pts = seek_pts.max(start_time);
                            need_seek = true;
                            idle = false;
                            log::trace!(
                                "Demux: backward window extend, limit={backward_limit_pts}, \
                                 next seek={seek_pts}"
                            );
                        }
                    } else if !null_pkt_sent {
                        // flush marker so the decoder surfaces its buffered
                        // frames before the window-low bound
                        shared.packets.push(PacketEnvelope {
                            packet: None,
                            after_seek: false,
                            flush_frames: false,
                            start_packet: false,
                        });
                        null_pkt_sent = true;
                    }
                }
            }

            if do_read {
                match self.source.read_packet() {
                    Ok(PacketRead::Packet {
                        stream_index,
                        packet,
                    }) => {
                        if stream_index == self.stream.index {
                            let pkt_pts = packet.pts();
                            log::trace!("Demux: got packet pts={pkt_pts:?}");
                            if let Some(pts) = pkt_pts {
                                if need_pts_safe_check {
                                    pts_list.push_back(pts);
                                }
                                if pts >= start_time && pts < min_pts_after_seek {
                                    min_pts_after_seek = pts;
                                }
                                if pts >= start_time && pts <= end_pts {
                                    last_pkt_pts = pts;
                                }
                            }
                            null_pkt_sent = false;
                            shared.packets.push(PacketEnvelope {
                                packet: Some(packet),
                                after_seek,
                                flush_frames: need_flush_frames,
                                start_packet: is_start_packet,
                            });
                            is_start_packet = false;
                            after_seek = false;
                            need_flush_frames = false;
                        }
                        idle = false;
                    }
                    Ok(PacketRead::Eof) => {
                        demux_eof = true;
                        if !null_pkt_sent {
                            shared.packets.push(PacketEnvelope {
                                packet: None,
                                after_seek,
                                flush_frames: need_flush_frames,
                                start_packet: false,
                            });
                            after_seek = false;
                            need_flush_frames = false;
                            null_pkt_sent = true;
                            last_pkt_pts = i64::MAX;
                        }
                    }
                    Err(e) => {
                        log::warn!("Packet read FAILED: {e}");
                    }
                }
            }

            if idle {
                std::thread::sleep(shared.tuning.stage_poll);
            }
        }
        log::debug!("Leave demux stage");
    }
}
