//! Decode stage
//!
//! Feeds packets to the decoder, drains decoded frames into the frame queue
//! in timestamp order, and handles the decoder-state resets that seeks and
//! end-of-stream require. The head packet is only popped once the decoder
//! accepted or rejected it, so backpressure falls through to the demux stage
//! without retries.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::decode::{self, ReceiveOutcome, SendOutcome, StreamDecoder};
use crate::frame::VideoFrame;
use crate::source::StreamDescriptor;
use crate::timestamp::TickScale;

use super::context::Shared;

pub(crate) struct DecodeStage {
    pub shared: Arc<Shared>,
    pub stream: StreamDescriptor,
    pub scale: TickScale,
}

impl DecodeStage {
    pub fn run(self) {
        log::debug!("Enter decode stage");
        let shared = &self.shared;

        while !shared.prepared.load(Ordering::Acquire) && !shared.is_quit() {
            std::thread::sleep(shared.tuning.stage_poll);
        }
        if shared.is_quit() {
            log::debug!("Leave decode stage (shutdown before prepare)");
            return;
        }

        let mut decoder = match shared.decoder.lock().take() {
            Some(d) => d,
            None => {
                log::error!("Decode stage started without a decoder");
                return;
            }
        };
        let converter = match shared.converter.lock().clone() {
            Some(c) => c,
            None => {
                log::error!("Decode stage started without a converter");
                return;
            }
        };

        let start_time = self.stream.start_time;
        let end_pts = start_time + self.stream.duration_pts;

        let mut decoder_eof = false;
        let mut null_pkt_sent = false;
        let mut is_start_frame = false;
        let mut prev_frame: Option<Arc<VideoFrame>> = None;

        while !shared.is_quit() {
            let mut idle = true;

            // inspect the head packet; resets happen before any send
            let head = shared.packets.head();
            if let Some(env) = head.as_ref() {
                if env.after_seek {
                    if env.flush_frames || decoder_eof {
                        if env.packet.is_some() {
                            log::debug!("Decode: decoder reset after seek");
                            decoder.flush();
                            decoder_eof = false;
                            null_pkt_sent = false;
                        } else {
                            decoder_eof = true;
                        }
                        if env.flush_frames {
                            log::debug!("Decode: flush frame queue");
                            prev_frame = None;
                            is_start_frame = false;
                            shared.frames.clear();
                        }
                        shared.in_seeking.store(false, Ordering::Release);
                    } else if !null_pkt_sent {
                        // re-synchronize without flushing: force a drain
                        log::trace!("Decode: send flush marker");
                        let _ = decoder.send(None);
                        null_pkt_sent = true;
                    }
                } else if decoder_eof && env.packet.is_some() {
                    log::debug!("Decode: decoder reset after EOF");
                    decoder.flush();
                    decoder_eof = false;
                    null_pkt_sent = false;
                }
            }

            // drain one decoded frame when the window wants more
            let tail_pts = shared.frames.tail_pts().unwrap_or(i64::MIN);
            let do_decode = !decoder_eof
                && shared.pending_hw.load(Ordering::Acquire)
                    <= shared.tuning.max_pending_hw_frames
                && (tail_pts < shared.window_high()
                    || !shared.read_forward.load(Ordering::Acquire));
            if do_decode {
                match decoder.receive() {
                    Ok(ReceiveOutcome::Frame(frame)) => {
                        idle = false;
                        match frame.pts() {
                            Some(pts) if pts >= start_time && pts <= end_pts => {
                                let is_hw = decode::is_hardware_frame(&frame);
                                let dur = decode::frame_duration(&frame);
                                let pos_ms = self.scale.to_millis(pts);
                                log::trace!(
                                    "Decode: got frame pts={pts} pos={pos_ms}ms hw={is_hw}"
                                );
                                let handle = Arc::new(VideoFrame::new(
                                    frame,
                                    pos_ms,
                                    pts,
                                    dur,
                                    is_hw,
                                    converter.clone(),
                                    shared.quit.clone(),
                                    shared.pending_hw.clone(),
                                ));
                                if is_start_frame {
                                    handle.mark_start();
                                    is_start_frame = false;
                                }
                                if shared.read_forward.load(Ordering::Acquire) {
                                    if let Some(prev) = prev_frame.as_ref() {
                                        if prev.pts() >= pts {
                                            log::warn!(
                                                "Video decoder output is NON-MONOTONIC: \
                                                 prev pts={} >= pts={pts}",
                                                prev.pts()
                                            );
                                        }
                                    }
                                }
                                if !shared.frames.insert(handle.clone()) {
                                    log::debug!(
                                        "Discard duplicated frame @{pos_ms}ms ({pts})"
                                    );
                                }
                                prev_frame = Some(handle);
                            }
                            other => {
                                // corrupt timestamp: drop rather than serve
                                log::warn!(
                                    "Got BAD video frame, pts={other:?} outside stream \
                                     range [{start_time}, {end_pts}]. DISCARD."
                                );
                            }
                        }
                    }
                    Ok(ReceiveOutcome::Eof) => {
                        log::debug!("Decode: decoder EOF");
                        decoder_eof = true;
                        shared.frames.flag_eof(prev_frame.as_ref());
                    }
                    Ok(ReceiveOutcome::Again) => {}
                    Err(e) => {
                        log::warn!("Frame receive FAILED: {e}");
                    }
                }
            }

            // feed the decoder only after this iteration's drain
            if let Some(env) = head {
                if !null_pkt_sent {
                    if env.packet.is_none() {
                        null_pkt_sent = true;
                    }
                    let mut pop = false;
                    match decoder.send(env.packet.as_ref()) {
                        Ok(SendOutcome::Accepted) => {
                            log::trace!(
                                "Decode: sent packet pts={:?}",
                                env.packet.as_ref().and_then(|p| p.pts())
                            );
                            if env.start_packet {
                                is_start_frame = true;
                            }
                            pop = true;
                            idle = false;
                        }
                        Ok(SendOutcome::Again) => {}
                        Err(e) => {
                            log::warn!("Packet send FAILED: {e}");
                            pop = true;
                            idle = false;
                        }
                    }
                    if pop {
                        shared.packets.pop_if_head(&env);
                    }
                }
            }

            if idle {
                std::thread::sleep(shared.tuning.stage_poll);
            }
        }
        log::debug!("Leave decode stage");
    }
}
