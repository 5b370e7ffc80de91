//! Video decoder wrapper
//!
//! Packet-in/frame-out decoding with explicit flush-on-discontinuity,
//! hardware-device setup with silent software fallback, and hardware-to-host
//! frame transfer.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::util::frame::video::Video as RawFrame;

use ffmpeg_sys_next::{
    AVBufferRef, AVCodecContext, AVCodecHWConfig, AVHWDeviceType,
    AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX,
};

use crate::error::{Error, Result};

/// Outcome of sending a packet to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Packet consumed; it must not be resent
    Accepted,
    /// Decoder is full; retry after draining frames
    Again,
}

/// Outcome of draining one frame from the decoder
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A decoded frame, pts already replaced by the best-effort estimate
    Frame(RawFrame),
    /// Decoder needs more input
    Again,
    /// Decoder fully drained after an end-of-stream packet
    Eof,
}

/// Open decoder for one video stream
pub struct StreamDecoder {
    decoder: ffmpeg::decoder::Video,
    hw_active: bool,
}

// The decoder context is owned by exactly one stage thread at a time.
unsafe impl Send for StreamDecoder {}

impl StreamDecoder {
    /// Open a decoder for the given stream parameters.
    ///
    /// When `prefer_hw` is set, a hardware device context is attached if the
    /// codec advertises one; on any failure the decoder silently falls back
    /// to software.
    pub fn open(params: ffmpeg::codec::Parameters, prefer_hw: bool) -> Result<Self> {
        let codec_id = params.id();
        let codec = ffmpeg::decoder::find(codec_id)
            .ok_or_else(|| Error::DecodeFailed(format!("no decoder for codec {codec_id:?}")))?;
        let mut ctx = CodecContext::new_with_codec(codec);
        ctx.set_parameters(params)
            .map_err(|e| Error::DecodeFailed(format!("codec parameters: {e}")))?;

        // 0 lets FFmpeg pick the thread count
        unsafe {
            (*ctx.as_mut_ptr()).thread_count = 0;
        }

        let mut hw_active = false;
        if prefer_hw {
            if let Some(device_type) = find_hw_device_for_codec(&ctx) {
                match create_hw_device_context(device_type) {
                    Ok(hw_device_ctx) => {
                        unsafe {
                            let ctx_ptr = ctx.as_mut_ptr() as *mut AVCodecContext;
                            (*ctx_ptr).hw_device_ctx = ffmpeg_sys_next::av_buffer_ref(hw_device_ctx);
                            let mut hw_ref = hw_device_ctx;
                            ffmpeg_sys_next::av_buffer_unref(&mut hw_ref);
                        }
                        hw_active = true;
                    }
                    Err(e) => {
                        log::warn!("Hardware device setup failed, using software: {e}");
                    }
                }
            }
        }

        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| Error::DecodeFailed(format!("open video decoder: {e}")))?;

        log::info!(
            "Opened video decoder '{}' ({})",
            codec.name(),
            if hw_active { "HW" } else { "SW" }
        );

        Ok(Self { decoder, hw_active })
    }

    /// Whether a hardware device context is attached
    pub fn is_hw_active(&self) -> bool {
        self.hw_active
    }

    /// Send one packet, or `None` to signal end of stream and start draining.
    pub fn send(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<SendOutcome> {
        let res = match packet {
            Some(pkt) => self.decoder.send_packet(pkt),
            None => self.decoder.send_eof(),
        };
        match res {
            Ok(()) => Ok(SendOutcome::Accepted),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(SendOutcome::Again)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain one decoded frame if available.
    pub fn receive(&mut self) -> Result<ReceiveOutcome> {
        let mut frame = RawFrame::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                // prefer the decoder's best-effort estimate over the raw pts
                let best_effort = unsafe { (*frame.as_ptr()).best_effort_timestamp };
                if best_effort != ffmpeg_sys_next::AV_NOPTS_VALUE {
                    frame.set_pts(Some(best_effort));
                }
                Ok(ReceiveOutcome::Frame(frame))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(ReceiveOutcome::Again)
            }
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::Eof),
            Err(e) => Err(e.into()),
        }
    }

    /// Discard all decoder-internal state after a discontinuity.
    pub fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// Duration of a decoded frame in stream ticks
pub fn frame_duration(frame: &RawFrame) -> i64 {
    unsafe { (*frame.as_ptr()).duration }
}

/// Whether the frame's pixel data lives in accelerator memory
pub fn is_hardware_frame(frame: &RawFrame) -> bool {
    use ffmpeg::format::Pixel;
    matches!(
        frame.format(),
        Pixel::VIDEOTOOLBOX
            | Pixel::CUDA
            | Pixel::VAAPI
            | Pixel::DXVA2_VLD
            | Pixel::D3D11
            | Pixel::QSV
    )
}

/// Transfer a hardware frame to system memory as a raw format-neutral copy.
///
/// Timing fields are carried over; everything else comes from the transfer.
pub fn transfer_to_host(hw_frame: &RawFrame) -> Result<RawFrame> {
    let mut sw_frame = RawFrame::empty();

    let ret = unsafe {
        ffmpeg_sys_next::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0)
    };
    if ret < 0 {
        return Err(Error::DecodeFailed(format!(
            "hardware frame transfer failed (ret={ret})"
        )));
    }

    unsafe {
        let src = hw_frame.as_ptr();
        let dst = sw_frame.as_mut_ptr();
        (*dst).pts = (*src).pts;
        (*dst).pkt_dts = (*src).pkt_dts;
        (*dst).duration = (*src).duration;
        (*dst).best_effort_timestamp = (*src).best_effort_timestamp;
    }
    Ok(sw_frame)
}

/// First hardware device type the codec supports via a device context
fn find_hw_device_for_codec(ctx: &CodecContext) -> Option<AVHWDeviceType> {
    let codec_ptr = unsafe { (*ctx.as_ptr()).codec };
    if codec_ptr.is_null() {
        return None;
    }

    let mut index: i32 = 0;
    loop {
        let config: *const AVCodecHWConfig =
            unsafe { ffmpeg_sys_next::avcodec_get_hw_config(codec_ptr, index) };
        if config.is_null() {
            return None;
        }

        let methods = unsafe { (*config).methods };
        if methods & (AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32) != 0 {
            let device_type = unsafe { (*config).device_type };
            if device_type != AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
                return Some(device_type);
            }
        }
        index += 1;
    }
}

/// Create an FFmpeg hardware device context.
///
/// Returns a raw `AVBufferRef*` the caller must release with `av_buffer_unref`.
fn create_hw_device_context(device_type: AVHWDeviceType) -> Result<*mut AVBufferRef> {
    let mut hw_device_ctx: *mut AVBufferRef = std::ptr::null_mut();

    let ret = unsafe {
        ffmpeg_sys_next::av_hwdevice_ctx_create(
            &mut hw_device_ctx,
            device_type,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        )
    };
    if ret < 0 {
        Err(Error::FFmpeg {
            code: ret,
            message: format!("av_hwdevice_ctx_create({device_type:?})"),
        })
    } else {
        Ok(hw_device_ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_frame_is_not_hardware() {
        let frame = RawFrame::new(ffmpeg::format::Pixel::YUV420P, 16, 16);
        assert!(!is_hardware_frame(&frame));
    }

    #[test]
    fn test_transfer_rejects_software_frame() {
        let frame = RawFrame::new(ffmpeg::format::Pixel::YUV420P, 16, 16);
        assert!(transfer_to_host(&frame).is_err());
    }
}
