//! Container access
//!
//! Thin wrapper over the demuxing library: opens a media URL, selects the
//! best video stream, iterates compressed packets and exposes the
//! seek-by-timestamp primitive with nearest-keyframe-or-before semantics.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::media::Type as MediaType;
use ffmpeg_next::Rational;

use crate::error::{Error, Result};
use crate::timestamp::TickScale;

/// Immutable description of the selected video stream.
///
/// Captured once when the media is opened; the stage threads share it
/// read-only.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Stream index inside the container
    pub index: usize,
    /// Native time base
    pub time_base: Rational,
    /// Stream start time in native ticks
    pub start_time: i64,
    /// Stream duration in native ticks
    pub duration_pts: i64,
    /// Stream duration in milliseconds
    pub duration_ms: i64,
    /// Nominal interval between frames in native ticks
    pub frame_interval_pts: i64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codec_name: String,
    /// Single-frame media (still image); exempt from duration bounds
    pub is_image: bool,
}

impl StreamDescriptor {
    /// Tick/millisecond converter for this stream
    pub fn tick_scale(&self) -> TickScale {
        TickScale::new(self.time_base, self.start_time)
    }
}

/// Outcome of one packet read
pub enum PacketRead {
    Packet {
        stream_index: usize,
        packet: ffmpeg::Packet,
    },
    Eof,
}

/// An opened media container
pub struct MediaSource {
    input: ffmpeg::format::context::Input,
    url: String,
}

// The format context is owned by exactly one stage thread at a time.
unsafe impl Send for MediaSource {}

impl MediaSource {
    /// Open and probe a media URL.
    pub fn open(url: &str) -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::InvalidMedia(format!("ffmpeg init: {e}")))?;
        let input = ffmpeg::format::input(&url)
            .map_err(|e| Error::InvalidMedia(format!("'{url}': {e}")))?;
        log::debug!("Opened media '{url}'");
        Ok(Self {
            input,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Select the best video stream and describe it.
    pub fn best_video_stream(&self) -> Result<StreamDescriptor> {
        let stream = self
            .input
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| Error::NoVideoStream(self.url.clone()))?;

        let time_base = stream.time_base();
        let start_time = {
            let raw = unsafe { (*stream.as_ptr()).start_time };
            if raw == ffmpeg_sys_next::AV_NOPTS_VALUE {
                0
            } else {
                raw
            }
        };

        let scale = TickScale::new(time_base, start_time);
        let duration_pts = {
            let raw = stream.duration();
            if raw == ffmpeg_sys_next::AV_NOPTS_VALUE || raw <= 0 {
                // fall back to the container duration (1/1_000_000 units)
                let container = self.input.duration();
                if container > 0 {
                    rescale(container, Rational::new(1, 1_000_000), time_base)
                } else {
                    0
                }
            } else {
                raw
            }
        };
        let duration_ms = scale.to_millis(start_time + duration_pts);

        let rate = stream.rate();
        let frame_interval_pts = frame_interval(rate, time_base);

        let avg = stream.avg_frame_rate();
        let frame_rate = if avg.denominator() > 0 {
            avg.numerator() as f64 / avg.denominator() as f64
        } else {
            0.0
        };

        let params = stream.parameters();
        let (width, height) = unsafe {
            (
                (*params.as_ptr()).width.max(0) as u32,
                (*params.as_ptr()).height.max(0) as u32,
            )
        };
        let codec_name = ffmpeg::decoder::find(params.id())
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let format_name = self.input.format().name().to_string();
        let is_image = stream.frames() == 1
            || format_name.contains("image2")
            || format_name.ends_with("_pipe");

        Ok(StreamDescriptor {
            index: stream.index(),
            time_base,
            start_time,
            duration_pts,
            duration_ms,
            frame_interval_pts,
            width,
            height,
            frame_rate,
            codec_name,
            is_image,
        })
    }

    /// Codec parameters of a stream (for opening the decoder).
    pub fn stream_parameters(&self, index: usize) -> Result<ffmpeg::codec::Parameters> {
        self.input
            .stream(index)
            .map(|s| s.parameters())
            .ok_or_else(|| Error::InvalidMedia(format!("stream {index} disappeared")))
    }

    /// Read the next packet from the container.
    ///
    /// Distinguishes end-of-stream from transient read failures; the caller
    /// skips failed reads and retries on the next loop iteration.
    pub fn read_packet(&mut self) -> Result<PacketRead> {
        let mut packet = ffmpeg::Packet::empty();
        let ret = unsafe {
            ffmpeg_sys_next::av_read_frame(self.input.as_mut_ptr(), packet.as_mut_ptr())
        };
        if ret == 0 {
            let stream_index = unsafe { (*packet.as_ptr()).stream_index.max(0) as usize };
            Ok(PacketRead::Packet {
                stream_index,
                packet,
            })
        } else if ret == ffmpeg_sys_next::AVERROR_EOF {
            Ok(PacketRead::Eof)
        } else {
            Err(Error::from_ffmpeg(ret))
        }
    }

    /// Seek so that the next packets start at the keyframe at or before
    /// `target_pts` (native ticks of `stream_index`).
    pub fn seek(&mut self, stream_index: usize, target_pts: i64) -> Result<()> {
        let ret = unsafe {
            ffmpeg_sys_next::avformat_seek_file(
                self.input.as_mut_ptr(),
                stream_index as i32,
                i64::MIN,
                target_pts,
                target_pts,
                0,
            )
        };
        if ret < 0 {
            Err(Error::SeekFailed(target_pts))
        } else {
            Ok(())
        }
    }
}

fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let num = value as i128 * from.numerator() as i128 * to.denominator() as i128;
    let den = from.denominator() as i128 * to.numerator() as i128;
    if den == 0 {
        return 0;
    }
    (num / den) as i64
}

/// Nominal frame interval in stream ticks from the real frame rate.
fn frame_interval(rate: Rational, time_base: Rational) -> i64 {
    let num = rate.denominator() as i128 * time_base.denominator() as i128;
    let den = rate.numerator() as i128 * time_base.numerator() as i128;
    if den <= 0 {
        return 1;
    }
    // round to nearest
    let interval = (num + den / 2) / den;
    interval.max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file() {
        assert!(matches!(
            MediaSource::open("/nonexistent/clip.mp4"),
            Err(Error::InvalidMedia(_))
        ));
    }

    #[test]
    fn test_open_garbage_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 256]).unwrap();
        let path = file.path().to_string_lossy().to_string();
        // not a media container; probing must fail, not panic
        assert!(MediaSource::open(&path).is_err());
    }

    #[test]
    fn test_frame_interval_math() {
        // 25 fps at 1/90000: 3600 ticks per frame
        assert_eq!(
            frame_interval(Rational::new(25, 1), Rational::new(1, 90000)),
            3600
        );
        // 30000/1001 fps at 1/30000: ~1001 ticks
        assert_eq!(
            frame_interval(Rational::new(30000, 1001), Rational::new(1, 30000)),
            1001
        );
        // degenerate rate falls back to one tick
        assert_eq!(
            frame_interval(Rational::new(0, 1), Rational::new(1, 1000)),
            1
        );
    }
}
