//! Output image conversion
//!
//! Wraps the software scaler behind a fixed output configuration: size (or
//! size factors), color format, data type and resize interpolation are set
//! once, then raw decoded frames are converted one-shot into output images.

use std::fmt;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::software::scaling::{Context as ScalerContext, Flags as ScalerFlags};
use ffmpeg_next::util::frame::video::Video as RawFrame;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Color format of output images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// 4-channel RGBA
    Rgba,
    /// 4-channel BGRA
    Bgra,
    /// 3-channel RGB
    Rgb,
}

impl ColorFormat {
    fn to_pixel(self) -> ffmpeg::format::Pixel {
        match self {
            ColorFormat::Rgba => ffmpeg::format::Pixel::RGBA,
            ColorFormat::Bgra => ffmpeg::format::Pixel::BGRA,
            ColorFormat::Rgb => ffmpeg::format::Pixel::RGB24,
        }
    }

    /// Bytes per pixel at 8-bit depth
    pub fn channels(self) -> u32 {
        match self {
            ColorFormat::Rgba | ColorFormat::Bgra => 4,
            ColorFormat::Rgb => 3,
        }
    }
}

/// Sample data type of output images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 8-bit unsigned samples
    U8,
    /// 32-bit float samples normalized to [0, 1]
    F32,
}

/// Resize interpolation mode, mapped onto scaler flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    Bicubic,
    Area,
    Lanczos,
}

impl Interpolation {
    fn to_flags(self) -> ScalerFlags {
        match self {
            Interpolation::Nearest => ScalerFlags::POINT,
            Interpolation::Bilinear => ScalerFlags::BILINEAR,
            Interpolation::Bicubic => ScalerFlags::BICUBIC,
            Interpolation::Area => ScalerFlags::AREA,
            Interpolation::Lanczos => ScalerFlags::LANCZOS,
        }
    }
}

/// Output raster size: fixed dimensions, or factors of the source size
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputSize {
    /// Exact output dimensions in pixels
    Fixed(u32, u32),
    /// Width/height scale factors applied to the source dimensions.
    /// Resulting dimensions are rounded up to the next even number.
    Factor(f32, f32),
}

/// Full output configuration for a reader instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSpec {
    pub size: OutputSize,
    pub color: ColorFormat,
    pub depth: DataType,
    pub interp: Interpolation,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            size: OutputSize::Factor(1.0, 1.0),
            color: ColorFormat::Rgba,
            depth: DataType::U8,
            interp: Interpolation::Bilinear,
        }
    }
}

impl OutputSpec {
    /// Fixed-size output
    pub fn fixed(width: u32, height: u32) -> Self {
        Self {
            size: OutputSize::Fixed(width, height),
            ..Default::default()
        }
    }

    /// Source-relative output size
    pub fn scaled(width_factor: f32, height_factor: f32) -> Self {
        Self {
            size: OutputSize::Factor(width_factor, height_factor),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: ColorFormat) -> Self {
        self.color = color;
        self
    }

    pub fn with_depth(mut self, depth: DataType) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_interpolation(mut self, interp: Interpolation) -> Self {
        self.interp = interp;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.size {
            OutputSize::Fixed(w, h) if w == 0 || h == 0 => Err(Error::InvalidArgument(
                "output dimensions must be non-zero".into(),
            )),
            OutputSize::Factor(fw, fh) if fw <= 0.0 || fh <= 0.0 => Err(Error::InvalidArgument(
                "output size factors must be positive".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Converted output image
#[derive(Clone)]
pub struct OutputImage {
    /// Raw sample data, `stride * height` bytes, row-padded as produced by
    /// the scaler. For `DataType::F32` each sample is a little-endian f32.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub color: ColorFormat,
    pub depth: DataType,
    /// Presentation position in milliseconds
    pub pos_ms: i64,
}

impl fmt::Debug for OutputImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("color", &self.color)
            .field("depth", &self.depth)
            .field("pos_ms", &self.pos_ms)
            .field("data_size", &self.data.len())
            .finish()
    }
}

struct ScalerState {
    ctx: ScalerContext,
    src_format: ffmpeg::format::Pixel,
    src_width: u32,
    src_height: u32,
}

/// One-shot raw-frame to output-image converter.
///
/// The scaler context is rebuilt lazily whenever the source format or
/// dimensions change (hardware frames arrive as NV12 after host transfer
/// while software frames keep the codec's native format).
pub struct FrameConverter {
    out_width: u32,
    out_height: u32,
    color: ColorFormat,
    depth: DataType,
    interp: Interpolation,
    scaler: Mutex<Option<ScalerState>>,
}

// The scaler context is only touched under the internal mutex.
unsafe impl Send for FrameConverter {}
unsafe impl Sync for FrameConverter {}

impl FrameConverter {
    /// Resolve an output spec against the source dimensions.
    pub fn new(spec: &OutputSpec, src_width: u32, src_height: u32) -> Result<Self> {
        spec.validate()?;
        let (out_width, out_height) = match spec.size {
            OutputSize::Fixed(w, h) => (w, h),
            OutputSize::Factor(fw, fh) => (
                round_up_even((src_width as f32 * fw).ceil() as u32),
                round_up_even((src_height as f32 * fh).ceil() as u32),
            ),
        };
        if out_width == 0 || out_height == 0 {
            return Err(Error::InvalidArgument(
                "resolved output dimensions are zero".into(),
            ));
        }
        Ok(Self {
            out_width,
            out_height,
            color: spec.color,
            depth: spec.depth,
            interp: spec.interp,
            scaler: Mutex::new(None),
        })
    }

    pub fn out_width(&self) -> u32 {
        self.out_width
    }

    pub fn out_height(&self) -> u32 {
        self.out_height
    }

    /// Convert one raw decoded frame into an output image.
    pub fn convert(&self, frame: &RawFrame, pos_ms: i64) -> Result<OutputImage> {
        let src_format = frame.format();
        let src_width = frame.width();
        let src_height = frame.height();

        let mut guard = self.scaler.lock();
        let rebuild = match guard.as_ref() {
            Some(s) => {
                s.src_format != src_format
                    || s.src_width != src_width
                    || s.src_height != src_height
            }
            None => true,
        };
        if rebuild {
            let ctx = ScalerContext::get(
                src_format,
                src_width,
                src_height,
                self.color.to_pixel(),
                self.out_width,
                self.out_height,
                self.interp.to_flags(),
            )
            .map_err(|e| Error::ConvertFailed(format!("scaler init: {e}")))?;
            log::debug!(
                "Scaler initialized: {:?} {}x{} -> {:?} {}x{}",
                src_format,
                src_width,
                src_height,
                self.color.to_pixel(),
                self.out_width,
                self.out_height
            );
            *guard = Some(ScalerState {
                ctx,
                src_format,
                src_width,
                src_height,
            });
        }

        let state = guard.as_mut().expect("scaler state present after rebuild");
        let mut scaled = RawFrame::empty();
        state
            .ctx
            .run(frame, &mut scaled)
            .map_err(|e| Error::ConvertFailed(format!("scale: {e}")))?;

        let stride = scaled.stride(0) as u32;
        let size = (stride * self.out_height) as usize;
        let plane = scaled.data(0);
        let data = plane[..size].to_vec();

        let (data, stride) = match self.depth {
            DataType::U8 => (data, stride),
            DataType::F32 => (widen_to_f32(&data), stride * 4),
        };

        Ok(OutputImage {
            data,
            width: self.out_width,
            height: self.out_height,
            stride,
            color: self.color,
            depth: self.depth,
            pos_ms,
        })
    }
}

fn round_up_even(v: u32) -> u32 {
    if v & 1 == 1 {
        v + 1
    } else {
        v
    }
}

fn widen_to_f32(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    for &b in bytes {
        out.extend_from_slice(&(b as f32 / 255.0).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(width: u32, height: u32) -> RawFrame {
        let mut frame = RawFrame::new(ffmpeg::format::Pixel::RGB24, width, height);
        let stride = frame.stride(0);
        for row in 0..height as usize {
            for col in 0..width as usize {
                frame.data_mut(0)[row * stride + col * 3] = (col % 256) as u8;
            }
        }
        frame
    }

    #[test]
    fn test_fixed_size_conversion() {
        let cvt = FrameConverter::new(&OutputSpec::fixed(32, 24), 64, 48).unwrap();
        let image = cvt.convert(&rgb_frame(64, 48), 1234).unwrap();
        assert_eq!(image.width, 32);
        assert_eq!(image.height, 24);
        assert_eq!(image.pos_ms, 1234);
        assert!(image.stride >= 32 * 4);
        assert_eq!(image.data.len(), (image.stride * image.height) as usize);
    }

    #[test]
    fn test_factor_size_rounds_up_even() {
        let spec = OutputSpec::scaled(0.5, 0.5);
        let cvt = FrameConverter::new(&spec, 31, 17).unwrap();
        // ceil(15.5)=16, ceil(8.5)=9 -> 10
        assert_eq!(cvt.out_width(), 16);
        assert_eq!(cvt.out_height(), 10);
    }

    #[test]
    fn test_f32_depth_widens_samples() {
        let spec = OutputSpec::fixed(16, 16).with_depth(DataType::F32);
        let cvt = FrameConverter::new(&spec, 16, 16).unwrap();
        let u8_cvt = FrameConverter::new(&OutputSpec::fixed(16, 16), 16, 16).unwrap();
        let frame = rgb_frame(16, 16);
        let f32_img = cvt.convert(&frame, 0).unwrap();
        let u8_img = u8_cvt.convert(&frame, 0).unwrap();
        assert_eq!(f32_img.data.len(), u8_img.data.len() * 4);
        assert_eq!(f32_img.stride, u8_img.stride * 4);
    }

    #[test]
    fn test_invalid_spec_rejected() {
        assert!(FrameConverter::new(&OutputSpec::fixed(0, 10), 64, 48).is_err());
        assert!(FrameConverter::new(&OutputSpec::scaled(-1.0, 1.0), 64, 48).is_err());
    }

    #[test]
    fn test_scaler_rebuild_on_format_change() {
        let cvt = FrameConverter::new(&OutputSpec::fixed(16, 16), 64, 48).unwrap();
        cvt.convert(&rgb_frame(64, 48), 0).unwrap();
        // different source geometry forces a scaler rebuild
        let frame = RawFrame::new(ffmpeg::format::Pixel::YUV420P, 32, 32);
        let image = cvt.convert(&frame, 40).unwrap();
        assert_eq!(image.width, 16);
        assert_eq!(image.height, 16);
    }
}
