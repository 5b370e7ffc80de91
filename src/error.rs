//! Error types for vread-core

use thiserror::Error;

/// Result type alias for vread-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for reader operations
#[derive(Error, Debug)]
pub enum Error {
    /// Container open / probe failure
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// No usable video stream in the container
    #[error("No video stream found in '{0}'")]
    NoVideoStream(String),

    /// Operation invoked in the wrong lifecycle state
    #[error("Invalid reader state: {0}")]
    InvalidState(&'static str),

    /// Argument out of its valid range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Decoder open / send / receive failure
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    /// Container seek primitive failure
    #[error("Seek failed at {0} ticks")]
    SeekFailed(i64),

    /// Pixel conversion / scaling failure
    #[error("Frame conversion failed: {0}")]
    ConvertFailed(String),

    /// Reader is suspended; frame data is unavailable until wakeup
    #[error("Reader is suspended")]
    Suspended,

    /// Pipeline not primed yet
    #[error("Reader is not ready to serve frames")]
    NotReady,

    /// Operation this reader type does not implement (e.g. audio reads)
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// FFmpeg error with code
    #[error("FFmpeg error {code}: {message}")]
    FFmpeg { code: i32, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create from a raw FFmpeg error code
    pub fn from_ffmpeg(code: i32) -> Self {
        Error::FFmpeg {
            code,
            message: ffmpeg_next::Error::from(code).to_string(),
        }
    }
}

impl From<ffmpeg_next::Error> for Error {
    fn from(e: ffmpeg_next::Error) -> Self {
        Error::FFmpeg {
            code: i32::from(e),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_error_roundtrip() {
        let err = Error::from_ffmpeg(i32::from(ffmpeg_next::Error::Eof));
        assert!(matches!(err, Error::FFmpeg { .. }));
    }

    #[test]
    fn test_display_messages() {
        let err = Error::InvalidState("not opened");
        assert_eq!(err.to_string(), "Invalid reader state: not opened");
        let err = Error::Unsupported("read_audio_samples");
        assert!(err.to_string().contains("read_audio_samples"));
    }
}
