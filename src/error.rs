//! Error types for the `upscaler` crate.
//!
//! This module defines [`UpscaleError`], the unified error type returned by all
//! fallible operations in the crate. Errors carry enough context (track kind,
//! pipeline stage, byte counts, upstream messages) to be shown to a user as-is.

use std::io::Error as IoError;

use thiserror::Error;

use crate::capacity::human_file_size;
use crate::codec::Stage;
use crate::metadata::MediaKind;

/// The unified error type for all `upscaler` operations.
///
/// Every public method that can fail returns `Result<T, UpscaleError>`.
/// Apart from [`DestinationAborted`](UpscaleError::DestinationAborted), every
/// variant is fatal for the conversion job that produced it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpscaleError {
    /// The container has no track of the requested kind.
    #[error("No {0} track found in container")]
    NoTrack(MediaKind),

    /// The video sample entry carries none of the codec parameter boxes.
    #[error("No decoder configuration (avcC, hvcC, vpcC or av1C) found for codec {codec}")]
    MissingCodecConfig {
        /// Codec string of the offending track.
        codec: String,
    },

    /// The container is truncated or structurally invalid.
    #[error("Malformed container: {0}")]
    Container(String),

    /// The codec is not supported by the component that received it.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A decoder or encoder reported a genuine (non-"closed") fault.
    #[error("{stage} error: {message}")]
    CodecFault {
        /// Stage that failed.
        stage: Stage,
        /// Message reported by the codec.
        message: String,
    },

    /// Output was awaited from a codec instance that has already been closed.
    #[error("{0} is closed")]
    CodecClosed(Stage),

    /// A stage produced no output despite repeated forced flushes.
    #[error("{stage} stalled with {pending} outputs pending after {attempts} recovery attempts")]
    Stalled {
        /// Stage that stopped producing output.
        stage: Stage,
        /// Number of outputs still awaited.
        pending: usize,
        /// Number of forced recoveries performed.
        attempts: u32,
    },

    /// A stage emitted fewer (or more) outputs than it was given inputs.
    #[error("{stage} produced {received} outputs for {expected} inputs")]
    FramesDropped {
        /// Stage whose output count is wrong.
        stage: Stage,
        /// Number of inputs submitted.
        expected: usize,
        /// Number of outputs received.
        received: usize,
    },

    /// The frame renderer failed.
    #[error("Render error: {0}")]
    Render(String),

    /// A rendered frame does not have exactly twice the source dimensions.
    #[error("Rendered frame is {}x{}, expected {}x{}", actual.0, actual.1, expected.0, expected.1)]
    ScaleMismatch {
        /// Required (width, height).
        expected: (u32, u32),
        /// Delivered (width, height).
        actual: (u32, u32),
    },

    /// The estimated output does not fit in the available storage.
    #[error(
        "The video is too big. It would output a file of {} but only {} can be written",
        human_file_size(*estimated as f64),
        human_file_size(*quota as f64)
    )]
    QuotaExceeded {
        /// Estimated output size in bytes.
        estimated: u64,
        /// Available storage in bytes.
        quota: u64,
    },

    /// No output destination was chosen. The job returns to its
    /// pre-processing state.
    #[error("Output destination selection was aborted")]
    DestinationAborted,

    /// The container writer rejected its input.
    #[error("Failed to write container: {0}")]
    Mux(String),

    /// An I/O error occurred while writing the output.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// An error reported by FFmpeg.
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),
}

impl UpscaleError {
    /// Whether this error terminates the job.
    ///
    /// Only [`DestinationAborted`](UpscaleError::DestinationAborted) is
    /// non-fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UpscaleError::DestinationAborted)
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for UpscaleError {
    fn from(error: ffmpeg_next::Error) -> Self {
        UpscaleError::Ffmpeg(error.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UpscaleError>;
