//! Track and sample types.
//!
//! A [`Track`] is built once when the container header is parsed and never
//! changes afterwards. [`EncodedSample`]s are produced in decode order and
//! share the input buffer through [`Bytes`], so demuxing never copies payload
//! data.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;

use bytes::Bytes;

/// The kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A video track (`vide` handler).
    Video,
    /// An audio track (`soun` handler).
    Audio,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Metadata for one track of a container.
///
/// # Example
///
/// ```no_run
/// use upscaler::{MediaKind, Mp4Demuxer};
///
/// let data = std::fs::read("input.mp4").unwrap();
/// let demuxer = Mp4Demuxer::new(data, MediaKind::Video).unwrap();
/// let track = demuxer.track();
/// println!("{} track {} uses {}", track.kind, track.id, track.codec);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Track {
    /// Track identifier from the track header.
    pub id: u32,
    /// Video or audio.
    pub kind: MediaKind,
    /// Codec string (e.g. `"avc1.64001f"`, `"mp4a.40.2"`).
    pub codec: String,
    /// Media timescale in ticks per second.
    pub timescale: u32,
    /// Media duration in timescale ticks.
    pub duration: u64,
    /// Number of samples in the sample table.
    pub sample_count: usize,
    /// Kind-specific parameters.
    pub params: TrackParams,
}

impl Track {
    /// Media duration as a [`Duration`].
    pub fn duration(&self) -> Duration {
        if self.timescale == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.duration as f64 / f64::from(self.timescale))
    }

    /// Pixel dimensions for video tracks.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.params {
            TrackParams::Video { width, height, .. } => Some((width, height)),
            TrackParams::Audio { .. } => None,
        }
    }
}

/// Parameters that depend on the track kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackParams {
    /// Video sample entry fields.
    Video {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Decoder configuration record, header stripped.
        description: Option<Bytes>,
    },
    /// Audio sample entry fields.
    Audio {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Number of channels.
        channel_count: u16,
        /// Codec-specific setup data (for AAC, the AudioSpecificConfig).
        description: Option<Bytes>,
    },
}

/// One compressed media unit with its timing.
///
/// Timestamps and durations are in microseconds. The payload is a cheap
/// reference-counted slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    /// Compressed payload.
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Decode timestamp in microseconds. Equal to `timestamp` unless frames
    /// are reordered.
    pub decode_timestamp: i64,
    /// Duration in microseconds.
    pub duration: i64,
    /// Whether the sample can be decoded without earlier samples.
    pub key_frame: bool,
}

impl EncodedSample {
    /// Build a sample from its parts, decoded at its presentation time.
    pub fn new(data: impl Into<Bytes>, timestamp: i64, duration: i64, key_frame: bool) -> Self {
        Self {
            data: data.into(),
            timestamp,
            decode_timestamp: timestamp,
            duration,
            key_frame,
        }
    }

    /// Set the decode timestamp of a reordered sample.
    #[must_use]
    pub fn with_decode_timestamp(mut self, decode_timestamp: i64) -> Self {
        self.decode_timestamp = decode_timestamp;
        self
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
