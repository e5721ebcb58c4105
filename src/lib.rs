//! # upscaler
//!
//! Upscale videos 2x: read an MP4 file, decode its video, pass every frame
//! through an upscaling renderer, re-encode as H.264, and write a new MP4
//! with the original audio copied through untouched.
//!
//! The crate is built around three stage traits, [`VideoDecoder`],
//! [`FrameRenderer`] and [`VideoEncoder`], and a [`Coordinator`] that keeps
//! them busy without letting the number of frames in flight grow without
//! bound. A stall alarm forces flushes when a codec goes quiet and aborts
//! the run when it stays quiet.
//!
//! ## Quick Start
//!
//! ### Inspect a file
//!
//! ```no_run
//! use upscaler::MediaKind;
//!
//! let data = std::fs::read("input.mp4").unwrap();
//! let info = upscaler::probe(data).unwrap();
//! for track in &info.tracks {
//!     println!("{} {} ({} samples)", track.kind, track.codec, track.sample_count);
//! }
//! let video = info.first(MediaKind::Video).unwrap();
//! println!("{:?}", video.dimensions());
//! ```
//!
//! ### Plan the output
//!
//! ```
//! use std::time::Duration;
//!
//! let plan = upscaler::capacity::plan(640, 360, Duration::from_secs(60), None).unwrap();
//! println!("{} at {:.0} bit/s, about {}", plan.codec, plan.bitrate,
//!     upscaler::human_file_size(plan.estimated_bytes as f64));
//! ```
//!
//! ### Convert (feature `ffmpeg`)
//!
//! ```no_run
//! # #[cfg(feature = "ffmpeg")]
//! # async fn convert() -> upscaler::Result<()> {
//! use std::path::PathBuf;
//!
//! use upscaler::{
//!     ConversionJob, FfmpegDecoder, FfmpegEncoder, FileDestination, PipelineConfig,
//!     ResampleRenderer,
//! };
//!
//! let input = std::fs::read("clip.mp4")?;
//! let duration = upscaler::probe(input.clone())?.duration;
//! let mut destination = FileDestination(PathBuf::from(upscaler::upscaled_file_name("clip.mp4")));
//! let job = ConversionJob::new(
//!     FfmpegDecoder::new(),
//!     FfmpegEncoder::new(),
//!     ResampleRenderer::new(),
//!     PipelineConfig::new().with_storage_quota(Some(8 << 30)),
//! );
//! if let Some(buffer) = job.run(input.into(), duration, &mut destination).await? {
//!     std::fs::write("clip-upscaled.mp4", buffer)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **MP4 reading**: tracks, codec strings, decoder configuration records
//!   and batched, zero-copy sample extraction
//! - **Bounded pipeline**: decode, render and encode overlap while at most
//!   `window` samples are in flight
//! - **Stall recovery**: forced flushes with a bounded number of
//!   consecutive attempts
//! - **MP4 writing**: fast-start in-memory files or streamed output for
//!   large results
//! - **Capacity planning**: output size estimates, quota checks and codec
//!   profile selection
//! - **Status events**: progress, ETA, errors and completion through a
//!   [`StatusListener`]
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ffmpeg` | `FfmpegDecoder` and `FfmpegEncoder`, and the `upscale` CLI command |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! The `ffmpeg` feature needs the FFmpeg development libraries installed on
//! your system. Everything else is pure Rust.

pub mod capacity;
pub mod codec;
pub mod codec_config;
pub mod config;
pub mod demux;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod h264;
pub mod job;
pub mod metadata;
pub mod mux;
pub mod pipeline;
pub mod progress;
pub mod upscale;

mod boxes;
mod sample_table;
mod utilities;
mod watchdog;

pub use capacity::{CapacityPlan, TargetKind, human_file_size};
pub use codec::{
    CodecError, CompletionQueue, DecodedFrame, EncodedChunk, RenderedFrame, Stage, StageEvent,
    StageOutput, VideoDecoder, VideoEncoder, VideoEncoderConfig, completion_queue,
};
pub use codec_config::{AudioDecoderConfig, DecoderConfig, VideoDecoderConfig, decoder_config};
pub use config::PipelineConfig;
pub use demux::{DemuxEvent, ExtractedTrack, MovieInfo, Mp4Demuxer, extract_track, probe};
pub use error::{Result, UpscaleError};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegDecoder, FfmpegEncoder, FfmpegLogLevel, get_ffmpeg_log_level, set_ffmpeg_log_level};
pub use job::{ConversionJob, DestinationProvider, FileDestination, NoDestination};
pub use metadata::{EncodedSample, MediaKind, Track, TrackParams};
pub use mux::{
    AudioTrackOptions, Mp4Muxer, MuxOutput, MuxTarget, MuxerOptions, VideoTrackOptions, WriteSeek,
};
pub use pipeline::{Coordinator, PipelineStats, VideoChunkSink};
pub use progress::{Eta, JobEvent, ProgressTracker, StatusListener, pretty_time};
pub use upscale::{
    ContentStyle, FrameRenderer, NetworkSelection, NetworkSize, ResampleRenderer, SCALE_FACTOR,
};
pub use utilities::upscaled_file_name;
