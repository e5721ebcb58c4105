//! One end-to-end conversion.
//!
//! [`ConversionJob`] owns the decoder, encoder and renderer for a single
//! run. It extracts the tracks, plans the output size, picks an output
//! target, drives the [`Coordinator`] into an [`Mp4Muxer`], copies the
//! audio through untouched, and reports the outcome to the configured
//! [`StatusListener`](crate::StatusListener).

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};

use crate::capacity::{CapacityPlan, TargetKind, human_file_size, plan};
use crate::codec::{VideoDecoder, VideoEncoder, VideoEncoderConfig};
use crate::config::PipelineConfig;
use crate::demux::{ExtractedTrack, extract_track};
use crate::error::{Result, UpscaleError};
use crate::metadata::{MediaKind, TrackParams};
use crate::mux::{AudioTrackOptions, Mp4Muxer, MuxOutput, MuxTarget, MuxerOptions, VideoTrackOptions, WriteSeek};
use crate::pipeline::Coordinator;
use crate::progress::JobEvent;
use crate::upscale::FrameRenderer;

const FALLBACK_FRAMERATE: f64 = 30.0;

/// Supplies a writable destination when the output is too large to keep in
/// memory.
pub trait DestinationProvider {
    /// Open a destination for roughly `estimated_bytes` of output.
    ///
    /// `Ok(None)` means the user declined, which ends the job with
    /// [`UpscaleError::DestinationAborted`].
    fn open(&mut self, suggested_name: &str, estimated_bytes: u64) -> Result<Option<Box<dyn WriteSeek>>>;
}

/// Writes to a fixed path, creating or truncating it.
#[derive(Debug, Clone)]
pub struct FileDestination(pub PathBuf);

impl DestinationProvider for FileDestination {
    fn open(&mut self, _suggested_name: &str, estimated_bytes: u64) -> Result<Option<Box<dyn WriteSeek>>> {
        info!(
            "Streaming ~{} to {}",
            human_file_size(estimated_bytes as f64),
            self.0.display()
        );
        Ok(Some(Box::new(File::create(&self.0)?)))
    }
}

/// Declines every request, so only in-memory outputs can be produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDestination;

impl DestinationProvider for NoDestination {
    fn open(&mut self, _suggested_name: &str, _estimated_bytes: u64) -> Result<Option<Box<dyn WriteSeek>>> {
        Ok(None)
    }
}

/// The stages and settings of one conversion.
///
/// # Example
///
/// ```no_run
/// # #[cfg(feature = "ffmpeg")]
/// # async fn convert() -> upscaler::Result<()> {
/// use std::time::Duration;
///
/// use upscaler::{ConversionJob, FfmpegDecoder, FfmpegEncoder, NoDestination, PipelineConfig, ResampleRenderer};
///
/// let input = std::fs::read("clip.mp4")?;
/// let duration = upscaler::probe(input.clone())?.duration;
/// let job = ConversionJob::new(
///     FfmpegDecoder::new(),
///     FfmpegEncoder::new(),
///     ResampleRenderer::new(),
///     PipelineConfig::new(),
/// );
/// let output = job.run(input.into(), duration, &mut NoDestination).await?;
/// std::fs::write("clip-upscaled.mp4", output.unwrap_or_default())?;
/// # Ok(())
/// # }
/// ```
pub struct ConversionJob<D, E, R> {
    decoder: D,
    encoder: E,
    renderer: R,
    config: PipelineConfig,
    output_name: String,
}

impl<D, E, R> ConversionJob<D, E, R>
where
    D: VideoDecoder,
    E: VideoEncoder,
    R: FrameRenderer,
{
    /// Bundle the stages of one run.
    pub fn new(decoder: D, encoder: E, renderer: R, config: PipelineConfig) -> Self {
        Self {
            decoder,
            encoder,
            renderer,
            config,
            output_name: "video-upscaled.mp4".to_string(),
        }
    }

    /// Name suggested to the [`DestinationProvider`].
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Convert `input`, whose declared duration is `duration`.
    ///
    /// Returns the file for in-memory targets and `None` when it was
    /// streamed to a destination. The listener sees `Finished` on success,
    /// sharing the returned buffer, and exactly one `Error` on any fatal
    /// failure.
    pub async fn run(
        mut self,
        input: Bytes,
        duration: Duration,
        destinations: &mut dyn DestinationProvider,
    ) -> Result<Option<Bytes>> {
        let result = self.execute(input, duration, destinations).await;
        match &result {
            Ok(output) => self.config.emit(JobEvent::Finished(output.clone())),
            Err(UpscaleError::DestinationAborted) => info!("No destination chosen, conversion cancelled"),
            Err(e) => {
                log::error!("Conversion failed: {e}");
                self.config.emit(JobEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn execute(
        &mut self,
        input: Bytes,
        duration: Duration,
        destinations: &mut dyn DestinationProvider,
    ) -> Result<Option<Bytes>> {
        self.config.validate()?;
        let batch_size = self.config.demux_batch_size;
        let video = extract_track(input.clone(), MediaKind::Video, duration, batch_size)?;
        let decoder_config = video
            .config
            .as_video()
            .cloned()
            .ok_or_else(|| UpscaleError::InvalidConfig("video track has no video configuration".into()))?;
        let (width, height) = video
            .track
            .dimensions()
            .ok_or_else(|| UpscaleError::InvalidConfig("video track has no dimensions".into()))?;

        let plan = plan(width, height, duration, self.config.storage_quota)?;
        info!(
            "Upscaling {width}x{height} to {}x{} with {}, estimated output {}",
            plan.output_width,
            plan.output_height,
            plan.codec,
            human_file_size(plan.estimated_bytes as f64)
        );

        let target = match plan.target {
            TargetKind::Memory => MuxTarget::Memory,
            TargetKind::Stream => match destinations.open(&self.output_name, plan.estimated_bytes)? {
                Some(writer) => MuxTarget::Stream(writer),
                None => return Err(UpscaleError::DestinationAborted),
            },
        };

        let audio = extract_audio(input, duration, batch_size);
        let mut muxer = Mp4Muxer::new(
            target,
            MuxerOptions {
                video: VideoTrackOptions {
                    codec: plan.codec.to_string(),
                    width: plan.output_width,
                    height: plan.output_height,
                },
                audio: audio.as_ref().and_then(audio_options),
            },
        )?;

        let encoder_config = encoder_config(&plan, &video);
        let stats = Coordinator::new(&mut self.decoder, &mut self.encoder, &mut self.renderer, &self.config)
            .run(&decoder_config, &encoder_config, &video.samples, duration, &mut muxer)
            .await?;
        info!("Encoded {} frames", stats.frames);

        if let Some(audio) = audio.filter(|a| audio_options(a).is_some()) {
            for sample in &audio.samples {
                muxer.add_audio_chunk(sample)?;
            }
            info!("Copied {} audio samples", audio.samples.len());
        }

        Ok(match muxer.finalize()? {
            MuxOutput::Buffer(buffer) => Some(Bytes::from(buffer)),
            MuxOutput::Streamed { bytes_written } => {
                info!("Wrote {}", human_file_size(bytes_written as f64));
                None
            }
        })
    }
}

fn extract_audio(input: Bytes, duration: Duration, batch_size: usize) -> Option<ExtractedTrack> {
    match extract_track(input, MediaKind::Audio, duration, batch_size) {
        Ok(track) if track.track.codec.starts_with("mp4a") => Some(track),
        Ok(track) => {
            warn!("Skipping {} audio, only AAC is carried into the output", track.track.codec);
            None
        }
        Err(UpscaleError::NoTrack(_)) => {
            info!("No audio track, output is video-only");
            None
        }
        Err(e) => {
            warn!("Skipping audio: {e}");
            None
        }
    }
}

fn audio_options(audio: &ExtractedTrack) -> Option<AudioTrackOptions> {
    match &audio.track.params {
        TrackParams::Audio {
            sample_rate,
            channel_count,
            description,
        } => Some(AudioTrackOptions {
            codec: audio.track.codec.clone(),
            sample_rate: *sample_rate,
            channel_count: *channel_count,
            description: description.clone(),
        }),
        TrackParams::Video { .. } => None,
    }
}

fn encoder_config(plan: &CapacityPlan, video: &ExtractedTrack) -> VideoEncoderConfig {
    let framerate = video
        .samples
        .first()
        .filter(|s| s.duration > 0)
        .map_or(FALLBACK_FRAMERATE, |s| 1e6 / s.duration as f64);
    VideoEncoderConfig {
        codec: plan.codec.to_string(),
        width: plan.output_width,
        height: plan.output_height,
        bitrate: plan.bitrate.round() as u64,
        framerate,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn no_destination_declines() {
        assert!(NoDestination.open("out.mp4", 1).unwrap().is_none());
    }

    #[test]
    fn file_destination_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut destination = FileDestination(path.clone());
        let mut writer = destination.open("ignored.mp4", 10).unwrap().unwrap();
        writer.write_all(b"abc").unwrap();
        drop(writer);
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }
}
