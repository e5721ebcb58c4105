//! Decode → render → encode coordinator.
//!
//! [`Coordinator`] pushes the video samples of one job through the three
//! stages in input order while keeping at most `window` samples between
//! decode submission and encode completion. Completions are matched to
//! submissions through FIFO [`CompletionQueue`]s. Both waits run against a
//! stall alarm: a stalled decoder is flushed near the end of the stream, a
//! stalled encoder is flushed once every frame has been submitted, and the
//! run fails once consecutive recoveries are used up.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use upscaler::{
//!     Coordinator, EncodedChunk, MediaKind, PipelineConfig, ResampleRenderer,
//!     VideoDecoder, VideoEncoder, VideoEncoderConfig,
//!     demux::{DEFAULT_BATCH_SIZE, extract_track},
//! };
//!
//! async fn upscale(
//!     decoder: &mut impl VideoDecoder,
//!     encoder: &mut impl VideoEncoder,
//!     data: Vec<u8>,
//!     encoder_config: VideoEncoderConfig,
//! ) -> upscaler::Result<Vec<EncodedChunk>> {
//!     let video = extract_track(data, MediaKind::Video, Duration::from_secs(10), DEFAULT_BATCH_SIZE)?;
//!     let decoder_config = video.config.as_video().cloned().unwrap();
//!     let mut renderer = ResampleRenderer::new();
//!     let config = PipelineConfig::new();
//!     let mut chunks = Vec::new();
//!     Coordinator::new(decoder, encoder, &mut renderer, &config)
//!         .run(&decoder_config, &encoder_config, &video.samples, Duration::from_secs(10), &mut chunks)
//!         .await?;
//!     Ok(chunks)
//! }
//! ```

use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::codec::{
    CodecError, CompletionQueue, DecodedFrame, EncodedChunk, RenderedFrame, Stage, StageEvent,
    StageOutput, VideoDecoder, VideoEncoder, VideoEncoderConfig, completion_queue,
};
use crate::codec_config::VideoDecoderConfig;
use crate::config::PipelineConfig;
use crate::error::{Result, UpscaleError};
use crate::metadata::EncodedSample;
use crate::progress::{JobEvent, ProgressTracker};
use crate::upscale::FrameRenderer;
use crate::watchdog::{Alarm, Watchdog};

/// Destination for encoded video chunks, in arrival order.
pub trait VideoChunkSink {
    /// Accept the next chunk.
    fn push_video_chunk(&mut self, chunk: EncodedChunk) -> Result<()>;
}

impl VideoChunkSink for Vec<EncodedChunk> {
    fn push_video_chunk(&mut self, chunk: EncodedChunk) -> Result<()> {
        self.push(chunk);
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames encoded.
    pub frames: usize,
    /// Forced stall recoveries across both stages.
    pub stall_recoveries: u32,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Drives one video track through decode, render and encode.
pub struct Coordinator<'a, D, E, R> {
    decoder: &'a mut D,
    encoder: &'a mut E,
    renderer: &'a mut R,
    config: &'a PipelineConfig,
}

impl<'a, D, E, R> Coordinator<'a, D, E, R>
where
    D: VideoDecoder,
    E: VideoEncoder,
    R: FrameRenderer,
{
    /// Borrow the stages for one run.
    pub fn new(decoder: &'a mut D, encoder: &'a mut E, renderer: &'a mut R, config: &'a PipelineConfig) -> Self {
        Self {
            decoder,
            encoder,
            renderer,
            config,
        }
    }

    /// Configure both codecs and process every sample.
    ///
    /// Chunks reach `sink` in encoder output order, which is input order.
    /// Both codecs are closed when this returns, on success and on failure.
    ///
    /// # Errors
    ///
    /// Codec faults, renderer failures, stalls that outlast
    /// [`PipelineConfig::max_stall_recoveries`], missing outputs, and sink
    /// errors all abort the run.
    pub async fn run<S: VideoChunkSink>(
        self,
        decoder_config: &VideoDecoderConfig,
        encoder_config: &VideoEncoderConfig,
        samples: &[EncodedSample],
        duration: Duration,
        sink: &mut S,
    ) -> Result<PipelineStats> {
        self.config.validate()?;

        let (decoded_out, decoded) = completion_queue();
        let (encoded_out, encoded) = completion_queue();

        let mut session = Session {
            decoder: self.decoder,
            encoder: self.encoder,
            renderer: self.renderer,
            config: self.config,
            samples,
            decoded,
            encoded,
            decoder_closed: false,
            encoder_closed: false,
            state: PipelineState::new(self.config),
            tracker: ProgressTracker::new(duration),
        };

        let result = match session.configure(decoder_config, decoded_out, encoder_config, encoded_out) {
            Ok(()) => session.drive(sink).await,
            Err(e) => Err(e),
        };
        session.encoder.close();
        session.decoder.close();

        let stats = result?;
        log::info!(
            "pipeline finished {} frames in {:.2?} ({} stall recoveries)",
            stats.frames,
            stats.elapsed,
            stats.stall_recoveries
        );
        Ok(stats)
    }
}

/// Per-run bookkeeping.
struct PipelineState {
    /// Next sample index to submit for decoding.
    next_decode: usize,
    /// Decoded frames received.
    decoded: usize,
    /// Frames submitted for encoding.
    encode_submitted: usize,
    /// Chunks received from the encoder.
    encode_completed: usize,
    /// Last decode completion, for the per-frame throttle.
    last_decode: Instant,
    /// Decoder activity.
    decode_watch: Watchdog,
    /// Encoder activity.
    encode_watch: Watchdog,
    progress: u8,
}

impl PipelineState {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            next_decode: 0,
            decoded: 0,
            encode_submitted: 0,
            encode_completed: 0,
            last_decode: Instant::now(),
            decode_watch: Watchdog::new(config),
            encode_watch: Watchdog::new(config),
            progress: 0,
        }
    }

    fn in_flight(&self) -> usize {
        self.next_decode - self.encode_completed
    }
}

struct Session<'a, D, E, R> {
    decoder: &'a mut D,
    encoder: &'a mut E,
    renderer: &'a mut R,
    config: &'a PipelineConfig,
    samples: &'a [EncodedSample],
    decoded: CompletionQueue<DecodedFrame>,
    encoded: CompletionQueue<EncodedChunk>,
    decoder_closed: bool,
    encoder_closed: bool,
    state: PipelineState,
    tracker: ProgressTracker,
}

impl<D, E, R> Session<'_, D, E, R>
where
    D: VideoDecoder,
    E: VideoEncoder,
    R: FrameRenderer,
{
    fn configure(
        &mut self,
        decoder_config: &VideoDecoderConfig,
        decoded_out: StageOutput<DecodedFrame>,
        encoder_config: &VideoEncoderConfig,
        encoded_out: StageOutput<EncodedChunk>,
    ) -> Result<()> {
        self.encoder
            .configure(encoder_config, encoded_out)
            .map_err(|e| e.into_pipeline_error(Stage::Encoder))?;
        self.decoder
            .configure(decoder_config, decoded_out)
            .map_err(|e| e.into_pipeline_error(Stage::Decoder))?;
        log::debug!(
            "configured {} decoder and {} encoder at {}x{}, {} bit/s",
            decoder_config.codec,
            encoder_config.codec,
            encoder_config.width,
            encoder_config.height,
            encoder_config.bitrate
        );
        Ok(())
    }

    async fn drive<S: VideoChunkSink>(&mut self, sink: &mut S) -> Result<PipelineStats> {
        let total = self.samples.len();
        let window = self.config.window;

        while self.state.next_decode < total.min(window) {
            self.submit_decode()?;
        }

        for index in 0..total {
            while self.state.next_decode <= index {
                self.make_room(sink).await?;
            }

            let frame = self.await_decoded(index).await?;
            let image = self.renderer.render(&frame).await?;
            self.renderer.wait_for_idle().await?;
            self.throttle().await;

            let rendered = RenderedFrame::from_source(image, &frame, self.renderer.scale_factor())?;
            self.report_progress(frame.timestamp);
            self.submit_encode(&rendered, self.samples[index].key_frame)?;
            drop(frame);
            drop(rendered);

            self.drain_encoded(sink)?;
            while self.state.next_decode < total && self.state.in_flight() < window {
                self.submit_decode()?;
            }
        }

        self.state.encode_watch.touch();
        while self.state.encode_completed < total {
            self.await_encoded(sink, true).await?;
        }
        self.finish(sink).await?;

        Ok(PipelineStats {
            frames: self.state.encode_completed,
            stall_recoveries: self.state.decode_watch.total_recoveries()
                + self.state.encode_watch.total_recoveries(),
            elapsed: self.tracker.elapsed(),
        })
    }

    /// Submit the next sample. A closed decoder keeps its slot but receives
    /// nothing.
    fn submit_decode(&mut self) -> Result<()> {
        let samples = self.samples;
        let sample = &samples[self.state.next_decode];
        self.state.next_decode += 1;
        if self.decoder_closed {
            return Ok(());
        }
        match self.decoder.decode(sample) {
            Ok(()) => {
                self.state.decode_watch.touch();
                Ok(())
            }
            Err(e) => self.decoder_failed(e),
        }
    }

    fn submit_encode(&mut self, frame: &RenderedFrame, key_frame: bool) -> Result<()> {
        self.state.encode_submitted += 1;
        if self.encoder_closed {
            return Ok(());
        }
        match self.encoder.encode(frame, key_frame) {
            Ok(()) => Ok(()),
            Err(e) => self.encoder_failed(e),
        }
    }

    fn decoder_failed(&mut self, error: CodecError) -> Result<()> {
        self.decoder_closed = true;
        if error.is_closed() {
            log::debug!("decoder already closed, submission skipped");
            return Ok(());
        }
        Err(error.into_pipeline_error(Stage::Decoder))
    }

    fn encoder_failed(&mut self, error: CodecError) -> Result<()> {
        self.encoder_closed = true;
        if error.is_closed() {
            log::debug!("encoder already closed, submission skipped");
            return Ok(());
        }
        Err(error.into_pipeline_error(Stage::Encoder))
    }

    fn flush_decoder(&mut self) -> Result<()> {
        if self.decoder_closed {
            return Ok(());
        }
        match self.decoder.flush() {
            Ok(()) => Ok(()),
            Err(e) => self.decoder_failed(e),
        }
    }

    fn flush_encoder(&mut self) -> Result<()> {
        if self.encoder_closed {
            return Ok(());
        }
        match self.encoder.flush() {
            Ok(()) => Ok(()),
            Err(e) => self.encoder_failed(e),
        }
    }

    async fn await_decoded(&mut self, index: usize) -> Result<DecodedFrame> {
        let total = self.samples.len();
        loop {
            tokio::select! {
                biased;
                event = self.decoded.recv() => {
                    match event {
                        Some(StageEvent::Output(frame)) => {
                            self.state.decoded += 1;
                            self.state.last_decode = Instant::now();
                            self.state.decode_watch.touch();
                            let expected = self.samples[index].timestamp;
                            if frame.timestamp != expected {
                                log::debug!(
                                    "frame {index} decoded with timestamp {} (sample has {expected})",
                                    frame.timestamp
                                );
                            }
                            return Ok(frame);
                        }
                        Some(StageEvent::Error(message)) => {
                            self.decoder_closed = true;
                            return Err(UpscaleError::CodecFault { stage: Stage::Decoder, message });
                        }
                        None => return Err(self.decoder_dropped()),
                    }
                }
                _ = self.state.decode_watch.tick() => {
                    if self.decoder_closed {
                        return Err(self.decoder_dropped());
                    }
                    match self.state.decode_watch.check() {
                        Alarm::Quiet => {}
                        Alarm::Stalled if total - index < self.config.decoder_flush_threshold => {
                            log::warn!("decoder stalled with {} samples left, flushing", total - index);
                            self.flush_decoder()?;
                        }
                        Alarm::Stalled => {
                            log::debug!("decoder idle while awaiting frame {index}");
                        }
                        Alarm::Exhausted { attempts } => {
                            return Err(UpscaleError::Stalled {
                                stage: Stage::Decoder,
                                pending: self.state.next_decode - self.state.decoded,
                                attempts,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Wait for one encoder event. Forced flushes only happen in the final
    /// phase, after every frame has been submitted.
    async fn await_encoded<S: VideoChunkSink>(&mut self, sink: &mut S, final_phase: bool) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                event = self.encoded.recv() => {
                    return match event {
                        Some(event) => self.handle_encoded(event, sink),
                        None => Err(self.encoder_dropped()),
                    };
                }
                _ = self.state.encode_watch.tick() => {
                    if self.encoder_closed {
                        return Err(self.encoder_dropped());
                    }
                    match self.state.encode_watch.check() {
                        Alarm::Quiet => {}
                        Alarm::Stalled if final_phase => {
                            log::warn!(
                                "encoder stalled with {} chunks outstanding, flushing",
                                self.state.encode_submitted - self.state.encode_completed
                            );
                            self.flush_encoder()?;
                        }
                        Alarm::Stalled => {
                            log::debug!("encoder idle with a full window");
                        }
                        Alarm::Exhausted { attempts } => {
                            return Err(UpscaleError::Stalled {
                                stage: Stage::Encoder,
                                pending: self.state.encode_submitted - self.state.encode_completed,
                                attempts,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Wait for encode completions until the window has room, then submit.
    async fn make_room<S: VideoChunkSink>(&mut self, sink: &mut S) -> Result<()> {
        while self.state.in_flight() >= self.config.window {
            self.await_encoded(sink, false).await?;
        }
        self.submit_decode()
    }

    fn handle_encoded<S: VideoChunkSink>(&mut self, event: StageEvent<EncodedChunk>, sink: &mut S) -> Result<()> {
        match event {
            StageEvent::Output(chunk) => {
                self.state.encode_completed += 1;
                self.state.encode_watch.touch();
                if self.state.encode_completed > self.samples.len() {
                    return Err(UpscaleError::FramesDropped {
                        stage: Stage::Encoder,
                        expected: self.samples.len(),
                        received: self.state.encode_completed,
                    });
                }
                sink.push_video_chunk(chunk)
            }
            StageEvent::Error(message) => {
                self.encoder_closed = true;
                Err(UpscaleError::CodecFault {
                    stage: Stage::Encoder,
                    message,
                })
            }
        }
    }

    fn drain_encoded<S: VideoChunkSink>(&mut self, sink: &mut S) -> Result<()> {
        while let Some(event) = self.encoded.try_recv() {
            self.handle_encoded(event, sink)?;
        }
        Ok(())
    }

    async fn throttle(&self) {
        let since = self.state.last_decode.elapsed();
        if since < self.config.frame_budget {
            sleep(self.config.frame_budget - since).await;
        }
    }

    fn report_progress(&mut self, timestamp: i64) {
        self.config.emit(JobEvent::Eta(self.tracker.eta(timestamp)));
        self.state.progress = self.tracker.percent(timestamp);
        self.config.emit(JobEvent::Progress(self.state.progress));
    }

    /// Final encoder flush. Anything it produces beyond the expected count
    /// is an error, as are decoded frames nobody asked for.
    async fn finish<S: VideoChunkSink>(&mut self, sink: &mut S) -> Result<()> {
        self.flush_encoder()?;
        tokio::task::yield_now().await;
        self.drain_encoded(sink)?;

        let mut extra = 0;
        while let Some(event) = self.decoded.try_recv() {
            if let StageEvent::Output(_) = event {
                extra += 1;
            }
        }
        if extra > 0 {
            return Err(UpscaleError::FramesDropped {
                stage: Stage::Decoder,
                expected: self.samples.len(),
                received: self.state.decoded + extra,
            });
        }
        Ok(())
    }

    fn decoder_dropped(&self) -> UpscaleError {
        UpscaleError::FramesDropped {
            stage: Stage::Decoder,
            expected: self.state.next_decode,
            received: self.state.decoded,
        }
    }

    fn encoder_dropped(&self) -> UpscaleError {
        UpscaleError::FramesDropped {
            stage: Stage::Encoder,
            expected: self.state.encode_submitted,
            received: self.state.encode_completed,
        }
    }
}
