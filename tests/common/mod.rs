//! Shared fixtures for the integration tests.
//!
//! Input files are synthesized with the crate's own MP4 writer, so no media
//! files or FFmpeg install are needed. The mock codecs emit their outputs
//! synchronously and record what the coordinator asked of them.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use upscaler::h264::{AvcConfig, DEFAULT_PPS, DEFAULT_SPS};
use upscaler::{
    AudioTrackOptions, CodecError, DecodedFrame, EncodedChunk, EncodedSample, JobEvent, Mp4Muxer,
    MuxTarget, MuxerOptions, PipelineConfig, RenderedFrame, ResampleRenderer, StageOutput,
    StatusListener, VideoDecoder, VideoDecoderConfig, VideoEncoder, VideoEncoderConfig,
    VideoTrackOptions,
};

pub const AUDIO_RATE: u32 = 48_000;
pub const AUDIO_FRAME_MICROS: i64 = 21_333;

/// Shape of a synthetic input file.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub frame_micros: i64,
    pub keyframe_interval: usize,
    pub audio_frames: usize,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            frames: 30,
            width: 16,
            height: 12,
            frame_micros: 40_000,
            keyframe_interval: 10,
            audio_frames: 0,
        }
    }
}

impl Fixture {
    pub fn with_audio(mut self, frames: usize) -> Self {
        self.audio_frames = frames;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros((self.frames as i64 * self.frame_micros) as u64)
    }

    pub fn video_samples(&self) -> Vec<EncodedSample> {
        (0..self.frames)
            .map(|i| {
                let key = i % self.keyframe_interval == 0;
                let mut data = vec![if key { 0x65 } else { 0x41 }, i as u8];
                data.resize(8 + i % 5, 0xA5);
                EncodedSample::new(data, i as i64 * self.frame_micros, self.frame_micros, key)
            })
            .collect()
    }

    pub fn audio_samples(&self) -> Vec<EncodedSample> {
        (0..self.audio_frames)
            .map(|i| {
                let data: Vec<u8> = (0..6 + i % 7).map(|b| (b * 31 + i) as u8).collect();
                EncodedSample::new(data, i as i64 * AUDIO_FRAME_MICROS, AUDIO_FRAME_MICROS, true)
            })
            .collect()
    }

    /// A fast-start MP4 with one H.264 track and optional AAC audio.
    pub fn build(&self) -> Vec<u8> {
        let options = MuxerOptions {
            video: VideoTrackOptions {
                codec: "avc1.42001e".to_string(),
                width: self.width,
                height: self.height,
            },
            audio: (self.audio_frames > 0).then(|| AudioTrackOptions {
                codec: "mp4a.40.2".to_string(),
                sample_rate: AUDIO_RATE,
                channel_count: 2,
                description: None,
            }),
        };
        let mut muxer = Mp4Muxer::new(MuxTarget::Memory, options).expect("fixture muxer");
        for (i, sample) in self.video_samples().into_iter().enumerate() {
            let chunk = EncodedChunk {
                sample,
                description: (i == 0).then(avc_record),
            };
            muxer.add_video_chunk(&chunk).expect("fixture video");
        }
        for sample in self.audio_samples() {
            muxer.add_audio_chunk(&sample).expect("fixture audio");
        }
        muxer
            .finalize()
            .expect("fixture finalize")
            .into_buffer()
            .expect("in-memory fixture")
    }

    pub fn decoder_config(&self) -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec: "avc1.42001e".to_string(),
            coded_width: self.width,
            coded_height: self.height,
            description: avc_record(),
        }
    }

    pub fn encoder_config(&self) -> VideoEncoderConfig {
        VideoEncoderConfig {
            codec: "avc1.42001f".to_string(),
            width: self.width * 2,
            height: self.height * 2,
            bitrate: 1_000_000,
            framerate: 25.0,
        }
    }
}

pub fn avc_record() -> bytes::Bytes {
    AvcConfig::new(DEFAULT_SPS.to_vec(), DEFAULT_PPS.to_vec()).to_record()
}

/// Replace every occurrence of `from` with `to` in place.
pub fn patch_fourcc(data: &mut [u8], from: &[u8; 4], to: &[u8; 4]) {
    let mut i = 0;
    while i + 4 <= data.len() {
        if &data[i..i + 4] == from {
            data[i..i + 4].copy_from_slice(to);
            i += 4;
        } else {
            i += 1;
        }
    }
}

// ── mock codecs ────────────────────────────────────────────────────

/// What the coordinator did to the mock codecs.
#[derive(Debug, Default)]
pub struct StageStats {
    pub decoder_configured: bool,
    pub decode_submitted: usize,
    pub decoder_flushes: usize,
    pub decoder_closed: bool,
    pub encoder_config: Option<VideoEncoderConfig>,
    pub encode_submitted: usize,
    pub encoded_emitted: usize,
    pub encoder_flushes: usize,
    pub encoder_closed: bool,
    /// Encode calls answered with "closed".
    pub encode_rejected: usize,
    pub key_frames_requested: usize,
    /// Largest `decode_submitted - encoded_emitted` seen at a decode call.
    pub max_in_flight: usize,
}

pub type SharedStats = Rc<RefCell<StageStats>>;

pub fn shared_stats() -> SharedStats {
    Rc::new(RefCell::new(StageStats::default()))
}

/// Decoder that turns each sample into a solid-color frame.
pub struct MockDecoder {
    stats: SharedStats,
    output: Option<StageOutput<DecodedFrame>>,
    size: (u32, u32),
    held: VecDeque<EncodedSample>,
    /// Frames kept back until a flush.
    pub hold_back: usize,
    /// Never emit anything, even on flush.
    pub silent: bool,
    /// Fail the submission of this sample index.
    pub fail_at: Option<usize>,
    /// Report "closed" from this sample index on.
    pub closed_at: Option<usize>,
}

impl MockDecoder {
    pub fn new(stats: SharedStats) -> Self {
        Self {
            stats,
            output: None,
            size: (0, 0),
            held: VecDeque::new(),
            hold_back: 0,
            silent: false,
            fail_at: None,
            closed_at: None,
        }
    }

    fn emit_front(&mut self) {
        if let (Some(sample), Some(output)) = (self.held.pop_front(), &self.output) {
            let (w, h) = self.size;
            let shade = sample.data.get(1).copied().unwrap_or(0);
            let image = RgbaImage::from_pixel(w, h, Rgba([shade, 0x40, 0x80, 0xFF]));
            output.emit(DecodedFrame::new(image, &sample));
        }
    }
}

impl VideoDecoder for MockDecoder {
    fn configure(&mut self, config: &VideoDecoderConfig, output: StageOutput<DecodedFrame>) -> Result<(), CodecError> {
        self.size = (config.coded_width, config.coded_height);
        self.output = Some(output);
        self.stats.borrow_mut().decoder_configured = true;
        Ok(())
    }

    fn decode(&mut self, sample: &EncodedSample) -> Result<(), CodecError> {
        let index = self.stats.borrow().decode_submitted;
        if self.closed_at.is_some_and(|at| index >= at) {
            return Err(CodecError::Closed);
        }
        if self.fail_at == Some(index) {
            return Err(CodecError::Fault("corrupt slice".to_string()));
        }
        {
            let mut stats = self.stats.borrow_mut();
            stats.decode_submitted += 1;
            let in_flight = stats.decode_submitted - stats.encoded_emitted;
            stats.max_in_flight = stats.max_in_flight.max(in_flight);
        }
        if self.silent {
            return Ok(());
        }
        self.held.push_back(sample.clone());
        while self.held.len() > self.hold_back {
            self.emit_front();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.stats.borrow_mut().decoder_flushes += 1;
        if !self.silent {
            while !self.held.is_empty() {
                self.emit_front();
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.output = None;
        self.stats.borrow_mut().decoder_closed = true;
    }
}

/// Encoder that emits one chunk per frame, describing the stream on the
/// first one.
pub struct MockEncoder {
    stats: SharedStats,
    output: Option<StageOutput<EncodedChunk>>,
    held: VecDeque<EncodedChunk>,
    described: bool,
    /// Chunks kept back until a flush.
    pub hold_back: usize,
    /// Fail the submission of this frame index.
    pub fail_at: Option<usize>,
    /// Report an asynchronous error instead of this frame's chunk.
    pub async_fail_at: Option<usize>,
    /// Report "closed" from this frame index on.
    pub closed_at: Option<usize>,
}

impl MockEncoder {
    pub fn new(stats: SharedStats) -> Self {
        Self {
            stats,
            output: None,
            held: VecDeque::new(),
            described: false,
            hold_back: 0,
            fail_at: None,
            async_fail_at: None,
            closed_at: None,
        }
    }

    fn emit_front(&mut self) {
        if let (Some(chunk), Some(output)) = (self.held.pop_front(), &self.output) {
            self.stats.borrow_mut().encoded_emitted += 1;
            output.emit(chunk);
        }
    }
}

impl VideoEncoder for MockEncoder {
    fn configure(&mut self, config: &VideoEncoderConfig, output: StageOutput<EncodedChunk>) -> Result<(), CodecError> {
        self.output = Some(output);
        self.stats.borrow_mut().encoder_config = Some(config.clone());
        Ok(())
    }

    fn encode(&mut self, frame: &RenderedFrame, key_frame: bool) -> Result<(), CodecError> {
        if self.closed_at.is_some_and(|at| self.stats.borrow().encode_submitted >= at) {
            self.stats.borrow_mut().encode_rejected += 1;
            return Err(CodecError::Closed);
        }
        let index = {
            let mut stats = self.stats.borrow_mut();
            stats.encode_submitted += 1;
            if key_frame {
                stats.key_frames_requested += 1;
            }
            stats.encode_submitted - 1
        };
        if self.fail_at == Some(index) {
            return Err(CodecError::Fault("encoder out of memory".to_string()));
        }
        if self.async_fail_at == Some(index) {
            if let Some(output) = &self.output {
                output.fail("hardware encoder reset");
            }
            return Ok(());
        }
        let (w, h) = frame.image().dimensions();
        let mut data = vec![0, 0, 0, 4, if key_frame { 0x65 } else { 0x41 }];
        data.extend_from_slice(&[(index % 256) as u8, (w % 256) as u8, (h % 256) as u8]);
        let description = (!self.described).then(avc_record);
        self.described = true;
        self.held.push_back(EncodedChunk {
            sample: EncodedSample::new(data, frame.timestamp(), frame.duration(), key_frame),
            description,
        });
        while self.held.len() > self.hold_back {
            self.emit_front();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.stats.borrow_mut().encoder_flushes += 1;
        while !self.held.is_empty() {
            self.emit_front();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.output = None;
        self.stats.borrow_mut().encoder_closed = true;
    }
}

pub fn renderer() -> ResampleRenderer {
    ResampleRenderer::with_network("nearest").expect("nearest filter")
}

// ── status events ──────────────────────────────────────────────────

pub struct EventLog {
    rx: UnboundedReceiver<JobEvent>,
}

impl EventLog {
    pub fn drain(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A listener that records events, and the log to read them from.
pub fn event_log() -> (Arc<dyn StatusListener>, EventLog) {
    let (tx, rx) = unbounded_channel();
    (Arc::new(tx), EventLog { rx })
}

pub fn test_config(listener: Arc<dyn StatusListener>) -> PipelineConfig {
    PipelineConfig::new().with_listener(listener)
}

pub fn errors(events: &[JobEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Error(message) => Some(message.as_str()),
            _ => None,
        })
        .collect()
}
