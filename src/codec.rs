//! Decoder and encoder stage interfaces.
//!
//! Codecs are asynchronous: a submission returns immediately and the result
//! arrives later, possibly after further submissions. Each stage therefore
//! gets a [`StageOutput`] when it is configured, and the coordinator reads
//! results from the matching [`CompletionQueue`] in arrival order. The k-th
//! output belongs to the k-th submission.

use std::fmt::{Display, Formatter, Result as FmtResult};

use bytes::Bytes;
use image::RgbaImage;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::codec_config::VideoDecoderConfig;
use crate::error::{Result, UpscaleError};
use crate::metadata::EncodedSample;

/// Pipeline stage, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The video decoder.
    Decoder,
    /// The video encoder.
    Encoder,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Stage::Decoder => write!(f, "decoder"),
            Stage::Encoder => write!(f, "encoder"),
        }
    }
}

/// A synchronous submission failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The instance was already closed. Expected after shutdown.
    Closed,
    /// A genuine failure.
    Fault(String),
}

impl CodecError {
    /// Whether this is the expected "already closed" error.
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }

    /// Turn into a pipeline error for `stage`.
    pub fn into_pipeline_error(self, stage: Stage) -> UpscaleError {
        match self {
            CodecError::Closed => UpscaleError::CodecClosed(stage),
            CodecError::Fault(message) => UpscaleError::CodecFault { stage, message },
        }
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CodecError::Closed => write!(f, "cannot call method on a closed codec"),
            CodecError::Fault(message) => write!(f, "{message}"),
        }
    }
}

/// A decoded picture and its timing.
///
/// Not `Clone`: a frame has exactly one owner and is released by dropping it.
#[derive(Debug)]
pub struct DecodedFrame {
    /// Decoded pixels.
    pub image: RgbaImage,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Duration in microseconds.
    pub duration: i64,
}

impl DecodedFrame {
    /// Frame with the timing of the sample it was decoded from.
    pub fn new(image: RgbaImage, sample: &EncodedSample) -> Self {
        Self {
            image,
            timestamp: sample.timestamp,
            duration: sample.duration,
        }
    }

    /// Width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// An upscaled picture carrying the timing of its source frame.
#[derive(Debug)]
pub struct RenderedFrame {
    image: RgbaImage,
    timestamp: i64,
    duration: i64,
}

impl RenderedFrame {
    /// Wrap renderer output for `source`.
    ///
    /// Fails with [`UpscaleError::ScaleMismatch`] unless `image` is exactly
    /// `scale` times the source dimensions.
    pub fn from_source(image: RgbaImage, source: &DecodedFrame, scale: u32) -> Result<Self> {
        let (w, h) = source.dimensions();
        let expected = (w * scale, h * scale);
        if image.dimensions() != expected {
            return Err(UpscaleError::ScaleMismatch {
                expected,
                actual: image.dimensions(),
            });
        }
        Ok(Self {
            image,
            timestamp: source.timestamp,
            duration: source.duration,
        })
    }

    /// Upscaled pixels.
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Presentation timestamp in microseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Duration in microseconds.
    pub fn duration(&self) -> i64 {
        self.duration
    }
}

/// One encoder output.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Encoded payload and timing.
    pub sample: EncodedSample,
    /// Decoder configuration published by the encoder, usually only on the
    /// first chunk.
    pub description: Option<Bytes>,
}

/// Encoder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncoderConfig {
    /// Codec string, e.g. `"avc1.42001f"`.
    pub codec: String,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    /// Nominal frame rate.
    pub framerate: f64,
}

/// What a stage delivers through its queue.
#[derive(Debug)]
pub enum StageEvent<T> {
    /// The next output.
    Output(T),
    /// An asynchronous fatal error.
    Error(String),
}

/// Producer half of a completion queue, handed to a codec on configure.
#[derive(Debug)]
pub struct StageOutput<T> {
    tx: UnboundedSender<StageEvent<T>>,
}

impl<T> Clone for StageOutput<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StageOutput<T> {
    /// Deliver the next output. Outputs sent after the coordinator has gone
    /// away are discarded.
    pub fn emit(&self, item: T) {
        let _ = self.tx.send(StageEvent::Output(item));
    }

    /// Report an asynchronous fatal error.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(StageEvent::Error(message.into()));
    }
}

/// Consumer half of a completion queue.
#[derive(Debug)]
pub struct CompletionQueue<T> {
    rx: UnboundedReceiver<StageEvent<T>>,
}

impl<T> CompletionQueue<T> {
    /// Wait for the next event. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<StageEvent<T>> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StageEvent<T>> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a connected output/queue pair.
pub fn completion_queue<T>() -> (StageOutput<T>, CompletionQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StageOutput { tx }, CompletionQueue { rx })
}

/// A video decoder.
///
/// Decoded frames go to the [`StageOutput`] passed to
/// [`configure`](VideoDecoder::configure), one per submitted sample, in
/// submission order. A decoder may hold frames back until
/// [`flush`](VideoDecoder::flush) is called.
pub trait VideoDecoder {
    /// Prepare the decoder. Called once before any sample.
    fn configure(
        &mut self,
        config: &VideoDecoderConfig,
        output: StageOutput<DecodedFrame>,
    ) -> std::result::Result<(), CodecError>;

    /// Submit one sample.
    fn decode(&mut self, sample: &EncodedSample) -> std::result::Result<(), CodecError>;

    /// Emit every buffered frame. Decoding may continue afterwards.
    fn flush(&mut self) -> std::result::Result<(), CodecError>;

    /// Release the decoder. Later submissions fail with [`CodecError::Closed`].
    fn close(&mut self);
}

/// A video encoder.
///
/// Chunks go to the [`StageOutput`] passed to
/// [`configure`](VideoEncoder::configure) in submission order.
pub trait VideoEncoder {
    /// Prepare the encoder. Called once before any frame.
    fn configure(
        &mut self,
        config: &VideoEncoderConfig,
        output: StageOutput<EncodedChunk>,
    ) -> std::result::Result<(), CodecError>;

    /// Submit one frame, forcing a key frame when `key_frame` is set.
    fn encode(&mut self, frame: &RenderedFrame, key_frame: bool) -> std::result::Result<(), CodecError>;

    /// Emit every buffered chunk.
    fn flush(&mut self) -> std::result::Result<(), CodecError>;

    /// Release the encoder. Later submissions fail with [`CodecError::Closed`].
    fn close(&mut self);
}
