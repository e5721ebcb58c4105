//! FFmpeg-backed decoder and encoder stages.
//!
//! [`FfmpegDecoder`] and [`FfmpegEncoder`] implement the
//! [`VideoDecoder`] and [`VideoEncoder`] stage traits on top of
//! `ffmpeg-next`. FFmpeg codecs are synchronous, so every submission drains
//! whatever output is ready and emits it on the stage's queue before
//! returning.
//!
//! FFmpeg also has its own console logging, separate from the Rust
//! [`log`](https://crates.io/crates/log) facade. [`set_ffmpeg_log_level`]
//! tunes it without importing `ffmpeg-next` directly.
//!
//! ```no_run
//! use upscaler::FfmpegLogLevel;
//!
//! upscaler::set_ffmpeg_log_level(FfmpegLogLevel::Error);
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use ffmpeg_next::codec::Id;
use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::util::log::Level;
use ffmpeg_next::{Dictionary, Packet, Rational};
use image::RgbaImage;

use crate::codec::{
    CodecError, DecodedFrame, EncodedChunk, RenderedFrame, StageOutput, VideoDecoder, VideoEncoder,
    VideoEncoderConfig,
};
use crate::codec_config::VideoDecoderConfig;
use crate::h264::{AvcConfig, annexb_to_avcc, is_annexb};
use crate::metadata::EncodedSample;
use crate::utilities::{frame_to_packed_buffer, packed_buffer_to_frame};

const MICROS: Rational = Rational(1, 1_000_000);

/// FFmpeg internal log verbosity level, most verbose last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfmpegLogLevel {
    /// Print no output at all.
    Quiet,
    /// Only conditions that abort the process.
    Panic,
    /// Only unrecoverable errors.
    Fatal,
    /// Recoverable errors.
    Error,
    /// Warnings (FFmpeg's default).
    Warning,
    /// Informational messages.
    Info,
    /// Verbose informational messages.
    Verbose,
    /// Debugging messages.
    Debug,
    /// Extremely verbose tracing output.
    Trace,
}

impl FfmpegLogLevel {
    fn to_ffmpeg_level(self) -> Level {
        match self {
            FfmpegLogLevel::Quiet => Level::Quiet,
            FfmpegLogLevel::Panic => Level::Panic,
            FfmpegLogLevel::Fatal => Level::Fatal,
            FfmpegLogLevel::Error => Level::Error,
            FfmpegLogLevel::Warning => Level::Warning,
            FfmpegLogLevel::Info => Level::Info,
            FfmpegLogLevel::Verbose => Level::Verbose,
            FfmpegLogLevel::Debug => Level::Debug,
            FfmpegLogLevel::Trace => Level::Trace,
        }
    }

    fn from_ffmpeg_level(level: Level) -> Self {
        match level {
            Level::Quiet => FfmpegLogLevel::Quiet,
            Level::Panic => FfmpegLogLevel::Panic,
            Level::Fatal => FfmpegLogLevel::Fatal,
            Level::Error => FfmpegLogLevel::Error,
            Level::Warning => FfmpegLogLevel::Warning,
            Level::Info => FfmpegLogLevel::Info,
            Level::Verbose => FfmpegLogLevel::Verbose,
            Level::Debug => FfmpegLogLevel::Debug,
            Level::Trace => FfmpegLogLevel::Trace,
        }
    }
}

/// Set FFmpeg's own console verbosity. Rust-side `log` output is unaffected.
pub fn set_ffmpeg_log_level(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level.to_ffmpeg_level());
}

/// Current FFmpeg console verbosity, if it maps to a known level.
pub fn get_ffmpeg_log_level() -> Option<FfmpegLogLevel> {
    ffmpeg_next::util::log::get_level()
        .ok()
        .map(FfmpegLogLevel::from_ffmpeg_level)
}

fn fault(context: &str, error: impl std::fmt::Display) -> CodecError {
    CodecError::Fault(format!("{context}: {error}"))
}

fn codec_id(codec: &str) -> Option<Id> {
    match codec.get(..4)? {
        "avc1" | "avc3" => Some(Id::H264),
        "hvc1" | "hev1" => Some(Id::HEVC),
        "vp09" => Some(Id::VP9),
        "av01" => Some(Id::AV1),
        _ => None,
    }
}

/// Copy `data` into freshly allocated, padded codec extradata.
///
/// # Safety
///
/// `context` must point to a valid, unopened codec context.
unsafe fn set_extradata(
    context: *mut ffmpeg_sys_next::AVCodecContext,
    data: &[u8],
) -> Result<(), CodecError> {
    let padded = data.len() + ffmpeg_sys_next::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    // SAFETY: the buffer is zeroed and large enough for `data` plus padding,
    // and FFmpeg takes ownership of it through the context.
    unsafe {
        let buffer = ffmpeg_sys_next::av_mallocz(padded).cast::<u8>();
        if buffer.is_null() {
            return Err(CodecError::Fault("cannot allocate codec extradata".to_string()));
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), buffer, data.len());
        (*context).extradata = buffer;
        (*context).extradata_size = data.len() as i32;
        (*context).pkt_timebase = MICROS.into();
    }
    Ok(())
}

struct DecoderState {
    decoder: ffmpeg_next::decoder::Video,
    scaler: Option<(ScalingContext, Pixel, u32, u32)>,
    durations: HashMap<i64, i64>,
    output: StageOutput<DecodedFrame>,
}

impl DecoderState {
    fn drain(&mut self) -> Result<(), CodecError> {
        let mut decoded = VideoFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let frame = self.convert(&decoded)?;
            self.output.emit(frame);
        }
        Ok(())
    }

    fn convert(&mut self, decoded: &VideoFrame) -> Result<DecodedFrame, CodecError> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|(_, f, w, h)| (*f, *w, *h) != (format, width, height));
        if stale {
            let scaler = ScalingContext::get(format, width, height, Pixel::RGBA, width, height, ScalingFlags::BILINEAR)
                .map_err(|e| fault("cannot create scaler", e))?;
            self.scaler = Some((scaler, format, width, height));
        }
        let mut rgba = VideoFrame::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(decoded, &mut rgba).map_err(|e| fault("scaling failed", e))?;
        }
        let image = RgbaImage::from_raw(width, height, frame_to_packed_buffer(&rgba, width, height, 4))
            .ok_or_else(|| CodecError::Fault("decoded frame has the wrong size".to_string()))?;
        let timestamp = decoded.timestamp().or(decoded.pts()).unwrap_or(0);
        let duration = self.durations.remove(&timestamp).unwrap_or(0);
        Ok(DecodedFrame {
            image,
            timestamp,
            duration,
        })
    }
}

/// Software video decoder for H.264, HEVC, VP9 and AV1 samples.
#[derive(Default)]
pub struct FfmpegDecoder {
    state: Option<DecoderState>,
}

impl FfmpegDecoder {
    /// An unconfigured decoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn configure(&mut self, config: &VideoDecoderConfig, output: StageOutput<DecodedFrame>) -> Result<(), CodecError> {
        ffmpeg_next::init().map_err(|e| fault("cannot initialise FFmpeg", e))?;
        let id = codec_id(&config.codec)
            .ok_or_else(|| CodecError::Fault(format!("unsupported codec {}", config.codec)))?;
        let codec = ffmpeg_next::decoder::find(id)
            .ok_or_else(|| CodecError::Fault(format!("no FFmpeg decoder for {}", config.codec)))?;
        let mut context = CodecContext::new_with_codec(codec);
        // SAFETY: the context was just created and is not opened yet.
        unsafe { set_extradata(context.as_mut_ptr(), &config.description)? };
        let decoder = context.decoder().video().map_err(|e| fault("cannot open decoder", e))?;
        log::debug!(
            "FFmpeg decoder for {} at {}x{}",
            config.codec,
            config.coded_width,
            config.coded_height
        );
        self.state = Some(DecoderState {
            decoder,
            scaler: None,
            durations: HashMap::new(),
            output,
        });
        Ok(())
    }

    fn decode(&mut self, sample: &EncodedSample) -> Result<(), CodecError> {
        let state = self.state.as_mut().ok_or(CodecError::Closed)?;
        let mut packet = Packet::copy(&sample.data);
        packet.set_pts(Some(sample.timestamp));
        packet.set_dts(Some(sample.decode_timestamp));
        if sample.key_frame {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        state.durations.insert(sample.timestamp, sample.duration);
        state.decoder.send_packet(&packet).map_err(|e| fault("decode failed", e))?;
        state.drain()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        let state = self.state.as_mut().ok_or(CodecError::Closed)?;
        state.decoder.send_eof().map_err(|e| fault("flush failed", e))?;
        state.drain()?;
        // Reset so decoding can continue after a forced flush.
        state.decoder.flush();
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }
}

struct EncoderState {
    encoder: ffmpeg_next::encoder::video::Encoder,
    scaler: ScalingContext,
    width: u32,
    height: u32,
    durations: HashMap<i64, i64>,
    description: Option<Bytes>,
    flushed: bool,
    output: StageOutput<EncodedChunk>,
}

impl EncoderState {
    fn drain(&mut self) {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            let Some(data) = packet.data() else {
                continue;
            };
            let data = if is_annexb(data) { annexb_to_avcc(data) } else { data.to_vec() };
            let timestamp = packet.pts().unwrap_or(0);
            let duration = self.durations.remove(&timestamp).unwrap_or(0);
            self.output.emit(EncodedChunk {
                sample: EncodedSample::new(data, timestamp, duration, packet.is_key()),
                description: self.description.take(),
            });
        }
    }
}

/// `level_idc` from an `avc1.PPCCLL` codec string.
fn avc_level(codec: &str) -> Option<u8> {
    let fields = codec.split('.').nth(1).filter(|f| f.len() == 6)?;
    u8::from_str_radix(&fields[4..], 16).ok()
}

/// Extract the avcC record from encoder extradata, which is either Annex B
/// parameter sets or already a configuration record.
fn avc_description(extradata: &[u8]) -> Option<Bytes> {
    if extradata.first() == Some(&1) {
        return AvcConfig::from_record(extradata).map(|c| c.to_record());
    }
    AvcConfig::from_annexb(extradata).map(|c| c.to_record())
}

/// Baseline H.264 encoder with zero-latency tuning and no B-frames, so
/// chunks come out in submission order.
#[derive(Default)]
pub struct FfmpegEncoder {
    state: Option<EncoderState>,
}

impl FfmpegEncoder {
    /// An unconfigured encoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn configure(&mut self, config: &VideoEncoderConfig, output: StageOutput<EncodedChunk>) -> Result<(), CodecError> {
        ffmpeg_next::init().map_err(|e| fault("cannot initialise FFmpeg", e))?;
        if codec_id(&config.codec) != Some(Id::H264) {
            return Err(CodecError::Fault(format!("cannot encode {}", config.codec)));
        }
        let codec = ffmpeg_next::encoder::find(Id::H264)
            .ok_or_else(|| CodecError::Fault("no FFmpeg H.264 encoder available".to_string()))?;
        let mut encoder = CodecContext::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| fault("cannot create encoder", e))?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(MICROS);
        let framerate = (config.framerate.round() as i32).max(1);
        encoder.set_frame_rate(Some(Rational::new(framerate, 1)));
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_max_b_frames(0);
        encoder.set_gop(framerate as u32 * 2);
        // SAFETY: flag update on an unopened context.
        unsafe {
            (*encoder.as_mut_ptr()).flags |= ffmpeg_sys_next::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
        }

        let mut options = Dictionary::new();
        options.set("profile", "baseline");
        options.set("tune", "zerolatency");
        options.set("preset", "veryfast");
        if let Some(level) = avc_level(&config.codec) {
            options.set("level", &format!("{}.{}", level / 10, level % 10));
        }
        let encoder = encoder
            .open_as_with(codec, options)
            .map_err(|e| fault("cannot open encoder", e))?;

        // SAFETY: the context is open, so extradata is either null or valid
        // for extradata_size bytes.
        let extradata = unsafe {
            let context = encoder.as_ptr();
            if (*context).extradata.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*context).extradata, (*context).extradata_size as usize).to_vec()
            }
        };
        let description = avc_description(&extradata);
        if description.is_none() {
            log::warn!("encoder did not publish SPS/PPS in its extradata");
        }

        let scaler = ScalingContext::get(
            Pixel::RGBA,
            config.width,
            config.height,
            Pixel::YUV420P,
            config.width,
            config.height,
            ScalingFlags::BILINEAR,
        )
        .map_err(|e| fault("cannot create scaler", e))?;

        self.state = Some(EncoderState {
            encoder,
            scaler,
            width: config.width,
            height: config.height,
            durations: HashMap::new(),
            description,
            flushed: false,
            output,
        });
        Ok(())
    }

    fn encode(&mut self, frame: &RenderedFrame, key_frame: bool) -> Result<(), CodecError> {
        let state = self
            .state
            .as_mut()
            .filter(|s| !s.flushed)
            .ok_or(CodecError::Closed)?;
        let (width, height) = frame.image().dimensions();
        if (width, height) != (state.width, state.height) {
            return Err(CodecError::Fault(format!(
                "frame is {width}x{height}, encoder expects {}x{}",
                state.width, state.height
            )));
        }
        let mut rgba = VideoFrame::new(Pixel::RGBA, width, height);
        packed_buffer_to_frame(frame.image().as_raw(), &mut rgba, width, height, 4);
        let mut yuv = VideoFrame::empty();
        state.scaler.run(&rgba, &mut yuv).map_err(|e| fault("scaling failed", e))?;
        yuv.set_pts(Some(frame.timestamp()));
        if key_frame {
            yuv.set_kind(ffmpeg_next::picture::Type::I);
        }
        state.durations.insert(frame.timestamp(), frame.duration());
        state.encoder.send_frame(&yuv).map_err(|e| fault("encode failed", e))?;
        state.drain();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        let state = self.state.as_mut().ok_or(CodecError::Closed)?;
        if !state.flushed {
            state.encoder.send_eof().map_err(|e| fault("flush failed", e))?;
            state.flushed = true;
        }
        state.drain();
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_strings_map_to_ffmpeg_ids() {
        assert_eq!(codec_id("avc1.42001f"), Some(Id::H264));
        assert_eq!(codec_id("hev1.1.6.L93.B0"), Some(Id::HEVC));
        assert_eq!(codec_id("vp09.00.10.08"), Some(Id::VP9));
        assert_eq!(codec_id("mp4v.20.9"), None);
        assert_eq!(avc_level("avc1.42001f"), Some(31));
        assert_eq!(avc_level("avc1.42003e"), Some(62));
        assert_eq!(avc_level("avc1"), None);
    }

    #[test]
    fn extradata_in_either_form_yields_a_record() {
        let annexb = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xce];
        let record = avc_description(&annexb).unwrap();
        assert_eq!(record[0], 1);
        assert_eq!(avc_description(&record), Some(record.clone()));
        assert!(avc_description(&[]).is_none());
    }
}
