//! MP4 container writer.
//!
//! [`Mp4Muxer`] collects one video track and an optional AAC audio track and
//! writes an ISO base media file. Every sample is its own chunk, so samples
//! of both tracks may arrive in any interleaving.
//!
//! Two targets are supported:
//!
//! - [`MuxTarget::Memory`] keeps everything in memory and writes a fast-start
//!   file (`ftyp`, `moov`, `mdat`) at finalize.
//! - [`MuxTarget::Stream`] writes `ftyp` and a 64-bit `mdat` header up front,
//!   appends sample bytes as they arrive, then patches the `mdat` size and
//!   appends `moov`.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::{Seek, SeekFrom, Write};

use bytes::{BufMut, Bytes};
use log::debug;

use crate::boxes::{FourCc, build_box, build_container, build_full_box};
use crate::codec::EncodedChunk;
use crate::error::{Result, UpscaleError};
use crate::metadata::EncodedSample;
use crate::pipeline::VideoChunkSink;
use crate::utilities::micros_to_ticks;

const MOVIE_TIMESCALE: u32 = 1000;
const VIDEO_TIMESCALE: u32 = 90_000;
const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
const LARGE_MDAT_HEADER: u64 = 16;

/// Largest width or height the 16.16 track header fields can hold.
pub const MAX_DIMENSION: u32 = u16::MAX as u32;
/// ISO 639-2 "und", packed.
const LANGUAGE_UNDETERMINED: u16 = 0x55C4;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// A seekable byte sink for streamed output.
pub trait WriteSeek: Write + Seek + Send {}

impl<T: Write + Seek + Send> WriteSeek for T {}

/// Where the finished file goes.
pub enum MuxTarget {
    /// Build the whole file in memory.
    Memory,
    /// Stream sample data to a seekable writer as it arrives.
    Stream(Box<dyn WriteSeek>),
}

impl Debug for MuxTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MuxTarget::Memory => write!(f, "Memory"),
            MuxTarget::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Output video track parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackOptions {
    /// Codec string. Must start with `avc1`, `avc3`, `hvc1` or `hev1`.
    pub codec: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Output audio track parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackOptions {
    /// Codec string. Must start with `mp4a`.
    pub codec: String,
    /// Sample rate in Hz, also used as the media timescale.
    pub sample_rate: u32,
    /// Number of channels.
    pub channel_count: u16,
    /// AudioSpecificConfig of the source. Synthesized as AAC-LC when absent.
    pub description: Option<Bytes>,
}

/// Track layout of the output file.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxerOptions {
    /// The video track.
    pub video: VideoTrackOptions,
    /// The audio track, if any.
    pub audio: Option<AudioTrackOptions>,
}

/// Result of [`Mp4Muxer::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxOutput {
    /// The complete file, for [`MuxTarget::Memory`].
    Buffer(Vec<u8>),
    /// Total bytes written, for [`MuxTarget::Stream`].
    Streamed {
        /// File size in bytes.
        bytes_written: u64,
    },
}

impl MuxOutput {
    /// The in-memory file, if there is one.
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        match self {
            MuxOutput::Buffer(buffer) => Some(buffer),
            MuxOutput::Streamed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SampleRecord {
    /// Offset within the mdat payload.
    offset: u64,
    size: u32,
    timestamp: i64,
    decode_timestamp: i64,
    duration: i64,
    sync: bool,
}

#[derive(Debug)]
struct TrackWriter {
    timescale: u32,
    samples: Vec<SampleRecord>,
}

impl TrackWriter {
    fn new(timescale: u32) -> Self {
        Self {
            timescale,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, kind: &str, sample: &EncodedSample, offset: u64) -> Result<()> {
        if let Some(last) = self.samples.last()
            && sample.decode_timestamp < last.decode_timestamp
        {
            return Err(UpscaleError::Mux(format!(
                "{kind} decode timestamp {} precedes previous {}",
                sample.decode_timestamp, last.decode_timestamp
            )));
        }
        let size = u32::try_from(sample.len())
            .map_err(|_| UpscaleError::Mux(format!("{kind} sample of {} bytes", sample.len())))?;
        self.samples.push(SampleRecord {
            offset,
            size,
            timestamp: sample.timestamp,
            decode_timestamp: sample.decode_timestamp,
            duration: sample.duration,
            sync: sample.key_frame,
        });
        Ok(())
    }

    fn origin(&self) -> i64 {
        self.samples.first().map_or(0, |s| s.decode_timestamp)
    }

    /// Decode times in track ticks, relative to the first sample.
    fn decode_times(&self) -> Vec<i64> {
        let origin = self.origin();
        self.samples
            .iter()
            .map(|s| micros_to_ticks(s.decode_timestamp - origin, self.timescale))
            .collect()
    }

    /// Presentation minus decode time per sample, in track ticks.
    fn composition_offsets(&self) -> Vec<i64> {
        let origin = self.origin();
        self.samples
            .iter()
            .zip(self.decode_times())
            .map(|(s, dts)| micros_to_ticks(s.timestamp - origin, self.timescale) - dts)
            .collect()
    }

    fn durations(&self) -> Vec<u32> {
        let times = self.decode_times();
        let mut out: Vec<u32> = times
            .windows(2)
            .map(|w| clamp_u32(w[1] - w[0]))
            .collect();
        if let Some(last) = self.samples.last() {
            out.push(clamp_u32(micros_to_ticks(last.duration, self.timescale)));
        }
        out
    }

    fn media_duration(&self) -> u64 {
        self.durations().iter().map(|&d| u64::from(d)).sum()
    }

    fn movie_duration(&self) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        self.media_duration() * u64::from(MOVIE_TIMESCALE) / u64::from(self.timescale)
    }
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

enum Sink {
    Memory(Vec<u8>),
    Stream {
        writer: Box<dyn WriteSeek>,
        mdat_start: u64,
        written: u64,
    },
}

/// MP4 writer for one video and an optional audio track.
///
/// # Example
///
/// ```no_run
/// use upscaler::{EncodedChunk, MuxTarget, Mp4Muxer, MuxerOptions, VideoTrackOptions};
///
/// # fn chunks() -> Vec<EncodedChunk> { Vec::new() }
/// let options = MuxerOptions {
///     video: VideoTrackOptions { codec: "avc1.42001f".into(), width: 1280, height: 720 },
///     audio: None,
/// };
/// let mut muxer = Mp4Muxer::new(MuxTarget::Memory, options).unwrap();
/// for chunk in chunks() {
///     muxer.add_video_chunk(&chunk).unwrap();
/// }
/// let file = muxer.finalize().unwrap().into_buffer().unwrap();
/// std::fs::write("output.mp4", file).unwrap();
/// ```
pub struct Mp4Muxer {
    options: MuxerOptions,
    sink: Sink,
    video: TrackWriter,
    audio: TrackWriter,
    video_description: Option<Bytes>,
}

impl Debug for Mp4Muxer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Mp4Muxer")
            .field("options", &self.options)
            .field("video_samples", &self.video.samples.len())
            .field("audio_samples", &self.audio.samples.len())
            .finish_non_exhaustive()
    }
}

impl Mp4Muxer {
    /// Create a muxer. For [`MuxTarget::Stream`] the file header is written
    /// immediately.
    pub fn new(target: MuxTarget, options: MuxerOptions) -> Result<Self> {
        video_entry_kind(&options.video.codec)?;
        let (width, height) = (options.video.width, options.video.height);
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(UpscaleError::InvalidConfig(format!(
                "{width}x{height} video exceeds {MAX_DIMENSION} pixels per side"
            )));
        }
        if let Some(audio) = &options.audio {
            if !audio.codec.starts_with("mp4a") {
                return Err(UpscaleError::UnsupportedCodec(format!(
                    "{} (the writer only carries AAC audio)",
                    audio.codec
                )));
            }
            if audio.sample_rate == 0 {
                return Err(UpscaleError::InvalidConfig("audio sample rate is zero".to_string()));
            }
        }

        let sink = match target {
            MuxTarget::Memory => Sink::Memory(Vec::new()),
            MuxTarget::Stream(mut writer) => {
                let ftyp = build_ftyp();
                writer.write_all(&ftyp)?;
                let mut header = Vec::with_capacity(16);
                header.put_u32(1);
                header.put_slice(b"mdat");
                header.put_u64(LARGE_MDAT_HEADER);
                writer.write_all(&header)?;
                Sink::Stream {
                    writer,
                    mdat_start: ftyp.len() as u64,
                    written: 0,
                }
            }
        };

        let audio_timescale = options.audio.as_ref().map_or(0, |a| a.sample_rate);
        Ok(Self {
            options,
            sink,
            video: TrackWriter::new(VIDEO_TIMESCALE),
            audio: TrackWriter::new(audio_timescale),
            video_description: None,
        })
    }

    /// Number of video samples written so far.
    pub fn video_sample_count(&self) -> usize {
        self.video.samples.len()
    }

    /// Number of audio samples written so far.
    pub fn audio_sample_count(&self) -> usize {
        self.audio.samples.len()
    }

    /// Append an encoded video chunk. The first chunk carrying a description
    /// supplies the decoder configuration.
    pub fn add_video_chunk(&mut self, chunk: &EncodedChunk) -> Result<()> {
        if self.video_description.is_none()
            && let Some(description) = &chunk.description
        {
            self.video_description = Some(description.clone());
        }
        let offset = self.payload_len();
        self.video.push("video", &chunk.sample, offset)?;
        self.write_payload(&chunk.sample.data)
    }

    /// Append an audio sample, copied verbatim.
    pub fn add_audio_chunk(&mut self, sample: &EncodedSample) -> Result<()> {
        if self.options.audio.is_none() {
            return Err(UpscaleError::Mux("no audio track was configured".to_string()));
        }
        let offset = self.payload_len();
        self.audio.push("audio", sample, offset)?;
        self.write_payload(&sample.data)
    }

    fn payload_len(&self) -> u64 {
        match &self.sink {
            Sink::Memory(data) => data.len() as u64,
            Sink::Stream { written, .. } => *written,
        }
    }

    fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::Memory(buffer) => buffer.extend_from_slice(data),
            Sink::Stream { writer, written, .. } => {
                writer.write_all(data)?;
                *written += data.len() as u64;
            }
        }
        Ok(())
    }

    /// Write the index and finish the file.
    pub fn finalize(mut self) -> Result<MuxOutput> {
        if self.video.samples.is_empty() {
            return Err(UpscaleError::Mux("no video chunks were written".to_string()));
        }
        let Some(description) = self.video_description.clone() else {
            return Err(UpscaleError::Mux(
                "encoder never published a decoder configuration".to_string(),
            ));
        };

        let (mdat_start, written) = match &self.sink {
            Sink::Memory(payload) => return Ok(MuxOutput::Buffer(self.fast_start_file(payload, &description))),
            Sink::Stream { mdat_start, written, .. } => (*mdat_start, *written),
        };
        let moov = self.build_moov(&description, mdat_start + LARGE_MDAT_HEADER);
        if let Sink::Stream { writer, .. } = &mut self.sink {
            writer.seek(SeekFrom::Start(mdat_start + 8))?;
            writer.write_all(&(LARGE_MDAT_HEADER + written).to_be_bytes())?;
            writer.seek(SeekFrom::End(0))?;
            writer.write_all(&moov)?;
            writer.flush()?;
        }
        let bytes_written = mdat_start + LARGE_MDAT_HEADER + written + moov.len() as u64;
        debug!("Streamed {bytes_written} bytes");
        Ok(MuxOutput::Streamed { bytes_written })
    }

    fn fast_start_file(&self, payload: &[u8], description: &Bytes) -> Vec<u8> {
        let ftyp = build_ftyp();
        let mdat = build_box(b"mdat", payload);
        let mdat_header = (mdat.len() - payload.len()) as u64;
        // The moov size depends on whether co64 is needed, which depends on
        // where mdat lands.
        let mut moov = Vec::new();
        for _ in 0..3 {
            let base = ftyp.len() as u64 + moov.len() as u64 + mdat_header;
            let next = self.build_moov(description, base);
            let stable = next.len() == moov.len();
            moov = next;
            if stable {
                break;
            }
        }
        debug!(
            "Muxed {} video and {} audio samples into {} bytes",
            self.video.samples.len(),
            self.audio.samples.len(),
            ftyp.len() + moov.len() + mdat.len()
        );
        [ftyp, moov, mdat].concat()
    }

    fn build_moov(&self, description: &Bytes, base: u64) -> Vec<u8> {
        let audio = self.options.audio.as_ref().filter(|_| !self.audio.samples.is_empty());
        let duration = self
            .video
            .movie_duration()
            .max(audio.map_or(0, |_| self.audio.movie_duration()));
        let next_track_id = if audio.is_some() { AUDIO_TRACK_ID + 1 } else { VIDEO_TRACK_ID + 1 };

        let mut children = vec![build_mvhd(duration, next_track_id)];
        let video = &self.options.video;
        let entry = build_visual_entry(video, description);
        children.push(build_trak(
            TrackHeader {
                id: VIDEO_TRACK_ID,
                movie_duration: self.video.movie_duration(),
                volume: 0,
                width: video.width,
                height: video.height,
            },
            &self.video,
            b"vide",
            "VideoHandler",
            entry,
            base,
        ));
        if let Some(options) = audio {
            children.push(build_trak(
                TrackHeader {
                    id: AUDIO_TRACK_ID,
                    movie_duration: self.audio.movie_duration(),
                    volume: 0x0100,
                    width: 0,
                    height: 0,
                },
                &self.audio,
                b"soun",
                "SoundHandler",
                build_mp4a(options),
                base,
            ));
        }
        build_container(b"moov", &children)
    }
}

impl VideoChunkSink for Mp4Muxer {
    fn push_video_chunk(&mut self, chunk: EncodedChunk) -> Result<()> {
        self.add_video_chunk(&chunk)
    }
}

fn video_entry_kind(codec: &str) -> Result<(FourCc, FourCc)> {
    match codec.get(..4) {
        Some("avc1") | Some("avc3") => Ok((*b"avc1", *b"avcC")),
        Some("hvc1") | Some("hev1") => Ok((*b"hvc1", *b"hvcC")),
        _ => Err(UpscaleError::UnsupportedCodec(format!(
            "{codec} (the writer only carries H.264 and HEVC video)"
        ))),
    }
}

fn build_ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    payload.put_slice(b"isom");
    payload.put_u32(0x200);
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        payload.put_slice(brand);
    }
    build_box(b"ftyp", &payload)
}

fn put_matrix(out: &mut Vec<u8>) {
    for value in UNITY_MATRIX {
        out.put_u32(value);
    }
}

fn build_mvhd(duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut p = Vec::with_capacity(96);
    p.put_u32(0); // creation_time
    p.put_u32(0); // modification_time
    p.put_u32(MOVIE_TIMESCALE);
    p.put_u32(clamp_u32(duration as i64));
    p.put_u32(0x0001_0000); // rate 1.0
    p.put_u16(0x0100); // volume 1.0
    p.put_slice(&[0; 10]);
    put_matrix(&mut p);
    p.put_slice(&[0; 24]);
    p.put_u32(next_track_id);
    build_full_box(b"mvhd", 0, 0, &p)
}

struct TrackHeader {
    id: u32,
    movie_duration: u64,
    volume: u16,
    width: u32,
    height: u32,
}

fn build_tkhd(header: &TrackHeader) -> Vec<u8> {
    let mut p = Vec::with_capacity(80);
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(header.id);
    p.put_u32(0);
    p.put_u32(clamp_u32(header.movie_duration as i64));
    p.put_slice(&[0; 8]);
    p.put_u16(0); // layer
    p.put_u16(0); // alternate group
    p.put_u16(header.volume);
    p.put_u16(0);
    put_matrix(&mut p);
    p.put_u32(header.width << 16);
    p.put_u32(header.height << 16);
    // enabled | in movie
    build_full_box(b"tkhd", 0, 0x3, &p)
}

fn build_trak(
    header: TrackHeader,
    track: &TrackWriter,
    handler: &FourCc,
    handler_name: &str,
    sample_entry: Vec<u8>,
    base: u64,
) -> Vec<u8> {
    let media_header = if handler == b"vide" { build_vmhd() } else { build_smhd() };
    let minf = build_container(
        b"minf",
        &[media_header, build_dinf(), build_stbl(track, sample_entry, base)],
    );
    let mdia = build_container(
        b"mdia",
        &[build_mdhd(track.timescale, track.media_duration()), build_hdlr(handler, handler_name), minf],
    );
    build_container(b"trak", &[build_tkhd(&header), mdia])
}

fn build_mdhd(timescale: u32, duration: u64) -> Vec<u8> {
    let mut p = Vec::with_capacity(20);
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(timescale);
    p.put_u32(clamp_u32(duration as i64));
    p.put_u16(LANGUAGE_UNDETERMINED);
    p.put_u16(0);
    build_full_box(b"mdhd", 0, 0, &p)
}

fn build_hdlr(handler: &FourCc, name: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(21 + name.len());
    p.put_u32(0); // pre_defined
    p.put_slice(handler);
    p.put_slice(&[0; 12]);
    p.put_slice(name.as_bytes());
    p.put_u8(0);
    build_full_box(b"hdlr", 0, 0, &p)
}

fn build_vmhd() -> Vec<u8> {
    build_full_box(b"vmhd", 0, 1, &[0; 8])
}

fn build_smhd() -> Vec<u8> {
    build_full_box(b"smhd", 0, 0, &[0; 4])
}

fn build_dinf() -> Vec<u8> {
    let url = build_full_box(b"url ", 0, 1, &[]);
    let mut p = Vec::with_capacity(4 + url.len());
    p.put_u32(1);
    p.put_slice(&url);
    build_container(b"dinf", &[build_full_box(b"dref", 0, 0, &p)])
}

fn build_visual_entry(video: &VideoTrackOptions, description: &Bytes) -> Vec<u8> {
    // Codec already validated in `Mp4Muxer::new`.
    let (entry, config) = video_entry_kind(&video.codec).unwrap_or((*b"avc1", *b"avcC"));
    let mut p = Vec::with_capacity(86 + description.len());
    p.put_slice(&[0; 6]);
    p.put_u16(1); // data_reference_index
    p.put_slice(&[0; 16]);
    p.put_u16(video.width as u16);
    p.put_u16(video.height as u16);
    p.put_u32(0x0048_0000); // 72 dpi
    p.put_u32(0x0048_0000);
    p.put_u32(0);
    p.put_u16(1); // frame_count
    p.put_slice(&[0; 32]); // compressorname
    p.put_u16(0x0018);
    p.put_i16(-1);
    p.put_slice(&build_box(&config, description));
    build_box(&entry, &p)
}

fn build_mp4a(audio: &AudioTrackOptions) -> Vec<u8> {
    let mut p = Vec::with_capacity(64);
    p.put_slice(&[0; 6]);
    p.put_u16(1);
    p.put_slice(&[0; 8]);
    p.put_u16(audio.channel_count);
    p.put_u16(16); // sample size
    p.put_u32(0);
    p.put_u32(audio.sample_rate.min(u32::from(u16::MAX)) << 16);
    p.put_slice(&build_esds(audio));
    build_box(b"mp4a", &p)
}

fn put_descriptor(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.put_u8(tag);
    let len = payload.len();
    let mut groups = Vec::with_capacity(4);
    let mut rest = len;
    loop {
        groups.push((rest & 0x7F) as u8);
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for (i, group) in groups.iter().enumerate().rev() {
        out.put_u8(if i > 0 { group | 0x80 } else { *group });
    }
    out.put_slice(payload);
}

fn build_esds(audio: &AudioTrackOptions) -> Vec<u8> {
    let asc = audio
        .description
        .as_ref()
        .map_or_else(|| audio_specific_config(audio.sample_rate, audio.channel_count).to_vec(), |d| d.to_vec());

    let mut decoder_config = Vec::with_capacity(16 + asc.len());
    decoder_config.put_u8(0x40); // MPEG-4 audio
    decoder_config.put_u8(0x15); // audio stream
    decoder_config.put_uint(0, 3); // buffer size
    decoder_config.put_u32(0); // max bitrate
    decoder_config.put_u32(0); // average bitrate
    put_descriptor(&mut decoder_config, 0x05, &asc);

    let mut es = Vec::with_capacity(32 + asc.len());
    es.put_u16(AUDIO_TRACK_ID as u16);
    es.put_u8(0);
    put_descriptor(&mut es, 0x04, &decoder_config);
    put_descriptor(&mut es, 0x06, &[0x02]);

    let mut p = Vec::with_capacity(es.len() + 8);
    put_descriptor(&mut p, 0x03, &es);
    build_full_box(b"esds", 0, 0, &p)
}

/// Two-byte AAC-LC AudioSpecificConfig.
pub(crate) fn audio_specific_config(sample_rate: u32, channels: u16) -> [u8; 2] {
    let index: u8 = match sample_rate {
        96000 => 0,
        88200 => 1,
        64000 => 2,
        48000 => 3,
        44100 => 4,
        32000 => 5,
        24000 => 6,
        22050 => 7,
        16000 => 8,
        12000 => 9,
        11025 => 10,
        8000 => 11,
        7350 => 12,
        _ => 4,
    };
    let object_type = 2u8;
    let channels = (channels.min(15) as u8) & 0x0F;
    [(object_type << 3) | (index >> 1), ((index & 1) << 7) | (channels << 3)]
}

fn build_stbl(track: &TrackWriter, sample_entry: Vec<u8>, base: u64) -> Vec<u8> {
    let mut stsd = Vec::with_capacity(4 + sample_entry.len());
    stsd.put_u32(1);
    stsd.put_slice(&sample_entry);

    let mut children = vec![
        build_full_box(b"stsd", 0, 0, &stsd),
        build_stts(&track.durations()),
        build_stsc(),
        build_stsz(&track.samples),
        build_chunk_offsets(&track.samples, base),
    ];
    let offsets = track.composition_offsets();
    if offsets.iter().any(|&o| o != 0) {
        children.push(build_ctts(&offsets));
    }
    if track.samples.iter().any(|s| !s.sync) {
        children.push(build_stss(&track.samples));
    }
    build_container(b"stbl", &children)
}

fn build_stts(durations: &[u32]) -> Vec<u8> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &delta in durations {
        match runs.last_mut() {
            Some((count, last)) if *last == delta => *count += 1,
            _ => runs.push((1, delta)),
        }
    }
    let mut p = Vec::with_capacity(4 + runs.len() * 8);
    p.put_u32(runs.len() as u32);
    for (count, delta) in runs {
        p.put_u32(count);
        p.put_u32(delta);
    }
    build_full_box(b"stts", 0, 0, &p)
}

/// Version 1, so offsets may be negative.
fn build_ctts(offsets: &[i64]) -> Vec<u8> {
    let mut runs: Vec<(u32, i32)> = Vec::new();
    for &offset in offsets {
        let offset = offset.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        match runs.last_mut() {
            Some((count, last)) if *last == offset => *count += 1,
            _ => runs.push((1, offset)),
        }
    }
    let mut p = Vec::with_capacity(4 + runs.len() * 8);
    p.put_u32(runs.len() as u32);
    for (count, offset) in runs {
        p.put_u32(count);
        p.put_i32(offset);
    }
    build_full_box(b"ctts", 1, 0, &p)
}

fn build_stsc() -> Vec<u8> {
    let mut p = Vec::with_capacity(16);
    p.put_u32(1);
    p.put_u32(1); // first chunk
    p.put_u32(1); // samples per chunk
    p.put_u32(1); // sample description index
    build_full_box(b"stsc", 0, 0, &p)
}

fn build_stsz(samples: &[SampleRecord]) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + samples.len() * 4);
    p.put_u32(0);
    p.put_u32(samples.len() as u32);
    for sample in samples {
        p.put_u32(sample.size);
    }
    build_full_box(b"stsz", 0, 0, &p)
}

fn build_chunk_offsets(samples: &[SampleRecord], base: u64) -> Vec<u8> {
    let large = samples.iter().any(|s| base + s.offset > u64::from(u32::MAX));
    let mut p = Vec::with_capacity(4 + samples.len() * if large { 8 } else { 4 });
    p.put_u32(samples.len() as u32);
    for sample in samples {
        let offset = base + sample.offset;
        if large {
            p.put_u64(offset);
        } else {
            p.put_u32(offset as u32);
        }
    }
    build_full_box(if large { b"co64" } else { b"stco" }, 0, 0, &p)
}

fn build_stss(samples: &[SampleRecord]) -> Vec<u8> {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut p = Vec::with_capacity(4 + sync.len() * 4);
    p.put_u32(sync.len() as u32);
    for index in sync {
        p.put_u32(index);
    }
    build_full_box(b"stss", 0, 0, &p)
}
