//! Decoder initialization parameters derived from track metadata.
//!
//! Video tracks are configured from the first codec parameter box found in
//! the sample entry, in the priority order `avcC`, `hvcC`, `vpcC`, `av1C`.
//! The box payload (header stripped) becomes the decoder description, and
//! the codec string is derived from its leading fields the way browsers
//! expect it (`avc1.64001f`, `hvc1.1.6.L93.B0`, ...).

use std::ops::Range;

use bytes::Bytes;

use crate::boxes::{ByteReader, FourCc, fourcc_str};
use crate::error::{Result, UpscaleError};
use crate::metadata::{Track, TrackParams};

const DESCRIPTION_PRIORITY: [&FourCc; 4] = [b"avcC", b"hvcC", b"vpcC", b"av1C"];

/// Parameters needed to configure a video decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDecoderConfig {
    /// Codec string, e.g. `"avc1.64001f"`.
    pub codec: String,
    /// Coded width in pixels.
    pub coded_width: u32,
    /// Coded height in pixels.
    pub coded_height: u32,
    /// Decoder configuration record.
    pub description: Bytes,
}

/// Parameters needed to configure an audio decoder (or to copy the track).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDecoderConfig {
    /// Codec string, e.g. `"mp4a.40.2"`.
    pub codec: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub number_of_channels: u16,
    /// Codec-specific setup data, if the sample entry carries any.
    pub description: Option<Bytes>,
}

/// Decoder configuration for either track kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderConfig {
    /// Video configuration.
    Video(VideoDecoderConfig),
    /// Audio configuration.
    Audio(AudioDecoderConfig),
}

impl DecoderConfig {
    /// The video configuration, if this is one.
    pub fn as_video(&self) -> Option<&VideoDecoderConfig> {
        match self {
            DecoderConfig::Video(config) => Some(config),
            DecoderConfig::Audio(_) => None,
        }
    }

    /// The audio configuration, if this is one.
    pub fn as_audio(&self) -> Option<&AudioDecoderConfig> {
        match self {
            DecoderConfig::Audio(config) => Some(config),
            DecoderConfig::Video(_) => None,
        }
    }

    /// Codec string of either kind.
    pub fn codec(&self) -> &str {
        match self {
            DecoderConfig::Video(config) => &config.codec,
            DecoderConfig::Audio(config) => &config.codec,
        }
    }
}

/// Build the decoder configuration for a parsed track.
///
/// Fails with [`UpscaleError::MissingCodecConfig`] when a video track has no
/// codec parameter box.
pub fn decoder_config(track: &Track) -> Result<DecoderConfig> {
    match &track.params {
        TrackParams::Video {
            width,
            height,
            description,
        } => {
            let description = description.clone().ok_or_else(|| UpscaleError::MissingCodecConfig {
                codec: track.codec.clone(),
            })?;
            Ok(DecoderConfig::Video(VideoDecoderConfig {
                codec: track.codec.clone(),
                coded_width: *width,
                coded_height: *height,
                description,
            }))
        }
        TrackParams::Audio {
            sample_rate,
            channel_count,
            description,
        } => Ok(DecoderConfig::Audio(AudioDecoderConfig {
            codec: track.codec.clone(),
            sample_rate: *sample_rate,
            number_of_channels: *channel_count,
            description: description.clone(),
        })),
    }
}

/// A child box of a sample entry, payload only.
#[derive(Debug, Clone)]
pub(crate) struct ConfigBox {
    pub kind: FourCc,
    pub data: Bytes,
}

/// Pick the video description by priority.
pub(crate) fn select_video_description(boxes: &[ConfigBox]) -> Option<&ConfigBox> {
    DESCRIPTION_PRIORITY
        .iter()
        .find_map(|kind| boxes.iter().find(|b| &b.kind == *kind))
}

/// Codec string for a video sample entry.
pub(crate) fn video_codec_string(entry: &FourCc, config: Option<&ConfigBox>) -> String {
    let base = fourcc_str(entry);
    let Some(config) = config else {
        return base;
    };
    let d = &config.data;
    let detailed = match &config.kind {
        b"avcC" => avc_codec_string(&base, d),
        b"hvcC" => hevc_codec_string(&base, d),
        b"vpcC" => vp9_codec_string(d),
        b"av1C" => av1_codec_string(d),
        _ => None,
    };
    detailed.unwrap_or(base)
}

fn avc_codec_string(base: &str, d: &[u8]) -> Option<String> {
    let fields = d.get(1..4)?;
    Some(format!("{base}.{:02x}{:02x}{:02x}", fields[0], fields[1], fields[2]))
}

fn hevc_codec_string(base: &str, d: &[u8]) -> Option<String> {
    if d.len() < 13 {
        return None;
    }
    let profile_space = match d[1] >> 6 {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let tier = if d[1] & 0x20 == 0 { 'L' } else { 'H' };
    let profile_idc = d[1] & 0x1F;
    let compatibility = u32::from_be_bytes([d[2], d[3], d[4], d[5]]).reverse_bits();
    let level = d[12];

    let mut codec = format!("{base}.{profile_space}{profile_idc}.{compatibility:x}.{tier}{level}");
    let constraints = &d[6..12];
    if let Some(last) = constraints.iter().rposition(|&b| b != 0) {
        for byte in &constraints[..=last] {
            codec.push_str(&format!(".{byte:x}"));
        }
    }
    Some(codec)
}

fn vp9_codec_string(d: &[u8]) -> Option<String> {
    // Full box: version and flags precede the record.
    let profile = *d.get(4)?;
    let level = *d.get(5)?;
    let bit_depth = d.get(6)? >> 4;
    Some(format!("vp09.{profile:02}.{level:02}.{bit_depth:02}"))
}

fn av1_codec_string(d: &[u8]) -> Option<String> {
    let profile = d.get(1)? >> 5;
    let level = d[1] & 0x1F;
    let flags = *d.get(2)?;
    let tier = if flags & 0x80 == 0 { 'M' } else { 'H' };
    let high_bitdepth = flags & 0x40 != 0;
    let twelve_bit = flags & 0x20 != 0;
    let bit_depth = match (profile, high_bitdepth, twelve_bit) {
        (2, true, true) => 12,
        (_, true, _) => 10,
        _ => 8,
    };
    Some(format!("av01.{profile}.{level:02}{tier}.{bit_depth:02}"))
}

/// Fields of an `esds` box that matter for configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Esds {
    pub object_type: u8,
    /// Range of the DecoderSpecificInfo bytes within the esds payload.
    pub decoder_specific: Option<Range<usize>>,
}

const ES_DESCRIPTOR: u8 = 0x03;
const DECODER_CONFIG_DESCRIPTOR: u8 = 0x04;
const DECODER_SPECIFIC_INFO: u8 = 0x05;

fn descriptor_header(r: &mut ByteReader<'_>) -> Result<(u8, usize)> {
    let tag = r.u8()?;
    let mut size = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        size = (size << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, size))
}

/// Parse an `esds` payload (full box header included).
pub(crate) fn parse_esds(payload: &[u8]) -> Result<Esds> {
    let mut r = ByteReader::new(payload, *b"esds");
    r.full_header()?;
    let mut esds = Esds::default();

    let (tag, _) = descriptor_header(&mut r)?;
    if tag != ES_DESCRIPTOR {
        return Err(UpscaleError::Container(format!(
            "esds starts with descriptor tag {tag:#04x}"
        )));
    }
    r.skip(2)?; // ES_ID
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        r.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = r.u8()?;
        r.skip(usize::from(url_len))?;
    }
    if flags & 0x20 != 0 {
        r.skip(2)?;
    }

    while r.remaining() > 0 {
        let (tag, size) = descriptor_header(&mut r)?;
        if tag != DECODER_CONFIG_DESCRIPTOR {
            r.skip(size.min(r.remaining()))?;
            continue;
        }
        let end = r.position() + size;
        esds.object_type = r.u8()?;
        r.skip(12)?; // stream type, buffer size, max and average bitrate
        while r.position() < end && r.remaining() > 0 {
            let (tag, size) = descriptor_header(&mut r)?;
            if tag == DECODER_SPECIFIC_INFO {
                let start = r.position();
                r.skip(size)?;
                esds.decoder_specific = Some(start..start + size);
                break;
            }
            r.skip(size.min(r.remaining()))?;
        }
        break;
    }
    Ok(esds)
}

/// Codec string for an audio sample entry.
pub(crate) fn audio_codec_string(entry: &FourCc, esds: Option<(&Esds, &[u8])>) -> String {
    match entry {
        b"mp4a" => {
            let Some((esds, payload)) = esds else {
                return "mp4a".to_string();
            };
            let mut codec = format!("mp4a.{:x}", esds.object_type);
            let specific = esds
                .decoder_specific
                .as_ref()
                .filter(|_| esds.object_type == 0x40)
                .and_then(|range| payload.get(range.clone()));
            if let Some(aot) = specific.and_then(audio_object_type) {
                codec.push_str(&format!(".{aot}"));
            }
            codec
        }
        b"Opus" => "opus".to_string(),
        b"fLaC" => "flac".to_string(),
        other => fourcc_str(other),
    }
}

/// Audio object type from the head of an AudioSpecificConfig.
pub(crate) fn audio_object_type(asc: &[u8]) -> Option<u8> {
    let first = *asc.first()?;
    let aot = first >> 3;
    if aot != 31 {
        return Some(aot);
    }
    let second = *asc.get(1)?;
    Some(32 + (((first & 0x07) << 3) | (second >> 5)))
}
