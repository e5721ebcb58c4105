//! MP4 container reader.
//!
//! [`Mp4Demuxer`] parses the box structure of a fully buffered MP4/MOV file,
//! selects the first track of the requested [`MediaKind`], and yields one
//! [`DemuxEvent::Config`] followed by batches of [`EncodedSample`]s in decode
//! order. [`extract_track`] drives a demuxer to completion the way the
//! conversion job needs it.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use upscaler::{MediaKind, demux::{DEFAULT_BATCH_SIZE, extract_track}};
//!
//! let data = std::fs::read("input.mp4").unwrap();
//! let video = extract_track(data, MediaKind::Video, Duration::from_secs(10), DEFAULT_BATCH_SIZE).unwrap();
//! println!("{} samples of {}", video.samples.len(), video.config.codec());
//! ```

use std::time::Duration;

use bytes::Bytes;

use crate::boxes::{BoxIter, FourCc, Mp4Box, fourcc_str};
use crate::codec_config::{
    ConfigBox, DecoderConfig, audio_codec_string, decoder_config, parse_esds,
    select_video_description, video_codec_string,
};
use crate::error::{Result, UpscaleError};
use crate::metadata::{EncodedSample, MediaKind, Track, TrackParams};
use crate::sample_table::{SampleLocation, SampleTable};
use crate::utilities::ticks_to_micros;

/// Number of samples delivered per [`DemuxEvent::Samples`] batch by default.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// How close the last observed sample must be to the declared duration for a
/// track extraction to count as complete.
pub const COMPLETION_TOLERANCE: Duration = Duration::from_secs(1);

/// Events produced while walking a track.
#[derive(Debug, Clone, PartialEq)]
pub enum DemuxEvent {
    /// Decoder configuration. Always the first event, emitted once.
    Config(DecoderConfig),
    /// The next batch of samples in decode order.
    Samples(Vec<EncodedSample>),
}

/// Container-level summary returned by [`probe`].
#[derive(Debug, Clone)]
#[must_use]
pub struct MovieInfo {
    /// Declared movie duration.
    pub duration: Duration,
    /// Every audio and video track, in container order.
    pub tracks: Vec<Track>,
}

impl MovieInfo {
    /// The first track of the given kind.
    pub fn first(&self, kind: MediaKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

struct ParsedTrack {
    track: Track,
    table: SampleTable,
}

struct Movie {
    timescale: u32,
    duration: u64,
    tracks: Vec<ParsedTrack>,
}

impl Movie {
    fn duration(&self) -> Duration {
        if self.timescale == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.duration as f64 / f64::from(self.timescale))
    }
}

/// List the tracks of a container without walking any samples.
pub fn probe(buffer: impl Into<Bytes>) -> Result<MovieInfo> {
    let buffer = buffer.into();
    let movie = parse_movie(&buffer)?;
    Ok(MovieInfo {
        duration: movie.duration(),
        tracks: movie.tracks.into_iter().map(|t| t.track).collect(),
    })
}

/// Sample reader for one track of a buffered MP4 file.
#[derive(Debug)]
pub struct Mp4Demuxer {
    buffer: Bytes,
    movie_duration: Duration,
    track: Track,
    config: DecoderConfig,
    samples: Vec<SampleLocation>,
    cursor: usize,
    config_sent: bool,
    batch_size: usize,
}

impl Mp4Demuxer {
    /// Parse `buffer` and select the first track of `kind`.
    ///
    /// # Errors
    ///
    /// - [`UpscaleError::NoTrack`] if no track of that kind exists.
    /// - [`UpscaleError::MissingCodecConfig`] if a video track has no codec
    ///   parameter box.
    /// - [`UpscaleError::Container`] if the file is malformed.
    pub fn new(buffer: impl Into<Bytes>, kind: MediaKind) -> Result<Self> {
        let buffer = buffer.into();
        let movie = parse_movie(&buffer)?;
        let movie_duration = movie.duration();
        let parsed = movie
            .tracks
            .into_iter()
            .find(|t| t.track.kind == kind)
            .ok_or(UpscaleError::NoTrack(kind))?;

        let config = decoder_config(&parsed.track)?;
        let samples = parsed.table.locate()?;
        log::debug!(
            "selected {kind} track {} ({}, {} samples)",
            parsed.track.id,
            parsed.track.codec,
            samples.len()
        );

        Ok(Self {
            buffer,
            movie_duration,
            track: parsed.track,
            config,
            samples,
            cursor: 0,
            config_sent: false,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Set how many samples each [`DemuxEvent::Samples`] batch holds.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The selected track.
    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Decoder configuration of the selected track.
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Declared duration of the whole movie.
    pub fn movie_duration(&self) -> Duration {
        self.movie_duration
    }

    /// Samples not yet delivered.
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.cursor
    }

    /// Deliver every sample that has not been delivered yet.
    pub fn flush(&mut self) -> Result<Vec<EncodedSample>> {
        self.config_sent = true;
        self.take(self.samples.len())
    }

    fn take(&mut self, end: usize) -> Result<Vec<EncodedSample>> {
        let end = end.min(self.samples.len());
        let batch = (self.cursor..end)
            .map(|i| self.sample_at(i))
            .collect::<Result<Vec<_>>>();
        // A bad sample ends the walk.
        self.cursor = if batch.is_ok() { end } else { self.samples.len() };
        batch
    }

    fn sample_at(&self, index: usize) -> Result<EncodedSample> {
        let location = &self.samples[index];
        let start = usize::try_from(location.offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(location.size as usize);
        if end > self.buffer.len() {
            return Err(UpscaleError::Container(format!(
                "sample {index} spans bytes {start}..{end} of a {}-byte file",
                self.buffer.len()
            )));
        }
        let timescale = self.track.timescale;
        Ok(EncodedSample {
            data: self.buffer.slice(start..end),
            timestamp: ticks_to_micros(location.cts, timescale),
            decode_timestamp: ticks_to_micros(location.dts as i64, timescale),
            duration: ticks_to_micros(i64::from(location.duration), timescale),
            key_frame: location.sync,
        })
    }
}

impl Iterator for Mp4Demuxer {
    type Item = Result<DemuxEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.config_sent {
            self.config_sent = true;
            return Some(Ok(DemuxEvent::Config(self.config.clone())));
        }
        if self.cursor >= self.samples.len() {
            return None;
        }
        let end = self.cursor + self.batch_size;
        Some(self.take(end).map(DemuxEvent::Samples))
    }
}

/// A fully extracted track.
#[derive(Debug, Clone)]
pub struct ExtractedTrack {
    /// Track metadata.
    pub track: Track,
    /// Decoder configuration.
    pub config: DecoderConfig,
    /// Every sample in decode order.
    pub samples: Vec<EncodedSample>,
}

/// Extract every sample of the first `kind` track.
///
/// Extraction is complete once the configuration has arrived and a sample
/// with a timestamp within [`COMPLETION_TOLERANCE`] of `duration` has been
/// seen. Samples past that point are collected with a final flush. If the
/// walk ends without meeting the rule, a warning is logged and everything
/// found is returned.
pub fn extract_track(
    buffer: impl Into<Bytes>,
    kind: MediaKind,
    duration: Duration,
    batch_size: usize,
) -> Result<ExtractedTrack> {
    let mut demuxer = Mp4Demuxer::new(buffer, kind)?.with_batch_size(batch_size);
    let mut config = None;
    let mut samples = Vec::with_capacity(demuxer.remaining());
    let mut complete = false;
    let target = duration.as_secs_f64();

    for event in demuxer.by_ref() {
        match event? {
            DemuxEvent::Config(c) => config = Some(c),
            DemuxEvent::Samples(batch) => {
                if let Some(last) = batch.last() {
                    let last_s = last.timestamp as f64 / 1e6;
                    if (target - last_s).abs() < COMPLETION_TOLERANCE.as_secs_f64() {
                        complete = true;
                    }
                }
                log::debug!("{kind}: received {} samples", batch.len());
                samples.extend(batch);
            }
        }
        if complete && config.is_some() {
            break;
        }
    }
    samples.extend(demuxer.flush()?);

    if !complete {
        log::warn!(
            "{kind} track ends at {:.3}s, declared duration is {target:.3}s",
            samples.last().map(|s| s.timestamp as f64 / 1e6).unwrap_or(0.0)
        );
    }

    Ok(ExtractedTrack {
        track: demuxer.track().clone(),
        config: config.unwrap_or_else(|| demuxer.config().clone()),
        samples,
    })
}

fn parse_movie(buffer: &Bytes) -> Result<Movie> {
    let mut moov = None;
    for top in BoxIter::new(buffer, 0) {
        let top = top?;
        if &top.kind == b"moov" {
            moov = Some(top);
            break;
        }
    }
    let moov = moov.ok_or_else(|| UpscaleError::Container("no 'moov' box found".to_string()))?;

    let mut r = moov.require(b"mvhd")?.reader();
    let (version, _) = r.full_header()?;
    let (timescale, duration) = if version == 1 {
        r.skip(16)?;
        (r.u32()?, r.u64()?)
    } else {
        r.skip(8)?;
        (r.u32()?, u64::from(r.u32()?))
    };

    let mut tracks = Vec::new();
    for child in moov.children() {
        let child = child?;
        if &child.kind != b"trak" {
            continue;
        }
        if let Some(track) = parse_trak(buffer, &child)? {
            tracks.push(track);
        }
    }

    Ok(Movie {
        timescale,
        duration,
        tracks,
    })
}

fn parse_trak(buffer: &Bytes, trak: &Mp4Box<'_>) -> Result<Option<ParsedTrack>> {
    let mut r = trak.require(b"tkhd")?.reader();
    let (version, _) = r.full_header()?;
    r.skip(if version == 1 { 16 } else { 8 })?;
    let id = r.u32()?;

    let mdia = trak.require(b"mdia")?;
    let mut r = mdia.require(b"hdlr")?.reader();
    r.full_header()?;
    r.skip(4)?;
    let handler: FourCc = r.bytes(4)?.try_into().unwrap_or(*b"    ");
    let kind = match &handler {
        b"vide" => MediaKind::Video,
        b"soun" => MediaKind::Audio,
        _ => return Ok(None),
    };

    let mut r = mdia.require(b"mdhd")?.reader();
    let (version, _) = r.full_header()?;
    let (timescale, duration) = if version == 1 {
        r.skip(16)?;
        (r.u32()?, r.u64()?)
    } else {
        r.skip(8)?;
        (r.u32()?, u64::from(r.u32()?))
    };

    let stbl = mdia.require(b"minf")?.require(b"stbl")?;
    let stsd = stbl.require(b"stsd")?;
    let mut r = stsd.reader();
    r.full_header()?;
    let entry_count = r.u32()?;
    let entry = BoxIter::new(&stsd.payload[8..], stsd.start + 8)
        .next()
        .transpose()?
        .filter(|_| entry_count > 0)
        .ok_or_else(|| UpscaleError::Container(format!("track {id} has no sample description")))?;

    let (codec, params) = match kind {
        MediaKind::Video => parse_visual_entry(buffer, &entry)?,
        MediaKind::Audio => parse_audio_entry(buffer, &entry)?,
    };
    let table = SampleTable::parse(&stbl, buffer.len() as u64)?;

    Ok(Some(ParsedTrack {
        track: Track {
            id,
            kind,
            codec,
            timescale,
            duration,
            sample_count: table.sample_count(),
            params,
        },
        table,
    }))
}

const VISUAL_ENTRY_LEN: usize = 78;

fn parse_visual_entry(buffer: &Bytes, entry: &Mp4Box<'_>) -> Result<(String, TrackParams)> {
    let mut r = entry.reader();
    r.skip(24)?;
    let width = u32::from(r.u16()?);
    let height = u32::from(r.u16()?);
    r.skip(VISUAL_ENTRY_LEN - 28)?;

    let boxes = config_boxes(buffer, entry, VISUAL_ENTRY_LEN)?;
    let selected = select_video_description(&boxes);
    let codec = video_codec_string(&entry.kind, selected);
    let description = selected.map(|b| b.data.clone());

    Ok((
        codec,
        TrackParams::Video {
            width,
            height,
            description,
        },
    ))
}

fn parse_audio_entry(buffer: &Bytes, entry: &Mp4Box<'_>) -> Result<(String, TrackParams)> {
    let mut r = entry.reader();
    r.skip(8)?;
    let sound_version = r.u16()?;
    r.skip(6)?;
    let mut channel_count = r.u16()?;
    r.skip(6)?;
    let mut sample_rate = r.u32()? >> 16;

    let children_at = match sound_version {
        1 => 44,
        2 => {
            r.skip(4)?;
            sample_rate = r.f64()?.round() as u32;
            channel_count = u16::try_from(r.u32()?).unwrap_or(u16::MAX);
            64
        }
        _ => 28,
    };

    let mut boxes = config_boxes(buffer, entry, children_at)?;
    // QuickTime wraps esds in a 'wave' box.
    if !boxes.iter().any(|b| &b.kind == b"esds") {
        let wave = boxes.iter().find(|b| &b.kind == b"wave").map(|b| b.data.clone());
        if let Some(wave) = wave {
            for child in BoxIter::new(&wave, 0) {
                let child = child?;
                boxes.push(ConfigBox {
                    kind: child.kind,
                    data: wave.slice(child.start..child.start + child.payload.len()),
                });
            }
        }
    }

    let (codec, description) = match boxes.iter().find(|b| &b.kind == b"esds") {
        Some(esds_box) => {
            let esds = parse_esds(&esds_box.data)?;
            let codec = audio_codec_string(&entry.kind, Some((&esds, &esds_box.data)));
            let description = esds.decoder_specific.map(|range| esds_box.data.slice(range));
            (codec, description)
        }
        None => {
            let setup = boxes
                .iter()
                .find(|b| matches!(&b.kind, b"dOps" | b"dfLa"))
                .map(|b| b.data.clone());
            (audio_codec_string(&entry.kind, None), setup)
        }
    };

    Ok((
        codec,
        TrackParams::Audio {
            sample_rate,
            channel_count,
            description,
        },
    ))
}

fn config_boxes(buffer: &Bytes, entry: &Mp4Box<'_>, skip: usize) -> Result<Vec<ConfigBox>> {
    if entry.payload.len() < skip {
        return Err(UpscaleError::Container(format!(
            "'{}' sample entry is {} bytes, expected at least {skip}",
            fourcc_str(&entry.kind),
            entry.payload.len()
        )));
    }
    let mut boxes = Vec::new();
    for child in BoxIter::new(&entry.payload[skip..], entry.start + skip) {
        let child = child?;
        boxes.push(ConfigBox {
            kind: child.kind,
            data: buffer.slice(child.start..child.start + child.payload.len()),
        });
    }
    Ok(boxes)
}
