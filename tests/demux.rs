//! Container reading tests against synthetic MP4 files.

mod common;

use std::time::Duration;

use common::{AUDIO_RATE, Fixture, patch_fourcc};
use upscaler::demux::{DEFAULT_BATCH_SIZE, DemuxEvent, extract_track};
use upscaler::{
    DecoderConfig, EncodedChunk, EncodedSample, MediaKind, Mp4Demuxer, Mp4Muxer, MuxTarget,
    MuxerOptions, TrackParams, UpscaleError, VideoTrackOptions, probe,
};

fn assert_close(actual: Duration, seconds: f64) {
    assert!(
        (actual.as_secs_f64() - seconds).abs() < 1e-6,
        "expected {seconds}s, got {actual:?}"
    );
}

// ── probing ────────────────────────────────────────────────────────

#[test]
fn probe_lists_video_and_audio_tracks() {
    let fixture = Fixture::default().with_audio(20);
    let info = probe(fixture.build()).expect("probe should succeed");

    assert_eq!(info.tracks.len(), 2);
    let video = info.first(MediaKind::Video).expect("video track");
    assert_eq!(video.codec, "avc1.42001e");
    assert_eq!(video.dimensions(), Some((16, 12)));
    assert_eq!(video.sample_count, 30);
    assert_close(video.duration(), 1.2);

    let audio = info.first(MediaKind::Audio).expect("audio track");
    assert_eq!(audio.codec, "mp4a.40.2");
    assert_eq!(audio.timescale, AUDIO_RATE);
    assert_eq!(audio.sample_count, 20);
    assert!(matches!(
        audio.params,
        TrackParams::Audio { sample_rate: AUDIO_RATE, channel_count: 2, .. }
    ));
    assert_close(info.duration, 1.2);
}

#[test]
fn probe_rejects_truncated_header() {
    let file = Fixture::default().build();
    let result = probe(file[..60].to_vec());
    assert!(matches!(result, Err(UpscaleError::Container(_))), "got {result:?}");
}

#[test]
fn probe_rejects_non_mp4_data() {
    let result = probe(vec![0u8; 64]);
    assert!(matches!(result, Err(UpscaleError::Container(_))));
}

// ── sample extraction ──────────────────────────────────────────────

#[test]
fn demuxer_emits_config_then_batches() {
    let fixture = Fixture::default();
    let demuxer = Mp4Demuxer::new(fixture.build(), MediaKind::Video)
        .expect("demuxer")
        .with_batch_size(8);

    let events: Vec<DemuxEvent> = demuxer.map(|e| e.expect("event")).collect();
    assert!(matches!(events[0], DemuxEvent::Config(DecoderConfig::Video(_))));
    let sizes: Vec<usize> = events[1..]
        .iter()
        .map(|e| match e {
            DemuxEvent::Samples(batch) => batch.len(),
            DemuxEvent::Config(_) => panic!("config delivered twice"),
        })
        .collect();
    assert_eq!(sizes, vec![8, 8, 8, 6]);
}

#[test]
fn extracted_samples_match_the_source() {
    let fixture = Fixture::default();
    let extracted = extract_track(fixture.build(), MediaKind::Video, fixture.duration(), DEFAULT_BATCH_SIZE)
        .expect("extraction should succeed");

    let expected = fixture.video_samples();
    assert_eq!(extracted.samples, expected);

    let config = extracted.config.as_video().expect("video config");
    assert_eq!(config.codec, "avc1.42001e");
    assert_eq!((config.coded_width, config.coded_height), (16, 12));
    assert_eq!(config.description, common::avc_record());
}

#[test]
fn audio_samples_are_copied_verbatim() {
    let fixture = Fixture::default().with_audio(40);
    let extracted = extract_track(fixture.build(), MediaKind::Audio, fixture.duration(), 16)
        .expect("extraction should succeed");

    let expected: Vec<_> = fixture.audio_samples().into_iter().map(|s| s.data).collect();
    let actual: Vec<_> = extracted.samples.into_iter().map(|s| s.data).collect();
    assert_eq!(actual, expected);
    let config = extracted.config.as_audio().expect("audio config");
    assert_eq!(config.sample_rate, AUDIO_RATE);
    assert_eq!(config.description.as_deref(), Some(&[0x11, 0x90][..]));
}

#[test]
fn short_declared_duration_still_returns_every_sample() {
    let fixture = Fixture::default();
    // Completion is reached early, the final flush picks up the rest.
    let extracted = extract_track(fixture.build(), MediaKind::Video, Duration::from_millis(200), 4)
        .expect("extraction should succeed");
    assert_eq!(extracted.samples.len(), fixture.frames);
}

#[test]
fn long_declared_duration_returns_what_exists() {
    let fixture = Fixture::default();
    let extracted = extract_track(fixture.build(), MediaKind::Video, Duration::from_secs(60), 4)
        .expect("extraction should succeed");
    assert_eq!(extracted.samples.len(), fixture.frames);
}

#[test]
fn reordered_frames_keep_decode_and_presentation_times() {
    // I P B B in decode order: presented at 0, 120, 40 and 80 ms.
    let presented = [0, 120_000, 40_000, 80_000];
    let samples: Vec<EncodedSample> = presented
        .iter()
        .enumerate()
        .map(|(i, &pts)| {
            EncodedSample::new(vec![0x41, i as u8], pts, 40_000, i == 0)
                .with_decode_timestamp(i as i64 * 40_000)
        })
        .collect();

    let options = MuxerOptions {
        video: VideoTrackOptions {
            codec: "avc1.42001e".to_string(),
            width: 16,
            height: 12,
        },
        audio: None,
    };
    let mut muxer = Mp4Muxer::new(MuxTarget::Memory, options).expect("muxer");
    for (i, sample) in samples.iter().enumerate() {
        let chunk = EncodedChunk {
            sample: sample.clone(),
            description: (i == 0).then(common::avc_record),
        };
        muxer.add_video_chunk(&chunk).expect("reordered chunk");
    }
    let file = muxer.finalize().expect("finalize").into_buffer().expect("in memory");

    let extracted = extract_track(file, MediaKind::Video, Duration::from_millis(160), DEFAULT_BATCH_SIZE)
        .expect("extraction should succeed");
    assert_eq!(extracted.samples, samples);
    let decode: Vec<i64> = extracted.samples.iter().map(|s| s.decode_timestamp).collect();
    assert_eq!(decode, vec![0, 40_000, 80_000, 120_000]);
}

// ── configuration errors ───────────────────────────────────────────

#[test]
fn missing_audio_track_is_reported() {
    let file = Fixture::default().build();
    let result = Mp4Demuxer::new(file, MediaKind::Audio);
    assert!(matches!(result, Err(UpscaleError::NoTrack(MediaKind::Audio))));
}

#[test]
fn missing_avcc_is_a_configuration_error() {
    let mut file = Fixture::default().build();
    patch_fourcc(&mut file, b"avcC", b"free");

    let result = Mp4Demuxer::new(file, MediaKind::Video);
    match result {
        Err(UpscaleError::MissingCodecConfig { codec }) => assert_eq!(codec, "avc1"),
        other => panic!("expected MissingCodecConfig, got {other:?}"),
    }
}

#[test]
fn impossible_sample_count_is_a_container_error() {
    let mut file = Fixture::default().build();
    let at = file
        .windows(4)
        .position(|w| w == b"stsz")
        .expect("fixture has a size table");
    // version/flags, then uniform size 1 and 2^32 - 1 samples.
    file[at + 8..at + 12].copy_from_slice(&1u32.to_be_bytes());
    file[at + 12..at + 16].copy_from_slice(&u32::MAX.to_be_bytes());

    let result = extract_track(file.clone(), MediaKind::Video, Duration::from_secs(1), DEFAULT_BATCH_SIZE);
    assert!(matches!(result, Err(UpscaleError::Container(_))), "got {result:?}");
    assert!(matches!(probe(file), Err(UpscaleError::Container(_))));
}
