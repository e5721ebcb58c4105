//! Coordinator integration tests against mock codecs.
//!
//! Every test runs on paused time, so stall timeouts and the per-frame
//! throttle elapse instantly and deterministically.

mod common;

use std::time::Duration;

use common::{Fixture, MockDecoder, MockEncoder, event_log, renderer, shared_stats, test_config};
use image::RgbaImage;
use upscaler::{
    Coordinator, DecodedFrame, EncodedChunk, Eta, FrameRenderer, JobEvent, PipelineConfig,
    ResampleRenderer, Stage, UpscaleError,
};

async fn run_pipeline(
    fixture: &Fixture,
    decoder: &mut MockDecoder,
    encoder: &mut MockEncoder,
    config: &PipelineConfig,
) -> (upscaler::Result<upscaler::PipelineStats>, Vec<EncodedChunk>) {
    let samples = fixture.video_samples();
    let mut renderer = renderer();
    let mut chunks = Vec::new();
    let result = Coordinator::new(decoder, encoder, &mut renderer, config)
        .run(
            &fixture.decoder_config(),
            &fixture.encoder_config(),
            &samples,
            fixture.duration(),
            &mut chunks,
        )
        .await;
    (result, chunks)
}

// ── ordering and bounds ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn every_frame_is_encoded_in_order() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    let summary = result.expect("pipeline should succeed");

    assert_eq!(summary.frames, fixture.frames);
    assert_eq!(summary.stall_recoveries, 0);
    assert_eq!(chunks.len(), fixture.frames);
    let expected: Vec<i64> = fixture.video_samples().iter().map(|s| s.timestamp).collect();
    let actual: Vec<i64> = chunks.iter().map(|c| c.sample.timestamp).collect();
    assert_eq!(actual, expected);
    assert!(chunks[0].description.is_some());
    assert!(chunks[1..].iter().all(|c| c.description.is_none()));

    let stats = stats.borrow();
    assert!(stats.decoder_closed && stats.encoder_closed);
    assert_eq!(stats.key_frames_requested, 3);
}

#[tokio::test(start_paused = true)]
async fn encoder_receives_double_size_frames() {
    let fixture = Fixture::default().with_frames(3);
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    result.expect("pipeline should succeed");
    // The mock encoder records the frame size in its payload.
    for chunk in &chunks {
        assert_eq!(&chunk.sample.data[6..8], &[32, 24]);
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_frames_never_exceed_window() {
    let fixture = Fixture::default().with_frames(40);
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener).with_window(4);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());
    encoder.hold_back = 2;

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    result.expect("pipeline should succeed");

    assert_eq!(chunks.len(), 40);
    let stats = stats.borrow();
    assert!(stats.max_in_flight <= 4, "in flight peaked at {}", stats.max_in_flight);
    assert_eq!(stats.decode_submitted, 40);
}

// ── stall recovery ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn decoder_stall_near_the_end_is_flushed() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    decoder.hold_back = 3;
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    let summary = result.expect("flush should recover the held frames");

    assert_eq!(chunks.len(), fixture.frames);
    assert!(summary.stall_recoveries >= 1);
    assert!(stats.borrow().decoder_flushes >= 1);
}

#[tokio::test(start_paused = true)]
async fn encoder_stall_is_flushed_after_last_frame() {
    let fixture = Fixture::default().with_frames(12);
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());
    encoder.hold_back = 5;

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    result.expect("encoder flush should release held chunks");

    assert_eq!(chunks.len(), 12);
    assert!(stats.borrow().encoder_flushes >= 1);
}

#[tokio::test(start_paused = true)]
async fn silent_decoder_exhausts_recoveries() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener).with_max_stall_recoveries(3);
    let mut decoder = MockDecoder::new(stats.clone());
    decoder.silent = true;
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    match result {
        Err(UpscaleError::Stalled { stage, attempts, .. }) => {
            assert_eq!(stage, Stage::Decoder);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a decoder stall, got {other:?}"),
    }
    assert!(chunks.is_empty());
    let stats = stats.borrow();
    assert!(stats.decoder_closed && stats.encoder_closed);
    // Far from the end of the stream, a stall is not flushed.
    assert_eq!(stats.decoder_flushes, 0);
}

#[tokio::test(start_paused = true)]
async fn stall_alarm_waits_for_the_timeout() {
    let fixture = Fixture::default().with_frames(2);
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener)
        .with_stall_timeout(Duration::from_secs(5))
        .with_max_stall_recoveries(1);
    let mut decoder = MockDecoder::new(stats.clone());
    decoder.silent = true;
    let mut encoder = MockEncoder::new(stats.clone());

    let started = tokio::time::Instant::now();
    let (result, _) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    assert!(matches!(result, Err(UpscaleError::Stalled { .. })));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

// ── failures ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn decoder_fault_aborts_and_closes_both_codecs() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener).with_window(8);
    let mut decoder = MockDecoder::new(stats.clone());
    decoder.fail_at = Some(12);
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, _) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    match result {
        Err(UpscaleError::CodecFault { stage, message }) => {
            assert_eq!(stage, Stage::Decoder);
            assert_eq!(message, "corrupt slice");
        }
        other => panic!("expected a decoder fault, got {other:?}"),
    }
    let stats = stats.borrow();
    assert!(stats.decoder_closed && stats.encoder_closed);
}

#[tokio::test(start_paused = true)]
async fn asynchronous_encoder_error_is_fatal() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());
    encoder.async_fail_at = Some(5);

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    assert!(matches!(
        result,
        Err(UpscaleError::CodecFault { stage: Stage::Encoder, .. })
    ));
    assert!(chunks.len() <= 5);
}

#[tokio::test(start_paused = true)]
async fn closed_decoder_is_reported_as_dropped_frames() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener).with_window(4);
    let mut decoder = MockDecoder::new(stats.clone());
    decoder.closed_at = Some(6);
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    match result {
        Err(UpscaleError::FramesDropped { stage, received, .. }) => {
            assert_eq!(stage, Stage::Decoder);
            assert_eq!(received, 6);
        }
        other => panic!("expected dropped frames, got {other:?}"),
    }
    assert_eq!(chunks.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn closed_encoder_is_skipped_and_reported_as_dropped_frames() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, mut log) = event_log();
    let config = test_config(listener).with_window(4);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());
    encoder.closed_at = Some(6);

    let (result, chunks) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    match result {
        Err(UpscaleError::FramesDropped { stage, received, .. }) => {
            assert_eq!(stage, Stage::Encoder);
            assert_eq!(received, 6);
        }
        other => panic!("expected dropped frames, got {other:?}"),
    }
    assert_eq!(chunks.len(), 6);
    let stats = stats.borrow();
    assert_eq!(stats.encode_submitted, 6);
    // Only the first rejected call reaches the encoder.
    assert_eq!(stats.encode_rejected, 1);
    assert!(stats.decoder_closed && stats.encoder_closed);
    assert!(common::errors(&log.drain()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_window_is_rejected_before_configuring() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener).with_window(0);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, _) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;

    assert!(matches!(result, Err(UpscaleError::InvalidConfig(_))));
    assert!(!stats.borrow().decoder_configured);
}

// ── progress ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn progress_is_monotonic_and_eta_starts_calculating() {
    let fixture = Fixture::default().with_frames(50);
    let stats = shared_stats();
    let (listener, mut log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, _) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    result.expect("pipeline should succeed");

    let events = log.drain();
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 50);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(*progress.last().unwrap() <= 100);
    assert!(matches!(events.first(), Some(JobEvent::Eta(Eta::Calculating))));
    // 30 ms per frame, so estimates appear once a second has passed.
    assert!(events.iter().any(|e| matches!(e, JobEvent::Eta(Eta::Remaining(_)))));
    assert!(common::errors(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn progress_follows_frame_timestamps() {
    // Ten one-second frames: the frame at 5 s of a 10 s input is at 50%.
    let fixture = Fixture {
        frames: 10,
        frame_micros: 1_000_000,
        ..Fixture::default()
    };
    let stats = shared_stats();
    let (listener, mut log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());

    let (result, _) = run_pipeline(&fixture, &mut decoder, &mut encoder, &config).await;
    result.expect("pipeline should succeed");

    let progress: Vec<u8> = log
        .drain()
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
    assert_eq!(progress[5], 50);
}

/// Renders at 2x but claims a different factor.
struct MislabeledRenderer(ResampleRenderer);

impl FrameRenderer for MislabeledRenderer {
    async fn render(&mut self, frame: &DecodedFrame) -> upscaler::Result<RgbaImage> {
        self.0.render(frame).await
    }

    async fn wait_for_idle(&mut self) -> upscaler::Result<()> {
        self.0.wait_for_idle().await
    }

    fn switch_network(&mut self, name: &str, weights: &[u8]) -> upscaler::Result<()> {
        self.0.switch_network(name, weights)
    }

    fn scale_factor(&self) -> u32 {
        3
    }
}

#[tokio::test(start_paused = true)]
async fn frames_are_checked_against_the_renderer_scale() {
    let fixture = Fixture::default();
    let stats = shared_stats();
    let (listener, _log) = event_log();
    let config = test_config(listener);
    let mut decoder = MockDecoder::new(stats.clone());
    let mut encoder = MockEncoder::new(stats.clone());
    let mut renderer = MislabeledRenderer(renderer());
    let mut chunks = Vec::new();

    let result = Coordinator::new(&mut decoder, &mut encoder, &mut renderer, &config)
        .run(
            &fixture.decoder_config(),
            &fixture.encoder_config(),
            &fixture.video_samples(),
            fixture.duration(),
            &mut chunks,
        )
        .await;

    match result {
        Err(UpscaleError::ScaleMismatch { expected, actual }) => {
            assert_eq!(expected, (48, 36));
            assert_eq!(actual, (32, 24));
        }
        other => panic!("expected a scale mismatch, got {other:?}"),
    }
    assert_eq!(stats.borrow().encode_submitted, 0);
    assert!(stats.borrow().encoder_closed);
}
